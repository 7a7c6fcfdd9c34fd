use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

use crate::query::QuerySpec;

/// DNS load generator
#[derive(Parser, Debug)]
#[command(name = "dnsburst")]
#[command(about = "Send a sustained stream of DNS queries at a target over UDP or TCP", version)]
pub struct Cli {
	/// Target host or IP address to send queries to
	pub target: String,

	/// Generator-specific options as KEY=VAL pairs
	#[arg(value_name = "KEY=VAL")]
	pub gen_opts: Vec<String>,

	/// Concurrent traffic generators (default: 10 udp, 30 tcp)
	#[arg(short = 'c', value_name = "COUNT")]
	pub generators: Option<u32>,

	/// Queries to send per batch (default: 10 udp, 100 tcp)
	#[arg(short = 'q', value_name = "COUNT")]
	pub batch: Option<u32>,

	/// Milliseconds between batches (default: 1 udp, 1000 tcp)
	#[arg(short = 'd', value_name = "MS")]
	pub delay_ms: Option<u64>,

	/// Target port
	#[arg(short = 'p', default_value_t = 53, value_name = "PORT")]
	pub port: u16,

	/// Query timeout in seconds
	#[arg(short = 't', default_value_t = 3, value_name = "SECS")]
	pub timeout_secs: u64,

	/// Limit the run to N seconds, 0 is unlimited
	#[arg(short = 'l', default_value_t = 0, value_name = "SECS")]
	pub limit_secs: u64,

	/// Loops through the record list, 0 is unlimited
	#[arg(short = 'n', default_value_t = 0, value_name = "LOOPS")]
	pub loops: u64,

	/// Rate limit to a maximum of QPS, 0 is no limit
	#[arg(short = 'Q', default_value_t = 0, value_name = "QPS")]
	pub qps: u64,

	/// Change the rate limit over time, format QPS,MS;QPS,MS;...
	#[arg(long = "qps-flow", value_name = "SPEC")]
	pub qps_flow: Option<String>,

	/// Internet family, inet or inet6
	#[arg(short = 'F', default_value = "inet", value_name = "FAMILY")]
	pub family: String,

	/// Protocol to use, udp or tcp
	#[arg(short = 'P', default_value = "udp", value_name = "PROTOCOL")]
	pub protocol: String,

	/// Query generator
	#[arg(short = 'g', default_value = "static", value_name = "NAME")]
	pub generator: String,

	/// Base record / qname for generators
	#[arg(short = 'r', default_value = "test.com", value_name = "RECORD")]
	pub record: String,

	/// Query type for generators
	#[arg(short = 'T', default_value = "A", value_name = "QTYPE")]
	pub qtype: String,

	/// Query class, IN or CH
	#[arg(long = "class", default_value = "IN", value_name = "CLASS")]
	pub qclass: String,

	/// Set the DO bit in EDNS
	#[arg(long)]
	pub dnssec: bool,

	/// Randomize the record list before sending
	#[arg(short = 'R')]
	pub randomize: bool,

	/// Read records from FILE, one QNAME [QTYPE] per row
	#[arg(short = 'f', value_name = "FILE")]
	pub file: Option<PathBuf>,

	/// Metrics output file, JSON format
	#[arg(short = 'o', value_name = "FILE")]
	pub output: Option<PathBuf>,

	/// Output verbosity, 0 is silent
	#[arg(short = 'v', default_value_t = 1, value_name = "LEVEL")]
	pub verbosity: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
	Udp,
	Tcp,
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Protocol::Udp => write!(f, "udp"),
			Protocol::Tcp => write!(f, "tcp"),
		}
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Family {
	Inet,
	Inet6,
}

impl fmt::Display for Family {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Family::Inet => write!(f, "inet"),
			Family::Inet6 => write!(f, "inet6"),
		}
	}
}

/// Emission pacing with protocol-dependent defaults filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
	pub generators: usize,
	pub batch_count: usize,
	pub send_delay: Duration,
}

impl Cli {
	/// Validate `-P`. An unknown protocol is a startup error, reported on
	/// stderr with exit code 1 like every other bad flag value.
	pub fn protocol(&self) -> Result<Protocol> {
		match self.protocol.as_str() {
			"udp" => Ok(Protocol::Udp),
			"tcp" => Ok(Protocol::Tcp),
			other => bail!("protocol must be 'udp' or 'tcp', got '{}'", other),
		}
	}

	/// Validate `-F`.
	pub fn family(&self) -> Result<Family> {
		match self.family.as_str() {
			"inet" => Ok(Family::Inet),
			"inet6" => Ok(Family::Inet6),
			other => bail!("internet family must be 'inet' or 'inet6', got '{}'", other),
		}
	}

	/// Resolve `-c`/`-q`/`-d`, applying the TCP defaults when the user left
	/// them unset.
	pub fn pacing(&self) -> Result<Pacing> {
		let (gens, batch, delay_ms) = match self.protocol()? {
			Protocol::Udp => (10, 10, 1),
			Protocol::Tcp => (30, 100, 1000),
		};
		Ok(Pacing {
			generators: self.generators.map_or(gens, |v| v as usize),
			batch_count: self.batch.map_or(batch, |v| v as usize),
			send_delay: Duration::from_millis(self.delay_ms.unwrap_or(delay_ms)),
		})
	}

	pub fn query_spec(&self) -> QuerySpec {
		QuerySpec {
			qname: self.record.clone(),
			qtype: self.qtype.clone(),
			qclass: self.qclass.clone(),
			dnssec: self.dnssec,
			loops: self.loops,
			opts: self.gen_opts.clone(),
		}
	}
}
