use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::warn;

use crate::dns;

/// Query types drawn at random by the randomlabel generator.
const POPULAR_QTYPES: &[RecordType] = &[
	RecordType::A,
	RecordType::AAAA,
	RecordType::NS,
	RecordType::CNAME,
	RecordType::MX,
	RecordType::TXT,
	RecordType::SOA,
	RecordType::SRV,
	RecordType::PTR,
];

/// Source of wire-format DNS queries for the traffic engine.
///
/// `next_udp` yields one message with the given id stamped into the header;
/// `next_tcp` yields a whole batch, each message preceded by its 2-byte
/// big-endian length, ids assigned in order.
pub trait QueryGen {
	fn name(&self) -> &'static str;
	fn size(&self) -> usize;
	fn loops(&self) -> u64;
	fn finished(&self) -> bool;
	fn randomize(&mut self);
	fn next_udp(&mut self, id: u16) -> Vec<u8>;
	fn next_tcp(&mut self, ids: &[u16]) -> Vec<u8>;
}

/// Settings shared by every generator, parsed off the command line.
#[derive(Debug, Clone)]
pub struct QuerySpec {
	pub qname: String,
	pub qtype: String,
	pub qclass: String,
	pub dnssec: bool,
	pub loops: u64,
	/// Raw KEY=VAL generator options, keys case-insensitive.
	pub opts: Vec<String>,
}

/// Construct the generator selected by `-g` (or implied by `-f`).
pub fn build(kind: &str, file: Option<&Path>, spec: &QuerySpec) -> Result<Box<dyn QueryGen>> {
	if let Some(path) = file {
		return Ok(Box::new(file_gen(path, spec)?));
	}
	match kind {
		"static" => Ok(Box::new(static_gen(spec)?)),
		"file" => bail!("the file generator needs a record file, pass -f FILE"),
		"numberqname" => Ok(Box::new(NumberQNameGen::new(spec)?)),
		"randompkt" => Ok(Box::new(random_pkt_gen(spec)?)),
		"randomqname" => Ok(Box::new(random_qname_gen(spec)?)),
		"randomlabel" => Ok(Box::new(random_label_gen(spec)?)),
		other => bail!("unknown query generator '{}'", other),
	}
}

fn parse_opts(raw: &[String]) -> Result<HashMap<String, String>> {
	let mut map = HashMap::new();
	for item in raw {
		let (key, val) = item
			.split_once('=')
			.ok_or_else(|| anyhow!("generator option '{}' is not KEY=VAL", item))?;
		map.insert(key.to_lowercase(), val.to_string());
	}
	Ok(map)
}

fn take_u64(opts: &mut HashMap<String, String>, key: &str, default: u64) -> Result<u64> {
	match opts.remove(key) {
		Some(v) => v.parse::<u64>().map_err(|_| {
			anyhow!(
				"generator option {} must be an integer, got '{}'",
				key.to_uppercase(),
				v
			)
		}),
		None => Ok(default),
	}
}

fn warn_unused(opts: &HashMap<String, String>, gen: &str) {
	for key in opts.keys() {
		warn!("generator '{}' ignores option {}", gen, key.to_uppercase());
	}
}

/// Pre-rendered record list walked by the cursor-based generators.
///
/// Every record is a complete wire message with id 0; the id is patched in
/// per emission. A full pass over the list counts as one loop.
struct RecordList {
	records: Vec<Vec<u8>>,
	cursor: usize,
	loops_done: u64,
	loop_limit: u64,
}

impl RecordList {
	fn new(records: Vec<Vec<u8>>, loop_limit: u64) -> Self {
		RecordList {
			records,
			cursor: 0,
			loops_done: 0,
			loop_limit,
		}
	}

	fn finished(&self) -> bool {
		self.loop_limit != 0 && self.loops_done >= self.loop_limit
	}

	fn render(&mut self, id: u16) -> Vec<u8> {
		let mut pkt = self.records[self.cursor].clone();
		if pkt.len() >= 2 {
			pkt[..2].copy_from_slice(&id.to_be_bytes());
		}
		self.cursor += 1;
		if self.cursor == self.records.len() {
			self.cursor = 0;
			self.loops_done += 1;
		}
		pkt
	}
}

/// One generator over a pre-rendered record list.
pub struct ListGen {
	name: &'static str,
	list: RecordList,
}

impl QueryGen for ListGen {
	fn name(&self) -> &'static str {
		self.name
	}

	fn size(&self) -> usize {
		self.list.records.len()
	}

	fn loops(&self) -> u64 {
		self.list.loop_limit
	}

	fn finished(&self) -> bool {
		self.list.finished()
	}

	fn randomize(&mut self) {
		self.list.records.shuffle(&mut rand::thread_rng());
	}

	fn next_udp(&mut self, id: u16) -> Vec<u8> {
		self.list.render(id)
	}

	fn next_tcp(&mut self, ids: &[u16]) -> Vec<u8> {
		let mut out = Vec::new();
		for &id in ids {
			let msg = self.list.render(id);
			out.extend_from_slice(&(msg.len() as u16).to_be_bytes());
			out.extend_from_slice(&msg);
		}
		out
	}
}

/// Single qname/qtype from `-r`/`-T`.
pub fn static_gen(spec: &QuerySpec) -> Result<ListGen> {
	let opts = parse_opts(&spec.opts)?;
	warn_unused(&opts, "static");

	let qname = Name::from_ascii(&spec.qname)
		.map_err(|e| anyhow!("invalid qname '{}': {}", spec.qname, e))?;
	let record = dns::build_query(
		&qname,
		dns::parse_qtype(&spec.qtype)?,
		dns::parse_qclass(&spec.qclass)?,
		spec.dnssec,
		0,
	)?;
	Ok(ListGen {
		name: "static",
		list: RecordList::new(vec![record], spec.loops),
	})
}

/// One `QNAME [QTYPE]` per line; blank lines and `#` comments skipped.
pub fn file_gen(path: &Path, spec: &QuerySpec) -> Result<ListGen> {
	let opts = parse_opts(&spec.opts)?;
	warn_unused(&opts, "file");

	let qclass = dns::parse_qclass(&spec.qclass)?;
	let default_qtype = dns::parse_qtype(&spec.qtype)?;
	let content = std::fs::read_to_string(path)
		.with_context(|| format!("failed to read record file '{}'", path.display()))?;

	let mut records = Vec::new();
	for line in content.lines() {
		let trimmed = line.trim();
		if trimmed.is_empty() || trimmed.starts_with('#') {
			continue;
		}
		let mut fields = trimmed.split_whitespace();
		let qname_s = fields.next().unwrap();
		let qtype = match fields.next() {
			Some(t) => dns::parse_qtype(t)?,
			None => default_qtype,
		};
		let qname = Name::from_ascii(qname_s)
			.map_err(|e| anyhow!("invalid qname '{}': {}", qname_s, e))?;
		records.push(dns::build_query(&qname, qtype, qclass, spec.dnssec, 0)?);
	}
	if records.is_empty() {
		bail!("record file '{}' contains no records", path.display());
	}
	Ok(ListGen {
		name: "file",
		list: RecordList::new(records, spec.loops),
	})
}

/// COUNT random byte blobs of size [1, SIZE].
pub fn random_pkt_gen(spec: &QuerySpec) -> Result<ListGen> {
	let mut opts = parse_opts(&spec.opts)?;
	let count = take_u64(&mut opts, "count", 1000)?;
	let size = take_u64(&mut opts, "size", 600)?.max(1) as usize;
	warn_unused(&opts, "randompkt");

	let mut rng = rand::thread_rng();
	let records = (0..count)
		.map(|_| {
			let len = rng.gen_range(1..=size);
			(0..len).map(|_| rng.gen::<u8>()).collect()
		})
		.collect();
	Ok(ListGen {
		name: "randompkt",
		list: RecordList::new(records, spec.loops),
	})
}

/// COUNT queries whose qname prepends random binary labels to the zone.
pub fn random_qname_gen(spec: &QuerySpec) -> Result<ListGen> {
	let mut opts = parse_opts(&spec.opts)?;
	let count = take_u64(&mut opts, "count", 1000)?;
	let size = take_u64(&mut opts, "size", 255)? as usize;
	warn_unused(&opts, "randomqname");

	let zone = Name::from_ascii(&spec.qname)
		.map_err(|e| anyhow!("invalid qname '{}': {}", spec.qname, e))?;
	let qtype = dns::parse_qtype(&spec.qtype)?;
	let qclass = dns::parse_qclass(&spec.qclass)?;
	// keep the whole name under the 255-byte wire limit
	let budget = 250usize.saturating_sub(zone.len()).max(1);
	let max_random = size.clamp(1, budget);

	let mut rng = rand::thread_rng();
	let mut records = Vec::with_capacity(count as usize);
	for _ in 0..count {
		let total = rng.gen_range(1..=max_random);
		let mut labels: Vec<Vec<u8>> = Vec::new();
		let mut remaining = total;
		while remaining > 0 {
			let n = remaining.min(63);
			labels.push((0..n).map(|_| rng.gen::<u8>()).collect());
			remaining -= n;
		}
		labels.extend(zone.iter().map(|l| l.to_vec()));
		let qname = Name::from_labels(labels.iter().map(|l| l.as_slice()))
			.map_err(|e| anyhow!("failed to build random qname: {}", e))?;
		records.push(dns::build_query(&qname, qtype, qclass, spec.dnssec, 0)?);
	}
	Ok(ListGen {
		name: "randomqname",
		list: RecordList::new(records, spec.loops),
	})
}

/// COUNT queries with up to LBLCOUNT random labels of size [1, LBLSIZE]
/// under the zone, each with a qtype from the popular set.
pub fn random_label_gen(spec: &QuerySpec) -> Result<ListGen> {
	let mut opts = parse_opts(&spec.opts)?;
	let count = take_u64(&mut opts, "count", 1000)?;
	let lblsize = take_u64(&mut opts, "lblsize", 10)?.clamp(1, 63) as usize;
	let lblcount = take_u64(&mut opts, "lblcount", 5)?.max(1) as usize;
	warn_unused(&opts, "randomlabel");

	let zone = Name::from_ascii(&spec.qname)
		.map_err(|e| anyhow!("invalid qname '{}': {}", spec.qname, e))?;
	let qclass = dns::parse_qclass(&spec.qclass)?;
	let budget = 250usize.saturating_sub(zone.len());

	let mut rng = rand::thread_rng();
	let mut records = Vec::with_capacity(count as usize);
	for _ in 0..count {
		let mut labels: Vec<Vec<u8>> = Vec::new();
		let mut used = 0usize;
		for _ in 0..rng.gen_range(1..=lblcount) {
			let n = rng.gen_range(1..=lblsize);
			if used + n + 1 > budget {
				break;
			}
			used += n + 1;
			labels.push((0..n).map(|_| rng.gen::<u8>()).collect());
		}
		labels.extend(zone.iter().map(|l| l.to_vec()));
		let qname = Name::from_labels(labels.iter().map(|l| l.as_slice()))
			.map_err(|e| anyhow!("failed to build random labels: {}", e))?;
		let qtype = *POPULAR_QTYPES.choose(&mut rng).unwrap();
		records.push(dns::build_query(&qname, qtype, qclass, spec.dnssec, 0)?);
	}
	Ok(ListGen {
		name: "randomlabel",
		list: RecordList::new(records, spec.loops),
	})
}

/// Synthesizes qnames `N.zone` with N uniform in [low, high]. Never finishes.
pub struct NumberQNameGen {
	zone: String,
	qtype: RecordType,
	qclass: DNSClass,
	dnssec: bool,
	loop_limit: u64,
	low: u64,
	high: u64,
}

impl NumberQNameGen {
	pub fn new(spec: &QuerySpec) -> Result<Self> {
		let mut opts = parse_opts(&spec.opts)?;
		let low = take_u64(&mut opts, "low", 0)?;
		let high = take_u64(&mut opts, "high", 100_000)?;
		warn_unused(&opts, "numberqname");
		if low > high {
			bail!("numberqname LOW ({}) must not exceed HIGH ({})", low, high);
		}
		// validate the zone up front so a bad -r fails at startup
		let zone = Name::from_ascii(&spec.qname)
			.map_err(|e| anyhow!("invalid qname '{}': {}", spec.qname, e))?;
		if zone.len() + high.to_string().len() + 1 > 255 {
			bail!("qname '{}' leaves no room for a numeric label", spec.qname);
		}
		Ok(NumberQNameGen {
			zone: spec.qname.clone(),
			qtype: dns::parse_qtype(&spec.qtype)?,
			qclass: dns::parse_qclass(&spec.qclass)?,
			dnssec: spec.dnssec,
			loop_limit: spec.loops,
			low,
			high,
		})
	}

	fn render(&mut self, id: u16) -> Vec<u8> {
		let n = rand::thread_rng().gen_range(self.low..=self.high);
		// the zone was validated at construction, a numeric label cannot break it
		let qname = Name::from_ascii(format!("{}.{}", n, self.zone))
			.expect("validated zone with numeric label");
		dns::build_query(&qname, self.qtype, self.qclass, self.dnssec, id)
			.expect("validated query parameters")
	}
}

impl QueryGen for NumberQNameGen {
	fn name(&self) -> &'static str {
		"numberqname"
	}

	fn size(&self) -> usize {
		(self.high - self.low).saturating_add(1) as usize
	}

	fn loops(&self) -> u64 {
		self.loop_limit
	}

	fn finished(&self) -> bool {
		false
	}

	fn randomize(&mut self) {}

	fn next_udp(&mut self, id: u16) -> Vec<u8> {
		self.render(id)
	}

	fn next_tcp(&mut self, ids: &[u16]) -> Vec<u8> {
		let mut out = Vec::new();
		for &id in ids {
			let msg = self.render(id);
			out.extend_from_slice(&(msg.len() as u16).to_be_bytes());
			out.extend_from_slice(&msg);
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use hickory_proto::op::Message;

	fn spec() -> QuerySpec {
		QuerySpec {
			qname: "test.com".to_string(),
			qtype: "A".to_string(),
			qclass: "IN".to_string(),
			dnssec: false,
			loops: 0,
			opts: Vec::new(),
		}
	}

	#[test]
	fn test_static_patches_id() {
		let mut gen = static_gen(&spec()).unwrap();
		assert_eq!(gen.size(), 1);
		let a = gen.next_udp(0x1234);
		assert_eq!(&a[..2], &[0x12, 0x34]);
		let b = gen.next_udp(0xbeef);
		assert_eq!(&b[..2], &[0xbe, 0xef]);
		// same record underneath, only the id differs
		assert_eq!(&a[2..], &b[2..]);
	}

	#[test]
	fn test_static_never_finishes_without_loops() {
		let mut gen = static_gen(&spec()).unwrap();
		for i in 0..10 {
			gen.next_udp(i);
		}
		assert!(!gen.finished());
	}

	#[test]
	fn test_loop_accounting() {
		let mut s = spec();
		s.loops = 2;
		let mut gen = static_gen(&s).unwrap();
		gen.next_udp(1);
		assert!(!gen.finished());
		gen.next_udp(2);
		assert!(gen.finished());
	}

	#[test]
	fn test_tcp_batch_framing() {
		let mut gen = static_gen(&spec()).unwrap();
		let ids = [10u16, 20, 30];
		let batch = gen.next_tcp(&ids);

		let mut off = 0usize;
		for &id in &ids {
			let len = u16::from_be_bytes([batch[off], batch[off + 1]]) as usize;
			let msg = &batch[off + 2..off + 2 + len];
			assert_eq!(crate::dns::response_meta(msg).unwrap().0, id);
			off += 2 + len;
		}
		assert_eq!(off, batch.len());
	}

	#[test]
	fn test_file_gen() {
		let path = std::env::temp_dir().join("dnsburst-query-test-records.txt");
		std::fs::write(&path, "# comment\na.example.com A\nb.example.com AAAA\n\nc.example.com\n")
			.unwrap();
		let gen = file_gen(&path, &spec()).unwrap();
		assert_eq!(gen.size(), 3);
		std::fs::remove_file(&path).ok();
	}

	#[test]
	fn test_file_gen_empty_is_error() {
		let path = std::env::temp_dir().join("dnsburst-query-test-empty.txt");
		std::fs::write(&path, "# nothing here\n").unwrap();
		assert!(file_gen(&path, &spec()).is_err());
		std::fs::remove_file(&path).ok();
	}

	#[test]
	fn test_numberqname_range() {
		let mut s = spec();
		s.opts = vec!["LOW=5".to_string(), "high=9".to_string()];
		let mut gen = NumberQNameGen::new(&s).unwrap();
		assert_eq!(gen.size(), 5);
		for _ in 0..20 {
			let wire = gen.next_udp(1);
			let msg = Message::from_vec(&wire).unwrap();
			let qname = msg.queries()[0].name().to_ascii();
			let first = qname.split('.').next().unwrap();
			let n: u64 = first.parse().unwrap();
			assert!((5..=9).contains(&n), "qname {} out of range", qname);
		}
	}

	#[test]
	fn test_numberqname_rejects_inverted_range() {
		let mut s = spec();
		s.opts = vec!["low=10".to_string(), "high=1".to_string()];
		assert!(NumberQNameGen::new(&s).is_err());
	}

	#[test]
	fn test_bad_opt_value_is_error() {
		let mut s = spec();
		s.opts = vec!["count=abc".to_string()];
		assert!(random_pkt_gen(&s).is_err());
	}

	#[test]
	fn test_opt_without_equals_is_error() {
		let mut s = spec();
		s.opts = vec!["count".to_string()];
		assert!(random_pkt_gen(&s).is_err());
	}

	#[test]
	fn test_randompkt_count_and_id() {
		let mut s = spec();
		s.opts = vec!["count=12".to_string(), "size=64".to_string()];
		let mut gen = random_pkt_gen(&s).unwrap();
		assert_eq!(gen.size(), 12);
		let pkt = gen.next_udp(0x0102);
		assert!(!pkt.is_empty() && pkt.len() <= 64);
		if pkt.len() >= 2 {
			assert_eq!(&pkt[..2], &[0x01, 0x02]);
		}
	}

	#[test]
	fn test_randomqname_parses_and_counts() {
		let mut s = spec();
		s.opts = vec!["count=8".to_string(), "size=50".to_string()];
		let mut gen = random_qname_gen(&s).unwrap();
		assert_eq!(gen.size(), 8);
		let wire = gen.next_udp(77);
		assert_eq!(crate::dns::response_meta(&wire).unwrap().0, 77);
	}

	#[test]
	fn test_randomlabel_builds() {
		let mut s = spec();
		s.opts = vec![
			"count=8".to_string(),
			"lblsize=10".to_string(),
			"lblcount=4".to_string(),
		];
		let mut gen = random_label_gen(&s).unwrap();
		assert_eq!(gen.size(), 8);
		let wire = gen.next_udp(3);
		assert_eq!(crate::dns::response_meta(&wire).unwrap().0, 3);
	}

	#[test]
	fn test_randomize_keeps_records() {
		let mut s = spec();
		s.opts = vec!["count=16".to_string()];
		let mut gen = random_pkt_gen(&s).unwrap();
		gen.randomize();
		assert_eq!(gen.size(), 16);
	}

	#[test]
	fn test_build_unknown_generator() {
		assert!(build("nope", None, &spec()).is_err());
	}
}
