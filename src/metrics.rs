use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::dns;
use crate::stats::LatencySummary;

/// Counters for one traffic generator.
///
/// Lives on the single-threaded loop and fans in from the generator that owns
/// it plus the display timer, so `Cell`/`RefCell` interior mutability is all
/// the sharing it needs.
#[derive(Default)]
pub struct GenMetrics {
	port: Cell<u16>,
	sent: Cell<u64>,
	sent_bytes: Cell<u64>,
	received: Cell<u64>,
	timeouts: Cell<u64>,
	bad_receives: Cell<u64>,
	net_errors: Cell<u64>,
	tcp_connections: Cell<u64>,
	in_flight: Cell<usize>,
	max_in_flight: Cell<usize>,
	rcodes: RefCell<HashMap<u8, u64>>,
	latencies_ms: RefCell<Vec<f64>>,

	// window accumulators, drained once per display tick
	window_sent: Cell<u64>,
	window_received: Cell<u64>,
	window_lat_sum: Cell<f64>,
	window_lat_min: Cell<f64>,
	window_lat_max: Cell<f64>,
}

impl GenMetrics {
	/// Record the local port so generators can be told apart in the summary.
	pub fn set_port(&self, port: u16) {
		self.port.set(port);
	}

	pub fn send(&self, bytes: usize, queries: u64, depth: usize) {
		self.sent.set(self.sent.get() + queries);
		self.sent_bytes.set(self.sent_bytes.get() + bytes as u64);
		self.window_sent.set(self.window_sent.get() + queries);
		self.note_depth(depth);
	}

	pub fn receive(&self, latency: Duration, rcode: u8, depth: usize) {
		let ms = latency.as_secs_f64() * 1000.0;
		self.received.set(self.received.get() + 1);
		*self.rcodes.borrow_mut().entry(rcode).or_insert(0) += 1;
		self.latencies_ms.borrow_mut().push(ms);

		self.window_received.set(self.window_received.get() + 1);
		self.window_lat_sum.set(self.window_lat_sum.get() + ms);
		let min = self.window_lat_min.get();
		if self.window_received.get() == 1 || ms < min {
			self.window_lat_min.set(ms);
		}
		if ms > self.window_lat_max.get() {
			self.window_lat_max.set(ms);
		}
		self.note_depth(depth);
	}

	pub fn timeout(&self, depth: usize) {
		self.timeouts.set(self.timeouts.get() + 1);
		self.note_depth(depth);
	}

	pub fn bad_receive(&self, depth: usize) {
		self.bad_receives.set(self.bad_receives.get() + 1);
		self.note_depth(depth);
	}

	pub fn net_error(&self) {
		self.net_errors.set(self.net_errors.get() + 1);
	}

	pub fn tcp_connection(&self) {
		self.tcp_connections.set(self.tcp_connections.get() + 1);
	}

	pub fn sent(&self) -> u64 {
		self.sent.get()
	}

	pub fn received(&self) -> u64 {
		self.received.get()
	}

	pub fn timeouts(&self) -> u64 {
		self.timeouts.get()
	}

	pub fn bad_receives(&self) -> u64 {
		self.bad_receives.get()
	}

	pub fn net_errors(&self) -> u64 {
		self.net_errors.get()
	}

	pub fn tcp_connections(&self) -> u64 {
		self.tcp_connections.get()
	}

	pub fn max_in_flight(&self) -> usize {
		self.max_in_flight.get()
	}

	fn note_depth(&self, depth: usize) {
		self.in_flight.set(depth);
		if depth > self.max_in_flight.get() {
			self.max_in_flight.set(depth);
		}
	}

	fn drain_window(&self) -> Window {
		let window = Window {
			sent: self.window_sent.get(),
			received: self.window_received.get(),
			lat_sum: self.window_lat_sum.get(),
			lat_min: self.window_lat_min.get(),
			lat_max: self.window_lat_max.get(),
			in_flight: self.in_flight.get(),
		};
		self.window_sent.set(0);
		self.window_received.set(0);
		self.window_lat_sum.set(0.0);
		self.window_lat_min.set(0.0);
		self.window_lat_max.set(0.0);
		window
	}
}

#[derive(Default)]
struct Window {
	sent: u64,
	received: u64,
	lat_sum: f64,
	lat_min: f64,
	lat_max: f64,
	in_flight: usize,
}

impl Window {
	fn merge(&mut self, other: Window) {
		if other.received > 0 {
			if self.received == 0 || other.lat_min < self.lat_min {
				self.lat_min = other.lat_min;
			}
			if other.lat_max > self.lat_max {
				self.lat_max = other.lat_max;
			}
		}
		self.sent += other.sent;
		self.received += other.received;
		self.lat_sum += other.lat_sum;
		self.in_flight += other.in_flight;
	}
}

#[derive(Serialize)]
struct GenReport {
	port: u16,
	sent: u64,
	sent_bytes: u64,
	received: u64,
	timeouts: u64,
	bad_receives: u64,
	net_errors: u64,
	tcp_connections: u64,
	max_in_flight: usize,
}

#[derive(Serialize, Default)]
struct Totals {
	sent: u64,
	sent_bytes: u64,
	received: u64,
	timeouts: u64,
	bad_receives: u64,
	net_errors: u64,
	tcp_connections: u64,
	max_in_flight: usize,
}

#[derive(Serialize)]
struct RunReport {
	cmdline: String,
	runtime_secs: f64,
	totals: Totals,
	response_rate_pct: f64,
	latency: LatencySummary,
	rcodes: BTreeMap<String, u64>,
	generators: Vec<GenReport>,
}

/// Owns every generator's metrics, the periodic display, and the final report.
pub struct MetricsMgr {
	verbosity: u8,
	output: Option<PathBuf>,
	cmdline: String,
	started: Instant,
	gens: RefCell<Vec<Rc<GenMetrics>>>,
	display: RefCell<Option<JoinHandle<()>>>,
}

impl MetricsMgr {
	pub fn new(verbosity: u8, output: Option<PathBuf>, cmdline: String) -> Self {
		MetricsMgr {
			verbosity,
			output,
			cmdline,
			started: Instant::now(),
			gens: RefCell::new(Vec::new()),
			display: RefCell::new(None),
		}
	}

	/// Hand out one metrics object per generator.
	pub fn register(&self) -> Rc<GenMetrics> {
		let gen = Rc::new(GenMetrics::default());
		self.gens.borrow_mut().push(gen.clone());
		gen
	}

	/// Arm the once-per-second stats line. Silent runs skip it entirely.
	pub fn start(self: &Rc<Self>) {
		if self.verbosity == 0 {
			return;
		}
		let mgr = self.clone();
		let handle = tokio::task::spawn_local(async move {
			let mut tick = tokio::time::interval(Duration::from_secs(1));
			tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			tick.tick().await; // completes immediately, skip
			loop {
				tick.tick().await;
				mgr.display_line();
			}
		});
		*self.display.borrow_mut() = Some(handle);
	}

	/// Cancel the display timer. Safe to call more than once.
	pub fn stop(&self) {
		if let Some(handle) = self.display.borrow_mut().take() {
			handle.abort();
		}
	}

	fn display_line(&self) {
		let mut window = Window::default();
		for gen in self.gens.borrow().iter() {
			window.merge(gen.drain_window());
		}
		let (lat_min, lat_avg, lat_max) = if window.received > 0 {
			(
				window.lat_min,
				window.lat_sum / window.received as f64,
				window.lat_max,
			)
		} else {
			(0.0, 0.0, 0.0)
		};
		let totals = self.totals();
		println!(
			"{}s: sent {} ({} qps), rcvd {} ({} qps), lat min/avg/max {:.1}/{:.1}/{:.1} ms, in flight {}, timeouts {}, bad {}, net err {}",
			self.started.elapsed().as_secs(),
			totals.sent,
			window.sent,
			totals.received,
			window.received,
			lat_min,
			lat_avg,
			lat_max,
			window.in_flight,
			totals.timeouts,
			totals.bad_receives,
			totals.net_errors,
		);
	}

	fn totals(&self) -> Totals {
		let mut totals = Totals::default();
		for gen in self.gens.borrow().iter() {
			totals.sent += gen.sent.get();
			totals.sent_bytes += gen.sent_bytes.get();
			totals.received += gen.received.get();
			totals.timeouts += gen.timeouts.get();
			totals.bad_receives += gen.bad_receives.get();
			totals.net_errors += gen.net_errors.get();
			totals.tcp_connections += gen.tcp_connections.get();
			totals.max_in_flight += gen.max_in_flight.get();
		}
		totals
	}

	fn build_report(&self) -> RunReport {
		let totals = self.totals();
		let mut latencies = Vec::new();
		let mut rcodes: BTreeMap<String, u64> = BTreeMap::new();
		let mut generators = Vec::new();
		for gen in self.gens.borrow().iter() {
			latencies.extend_from_slice(&gen.latencies_ms.borrow());
			for (&rcode, &count) in gen.rcodes.borrow().iter() {
				*rcodes.entry(dns::rcode_name(rcode)).or_insert(0) += count;
			}
			generators.push(GenReport {
				port: gen.port.get(),
				sent: gen.sent.get(),
				sent_bytes: gen.sent_bytes.get(),
				received: gen.received.get(),
				timeouts: gen.timeouts.get(),
				bad_receives: gen.bad_receives.get(),
				net_errors: gen.net_errors.get(),
				tcp_connections: gen.tcp_connections.get(),
				max_in_flight: gen.max_in_flight.get(),
			});
		}
		let response_rate_pct = if totals.sent > 0 {
			totals.received as f64 / totals.sent as f64 * 100.0
		} else {
			0.0
		};
		RunReport {
			cmdline: self.cmdline.clone(),
			runtime_secs: self.started.elapsed().as_secs_f64(),
			totals,
			response_rate_pct,
			latency: LatencySummary::from_samples(&latencies),
			rcodes,
			generators,
		}
	}

	/// Print the end-of-run summary and write the JSON report when requested.
	pub fn finalize(&self) -> Result<()> {
		self.stop();
		let report = self.build_report();

		if self.verbosity >= 1 {
			let mut table = Table::new();
			table.load_preset(UTF8_FULL);
			table.set_content_arrangement(ContentArrangement::Dynamic);
			table.set_header(vec![
				"Port", "Sent", "Rcvd", "Timeouts", "Bad", "Net Err", "TCP Conn", "Max In Flight",
			]);
			for gen in &report.generators {
				table.add_row(vec![
					gen.port.to_string(),
					gen.sent.to_string(),
					gen.received.to_string(),
					gen.timeouts.to_string(),
					gen.bad_receives.to_string(),
					gen.net_errors.to_string(),
					gen.tcp_connections.to_string(),
					gen.max_in_flight.to_string(),
				]);
			}
			println!("\nRun Summary\n===========\n");
			println!("{table}");
			println!(
				"\ntotals: sent {}, rcvd {} ({:.1}%), timeouts {}, bad {}, net err {} over {:.1}s",
				report.totals.sent,
				report.totals.received,
				report.response_rate_pct,
				report.totals.timeouts,
				report.totals.bad_receives,
				report.totals.net_errors,
				report.runtime_secs,
			);
			println!(
				"latency ms: min {:.2}, p50 {:.2}, p95 {:.2}, p99 {:.2}, mean {:.2}, stddev {:.2}, max {:.2}",
				report.latency.min_ms,
				report.latency.p50_ms,
				report.latency.p95_ms,
				report.latency.p99_ms,
				report.latency.mean_ms,
				report.latency.stddev_ms,
				report.latency.max_ms,
			);
			if !report.rcodes.is_empty() {
				let rcodes: Vec<String> = report
					.rcodes
					.iter()
					.map(|(name, count)| format!("{} {}", name, count))
					.collect();
				println!("responses: {}", rcodes.join(", "));
			}
		}

		if let Some(path) = &self.output {
			let json = serde_json::to_string_pretty(&report)
				.context("failed to serialize metrics report")?;
			std::fs::write(path, json)
				.with_context(|| format!("failed to write metrics file '{}'", path.display()))?;
			if self.verbosity >= 1 {
				println!("metrics written to {}", path.display());
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_counters_accumulate() {
		let gen = GenMetrics::default();
		gen.send(40, 1, 1);
		gen.send(40, 1, 2);
		gen.receive(Duration::from_millis(5), 0, 1);
		gen.timeout(0);
		gen.bad_receive(0);
		gen.net_error();
		assert_eq!(gen.sent(), 2);
		assert_eq!(gen.received(), 1);
		assert_eq!(gen.timeouts(), 1);
		assert_eq!(gen.bad_receives(), 1);
		assert_eq!(gen.net_errors(), 1);
		assert_eq!(gen.max_in_flight(), 2);
	}

	#[test]
	fn test_rcode_tally() {
		let gen = GenMetrics::default();
		gen.receive(Duration::from_millis(1), 0, 0);
		gen.receive(Duration::from_millis(1), 0, 0);
		gen.receive(Duration::from_millis(1), 3, 0);
		let rcodes = gen.rcodes.borrow();
		assert_eq!(rcodes.get(&0), Some(&2));
		assert_eq!(rcodes.get(&3), Some(&1));
	}

	#[test]
	fn test_window_drains_and_resets() {
		let gen = GenMetrics::default();
		gen.send(40, 4, 4);
		gen.receive(Duration::from_millis(2), 0, 3);
		gen.receive(Duration::from_millis(8), 0, 2);

		let window = gen.drain_window();
		assert_eq!(window.sent, 4);
		assert_eq!(window.received, 2);
		assert!((window.lat_min - 2.0).abs() < 0.01);
		assert!((window.lat_max - 8.0).abs() < 0.01);
		assert!((window.lat_sum - 10.0).abs() < 0.01);

		let empty = gen.drain_window();
		assert_eq!(empty.sent, 0);
		assert_eq!(empty.received, 0);
		// cumulative counters are untouched by the window drain
		assert_eq!(gen.sent(), 4);
	}

	#[test]
	fn test_report_aggregates_generators() {
		let mgr = MetricsMgr::new(0, None, "dnsburst test".to_string());
		let a = mgr.register();
		let b = mgr.register();
		a.send(40, 10, 5);
		b.send(40, 20, 7);
		a.receive(Duration::from_millis(3), 0, 4);
		b.receive(Duration::from_millis(5), 2, 6);

		let report = mgr.build_report();
		assert_eq!(report.totals.sent, 30);
		assert_eq!(report.totals.received, 2);
		assert_eq!(report.generators.len(), 2);
		assert_eq!(report.rcodes.get("NOERROR"), Some(&1));
		assert_eq!(report.rcodes.get("SERVFAIL"), Some(&1));
		assert_eq!(report.latency.samples, 2);
	}

	#[test]
	fn test_report_latency_survives_window_drains() {
		let mgr = MetricsMgr::new(0, None, String::new());
		let gen = mgr.register();
		gen.receive(Duration::from_millis(2), 0, 1);
		gen.drain_window(); // a display tick resets the window
		gen.receive(Duration::from_millis(6), 3, 0);
		gen.drain_window();

		let report = mgr.build_report();
		// the 1s window is transient, the report keeps every sample
		assert_eq!(report.latency.samples, 2);
		assert!((report.latency.min_ms - 2.0).abs() < 0.01);
		assert!((report.latency.max_ms - 6.0).abs() < 0.01);
		// latencies pool across rcodes while the rcode tally stays split
		assert_eq!(report.rcodes.get("NOERROR"), Some(&1));
		assert_eq!(report.rcodes.get("NXDOMAIN"), Some(&1));
	}

	#[test]
	fn test_finalize_writes_json() {
		let path = std::env::temp_dir().join("dnsburst-metrics-test.json");
		let mgr = MetricsMgr::new(0, Some(path.clone()), "dnsburst -o x".to_string());
		let gen = mgr.register();
		gen.send(40, 2, 1);
		gen.receive(Duration::from_millis(4), 0, 0);
		mgr.finalize().unwrap();

		let content = std::fs::read_to_string(&path).unwrap();
		let value: serde_json::Value = serde_json::from_str(&content).unwrap();
		assert_eq!(value["cmdline"], "dnsburst -o x");
		assert_eq!(value["totals"]["sent"], 2);
		assert_eq!(value["totals"]["received"], 1);
		assert_eq!(value["rcodes"]["NOERROR"], 1);
		std::fs::remove_file(&path).ok();
	}
}
