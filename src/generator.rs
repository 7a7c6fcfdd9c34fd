use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::cli::Protocol;
use crate::dns;
use crate::framing::{FramingError, MessageFramer};
use crate::limiter::TokenBucket;
use crate::metrics::GenMetrics;
use crate::query::QueryGen;
use crate::txid::{IdAllocator, InFlightTable};

/// Settings shared by every generator in the run, immutable after start.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
	pub target: SocketAddr,
	pub protocol: Protocol,
	/// Per-query timeout; also bounds the post-stop drain.
	pub query_timeout: Duration,
	/// Delay between UDP batches / minimum spacing between TCP connections.
	pub send_delay: Duration,
	pub batch_count: usize,
}

/// One traffic generator: a socket, the id pool, and the in-flight table.
///
/// Emission is paced by the shared token bucket; queries come from the shared
/// query generator. Every id handed out lives in exactly one place, the free
/// pool or the in-flight table, until the run ends.
pub struct Generator {
	cfg: Rc<GeneratorConfig>,
	qgen: Rc<RefCell<Box<dyn QueryGen>>>,
	limiter: Option<Rc<TokenBucket>>,
	metrics: Rc<GenMetrics>,
	ids: IdAllocator,
	in_flight: InFlightTable,
}

impl Generator {
	pub fn new(
		cfg: Rc<GeneratorConfig>,
		qgen: Rc<RefCell<Box<dyn QueryGen>>>,
		limiter: Option<Rc<TokenBucket>>,
		metrics: Rc<GenMetrics>,
	) -> Self {
		Generator {
			cfg,
			qgen,
			limiter,
			metrics,
			ids: IdAllocator::new(),
			in_flight: InFlightTable::new(),
		}
	}

	pub fn free_id_count(&self) -> usize {
		self.ids.len()
	}

	pub fn in_flight_count(&self) -> usize {
		self.in_flight.len()
	}

	/// Drive traffic until the stop signal fires, then drain and tear down.
	///
	/// Returns the generator so callers can inspect the final pool state.
	pub async fn run(self, stop_rx: watch::Receiver<bool>) -> Result<Generator> {
		match self.cfg.protocol {
			Protocol::Udp => self.run_udp(stop_rx).await,
			Protocol::Tcp => self.run_tcp(stop_rx).await,
		}
	}

	async fn run_udp(mut self, mut stop_rx: watch::Receiver<bool>) -> Result<Generator> {
		let bind_addr = if self.cfg.target.is_ipv4() {
			"0.0.0.0:0"
		} else {
			"[::]:0"
		};
		let socket = UdpSocket::bind(bind_addr)
			.await
			.context("failed to bind udp socket")?;
		let local = socket
			.local_addr()
			.context("udp socket has no local address")?;
		self.metrics.set_port(local.port());

		// interval periods must be nonzero
		let period = self.cfg.send_delay.max(Duration::from_millis(1));
		let mut send_tick =
			time::interval_at(time::Instant::now() + Duration::from_millis(1), period);
		send_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut sweep_tick = time::interval_at(
			time::Instant::now() + self.cfg.query_timeout,
			Duration::from_secs(1),
		);
		sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

		let mut buf = [0u8; 4096];
		loop {
			tokio::select! {
				_ = stop_rx.changed() => break,
				_ = send_tick.tick() => {
					self.udp_send(&socket).await;
				}
				result = socket.recv_from(&mut buf) => {
					match result {
						Ok((n, _)) => self.process_wire(&buf[..n]),
						Err(e) => {
							debug!("udp receive error: {}", e);
							self.metrics.net_error();
						}
					}
				}
				_ = sweep_tick.tick() => self.sweep(false),
			}
		}

		// drain: responses may still arrive for up to the query timeout
		let drain = if self.in_flight.is_empty() {
			Duration::from_millis(1)
		} else {
			self.cfg.query_timeout
		};
		let deadline = time::sleep(drain);
		tokio::pin!(deadline);
		loop {
			tokio::select! {
				_ = &mut deadline => break,
				result = socket.recv_from(&mut buf) => {
					if let Ok((n, _)) = result {
						self.process_wire(&buf[..n]);
					}
				}
				_ = sweep_tick.tick() => self.sweep(false),
			}
		}
		self.sweep(true);
		Ok(self)
	}

	/// Emit one UDP batch, stopping early on rate limit or pool exhaustion.
	async fn udp_send(&mut self, socket: &UdpSocket) {
		if self.qgen.borrow().finished() {
			return;
		}
		if self.ids.is_empty() {
			warn!("max in flight reached");
			return;
		}
		for _ in 0..self.cfg.batch_count {
			if let Some(limiter) = &self.limiter {
				if !limiter.consume(1) {
					return;
				}
			}
			let Some(id) = self.ids.take() else {
				warn!("max in flight reached");
				return;
			};
			let payload = self.qgen.borrow_mut().next_udp(id);
			match socket.send_to(&payload, self.cfg.target).await {
				Ok(n) => {
					self.in_flight.insert(id, Instant::now());
					self.metrics.send(n, 1, self.in_flight.len());
				}
				Err(e) => {
					debug!("udp send error: {}", e);
					self.metrics.net_error();
					self.ids.release(id);
				}
			}
		}
	}

	async fn run_tcp(mut self, mut stop_rx: watch::Receiver<bool>) -> Result<Generator> {
		let mut sweep_tick = time::interval_at(
			time::Instant::now() + self.cfg.query_timeout,
			Duration::from_secs(1),
		);
		sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

		'sessions: while !*stop_rx.borrow() {
			let connected = tokio::select! {
				result = TcpStream::connect(self.cfg.target) => result,
				_ = stop_rx.changed() => break 'sessions,
			};
			match connected {
				Ok(stream) => {
					self.tcp_session(stream, &mut stop_rx, &mut sweep_tick).await;
				}
				Err(e) => {
					debug!("tcp connect error: {}", e);
					self.metrics.net_error();
					// don't hammer an unreachable target with SYNs
					let backoff =
						time::sleep(self.cfg.send_delay.max(Duration::from_millis(1)));
					tokio::pin!(backoff);
					tokio::select! {
						_ = &mut backoff => {}
						_ = stop_rx.changed() => {}
					}
				}
			}
			// ids cannot be matched across connection boundaries
			self.sweep(true);
		}
		self.sweep(true);
		Ok(self)
	}

	/// One TCP connection: send a batch, drain responses, close.
	///
	/// The finish-session timer starts after the write and checks every 50 ms
	/// whether everything is answered or timed out, and whether the minimum
	/// inter-connection spacing has passed. A stop signal bounds the rest of
	/// the session at the query timeout.
	async fn tcp_session(
		&mut self,
		mut stream: TcpStream,
		stop_rx: &mut watch::Receiver<bool>,
		sweep_tick: &mut time::Interval,
	) {
		self.metrics.tcp_connection();
		if let Ok(local) = stream.local_addr() {
			self.metrics.set_port(local.port());
		}

		let mut ids = Vec::with_capacity(self.cfg.batch_count);
		for _ in 0..self.cfg.batch_count {
			if self.ids.is_empty() {
				break;
			}
			if let Some(limiter) = &self.limiter {
				if !limiter.consume(1) {
					break;
				}
			}
			let id = self.ids.take().expect("pool checked non-empty");
			// send times go in before the write so responses racing the
			// write completion still find their entry
			self.in_flight.insert(id, Instant::now());
			ids.push(id);
		}
		if ids.is_empty() {
			// nothing acquired, usually the rate limit; close straight away
			return;
		}

		let payload = self.qgen.borrow_mut().next_tcp(&ids);
		if let Err(e) = stream.write_all(&payload).await {
			debug!("tcp write error: {}", e);
			self.metrics.net_error();
			return;
		}
		self.metrics.send(payload.len(), ids.len() as u64, self.in_flight.len());

		let wait_start = Instant::now();
		let mut finish_tick = time::interval_at(
			time::Instant::now() + Duration::from_millis(1),
			Duration::from_millis(50),
		);
		finish_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

		let mut framer = MessageFramer::new();
		let mut buf = [0u8; 4096];
		let mut stop_at: Option<time::Instant> = if *stop_rx.borrow() {
			Some(time::Instant::now() + self.drain_window())
		} else {
			None
		};

		loop {
			tokio::select! {
				_ = async { time::sleep_until(stop_at.unwrap()).await }, if stop_at.is_some() => {
					break;
				}
				_ = stop_rx.changed(), if stop_at.is_none() => {
					stop_at = Some(time::Instant::now() + self.drain_window());
				}
				result = stream.read(&mut buf) => {
					match result {
						// peer closed, shut our side down in turn
						Ok(0) => break,
						Ok(n) => {
							if let Err(e) = self.tcp_input(&mut framer, &buf[..n]) {
								debug!("tcp framing violation: {}", e);
								self.metrics.net_error();
								break;
							}
						}
						Err(e) => {
							debug!("tcp read error: {}", e);
							self.metrics.net_error();
							break;
						}
					}
				}
				_ = finish_tick.tick() => {
					let waited = wait_start.elapsed();
					if !self.in_flight.is_empty() && waited < self.cfg.query_timeout {
						// queries still in flight and time left, keep waiting
						continue;
					}
					if waited < self.cfg.send_delay {
						// answered or timed out, hold for the spacing delay
						continue;
					}
					break;
				}
				_ = sweep_tick.tick() => self.sweep(false),
			}
		}

		let _ = stream.shutdown().await;
	}

	fn drain_window(&self) -> Duration {
		if self.in_flight.is_empty() {
			Duration::from_millis(1)
		} else {
			self.cfg.query_timeout
		}
	}

	/// Feed received TCP bytes through the framer, reconciling each complete
	/// message. A framing violation stops the drain; the caller closes.
	fn tcp_input(&mut self, framer: &mut MessageFramer, data: &[u8]) -> Result<(), FramingError> {
		framer.push(data);
		while let Some(msg) = framer.next_message()? {
			self.process_wire(&msg);
		}
		Ok(())
	}

	/// Reconcile one received message against the in-flight table.
	fn process_wire(&mut self, data: &[u8]) {
		let Some((id, rcode)) = dns::response_meta(data) else {
			self.metrics.bad_receive(self.in_flight.len());
			return;
		};
		match self.in_flight.complete(id, Instant::now()) {
			Some(latency) => {
				self.ids.release(id);
				self.metrics.receive(latency, rcode, self.in_flight.len());
			}
			None => {
				debug!("untracked transaction id {}", id);
				self.metrics.bad_receive(self.in_flight.len());
			}
		}
	}

	/// Expire aged (or, on hard reset, all) in-flight ids back into the pool.
	fn sweep(&mut self, hard_reset: bool) {
		let expired = self
			.in_flight
			.sweep(Instant::now(), self.cfg.query_timeout, hard_reset);
		for id in expired {
			self.ids.release(id);
			self.metrics.timeout(self.in_flight.len());
		}
	}
}
