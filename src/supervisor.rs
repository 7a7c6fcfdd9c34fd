use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info};

use crate::cli::{Cli, Family};
use crate::flow;
use crate::generator::{Generator, GeneratorConfig};
use crate::limiter::TokenBucket;
use crate::metrics::MetricsMgr;
use crate::query;

/// Resolve the target to one address of the requested family.
///
/// Accepts IP literals directly; hostnames go through the system resolver
/// once, before any traffic starts.
pub async fn resolve_target(host: &str, port: u16, family: Family) -> Result<SocketAddr> {
	let wanted = |addr: &SocketAddr| match family {
		Family::Inet => addr.is_ipv4(),
		Family::Inet6 => addr.is_ipv6(),
	};

	if let Ok(ip) = host.parse::<IpAddr>() {
		let addr = SocketAddr::new(ip, port);
		if !wanted(&addr) {
			bail!("target address '{}' does not match family {}", host, family);
		}
		return Ok(addr);
	}

	let addrs = tokio::net::lookup_host((host, port))
		.await
		.with_context(|| format!("unable to resolve target address: {}", host))?;
	addrs
		.into_iter()
		.find(|addr| wanted(addr))
		.ok_or_else(|| {
			anyhow!(
				"'{}' did not resolve to an address of family {}",
				host,
				family
			)
		})
}

/// Assemble the run and drive it to completion.
///
/// Builds the shared pieces (query generator, rate limiter, metrics), spawns
/// the generators, then waits for whichever comes first: SIGINT/SIGTERM, the
/// run-time limit, or query generator exhaustion. Shutdown stops emission,
/// lets in-flight responses drain, and finalizes metrics.
pub async fn run(cli: Cli) -> Result<()> {
	let protocol = cli.protocol()?;
	let family = cli.family()?;
	let pacing = cli.pacing()?;
	let target = resolve_target(&cli.target, cli.port, family).await?;

	let spec = cli.query_spec();
	let qgen = query::build(&cli.generator, cli.file.as_deref(), &spec)
		.context("generator error")?;
	let qgen = Rc::new(RefCell::new(qgen));
	if cli.randomize {
		qgen.borrow_mut().randomize();
	}

	// a static -Q wins over a flow schedule; with neither, no limiter at all
	let mut flow_steps = None;
	let limiter = if cli.qps > 0 {
		Some(Rc::new(TokenBucket::new(cli.qps, cli.qps)))
	} else if let Some(flow_spec) = &cli.qps_flow {
		let steps = flow::parse_flow_spec(flow_spec)?;
		let first = steps
			.front()
			.copied()
			.ok_or_else(|| anyhow!("--qps-flow has no steps"))?;
		flow_steps = Some(steps);
		Some(Rc::new(TokenBucket::new(first.qps, first.qps)))
	} else {
		None
	};

	let cmdline = std::env::args().collect::<Vec<_>>().join(" ");
	let metrics = Rc::new(MetricsMgr::new(cli.verbosity, cli.output.clone(), cmdline));

	let gcfg = Rc::new(GeneratorConfig {
		target,
		protocol,
		query_timeout: Duration::from_secs(cli.timeout_secs),
		send_delay: pacing.send_delay,
		batch_count: pacing.batch_count,
	});

	let (stop_tx, stop_rx) = watch::channel(false);
	let mut handles = Vec::with_capacity(pacing.generators);
	for _ in 0..pacing.generators {
		let gen = Generator::new(
			gcfg.clone(),
			qgen.clone(),
			limiter.clone(),
			metrics.register(),
		);
		handles.push(tokio::task::spawn_local(gen.run(stop_rx.clone())));
	}

	if let (Some(limiter), Some(steps)) = (&limiter, flow_steps.take()) {
		tokio::task::spawn_local(flow::run_schedule(steps, limiter.clone()));
	}

	if cli.verbosity >= 1 {
		println!(
			"target {} ({}) port {}: {} generators, {} queries per batch every {} ms over {}",
			cli.target,
			target.ip(),
			cli.port,
			pacing.generators,
			pacing.batch_count,
			pacing.send_delay.as_millis(),
			protocol,
		);
		{
			let qgen = qgen.borrow();
			println!(
				"query generator [{}] holds {} record(s)",
				qgen.name(),
				qgen.size()
			);
		}
		if cli.randomize {
			println!("record list randomized");
		}
	}

	metrics.start();

	let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
	let mut sigterm =
		signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
	let poll_exhaustion = qgen.borrow().loops() != 0;
	let limit_secs = cli.limit_secs;

	tokio::select! {
		_ = sigint.recv() => info!("interrupted"),
		_ = sigterm.recv() => info!("terminated"),
		_ = async { time::sleep(Duration::from_secs(limit_secs)).await }, if limit_secs > 0 => {
			info!("run time limit reached");
		}
		_ = async {
			let mut tick = time::interval(Duration::from_millis(500));
			loop {
				tick.tick().await;
				if qgen.borrow().finished() {
					break;
				}
			}
		}, if poll_exhaustion => info!("query generator exhausted"),
	}

	if cli.verbosity >= 1 {
		println!(
			"stopping, waiting up to {}s for in flight to finish...",
			cli.timeout_secs
		);
	}
	stop_tx.send(true).ok();
	metrics.stop();

	for handle in handles {
		match handle.await {
			Ok(Ok(_)) => {}
			Ok(Err(e)) => error!("generator failed: {:#}", e),
			Err(e) => error!("generator task panicked: {}", e),
		}
	}

	metrics.finalize()
}
