use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::time::sleep;
use tracing::info;

use crate::limiter::TokenBucket;

/// One step of the dynamic rate schedule: hold `qps` for `duration_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowStep {
	pub qps: u64,
	pub duration_ms: u64,
}

/// Parse a `--qps-flow` specification, `QPS,MS;QPS,MS;...`.
pub fn parse_flow_spec(spec: &str) -> Result<VecDeque<FlowStep>> {
	let mut steps = VecDeque::new();
	for group in spec.split(';') {
		let (qps, ms) = group
			.split_once(',')
			.ok_or_else(|| anyhow!("flow step '{}' is not QPS,MS", group))?;
		steps.push_back(FlowStep {
			qps: qps
				.trim()
				.parse()
				.map_err(|_| anyhow!("flow step qps '{}' is not an integer", qps))?,
			duration_ms: ms
				.trim()
				.parse()
				.map_err(|_| anyhow!("flow step duration '{}' is not an integer", ms))?,
		});
	}
	Ok(steps)
}

/// Walk the schedule, reprogramming the shared limiter at each step.
///
/// The final step is applied and left in place: once the queue empties there
/// is nothing further to switch to, so it holds until the run ends.
pub async fn run_schedule(mut steps: VecDeque<FlowStep>, limiter: Rc<TokenBucket>) {
	while let Some(step) = steps.pop_front() {
		limiter.reconfigure(step.qps, step.qps);
		if steps.is_empty() {
			info!("qps flow now {} until completion", step.qps);
			break;
		}
		info!(
			"qps flow now {} for {}ms, {} steps left",
			step.qps,
			step.duration_ms,
			steps.len()
		);
		sleep(Duration::from_millis(step.duration_ms)).await;
	}
}
