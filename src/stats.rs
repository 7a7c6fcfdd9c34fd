use serde::Serialize;

/// Distribution of response latencies over a run, in milliseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencySummary {
	pub samples: usize,
	pub min_ms: f64,
	pub p50_ms: f64,
	pub p95_ms: f64,
	pub p99_ms: f64,
	pub mean_ms: f64,
	pub stddev_ms: f64,
	pub max_ms: f64,
}

impl LatencySummary {
	/// Summarize the latencies of every answered query. All zeros when
	/// nothing was answered.
	pub fn from_samples(samples: &[f64]) -> Self {
		if samples.is_empty() {
			return LatencySummary::default();
		}
		let mut sorted = samples.to_vec();
		sorted.sort_by(f64::total_cmp);

		let n = sorted.len();
		let mean = sorted.iter().sum::<f64>() / n as f64;
		let variance = sorted
			.iter()
			.map(|v| {
				let d = v - mean;
				d * d
			})
			.sum::<f64>()
			/ n as f64;

		LatencySummary {
			samples: n,
			min_ms: sorted[0],
			p50_ms: nearest_rank(&sorted, 50.0),
			p95_ms: nearest_rank(&sorted, 95.0),
			p99_ms: nearest_rank(&sorted, 99.0),
			mean_ms: mean,
			stddev_ms: variance.sqrt(),
			max_ms: sorted[n - 1],
		}
	}
}

/// Nearest-rank percentile of a sorted, non-empty slice.
fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
	let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
	sorted[rank.clamp(1, sorted.len()) - 1]
}
