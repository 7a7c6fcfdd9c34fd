use std::cell::Cell;
use std::time::Instant;

/// Token bucket shared by every generator in the process.
///
/// Tokens accrue continuously at `rate` per second up to `burst`. The bucket
/// lives on the single-threaded loop, so interior mutability through `Cell`
/// is enough to share one handle across all generators.
#[derive(Debug)]
pub struct TokenBucket {
	rate: Cell<f64>,
	burst: Cell<f64>,
	tokens: Cell<f64>,
	last_fill: Cell<Instant>,
}

impl TokenBucket {
	pub fn new(rate: u64, burst: u64) -> Self {
		TokenBucket {
			rate: Cell::new(rate as f64),
			burst: Cell::new(burst as f64),
			tokens: Cell::new(burst as f64),
			last_fill: Cell::new(Instant::now()),
		}
	}

	/// Deduct `n` tokens if and only if all of them are available.
	///
	/// Returns false and leaves the bucket unchanged otherwise.
	pub fn consume(&self, n: u64) -> bool {
		self.consume_at(n, Instant::now())
	}

	fn consume_at(&self, n: u64, now: Instant) -> bool {
		self.refill(now);
		let want = n as f64;
		if self.tokens.get() < want {
			return false;
		}
		self.tokens.set(self.tokens.get() - want);
		true
	}

	/// Replace rate and capacity in place. The token count resets to `burst`.
	pub fn reconfigure(&self, rate: u64, burst: u64) {
		self.rate.set(rate as f64);
		self.burst.set(burst as f64);
		self.tokens.set(burst as f64);
		self.last_fill.set(Instant::now());
	}

	pub fn rate(&self) -> u64 {
		self.rate.get() as u64
	}

	fn refill(&self, now: Instant) {
		let elapsed = now.saturating_duration_since(self.last_fill.get());
		let refilled = self.tokens.get() + elapsed.as_secs_f64() * self.rate.get();
		self.tokens.set(refilled.min(self.burst.get()));
		self.last_fill.set(now);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn test_burst_then_empty() {
		let bucket = TokenBucket::new(10, 5);
		let t0 = Instant::now();
		assert!(bucket.consume_at(5, t0));
		assert!(!bucket.consume_at(1, t0));
	}

	#[test]
	fn test_failed_consume_keeps_tokens() {
		let bucket = TokenBucket::new(10, 5);
		let t0 = Instant::now();
		assert!(!bucket.consume_at(6, t0));
		// the failed consume must not have deducted anything
		assert!(bucket.consume_at(5, t0));
	}

	#[test]
	fn test_refill_rate() {
		let bucket = TokenBucket::new(10, 10);
		let t0 = Instant::now();
		assert!(bucket.consume_at(10, t0));
		// 100ms at 10/s refills one token
		assert!(!bucket.consume_at(1, t0 + Duration::from_millis(50)));
		assert!(bucket.consume_at(1, t0 + Duration::from_millis(150)));
	}

	#[test]
	fn test_refill_caps_at_burst() {
		let bucket = TokenBucket::new(1000, 5);
		let t0 = Instant::now();
		assert!(bucket.consume_at(5, t0));
		// plenty of refill time, but never more than burst
		assert!(bucket.consume_at(5, t0 + Duration::from_secs(10)));
		assert!(!bucket.consume_at(1, t0 + Duration::from_secs(10)));
	}

	#[test]
	fn test_reconfigure_resets_tokens() {
		let bucket = TokenBucket::new(10, 10);
		assert!(bucket.consume(10));
		bucket.reconfigure(100, 100);
		assert_eq!(bucket.rate(), 100);
		assert!(bucket.consume(100));
		assert!(!bucket.consume(1));
	}

	#[test]
	fn test_zero_rate_never_refills() {
		let bucket = TokenBucket::new(0, 0);
		let t0 = Instant::now();
		assert!(!bucket.consume_at(1, t0 + Duration::from_secs(60)));
	}
}
