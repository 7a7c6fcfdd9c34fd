use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

/// Pool of free DNS transaction ids.
///
/// Holds the full 16-bit universe in a uniformly random order and hands ids
/// out LIFO. Randomized initial order resists off-path response guessing;
/// LIFO reuse keeps the in-flight map hot.
pub struct IdAllocator {
	free: Vec<u16>,
}

impl IdAllocator {
	pub fn new() -> Self {
		let mut free: Vec<u16> = (0..=u16::MAX).collect();
		free.shuffle(&mut rand::thread_rng());
		IdAllocator { free }
	}

	pub fn take(&mut self) -> Option<u16> {
		self.free.pop()
	}

	/// Return an id to the pool. The id must have come from `take`.
	pub fn release(&mut self, id: u16) {
		debug_assert!(!self.free.contains(&id), "duplicate release of id {id}");
		self.free.push(id);
	}

	pub fn len(&self) -> usize {
		self.free.len()
	}

	pub fn is_empty(&self) -> bool {
		self.free.is_empty()
	}
}

impl Default for IdAllocator {
	fn default() -> Self {
		Self::new()
	}
}

/// Outstanding queries keyed by transaction id, each carrying its send time.
pub struct InFlightTable {
	entries: HashMap<u16, Instant>,
}

impl InFlightTable {
	pub fn new() -> Self {
		InFlightTable {
			// sized for the whole id universe
			entries: HashMap::with_capacity(usize::from(u16::MAX) + 1),
		}
	}

	pub fn insert(&mut self, id: u16, sent_at: Instant) {
		debug_assert!(!self.entries.contains_key(&id), "id {id} already in flight");
		self.entries.insert(id, sent_at);
	}

	/// Match a response against an outstanding query.
	///
	/// Removes the entry and returns the elapsed latency, or None when the id
	/// is not in flight (a bad receive; the table is unchanged).
	pub fn complete(&mut self, id: u16, now: Instant) -> Option<Duration> {
		self.entries
			.remove(&id)
			.map(|sent_at| now.saturating_duration_since(sent_at))
	}

	/// Remove and return every id whose age reached `timeout`, or every id
	/// when `hard_reset` is set (a dead TCP connection expires everything).
	pub fn sweep(&mut self, now: Instant, timeout: Duration, hard_reset: bool) -> Vec<u16> {
		let expired: Vec<u16> = self
			.entries
			.iter()
			.filter(|(_, &sent_at)| {
				hard_reset || now.saturating_duration_since(sent_at) >= timeout
			})
			.map(|(&id, _)| id)
			.collect();
		for id in &expired {
			self.entries.remove(id);
		}
		expired
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

impl Default for InFlightTable {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_allocator_covers_universe() {
		let mut alloc = IdAllocator::new();
		assert_eq!(alloc.len(), 65536);
		let mut seen = vec![false; 65536];
		while let Some(id) = alloc.take() {
			assert!(!seen[id as usize], "id {id} handed out twice");
			seen[id as usize] = true;
		}
		assert!(seen.iter().all(|&s| s));
	}

	#[test]
	fn test_release_restores_pool() {
		let mut alloc = IdAllocator::new();
		let id = alloc.take().unwrap();
		assert_eq!(alloc.len(), 65535);
		alloc.release(id);
		assert_eq!(alloc.len(), 65536);
	}

	#[test]
	fn test_complete_measures_latency() {
		let mut table = InFlightTable::new();
		let t0 = Instant::now();
		table.insert(42, t0);
		let latency = table.complete(42, t0 + Duration::from_millis(7)).unwrap();
		assert_eq!(latency, Duration::from_millis(7));
		assert!(table.is_empty());
	}

	#[test]
	fn test_complete_unknown_id_is_none() {
		let mut table = InFlightTable::new();
		table.insert(1, Instant::now());
		assert!(table.complete(2, Instant::now()).is_none());
		assert_eq!(table.len(), 1);
	}

	#[test]
	fn test_sweep_expires_only_old_entries() {
		let mut table = InFlightTable::new();
		let t0 = Instant::now();
		table.insert(1, t0);
		table.insert(2, t0 + Duration::from_secs(2));
		let expired = table.sweep(t0 + Duration::from_secs(3), Duration::from_secs(3), false);
		assert_eq!(expired, vec![1]);
		assert_eq!(table.len(), 1);
	}

	#[test]
	fn test_hard_reset_expires_everything() {
		let mut table = InFlightTable::new();
		let t0 = Instant::now();
		table.insert(1, t0);
		table.insert(2, t0);
		let mut expired = table.sweep(t0, Duration::from_secs(3), true);
		expired.sort_unstable();
		assert_eq!(expired, vec![1, 2]);
		assert!(table.is_empty());
	}

	#[test]
	fn test_allocator_and_table_stay_disjoint() {
		let mut alloc = IdAllocator::new();
		let mut table = InFlightTable::new();
		let now = Instant::now();
		for _ in 0..100 {
			let id = alloc.take().unwrap();
			table.insert(id, now);
		}
		assert_eq!(alloc.len() + table.len(), 65536);
		for id in table.sweep(now, Duration::ZERO, true) {
			alloc.release(id);
		}
		assert_eq!(alloc.len(), 65536);
	}
}
