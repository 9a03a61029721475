//! Protocol timers.
//!
//! A deterministic timer queue owned by the host, driven by whatever clock
//! the embedding supplies: the real-network node feeds it wall-clock
//! instants, the test simulator virtual ones. Timers carry the exponential
//! backoff and hard-failure semantics retransmission logic needs: firing
//! reports whether the hard deadline has passed.

use core::cmp::Reverse;
use core::time::Duration;
use std::collections::BinaryHeap;
use std::time::Instant;

use hashbrown::HashMap;

/// Default initial retry interval.
pub const RETRY_MIN: Duration = Duration::from_millis(500);

/// Default maximum backed-off retry interval.
pub const RETRY_MAX: Duration = Duration::from_secs(60);

/// Default hard failure deadline.
pub const FAIL_MAX: Duration = Duration::from_secs(20);

/// Handle to a scheduled timer. The default value refers to no timer.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct TimerKey(u64);

struct Entry<T> {
	target: T,
	deadline: Instant,
	interval: Duration,
	cap: Duration,
	fail_at: Option<Instant>,
	armed: bool,
	oneshot: bool,
}

pub struct Timers<T> {
	heap: BinaryHeap<Reverse<(Instant, u64)>>,
	entries: HashMap<u64, Entry<T>>,
	next: u64,
}

impl<T: Clone> Timers<T> {
	pub fn new() -> Self {
		Self { heap: BinaryHeap::new(), entries: HashMap::new(), next: 1 }
	}

	fn insert(&mut self, entry: Entry<T>) -> TimerKey {
		let id = self.next;
		self.next += 1;

		self.heap.push(Reverse((entry.deadline, id)));
		self.entries.insert(id, entry);
		TimerKey(id)
	}

	/// Schedule a one-shot timer; the entry is removed when it fires.
	pub fn once(&mut self, now: Instant, after: Duration, target: T) -> TimerKey {
		self.insert(Entry {
			target,
			deadline: now + after,
			interval: after,
			cap: after,
			fail_at: None,
			armed: true,
			oneshot: true,
		})
	}

	/// Schedule a retry timer with exponential backoff and an optional hard
	/// failure deadline. The timer stays allocated across fires; callers
	/// either `restart` it (doubling the interval) or `stop` it.
	pub fn retry(&mut self, now: Instant, interval: Duration, cap: Duration, fail: Option<Duration>, target: T) -> TimerKey {
		self.insert(Entry {
			target,
			deadline: now + interval,
			interval,
			cap,
			fail_at: fail.map(|f| now + f),
			armed: true,
			oneshot: false,
		})
	}

	/// Re-arm a retry timer at double the previous interval, capped.
	pub fn restart(&mut self, key: TimerKey, now: Instant) {
		if let Some(e) = self.entries.get_mut(&key.0) {
			e.interval = (e.interval * 2).min(e.cap);
			e.deadline = now + e.interval;
			e.armed = true;
			self.heap.push(Reverse((e.deadline, key.0)));
		}
	}

	/// Re-arm a timer at a fresh interval, resetting backoff but keeping the
	/// hard deadline untouched.
	pub fn rearm(&mut self, key: TimerKey, now: Instant, interval: Duration) {
		if let Some(e) = self.entries.get_mut(&key.0) {
			e.interval = interval.min(e.cap);
			e.deadline = now + e.interval;
			e.armed = true;
			self.heap.push(Reverse((e.deadline, key.0)));
		}
	}

	/// Push the hard failure deadline out to `now + fail`.
	pub fn reset_fail(&mut self, key: TimerKey, now: Instant, fail: Duration) {
		if let Some(e) = self.entries.get_mut(&key.0) {
			e.fail_at = Some(now + fail);
		}
	}

	pub fn stop(&mut self, key: TimerKey) {
		self.entries.remove(&key.0);
	}

	pub fn is_active(&self, key: TimerKey) -> bool {
		self.entries.get(&key.0).is_some_and(|e| e.armed)
	}

	/// The earliest armed deadline, if any.
	pub fn next_deadline(&self) -> Option<Instant> {
		self.entries.values().filter(|e| e.armed).map(|e| e.deadline).min()
	}

	/// Collect every timer due at `now`. Fired retry timers stay allocated
	/// but disarmed until restarted or stopped; the `bool` reports whether
	/// the hard failure deadline has passed.
	pub fn expire(&mut self, now: Instant) -> Vec<(TimerKey, T, bool)> {
		let mut fired = Vec::new();

		while let Some(&Reverse((t, id))) = self.heap.peek() {
			if t > now {
				break;
			}
			self.heap.pop();

			// Heap nodes are lazily invalidated: skip stale ones.
			let Some(e) = self.entries.get_mut(&id) else { continue };
			if !e.armed || e.deadline != t {
				continue;
			}

			e.armed = false;
			let failed = e.fail_at.is_some_and(|f| f <= now);
			fired.push((TimerKey(id), e.target.clone(), failed));

			if e.oneshot {
				self.entries.remove(&id);
			}
		}

		fired
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_doubles_to_cap() {
		let t0 = Instant::now();
		let mut timers: Timers<u8> = Timers::new();

		let k = timers.retry(t0, Duration::from_millis(500), Duration::from_secs(4), None, 1);

		let mut at = t0;
		let mut intervals = Vec::new();

		for _ in 0..5 {
			at = timers.next_deadline().unwrap();
			intervals.push(at - t0);
			assert_eq!(timers.expire(at).len(), 1);
			timers.restart(k, t0);
		}

		// 500ms, then doubling, capped at 4s.
		assert_eq!(intervals[0], Duration::from_millis(500));
		assert_eq!(timers.entries[&1].interval, Duration::from_secs(4));
	}

	#[test]
	fn hard_failure_flag() {
		let t0 = Instant::now();
		let mut timers: Timers<u8> = Timers::new();

		let k = timers.retry(t0, Duration::from_secs(1), Duration::from_secs(60), Some(Duration::from_secs(3)), 9);

		let fired = timers.expire(t0 + Duration::from_secs(1));
		assert_eq!(fired, vec![(k, 9, false)]);

		timers.restart(k, t0 + Duration::from_secs(1));
		let fired = timers.expire(t0 + Duration::from_secs(4));
		assert_eq!(fired, vec![(k, 9, true)]);
	}

	#[test]
	fn oneshot_is_removed() {
		let t0 = Instant::now();
		let mut timers: Timers<u8> = Timers::new();

		timers.once(t0, Duration::from_millis(10), 3);
		assert_eq!(timers.expire(t0 + Duration::from_millis(10)).len(), 1);
		assert!(timers.next_deadline().is_none());
	}

	#[test]
	fn stopped_timers_do_not_fire() {
		let t0 = Instant::now();
		let mut timers: Timers<u8> = Timers::new();

		let k = timers.once(t0, Duration::from_millis(10), 3);
		timers.stop(k);
		assert!(timers.expire(t0 + Duration::from_secs(1)).is_empty());
	}
}
