use std::time::Duration;

use tokio::time::Instant;

/// Deferred messages keyed by `K`, scheduled against the monotonic clock.
///
/// At most one timer per key is outstanding: starting a running key restarts
/// it. Cancelling an unknown or already fired key is a no-op.
#[derive(Debug, Clone)]
pub struct TimerQueue<K> {
    entries: Vec<(Instant, u64, K)>,
    sequence: u64,
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            sequence: 0,
        }
    }
}

impl<K: Copy + Eq> TimerQueue<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) `key` to fire `after` from now.
    pub fn start(&mut self, key: K, after: Duration) {
        self.start_at(key, Instant::now() + after);
    }

    /// Starts (or restarts) `key` to fire at `deadline`.
    pub fn start_at(&mut self, key: K, deadline: Instant) {
        self.cancel(key);
        self.sequence += 1;
        self.entries.push((deadline, self.sequence, key));
    }

    /// Cancels `key`, returning whether it was running.
    pub fn cancel(&mut self, key: K) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(_, _, entry)| *entry != key);
        before != self.entries.len()
    }

    #[must_use]
    pub fn is_running(&self, key: K) -> bool {
        self.entries.iter().any(|(_, _, entry)| *entry == key)
    }

    /// Earliest deadline among running timers.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|(deadline, _, _)| *deadline).min()
    }

    /// Removes and returns every key due at `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<K> {
        let mut due: Vec<(Instant, u64, K)> = Vec::new();
        self.entries.retain(|entry| {
            if entry.0 <= now {
                due.push(*entry);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(deadline, sequence, _)| (*deadline, *sequence));
        due.into_iter().map(|(_, _, key)| key).collect()
    }
}
