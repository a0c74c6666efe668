//! Windowed request counters.
//!
//! Time is cut into fixed windows of `period` length; the window index is
//! `floor(now / period)`. The governor only ever looks at the current window
//! (being accumulated) and the one before it (closed), so each identity owns
//! two slots, selected by window parity. Every slot remembers which window it
//! was written for; a slot holding any other window is stale, reads as zero
//! and is overwritten on the next write.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::trace;

/// Compute the window index containing `now`.
///
/// Uses Euclidean division so timestamps before the epoch still floor.
pub fn window_index(now: DateTime<Utc>, period: Duration) -> i64 {
    let period_ms = period_millis(period);
    now.timestamp_millis().div_euclid(period_ms)
}

/// Time left until the window containing `now` closes.
pub fn until_window_end(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period_millis(period);
    let elapsed = now.timestamp_millis().rem_euclid(period_ms);
    Duration::from_millis((period_ms - elapsed) as u64)
}

fn period_millis(period: Duration) -> i64 {
    // Sub-millisecond periods would collapse to zero.
    i64::try_from(period.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    window: i64,
    count: u64,
}

/// Per-identity pair of slots, one per window parity.
#[derive(Debug, Clone, Copy)]
struct WindowPair {
    slots: [Slot; 2],
}

impl WindowPair {
    fn new() -> Self {
        // i64::MIN never equals a real window index, so fresh slots are stale.
        let empty = Slot {
            window: i64::MIN,
            count: 0,
        };
        Self {
            slots: [empty; 2],
        }
    }

    fn parity(window: i64) -> usize {
        window.rem_euclid(2) as usize
    }

    fn count(&self, window: i64) -> u64 {
        let slot = &self.slots[Self::parity(window)];
        if slot.window == window {
            slot.count
        } else {
            0
        }
    }

    fn increment(&mut self, window: i64) -> u64 {
        let slot = &mut self.slots[Self::parity(window)];
        if slot.window != window {
            *slot = Slot { window, count: 0 };
        }
        slot.count += 1;
        slot.count
    }

    /// Whether neither slot holds the current or the previous window.
    fn is_expired(&self, current: i64) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.window != current && slot.window != current - 1)
    }
}

/// Bounded-memory map from identity to its current and previous window counts.
///
/// Thread-safe: operations on one identity are serialized by the map's shard
/// lock, operations on different identities proceed in parallel.
#[derive(Debug, Default)]
pub struct WindowedCounterStore {
    entries: DashMap<String, WindowPair>,
}

impl WindowedCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request for `identity` in the window containing `now` and
    /// return `(current_count, previous_count)`.
    ///
    /// The current count includes this request. The previous window is read
    /// without being created.
    pub fn increment_and_read(
        &self,
        identity: &str,
        period: Duration,
        now: DateTime<Utc>,
    ) -> (u64, u64) {
        let window = window_index(now, period);

        let (current, previous) = match self.entries.get_mut(identity) {
            Some(mut pair) => (pair.increment(window), pair.count(window - 1)),
            None => {
                let mut pair = self
                    .entries
                    .entry(identity.to_string())
                    .or_insert_with(WindowPair::new);
                (pair.increment(window), pair.count(window - 1))
            }
        };

        trace!(
            identity = %identity,
            window = window,
            current = current,
            previous = previous,
            "Counted request"
        );

        (current, previous)
    }

    /// Count recorded for `identity` in the window containing `now`.
    pub fn current_count(&self, identity: &str, period: Duration, now: DateTime<Utc>) -> u64 {
        let window = window_index(now, period);
        self.entries
            .get(identity)
            .map(|pair| pair.count(window))
            .unwrap_or(0)
    }

    /// Count recorded for `identity` in the window before the one containing `now`.
    pub fn previous_count(&self, identity: &str, period: Duration, now: DateTime<Utc>) -> u64 {
        let window = window_index(now, period);
        self.entries
            .get(identity)
            .map(|pair| pair.count(window - 1))
            .unwrap_or(0)
    }

    /// Drop every identity with no count in the current or previous window.
    ///
    /// Returns the number of identities removed.
    pub fn sweep(&self, period: Duration, now: DateTime<Utc>) -> usize {
        let window = window_index(now, period);
        let before = self.entries.len();
        self.entries.retain(|_, pair| !pair.is_expired(window));
        let removed = before.saturating_sub(self.entries.len());

        trace!(window = window, removed = removed, "Swept counter store");
        removed
    }

    /// Number of identities tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no identity is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all counters.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
