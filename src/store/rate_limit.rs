//! Shared per-second counter logic used by [`super::session_store::SessionStore`]'s
//! rate-limit checks. A plain in-memory sliding-second counter; the Redis
//! implementation reimplements the same window with `INCR`/`EXPIRE` instead,
//! since the counters need to be visible across processes there.

use std::collections::HashMap;
use std::sync::Mutex;

/// Fixed-window (not sliding) per-key counter with a fail-open contract: a
/// poisoned lock or any internal error is treated as "not limited" rather
/// than propagated, since a rate limiter should never itself become the
/// reason a legitimate request is rejected.
pub struct FixedWindowCounter {
    buckets: Mutex<HashMap<String, (i64, u64)>>,
}

impl Default for FixedWindowCounter {
    fn default() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl FixedWindowCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter for `key` in the 1-second window containing
    /// `now_ms`, returning `true` if this call pushed the count past `limit`.
    pub fn hit(&self, key: &str, now_ms: i64, limit: u64) -> bool {
        let epoch_s = now_ms / 1000;
        let Ok(mut buckets) = self.buckets.lock() else {
            return false;
        };
        let entry = buckets.entry(key.to_string()).or_insert((epoch_s, 0));
        if entry.0 != epoch_s {
            *entry = (epoch_s, 0);
        }
        entry.1 += 1;
        entry.1 > limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resets_on_new_second() {
        let counter = FixedWindowCounter::new();
        for _ in 0..5 {
            counter.hit("k", 1_000, 3);
        }
        assert!(!counter.hit("k", 2_000, 3));
    }

    #[test]
    fn trips_past_limit_within_same_second() {
        let counter = FixedWindowCounter::new();
        let mut tripped = false;
        for _ in 0..10 {
            if counter.hit("k", 1_000, 5) {
                tripped = true;
            }
        }
        assert!(tripped);
    }
}
