use actix_web::rt::time::Instant;
use dashmap::DashMap;
use std::time::Duration;

/// Per-key request counts for one fixed window `[start, end)`.
///
/// Counts only ever increase during the lifetime of a window; a fresh window is created at every
/// rollover instead of resetting an old one.
#[derive(Debug)]
pub struct WindowCounter {
    counts: DashMap<String, u64>,
    start: Instant,
    end: Instant,
}

impl WindowCounter {
    pub fn new(window_length: Duration, now: Instant) -> Self {
        Self {
            counts: DashMap::new(),
            start: now,
            end: now + window_length,
        }
    }

    /// Increments the count for `key`, returning the updated value.
    pub fn increment(&self, key: &str) -> u64 {
        if let Some(mut count) = self.counts.get_mut(key) {
            *count += 1;
            return *count;
        }
        let mut count = self.counts.entry(key.to_owned()).or_insert(0);
        *count += 1;
        *count
    }

    /// The count for `key`, or zero if it has never been seen in this window.
    pub fn get(&self, key: &str) -> u64 {
        self.counts.get(key).map(|count| *count).unwrap_or(0)
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn end(&self) -> Instant {
        self.end
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.end
    }

    /// Number of distinct keys counted in this window.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
