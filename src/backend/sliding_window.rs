use crate::backend::window::WindowCounter;
use crate::backend::{Backend, Decision};
use crate::config::{self, ConfigError, RateLimitConfig};
use crate::HeaderCompatibleOutput;
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use parking_lot::{RwLock, RwLockReadGuard};
use std::convert::Infallible;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A Sliding Window rate limiter [Backend] that keeps its counters in memory.
///
/// Requests are counted per key in fixed windows. The effective count for a key blends the
/// current window and the one before it, weighted by how much of each falls within the sliding
/// window ending now:
///
/// ```text
/// estimate = round(current * current_fraction) + round(previous * previous_fraction)
/// ```
///
/// where `current_fraction` is the elapsed share of the current window and `previous_fraction`
/// is `1 - current_fraction` (or less, if the previous window ended before the current one
/// started). Rounding is half away from zero. A request is denied when the estimate, including
/// the request itself, exceeds `max_requests`.
///
/// The backend is a cheap handle: clones share the same counters.
#[derive(Clone)]
pub struct SlidingWindowBackend {
    inner: Arc<Inner>,
    _roller: Option<Arc<Roller>>,
}

struct Inner {
    window_length: Duration,
    max_requests: u64,
    windows: RwLock<Windows>,
}

struct Windows {
    current: WindowCounter,
    previous: WindowCounter,
}

/// Aborts the background roll task once the last backend handle is gone.
struct Roller(JoinHandle<()>);

impl Drop for Roller {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Output from a [SlidingWindowBackend].
#[derive(Debug, Clone)]
pub struct SlidingWindowOutput {
    /// Total number of requests permitted within the sliding window.
    pub limit: u64,
    /// Interpolated number of requests in the sliding window, including this one.
    pub estimate: u64,
    /// Number of further requests that would currently be permitted.
    pub remaining: u64,
    /// Instant by which every request counted so far has left the sliding window.
    ///
    /// This is one window length after the end of the current window: by then the current window
    /// has rolled over and its successor has too, so none of its counts carry any weight. The
    /// limit can free up earlier than this as the current window fades, but never later.
    pub reset: Instant,
}

impl HeaderCompatibleOutput for SlidingWindowOutput {
    fn limit(&self) -> u64 {
        self.limit
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Seconds until [SlidingWindowOutput::reset] (rounded upwards).
    fn seconds_until_reset(&self) -> u64 {
        let millis = self
            .reset
            .saturating_duration_since(Instant::now())
            .as_millis() as f64;
        (millis / 1000f64).ceil() as u64
    }
}

impl Windows {
    fn new(window_length: Duration, now: Instant) -> Self {
        // An empty previous window that ends exactly where the first one begins, so the very
        // first window is weighted the same way as every later one.
        let previous_start = now.checked_sub(window_length).unwrap_or(now);
        Self {
            current: WindowCounter::new(window_length, now),
            previous: WindowCounter::new(window_length, previous_start),
        }
    }

    fn roll(&mut self, window_length: Duration, now: Instant) -> bool {
        if !self.current.is_expired(now) {
            return false;
        }
        let next = WindowCounter::new(window_length, now);
        self.previous = std::mem::replace(&mut self.current, next);
        true
    }
}

impl Inner {
    fn roll(&self, now: Instant) -> bool {
        let rolled = self.windows.write().roll(self.window_length, now);
        if rolled {
            log::trace!("Rolled over rate limit window");
        }
        rolled
    }

    /// Shared access to a window pair whose current window contains `now`.
    fn windows_at(&self, now: Instant) -> RwLockReadGuard<'_, Windows> {
        loop {
            let windows = self.windows.read();
            if !windows.current.is_expired(now) {
                return windows;
            }
            drop(windows);
            self.roll(now);
        }
    }

    fn interpolate(&self, windows: &Windows, current: u64, previous: u64, now: Instant) -> u64 {
        let length = self.window_length.as_secs_f64();
        let elapsed = now.saturating_duration_since(windows.current.start());
        let current_fraction = (elapsed.as_secs_f64() / length).clamp(0.0, 1.0);
        // Share of the span [now - window_length, now) still covered by the previous window.
        let previous_fraction = match windows.previous.end().checked_add(self.window_length) {
            Some(horizon) => {
                (horizon.saturating_duration_since(now).as_secs_f64() / length).clamp(0.0, 1.0)
            }
            None => 1.0 - current_fraction,
        };
        weighted(current, current_fraction) + weighted(previous, previous_fraction)
    }

    fn reset(&self, windows: &Windows) -> Instant {
        let end = windows.current.end();
        end.checked_add(self.window_length).unwrap_or(end)
    }

    fn output(&self, estimate: u64, reset: Instant) -> SlidingWindowOutput {
        SlidingWindowOutput {
            limit: self.max_requests,
            estimate,
            remaining: self.max_requests.saturating_sub(estimate),
            reset,
        }
    }
}

fn weighted(count: u64, fraction: f64) -> u64 {
    (count as f64 * fraction).round() as u64
}

impl SlidingWindowBackend {
    /// # Arguments
    ///
    /// * `window_length`: Length of each counting window.
    /// * `max_requests`: Requests allowed per key within a sliding window.
    pub fn builder(window_length: Duration, max_requests: u64) -> SlidingWindowBackendBuilder {
        SlidingWindowBackendBuilder {
            window_length,
            max_requests,
            background_roll: true,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> SlidingWindowBackendBuilder {
        Self::builder(config.window_length(), config.max_requests)
    }

    pub fn window_length(&self) -> Duration {
        self.inner.window_length
    }

    pub fn max_requests(&self) -> u64 {
        self.inner.max_requests
    }

    /// Count a request for `key` and decide whether it should be admitted.
    pub fn decide(&self, key: &str) -> (Decision, SlidingWindowOutput) {
        self.decide_at(key, Instant::now())
    }

    /// As [SlidingWindowBackend::decide], observed at the instant `now`.
    pub fn decide_at(&self, key: &str, now: Instant) -> (Decision, SlidingWindowOutput) {
        let (estimate, reset) = {
            let windows = self.inner.windows_at(now);
            let current = windows.current.increment(key);
            let previous = windows.previous.get(key);
            let estimate = self.inner.interpolate(&windows, current, previous, now);
            (estimate, self.inner.reset(&windows))
        };
        let allow = estimate <= self.inner.max_requests;
        if !allow {
            log::debug!(
                "Rate limit exceeded for key {key}: estimate {estimate} > {}",
                self.inner.max_requests
            );
        }
        (
            Decision::from_allowed(allow),
            self.inner.output(estimate, reset),
        )
    }

    /// The interpolated request count for `key`, without counting a new request.
    pub fn estimate(&self, key: &str) -> u64 {
        self.estimate_at(key, Instant::now())
    }

    pub fn estimate_at(&self, key: &str, now: Instant) -> u64 {
        let windows = self.inner.windows_at(now);
        let current = windows.current.get(key);
        let previous = windows.previous.get(key);
        self.inner.interpolate(&windows, current, previous, now)
    }

    fn roll_windows(inner: Weak<Inner>) -> JoinHandle<()> {
        actix_web::rt::spawn(async move {
            loop {
                let Some(state) = inner.upgrade() else {
                    return;
                };
                let deadline = state.windows.read().current.end();
                drop(state);

                actix_web::rt::time::sleep_until(deadline).await;

                let Some(state) = inner.upgrade() else {
                    return;
                };
                // A request may already have rolled this window over lazily.
                state.roll(Instant::now());
            }
        })
    }
}

impl Backend<String> for SlidingWindowBackend {
    type Output = SlidingWindowOutput;
    type Error = Infallible;

    async fn request(&self, key: String) -> Result<(Decision, Self::Output), Self::Error> {
        Ok(self.decide(&key))
    }
}

pub struct SlidingWindowBackendBuilder {
    window_length: Duration,
    max_requests: u64,
    background_roll: bool,
}

impl SlidingWindowBackendBuilder {
    /// Whether a background task should roll windows over as soon as they expire.
    ///
    /// Default is true, which requires [build](SlidingWindowBackendBuilder::build) to be called
    /// from within an actix runtime. Without it windows are rolled over lazily by the first
    /// request to observe an expired window, which gives the same decisions.
    pub fn with_background_roll(mut self, enabled: bool) -> Self {
        self.background_roll = enabled;
        self
    }

    pub fn build(self) -> Result<SlidingWindowBackend, ConfigError> {
        config::validate(self.window_length, self.max_requests)?;
        let now = Instant::now();
        let horizon = self.window_length.checked_mul(2);
        if horizon.and_then(|horizon| now.checked_add(horizon)).is_none() {
            return Err(ConfigError::WindowLengthOverflow);
        }
        let inner = Arc::new(Inner {
            window_length: self.window_length,
            max_requests: self.max_requests,
            windows: RwLock::new(Windows::new(self.window_length, now)),
        });
        let roller = self.background_roll.then(|| {
            Arc::new(Roller(SlidingWindowBackend::roll_windows(
                Arc::downgrade(&inner),
            )))
        });
        Ok(SlidingWindowBackend {
            inner,
            _roller: roller,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn backend(window_length: Duration, max_requests: u64) -> SlidingWindowBackend {
        SlidingWindowBackend::builder(window_length, max_requests)
            .with_background_roll(false)
            .build()
            .unwrap()
    }

    fn counter(window_length: Duration, start: Instant, key: &str, count: u64) -> WindowCounter {
        let window = WindowCounter::new(window_length, start);
        for _ in 0..count {
            window.increment(key);
        }
        window
    }

    fn set_windows(backend: &SlidingWindowBackend, current: WindowCounter, previous: WindowCounter) {
        *backend.inner.windows.write() = Windows { current, previous };
    }

    // Far enough ahead that subtracting a few windows never underflows
    fn base() -> Instant {
        Instant::now() + Duration::from_secs(60 * 60 * 2)
    }

    #[test]
    fn test_invalid_config() {
        assert_eq!(
            SlidingWindowBackend::builder(Duration::ZERO, 10)
                .with_background_roll(false)
                .build()
                .err(),
            Some(ConfigError::ZeroWindowLength)
        );
        assert_eq!(
            SlidingWindowBackend::builder(MINUTE, 0)
                .with_background_roll(false)
                .build()
                .err(),
            Some(ConfigError::ZeroMaxRequests)
        );
        assert_eq!(
            SlidingWindowBackend::builder(Duration::MAX, 10)
                .with_background_roll(false)
                .build()
                .err(),
            Some(ConfigError::WindowLengthOverflow)
        );
    }

    #[test]
    fn test_from_config() {
        let config = RateLimitConfig::new(120, 7, Default::default());
        let backend = SlidingWindowBackend::from_config(&config)
            .with_background_roll(false)
            .build()
            .unwrap();
        assert_eq!(backend.window_length(), Duration::from_secs(120));
        assert_eq!(backend.max_requests(), 7);
    }

    #[test]
    fn test_unknown_key() {
        let backend = backend(MINUTE, 1);
        let now = Instant::now() + Duration::from_secs(30);
        assert_eq!(backend.estimate_at("KEY1", now), 0);
        let (decision, output) = backend.decide_at("KEY1", now);
        assert!(decision.is_allowed());
        assert_eq!(output.limit, 1);
    }

    #[test]
    fn test_allow_deny() {
        let start = base();
        let backend = backend(MINUTE, 5);
        set_windows(
            &backend,
            WindowCounter::new(MINUTE, start),
            WindowCounter::new(MINUTE, start - MINUTE),
        );
        // Halfway through the first window each request counts for half
        let now = start + Duration::from_secs(30);
        for _ in 0..10 {
            let (decision, _) = backend.decide_at("KEY1", now);
            assert!(decision.is_allowed());
        }
        // round(11 * 0.5) = 6 > 5
        let (decision, output) = backend.decide_at("KEY1", now);
        assert!(decision.is_denied());
        assert_eq!(output.estimate, 6);
        assert_eq!(output.remaining, 0);
        // Other keys are unaffected
        let (decision, _) = backend.decide_at("KEY2", now);
        assert!(decision.is_allowed());
    }

    #[test]
    fn test_interpolation() {
        let window_length = MINUTE * 20;
        let start = base();
        let now = start + MINUTE * 10;

        let lenient = backend(window_length, 200);
        set_windows(
            &lenient,
            counter(window_length, start, "10.0.0.127", 100),
            counter(window_length, start - window_length, "10.0.0.127", 50),
        );
        // round(100 * 0.5) + round(50 * 0.5)
        assert_eq!(lenient.estimate_at("10.0.0.127", now), 75);
        // round(101 * 0.5) + round(50 * 0.5), rounding half away from zero
        let (decision, output) = lenient.decide_at("10.0.0.127", now);
        assert_eq!(output.estimate, 76);
        assert!(decision.is_allowed());

        let strict = backend(window_length, 50);
        set_windows(
            &strict,
            counter(window_length, start, "10.0.0.127", 100),
            counter(window_length, start - window_length, "10.0.0.127", 50),
        );
        let (decision, output) = strict.decide_at("10.0.0.127", now);
        assert_eq!(output.estimate, 76);
        assert!(decision.is_denied());
    }

    #[test]
    fn test_rollover() {
        let window_length = Duration::from_secs(15 * 60);
        let now = base();
        let backend = backend(window_length, 100);
        let expired_start = now - MINUTE * 35;
        set_windows(
            &backend,
            counter(window_length, expired_start, "KEY1", 3),
            WindowCounter::new(window_length, expired_start - window_length),
        );

        assert!(backend.inner.roll(now));
        // The same expiry must never roll twice
        assert!(!backend.inner.roll(now));

        let windows = backend.inner.windows.read();
        assert_eq!(windows.previous.get("KEY1"), 3);
        assert_eq!(windows.previous.start(), expired_start);
        assert_eq!(windows.previous.end(), now - MINUTE * 20);
        assert!(windows.current.is_empty());
        assert_eq!(windows.current.start(), now);
        assert_eq!(windows.current.end(), now + window_length);
    }

    #[test]
    fn test_decide_rolls_expired_window() {
        let window_length = Duration::from_secs(15 * 60);
        let now = base();
        let backend = backend(window_length, 100);
        set_windows(
            &backend,
            counter(window_length, now - MINUTE * 35, "KEY1", 3),
            WindowCounter::new(window_length, now - MINUTE * 50),
        );

        backend.decide_at("KEY2", now);

        let windows = backend.inner.windows.read();
        assert_eq!(windows.previous.get("KEY1"), 3);
        assert_eq!(windows.current.start(), now);
        assert_eq!(windows.current.get("KEY1"), 0);
        assert_eq!(windows.current.get("KEY2"), 1);
    }

    #[test]
    fn test_no_rollover_before_expiry() {
        let window_length = MINUTE * 60;
        let now = base();
        let backend = backend(window_length, 100);
        let start = now - MINUTE * 30;
        set_windows(
            &backend,
            counter(window_length, start, "KEY1", 3),
            WindowCounter::new(window_length, start - window_length),
        );

        assert!(!backend.inner.roll(now));
        backend.decide_at("KEY1", now);

        let windows = backend.inner.windows.read();
        assert_eq!(windows.current.start(), start);
        assert_eq!(windows.current.end(), start + window_length);
        assert_eq!(windows.previous.start(), start - window_length);
        assert_eq!(windows.previous.end(), start);
        assert_eq!(windows.current.get("KEY1"), 4);
    }

    #[test]
    fn test_idle_gap() {
        let start = base();
        let busy = || {
            let backend = backend(MINUTE, 10);
            set_windows(
                &backend,
                counter(MINUTE, start, "KEY1", 50),
                WindowCounter::new(MINUTE, start - MINUTE),
            );
            backend
        };

        // Half a window after the busy window ended, half of it is still in view
        let backend = busy();
        assert_eq!(backend.estimate_at("KEY1", start + Duration::from_secs(90)), 25);

        // Long after, the stale window is kept but has no weight left
        let backend = busy();
        let now = start + MINUTE * 10;
        let (decision, output) = backend.decide_at("KEY1", now);
        assert!(decision.is_allowed());
        assert_eq!(output.estimate, 0);
        let windows = backend.inner.windows.read();
        assert_eq!(windows.current.start(), now);
        assert_eq!(windows.previous.get("KEY1"), 50);
    }

    #[test]
    fn test_clock_moving_backwards() {
        let start = base();
        let backend = backend(MINUTE, 100);
        set_windows(
            &backend,
            counter(MINUTE, start, "KEY1", 10),
            counter(MINUTE, start - MINUTE, "KEY1", 20),
        );
        // Before the current window started: current has no weight, previous has full weight
        let now = start - Duration::from_secs(30);
        assert_eq!(backend.estimate_at("KEY1", now), 20);
        let windows = backend.inner.windows.read();
        assert_eq!(windows.current.start(), start);
    }

    #[test]
    fn test_concurrent_decisions() {
        const THREADS: u64 = 8;
        const REQUESTS: u64 = 500;
        let backend = backend(MINUTE * 60, u64::MAX);
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                let backend = backend.clone();
                s.spawn(move || {
                    for _ in 0..REQUESTS {
                        backend.decide("KEY1");
                    }
                });
            }
        });
        assert_eq!(
            backend.inner.windows.read().current.get("KEY1"),
            THREADS * REQUESTS
        );
    }

    #[actix_web::test]
    async fn test_lazy_rollover() {
        tokio::time::pause();
        let backend = backend(MINUTE, 100);
        let start = Instant::now();
        backend.decide("KEY1");
        tokio::time::advance(MINUTE).await;
        // Nothing rolls over without a request
        assert_eq!(backend.inner.windows.read().current.start(), start);
        backend.decide("KEY1");
        let windows = backend.inner.windows.read();
        assert_eq!(windows.current.start(), start + MINUTE);
        assert_eq!(windows.previous.get("KEY1"), 1);
        assert_eq!(windows.current.get("KEY1"), 1);
    }

    #[actix_web::test]
    async fn test_background_rollover() {
        tokio::time::pause();
        let backend = SlidingWindowBackend::builder(MINUTE, 100).build().unwrap();
        let start = Instant::now();
        for _ in 0..3 {
            backend.decide("KEY1");
        }

        // Roll over without any request arriving
        tokio::time::advance(MINUTE).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        {
            let windows = backend.inner.windows.read();
            assert!(windows.current.start() >= start + MINUTE);
            assert!(windows.current.is_empty());
            assert_eq!(windows.previous.get("KEY1"), 3);
        }

        // The timer is re-armed for the new window
        tokio::time::advance(MINUTE).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let windows = backend.inner.windows.read();
        assert!(windows.current.start() >= start + MINUTE * 2);
        assert!(windows.previous.is_empty());
    }

    #[actix_web::test]
    async fn test_output() {
        tokio::time::pause();
        let backend = backend(MINUTE, 2);
        let start = Instant::now();
        tokio::time::advance(MINUTE / 2).await;
        let (decision, output) = backend.request("KEY1".to_string()).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(output.limit, 2);
        // round(1 * 0.5) = 1
        assert_eq!(output.estimate, 1);
        assert_eq!(output.remaining, 1);
        assert_eq!(output.reset, start + MINUTE * 2);
        assert_eq!(output.seconds_until_reset(), 90);
    }

    #[actix_web::test]
    async fn test_allowed_again_at_reset() {
        tokio::time::pause();
        let backend = backend(MINUTE, 2);
        tokio::time::advance(Duration::from_secs(59)).await;
        for _ in 0..2 {
            assert!(backend.decide("KEY1").0.is_allowed());
        }
        let (decision, output) = backend.decide("KEY1");
        assert!(decision.is_denied());
        assert_eq!(output.seconds_until_reset(), 61);

        // Just after the window rolls over, the old counts still carry full weight
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(backend.estimate("KEY1"), 3);

        tokio::time::advance(Duration::from_secs(60)).await;
        let (decision, output) = backend.decide("KEY1");
        assert!(decision.is_allowed());
        assert_eq!(output.estimate, 0);
    }
}
