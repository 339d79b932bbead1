use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default spacing between repeated heartbeat failure warnings.
pub const DEFAULT_WARN_INTERVAL: Duration = Duration::from_secs(5);

const NEVER: u64 = u64::MAX;

/// Coalesces repeated failures into periodic warnings.
///
/// Callers count failures with [`record`](Self::record); the next call to
/// [`warn_if_due`](Self::warn_if_due) reports the accumulated count once the
/// interval has elapsed since the previous report. [`flush`](Self::flush)
/// reports immediately.
pub struct RateLimitedWarner {
    origin: Instant,
    interval: Duration,
    last_warn_ms: AtomicU64,
    pending: AtomicU64,
}

impl Default for RateLimitedWarner {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_INTERVAL)
    }
}

impl RateLimitedWarner {
    /// The first warning is always due.
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            interval,
            last_warn_ms: AtomicU64::new(NEVER),
            pending: AtomicU64::new(0),
        }
    }

    /// Count one failure.
    pub fn record(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Failures recorded since the last report.
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    fn elapsed_ms(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.origin).as_millis()).unwrap_or(NEVER - 1)
    }

    /// Report pending failures if the interval has elapsed at `now`.
    pub fn warn_if_due(&self, now: Instant, mut warn: impl FnMut(u64)) {
        let now_ms = self.elapsed_ms(now);
        let prev = self.last_warn_ms.load(Ordering::Relaxed);
        let interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(NEVER - 1);
        if prev != NEVER && now_ms.saturating_sub(prev) < interval_ms {
            return;
        }
        let count = self.pending.swap(0, Ordering::Relaxed);
        if count > 0 {
            warn(count);
            self.last_warn_ms.store(now_ms, Ordering::Relaxed);
        }
    }

    /// Report pending failures immediately.
    pub fn flush(&self, mut warn: impl FnMut(u64)) {
        let count = self.pending.swap(0, Ordering::Relaxed);
        if count > 0 {
            warn(count);
            self.last_warn_ms
                .store(self.elapsed_ms(Instant::now()), Ordering::Relaxed);
        }
    }
}
