//! Phi-accrual failure detection.
//!
//! The detector keeps a bounded window of heartbeat inter-arrival times and
//! fits a normal distribution to it. `phi` expresses how unlikely the current
//! silence is under that distribution as `-log10(p)`, so a phi of 3 means a
//! one-in-a-thousand chance that the node is merely slow.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Default phi value at or above which a node is considered unavailable.
pub const DEFAULT_PHI_THRESHOLD: f64 = 16.0;
/// Default number of intervals retained in the sliding window.
pub const DEFAULT_WINDOW_CAPACITY: usize = 1000;
/// Default number of intervals required before phi becomes non-zero.
pub const DEFAULT_MIN_SAMPLES: usize = 1;
/// Default floor applied to the standard deviation of the window.
pub const DEFAULT_MIN_STD_DEVIATION: Duration = Duration::from_millis(500);

/// Tuning knobs for [`PhiFailureDetector`].
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorConfig {
    pub threshold: f64,
    pub capacity: usize,
    pub min_samples: usize,
    pub min_std_deviation: Duration,
    /// Extra silence tolerated on top of the observed mean.
    pub acceptable_pause: Duration,
    /// Seed interval recorded at construction, usually the heartbeat interval.
    pub first_heartbeat_estimate: Option<Duration>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_PHI_THRESHOLD,
            capacity: DEFAULT_WINDOW_CAPACITY,
            min_samples: DEFAULT_MIN_SAMPLES,
            min_std_deviation: DEFAULT_MIN_STD_DEVIATION,
            acceptable_pause: Duration::ZERO,
            first_heartbeat_estimate: None,
        }
    }
}

impl DetectorConfig {
    /// Override the phi threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Seed the window with the expected heartbeat interval.
    pub fn with_first_heartbeat_estimate(mut self, estimate: Duration) -> Self {
        self.first_heartbeat_estimate = Some(estimate);
        self
    }
}

/// Sliding-window phi-accrual failure detector for one node.
#[derive(Debug)]
pub struct PhiFailureDetector {
    config: DetectorConfig,
    intervals: VecDeque<f64>,
    sum: f64,
    sum_squares: f64,
    last_heartbeat: Instant,
}

impl PhiFailureDetector {
    /// Create a detector whose silence is measured from `now`.
    pub fn new(config: DetectorConfig, now: Instant) -> Self {
        let mut detector = Self {
            intervals: VecDeque::with_capacity(config.capacity.min(64)),
            sum: 0.0,
            sum_squares: 0.0,
            last_heartbeat: now,
            config,
        };
        if let Some(estimate) = detector.config.first_heartbeat_estimate {
            detector.push_interval(millis(estimate));
        }
        detector
    }

    /// Record a heartbeat observed at `now`.
    pub fn record(&mut self, now: Instant) {
        let interval = now.saturating_duration_since(self.last_heartbeat);
        self.push_interval(millis(interval));
        self.last_heartbeat = self.last_heartbeat.max(now);
    }

    fn push_interval(&mut self, interval: f64) {
        while self.intervals.len() >= self.config.capacity.max(1) {
            if let Some(oldest) = self.intervals.pop_front() {
                self.sum -= oldest;
                self.sum_squares -= oldest * oldest;
            }
        }
        self.intervals.push_back(interval);
        self.sum += interval;
        self.sum_squares += interval * interval;
    }

    /// Drop every sample and restart the silence clock at `now`.
    pub fn clear(&mut self, now: Instant) {
        self.intervals.clear();
        self.sum = 0.0;
        self.sum_squares = 0.0;
        self.last_heartbeat = now;
    }

    /// Number of intervals currently in the window.
    pub fn sample_size(&self) -> usize {
        self.intervals.len()
    }

    /// Instant of the most recent heartbeat (or construction/clear).
    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }

    /// Duration since the last heartbeat.
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    /// Configured suspicion threshold.
    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    /// Mean interval in milliseconds.
    pub fn mean(&self) -> f64 {
        if self.intervals.is_empty() {
            return 0.0;
        }
        self.sum / self.intervals.len() as f64
    }

    /// Standard deviation of the window in milliseconds, before clamping.
    pub fn std_deviation(&self) -> f64 {
        if self.intervals.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self.sum_squares / self.intervals.len() as f64 - mean * mean;
        variance.max(0.0).sqrt()
    }

    /// Suspicion level for a node silent since the last heartbeat.
    ///
    /// Returns `0.0` until `min_samples` intervals have been recorded.
    pub fn phi(&self, now: Instant) -> f64 {
        if self.intervals.len() < self.config.min_samples.max(1) {
            return 0.0;
        }
        let elapsed = millis(self.silence(now));
        let mean = self.mean() + millis(self.config.acceptable_pause);
        let std_dev = self
            .std_deviation()
            .max(millis(self.config.min_std_deviation))
            .max(f64::EPSILON);
        phi_of(elapsed, mean, std_dev)
    }

    /// True when `phi(now)` has reached the threshold.
    pub fn is_suspect(&self, now: Instant) -> bool {
        self.phi(now) >= self.config.threshold
    }
}

/// Logistic approximation of the normal tail, as used by Akka and Cassandra.
fn phi_of(elapsed: f64, mean: f64, std_dev: f64) -> f64 {
    let y = (elapsed - mean) / std_dev;
    let e = (-y * (1.5976 + 0.070566 * y * y)).exp();
    let p_later = if elapsed > mean {
        e / (1.0 + e)
    } else {
        1.0 - 1.0 / (1.0 + e)
    };
    let phi = -p_later.log10();
    if phi.is_nan() { 0.0 } else { phi.max(0.0) }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
