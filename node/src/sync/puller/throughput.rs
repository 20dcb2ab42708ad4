//! Throughput estimation and quality scoring.
//!
//! The concurrency budget answers "how many blocks can the whole peer set
//! finish in about one second": aggregate delivery rate divided by the
//! rolling average block size, never below the configured floor.

use std::collections::VecDeque;

/// Fixed-capacity window with a running sum.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    pub fn sum(&self) -> f64 {
        self.sum.max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum() / self.samples.len() as f64)
        }
    }
}

/// Per-peer delivery samples: bytes delivered and seconds each took.
#[derive(Debug, Clone)]
pub struct DeliverySamples {
    bytes: RollingWindow,
    seconds: RollingWindow,
}

/// Floor for a single delay sample, so an instant delivery cannot divide by zero.
const MIN_SAMPLE_SECONDS: f64 = 0.001;

impl DeliverySamples {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: RollingWindow::new(capacity),
            seconds: RollingWindow::new(capacity),
        }
    }

    pub fn record(&mut self, bytes: u64, seconds: f64) {
        self.bytes.push(bytes as f64);
        self.seconds.push(seconds.max(MIN_SAMPLE_SECONDS));
    }

    pub fn has_samples(&self) -> bool {
        !self.seconds.is_empty()
    }

    /// Bytes per second over the window, zero without samples.
    pub fn rate(&self) -> f64 {
        let seconds = self.seconds.sum();
        if seconds <= 0.0 {
            0.0
        } else {
            self.bytes.sum() / seconds
        }
    }
}

/// Best-peer-relative scoring parameters.
#[derive(Debug, Clone, Copy)]
pub struct QualityScoring {
    pub min_score: f64,
    pub max_score: f64,
    /// Ceiling applied to rates once the node has caught up.
    pub caught_up_rate_cap: f64,
}

impl QualityScoring {
    pub fn initial_score(&self) -> f64 {
        (self.min_score + self.max_score) / 2.0
    }

    pub fn clamp(&self, score: f64) -> f64 {
        score.clamp(self.min_score, self.max_score)
    }

    fn effective_rate(&self, rate: f64, initial_block_download: bool) -> f64 {
        if initial_block_download {
            rate
        } else {
            rate.min(self.caught_up_rate_cap)
        }
    }

    /// Baseline rate derived from the fastest peer's rate.
    pub fn baseline(&self, best_rate: f64, initial_block_download: bool) -> f64 {
        self.effective_rate(best_rate, initial_block_download)
    }

    /// Score of a peer delivering at `rate` against `baseline`.
    pub fn score(&self, rate: f64, baseline: f64, initial_block_download: bool) -> f64 {
        if baseline <= 0.0 {
            return self.min_score;
        }
        self.clamp(self.effective_rate(rate, initial_block_download) / baseline)
    }
}

/// Rolling block size average and the derived concurrency budget.
#[derive(Debug, Clone)]
pub struct ThroughputEstimator {
    block_sizes: RollingWindow,
    floor: usize,
    max_concurrent: usize,
}

impl ThroughputEstimator {
    pub fn new(block_size_samples: usize, floor: usize) -> Self {
        let floor = floor.max(1);
        Self {
            block_sizes: RollingWindow::new(block_size_samples),
            floor,
            max_concurrent: floor,
        }
    }

    pub fn record_block_size(&mut self, bytes: u64) {
        self.block_sizes.push(bytes as f64);
    }

    pub fn average_block_size(&self) -> Option<f64> {
        self.block_sizes.average()
    }

    /// Recompute the budget from the aggregate rate of every registered peer.
    pub fn update_budget(&mut self, aggregate_rate: f64) -> usize {
        if let Some(average) = self.average_block_size().filter(|avg| *avg > 0.0) {
            let estimate = (aggregate_rate.max(0.0) / average) as usize;
            self.max_concurrent = estimate.max(self.floor);
        }
        self.max_concurrent
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_window_evicts_oldest() {
        let mut window = RollingWindow::new(3);
        for value in [1.0, 2.0, 3.0, 10.0] {
            window.push(value);
        }
        assert!((window.sum() - 15.0).abs() < 1e-9);
        assert!((window.average().unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn delivery_rate_is_bytes_over_seconds() {
        let mut samples = DeliverySamples::new(10);
        assert!(!samples.has_samples());
        assert_eq!(samples.rate(), 0.0);
        samples.record(1_000, 1.0);
        samples.record(3_000, 1.0);
        assert!((samples.rate() - 2_000.0).abs() < 1e-9);
        samples.record(0, 2.0);
        assert!((samples.rate() - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn budget_never_drops_below_floor() {
        let mut estimator = ThroughputEstimator::new(1000, 10);
        assert_eq!(estimator.update_budget(1_000_000.0), 10);
        estimator.record_block_size(1_000);
        assert_eq!(estimator.update_budget(50_000.0), 50);
        assert_eq!(estimator.update_budget(2_000.0), 10);
        assert_eq!(estimator.max_concurrent(), 10);
    }

    #[test]
    fn caught_up_cap_limits_baseline_and_peer_rate() {
        let scoring = QualityScoring {
            min_score: 0.01,
            max_score: 1.0,
            caught_up_rate_cap: 100.0,
        };
        assert_eq!(scoring.baseline(1_000.0, true), 1_000.0);
        assert_eq!(scoring.baseline(1_000.0, false), 100.0);
        assert!((scoring.score(50.0, 1_000.0, true) - 0.05).abs() < 1e-9);
        // Once caught up, both the fast peer and a merely decent one saturate.
        assert_eq!(scoring.score(1_000.0, 100.0, false), 1.0);
        assert_eq!(scoring.score(200.0, 100.0, false), 1.0);
        assert!((scoring.score(50.0, 100.0, false) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn scores_are_clamped() {
        let scoring = QualityScoring {
            min_score: 0.01,
            max_score: 1.0,
            caught_up_rate_cap: f64::MAX,
        };
        assert_eq!(scoring.score(0.0, 10.0, true), 0.01);
        assert_eq!(scoring.score(10.0, 0.0, true), 0.01);
        assert!((scoring.initial_score() - 0.505).abs() < 1e-9);
    }
}
