//! Rolling per-transfer throughput monitor (C5, spec §4.4): keeps the last
//! 10 bytes/sec samples and exposes scale-up / scale-down hints the
//! orchestrator can use to adjust in-flight concurrency.

use std::collections::VecDeque;

const WINDOW: usize = 10;
const SCALE_UP_MIN_AVG_BYTES_PER_SEC: f64 = 10.0 * 1024.0 * 1024.0;
const SCALE_UP_MAX_VARIANCE_BYTES_PER_SEC: f64 = 2.0 * 1024.0 * 1024.0;
const SCALE_DOWN_RATIO: f64 = 0.8;

#[derive(Debug, Default)]
pub struct ThroughputMonitor {
    samples: VecDeque<f64>,
}

impl ThroughputMonitor {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW),
        }
    }

    pub fn record(&mut self, bytes_per_sec: f64) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(bytes_per_sec);
    }

    fn mean(samples: &[f64]) -> f64 {
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        }
    }

    fn variance(samples: &[f64], mean: f64) -> f64 {
        if samples.len() < 2 {
            return 0.0;
        }
        samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64
    }

    /// `true` when the window average exceeds 10 MB/s and its variance is
    /// under 2 MB/s — a sustained, stable transfer that can take more
    /// concurrency.
    pub fn should_scale_up(&self) -> bool {
        if self.samples.len() < WINDOW {
            return false;
        }
        let samples: Vec<f64> = self.samples.iter().copied().collect();
        let mean = Self::mean(&samples);
        let variance = Self::variance(&samples, mean);
        mean > SCALE_UP_MIN_AVG_BYTES_PER_SEC && variance.sqrt() < SCALE_UP_MAX_VARIANCE_BYTES_PER_SEC
    }

    /// `true` when the most recent 3-sample average has dropped below 80%
    /// of the previous 3-sample average — throughput is degrading and
    /// concurrency should back off.
    pub fn should_scale_down(&self) -> bool {
        if self.samples.len() < 6 {
            return false;
        }
        let samples: Vec<f64> = self.samples.iter().copied().collect();
        let len = samples.len();
        let recent = &samples[len - 3..];
        let previous = &samples[len - 6..len - 3];
        let recent_avg = Self::mean(recent);
        let previous_avg = Self::mean(previous);
        previous_avg > 0.0 && recent_avg < previous_avg * SCALE_DOWN_RATIO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_monitor_gives_no_hints() {
        let monitor = ThroughputMonitor::new();
        assert!(!monitor.should_scale_up());
        assert!(!monitor.should_scale_down());
    }

    #[test]
    fn sustained_high_stable_throughput_triggers_scale_up() {
        let mut monitor = ThroughputMonitor::new();
        for _ in 0..WINDOW {
            monitor.record(20.0 * 1024.0 * 1024.0);
        }
        assert!(monitor.should_scale_up());
    }

    #[test]
    fn noisy_throughput_does_not_trigger_scale_up() {
        let mut monitor = ThroughputMonitor::new();
        for i in 0..WINDOW {
            let jitter = if i % 2 == 0 { 40.0 } else { 1.0 };
            monitor.record(jitter * 1024.0 * 1024.0);
        }
        assert!(!monitor.should_scale_up());
    }

    #[test]
    fn dropping_throughput_triggers_scale_down() {
        let mut monitor = ThroughputMonitor::new();
        for _ in 0..3 {
            monitor.record(20.0 * 1024.0 * 1024.0);
        }
        for _ in 0..3 {
            monitor.record(5.0 * 1024.0 * 1024.0);
        }
        assert!(monitor.should_scale_down());
    }

    #[test]
    fn stable_throughput_does_not_trigger_scale_down() {
        let mut monitor = ThroughputMonitor::new();
        for _ in 0..6 {
            monitor.record(10.0 * 1024.0 * 1024.0);
        }
        assert!(!monitor.should_scale_down());
    }
}
