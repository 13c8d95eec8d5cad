//! Pump statistics
//!
//! Counters for the capture/encode/broadcast loop with periodic structured
//! logging. Rates are computed over the interval since the last report so a
//! long-running pump does not average away regressions.

use std::time::{Duration, Instant};

use tracing::info;

/// Rates derived from an interval's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalRates {
    pub fps: f64,
    pub bitrate: u64,
}

/// Compute fps and bitrate (bits/sec) for an interval.
pub fn interval_rates(frames: u64, bytes: u64, elapsed: Duration) -> IntervalRates {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return IntervalRates {
            fps: 0.0,
            bitrate: 0,
        };
    }
    IntervalRates {
        fps: frames as f64 / secs,
        bitrate: ((bytes * 8) as f64 / secs) as u64,
    }
}

/// Running counters for one pump session.
#[derive(Debug)]
pub struct PumpStats {
    report_interval: Duration,
    last_report: Instant,
    interval_frames: u64,
    interval_bytes: u64,
    pub total_frames: u64,
    pub total_keyframes: u64,
    pub total_bytes: u64,
}

impl PumpStats {
    pub fn new(report_interval: Duration) -> Self {
        Self {
            report_interval,
            last_report: Instant::now(),
            interval_frames: 0,
            interval_bytes: 0,
            total_frames: 0,
            total_keyframes: 0,
            total_bytes: 0,
        }
    }

    /// Record one broadcast encoded unit.
    pub fn record(&mut self, bytes: usize, keyframe: bool, viewers: usize) {
        self.total_frames += 1;
        self.total_bytes += bytes as u64;
        self.interval_frames += 1;
        self.interval_bytes += bytes as u64;
        if keyframe {
            self.total_keyframes += 1;
        }

        let elapsed = self.last_report.elapsed();
        if elapsed >= self.report_interval {
            let rates = interval_rates(self.interval_frames, self.interval_bytes, elapsed);
            info!(
                fps = rates.fps,
                kbps = rates.bitrate / 1000,
                viewers,
                frames = self.total_frames,
                keyframes = self.total_keyframes,
                "pump stats"
            );
            self.last_report = Instant::now();
            self.interval_frames = 0;
            self.interval_bytes = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_rates() {
        let rates = interval_rates(50, 625_000, Duration::from_secs(2));
        assert!((rates.fps - 25.0).abs() < f64::EPSILON);
        assert_eq!(rates.bitrate, 2_500_000);
    }

    #[test]
    fn test_interval_rates_zero_elapsed() {
        let rates = interval_rates(10, 1000, Duration::ZERO);
        assert_eq!(rates.fps, 0.0);
        assert_eq!(rates.bitrate, 0);
    }

    #[test]
    fn test_counters_accumulate() {
        let mut stats = PumpStats::new(Duration::from_secs(3600));
        stats.record(1000, true, 1);
        stats.record(500, false, 1);
        stats.record(500, false, 1);

        assert_eq!(stats.total_frames, 3);
        assert_eq!(stats.total_keyframes, 1);
        assert_eq!(stats.total_bytes, 2000);
    }
}
