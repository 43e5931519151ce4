//! Fixed-rate scheduling and frame-rate bookkeeping.
//!
//! `RateScheduler` paces a loop at a fixed frequency without accumulating
//! drift, `TickStats` keeps the rolling average render duration that gates
//! dithering, and `RateCounter` produces periodic event-rate reports for the
//! producer threads.

use std::thread;
use std::time::{Duration, Instant};

/// Fixed-frequency sleep/wake primitive.
///
/// The next deadline is always the previous deadline plus one interval, so
/// variable work inside a tick does not shift the schedule. An overrun tick
/// returns immediately; missed ticks are not skipped, the schedule simply
/// runs behind.
#[derive(Debug, Clone)]
pub struct RateScheduler {
    interval: Duration,
    next_tick: Instant,
}

impl RateScheduler {
    /// Create a scheduler ticking `rate_hz` times per second, starting now.
    pub fn new(rate_hz: u32) -> Self {
        Self::starting_at(rate_hz, Instant::now())
    }

    /// Create a scheduler whose first deadline is one interval after `start`.
    pub fn starting_at(rate_hz: u32, start: Instant) -> Self {
        let interval = Duration::from_secs(1) / rate_hz.max(1);
        RateScheduler {
            interval,
            next_tick: start,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Restart the schedule from `now`, forgetting any accumulated lag.
    pub fn reset(&mut self, now: Instant) {
        self.next_tick = now;
    }

    /// Advance the target time by one interval and report how long the
    /// caller should sleep if the current time is `now`.
    ///
    /// Returns `None` when the target has already passed.
    pub fn advance(&mut self, now: Instant) -> Option<Duration> {
        self.next_tick += self.interval;
        let remaining = self.next_tick.checked_duration_since(now)?;
        if remaining.is_zero() {
            None
        } else {
            Some(remaining)
        }
    }

    /// Block the calling thread until the next scheduled tick.
    pub fn wait_next_tick(&mut self) {
        if let Some(remaining) = self.advance(Instant::now()) {
            thread::sleep(remaining);
        }
    }
}

/// Snapshot emitted once per reporting interval by [`TickStats`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateReport {
    /// Ticks measured in the interval that just ended.
    pub frames: u32,
    /// Average render duration across those ticks.
    pub avg_tick_us: u64,
    /// Frame rate the render work alone would allow.
    pub possible_fps: f64,
    /// Frame rate actually observed over the interval.
    pub actual_fps: f64,
}

/// Initial average before the first report; 2ms keeps dithering enabled.
pub const INITIAL_TICK_US: u64 = 2000;

/// Rolling average of render tick durations over a fixed reporting window.
#[derive(Debug, Clone)]
pub struct TickStats {
    report_interval: Duration,
    window_start: Instant,
    duration_sum_us: u64,
    frames: u32,
    avg_tick_us: u64,
}

impl TickStats {
    pub fn new(report_interval: Duration, now: Instant) -> Self {
        TickStats {
            report_interval,
            window_start: now,
            duration_sum_us: 0,
            frames: 0,
            avg_tick_us: INITIAL_TICK_US,
        }
    }

    /// Average tick duration from the last completed window (never zero).
    pub fn avg_tick_us(&self) -> u64 {
        self.avg_tick_us.max(1)
    }

    /// Record one tick that took `duration`, finishing at `now`.
    ///
    /// Returns a report when the reporting window has elapsed; the average
    /// used for dithering decisions is refreshed at the same moment.
    pub fn record(&mut self, duration: Duration, now: Instant) -> Option<RateReport> {
        self.frames += 1;
        self.duration_sum_us += duration.as_micros() as u64;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.report_interval {
            return None;
        }

        self.avg_tick_us = (self.duration_sum_us / u64::from(self.frames)).max(1);
        let report = RateReport {
            frames: self.frames,
            avg_tick_us: self.avg_tick_us,
            possible_fps: 1.0e6 / self.avg_tick_us as f64,
            actual_fps: f64::from(self.frames) / elapsed.as_secs_f64(),
        };

        self.window_start = now;
        self.duration_sum_us = 0;
        self.frames = 0;
        Some(report)
    }
}

/// Counts events and reports total and recent rates once per window.
#[derive(Debug, Clone)]
pub struct RateCounter {
    window: Duration,
    started: Instant,
    window_start: Instant,
    total_events: u64,
    window_events: u64,
    total_rate: f64,
    recent_rate: f64,
}

impl RateCounter {
    pub fn new(window: Duration, now: Instant) -> Self {
        RateCounter {
            window,
            started: now,
            window_start: now,
            total_events: 0,
            window_events: 0,
            total_rate: 0.0,
            recent_rate: 0.0,
        }
    }

    /// Count one event; returns true when fresh rates are available.
    pub fn add_event(&mut self, now: Instant) -> bool {
        self.total_events += 1;
        self.window_events += 1;

        let since_window = now.saturating_duration_since(self.window_start);
        if since_window < self.window {
            return false;
        }

        let since_start = now.saturating_duration_since(self.started).as_secs_f64();
        if since_start > 0.0 {
            self.total_rate = self.total_events as f64 / since_start;
        }
        // N events in a window span N-1 intervals
        let intervals = self.window_events.saturating_sub(1);
        self.recent_rate = intervals as f64 / since_window.as_secs_f64();

        self.window_start = now;
        self.window_events = 0;
        true
    }

    pub fn total_events(&self) -> u64 {
        self.total_events
    }

    pub fn total_rate(&self) -> f64 {
        self.total_rate
    }

    pub fn recent_rate(&self) -> f64 {
        self.recent_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_interval() {
        let s = RateScheduler::new(50);
        assert_eq!(s.interval(), Duration::from_millis(20));
    }

    #[test]
    fn test_scheduler_zero_rate_does_not_divide_by_zero() {
        let s = RateScheduler::new(0);
        assert_eq!(s.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_scheduler_targets_do_not_drift() {
        let start = Instant::now();
        let mut s = RateScheduler::starting_at(100, start);

        // Work took 3ms inside the first tick: sleep only the remainder
        let wait = s.advance(start + Duration::from_millis(3));
        assert_eq!(wait, Some(Duration::from_millis(7)));

        // Second deadline is 20ms after start regardless of previous work
        let wait = s.advance(start + Duration::from_millis(15));
        assert_eq!(wait, Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_scheduler_overrun_returns_immediately_without_skipping() {
        let start = Instant::now();
        let mut s = RateScheduler::starting_at(100, start);

        // 35ms late: first two deadlines already passed
        assert_eq!(s.advance(start + Duration::from_millis(35)), None);
        assert_eq!(s.advance(start + Duration::from_millis(35)), None);
        // Third deadline (30ms) also passed, fourth (40ms) is in the future
        assert_eq!(s.advance(start + Duration::from_millis(35)), None);
        assert_eq!(
            s.advance(start + Duration::from_millis(35)),
            Some(Duration::from_millis(5))
        );
    }

    #[test]
    fn test_scheduler_reset_drops_lag() {
        let start = Instant::now();
        let mut s = RateScheduler::starting_at(100, start);
        let later = start + Duration::from_secs(1);
        assert_eq!(s.advance(later), None);

        s.reset(later);
        assert_eq!(
            s.advance(later + Duration::from_millis(4)),
            Some(Duration::from_millis(6))
        );
    }

    #[test]
    fn test_tick_stats_reports_after_interval() {
        let start = Instant::now();
        let mut stats = TickStats::new(Duration::from_secs(10), start);
        assert_eq!(stats.avg_tick_us(), INITIAL_TICK_US);

        for i in 1..=9u64 {
            let report = stats.record(Duration::from_micros(500), start + Duration::from_secs(i));
            assert!(report.is_none());
        }
        let report = stats
            .record(Duration::from_micros(1500), start + Duration::from_secs(10))
            .unwrap();

        assert_eq!(report.frames, 10);
        assert_eq!(report.avg_tick_us, 600);
        assert!((report.actual_fps - 1.0).abs() < 1e-9);
        assert!((report.possible_fps - 1.0e6 / 600.0).abs() < 1e-6);
        assert_eq!(stats.avg_tick_us(), 600);
    }

    #[test]
    fn test_tick_stats_average_never_zero() {
        let start = Instant::now();
        let mut stats = TickStats::new(Duration::from_secs(1), start);
        stats.record(Duration::ZERO, start + Duration::from_secs(2));
        assert_eq!(stats.avg_tick_us(), 1);
    }

    #[test]
    fn test_rate_counter_window() {
        let start = Instant::now();
        let mut counter = RateCounter::new(Duration::from_secs(5), start);

        for i in 1..=10u64 {
            let fresh = counter.add_event(start + Duration::from_millis(i * 500));
            assert_eq!(fresh, i == 10);
        }
        assert_eq!(counter.total_events(), 10);
        assert!((counter.total_rate() - 2.0).abs() < 1e-9);
        assert!((counter.recent_rate() - 9.0 / 5.0).abs() < 1e-9);
    }
}
