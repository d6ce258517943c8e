//! Host real-time throttle.
//!
//! Slows the simulation down to a configurable fraction of wall-clock
//! time. The simulator calls `update` once per period; when simulated time
//! runs ahead of `interval / rtf` host time, the call sleeps off the
//! difference. Sleep overshoot is credited against the next period and
//! overrun is carried as debt, so the ratio holds on average.

use std::thread;
use std::time::{Duration, Instant};

use log::debug;

/// Default spacing between throttle updates.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(10);

pub struct Throttle {
    /// Real-time factor: 1.0 pins simulation to wall-clock speed, 0.0
    /// disables throttling.
    rtf: f64,
    interval: Duration,

    epoch: Instant,
    start_us: i64,
    extra_us: u64,
    throttling: bool,
}

impl Throttle {
    pub fn new(rtf: f64, interval: Duration) -> Self {
        let epoch = Instant::now();
        Self {
            rtf,
            interval,
            epoch,
            start_us: 0,
            extra_us: 0,
            throttling: false,
        }
    }

    /// Configured update spacing; the simulator schedules its periodic
    /// callback at this interval (or its quantum, whichever is larger).
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the last update had to slow the simulation down.
    pub fn is_throttling(&self) -> bool {
        self.throttling
    }

    fn realtime_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }

    /// One throttle period of `interval` simulated time has elapsed.
    pub fn update(&mut self, interval: Duration) {
        if self.rtf > 0.0 {
            let elapsed = (self.realtime_us() - self.start_us).max(0) as u64;
            let actual = elapsed + self.extra_us;
            let target = (interval.as_micros() as f64 / self.rtf) as u64;

            if actual < target {
                self.extra_us = Self::sleep_us(target - actual);
                if !self.throttling {
                    debug!("throttling started");
                }
                self.throttling = true;
            } else {
                self.extra_us = actual - target;
                if self.throttling {
                    debug!("throttling stopped");
                }
                self.throttling = false;
            }
        }

        self.start_us = self.realtime_us();
    }

    /// Stop billing host time while the session is paused.
    pub fn session_suspend(&mut self) {
        self.start_us -= self.realtime_us();
    }

    /// Resume after a pause; accumulated debt is forgiven.
    pub fn session_resume(&mut self) {
        self.start_us += self.realtime_us();
        self.extra_us = 0;
    }

    /// Sleep for `delta` microseconds, returning the overshoot.
    fn sleep_us(delta: u64) -> u64 {
        let start = Instant::now();
        thread::sleep(Duration::from_micros(delta));
        let slept = start.elapsed().as_micros() as u64;
        slept.saturating_sub(delta)
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(0.0, DEFAULT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_throttles() {
        let mut throttle = Throttle::default();
        for _ in 0..3 {
            throttle.update(Duration::from_millis(10));
        }
        assert!(!throttle.is_throttling());
    }

    #[test]
    fn test_fast_simulation_gets_throttled() {
        // simulated time advances 2 ms per update but essentially no host
        // time passes, so the throttle has to sleep
        let mut throttle = Throttle::new(1.0, Duration::from_millis(2));
        throttle.update(Duration::from_millis(2));
        assert!(throttle.is_throttling());
    }

    #[test]
    fn test_slow_simulation_runs_free() {
        let mut throttle = Throttle::new(1.0, Duration::from_millis(1));
        // burn more host time than the simulated interval
        thread::sleep(Duration::from_millis(3));
        throttle.update(Duration::from_millis(1));
        assert!(!throttle.is_throttling());
    }

    #[test]
    fn test_resume_forgives_debt() {
        let mut throttle = Throttle::new(1.0, Duration::from_millis(1));
        thread::sleep(Duration::from_millis(2));
        throttle.update(Duration::from_millis(1));
        assert!(!throttle.is_throttling());

        throttle.session_suspend();
        throttle.session_resume();

        // after resume the next period starts clean and throttles again
        throttle.update(Duration::from_millis(2));
        assert!(throttle.is_throttling());
    }
}
