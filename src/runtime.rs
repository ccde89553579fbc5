use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source shared by every phase loop and by the sensor layer.
///
/// All suspension points in the session go through [`Clock::sleep`], so a
/// manual clock turns a multi-hour session into a deterministic replay.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;

    /// Cooperative yield for `d`.
    fn sleep(&self, d: Duration);
}

/// Production clock backed by `Instant`.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d)
    }
}

/// Virtual clock: `sleep` advances time instantly. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, d: Duration) {
        self.micros.fetch_add(d.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, t: Duration) {
        self.micros.store(t.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }

    fn sleep(&self, d: Duration) {
        self.advance(d)
    }
}

/// Fixed polling cadence for a phase loop
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pacer {
    interval: Duration,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Cadence from a rate; non-positive rates fall back to 1 Hz.
    pub fn from_hz(hz: f64) -> Self {
        let hz = if hz > 0.0 { hz } else { 1.0 };
        Self::new(Duration::from_secs_f64(1.0 / hz))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Yield for one interval
    pub fn pause(&self, clock: &dyn Clock) {
        clock.sleep(self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_sleep_advances_shared_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.sleep(Duration::from_millis(250));
        other.advance(Duration::from_millis(750));
        assert_eq!(clock.now(), Duration::from_secs(1));
        clock.set(Duration::from_secs(10));
        assert_eq!(other.now(), Duration::from_secs(10));
    }

    #[test]
    fn pacer_from_hz() {
        assert_eq!(Pacer::from_hz(10.0).interval(), Duration::from_millis(100));
        assert_eq!(Pacer::from_hz(0.0).interval(), Duration::from_secs(1));
    }

    #[test]
    fn pacer_pause_uses_clock() {
        let clock = ManualClock::new();
        let pacer = Pacer::from_hz(4.0);
        for _ in 0..4 {
            pacer.pause(&clock);
        }
        assert_eq!(clock.now(), Duration::from_secs(1));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        clock.sleep(Duration::from_millis(2));
        assert!(clock.now() > a);
    }
}
