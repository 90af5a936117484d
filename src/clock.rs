use std::time::{SystemTime, UNIX_EPOCH};

/// A source of timestamps for the commit log.
///
/// `BornTimestamp` comes from the producer and `StoreTimestamp` is stamped
/// by the `Appender` at reservation time (§3, §4.4); both need a cheap,
/// monotonic-enough clock on the put path.
pub trait Clock: Send + Sync + 'static {
    /// Current time in milliseconds since the UNIX epoch.
    fn now_millis(&self) -> i64;
}

/// `SystemTime`-backed clock. Subject to NTP adjustment; default choice.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch");
        timestamp.as_millis() as i64
    }
}

/// TSC-backed clock via `quanta`. Monotonic, anchored to wall-clock time at
/// construction, then advanced by TSC ticks — avoids a syscall per put.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start_wall_ms: i64,
    start_instant: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        let start_wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch")
            .as_millis() as i64;
        Self {
            clock,
            start_wall_ms,
            start_instant,
        }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now_millis(&self) -> i64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall_ms + delta.as_millis() as i64
    }
}
