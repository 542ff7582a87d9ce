use tokio::time::Instant;

/// Source of monotonic "elapsed realtime" milliseconds.
///
/// Load timestamps, refresh deadlines and the server clock offset are all expressed
/// on this timeline.
pub trait Clock: Send + Sync {
    fn elapsed_realtime_ms(&self) -> i64;
}

/// Monotonic clock counting from its creation.
///
/// Backed by [`tokio::time::Instant`], so it follows the runtime's paused clock in tests.
#[derive(Debug, Clone)]
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
    fn elapsed_realtime_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }
}
