//! Clock abstraction for the node engine
//!
//! The engine never reads system time directly. It is handed a `Clock` at
//! construction, which lets tests drive timers and expiry deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Time source used by the node engine.
///
/// `now` is monotonic and only meaningful relative to other `now` readings
/// from the same clock. `wall_now` is Unix wall time and is used exclusively
/// for item timestamps and expiry checks.
pub trait Clock: Send + Sync + 'static {
    /// Monotonic milliseconds since an arbitrary epoch.
    fn now(&self) -> u64;

    /// Wall-clock milliseconds since the Unix epoch.
    fn wall_now(&self) -> u64;
}

/// Production clock backed by `Instant` and `SystemTime`.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn wall_now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually-driven clock for tests and simulations.
pub struct ManualClock {
    mono: AtomicU64,
    wall: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at the given wall time.
    pub fn new(wall_ms: u64) -> Self {
        Self {
            mono: AtomicU64::new(0),
            wall: AtomicU64::new(wall_ms),
        }
    }

    /// Advance both monotonic and wall time.
    pub fn advance(&self, by: Duration) {
        let ms = by.as_millis() as u64;
        self.mono.fetch_add(ms, Ordering::SeqCst);
        self.wall.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set wall time without touching the monotonic reading.
    pub fn set_wall(&self, wall_ms: u64) {
        self.wall.store(wall_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.mono.load(Ordering::SeqCst)
    }

    fn wall_now(&self) -> u64 {
        self.wall.load(Ordering::SeqCst)
    }
}
