//! Clock abstraction (injectable for testing).

use std::sync::atomic::{AtomicU64, Ordering};

/// Provides the current wall-clock time as Unix-epoch milliseconds.
///
/// Timing-sensitive code (lock validity, backoff scheduling, checkpoint
/// timestamps) takes a `&dyn Clock` instead of calling `SystemTime::now()`
/// directly, so tests can drive time deterministically.
pub trait Clock: Send + Sync {
    /// Returns the current time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;

    /// Returns the current time as an ISO-8601 / RFC 3339 string.
    fn now_iso(&self) -> String {
        use chrono::TimeZone;
        chrono::Utc
            .timestamp_millis_opt(self.now_millis() as i64)
            .single()
            .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
            .unwrap_or_default()
    }
}

/// The default [`Clock`] implementation backed by the system clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

/// A manually advanced clock for tests.
///
/// Starts at a fixed instant and only moves when [`ManualClock::advance`]
/// is called.
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Create a clock pinned to the given epoch-milliseconds instant.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Move the clock forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
