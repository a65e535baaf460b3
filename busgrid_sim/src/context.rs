//! Virtual clock shared by the simulated broker and the scenario runner.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Manually advanced clock.
///
/// Clones share the same time, so the broker's acknowledgement deadlines
/// and the runner's ticks stay in step.
#[derive(Debug, Clone)]
pub struct SimClock {
    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimClock {
    pub fn new() -> Self {
        Self {
            virtual_time_ns: Arc::new(Mutex::new(0)),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Advances virtual time by the given duration.
    pub fn advance(&self, duration: Duration) {
        let mut time = self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner);
        *time += duration.as_nanos() as u64;
    }

    /// Returns the current virtual time since simulation start.
    pub fn now(&self) -> Duration {
        Duration::from_nanos(*self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Returns the wall-clock equivalent of the current virtual time.
    pub fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    /// Virtual wall-clock time as Unix seconds (feed timestamps).
    pub fn unix_secs(&self) -> u64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}
