//! Shared host real-time clock.

use std::cell::Cell;
use std::rc::Rc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

/// Handle to the host real-time clock.
///
/// The clock starts unset after a power loss; it becomes set once the GNSS
/// driver obtains a valid date and time, or when a host command sets it.
/// Cloning the handle shares the underlying clock (single-threaded
/// cooperative model, so a plain `Rc` + `Cell` suffices).
#[derive(Clone, Default)]
pub struct Rtc {
    epoch_secs: Rc<Cell<Option<i64>>>,
}

impl Rtc {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the clock has been set since boot.
    pub fn is_set(&self) -> bool {
        self.epoch_secs.get().is_some()
    }

    /// Set the clock to the given UTC time.
    pub fn set(&self, time: DateTime<Utc>) {
        debug!(time = %time, "rtc set");
        self.epoch_secs.set(Some(time.timestamp()));
    }

    /// Set the clock from a raw Unix timestamp.
    pub fn set_timestamp(&self, secs: i64) {
        self.epoch_secs.set(Some(secs));
    }

    /// Current time, if set.
    pub fn now(&self) -> Option<DateTime<Utc>> {
        self.epoch_secs
            .get()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    /// Current time as a Unix timestamp, if set.
    pub fn timestamp(&self) -> Option<i64> {
        self.epoch_secs.get()
    }

    /// Clear the clock, as after a backup-domain power loss.
    pub fn invalidate(&self) {
        self.epoch_secs.set(None);
    }
}
