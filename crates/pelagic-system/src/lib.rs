//! Composition root for the Pelagic tracker core.
//!
//! [`System::new`] builds the whole core over one block device with
//! constructor injection throughout: filesystem (formatting a corrupt
//! part), sensor and system logs, calibration registry, OTA updater,
//! cooperative scheduler, real-time clock, and the satellite and GNSS
//! drivers, with the telemetry path wired from GNSS fixes into the sensor
//! log.

pub mod system;

pub use system::{encode_fix_payload, fix_log_payload, System, SystemConfig, FIX_PAYLOAD_BITS};
