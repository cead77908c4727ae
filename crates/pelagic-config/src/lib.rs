//! Persistent sensor calibration for the Pelagic tracker.
//!
//! Sensors carry factory- or field-set calibration constants (gain
//! corrections, zero offsets, probe coefficients). Each named calibration
//! persists to a `<name>.CAL` file of little-endian `(u32 offset, f64
//! value)` records, rewritten on close when dirty.

pub mod calibration;
pub mod error;

pub use calibration::{Calibration, CalibrationRegistry};
pub use error::{CalibError, CalibResult};
