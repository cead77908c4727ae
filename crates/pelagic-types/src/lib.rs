//! Foundation types for the Pelagic tracker core.
//!
//! This crate holds the pieces shared by more than one subsystem:
//!
//! - [`RadioEvent`] / [`GnssEvent`] -- events the satellite and GNSS drivers
//!   emit to the application layer
//! - [`GnssFix`] -- one composite navigation solution
//! - [`bitpack`] -- MSB-first bit packing/extraction used by the Argos frame
//!   encoder and the CRC-16 bit-length checksum
//! - [`crc16`] -- CRC-16-CCITT over an arbitrary number of bits, as used on
//!   the Argos downlink
//! - [`Rtc`] -- the shared host real-time clock handle
//!
//! The concurrency model of the whole system is a single cooperative task
//! loop, so shared handles here use `Rc`/`RefCell` rather than atomics.

pub mod bitpack;
pub mod crc16;
pub mod events;
pub mod nav;
pub mod rtc;

pub use events::{ArgosMode, ArgosPower, GnssEvent, RadioEvent};
pub use nav::{GnssFix, FIX_TYPE_2D, FIX_TYPE_3D, FIX_TYPE_NONE, VALID_DATE, VALID_TIME};
pub use rtc::Rtc;
