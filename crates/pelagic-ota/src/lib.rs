//! Over-the-air image updates for the Pelagic tracker.
//!
//! Three image classes arrive over the BLE link: onboard MCU firmware
//! (staged raw in a reserved flash region for the bootloader), radio
//! coprocessor firmware, and GNSS offline assistance data (both installed
//! as filesystem files). Transfers declare length and CRC32 up front and
//! commit nothing until both verify.

pub mod error;
pub mod updater;

pub use error::{OtaError, OtaResult};
pub use updater::{
    FileId, FileUpdater, FlashFileUpdater, GNSS_ASSIST_FILE, HEADER_SIZE, RADIO_FIRMWARE_FILE,
};
