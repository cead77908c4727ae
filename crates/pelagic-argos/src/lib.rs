//! Argos satellite transceiver driver.
//!
//! Drives the dual-interrupt SPI coprocessor that implements the Argos
//! A2/A3 protocol: reset sequencing, firmware upload with per-section CRC
//! verification, TCXO warm-up, bit-exact PTT frame assembly, continuous
//! reception with an address-filter LUT, and battery-conscious idle
//! shutdown. The driver is a cooperative state machine (see [`driver`]);
//! it owns the SPI bus and the PA driver only while the device is powered.

pub mod driver;
pub mod error;
pub mod firmware;
pub mod frame;
pub mod port;
pub mod registers;

#[cfg(test)]
mod mock;

pub use driver::{ArticConfig, ArticSat, ArticState};
pub use error::{ArgosError, ArgosResult};
pub use frame::{RxPacket, TxFrame};
pub use port::{ArticPort, ArticPorts, PaDriver};
