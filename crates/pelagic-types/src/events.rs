//! Events emitted by the satellite and GNSS drivers.
//!
//! Drivers deliver these through a callback installed by the application
//! layer. Synchronous failures are returned as `Result`s by the operation
//! that failed; these events carry only the asynchronous outcomes of the
//! state machines.

use crate::nav::GnssFix;

/// Argos transmission waveform generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgosMode {
    A2,
    A3,
}

/// Transmit output power setting for the PA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgosPower {
    Mw3,
    Mw40,
    Mw200,
    Mw500,
}

impl ArgosPower {
    /// Output power in milliwatts, as programmed into the PA driver.
    pub fn milliwatts(self) -> u32 {
        match self {
            ArgosPower::Mw3 => 3,
            ArgosPower::Mw40 => 40,
            ArgosPower::Mw200 => 200,
            ArgosPower::Mw500 => 500,
        }
    }
}

/// Events from the satellite radio driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RadioEvent {
    /// Firmware is uploaded, verified and idle; the device accepts work.
    DeviceReady,
    /// The transceiver accepted the transmit command.
    TxStarted,
    /// The queued packet finished transmitting.
    TxComplete,
    /// A downlink packet passed length and CRC validation.
    RxPacket { data: Vec<u8>, size_bits: usize },
    /// The configured receive window elapsed without a packet.
    RxTimeout,
    /// Unrecoverable device fault; the driver is shutting down.
    DeviceError,
    /// The device has powered down and released its resources.
    PowerOff,
}

/// Events from the GNSS receiver driver.
#[derive(Clone, Debug, PartialEq)]
pub enum GnssEvent {
    /// The receiver session started.
    PowerOn,
    /// The receiver session ended; reports whether any fix was obtained.
    PowerOff { fix_found: bool },
    /// A navigation solution that passed the configured filters.
    Fix(GnssFix),
    /// A satellite-visibility snapshot.
    SatReport { num_svs: u8, best_signal_quality: u8 },
    /// The configured number of navigation samples has been delivered.
    MaxNavSamples,
    /// The configured number of satellite snapshots has been delivered.
    MaxSatSamples,
    /// Unrecoverable receiver fault.
    Error,
}
