//! Hardware seam: the SPI link and power pins to the transceiver, and the
//! external PA driver.
//!
//! Both are fixed hardware contracts implemented outside this crate; the
//! driver acquires them when it starts and drops them when it stops so the
//! bus and pins are released whenever the device is unpowered.

use crate::error::ArgosResult;

/// Raw SPI + control-pin access to the transceiver.
pub trait ArticPort {
    /// Full-duplex transfer with chip select around this call only.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> ArgosResult<()>;

    /// Full-duplex transfer leaving chip select asserted, for burst
    /// sequences. Terminate with [`ArticPort::finish_transfer`].
    fn transfer_continuous(&mut self, tx: &[u8], rx: &mut [u8]) -> ArgosResult<()>;

    /// Deassert chip select after a continuous burst.
    fn finish_transfer(&mut self);

    fn set_power_enable(&mut self, on: bool);
    fn set_reset(&mut self, on: bool);
}

/// External power-amplifier control.
pub trait PaDriver {
    fn set_output_power(&mut self, milliwatts: u32);
}

/// The resources the driver owns while the device is powered.
pub struct ArticPorts {
    pub spi: Box<dyn ArticPort>,
    pub pa: Box<dyn PaDriver>,
}
