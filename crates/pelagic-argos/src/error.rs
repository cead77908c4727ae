use pelagic_fs::FsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArgosError {
    #[error("SPI transfer failed: {0}")]
    Spi(String),

    #[error("device did not leave DSP reset")]
    BootTimeout,

    #[error("device status never showed the expected flag: {0}")]
    IncorrectStatus(&'static str),

    #[error("firmware section {section} CRC mismatch: device {device:#08x}, image {image:#08x}")]
    CrcFailure {
        section: &'static str,
        device: u32,
        image: u32,
    },

    #[error("firmware image malformed: {0}")]
    BadImage(String),

    #[error("payload cannot be framed: {0}")]
    BadPayload(String),

    #[error(transparent)]
    Fs(#[from] FsError),
}

pub type ArgosResult<T> = Result<T, ArgosError>;
