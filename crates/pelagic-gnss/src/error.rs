use pelagic_fs::FsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GnssError {
    #[error("UART port error: {0}")]
    Port(String),

    #[error("malformed UBX data: {0}")]
    BadFrame(String),

    #[error(transparent)]
    Fs(#[from] FsError),
}

pub type GnssResult<T> = Result<T, GnssError>;
