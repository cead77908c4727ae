use pelagic_fs::FsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log not ready; create() has not succeeded")]
    NotReady,

    #[error("log corrupt: {0}")]
    Corrupt(String),

    #[error("record index {index} out of range ({len} entries)")]
    OutOfRange { index: u32, len: u32 },

    #[error("payload of {0} bytes exceeds record capacity")]
    PayloadTooLarge(usize),

    #[error(transparent)]
    Fs(#[from] FsError),
}

pub type LogResult<T> = Result<T, LogError>;
