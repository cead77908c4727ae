use pelagic_fs::FsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("a file transfer is already in progress")]
    AlreadyInProgress,

    #[error("bad transfer size {0} bytes")]
    BadFileSize(u32),

    #[error("no file transfer in progress")]
    NotStarted,

    #[error("transfer data exceeds declared length")]
    Overflow,

    #[error("transfer incomplete: {received}/{expected} bytes")]
    Incomplete { received: u32, expected: u32 },

    #[error("CRC32 mismatch: computed {computed:#010x}, expected {expected:#010x}")]
    CrcError { computed: u32, expected: u32 },

    #[error(transparent)]
    Fs(#[from] FsError),
}

pub type OtaResult<T> = Result<T, OtaError>;
