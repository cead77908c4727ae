use pelagic_fs::FsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalibError {
    #[error("no calibration value at offset {0}")]
    KeyNotFound(u32),

    #[error("calibration {0:?} already registered")]
    DuplicateName(String),

    #[error("calibration {0:?} not registered")]
    NameNotFound(String),

    #[error(transparent)]
    Fs(#[from] FsError),
}

pub type CalibResult<T> = Result<T, CalibError>;
