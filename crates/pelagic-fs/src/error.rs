use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("device I/O error: {0}")]
    Io(String),

    #[error("filesystem corrupt: {0}")]
    Corrupt(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("invalid argument: {0}")]
    Inval(String),

    #[error("out of memory")]
    NoMem,
}

pub type FsResult<T> = Result<T, FsError>;
