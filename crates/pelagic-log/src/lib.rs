//! Chunked wear-levelled telemetry log.
//!
//! Appends go to small fixed-size chunk files so that, once the log is
//! full, overwriting the oldest data erases one 4 KiB chunk instead of
//! rewriting the whole log -- on a device that logs every few minutes for
//! months, that difference is the flash's lifetime. The write position is
//! persisted as a single packed file attribute committed after the record
//! bytes, making every append atomic under power loss.

pub mod error;
pub mod fslog;
pub mod record;

pub use error::{LogError, LogResult};
pub use fslog::{FsLog, CHUNK_SIZE, SENSOR_LOG_SIZE, SYSTEM_LOG_SIZE};
pub use record::{LogEntry, LogKind, PAYLOAD_MAX, RECORD_SIZE};
