//! Crash-safe flash filesystem for the Pelagic tracker.
//!
//! The tracker runs unattended for months on a battery and can lose power
//! at any instant, so every layer here is built around one rule: an update
//! is invisible until a single CRC-framed metadata record lands, and a torn
//! record rolls the file back to its last flush.
//!
//! # Layers
//!
//! - [`BlockDevice`] -- NOR-flash contract (read / program / erase / sync);
//!   [`RamBlockDevice`] is the in-memory backend used by tests
//! - [`Filesystem`] -- name -> extent map with four persistent 8-byte
//!   attribute slots per file, log-structured metadata in two alternating
//!   segments, copy-on-write file data
//! - [`File`] -- positioned reads/writes with staged whole-block shadows,
//!   committed by `flush`; handles close on drop
//! - [`CircularFile`] -- fixed-capacity file whose wrap-around cursor is
//!   persisted in attribute slot 0
//!
//! # Design rules
//!
//! 1. Data blocks are programmed before the inode record that references
//!    them; the record is the commit point.
//! 2. Programs only ever hit freshly erased flash (copy-on-write blocks,
//!    page-aligned metadata appends, header-last compaction).
//! 3. All I/O errors are propagated, never silently ignored.

pub mod circular;
pub mod device;
pub mod error;
pub mod file;
pub mod fs;
pub mod layout;

pub use circular::CircularFile;
pub use device::{BlockDevice, RamBlockDevice, SharedBlockDevice};
pub use error::{FsError, FsResult};
pub use file::{File, OpenFlags, Whence};
pub use fs::{FileInfo, FsConfig, Filesystem};
