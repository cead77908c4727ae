//! Chunked log over the filesystem.
//!
//! The logical log is split across many small chunk files named
//! `<base>.<n>`, each exactly [`CHUNK_SIZE`] bytes, so that wrapping over
//! the oldest data costs one truncate-and-recreate of a single chunk
//! rather than a rewrite of the whole log. A zero-length base file exists
//! only to carry the persistent attribute that packs the write offset
//! (low 31 bits) and the wrapped flag (top bit); because the attribute is
//! committed after the record bytes, a power cut either rolls the write
//! forward or makes it invisible -- never half a record.

use std::rc::Rc;

use tracing::{debug, warn};

use pelagic_fs::{File, Filesystem, OpenFlags, Whence};

use crate::error::{LogError, LogResult};
use crate::record::{LogEntry, RECORD_SIZE};

/// Size of one chunk file. A power of two, a whole multiple of
/// [`RECORD_SIZE`].
pub const CHUNK_SIZE: u32 = 4096;

const WRAPPED_FLAG: u32 = 0x8000_0000;
const OFFSET_MASK: u32 = 0x7FFF_FFFF;

/// Well-known sensor log geometry: 1 MiB.
pub const SENSOR_LOG_SIZE: u32 = 1024 * 1024;
/// Well-known system log geometry: 256 KiB.
pub const SYSTEM_LOG_SIZE: u32 = 256 * 1024;

pub struct FsLog {
    fs: Rc<Filesystem>,
    base: String,
    max_size: u32,
    write_offset: u32,
    wrapped: bool,
    ready: bool,
    /// Cached read handle: (chunk index, open file). Avoids the open
    /// overhead when reading runs of records out of the same chunk.
    cached_read: Option<(u32, File)>,
}

impl FsLog {
    /// A log of capacity `max_size` (must be a multiple of [`CHUNK_SIZE`])
    /// under the base name `base`. Not ready until [`FsLog::create`] runs.
    pub fn new(fs: &Rc<Filesystem>, base: &str, max_size: u32) -> Self {
        assert!(max_size > 0 && max_size % CHUNK_SIZE == 0);
        Self {
            fs: fs.clone(),
            base: base.into(),
            max_size,
            write_offset: 0,
            wrapped: false,
            ready: false,
            cached_read: None,
        }
    }

    /// The 1 MiB sensor log under its well-known name.
    pub fn sensor(fs: &Rc<Filesystem>) -> Self {
        Self::new(fs, "sensor.log", SENSOR_LOG_SIZE)
    }

    /// The 256 KiB system log under its well-known name.
    pub fn system(fs: &Rc<Filesystem>) -> Self {
        Self::new(fs, "system.log", SYSTEM_LOG_SIZE)
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn base_name(&self) -> &str {
        &self.base
    }

    /// Restore state from the base file's attribute, or create a fresh log
    /// if the base file does not exist.
    pub fn create(&mut self) -> LogResult<()> {
        if self.fs.exists(&self.base)? {
            let mut buf = [0u8; 4];
            let attr_len = self.fs.get_attr(&self.base, 0, &mut buf)?;
            if attr_len >= 4 {
                let attr = u32::from_le_bytes(buf);
                self.write_offset = attr & OFFSET_MASK;
                self.wrapped = attr & WRAPPED_FLAG != 0;

                if self.write_offset >= self.max_size {
                    warn!(base = %self.base, attr, "illegal log attribute");
                    return Err(LogError::Corrupt(format!(
                        "write offset {} outside capacity {}",
                        self.write_offset, self.max_size
                    )));
                }
                if !self.fs.exists(&self.chunk_name(0))? {
                    warn!(base = %self.base, "missing first log chunk");
                    return Err(LogError::Corrupt("missing log chunk 0".into()));
                }
            } else {
                // Base file present but attribute never landed: reinitialize
                // the attribute and make sure the first chunk exists.
                self.write_offset = 0;
                self.wrapped = false;
                self.store_attr()?;
                File::open(
                    &self.fs,
                    &self.chunk_name(0),
                    OpenFlags::WRITE | OpenFlags::CREATE,
                )?
                .close()?;
            }
        } else {
            File::open(&self.fs, &self.base, OpenFlags::WRITE | OpenFlags::CREATE)?.close()?;
            self.write_offset = 0;
            self.wrapped = false;
            self.store_attr()?;
            File::open(
                &self.fs,
                &self.chunk_name(0),
                OpenFlags::WRITE | OpenFlags::CREATE,
            )?
            .close()?;
            debug!(base = %self.base, "new log created");
        }

        self.ready = true;
        Ok(())
    }

    /// Drop all state and re-create from scratch.
    pub fn truncate(&mut self) -> LogResult<()> {
        self.write_offset = 0;
        self.wrapped = false;
        self.ready = false;
        self.cached_read = None;
        self.fs.remove(&self.base)?;
        self.create()
    }

    /// Append one record. Always opens and closes the chunk file and
    /// rewrites the attribute so the loss window is a single record.
    pub fn write(&mut self, entry: &LogEntry) -> LogResult<()> {
        if !self.ready {
            return Err(LogError::NotReady);
        }

        let chunk_index = self.write_offset / CHUNK_SIZE;
        let name = self.chunk_name(chunk_index);
        let flags = if self.write_offset % CHUNK_SIZE == 0 {
            // Chunk boundary: forcibly re-create, overwriting the oldest
            // chunk once the log has wrapped.
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE
        } else {
            OpenFlags::WRITE | OpenFlags::APPEND
        };

        let mut file = File::open(&self.fs, &name, flags)?;

        if file.size() != self.write_offset % CHUNK_SIZE {
            // A record landed without its attribute update (or vice versa).
            // Reset this chunk back to its start; the in-flight entry is
            // lost.
            warn!(
                base = %self.base,
                chunk = chunk_index,
                size = file.size(),
                expected = self.write_offset % CHUNK_SIZE,
                "chunk size mismatch; resetting chunk"
            );
            self.write_offset &= !(CHUNK_SIZE - 1);
        } else {
            file.write(&entry.to_bytes())?;
            file.close()?;
            self.write_offset += RECORD_SIZE as u32;
            if self.write_offset >= self.max_size {
                self.write_offset = 0;
                self.wrapped = true;
            }
        }
        self.store_attr()?;

        // A write into the chunk the cached read handle points at would
        // leave the handle stale; force a reopen on the next read.
        if let Some((cached, _)) = &self.cached_read {
            if *cached == chunk_index {
                self.cached_read = None;
            }
        }
        Ok(())
    }

    /// Read the record at logical `index`: 0 is the oldest surviving
    /// record, `num_entries() - 1` the newest.
    pub fn read(&mut self, index: u32) -> LogResult<LogEntry> {
        if !self.ready {
            return Err(LogError::NotReady);
        }
        let len = self.num_entries();
        if index >= len {
            return Err(LogError::OutOfRange { index, len });
        }

        // Once wrapped, logical record 0 sits at the chunk after the write
        // chunk, rounded up to the chunk boundary: overwritten chunks are
        // truncated first, so the partial write chunk holds the newest
        // records, not the oldest.
        let read_base = if self.wrapped {
            (self.write_offset + CHUNK_SIZE - 1) / CHUNK_SIZE * CHUNK_SIZE
        } else {
            0
        };
        let file_offset = (read_base + index * RECORD_SIZE as u32) % self.max_size;
        let chunk_index = file_offset / CHUNK_SIZE;

        if self
            .cached_read
            .as_ref()
            .map_or(true, |(cached, _)| *cached != chunk_index)
        {
            let file = File::open(&self.fs, &self.chunk_name(chunk_index), OpenFlags::READ)?;
            self.cached_read = Some((chunk_index, file));
        }

        let (_, file) = self.cached_read.as_mut().unwrap();
        file.seek((file_offset % CHUNK_SIZE) as i64, Whence::Set)?;
        let mut buf = [0u8; RECORD_SIZE];
        let n = file.read(&mut buf)?;
        if n != RECORD_SIZE {
            return Err(LogError::Corrupt(format!(
                "short record read ({n} bytes) at offset {file_offset}"
            )));
        }
        Ok(LogEntry::from_bytes(&buf))
    }

    /// Number of readable records.
    pub fn num_entries(&self) -> u32 {
        let record = RECORD_SIZE as u32;
        if self.wrapped {
            if self.write_offset % CHUNK_SIZE == 0 {
                self.max_size / record
            } else {
                (self.max_size - (CHUNK_SIZE - (self.write_offset % CHUNK_SIZE))) / record
            }
        } else {
            self.write_offset / record
        }
    }

    fn chunk_name(&self, index: u32) -> String {
        format!("{}.{}", self.base, index)
    }

    fn store_attr(&self) -> LogResult<()> {
        let attr = self.write_offset | if self.wrapped { WRAPPED_FLAG } else { 0 };
        self.fs.set_attr(&self.base, 0, &attr.to_le_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogKind;
    use pelagic_fs::{FsConfig, RamBlockDevice};

    /// Device large enough for a full 1 MiB log plus metadata churn.
    fn fresh_fs() -> Rc<Filesystem> {
        let dev = RamBlockDevice::shared(384, 4096, 256);
        let fs = Filesystem::new(
            dev,
            FsConfig {
                meta_segment_blocks: 32,
                ..FsConfig::default()
            },
        );
        fs.format().unwrap();
        fs.mount().unwrap();
        fs
    }

    fn counter_entry(i: u32) -> LogEntry {
        LogEntry::new(LogKind::Sensor, &i.to_le_bytes()).unwrap()
    }

    fn counter_value(entry: &LogEntry) -> u32 {
        u32::from_le_bytes(entry.payload[..4].try_into().unwrap())
    }

    #[test]
    fn create_and_write() {
        let fs = fresh_fs();
        let mut sensor = FsLog::new(&fs, "sensor.log", 64 * 1024);
        let mut system = FsLog::new(&fs, "system.log", 64 * 1024);
        sensor.create().unwrap();
        system.create().unwrap();

        assert_eq!(sensor.num_entries(), 0);
        assert_eq!(system.num_entries(), 0);

        for i in 0..4 {
            sensor.write(&counter_entry(i)).unwrap();
        }
        system.write(&counter_entry(0)).unwrap();

        assert_eq!(sensor.num_entries(), 4);
        assert_eq!(system.num_entries(), 1);

        // create() on an existing log restores rather than resets.
        sensor.create().unwrap();
        system.create().unwrap();
        assert_eq!(sensor.num_entries(), 4);
        assert_eq!(system.num_entries(), 1);
    }

    #[test]
    fn write_before_create_fails() {
        let fs = fresh_fs();
        let mut log = FsLog::new(&fs, "early", 64 * 1024);
        assert!(matches!(
            log.write(&counter_entry(0)),
            Err(LogError::NotReady)
        ));
    }

    #[test]
    fn fill_and_wrap() {
        let fs = fresh_fs();
        let max = 64 * 1024u32;
        let mut log = FsLog::new(&fs, "wrap", max);
        log.create().unwrap();

        let total = max / RECORD_SIZE as u32;
        for i in 0..total {
            log.write(&counter_entry(i)).unwrap();
        }
        assert_eq!(log.num_entries(), total);

        // One more write truncates chunk 0, erasing its stored records.
        log.write(&counter_entry(total)).unwrap();
        assert_eq!(
            log.num_entries(),
            (max - CHUNK_SIZE + RECORD_SIZE as u32) / RECORD_SIZE as u32
        );
    }

    #[test]
    fn state_is_persistent() {
        let fs = fresh_fs();
        let max = 64 * 1024u32;
        {
            let mut log = FsLog::new(&fs, "persist", max);
            log.create().unwrap();
            log.write(&counter_entry(1)).unwrap();
            assert_eq!(log.num_entries(), 1);
        }
        let mut log = FsLog::new(&fs, "persist", max);
        log.create().unwrap();
        assert_eq!(log.num_entries(), 1);

        // Wrap it and check the wrapped flag also survives.
        let total = max / RECORD_SIZE as u32;
        for i in 0..total {
            log.write(&counter_entry(i)).unwrap();
        }
        let entries = log.num_entries();
        drop(log);

        let mut log = FsLog::new(&fs, "persist", max);
        log.create().unwrap();
        assert_eq!(log.num_entries(), entries);
    }

    #[test]
    fn read_back_after_reset_and_wrap() {
        // Scenario: CHUNK_SIZE = 4096, MAX_SIZE = 1 MiB, RECORD_SIZE = 128,
        // 8192 records, record i carrying the little-endian value i.
        let fs = fresh_fs();
        let max = 1024 * 1024u32;
        let total = max / RECORD_SIZE as u32; // 8192
        let per_chunk = CHUNK_SIZE / RECORD_SIZE as u32; // 32

        let mut log = FsLog::new(&fs, "s1", max);
        log.create().unwrap();
        for i in 0..total {
            log.write(&counter_entry(i)).unwrap();
        }

        // Fresh object over the same files restores identical state.
        let mut log = FsLog::new(&fs, "s1", max);
        log.create().unwrap();
        assert_eq!(log.num_entries(), total);
        for i in 0..total {
            assert_eq!(counter_value(&log.read(i).unwrap()), i);
        }

        // Wrap: chunk 0 (records 0..32) is sacrificed for one new record.
        log.write(&counter_entry(total)).unwrap();
        let expect = (max - CHUNK_SIZE + RECORD_SIZE as u32) / RECORD_SIZE as u32;
        assert_eq!(log.num_entries(), expect);
        assert_eq!(counter_value(&log.read(0).unwrap()), per_chunk);
        assert_eq!(
            counter_value(&log.read(expect - 2).unwrap()),
            total - 1
        );
        assert_eq!(counter_value(&log.read(expect - 1).unwrap()), total);
    }

    #[test]
    fn interleaved_write_and_read() {
        let fs = fresh_fs();
        let max = 64 * 1024u32;
        let mut log = FsLog::new(&fs, "mix", max);
        log.create().unwrap();

        for i in 0..max / RECORD_SIZE as u32 {
            log.write(&counter_entry(i)).unwrap();
            assert_eq!(counter_value(&log.read(i).unwrap()), i);
        }
    }

    #[test]
    fn corrupt_attribute_rejected() {
        let fs = fresh_fs();
        let mut log = FsLog::new(&fs, "bad", 64 * 1024);
        log.create().unwrap();
        drop(log);

        fs.set_attr("bad", 0, &0xFFFF_FFFFu32.to_le_bytes()).unwrap();

        let mut log = FsLog::new(&fs, "bad", 64 * 1024);
        assert!(matches!(log.create(), Err(LogError::Corrupt(_))));
    }

    #[test]
    fn missing_chunk_rejected() {
        let fs = fresh_fs();
        let mut log = FsLog::new(&fs, "gone", 64 * 1024);
        log.create().unwrap();
        drop(log);

        fs.remove("gone.0").unwrap();

        let mut log = FsLog::new(&fs, "gone", 64 * 1024);
        assert!(matches!(log.create(), Err(LogError::Corrupt(_))));
    }

    #[test]
    fn truncate_resets() {
        let fs = fresh_fs();
        let mut log = FsLog::new(&fs, "trunc", 64 * 1024);
        log.create().unwrap();
        for i in 0..100 {
            log.write(&counter_entry(i)).unwrap();
        }
        log.truncate().unwrap();
        assert!(log.is_ready());
        assert_eq!(log.num_entries(), 0);
        log.write(&counter_entry(7)).unwrap();
        assert_eq!(counter_value(&log.read(0).unwrap()), 7);
    }

    #[test]
    fn read_out_of_range() {
        let fs = fresh_fs();
        let mut log = FsLog::new(&fs, "range", 64 * 1024);
        log.create().unwrap();
        log.write(&counter_entry(0)).unwrap();
        assert!(matches!(
            log.read(1),
            Err(LogError::OutOfRange { index: 1, len: 1 })
        ));
    }
}
