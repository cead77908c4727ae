//! File handles: open-mode flags, positioned reads and writes, copy-on-write
//! flush.

use std::collections::BTreeMap;
use std::ops::BitOr;
use std::rc::Rc;

use tracing::{trace, warn};

use crate::error::{FsError, FsResult};
use crate::fs::Filesystem;

/// Open-mode flag set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags(u8);

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags(0x01);
    pub const WRITE: OpenFlags = OpenFlags(0x02);
    pub const CREATE: OpenFlags = OpenFlags(0x04);
    pub const EXCLUSIVE: OpenFlags = OpenFlags(0x08);
    pub const TRUNCATE: OpenFlags = OpenFlags(0x10);
    pub const APPEND: OpenFlags = OpenFlags(0x20);

    pub const RDWR: OpenFlags = OpenFlags(0x03);

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;
    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// Origin for [`File::seek`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Writes are staged in whole-block shadow copies and committed by `flush`;
/// a shadow that grows past this many blocks is committed early to bound RAM.
const AUTO_FLUSH_BLOCKS: usize = 16;

/// An open file.
///
/// Dropping the handle closes the file, flushing staged writes; use
/// [`File::close`] on paths that need the error. After a crash the file
/// contents equal a prefix of the last successful flush.
pub struct File {
    fs: Rc<Filesystem>,
    name: String,
    flags: OpenFlags,
    pos: u32,
    size: u32,
    /// Committed block list as of the last flush.
    blocks: Vec<u32>,
    /// Staged whole-block contents, keyed by block ordinal within the file.
    shadow: BTreeMap<u32, Vec<u8>>,
    dirty: bool,
    closed: bool,
}

impl File {
    pub fn open(fs: &Rc<Filesystem>, path: &str, flags: OpenFlags) -> FsResult<Self> {
        if !flags.contains(OpenFlags::READ) && !flags.contains(OpenFlags::WRITE) {
            return Err(FsError::Inval("open without READ or WRITE".into()));
        }

        let exists = fs.exists(path)?;
        if exists && flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
            return Err(FsError::Exists(path.into()));
        }
        if !exists {
            if !flags.contains(OpenFlags::CREATE) {
                return Err(FsError::NotFound(path.into()));
            }
            fs.create_file(path)?;
        }

        let mut inode = fs.lookup(path)?;
        if flags.contains(OpenFlags::WRITE | OpenFlags::TRUNCATE) && inode.size > 0 {
            let freed = std::mem::take(&mut inode.blocks);
            fs.commit_file(path, 0, Vec::new(), &freed)?;
            inode.size = 0;
        }

        let pos = if flags.contains(OpenFlags::APPEND) {
            inode.size
        } else {
            0
        };

        trace!(path, ?flags, size = inode.size, "file opened");
        Ok(Self {
            fs: fs.clone(),
            name: path.into(),
            flags,
            pos,
            size: inode.size,
            blocks: inode.blocks,
            shadow: BTreeMap::new(),
            dirty: false,
            closed: false,
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn position(&self) -> u32 {
        self.pos
    }

    /// Read up to `buf.len()` bytes at the cursor. Returns the number of
    /// bytes read; zero at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        if !self.flags.contains(OpenFlags::READ) {
            return Err(FsError::Inval("file not open for reading".into()));
        }
        let block_size = self.block_len();
        let available = (self.size.saturating_sub(self.pos)) as usize;
        let total = buf.len().min(available);

        let mut done = 0;
        while done < total {
            let ordinal = (self.pos / block_size as u32) as u32;
            let in_block = (self.pos % block_size as u32) as usize;
            let chunk = (total - done).min(block_size - in_block);
            let dst = &mut buf[done..done + chunk];

            if let Some(content) = self.shadow.get(&ordinal) {
                dst.copy_from_slice(&content[in_block..in_block + chunk]);
            } else {
                let block = self.blocks[ordinal as usize];
                self.fs.read_block_span(block, in_block as u32, dst)?;
            }
            self.pos += chunk as u32;
            done += chunk;
        }
        Ok(total)
    }

    /// Write `data` at the cursor, extending the file as needed. Staged
    /// until `flush`.
    pub fn write(&mut self, data: &[u8]) -> FsResult<usize> {
        if !self.flags.contains(OpenFlags::WRITE) {
            return Err(FsError::Inval("file not open for writing".into()));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let block_size = self.block_len();

        let mut done = 0;
        while done < data.len() {
            let ordinal = self.pos / block_size as u32;
            let in_block = (self.pos % block_size as u32) as usize;
            let chunk = (data.len() - done).min(block_size - in_block);

            // Materialize zero blocks for any hole a forward seek created.
            let first_new = self.blocks.len() as u32;
            for gap in first_new..ordinal {
                self.shadow.entry(gap).or_insert_with(|| vec![0; block_size]);
            }

            if !self.shadow.contains_key(&ordinal) {
                let content = if (ordinal as usize) < self.blocks.len() {
                    let mut buf = vec![0; block_size];
                    self.fs.read_block_span(self.blocks[ordinal as usize], 0, &mut buf)?;
                    buf
                } else {
                    vec![0; block_size]
                };
                self.shadow.insert(ordinal, content);
            }
            let content = self.shadow.get_mut(&ordinal).unwrap();
            content[in_block..in_block + chunk].copy_from_slice(&data[done..done + chunk]);

            self.pos += chunk as u32;
            self.size = self.size.max(self.pos);
            done += chunk;
        }
        self.dirty = true;

        if self.shadow.len() >= AUTO_FLUSH_BLOCKS {
            self.flush()?;
        }
        Ok(data.len())
    }

    /// Move the cursor. Seeking past the end is allowed; a later write
    /// zero-fills the gap.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> FsResult<u32> {
        let base = match whence {
            Whence::Set => 0i64,
            Whence::Cur => self.pos as i64,
            Whence::End => self.size as i64,
        };
        let target = base + offset;
        if target < 0 || target > u32::MAX as i64 {
            return Err(FsError::Inval(format!("seek to {target}")));
        }
        self.pos = target as u32;
        Ok(self.pos)
    }

    /// Commit staged writes: program shadow blocks to fresh flash, then
    /// persist the inode record that makes them visible.
    pub fn flush(&mut self) -> FsResult<()> {
        if !self.dirty {
            return Ok(());
        }

        // Program every staged block to fresh flash first; nothing is
        // visible until the inode record commits below.
        let shadow = std::mem::take(&mut self.shadow);
        let mut written: Vec<(u32, u32)> = Vec::new();
        let mut failure = None;
        for (&ordinal, content) in &shadow {
            match self.fs.write_new_block(content) {
                Ok(block) => written.push((ordinal, block)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            for &(_, block) in &written {
                self.fs.discard_block(block);
            }
            self.shadow = shadow;
            return Err(e);
        }

        let mut new_blocks = self.blocks.clone();
        let mut freed = Vec::new();
        for &(ordinal, block) in &written {
            let ordinal = ordinal as usize;
            if ordinal < new_blocks.len() {
                freed.push(std::mem::replace(&mut new_blocks[ordinal], block));
            } else {
                debug_assert_eq!(ordinal, new_blocks.len());
                new_blocks.push(block);
            }
        }

        if let Err(e) = self
            .fs
            .commit_file(&self.name, self.size, new_blocks.clone(), &freed)
        {
            for &(_, block) in &written {
                self.fs.discard_block(block);
            }
            self.shadow = shadow;
            return Err(e);
        }

        self.blocks = new_blocks;
        self.dirty = false;
        trace!(name = %self.name, size = self.size, "file flushed");
        Ok(())
    }

    /// Flush and consume the handle, surfacing any error.
    pub fn close(mut self) -> FsResult<()> {
        self.closed = true;
        self.flush()
    }

    fn block_len(&self) -> usize {
        self.fs.device().borrow().block_size() as usize
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if !self.closed && self.dirty {
            if let Err(e) = self.flush() {
                warn!(name = %self.name, error = %e, "flush on close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamBlockDevice;
    use crate::fs::FsConfig;

    fn fresh_fs() -> Rc<Filesystem> {
        let dev = RamBlockDevice::shared(64, 4096, 256);
        let fs = Filesystem::new(dev, FsConfig::default());
        fs.format().unwrap();
        fs.mount().unwrap();
        fs
    }

    #[test]
    fn open_missing_without_create_fails() {
        let fs = fresh_fs();
        assert!(matches!(
            File::open(&fs, "nope", OpenFlags::READ),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn create_exclusive_rejects_existing() {
        let fs = fresh_fs();
        File::open(&fs, "f", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap()
            .close()
            .unwrap();
        assert!(matches!(
            File::open(
                &fs,
                "f",
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE
            ),
            Err(FsError::Exists(_))
        ));
    }

    #[test]
    fn write_read_roundtrip() {
        let fs = fresh_fs();
        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        {
            let mut f = File::open(&fs, "data", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
            f.write(&payload).unwrap();
            f.close().unwrap();
        }
        let mut f = File::open(&fs, "data", OpenFlags::READ).unwrap();
        assert_eq!(f.size(), payload.len() as u32);
        let mut back = vec![0u8; payload.len()];
        assert_eq!(f.read(&mut back).unwrap(), payload.len());
        assert_eq!(back, payload);
        assert_eq!(f.read(&mut back).unwrap(), 0);
    }

    #[test]
    fn data_survives_remount() {
        let fs = fresh_fs();
        {
            let mut f = File::open(&fs, "keep", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
            f.write(b"persisted contents").unwrap();
            f.close().unwrap();
        }
        fs.unmount().unwrap();
        fs.mount().unwrap();
        let mut f = File::open(&fs, "keep", OpenFlags::READ).unwrap();
        let mut buf = vec![0u8; f.size() as usize];
        f.read(&mut buf).unwrap();
        assert_eq!(&buf, b"persisted contents");
    }

    #[test]
    fn unflushed_writes_are_invisible_after_remount() {
        let fs = fresh_fs();
        {
            let mut f = File::open(&fs, "torn", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
            f.write(b"first").unwrap();
            f.flush().unwrap();
            f.write(b" second").unwrap();
            // Simulate power loss: forget the handle without flushing.
            f.closed = true;
            f.dirty = false;
        }
        fs.unmount().unwrap();
        fs.mount().unwrap();
        let mut f = File::open(&fs, "torn", OpenFlags::READ).unwrap();
        let mut buf = vec![0u8; f.size() as usize];
        f.read(&mut buf).unwrap();
        assert_eq!(&buf, b"first");
    }

    #[test]
    fn truncate_discards_contents() {
        let fs = fresh_fs();
        {
            let mut f = File::open(&fs, "t", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
            f.write(&[7u8; 5000]).unwrap();
            f.close().unwrap();
        }
        let f = File::open(&fs, "t", OpenFlags::WRITE | OpenFlags::TRUNCATE).unwrap();
        assert_eq!(f.size(), 0);
        f.close().unwrap();
        assert_eq!(fs.stat("t").unwrap().size, 0);
    }

    #[test]
    fn append_positions_at_end() {
        let fs = fresh_fs();
        {
            let mut f = File::open(&fs, "a", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
            f.write(b"head").unwrap();
            f.close().unwrap();
        }
        {
            let mut f = File::open(&fs, "a", OpenFlags::WRITE | OpenFlags::APPEND).unwrap();
            f.write(b"-tail").unwrap();
            f.close().unwrap();
        }
        let mut f = File::open(&fs, "a", OpenFlags::READ).unwrap();
        let mut buf = vec![0u8; f.size() as usize];
        f.read(&mut buf).unwrap();
        assert_eq!(&buf, b"head-tail");
    }

    #[test]
    fn overwrite_in_middle() {
        let fs = fresh_fs();
        {
            let mut f = File::open(&fs, "m", OpenFlags::RDWR | OpenFlags::CREATE).unwrap();
            f.write(&[0xAA; 9000]).unwrap();
            f.seek(4500, Whence::Set).unwrap();
            f.write(&[0x55; 100]).unwrap();
            f.close().unwrap();
        }
        let mut f = File::open(&fs, "m", OpenFlags::READ).unwrap();
        let mut buf = vec![0u8; 9000];
        f.read(&mut buf).unwrap();
        assert!(buf[..4500].iter().all(|&b| b == 0xAA));
        assert!(buf[4500..4600].iter().all(|&b| b == 0x55));
        assert!(buf[4600..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn seek_whence_variants() {
        let fs = fresh_fs();
        let mut f = File::open(&fs, "s", OpenFlags::RDWR | OpenFlags::CREATE).unwrap();
        f.write(&[1u8; 100]).unwrap();
        assert_eq!(f.seek(10, Whence::Set).unwrap(), 10);
        assert_eq!(f.seek(5, Whence::Cur).unwrap(), 15);
        assert_eq!(f.seek(-20, Whence::End).unwrap(), 80);
        assert!(f.seek(-200, Whence::End).is_err());
    }

    #[test]
    fn large_file_spills_over_auto_flush() {
        let fs = fresh_fs();
        // More than AUTO_FLUSH_BLOCKS worth of data written in one go.
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        {
            let mut f = File::open(&fs, "big", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
            f.write(&payload).unwrap();
            f.close().unwrap();
        }
        let mut f = File::open(&fs, "big", OpenFlags::READ).unwrap();
        let mut back = vec![0u8; payload.len()];
        f.read(&mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn read_only_handle_rejects_writes() {
        let fs = fresh_fs();
        File::open(&fs, "ro", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap()
            .close()
            .unwrap();
        let mut f = File::open(&fs, "ro", OpenFlags::READ).unwrap();
        assert!(matches!(f.write(b"x"), Err(FsError::Inval(_))));
    }
}
