//! The filesystem proper: mount/format, the name -> inode map, metadata
//! persistence and block allocation.
//!
//! Metadata is log-structured across two alternating segments (see
//! [`crate::layout`]); file data is copy-on-write in whole blocks. An update
//! becomes visible only when its inode record lands intact, so a power cut
//! rolls the file back to its last flush and never exposes a torn state.

use std::cell::{RefCell, RefMut};
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::device::SharedBlockDevice;
use crate::error::{FsError, FsResult};
use crate::layout::{AttrSlot, InodeRec, Record, SegmentHeader, ATTR_SIZE, ATTR_SLOTS, NAME_MAX};

/// Tuning parameters fixed at construction.
#[derive(Clone, Copy, Debug)]
pub struct FsConfig {
    /// Blocks per metadata segment. Two segments are reserved at the front
    /// of the device.
    pub meta_segment_blocks: u32,
    /// Blocks at the end of the device the filesystem must not touch
    /// (e.g. the OTA firmware staging region).
    pub reserved_tail_blocks: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            meta_segment_blocks: 4,
            reserved_tail_blocks: 0,
        }
    }
}

/// Result of [`Filesystem::stat`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u32,
}

struct Mounted {
    seq: u32,
    active: usize,
    /// Bytes consumed in the active segment, page aligned.
    seg_used: usize,
    inodes: BTreeMap<String, InodeRec>,
    used_blocks: Vec<bool>,
}

/// A mounted (or mountable) filesystem over a shared block device.
///
/// Handles are shared as `Rc<Filesystem>`; interior mutability keeps the
/// borrow discipline local to each operation, which is sound under the
/// single cooperative task loop.
pub struct Filesystem {
    dev: SharedBlockDevice,
    cfg: FsConfig,
    inner: RefCell<Option<Mounted>>,
}

impl Filesystem {
    pub fn new(dev: SharedBlockDevice, cfg: FsConfig) -> Rc<Self> {
        Rc::new(Self {
            dev,
            cfg,
            inner: RefCell::new(None),
        })
    }

    /// The shared device handle (the OTA updater stages MCU firmware on the
    /// same part, outside the filesystem's block range).
    pub fn device(&self) -> SharedBlockDevice {
        self.dev.clone()
    }

    fn block_size(&self) -> usize {
        self.dev.borrow().block_size() as usize
    }

    fn page_size(&self) -> usize {
        self.dev.borrow().page_size() as usize
    }

    /// Number of blocks the filesystem may use (device minus the reserved
    /// tail).
    fn block_count(&self) -> u32 {
        self.dev.borrow().block_count() - self.cfg.reserved_tail_blocks
    }

    fn segment_bytes(&self) -> usize {
        self.cfg.meta_segment_blocks as usize * self.block_size()
    }

    fn segment_start(&self, segment: usize) -> u32 {
        segment as u32 * self.cfg.meta_segment_blocks
    }

    /// First block available for file data.
    pub fn data_start(&self) -> u32 {
        2 * self.cfg.meta_segment_blocks
    }

    fn align_page(&self, len: usize) -> usize {
        let page = self.page_size();
        (len + page - 1) / page * page
    }

    /// Format the device: both metadata segments erased, an empty segment
    /// written with sequence 1. Destroys all data. The filesystem is left
    /// unmounted.
    pub fn format(&self) -> FsResult<()> {
        *self.inner.borrow_mut() = None;
        {
            let mut dev = self.dev.borrow_mut();
            for block in 0..self.data_start() {
                dev.erase(block)?;
            }
        }
        let header = Record::Header(SegmentHeader {
            seq: 1,
            block_size: self.block_size() as u32,
            block_count: self.block_count(),
        });
        self.program_segment(0, 0, &header.encode())?;
        self.dev.borrow_mut().sync()?;
        debug!("filesystem formatted");
        Ok(())
    }

    /// Mount by replaying the highest-sequence metadata segment. Idempotent
    /// when already mounted. Fails with `Corrupt` when neither segment
    /// carries a valid header (e.g. a factory-fresh part).
    pub fn mount(&self) -> FsResult<()> {
        if self.inner.borrow().is_some() {
            return Ok(());
        }

        let mut best: Option<(u32, usize, Vec<u8>)> = None;
        for segment in 0..2 {
            let image = self.read_segment(segment)?;
            if let Ok(Some((Record::Header(h), _))) = Record::decode(&image, 0) {
                if h.block_size == self.block_size() as u32
                    && h.block_count == self.block_count()
                    && best.as_ref().map_or(true, |(seq, _, _)| h.seq > *seq)
                {
                    best = Some((h.seq, segment, image));
                }
            }
        }

        let (seq, active, image) = best.ok_or_else(|| {
            FsError::Corrupt("no valid metadata segment; format required".into())
        })?;

        let mut inodes: BTreeMap<String, InodeRec> = BTreeMap::new();
        let mut offset = self.align_page(Record::decode(&image, 0)?.unwrap().1 + 8);
        while let Some((record, len)) = Record::decode(&image, offset)? {
            match record {
                Record::Header(_) => {
                    return Err(FsError::Corrupt("header record inside segment body".into()))
                }
                Record::Inode(inode) => {
                    inodes.insert(inode.name.clone(), inode);
                }
                Record::Remove { name } => {
                    inodes.remove(&name);
                }
            }
            offset += self.align_page(len + 8);
        }

        let mut used_blocks = vec![false; self.block_count() as usize];
        for block in 0..self.data_start() {
            used_blocks[block as usize] = true;
        }
        for inode in inodes.values() {
            for &block in &inode.blocks {
                if block < self.data_start() || block >= self.block_count() {
                    return Err(FsError::Corrupt(format!(
                        "inode {} references block {} outside the data region",
                        inode.name, block
                    )));
                }
                used_blocks[block as usize] = true;
            }
        }

        debug!(seq, active, files = inodes.len(), "filesystem mounted");
        *self.inner.borrow_mut() = Some(Mounted {
            seq,
            active,
            seg_used: offset,
            inodes,
            used_blocks,
        });
        Ok(())
    }

    /// Unmount. Idempotent. Open files keep their `Rc` and flush against a
    /// remounted filesystem at the caller's peril; the cooperative scheduler
    /// makes the close-before-unmount ordering the application's job.
    pub fn unmount(&self) -> FsResult<()> {
        *self.inner.borrow_mut() = None;
        Ok(())
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.borrow().is_some()
    }

    /// File size by name.
    pub fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let inner = self.mounted()?;
        let inode = inner
            .inodes
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.into()))?;
        Ok(FileInfo { size: inode.size })
    }

    pub fn exists(&self, path: &str) -> FsResult<bool> {
        Ok(self.mounted()?.inodes.contains_key(path))
    }

    /// Remove a file and free its blocks. Idempotent: removing a missing
    /// file succeeds.
    pub fn remove(&self, path: &str) -> FsResult<()> {
        validate_name(path)?;
        let mut inner = self.mounted()?;
        let Some(inode) = inner.inodes.remove(path) else {
            return Ok(());
        };
        for &block in &inode.blocks {
            inner.used_blocks[block as usize] = false;
        }
        let record = Record::Remove { name: path.into() };
        self.persist(&mut inner, &record)?;
        trace!(path, "file removed");
        Ok(())
    }

    /// Store up to [`ATTR_SIZE`] bytes in one of the file's persistent
    /// attribute slots.
    pub fn set_attr(&self, path: &str, slot: usize, data: &[u8]) -> FsResult<()> {
        if slot >= ATTR_SLOTS {
            return Err(FsError::Inval(format!("attribute slot {slot}")));
        }
        if data.len() > ATTR_SIZE {
            return Err(FsError::Inval(format!("attribute length {}", data.len())));
        }
        let mut inner = self.mounted()?;
        let inode = inner
            .inodes
            .get_mut(path)
            .ok_or_else(|| FsError::NotFound(path.into()))?;
        let mut attr = AttrSlot {
            len: data.len() as u8,
            data: [0; ATTR_SIZE],
        };
        attr.data[..data.len()].copy_from_slice(data);
        inode.attrs[slot] = attr;
        let record = Record::Inode(inode.clone());
        self.persist(&mut inner, &record)
    }

    /// Read a persistent attribute slot into `buf`. Returns the stored
    /// length; a slot that was never written reads back as length zero.
    pub fn get_attr(&self, path: &str, slot: usize, buf: &mut [u8]) -> FsResult<usize> {
        if slot >= ATTR_SLOTS {
            return Err(FsError::Inval(format!("attribute slot {slot}")));
        }
        let inner = self.mounted()?;
        let inode = inner
            .inodes
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.into()))?;
        let attr = &inode.attrs[slot];
        let n = (attr.len as usize).min(buf.len());
        buf[..n].copy_from_slice(&attr.data[..n]);
        Ok(attr.len as usize)
    }

    // ---- crate-internal surface used by File ----

    pub(crate) fn lookup(&self, path: &str) -> FsResult<InodeRec> {
        let inner = self.mounted()?;
        inner
            .inodes
            .get(path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path.into()))
    }

    pub(crate) fn create_file(&self, path: &str) -> FsResult<()> {
        validate_name(path)?;
        let mut inner = self.mounted()?;
        if inner.inodes.contains_key(path) {
            return Err(FsError::Exists(path.into()));
        }
        let inode = InodeRec {
            name: path.into(),
            ..InodeRec::default()
        };
        inner.inodes.insert(path.into(), inode.clone());
        self.persist(&mut inner, &Record::Inode(inode))?;
        trace!(path, "file created");
        Ok(())
    }

    /// Read a byte span out of a data block.
    pub(crate) fn read_block_span(&self, block: u32, offset: u32, buf: &mut [u8]) -> FsResult<()> {
        self.dev.borrow().read(block, offset, buf)
    }

    /// Allocate a fresh block, erase it, and program `content` (one whole
    /// block) into it.
    pub(crate) fn write_new_block(&self, content: &[u8]) -> FsResult<u32> {
        debug_assert_eq!(content.len(), self.block_size());
        let mut inner = self.mounted()?;
        let start = self.data_start() as usize;
        let block = inner.used_blocks[start..]
            .iter()
            .position(|used| !used)
            .map(|i| (start + i) as u32)
            .ok_or(FsError::NoSpace)?;
        inner.used_blocks[block as usize] = true;
        drop(inner);

        let mut dev = self.dev.borrow_mut();
        dev.erase(block)?;
        dev.program(block, 0, content)?;
        Ok(block)
    }

    /// Roll back an allocation made by [`write_new_block`] when the commit
    /// it was destined for fails.
    pub(crate) fn discard_block(&self, block: u32) {
        if let Ok(mut inner) = self.mounted() {
            inner.used_blocks[block as usize] = false;
        }
    }

    /// Commit a file's new extent: update size and block list (attributes
    /// are preserved), persist the inode record, then release the replaced
    /// blocks. Data blocks must already be programmed -- the inode record is
    /// the commit point.
    pub(crate) fn commit_file(
        &self,
        path: &str,
        size: u32,
        blocks: Vec<u32>,
        freed: &[u32],
    ) -> FsResult<()> {
        let mut inner = self.mounted()?;
        let inode = inner
            .inodes
            .get_mut(path)
            .ok_or_else(|| FsError::NotFound(path.into()))?;
        inode.size = size;
        inode.blocks = blocks;
        let record = Record::Inode(inode.clone());
        self.persist(&mut inner, &record)?;
        for &block in freed {
            inner.used_blocks[block as usize] = false;
        }
        Ok(())
    }

    // ---- persistence internals ----

    fn mounted(&self) -> FsResult<RefMut<'_, Mounted>> {
        let inner = self.inner.borrow_mut();
        if inner.is_none() {
            return Err(FsError::Inval("filesystem not mounted".into()));
        }
        Ok(RefMut::map(inner, |opt| opt.as_mut().unwrap()))
    }

    fn read_segment(&self, segment: usize) -> FsResult<Vec<u8>> {
        let block_size = self.block_size();
        let mut image = vec![0u8; self.segment_bytes()];
        let dev = self.dev.borrow();
        for i in 0..self.cfg.meta_segment_blocks {
            let start = i as usize * block_size;
            dev.read(
                self.segment_start(segment) + i,
                0,
                &mut image[start..start + block_size],
            )?;
        }
        Ok(image)
    }

    /// Program `bytes` into a segment at `offset`, padding to the page size
    /// with `0xFF` so the tail stays erased.
    fn program_segment(&self, segment: usize, offset: usize, bytes: &[u8]) -> FsResult<()> {
        let block_size = self.block_size();
        let mut padded = bytes.to_vec();
        padded.resize(self.align_page(bytes.len()), 0xFF);

        let mut dev = self.dev.borrow_mut();
        let mut at = offset;
        let mut remaining = &padded[..];
        while !remaining.is_empty() {
            let block = self.segment_start(segment) + (at / block_size) as u32;
            let in_block = at % block_size;
            let chunk = remaining.len().min(block_size - in_block);
            dev.program(block, in_block as u32, &remaining[..chunk])?;
            at += chunk;
            remaining = &remaining[chunk..];
        }
        Ok(())
    }

    /// Append one record to the active segment, compacting into the other
    /// segment when it no longer fits. The in-memory state must already
    /// reflect the record.
    fn persist(&self, inner: &mut Mounted, record: &Record) -> FsResult<()> {
        let bytes = record.encode();
        let padded = self.align_page(bytes.len());
        if inner.seg_used + padded <= self.segment_bytes() {
            self.program_segment(inner.active, inner.seg_used, &bytes)?;
            inner.seg_used += padded;
        } else {
            self.compact(inner)?;
        }
        self.dev.borrow_mut().sync()
    }

    /// Rewrite the whole inode map into the other segment with a bumped
    /// sequence number. The header is programmed last: until it lands, a
    /// mount still selects the old segment, so a power cut mid-compaction
    /// loses nothing.
    fn compact(&self, inner: &mut Mounted) -> FsResult<()> {
        let target = 1 - inner.active;
        let seq = inner.seq + 1;
        debug!(seq, target, files = inner.inodes.len(), "compacting metadata");

        {
            let mut dev = self.dev.borrow_mut();
            for i in 0..self.cfg.meta_segment_blocks {
                dev.erase(self.segment_start(target) + i)?;
            }
        }

        let header = Record::Header(SegmentHeader {
            seq,
            block_size: self.block_size() as u32,
            block_count: self.block_count(),
        });
        let mut offset = self.align_page(header.encode().len());
        for inode in inner.inodes.values() {
            let bytes = Record::Inode(inode.clone()).encode();
            let padded = self.align_page(bytes.len());
            if offset + padded > self.segment_bytes() {
                warn!("metadata segment full during compaction");
                return Err(FsError::NoSpace);
            }
            self.program_segment(target, offset, &bytes)?;
            offset += padded;
        }
        self.program_segment(target, 0, &header.encode())?;

        {
            let mut dev = self.dev.borrow_mut();
            for i in 0..self.cfg.meta_segment_blocks {
                dev.erase(self.segment_start(inner.active) + i)?;
            }
        }

        inner.active = target;
        inner.seq = seq;
        inner.seg_used = offset;
        Ok(())
    }
}

fn validate_name(path: &str) -> FsResult<()> {
    if path.is_empty() || path.len() > NAME_MAX || !path.is_ascii() {
        return Err(FsError::Inval(format!("file name {path:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamBlockDevice;

    fn fresh_fs() -> Rc<Filesystem> {
        let dev = RamBlockDevice::shared(64, 4096, 256);
        let fs = Filesystem::new(dev, FsConfig::default());
        fs.format().unwrap();
        fs.mount().unwrap();
        fs
    }

    #[test]
    fn mount_unformatted_device_is_corrupt() {
        let dev = RamBlockDevice::shared(64, 4096, 256);
        let fs = Filesystem::new(dev, FsConfig::default());
        assert!(matches!(fs.mount(), Err(FsError::Corrupt(_))));
    }

    #[test]
    fn mount_is_idempotent() {
        let fs = fresh_fs();
        fs.mount().unwrap();
        fs.unmount().unwrap();
        fs.unmount().unwrap();
    }

    #[test]
    fn create_stat_remove() {
        let fs = fresh_fs();
        fs.create_file("a.dat").unwrap();
        assert_eq!(fs.stat("a.dat").unwrap().size, 0);
        assert!(matches!(fs.stat("b.dat"), Err(FsError::NotFound(_))));
        fs.remove("a.dat").unwrap();
        assert!(matches!(fs.stat("a.dat"), Err(FsError::NotFound(_))));
        // Idempotent
        fs.remove("a.dat").unwrap();
    }

    #[test]
    fn attrs_persist_across_remount() {
        let fs = fresh_fs();
        fs.create_file("log").unwrap();
        fs.set_attr("log", 0, &0x1234_5678u32.to_le_bytes()).unwrap();
        fs.unmount().unwrap();
        fs.mount().unwrap();
        let mut buf = [0u8; 8];
        let n = fs.get_attr("log", 0, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(u32::from_le_bytes(buf[..4].try_into().unwrap()), 0x1234_5678);
    }

    #[test]
    fn unset_attr_reads_back_empty() {
        let fs = fresh_fs();
        fs.create_file("f").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(fs.get_attr("f", 1, &mut buf).unwrap(), 0);
    }

    #[test]
    fn attr_slot_bounds_enforced() {
        let fs = fresh_fs();
        fs.create_file("f").unwrap();
        assert!(matches!(
            fs.set_attr("f", 4, &[0]),
            Err(FsError::Inval(_))
        ));
        assert!(matches!(
            fs.set_attr("f", 0, &[0u8; 9]),
            Err(FsError::Inval(_))
        ));
    }

    #[test]
    fn name_length_enforced() {
        let fs = fresh_fs();
        let long = "x".repeat(NAME_MAX + 1);
        assert!(matches!(fs.create_file(&long), Err(FsError::Inval(_))));
        fs.create_file(&"y".repeat(NAME_MAX)).unwrap();
    }

    #[test]
    fn metadata_survives_many_updates_via_compaction() {
        let fs = fresh_fs();
        fs.create_file("f").unwrap();
        // Far more attribute rewrites than one segment can hold as records.
        for i in 0..500u32 {
            fs.set_attr("f", 0, &i.to_le_bytes()).unwrap();
        }
        fs.unmount().unwrap();
        fs.mount().unwrap();
        let mut buf = [0u8; 4];
        fs.get_attr("f", 0, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 499);
    }

    #[test]
    fn format_destroys_files() {
        let fs = fresh_fs();
        fs.create_file("doomed").unwrap();
        fs.format().unwrap();
        fs.mount().unwrap();
        assert!(!fs.exists("doomed").unwrap());
    }
}
