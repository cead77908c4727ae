//! Fixed-capacity file with a wrap-around cursor.
//!
//! The write cursor is kept in persistent attribute slot 0 so that the
//! position survives reboot: a logger can keep overwriting its oldest bytes
//! for months without ever scanning the file to find where it left off.

use std::rc::Rc;

use tracing::warn;

use crate::error::FsResult;
use crate::file::{File, OpenFlags, Whence};
use crate::fs::Filesystem;

/// Attribute slot holding the persisted cursor.
const CURSOR_SLOT: usize = 0;

pub struct CircularFile {
    fs: Rc<Filesystem>,
    path: String,
    file: File,
    max_size: u32,
    offset: u32,
    writable: bool,
    closed: bool,
}

impl CircularFile {
    /// Open a circular file of logical capacity `max_size`.
    ///
    /// With `CREATE` the cursor starts at zero and is stored immediately;
    /// otherwise it is restored from the attribute. A file opened read-only
    /// that has not yet wrapped (stored size below capacity) reads from the
    /// beginning regardless of the stored cursor.
    pub fn open(
        fs: &Rc<Filesystem>,
        path: &str,
        flags: OpenFlags,
        max_size: u32,
    ) -> FsResult<Self> {
        let file = File::open(fs, path, flags)?;

        let mut offset = 0u32;
        if flags.contains(OpenFlags::CREATE) {
            fs.set_attr(path, CURSOR_SLOT, &offset.to_le_bytes())?;
        } else {
            let mut buf = [0u8; 4];
            if fs.get_attr(path, CURSOR_SLOT, &mut buf)? >= 4 {
                offset = u32::from_le_bytes(buf);
            }
        }

        let writable = flags.contains(OpenFlags::WRITE);
        if !writable && file.size() < max_size {
            // Pre-wrap file: oldest data is at the start.
            offset = 0;
        }

        let mut this = Self {
            fs: fs.clone(),
            path: path.into(),
            file,
            max_size,
            offset: 0,
            writable,
            closed: false,
        };
        this.seek(offset)?;
        Ok(this)
    }

    /// Current cursor position.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Stored size of the underlying file.
    pub fn size(&self) -> u32 {
        self.file.size()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let n = self.file.read(buf)?;
        self.advance(n as u32)?;
        Ok(n)
    }

    pub fn write(&mut self, data: &[u8]) -> FsResult<usize> {
        let n = self.file.write(data)?;
        self.advance(n as u32)?;
        Ok(n)
    }

    /// Position the cursor, modulo capacity.
    pub fn seek(&mut self, offset: u32) -> FsResult<u32> {
        self.offset = offset % self.max_size;
        self.file.seek(self.offset as i64, Whence::Set)?;
        Ok(self.offset)
    }

    pub fn flush(&mut self) -> FsResult<()> {
        self.file.flush()
    }

    /// Flush, store the cursor when writable, and consume the handle.
    pub fn close(mut self) -> FsResult<()> {
        self.closed = true;
        if self.writable {
            self.fs
                .set_attr(&self.path, CURSOR_SLOT, &self.offset.to_le_bytes())?;
        }
        self.file.flush()
    }

    fn advance(&mut self, n: u32) -> FsResult<()> {
        self.offset += n;
        if self.offset >= self.max_size {
            self.offset %= self.max_size;
            self.file.seek(self.offset as i64, Whence::Set)?;
        }
        Ok(())
    }
}

impl Drop for CircularFile {
    fn drop(&mut self) {
        if !self.closed && self.writable {
            if let Err(e) = self
                .fs
                .set_attr(&self.path, CURSOR_SLOT, &self.offset.to_le_bytes())
            {
                warn!(path = %self.path, error = %e, "failed to store circular cursor");
            }
        }
    }
}
