//! Sparse per-sensor calibration values persisted to `<name>.CAL`.
//!
//! Each sensor's calibration is a bag of `(register offset, value)` pairs.
//! The backing file is a flat sequence of little-endian `(u32, f64)`
//! records rewritten in full whenever anything changed -- the files are a
//! few dozen entries at most, and a full rewrite keeps the format trivial
//! for the factory provisioning tools that also parse it.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::{debug, warn};

use pelagic_fs::{File, Filesystem, OpenFlags};

use crate::error::{CalibError, CalibResult};

const RECORD_LEN: usize = 4 + 8;

pub struct Calibration {
    fs: Rc<Filesystem>,
    filename: String,
    map: BTreeMap<u32, f64>,
    dirty: bool,
}

impl Calibration {
    /// Open the calibration named `name`, loading `<name>.CAL` if present.
    /// A missing, truncated or otherwise unreadable file yields an empty
    /// calibration (the sensor falls back to its defaults).
    pub fn open(fs: &Rc<Filesystem>, name: &str) -> Self {
        let filename = format!("{name}.CAL");
        let mut this = Self {
            fs: fs.clone(),
            filename,
            map: BTreeMap::new(),
            dirty: false,
        };
        if let Err(e) = this.deserialize() {
            warn!(file = %this.filename, error = %e, "calibration missing or corrupted");
            this.map.clear();
        }
        this
    }

    /// Value at `offset`; fails when the pair has never been written.
    pub fn read(&self, offset: u32) -> CalibResult<f64> {
        self.map
            .get(&offset)
            .copied()
            .ok_or(CalibError::KeyNotFound(offset))
    }

    /// Insert or overwrite the value at `offset`.
    pub fn write(&mut self, offset: u32, value: f64) {
        self.map.insert(offset, value);
        self.dirty = true;
    }

    /// Discard every pair. Takes effect on the next save.
    pub fn reset(&mut self) {
        self.map.clear();
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Serialize now if anything changed since open (or unconditionally
    /// with `force`).
    pub fn save(&mut self, force: bool) -> CalibResult<()> {
        if self.dirty || force {
            self.serialize()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn deserialize(&mut self) -> CalibResult<()> {
        let mut file = File::open(&self.fs, &self.filename, OpenFlags::READ)?;
        let mut record = [0u8; RECORD_LEN];
        loop {
            if file.read(&mut record)? != RECORD_LEN {
                break;
            }
            let offset = u32::from_le_bytes(record[..4].try_into().unwrap());
            let value = f64::from_le_bytes(record[4..].try_into().unwrap());
            self.map.insert(offset, value);
        }
        Ok(())
    }

    fn serialize(&self) -> CalibResult<()> {
        let mut file = File::open(
            &self.fs,
            &self.filename,
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        )?;
        for (offset, value) in &self.map {
            file.write(&offset.to_le_bytes())?;
            file.write(&value.to_le_bytes())?;
        }
        file.close()?;
        debug!(file = %self.filename, pairs = self.map.len(), "calibration saved");
        Ok(())
    }
}

impl Drop for Calibration {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.save(false) {
                warn!(file = %self.filename, error = %e, "calibration save on close failed");
            }
        }
    }
}

/// Registry of named calibrations so a host command can target any sensor
/// and a shutdown path can save everything at once.
#[derive(Default)]
pub struct CalibrationRegistry {
    entries: BTreeMap<String, Rc<RefCell<Calibration>>>,
}

impl CalibrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a calibration under `name`. Duplicate names are rejected.
    pub fn add(&mut self, name: &str, cal: Rc<RefCell<Calibration>>) -> CalibResult<()> {
        if self.entries.contains_key(name) {
            return Err(CalibError::DuplicateName(name.into()));
        }
        self.entries.insert(name.into(), cal);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> CalibResult<()> {
        self.entries
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CalibError::NameNotFound(name.into()))
    }

    pub fn find(&self, name: &str) -> CalibResult<Rc<RefCell<Calibration>>> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| CalibError::NameNotFound(name.into()))
    }

    /// Save every registered calibration, optionally unconditionally.
    pub fn save_all(&self, force: bool) -> CalibResult<()> {
        for cal in self.entries.values() {
            cal.borrow_mut().save(force)?;
        }
        Ok(())
    }
}
