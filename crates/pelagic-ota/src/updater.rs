//! Staged file-transfer state machine.
//!
//! The BLE adapter delivers an image in arbitrary-size chunks over an
//! unreliable link. A transfer declares its length and CRC32 up front,
//! streams bytes, and commits only when both check out. MCU firmware is
//! staged in a reserved raw-flash region the bootloader reads on the next
//! boot; auxiliary images (radio firmware, GNSS offline assistance) land in
//! the filesystem under their well-known names.
//!
//! Reserved-region layout for MCU firmware:
//!
//! ```text
//! [reserved_base + 0] image length (little-endian u32)
//! [reserved_base + 4] image CRC32  (little-endian u32)
//! [reserved_base + 8] image bytes
//! ```
//!
//! The header is written before any data, so aborting only has to erase the
//! first reserved block to cancel a staged update.

use std::rc::Rc;

use crc32fast::Hasher;
use tracing::{debug, info, trace, warn};

use pelagic_fs::{File, Filesystem, OpenFlags, SharedBlockDevice};

use crate::error::{OtaError, OtaResult};

/// Backing file for a radio coprocessor firmware image.
pub const RADIO_FIRMWARE_FILE: &str = "artic_firmware.dat";
/// Backing file for GNSS offline assistance data.
pub const GNSS_ASSIST_FILE: &str = "gps_config.dat";

/// Bytes reserved at the front of the staging region for length + CRC32.
pub const HEADER_SIZE: u32 = 8;

/// The three image classes the updater accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileId {
    McuFirmware,
    RadioFirmware,
    GnssAssist,
}

/// The staged-transfer contract, as seen by the BLE adapter.
pub trait FileUpdater {
    fn start_file_transfer(&mut self, file_id: FileId, length: u32, crc32: u32) -> OtaResult<()>;
    fn write_file_data(&mut self, data: &[u8]) -> OtaResult<()>;
    fn abort_file_transfer(&mut self) -> OtaResult<()>;
    fn complete_file_transfer(&mut self) -> OtaResult<()>;
    fn apply_file_update(&mut self) -> OtaResult<()>;
}

struct Transfer {
    file_id: FileId,
    expected_len: u32,
    expected_crc: u32,
    received: u32,
    running_crc: u32,
    /// Backing file for the auxiliary image classes.
    file: Option<File>,
}

/// Updater staging MCU firmware in a reserved block range of the shared
/// flash part and auxiliary images in the filesystem.
pub struct FlashFileUpdater {
    fs: Rc<Filesystem>,
    dev: SharedBlockDevice,
    reserved_base: u32,
    reserved_blocks: u32,
    transfer: Option<Transfer>,
}

impl FlashFileUpdater {
    pub fn new(
        fs: Rc<Filesystem>,
        dev: SharedBlockDevice,
        reserved_base: u32,
        reserved_blocks: u32,
    ) -> Self {
        Self {
            fs,
            dev,
            reserved_base,
            reserved_blocks,
            transfer: None,
        }
    }

    /// Capacity available to a staged image.
    pub fn reserved_capacity(&self) -> u32 {
        self.reserved_blocks * self.dev.borrow().block_size() - HEADER_SIZE
    }

    pub fn in_progress(&self) -> bool {
        self.transfer.is_some()
    }

    /// Erase any reserved block that is not already blank. Skipping blank
    /// blocks matters: most updates arrive into an already-aborted (erased)
    /// region and a block erase costs tens of milliseconds.
    fn erase_reserved(&mut self) -> OtaResult<()> {
        let mut dev = self.dev.borrow_mut();
        let probe = 256.min(dev.block_size() as usize);
        let mut buf = vec![0u8; probe];
        for i in 0..self.reserved_blocks {
            dev.read(self.reserved_base + i, 0, &mut buf)?;
            if buf.iter().any(|&b| b != 0xFF) {
                dev.erase(self.reserved_base + i)?;
            }
        }
        Ok(())
    }

    /// Program bytes at an absolute offset within the reserved region,
    /// splitting at block boundaries.
    fn program_reserved(&mut self, offset: u32, data: &[u8]) -> OtaResult<()> {
        let mut dev = self.dev.borrow_mut();
        let block_size = dev.block_size();
        let mut at = offset;
        let mut remaining = data;
        while !remaining.is_empty() {
            let block = self.reserved_base + at / block_size;
            let in_block = at % block_size;
            let chunk = remaining.len().min((block_size - in_block) as usize);
            dev.program(block, in_block, &remaining[..chunk])?;
            at += chunk as u32;
            remaining = &remaining[chunk..];
        }
        dev.sync()?;
        Ok(())
    }

    fn backing_name(file_id: FileId) -> Option<&'static str> {
        match file_id {
            FileId::McuFirmware => None,
            FileId::RadioFirmware => Some(RADIO_FIRMWARE_FILE),
            FileId::GnssAssist => Some(GNSS_ASSIST_FILE),
        }
    }

    /// Tear down the active transfer, deleting the partial artifact.
    fn abort_inner(&mut self) -> OtaResult<()> {
        let Some(transfer) = self.transfer.take() else {
            return Ok(());
        };
        match transfer.file_id {
            FileId::McuFirmware => {
                // Wiping the header is enough: the bootloader will not
                // install without it.
                self.dev.borrow_mut().erase(self.reserved_base)?;
            }
            id => {
                drop(transfer.file);
                let name = Self::backing_name(id).unwrap();
                self.fs.remove(name)?;
            }
        }
        Ok(())
    }
}

impl FileUpdater for FlashFileUpdater {
    fn start_file_transfer(&mut self, file_id: FileId, length: u32, crc32: u32) -> OtaResult<()> {
        if self.transfer.is_some() {
            warn!("start_file_transfer: transfer already in progress");
            return Err(OtaError::AlreadyInProgress);
        }
        if length == 0 || length > self.reserved_capacity() {
            warn!(length, "start_file_transfer: bad transfer size");
            return Err(OtaError::BadFileSize(length));
        }

        let file = match file_id {
            FileId::McuFirmware => {
                self.erase_reserved()?;
                self.program_reserved(0, &length.to_le_bytes())?;
                self.program_reserved(4, &crc32.to_le_bytes())?;
                None
            }
            id => {
                let name = Self::backing_name(id).unwrap();
                self.fs.remove(name)?;
                Some(File::open(
                    &self.fs,
                    name,
                    OpenFlags::WRITE | OpenFlags::CREATE,
                )?)
            }
        };

        info!(?file_id, length, crc32 = format_args!("{crc32:#010x}"), "file transfer started");
        self.transfer = Some(Transfer {
            file_id,
            expected_len: length,
            expected_crc: crc32,
            received: 0,
            running_crc: 0,
            file,
        });
        Ok(())
    }

    fn write_file_data(&mut self, data: &[u8]) -> OtaResult<()> {
        let Some(transfer) = self.transfer.as_mut() else {
            return Err(OtaError::NotStarted);
        };

        if transfer.received + data.len() as u32 > transfer.expected_len {
            self.abort_file_transfer()?;
            return Err(OtaError::Overflow);
        }

        match transfer.file_id {
            FileId::McuFirmware => {
                let offset = HEADER_SIZE + transfer.received;
                let transfer_received = transfer.received;
                self.program_reserved(offset, data)?;
                let transfer = self.transfer.as_mut().unwrap();
                transfer.received = transfer_received + data.len() as u32;
                let mut hasher = Hasher::new_with_initial(transfer.running_crc);
                hasher.update(data);
                transfer.running_crc = hasher.finalize();
                trace!(
                    received = transfer.received,
                    expected = transfer.expected_len,
                    "firmware data staged"
                );
            }
            _ => {
                transfer.file.as_mut().unwrap().write(data)?;
                transfer.received += data.len() as u32;
                let mut hasher = Hasher::new_with_initial(transfer.running_crc);
                hasher.update(data);
                transfer.running_crc = hasher.finalize();
                trace!(
                    received = transfer.received,
                    expected = transfer.expected_len,
                    "file data received"
                );
            }
        }
        Ok(())
    }

    fn abort_file_transfer(&mut self) -> OtaResult<()> {
        debug!("file transfer aborted");
        self.abort_inner()
    }

    fn complete_file_transfer(&mut self) -> OtaResult<()> {
        let Some(transfer) = self.transfer.as_ref() else {
            return Err(OtaError::NotStarted);
        };

        if transfer.received < transfer.expected_len {
            let (received, expected) = (transfer.received, transfer.expected_len);
            warn!(received, expected, "transfer incomplete");
            self.abort_inner()?;
            return Err(OtaError::Incomplete { received, expected });
        }
        if transfer.running_crc != transfer.expected_crc {
            let (computed, expected) = (transfer.running_crc, transfer.expected_crc);
            warn!(computed, expected, "transfer CRC failure");
            self.abort_inner()?;
            return Err(OtaError::CrcError { computed, expected });
        }
        debug!("file transfer complete");
        Ok(())
    }

    fn apply_file_update(&mut self) -> OtaResult<()> {
        let Some(transfer) = self.transfer.take() else {
            return Err(OtaError::NotStarted);
        };
        match transfer.file_id {
            FileId::McuFirmware => {
                // The staged image takes effect when the bootloader reads
                // the header on the next boot.
                info!("device reset required for MCU firmware update to take effect");
            }
            _ => {
                if let Some(file) = transfer.file {
                    file.close()?;
                }
                info!(?transfer.file_id, "file update applied");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pelagic_fs::{FsConfig, RamBlockDevice};

    const RESERVED_BASE: u32 = 48;
    const RESERVED_BLOCKS: u32 = 16;

    fn fresh_updater() -> (Rc<Filesystem>, FlashFileUpdater) {
        let dev = RamBlockDevice::shared(64, 4096, 256);
        let fs = Filesystem::new(
            dev.clone(),
            FsConfig {
                reserved_tail_blocks: RESERVED_BLOCKS,
                ..FsConfig::default()
            },
        );
        fs.format().unwrap();
        fs.mount().unwrap();
        let updater = FlashFileUpdater::new(fs.clone(), dev, RESERVED_BASE, RESERVED_BLOCKS);
        (fs, updater)
    }

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| i as u8).collect()
    }

    fn read_file(fs: &Rc<Filesystem>, name: &str) -> Vec<u8> {
        let mut f = File::open(fs, name, OpenFlags::READ).unwrap();
        let mut buf = vec![0u8; f.size() as usize];
        f.read(&mut buf).unwrap();
        buf
    }

    #[test]
    fn radio_firmware_happy_path() {
        let (fs, mut updater) = fresh_updater();
        let image = pattern(256);
        let crc = crc32fast::hash(&image);

        updater
            .start_file_transfer(FileId::RadioFirmware, 256, crc)
            .unwrap();
        // Deliver in uneven chunks.
        updater.write_file_data(&image[..100]).unwrap();
        updater.write_file_data(&image[100..101]).unwrap();
        updater.write_file_data(&image[101..]).unwrap();
        updater.complete_file_transfer().unwrap();
        updater.apply_file_update().unwrap();

        assert_eq!(read_file(&fs, RADIO_FIRMWARE_FILE), image);
        assert!(!updater.in_progress());
    }

    #[test]
    fn crc_mismatch_deletes_backing_file() {
        let (fs, mut updater) = fresh_updater();
        let mut image = pattern(256);
        let crc = crc32fast::hash(&image);
        image[17] ^= 0x01;

        updater
            .start_file_transfer(FileId::RadioFirmware, 256, crc)
            .unwrap();
        updater.write_file_data(&image).unwrap();
        let err = updater.complete_file_transfer().unwrap_err();
        assert!(matches!(err, OtaError::CrcError { .. }));
        assert!(!fs.exists(RADIO_FIRMWARE_FILE).unwrap());

        // A subsequent transfer starts cleanly.
        updater
            .start_file_transfer(FileId::RadioFirmware, 16, crc32fast::hash(&pattern(16)))
            .unwrap();
    }

    #[test]
    fn shortfall_is_incomplete() {
        let (_fs, mut updater) = fresh_updater();
        let image = pattern(128);
        updater
            .start_file_transfer(FileId::GnssAssist, 256, crc32fast::hash(&image))
            .unwrap();
        updater.write_file_data(&image).unwrap();
        assert!(matches!(
            updater.complete_file_transfer(),
            Err(OtaError::Incomplete {
                received: 128,
                expected: 256
            })
        ));
    }

    #[test]
    fn excess_is_overflow_and_aborts() {
        let (fs, mut updater) = fresh_updater();
        updater
            .start_file_transfer(FileId::GnssAssist, 64, 0)
            .unwrap();
        assert!(matches!(
            updater.write_file_data(&pattern(65)),
            Err(OtaError::Overflow)
        ));
        assert!(!updater.in_progress());
        assert!(!fs.exists(GNSS_ASSIST_FILE).unwrap());
    }

    #[test]
    fn second_start_rejected() {
        let (_fs, mut updater) = fresh_updater();
        updater
            .start_file_transfer(FileId::GnssAssist, 64, 0)
            .unwrap();
        assert!(matches!(
            updater.start_file_transfer(FileId::RadioFirmware, 64, 0),
            Err(OtaError::AlreadyInProgress)
        ));
    }

    #[test]
    fn zero_and_oversize_lengths_rejected() {
        let (_fs, mut updater) = fresh_updater();
        assert!(matches!(
            updater.start_file_transfer(FileId::McuFirmware, 0, 0),
            Err(OtaError::BadFileSize(0))
        ));
        let too_big = updater.reserved_capacity() + 1;
        assert!(matches!(
            updater.start_file_transfer(FileId::McuFirmware, too_big, 0),
            Err(OtaError::BadFileSize(_))
        ));
    }

    #[test]
    fn mcu_firmware_stages_header_and_data() {
        let (fs, mut updater) = fresh_updater();
        let image = pattern(5000);
        let crc = crc32fast::hash(&image);

        updater
            .start_file_transfer(FileId::McuFirmware, 5000, crc)
            .unwrap();
        updater.write_file_data(&image[..3000]).unwrap();
        updater.write_file_data(&image[3000..]).unwrap();
        updater.complete_file_transfer().unwrap();
        updater.apply_file_update().unwrap();

        let dev = fs.device();
        let dev = dev.borrow();
        let mut header = [0u8; 8];
        dev.read(RESERVED_BASE, 0, &mut header).unwrap();
        assert_eq!(u32::from_le_bytes(header[..4].try_into().unwrap()), 5000);
        assert_eq!(u32::from_le_bytes(header[4..].try_into().unwrap()), crc);

        // Image bytes start right after the header and cross a block
        // boundary.
        let mut staged = vec![0u8; 5000];
        let block_size = dev.block_size() as usize;
        let first = (block_size - HEADER_SIZE as usize).min(5000);
        dev.read(RESERVED_BASE, HEADER_SIZE, &mut staged[..first])
            .unwrap();
        dev.read(RESERVED_BASE + 1, 0, &mut staged[first..]).unwrap();
        assert_eq!(staged, image);
    }

    #[test]
    fn mcu_abort_erases_header_block() {
        let (fs, mut updater) = fresh_updater();
        updater
            .start_file_transfer(FileId::McuFirmware, 5000, 0xDEAD_BEEF)
            .unwrap();
        updater.write_file_data(&pattern(100)).unwrap();
        updater.abort_file_transfer().unwrap();

        let dev = fs.device();
        let dev = dev.borrow();
        let mut header = [0u8; 8];
        dev.read(RESERVED_BASE, 0, &mut header).unwrap();
        assert_eq!(header, [0xFF; 8]);
    }

    #[test]
    fn restage_over_previous_image_erases_stale_blocks() {
        let (fs, mut updater) = fresh_updater();
        let first = vec![0u8; 4096 * 2]; // all zero bits; stale unless erased
        updater
            .start_file_transfer(FileId::McuFirmware, first.len() as u32, crc32fast::hash(&first))
            .unwrap();
        updater.write_file_data(&first).unwrap();
        updater.complete_file_transfer().unwrap();
        updater.apply_file_update().unwrap();

        let second = pattern(4096 * 2);
        updater
            .start_file_transfer(
                FileId::McuFirmware,
                second.len() as u32,
                crc32fast::hash(&second),
            )
            .unwrap();
        updater.write_file_data(&second).unwrap();
        updater.complete_file_transfer().unwrap();

        // With NOR semantics, stale zero bits would corrupt the restaged
        // image unless the blocks were erased first.
        let dev = fs.device();
        let dev = dev.borrow();
        let mut staged = [0u8; 16];
        dev.read(RESERVED_BASE, HEADER_SIZE, &mut staged).unwrap();
        assert_eq!(&staged[..], &second[..16]);
    }

    #[test]
    fn running_crc_matches_reference_over_chunking() {
        let (_fs, mut updater) = fresh_updater();
        let image: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
        updater
            .start_file_transfer(FileId::RadioFirmware, image.len() as u32, crc32fast::hash(&image))
            .unwrap();
        for chunk in image.chunks(37) {
            updater.write_file_data(chunk).unwrap();
        }
        updater.complete_file_transfer().unwrap();
        updater.apply_file_update().unwrap();
    }
}
