//! Transceiver firmware image format.
//!
//! The image file starts with a 24-byte header of `(length, CRC)` pairs for
//! the XMEM, YMEM and PMEM sections, in that order. The body is a stream of
//! records, one per memory word: a 3-byte little-endian target address
//! followed by the word data (3 bytes for XMEM/YMEM, 4 for PMEM). Records
//! for one section are ordered by address but may contain gaps; the
//! uploader exploits contiguity to batch words into bursts.

use crate::error::{ArgosError, ArgosResult};
use crate::registers::MemId;

/// Byte length of the address field preceding each data word.
pub const ADDRESS_LEN: usize = 3;

/// Upload order of the three sections.
pub const SECTION_ORDER: [MemId; 3] = [MemId::Xmem, MemId::Ymem, MemId::Pmem];

/// Section lengths and expected CRCs from the image header. Lengths count
/// file bytes (address + data records), not device words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FirmwareHeader {
    pub xmem_length: u32,
    pub xmem_crc: u32,
    pub ymem_length: u32,
    pub ymem_crc: u32,
    pub pmem_length: u32,
    pub pmem_crc: u32,
}

impl FirmwareHeader {
    pub const LEN: usize = 24;

    pub fn from_bytes(bytes: &[u8; Self::LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        Self {
            xmem_length: word(0),
            xmem_crc: word(1),
            ymem_length: word(2),
            ymem_crc: word(3),
            pmem_length: word(4),
            pmem_crc: word(5),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        for (i, v) in [
            self.xmem_length,
            self.xmem_crc,
            self.ymem_length,
            self.ymem_crc,
            self.pmem_length,
            self.pmem_crc,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// File-byte length of the given section.
    pub fn section_length(&self, mem: MemId) -> ArgosResult<u32> {
        let len = match mem {
            MemId::Xmem => self.xmem_length,
            MemId::Ymem => self.ymem_length,
            MemId::Pmem => self.pmem_length,
            MemId::Iomem => return Err(ArgosError::BadImage("IOMEM section in image".into())),
        };
        let record = (ADDRESS_LEN + mem.word_len()) as u32;
        if len % record != 0 {
            return Err(ArgosError::BadImage(format!(
                "{mem:?} section length {len} not a multiple of its record size"
            )));
        }
        Ok(len)
    }

    pub fn section_crc(&self, mem: MemId) -> u32 {
        match mem {
            MemId::Xmem => self.xmem_crc,
            MemId::Ymem => self.ymem_crc,
            MemId::Pmem => self.pmem_crc,
            MemId::Iomem => 0,
        }
    }
}

/// Encode one `(address, word)` record as stored in the image file.
pub fn encode_record(mem: MemId, address: u32, word: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(ADDRESS_LEN + mem.word_len());
    out.extend_from_slice(&address.to_le_bytes()[..ADDRESS_LEN]);
    out.extend_from_slice(&word.to_le_bytes()[..mem.word_len()]);
    out
}

/// Decode the `(address, word)` record at the head of `bytes`.
pub fn decode_record(mem: MemId, bytes: &[u8]) -> ArgosResult<(u32, u32)> {
    let need = ADDRESS_LEN + mem.word_len();
    if bytes.len() < need {
        return Err(ArgosError::BadImage("truncated firmware record".into()));
    }
    let mut address = [0u8; 4];
    address[..ADDRESS_LEN].copy_from_slice(&bytes[..ADDRESS_LEN]);
    let mut word = [0u8; 4];
    word[..mem.word_len()].copy_from_slice(&bytes[ADDRESS_LEN..need]);
    Ok((u32::from_le_bytes(address), u32::from_le_bytes(word)))
}

/// Reverse a word into the big-endian order the DSP expects on the wire.
pub fn word_to_wire(word: u32, word_len: usize) -> Vec<u8> {
    let le = word.to_le_bytes();
    le[..word_len].iter().rev().copied().collect()
}

/// Reassemble a value from wire-order bytes.
pub fn wire_to_word(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}
