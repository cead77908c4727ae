//! On-disk metadata record formats.
//!
//! Metadata lives in two alternating segments at the front of the device.
//! Each segment is a sequence of records, every record padded out to a page
//! boundary so it lands on freshly erased flash:
//!
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload]
//! [pad to page boundary]
//! ```
//!
//! The first record of a segment is a [`SegmentHeader`]; the rest are
//! [`InodeRec`]s and [`RemoveRec`]s replayed in order at mount. A record
//! whose length reads back as `0xFFFF_FFFF` marks the erased tail of the
//! segment; a CRC failure marks a torn append and ends replay the same way.

use crate::error::{FsError, FsResult};

pub const MAGIC: [u8; 4] = *b"PFS1";

/// Maximum file-name length in bytes.
pub const NAME_MAX: usize = 32;
/// Number of persistent attribute slots per file.
pub const ATTR_SLOTS: usize = 4;
/// Capacity of one attribute slot in bytes.
pub const ATTR_SIZE: usize = 8;

/// Bytes of framing before each record payload.
pub const RECORD_HDR: usize = 8;

const REC_HEADER: u8 = 1;
const REC_INODE: u8 = 2;
const REC_REMOVE: u8 = 3;

/// One persistent attribute slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttrSlot {
    pub len: u8,
    pub data: [u8; ATTR_SIZE],
}

/// Segment header: identifies the format and orders the two segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub seq: u32,
    pub block_size: u32,
    pub block_count: u32,
}

/// Current state of one file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InodeRec {
    pub name: String,
    pub size: u32,
    pub attrs: [AttrSlot; ATTR_SLOTS],
    pub blocks: Vec<u32>,
}

/// A record parsed out of a metadata segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Header(SegmentHeader),
    Inode(InodeRec),
    Remove { name: String },
}

impl Record {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Record::Header(h) => {
                payload.push(REC_HEADER);
                payload.extend_from_slice(&MAGIC);
                payload.extend_from_slice(&h.seq.to_le_bytes());
                payload.extend_from_slice(&h.block_size.to_le_bytes());
                payload.extend_from_slice(&h.block_count.to_le_bytes());
            }
            Record::Inode(inode) => {
                payload.push(REC_INODE);
                payload.push(inode.name.len() as u8);
                payload.extend_from_slice(inode.name.as_bytes());
                payload.extend_from_slice(&inode.size.to_le_bytes());
                for slot in &inode.attrs {
                    payload.push(slot.len);
                    payload.extend_from_slice(&slot.data);
                }
                payload.extend_from_slice(&(inode.blocks.len() as u32).to_le_bytes());
                for block in &inode.blocks {
                    payload.extend_from_slice(&block.to_le_bytes());
                }
            }
            Record::Remove { name } => {
                payload.push(REC_REMOVE);
                payload.push(name.len() as u8);
                payload.extend_from_slice(name.as_bytes());
            }
        }

        let mut buf = Vec::with_capacity(RECORD_HDR + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    /// Decode the record at `offset` within a segment image.
    ///
    /// Returns `Ok(None)` on the erased tail or a torn append (replay stops
    /// there); `Err` only on a structurally invalid payload that passed its
    /// CRC, which indicates real corruption.
    pub fn decode(image: &[u8], offset: usize) -> FsResult<Option<(Record, usize)>> {
        if offset + RECORD_HDR > image.len() {
            return Ok(None);
        }
        let len = u32::from_le_bytes(image[offset..offset + 4].try_into().unwrap());
        let crc = u32::from_le_bytes(image[offset + 4..offset + 8].try_into().unwrap());
        if len == u32::MAX {
            return Ok(None); // erased tail
        }
        let start = offset + RECORD_HDR;
        let end = start + len as usize;
        if len == 0 || end > image.len() {
            return Ok(None);
        }
        let payload = &image[start..end];
        if crc32fast::hash(payload) != crc {
            return Ok(None); // torn append
        }

        let record = Self::decode_payload(payload)?;
        Ok(Some((record, len as usize)))
    }

    fn decode_payload(payload: &[u8]) -> FsResult<Record> {
        let corrupt = |reason: &str| FsError::Corrupt(format!("metadata record: {reason}"));
        match payload[0] {
            REC_HEADER => {
                if payload.len() < 17 || payload[1..5] != MAGIC {
                    return Err(corrupt("bad segment header"));
                }
                Ok(Record::Header(SegmentHeader {
                    seq: u32::from_le_bytes(payload[5..9].try_into().unwrap()),
                    block_size: u32::from_le_bytes(payload[9..13].try_into().unwrap()),
                    block_count: u32::from_le_bytes(payload[13..17].try_into().unwrap()),
                }))
            }
            REC_INODE => {
                let name_len = payload[1] as usize;
                if name_len > NAME_MAX || payload.len() < 2 + name_len {
                    return Err(corrupt("bad inode name"));
                }
                let name = std::str::from_utf8(&payload[2..2 + name_len])
                    .map_err(|_| corrupt("inode name not ASCII"))?
                    .to_string();
                let mut at = 2 + name_len;
                let need = 4 + ATTR_SLOTS * (1 + ATTR_SIZE) + 4;
                if payload.len() < at + need {
                    return Err(corrupt("short inode"));
                }
                let size = u32::from_le_bytes(payload[at..at + 4].try_into().unwrap());
                at += 4;
                let mut attrs = [AttrSlot::default(); ATTR_SLOTS];
                for slot in &mut attrs {
                    slot.len = payload[at];
                    slot.data.copy_from_slice(&payload[at + 1..at + 1 + ATTR_SIZE]);
                    at += 1 + ATTR_SIZE;
                }
                let n_blocks = u32::from_le_bytes(payload[at..at + 4].try_into().unwrap()) as usize;
                at += 4;
                if payload.len() < at + n_blocks * 4 {
                    return Err(corrupt("short inode block list"));
                }
                let mut blocks = Vec::with_capacity(n_blocks);
                for _ in 0..n_blocks {
                    blocks.push(u32::from_le_bytes(payload[at..at + 4].try_into().unwrap()));
                    at += 4;
                }
                Ok(Record::Inode(InodeRec {
                    name,
                    size,
                    attrs,
                    blocks,
                }))
            }
            REC_REMOVE => {
                let name_len = payload[1] as usize;
                if name_len > NAME_MAX || payload.len() < 2 + name_len {
                    return Err(corrupt("bad remove record"));
                }
                let name = std::str::from_utf8(&payload[2..2 + name_len])
                    .map_err(|_| corrupt("remove name not ASCII"))?
                    .to_string();
                Ok(Record::Remove { name })
            }
            other => Err(corrupt(&format!("unknown record type {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inode() -> InodeRec {
        let mut attrs = [AttrSlot::default(); ATTR_SLOTS];
        attrs[0] = AttrSlot {
            len: 4,
            data: [1, 2, 3, 4, 0, 0, 0, 0],
        };
        InodeRec {
            name: "sensor.log.3".into(),
            size: 4096,
            attrs,
            blocks: vec![9, 10, 11],
        }
    }

    #[test]
    fn inode_roundtrip() {
        let rec = Record::Inode(sample_inode());
        let bytes = rec.encode();
        let (decoded, len) = Record::decode(&bytes, 0).unwrap().unwrap();
        assert_eq!(len + RECORD_HDR, bytes.len());
        assert_eq!(decoded, rec);
    }

    #[test]
    fn header_roundtrip() {
        let rec = Record::Header(SegmentHeader {
            seq: 7,
            block_size: 4096,
            block_count: 256,
        });
        let bytes = rec.encode();
        let (decoded, _) = Record::decode(&bytes, 0).unwrap().unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn erased_tail_ends_replay() {
        let image = vec![0xFFu8; 64];
        assert!(Record::decode(&image, 0).unwrap().is_none());
    }

    #[test]
    fn torn_record_ends_replay() {
        let mut bytes = Record::Remove {
            name: "gone".into(),
        }
        .encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        assert!(Record::decode(&bytes, 0).unwrap().is_none());
    }
}
