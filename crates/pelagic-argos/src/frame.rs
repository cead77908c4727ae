//! Bit-exact Argos A2/A3 PTT frame assembly and downlink validation.
//!
//! An uplink transmission is laid out MSB first as:
//!
//! ```text
//! MSG_LEN(4)  ARGOS_ID(28)  USER_PAYLOAD(n)  STUFFING(0..31)  TAIL(0|7|8|9)
//! ```
//!
//! prefixed by a 24-bit total-bit count for the coprocessor's TX payload
//! register and zero-padded to a multiple of 3 bytes (the XMEM word size).
//! The 4-bit length code and the A3 tail-bit count are table lookups on the
//! 32-bit payload block count.

use pelagic_types::bitpack::{bytes_for_bits, extract_bits, pack_bits};
use pelagic_types::{crc16, ArgosMode};

use crate::error::{ArgosError, ArgosResult};
use crate::registers::{MAX_RX_SIZE_BYTES, MIN_RX_SIZE_BYTES};

/// Length codes indexed by `(stuffing + payload_bits - 8) / 32`.
const LENGTH_CODES: [u8; 8] = [0x0, 0x3, 0x5, 0x6, 0x9, 0xA, 0xC, 0xF];
/// A3 tail-bit counts, indexed the same way.
const TAIL_BITS: [u8; 8] = [7, 8, 9, 7, 8, 9, 7, 8];

/// Downlink ACK service identifier.
const ACK_SERVICE_ID: u32 = 0x00EBA;
/// Downlink ACK length code (fixed).
const ACK_LENGTH_CODE: u32 = 0x5;

/// An assembled TX frame: the bytes to burst into the TX payload register
/// (24-bit length prefix included) and the on-air bit count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxFrame {
    pub bytes: Vec<u8>,
    pub total_bits: u32,
}

/// Assemble a PTT frame around `payload_bits` bits of user payload.
///
/// Payloads whose length is not congruent to 24 mod 32 are zero-stuffed to
/// the next 32-bit boundary, as the waveform requires.
pub fn encode_uplink(
    mode: ArgosMode,
    device_id: u32,
    payload: &[u8],
    payload_bits: u32,
) -> ArgosResult<TxFrame> {
    if payload_bits == 0 || payload_bits as usize > payload.len() * 8 {
        return Err(ArgosError::BadPayload(format!(
            "{payload_bits} bits in a {}-byte buffer",
            payload.len()
        )));
    }

    let mut stuffing_bits = 0u32;
    if (payload_bits + 8) % 32 != 0 {
        stuffing_bits = 32 - ((payload_bits + 8) % 32);
    }

    let length_idx = ((stuffing_bits + payload_bits - 8) / 32) as usize;
    if length_idx >= LENGTH_CODES.len() {
        return Err(ArgosError::BadPayload(format!(
            "{payload_bits} payload bits exceed the PTT maximum"
        )));
    }
    let length_code = LENGTH_CODES[length_idx] as u32;
    let tail_bits = match mode {
        ArgosMode::A2 => 0u32,
        ArgosMode::A3 => TAIL_BITS[length_idx] as u32,
    };

    let total_bits = 4 + 28 + payload_bits + stuffing_bits + tail_bits;

    // 24-bit length prefix, rounded up to whole 3-byte XMEM words.
    let frame_bits = total_bits + 24;
    let mut bytes = vec![0u8; (frame_bits as usize + 23) / 24 * 3];
    let mut cursor = 0;

    pack_bits(total_bits, &mut bytes, &mut cursor, 24);
    pack_bits(length_code, &mut bytes, &mut cursor, 4);
    pack_bits(device_id, &mut bytes, &mut cursor, 28);

    let mut remaining = payload_bits as usize;
    let mut in_cursor = 0;
    while remaining > 0 {
        let bits = remaining.min(8);
        let byte = extract_bits(payload, &mut in_cursor, bits);
        pack_bits(byte, &mut bytes, &mut cursor, bits);
        remaining -= bits;
    }

    pack_bits(0, &mut bytes, &mut cursor, stuffing_bits as usize);
    pack_bits(0, &mut bytes, &mut cursor, tail_bits as usize);

    Ok(TxFrame { bytes, total_bits })
}

/// Assemble a downlink-acknowledgement frame.
///
/// The FCS is a CRC-16-CCITT over the 100-bit field set
/// `service_id(20) a_dcs(4) device_id(28) dl_msg_id(16) exec_report(4)
/// zero(28)` and is transmitted between the service id and those fields.
pub fn encode_ack(
    mode: ArgosMode,
    device_id: u32,
    a_dcs: u32,
    dl_msg_id: u32,
    exec_report: u32,
) -> TxFrame {
    let payload_bits = 96u32;
    let tail_bits: u32 = match mode {
        ArgosMode::A2 => 0,
        ArgosMode::A3 => 7,
    };

    // The prefix itself counts toward the ACK's length field.
    let total_bits = 24 + 4 + 20 + payload_bits + tail_bits;

    let mut crc_fields = vec![0u8; 13];
    let mut cursor = 0;
    pack_bits(ACK_SERVICE_ID, &mut crc_fields, &mut cursor, 20);
    pack_bits(a_dcs, &mut crc_fields, &mut cursor, 4);
    pack_bits(device_id, &mut crc_fields, &mut cursor, 28);
    pack_bits(dl_msg_id, &mut crc_fields, &mut cursor, 16);
    pack_bits(exec_report, &mut crc_fields, &mut cursor, 4);
    pack_bits(0, &mut crc_fields, &mut cursor, 28);
    let fcs = crc16::checksum(&crc_fields, 100) as u32;

    let mut bytes = vec![0u8; (total_bits as usize + 23) / 24 * 3];
    let mut cursor = 0;
    pack_bits(total_bits, &mut bytes, &mut cursor, 24);
    pack_bits(ACK_LENGTH_CODE, &mut bytes, &mut cursor, 4);
    pack_bits(ACK_SERVICE_ID, &mut bytes, &mut cursor, 20);
    pack_bits(fcs, &mut bytes, &mut cursor, 16);
    pack_bits(a_dcs, &mut bytes, &mut cursor, 4);
    pack_bits(device_id, &mut bytes, &mut cursor, 28);
    pack_bits(dl_msg_id, &mut bytes, &mut cursor, 16);
    pack_bits(exec_report, &mut bytes, &mut cursor, 4);
    pack_bits(0, &mut bytes, &mut cursor, 28);
    pack_bits(0, &mut bytes, &mut cursor, tail_bits as usize);

    TxFrame { bytes, total_bits }
}

/// A validated downlink packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RxPacket {
    pub data: Vec<u8>,
    pub size_bits: usize,
}

/// Validate the raw RX payload region read from XMEM: a 24-bit MSB-first
/// bit count, then the payload whose trailing CRC-16 must evaluate to zero.
/// Returns `None` for implausible lengths or CRC failure (the packet is
/// dropped, reception continues).
pub fn decode_downlink(region: &[u8]) -> Option<RxPacket> {
    if region.len() < 3 {
        return None;
    }
    let mut cursor = 0;
    let size_bits = extract_bits(region, &mut cursor, 24) as usize;

    if size_bits < 8 * MIN_RX_SIZE_BYTES || size_bits > 8 * (MAX_RX_SIZE_BYTES - 3) {
        tracing::trace!(size_bits, "downlink discarded: illegal size");
        return None;
    }
    let n_bytes = bytes_for_bits(size_bits);
    if region.len() < 3 + n_bytes {
        return None;
    }
    let data = region[3..3 + n_bytes].to_vec();

    if crc16::checksum(&data, size_bits) != 0 {
        tracing::trace!("downlink discarded: bad CRC");
        return None;
    }
    Some(RxPacket {
        data,
        size_bits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pelagic_types::bitpack::pack_bits;

    #[test]
    fn a3_frame_reference_vector() {
        // Device ID 0x01234567, A3, 24-byte payload (192 bits):
        // stuffing 24, length index 6 -> code 12, tail 7, 255 bits total.
        let payload = [0xA5u8; 24];
        let frame = encode_uplink(ArgosMode::A3, 0x0123_4567, &payload, 192).unwrap();
        assert_eq!(frame.total_bits, 255);
        // 255 + 24 prefix bits -> 279 -> 12 XMEM words -> 36 bytes.
        assert_eq!(frame.bytes.len(), 36);

        let mut cursor = 0;
        assert_eq!(extract_bits(&frame.bytes, &mut cursor, 24), 255);
        assert_eq!(extract_bits(&frame.bytes, &mut cursor, 4), 12);
        assert_eq!(extract_bits(&frame.bytes, &mut cursor, 28), 0x0123_4567);
        for _ in 0..24 {
            assert_eq!(extract_bits(&frame.bytes, &mut cursor, 8), 0xA5);
        }
        // Stuffing and tail are zero bits.
        assert_eq!(extract_bits(&frame.bytes, &mut cursor, 24), 0);
        assert_eq!(extract_bits(&frame.bytes, &mut cursor, 7), 0);
    }

    #[test]
    fn aligned_payload_needs_no_stuffing() {
        // 24 bits: (24 + 8) % 32 == 0, length index 0, A2 -> no tail.
        let frame = encode_uplink(ArgosMode::A2, 0x7, &[1, 2, 3], 24).unwrap();
        assert_eq!(frame.total_bits, 4 + 28 + 24);
        let mut cursor = 0;
        assert_eq!(extract_bits(&frame.bytes, &mut cursor, 24), 56);
        assert_eq!(extract_bits(&frame.bytes, &mut cursor, 4), 0);
    }

    #[test]
    fn oversize_payload_rejected() {
        let payload = [0u8; 64];
        assert!(encode_uplink(ArgosMode::A3, 1, &payload, 512).is_err());
    }

    #[test]
    fn ack_frame_layout() {
        let frame = encode_ack(ArgosMode::A3, 0x0123_4567, 0x2, 0xBEEF, 0x1);
        assert_eq!(frame.total_bits, 24 + 4 + 20 + 96 + 7);

        let mut cursor = 0;
        assert_eq!(extract_bits(&frame.bytes, &mut cursor, 24), frame.total_bits);
        assert_eq!(extract_bits(&frame.bytes, &mut cursor, 4), 0x5);
        assert_eq!(extract_bits(&frame.bytes, &mut cursor, 20), 0x00EBA);
        let fcs = extract_bits(&frame.bytes, &mut cursor, 16);
        assert_eq!(extract_bits(&frame.bytes, &mut cursor, 4), 0x2);
        assert_eq!(extract_bits(&frame.bytes, &mut cursor, 28), 0x0123_4567);
        assert_eq!(extract_bits(&frame.bytes, &mut cursor, 16), 0xBEEF);
        assert_eq!(extract_bits(&frame.bytes, &mut cursor, 4), 0x1);

        // Recompute the FCS over the protected fields and compare.
        let mut fields = vec![0u8; 13];
        let mut c = 0;
        pack_bits(0x00EBA, &mut fields, &mut c, 20);
        pack_bits(0x2, &mut fields, &mut c, 4);
        pack_bits(0x0123_4567, &mut fields, &mut c, 28);
        pack_bits(0xBEEF, &mut fields, &mut c, 16);
        pack_bits(0x1, &mut fields, &mut c, 4);
        pack_bits(0, &mut fields, &mut c, 28);
        assert_eq!(fcs, crc16::checksum(&fields, 100) as u32);
    }

    fn make_rx_region(payload: &[u8]) -> Vec<u8> {
        // Append the CRC so the full bit string checksums to zero.
        let bits = payload.len() * 8;
        let crc = crc16::checksum(payload, bits);
        let mut data = payload.to_vec();
        data.extend_from_slice(&crc.to_be_bytes());
        let total_bits = bits + 16;

        let mut region = vec![0u8; 3 + data.len()];
        let mut cursor = 0;
        pack_bits(total_bits as u32, &mut region, &mut cursor, 24);
        region[3..].copy_from_slice(&data);
        region
    }

    #[test]
    fn downlink_roundtrip() {
        let payload = b"\x05\xF0\x12\x34\x56\x78";
        let region = make_rx_region(payload);
        let packet = decode_downlink(&region).unwrap();
        assert_eq!(packet.size_bits, payload.len() * 8 + 16);
        assert_eq!(&packet.data[..payload.len()], payload);
    }

    #[test]
    fn downlink_bad_crc_dropped() {
        let mut region = make_rx_region(b"\x05\xF0\x12\x34\x56\x78");
        region[4] ^= 0x10;
        assert!(decode_downlink(&region).is_none());
    }

    #[test]
    fn downlink_illegal_sizes_dropped() {
        for bits in [0u32, 8, 24, 8 * 127] {
            let mut region = vec![0u8; MAX_RX_SIZE_BYTES];
            let mut cursor = 0;
            pack_bits(bits, &mut region, &mut cursor, 24);
            assert!(decode_downlink(&region).is_none(), "bits={bits}");
        }
    }
}
