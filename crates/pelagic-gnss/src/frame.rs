//! UBX frame codec and the resynchronising stream parser.
//!
//! Every frame is `B5 62 class id len_lo len_hi payload ck_a ck_b` with the
//! Fletcher-style checksum computed over `class || id || length || payload`.
//! The parser keeps a rolling buffer across UART DMA segments so a frame
//! straddling two segments still assembles, and it resynchronises on any
//! corruption by advancing a single byte past the last sync candidate.

use bytes::{Buf, BytesMut};

/// First sync byte.
pub const SYNC1: u8 = 0xB5;
/// Second sync byte.
pub const SYNC2: u8 = 0x62;

/// Framing overhead: two sync bytes, class, id, 16-bit length, checksum.
pub const FRAME_OVERHEAD: usize = 8;

/// Upper bound on a payload we will wait for; a "length" beyond this is
/// treated as noise rather than an incomplete frame.
pub const MAX_PAYLOAD: usize = 2048;

/// One decoded UBX frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub class: u8,
    pub id: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(class: u8, id: u8, payload: Vec<u8>) -> Self {
        Self { class, id, payload }
    }

    /// Serialize with sync bytes and checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_OVERHEAD + self.payload.len());
        out.push(SYNC1);
        out.push(SYNC2);
        out.push(self.class);
        out.push(self.id);
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        let (ck_a, ck_b) = checksum(&out[2..]);
        out.push(ck_a);
        out.push(ck_b);
        out
    }

    /// Total encoded length of this frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }
}

/// 8-bit Fletcher checksum over `class || id || length || payload`.
pub fn checksum(bytes: &[u8]) -> (u8, u8) {
    let mut ck_a: u8 = 0;
    let mut ck_b: u8 = 0;
    for &b in bytes {
        ck_a = ck_a.wrapping_add(b);
        ck_b = ck_b.wrapping_add(ck_a);
    }
    (ck_a, ck_b)
}

/// Streaming parser with a rolling reassembly buffer.
#[derive(Default)]
pub struct FrameParser {
    buf: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Discard everything buffered (e.g. on a baud-rate change).
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete, checksum-valid frame, or `None` when more
    /// bytes are needed. Noise is skipped one byte at a time.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            // Hunt for SYNC1.
            match self.buf.iter().position(|&b| b == SYNC1) {
                Some(skip) => self.buf.advance(skip),
                None => {
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < FRAME_OVERHEAD {
                return None;
            }
            if self.buf[1] != SYNC2 {
                self.buf.advance(1);
                continue;
            }

            let len = u16::from_le_bytes([self.buf[4], self.buf[5]]) as usize;
            if len > MAX_PAYLOAD {
                // Implausible length: this was not a real frame start.
                self.buf.advance(1);
                continue;
            }
            let total = FRAME_OVERHEAD + len;
            if self.buf.len() < total {
                return None; // wait for the rest
            }

            let (ck_a, ck_b) = checksum(&self.buf[2..6 + len]);
            if ck_a != self.buf[6 + len] || ck_b != self.buf[7 + len] {
                // Restart the scan one byte past this sync candidate.
                self.buf.advance(1);
                continue;
            }

            let frame = Frame {
                class: self.buf[2],
                id: self.buf[3],
                payload: self.buf[6..6 + len].to_vec(),
            };
            self.buf.advance(total);
            return Some(frame);
        }
    }
}

/// Parse every valid frame out of a complete in-memory buffer.
pub fn parse_all(data: &[u8]) -> Vec<Frame> {
    let mut parser = FrameParser::new();
    parser.push(data);
    let mut frames = Vec::new();
    while let Some(frame) = parser.next_frame() {
        frames.push(frame);
    }
    frames
}
