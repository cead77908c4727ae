//! Assistance-data handling: offline (MGA-ANO) record selection from the
//! filesystem and the shared sizing limits for the in-memory navigation
//! database.

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, trace, warn};

use pelagic_fs::{File, Whence};

use crate::error::GnssResult;
use crate::frame::FRAME_OVERHEAD;
use crate::messages::{class, mga, MgaAnoDate};

/// Bound on the in-memory navigation database (DBD dump or ANO selection).
pub const NAV_DB_MAX: usize = 16 * 1024;

/// Largest single UBX message we expect in an assistance file.
pub const MAX_PACKET_LEN: usize = 512;

/// Offline records staler than this are unusable.
const STALE_SECS: i64 = 24 * 3600;

/// The run of MGA-ANO records selected for upload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnoSelection {
    /// Concatenated frames, ready to stream.
    pub data: Vec<u8>,
    pub num_messages: u32,
    /// File offset where the selected run starts; pass back in on the next
    /// call to skip straight to it.
    pub start_pos: u32,
}

/// Scan an offline-assistance file for the contiguous run of MGA-ANO
/// records dated nearest to `now` and copy it out, bounded by
/// `buffer_size`.
///
/// Records are grouped by date in file order; the scan keeps the best run
/// seen so far and stops as soon as dates start moving away again, so only
/// the leading match is taken when two runs tie ("first encountered wins").
/// A best distance of 24 hours or more marks the whole file stale: the
/// returned selection is empty and `start_pos` points at end of file so
/// later calls skip the scan.
pub fn select_ano_records(
    file: &mut File,
    buffer_size: usize,
    now: DateTime<Utc>,
    start_pos: u32,
) -> GnssResult<AnoSelection> {
    let mut selection = AnoSelection {
        start_pos,
        ..AnoSelection::default()
    };
    let mut offset = start_pos;
    let mut best_delta = i64::MAX;

    debug!(size = file.size(), start_pos, "scanning offline assistance");
    if offset != 0 {
        file.seek(offset as i64, Whence::Set)?;
    }

    loop {
        let mut header = [0u8; 6];
        if file.read(&mut header)? != header.len() {
            trace!("end of assistance file");
            break;
        }
        let payload_len = u16::from_le_bytes([header[4], header[5]]) as usize;
        let msg_len = payload_len + FRAME_OVERHEAD;
        if msg_len > MAX_PACKET_LEN {
            warn!(msg_len, "unexpected message size in assistance file");
            break;
        }

        let mut rest = vec![0u8; payload_len + 2];
        if file.read(&mut rest)? != rest.len() {
            warn!("unexpected end of assistance file");
            break;
        }

        if header[2] == class::MGA && header[3] == mga::ID_ANO {
            let date = MgaAnoDate::decode(&rest)?;
            let noon = NaiveDate::from_ymd_opt(2000 + date.year as i32, date.month as u32, date.day as u32)
                .and_then(|d| d.and_hms_opt(12, 0, 0))
                .map(|d| d.and_utc());
            let Some(noon) = noon else {
                warn!(?date, "invalid date in assistance record");
                break;
            };
            let delta = (noon.timestamp() - now.timestamp()).abs();

            if delta < best_delta {
                best_delta = delta;
                selection.data.clear();
                selection.num_messages = 0;
                selection.start_pos = offset;
            } else if delta > best_delta {
                // Dates are moving away from the best run; done.
                debug!(
                    messages = selection.num_messages,
                    start = selection.start_pos,
                    "selected assistance run"
                );
                break;
            }

            if selection.data.len() + msg_len < buffer_size {
                selection.data.extend_from_slice(&header);
                selection.data.extend_from_slice(&rest);
                selection.num_messages += 1;
            } else {
                warn!("assistance buffer overflow; truncating selection");
                break;
            }
        }
        offset += msg_len as u32;
    }

    if best_delta >= STALE_SECS {
        debug!("offline assistance is stale");
        selection.start_pos = file.size();
        selection.data.clear();
        selection.num_messages = 0;
    }
    Ok(selection)
}
