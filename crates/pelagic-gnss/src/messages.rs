//! Typed UBX messages: class/id constants and explicit little-endian
//! payload codecs for the messages the driver exchanges.
//!
//! Decoders are written against the receiver generation's fixed payload
//! sizes; encoders exist where the driver (or a test double) produces the
//! message.

use crate::error::{GnssError, GnssResult};
use crate::keys::key_size;

pub mod class {
    pub const NAV: u8 = 0x01;
    pub const ACK: u8 = 0x05;
    pub const CFG: u8 = 0x06;
    pub const MGA: u8 = 0x13;
    /// Deliberately invalid class used to probe the link for a NACK.
    pub const BAD: u8 = 0x66;
}

pub mod nav {
    pub const ID_STATUS: u8 = 0x03;
    pub const ID_DOP: u8 = 0x04;
    pub const ID_PVT: u8 = 0x07;
    pub const ID_SAT: u8 = 0x35;
}

pub mod ack {
    pub const ID_NACK: u8 = 0x00;
    pub const ID_ACK: u8 = 0x01;
}

pub mod cfg {
    pub const ID_MSG: u8 = 0x01;
    pub const ID_RST: u8 = 0x04;
    pub const ID_CFG: u8 = 0x09;
    pub const ID_VALSET: u8 = 0x8A;
    pub const ID_VALGET: u8 = 0x8B;
}

pub mod mga {
    pub const ID_ANO: u8 = 0x20;
    pub const ID_INI: u8 = 0x40;
    pub const ID_ACK: u8 = 0x60;
    pub const ID_DBD: u8 = 0x80;

    /// MGA-INI type byte for UTC time assistance.
    pub const INI_TYPE_TIME_UTC: u8 = 0x10;
}

fn need(payload: &[u8], len: usize, what: &str) -> GnssResult<()> {
    if payload.len() < len {
        return Err(GnssError::BadFrame(format!(
            "{what}: {} bytes, need {len}",
            payload.len()
        )));
    }
    Ok(())
}

fn u16_at(p: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(p[at..at + 2].try_into().unwrap())
}

fn u32_at(p: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(p[at..at + 4].try_into().unwrap())
}

fn i32_at(p: &[u8], at: usize) -> i32 {
    i32::from_le_bytes(p[at..at + 4].try_into().unwrap())
}

/// ACK-ACK / ACK-NACK payload: the class and id being acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckPayload {
    pub cls: u8,
    pub id: u8,
}

impl AckPayload {
    pub fn decode(payload: &[u8]) -> GnssResult<Self> {
        need(payload, 2, "ACK")?;
        Ok(Self {
            cls: payload[0],
            id: payload[1],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        vec![self.cls, self.id]
    }
}

/// NAV-PVT (position/velocity/time), 92-byte payload.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NavPvt {
    pub itow: u32,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub min: u8,
    pub sec: u8,
    pub valid: u8,
    pub t_acc: u32,
    pub nano: i32,
    pub fix_type: u8,
    pub flags: u8,
    pub flags2: u8,
    pub num_sv: u8,
    pub lon: i32,
    pub lat: i32,
    pub height: i32,
    pub h_msl: i32,
    pub h_acc: u32,
    pub v_acc: u32,
    pub vel_n: i32,
    pub vel_e: i32,
    pub vel_d: i32,
    pub g_speed: i32,
    pub head_mot: i32,
    pub s_acc: u32,
    pub head_acc: u32,
    pub p_dop: u16,
    pub head_veh: i32,
}

impl NavPvt {
    pub const LEN: usize = 92;

    pub fn decode(payload: &[u8]) -> GnssResult<Self> {
        need(payload, Self::LEN, "NAV-PVT")?;
        Ok(Self {
            itow: u32_at(payload, 0),
            year: u16_at(payload, 4),
            month: payload[6],
            day: payload[7],
            hour: payload[8],
            min: payload[9],
            sec: payload[10],
            valid: payload[11],
            t_acc: u32_at(payload, 12),
            nano: i32_at(payload, 16),
            fix_type: payload[20],
            flags: payload[21],
            flags2: payload[22],
            num_sv: payload[23],
            lon: i32_at(payload, 24),
            lat: i32_at(payload, 28),
            height: i32_at(payload, 32),
            h_msl: i32_at(payload, 36),
            h_acc: u32_at(payload, 40),
            v_acc: u32_at(payload, 44),
            vel_n: i32_at(payload, 48),
            vel_e: i32_at(payload, 52),
            vel_d: i32_at(payload, 56),
            g_speed: i32_at(payload, 60),
            head_mot: i32_at(payload, 64),
            s_acc: u32_at(payload, 68),
            head_acc: u32_at(payload, 72),
            p_dop: u16_at(payload, 76),
            head_veh: i32_at(payload, 84),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut p = vec![0u8; Self::LEN];
        p[0..4].copy_from_slice(&self.itow.to_le_bytes());
        p[4..6].copy_from_slice(&self.year.to_le_bytes());
        p[6] = self.month;
        p[7] = self.day;
        p[8] = self.hour;
        p[9] = self.min;
        p[10] = self.sec;
        p[11] = self.valid;
        p[12..16].copy_from_slice(&self.t_acc.to_le_bytes());
        p[16..20].copy_from_slice(&self.nano.to_le_bytes());
        p[20] = self.fix_type;
        p[21] = self.flags;
        p[22] = self.flags2;
        p[23] = self.num_sv;
        p[24..28].copy_from_slice(&self.lon.to_le_bytes());
        p[28..32].copy_from_slice(&self.lat.to_le_bytes());
        p[32..36].copy_from_slice(&self.height.to_le_bytes());
        p[36..40].copy_from_slice(&self.h_msl.to_le_bytes());
        p[40..44].copy_from_slice(&self.h_acc.to_le_bytes());
        p[44..48].copy_from_slice(&self.v_acc.to_le_bytes());
        p[48..52].copy_from_slice(&self.vel_n.to_le_bytes());
        p[52..56].copy_from_slice(&self.vel_e.to_le_bytes());
        p[56..60].copy_from_slice(&self.vel_d.to_le_bytes());
        p[60..64].copy_from_slice(&self.g_speed.to_le_bytes());
        p[64..68].copy_from_slice(&self.head_mot.to_le_bytes());
        p[68..72].copy_from_slice(&self.s_acc.to_le_bytes());
        p[72..76].copy_from_slice(&self.head_acc.to_le_bytes());
        p[76..78].copy_from_slice(&self.p_dop.to_le_bytes());
        p[84..88].copy_from_slice(&self.head_veh.to_le_bytes());
        p
    }
}

/// NAV-DOP, 18-byte payload; values scaled by 0.01.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NavDop {
    pub itow: u32,
    pub g_dop: u16,
    pub p_dop: u16,
    pub t_dop: u16,
    pub v_dop: u16,
    pub h_dop: u16,
    pub n_dop: u16,
    pub e_dop: u16,
}

impl NavDop {
    pub const LEN: usize = 18;

    pub fn decode(payload: &[u8]) -> GnssResult<Self> {
        need(payload, Self::LEN, "NAV-DOP")?;
        Ok(Self {
            itow: u32_at(payload, 0),
            g_dop: u16_at(payload, 4),
            p_dop: u16_at(payload, 6),
            t_dop: u16_at(payload, 8),
            v_dop: u16_at(payload, 10),
            h_dop: u16_at(payload, 12),
            n_dop: u16_at(payload, 14),
            e_dop: u16_at(payload, 16),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut p = vec![0u8; Self::LEN];
        p[0..4].copy_from_slice(&self.itow.to_le_bytes());
        for (i, v) in [
            self.g_dop, self.p_dop, self.t_dop, self.v_dop, self.h_dop, self.n_dop, self.e_dop,
        ]
        .into_iter()
        .enumerate()
        {
            p[4 + i * 2..6 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        p
    }
}

/// NAV-STATUS, 16-byte payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NavStatus {
    pub itow: u32,
    pub gps_fix: u8,
    pub flags: u8,
    pub fix_stat: u8,
    pub flags2: u8,
    /// Time to first fix, ms.
    pub ttff: u32,
    /// Milliseconds since startup.
    pub msss: u32,
}

impl NavStatus {
    pub const LEN: usize = 16;

    pub fn decode(payload: &[u8]) -> GnssResult<Self> {
        need(payload, Self::LEN, "NAV-STATUS")?;
        Ok(Self {
            itow: u32_at(payload, 0),
            gps_fix: payload[4],
            flags: payload[5],
            fix_stat: payload[6],
            flags2: payload[7],
            ttff: u32_at(payload, 8),
            msss: u32_at(payload, 12),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut p = vec![0u8; Self::LEN];
        p[0..4].copy_from_slice(&self.itow.to_le_bytes());
        p[4] = self.gps_fix;
        p[5] = self.flags;
        p[6] = self.fix_stat;
        p[7] = self.flags2;
        p[8..12].copy_from_slice(&self.ttff.to_le_bytes());
        p[12..16].copy_from_slice(&self.msss.to_le_bytes());
        p
    }
}

/// One satellite in a NAV-SAT report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SatInfo {
    pub gnss_id: u8,
    pub sv_id: u8,
    /// Carrier-to-noise density, dBHz.
    pub cno: u8,
    /// Signal quality indicator (0..7) from the flags word.
    pub quality: u8,
}

/// NAV-SAT satellite-visibility snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NavSat {
    pub itow: u32,
    pub svs: Vec<SatInfo>,
}

impl NavSat {
    pub fn decode(payload: &[u8]) -> GnssResult<Self> {
        need(payload, 8, "NAV-SAT")?;
        let num_svs = payload[5] as usize;
        need(payload, 8 + num_svs * 12, "NAV-SAT satellites")?;
        let mut svs = Vec::with_capacity(num_svs);
        for i in 0..num_svs {
            let at = 8 + i * 12;
            let flags = u32_at(payload, at + 8);
            svs.push(SatInfo {
                gnss_id: payload[at],
                sv_id: payload[at + 1],
                cno: payload[at + 2],
                quality: (flags & 0x7) as u8,
            });
        }
        Ok(Self {
            itow: u32_at(payload, 0),
            svs,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut p = vec![0u8; 8 + self.svs.len() * 12];
        p[0..4].copy_from_slice(&self.itow.to_le_bytes());
        p[4] = 1; // version
        p[5] = self.svs.len() as u8;
        for (i, sv) in self.svs.iter().enumerate() {
            let at = 8 + i * 12;
            p[at] = sv.gnss_id;
            p[at + 1] = sv.sv_id;
            p[at + 2] = sv.cno;
            p[at + 8..at + 12].copy_from_slice(&(sv.quality as u32).to_le_bytes());
        }
        p
    }
}

/// MGA-ACK-DATA0, 8-byte payload. For a DBD poll, `msg_payload_start`
/// carries the number of DBD messages that will follow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MgaAck {
    pub info_code: u8,
    pub msg_id: u8,
    pub msg_payload_start: u32,
}

impl MgaAck {
    pub const LEN: usize = 8;

    pub fn decode(payload: &[u8]) -> GnssResult<Self> {
        need(payload, Self::LEN, "MGA-ACK")?;
        Ok(Self {
            info_code: payload[2],
            msg_id: payload[3],
            msg_payload_start: u32_at(payload, 4),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut p = vec![0u8; Self::LEN];
        p[0] = 0x01; // type: ACK
        p[2] = self.info_code;
        p[3] = self.msg_id;
        p[4..8].copy_from_slice(&self.msg_payload_start.to_le_bytes());
        p
    }

    pub fn is_ack(&self) -> bool {
        self.info_code == 0
    }
}

/// Date tag of an MGA-ANO offline-assistance record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MgaAnoDate {
    /// Years since 2000.
    pub year: u8,
    pub month: u8,
    pub day: u8,
}

impl MgaAnoDate {
    pub fn decode(payload: &[u8]) -> GnssResult<Self> {
        need(payload, 8, "MGA-ANO")?;
        Ok(Self {
            year: payload[4],
            month: payload[5],
            day: payload[6],
        })
    }

    /// Place the date bytes into an otherwise-zero 76-byte ANO payload
    /// (test double use).
    pub fn encode_into_payload(&self) -> Vec<u8> {
        let mut p = vec![0u8; 76];
        p[0] = 0x00; // type: ANO
        p[1] = 0x00;
        p[4] = self.year;
        p[5] = self.month;
        p[6] = self.day;
        p
    }
}

/// MGA-INI-TIME-UTC, 24-byte payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MgaIniTimeUtc {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// Seconds accuracy of the supplied time.
    pub t_acc_s: u16,
}

impl MgaIniTimeUtc {
    pub const LEN: usize = 24;

    pub fn encode(&self) -> Vec<u8> {
        let mut p = vec![0u8; Self::LEN];
        p[0] = mga::INI_TYPE_TIME_UTC;
        p[1] = 0x00; // version
        p[2] = 0x00; // time reference: on receipt
        p[3] = 0x80; // leap seconds unknown (-128)
        p[4..6].copy_from_slice(&self.year.to_le_bytes());
        p[6] = self.month;
        p[7] = self.day;
        p[8] = self.hour;
        p[9] = self.minute;
        p[10] = self.second;
        // ns stays zero
        p[16..18].copy_from_slice(&self.t_acc_s.to_le_bytes());
        p
    }
}

/// CFG-RST soft-reset request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CfgRst {
    pub nav_bbr_mask: u16,
    pub reset_mode: u8,
}

impl CfgRst {
    /// Software reset of the GNSS subsystem only.
    pub const MODE_GNSS_ONLY: u8 = 0x02;

    pub fn encode(&self) -> Vec<u8> {
        let mut p = vec![0u8; 4];
        p[0..2].copy_from_slice(&self.nav_bbr_mask.to_le_bytes());
        p[2] = self.reset_mode;
        p
    }
}

/// CFG-CFG save/load request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CfgCfg {
    pub clear_mask: u32,
    pub save_mask: u32,
    pub load_mask: u32,
    pub device_mask: u8,
}

impl CfgCfg {
    pub const DEV_BBR: u8 = 0x01;

    pub fn encode(&self) -> Vec<u8> {
        let mut p = vec![0u8; 13];
        p[0..4].copy_from_slice(&self.clear_mask.to_le_bytes());
        p[4..8].copy_from_slice(&self.save_mask.to_le_bytes());
        p[8..12].copy_from_slice(&self.load_mask.to_le_bytes());
        p[12] = self.device_mask;
        p
    }
}

/// CFG-VALSET: write configuration items to one or more layers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CfgValset {
    pub layers: u8,
    items: Vec<(u32, u64)>,
}

impl CfgValset {
    pub fn new(layers: u8) -> Self {
        Self {
            layers,
            items: Vec::new(),
        }
    }

    pub fn push(&mut self, key: u32, value: u64) -> &mut Self {
        self.items.push((key, value));
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut p = vec![0u8; 4];
        p[0] = 0x00; // version
        p[1] = self.layers;
        for &(key, value) in &self.items {
            p.extend_from_slice(&key.to_le_bytes());
            p.extend_from_slice(&value.to_le_bytes()[..key_size(key)]);
        }
        p
    }
}

/// CFG-VALGET poll for a set of keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CfgValget {
    pub layer: u8,
    pub position: u16,
    pub keys: Vec<u32>,
}

impl CfgValget {
    pub fn encode(&self) -> Vec<u8> {
        let mut p = vec![0u8; 4];
        p[0] = 0x00;
        p[1] = self.layer;
        p[2..4].copy_from_slice(&self.position.to_le_bytes());
        for key in &self.keys {
            p.extend_from_slice(&key.to_le_bytes());
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nav_pvt_roundtrip() {
        let pvt = NavPvt {
            itow: 123_456,
            year: 2024,
            month: 6,
            day: 1,
            hour: 12,
            min: 30,
            sec: 59,
            valid: 0x07,
            fix_type: 3,
            num_sv: 9,
            lon: -1_234_567_89,
            lat: 512_345_678,
            h_acc: 2_500,
            p_dop: 180,
            head_veh: 9_000_000,
            ..NavPvt::default()
        };
        assert_eq!(NavPvt::decode(&pvt.encode()).unwrap(), pvt);
    }

    #[test]
    fn nav_dop_roundtrip() {
        let dop = NavDop {
            itow: 99,
            h_dop: 120,
            p_dop: 210,
            ..NavDop::default()
        };
        assert_eq!(NavDop::decode(&dop.encode()).unwrap(), dop);
    }

    #[test]
    fn nav_status_roundtrip() {
        let status = NavStatus {
            itow: 42,
            gps_fix: 3,
            ttff: 31_000,
            msss: 60_000,
            ..NavStatus::default()
        };
        assert_eq!(NavStatus::decode(&status.encode()).unwrap(), status);
    }

    #[test]
    fn nav_sat_roundtrip() {
        let sat = NavSat {
            itow: 7,
            svs: vec![
                SatInfo {
                    gnss_id: 0,
                    sv_id: 5,
                    cno: 42,
                    quality: 6,
                },
                SatInfo {
                    gnss_id: 2,
                    sv_id: 11,
                    cno: 38,
                    quality: 4,
                },
            ],
        };
        assert_eq!(NavSat::decode(&sat.encode()).unwrap(), sat);
    }

    #[test]
    fn mga_ack_roundtrip() {
        let ack = MgaAck {
            info_code: 0,
            msg_id: mga::ID_DBD,
            msg_payload_start: 27,
        };
        let decoded = MgaAck::decode(&ack.encode()).unwrap();
        assert_eq!(decoded, ack);
        assert!(decoded.is_ack());
    }

    #[test]
    fn valset_packs_value_sizes() {
        let mut valset = CfgValset::new(crate::keys::layers::RAM | crate::keys::layers::BBR);
        valset.push(crate::keys::uart1::BAUDRATE, 460_800);
        valset.push(crate::keys::uart1::STOPBITS, 1);
        let bytes = valset.encode();
        // 4 header + (4+4) + (4+1)
        assert_eq!(bytes.len(), 4 + 8 + 5);
        assert_eq!(bytes[1], 0x03);
        assert_eq!(&bytes[4..8], &crate::keys::uart1::BAUDRATE.to_le_bytes());
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 460_800);
    }

    #[test]
    fn truncated_payloads_rejected() {
        assert!(NavPvt::decode(&[0u8; 20]).is_err());
        assert!(NavDop::decode(&[0u8; 4]).is_err());
        assert!(MgaAck::decode(&[0u8; 3]).is_err());
    }
}
