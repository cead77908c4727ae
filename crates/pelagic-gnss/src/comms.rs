//! UBX transport layer: framing over the UART port, response matching, and
//! the navigation / database receive filters.
//!
//! The receiver state machine registers an *expect* before sending an
//! acknowledged request; the matching response (or its absence, via the
//! state machine's timeout) drives the next step. NAV-PVT, NAV-DOP and
//! NAV-STATUS are correlated by `iTOW` and delivered as one report; while
//! the DBD filter is active, raw receive data bypasses the parser entirely
//! so a navigation-database dump can be captured byte-exact.

use tracing::trace;

use crate::error::GnssResult;
use crate::frame::{parse_all, Frame, FrameParser};
use crate::messages::{class, mga, AckPayload, MgaAck, NavDop, NavPvt, NavSat, NavStatus};

/// UART seam to the receiver. Sends are synchronous; received bytes are
/// pushed into [`UbxComms::process`] by the IRQ adapter (or a test).
pub trait GnssPort {
    fn send(&mut self, data: &[u8]) -> GnssResult<()>;
    fn set_baudrate(&mut self, baud: u32);
    /// Drive the module's wake/shutdown line.
    fn set_power(&mut self, on: bool);
}

/// Events surfaced to the receiver state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum CommsEvent {
    /// A raw send with completion notification finished.
    SendComplete,
    /// The expected response arrived; `ack` is false for a NACK (or a
    /// refused MGA transfer).
    AckNack { ack: bool },
    /// MGA-ACK while the DBD filter is engaged; carries the announced
    /// number of DBD messages.
    MgaAck { ack: bool, num_dbd_messages: u32 },
    /// Raw bytes captured while the DBD filter is engaged.
    MgaDbd { data: Vec<u8> },
    /// PVT, DOP and STATUS with one common time-of-week.
    NavReport {
        pvt: NavPvt,
        dop: NavDop,
        status: NavStatus,
    },
    /// A satellite-visibility snapshot.
    SatReport { sat: NavSat },
}

#[derive(Clone, Copy, Debug)]
struct Expect {
    req_cls: u8,
    req_id: u8,
    resp_cls: u8,
    resp_id: u8,
}

#[derive(Default)]
struct NavAccumulator {
    pvt: Option<NavPvt>,
    dop: Option<NavDop>,
    status: Option<NavStatus>,
}

impl NavAccumulator {
    fn take_correlated(&mut self) -> Option<(NavPvt, NavDop, NavStatus)> {
        let itow = self.pvt.as_ref()?.itow;
        if self.dop.as_ref()?.itow != itow || self.status.as_ref()?.itow != itow {
            return None;
        }
        Some((
            self.pvt.take().unwrap(),
            self.dop.take().unwrap(),
            self.status.take().unwrap(),
        ))
    }
}

/// Maximum satellites reported per NAV-SAT event.
const MAX_REPORTED_SVS: usize = 12;

pub struct UbxComms {
    port: Box<dyn GnssPort>,
    parser: FrameParser,
    expect: Option<Expect>,
    dbd_filter: bool,
    nav: NavAccumulator,
}

impl UbxComms {
    pub fn new(port: Box<dyn GnssPort>) -> Self {
        Self {
            port,
            parser: FrameParser::new(),
            expect: None,
            dbd_filter: false,
            nav: NavAccumulator::default(),
        }
    }

    pub fn set_power(&mut self, on: bool) {
        self.port.set_power(on);
    }

    /// Change baud rate, discarding any partial frame captured at the old
    /// rate.
    pub fn set_baudrate(&mut self, baud: u32) {
        self.parser.clear();
        self.port.set_baudrate(baud);
    }

    /// Send a framed message with no response expectation.
    pub fn send_frame(&mut self, cls: u8, id: u8, payload: Vec<u8>) -> GnssResult<()> {
        let bytes = Frame::new(cls, id, payload).encode();
        trace!(data = %hex::encode_upper(&bytes), "tx frame");
        self.port.send(&bytes)
    }

    /// Send a framed message and register the response to match.
    pub fn send_frame_with_expect(
        &mut self,
        cls: u8,
        id: u8,
        payload: Vec<u8>,
        resp_cls: u8,
        resp_id: u8,
    ) -> GnssResult<()> {
        self.expect = Some(Expect {
            req_cls: cls,
            req_id: id,
            resp_cls,
            resp_id,
        });
        self.send_frame(cls, id, payload)
    }

    /// Send pre-framed bytes (database restore chunks).
    pub fn send_raw(&mut self, data: &[u8]) -> GnssResult<()> {
        trace!(len = data.len(), "tx raw");
        self.port.send(data)
    }

    pub fn expect(&mut self, resp_cls: u8, resp_id: u8) {
        self.expect = Some(Expect {
            req_cls: 0,
            req_id: 0,
            resp_cls,
            resp_id,
        });
    }

    pub fn cancel_expect(&mut self) {
        self.expect = None;
    }

    pub fn start_dbd_filter(&mut self) {
        self.dbd_filter = true;
    }

    pub fn stop_dbd_filter(&mut self) {
        self.dbd_filter = false;
    }

    /// Feed received bytes; returns the events they produce, in order.
    pub fn process(&mut self, data: &[u8]) -> Vec<CommsEvent> {
        if self.dbd_filter {
            return vec![CommsEvent::MgaDbd {
                data: data.to_vec(),
            }];
        }

        self.parser.push(data);
        let mut events = Vec::new();
        while let Some(frame) = self.parser.next_frame() {
            if let Some(event) = self.run_expect_filter(&frame) {
                events.push(event);
            }
            if let Some(event) = self.run_nav_filter(&frame) {
                events.push(event);
            }
        }
        events
    }

    /// Re-parse an already-captured buffer through the expect filter only
    /// (used on a collected DBD dump to surface its MGA-ACK).
    pub fn filter_buffer(&mut self, data: &[u8]) -> Vec<CommsEvent> {
        let mut events = Vec::new();
        for frame in parse_all(data) {
            if let Some(event) = self.run_expect_filter(&frame) {
                events.push(event);
            }
        }
        events
    }

    /// Count frames of the given class/id in a raw buffer and compare with
    /// `expected`.
    pub fn is_expected_msg_count(
        &self,
        data: &[u8],
        expected: u32,
        cls: u8,
        id: u8,
    ) -> (bool, u32) {
        let actual = parse_all(data)
            .iter()
            .filter(|f| f.class == cls && f.id == id)
            .count() as u32;
        (actual == expected, actual)
    }

    fn run_expect_filter(&mut self, frame: &Frame) -> Option<CommsEvent> {
        let expect = self.expect?;

        if frame.class == class::ACK {
            // Either ACK or NACK resolves an expectation on the ACK class,
            // provided it acknowledges our request.
            if expect.resp_cls != class::ACK {
                return None;
            }
            let payload = AckPayload::decode(&frame.payload).ok()?;
            if payload.cls != expect.req_cls || payload.id != expect.req_id {
                return None;
            }
            self.expect = None;
            return Some(CommsEvent::AckNack {
                ack: frame.id == expect.resp_id,
            });
        }

        if frame.class != expect.resp_cls || frame.id != expect.resp_id {
            return None;
        }

        if frame.class == class::MGA && frame.id == mga::ID_ACK {
            let payload = MgaAck::decode(&frame.payload).ok()?;
            self.expect = None;
            if self.dbd_filter {
                return Some(CommsEvent::MgaAck {
                    ack: payload.is_ack(),
                    num_dbd_messages: payload.msg_payload_start,
                });
            }
            return Some(CommsEvent::AckNack {
                ack: payload.is_ack(),
            });
        }

        self.expect = None;
        Some(CommsEvent::AckNack { ack: true })
    }

    fn run_nav_filter(&mut self, frame: &Frame) -> Option<CommsEvent> {
        if frame.class != class::NAV {
            return None;
        }
        match frame.id {
            crate::messages::nav::ID_PVT => {
                self.nav.pvt = NavPvt::decode(&frame.payload).ok();
            }
            crate::messages::nav::ID_DOP => {
                self.nav.dop = NavDop::decode(&frame.payload).ok();
            }
            crate::messages::nav::ID_STATUS => {
                self.nav.status = NavStatus::decode(&frame.payload).ok();
            }
            crate::messages::nav::ID_SAT => {
                let mut sat = NavSat::decode(&frame.payload).ok()?;
                sat.svs.truncate(MAX_REPORTED_SVS);
                return Some(CommsEvent::SatReport { sat });
            }
            _ => return None,
        }

        let (pvt, dop, status) = self.nav.take_correlated()?;
        Some(CommsEvent::NavReport { pvt, dop, status })
    }
}
