//! u-blox-family GNSS receiver driver.
//!
//! Drives the receiver over its binary UBX protocol: bit-exact framing with
//! a resynchronising stream parser, an acknowledged multi-step
//! configuration sequence, navigation-fix correlation and filtering, and
//! assistance-database handling (AssistNow Autonomous save/restore and
//! dated AssistNow Offline record selection) for fast time-to-first-fix.
//! The driver is a cooperative state machine with reference-counted power
//! (see [`receiver`]).

pub mod assist;
pub mod comms;
pub mod error;
pub mod frame;
pub mod keys;
pub mod messages;
pub mod receiver;

pub use comms::{CommsEvent, GnssPort, UbxComms};
pub use error::{GnssError, GnssResult};
pub use frame::{Frame, FrameParser};
pub use receiver::{
    GnssConfig, GnssReceiver, GnssState, PowerMode, MAX_BAUDRATE, OFFLINE_ASSIST_FILE,
};
