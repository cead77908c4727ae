//! The receiver driver: acknowledged configuration, fix dispatch, and
//! assistance-database save/restore, as a cooperative state machine.
//!
//! Power is reference counted: every subsystem that wants fixes calls
//! `power_on`, and the hardware only shuts down when the last one has
//! called `power_off` *and* the machine has reached a quiescent point --
//! the shutdown path first stops the periodic messages, then saves the
//! receiver's navigation database to RAM so the next session starts hot.
//!
//! Each state advances through numbered steps; a step sends one
//! acknowledged request and parks in `Pending` until the comms layer
//! reports the matching response, the timeout fires, or the link errors.
//! Acknowledged steps retry up to three times before the driver declares
//! the session unrecoverable.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{NaiveDate, Utc};
use tracing::{debug, error, trace, warn};

use pelagic_fs::{File, Filesystem, OpenFlags};
use pelagic_sched::{Scheduler, TaskHandle};
use pelagic_types::{GnssEvent, GnssFix, Rtc, FIX_TYPE_NONE};

use crate::assist::{select_ano_records, AnoSelection, NAV_DB_MAX};
use crate::comms::{CommsEvent, GnssPort, UbxComms};
use crate::keys;
use crate::messages::{
    ack, cfg, class, mga, CfgCfg, CfgRst, CfgValset, MgaIniTimeUtc,
};

/// Boot-default and configured UART baud rates.
pub const DEFAULT_BAUDRATE: u32 = 9600;
pub const MAX_BAUDRATE: u32 = 460_800;

/// Well-known offline-assistance file.
pub const OFFLINE_ASSIST_FILE: &str = "gps_config.dat";

const DEFAULT_TIMEOUT_MS: u64 = 1000;
const SYNC_TIMEOUT_MS: u64 = 500;
const RECEIVE_TIMEOUT_MS: u64 = 5000;
const MAX_RETRIES: u32 = 3;
const UART_ERROR_LIMIT: u32 = 10;

/// Encoded size of an MGA-ACK frame inside a captured DBD dump.
const MGA_ACK_FRAME_LEN: usize = 16;

/// Restore chunk sizes: small for the autonomous database (the receiver
/// processes entries slowly), larger for dated offline records.
const ANA_CHUNK: usize = 128;
const ANO_CHUNK: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerMode {
    FullPower,
    CyclicTracking,
}

/// Per-session navigation settings supplied by the caller.
#[derive(Clone, Debug)]
pub struct GnssConfig {
    /// Position fix mode (2D / 3D / auto) for CFG-NAVSPG-FIXMODE.
    pub fix_mode: u8,
    /// Dynamic platform model for CFG-NAVSPG-DYNMODEL.
    pub dyn_model: u8,
    pub power_mode: PowerMode,
    pub hacc_filter_en: bool,
    /// Horizontal accuracy gate in metres.
    pub hacc_filter_threshold_m: u32,
    pub hdop_filter_en: bool,
    pub hdop_filter_threshold: f64,
    /// Fixes must pass the filters this many times in a row before one is
    /// dispatched.
    pub num_consecutive_fixes: u32,
    /// Stop after this many navigation reports (0 = unlimited).
    pub max_nav_samples: u32,
    /// Stop after this many satellite snapshots (0 = unlimited).
    pub max_sat_samples: u32,
    pub sat_tracking: bool,
    pub assistnow_autonomous: bool,
    pub assistnow_offline: bool,
}

impl Default for GnssConfig {
    fn default() -> Self {
        Self {
            fix_mode: 3,
            dyn_model: 5, // sea
            power_mode: PowerMode::FullPower,
            hacc_filter_en: false,
            hacc_filter_threshold_m: 0,
            hdop_filter_en: false,
            hdop_filter_threshold: 0.0,
            num_consecutive_fixes: 1,
            max_nav_samples: 0,
            max_sat_samples: 0,
            sat_tracking: false,
            assistnow_autonomous: false,
            assistnow_offline: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GnssState {
    Idle,
    PowerOn,
    Configure,
    SendOfflineDatabase,
    SendDatabase,
    StartReceive,
    Receive,
    StopReceive,
    FetchDatabase,
    PowerOff,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OpState {
    Idle,
    Pending,
    Success,
    Nack,
    Timeout,
    Error,
}

struct RxInner {
    sched: Scheduler,
    fs: Rc<Filesystem>,
    rtc: Rtc,
    comms: UbxComms,

    state: GnssState,
    step: u32,
    retries: u32,
    op_state: OpState,
    sm_task: TaskHandle,
    timeout_task: TaskHandle,

    num_power_on: u32,
    powering_off: bool,
    unrecoverable_error: bool,
    uart_error_count: u32,
    fix_was_found: bool,

    nav_settings: GnssConfig,
    num_nav_samples: u32,
    num_sat_samples: u32,
    num_consecutive_fixes: u32,

    /// Autonomous navigation database captured at the last shutdown.
    ana_db: Vec<u8>,
    /// Offline records selected for this session.
    ano_db: Vec<u8>,
    ano_start_pos: u32,
    ano_settled: bool,
    expected_dbd_messages: u32,
    database_overflow: bool,
    /// MGA-ACK bytes collected while streaming a database to the device.
    ack_collect: Vec<u8>,

    events: Vec<GnssEvent>,
}

/// Cloneable handle to the GNSS receiver driver.
#[derive(Clone)]
pub struct GnssReceiver {
    inner: Rc<RefCell<RxInner>>,
    sinks: Rc<RefCell<Vec<Box<dyn FnMut(&GnssEvent)>>>>,
}

impl GnssReceiver {
    pub fn new(sched: Scheduler, fs: Rc<Filesystem>, rtc: Rtc, port: Box<dyn GnssPort>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RxInner {
                sched,
                fs,
                rtc,
                comms: UbxComms::new(port),
                state: GnssState::Idle,
                step: 0,
                retries: 0,
                op_state: OpState::Idle,
                sm_task: TaskHandle::INVALID,
                timeout_task: TaskHandle::INVALID,
                num_power_on: 0,
                powering_off: false,
                unrecoverable_error: false,
                uart_error_count: 0,
                fix_was_found: false,
                nav_settings: GnssConfig::default(),
                num_nav_samples: 0,
                num_sat_samples: 0,
                num_consecutive_fixes: 0,
                ana_db: Vec::new(),
                ano_db: Vec::new(),
                ano_start_pos: 0,
                ano_settled: false,
                expected_dbd_messages: 0,
                database_overflow: false,
                ack_collect: Vec::new(),
                events: Vec::new(),
            })),
            sinks: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn subscribe(&self, sink: impl FnMut(&GnssEvent) + 'static) {
        self.sinks.borrow_mut().push(Box::new(sink));
    }

    pub fn state(&self) -> GnssState {
        self.inner.borrow().state
    }

    pub fn num_power_on(&self) -> u32 {
        self.inner.borrow().num_power_on
    }

    /// Request fixes. Each call stacks; the session starts on the first.
    pub fn power_on(&self, settings: &GnssConfig) {
        {
            let mut inner = self.inner.borrow_mut();
            debug!(count = inner.num_power_on + 1, "gnss power_on");
            inner.num_power_on += 1;
            inner.powering_off = false;

            // A later caller can arm fresh sample budgets mid-session.
            if settings.max_nav_samples > 0 {
                inner.num_nav_samples = 0;
                inner.nav_settings.max_nav_samples = settings.max_nav_samples;
                inner.num_consecutive_fixes = inner.nav_settings.num_consecutive_fixes;
            }
            if settings.max_sat_samples > 0 {
                inner.num_sat_samples = 0;
                inner.nav_settings.max_sat_samples = settings.max_sat_samples;
            }

            if inner.state == GnssState::Idle {
                inner.nav_settings = settings.clone();
                inner.num_consecutive_fixes = settings.num_consecutive_fixes;
                self.change(&mut inner, GnssState::PowerOn);
            }
        }
        self.drain_events();
    }

    /// Drop one power-on reference; shutdown starts when the count hits
    /// zero.
    pub fn power_off(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.num_power_on > 0 {
                inner.num_power_on -= 1;
            }
            debug!(count = inner.num_power_on, "gnss power_off");
            self.check_for_power_off(&mut inner);
        }
        self.drain_events();
    }

    /// RX path: bytes from the UART (IRQ adapter or test double).
    pub fn feed(&self, data: &[u8]) {
        let events = self.inner.borrow_mut().comms.process(data);
        {
            let mut inner = self.inner.borrow_mut();
            for event in events {
                self.react(&mut inner, event);
            }
        }
        self.drain_events();
    }

    /// UART framing/overrun error from the transport.
    pub fn uart_error(&self, error_type: u32) {
        {
            let mut inner = self.inner.borrow_mut();
            trace!(error_type, count = inner.uart_error_count, "uart error");
            if inner.state == GnssState::PowerOn {
                inner.uart_error_count += 1;
                if inner.uart_error_count >= UART_ERROR_LIMIT {
                    inner.uart_error_count = 0;
                    self.cancel_timeout(&mut inner);
                    inner.op_state = OpState::Error;
                    self.run_sm(&mut inner, 0);
                }
            } else {
                self.cancel_timeout(&mut inner);
                inner.op_state = OpState::Error;
                self.run_sm(&mut inner, 0);
            }
        }
        self.drain_events();
    }

    // ---- internal plumbing ----

    fn drain_events(&self) {
        loop {
            let events = std::mem::take(&mut self.inner.borrow_mut().events);
            if events.is_empty() {
                return;
            }
            let mut sinks = self.sinks.borrow_mut();
            for event in events {
                for sink in sinks.iter_mut() {
                    sink(&event);
                }
            }
        }
    }

    fn run_sm(&self, inner: &mut RxInner, delay_ms: u64) {
        let task = inner.sm_task;
        inner.sched.cancel(task);
        let this = self.clone();
        inner.sm_task = inner
            .sched
            .post_delayed("gnss-sm", delay_ms, move || this.tick());
    }

    fn initiate_timeout(&self, inner: &mut RxInner, timeout_ms: u64) {
        self.cancel_timeout(inner);
        let this = self.clone();
        inner.timeout_task = inner
            .sched
            .post_delayed("gnss-timeout", timeout_ms, move || this.on_timeout());
    }

    fn cancel_timeout(&self, inner: &mut RxInner) {
        let task = inner.timeout_task;
        inner.sched.cancel(task);
    }

    fn on_timeout(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.op_state == OpState::Pending {
                inner.op_state = OpState::Timeout;
                inner.comms.cancel_expect();
                self.run_sm(&mut inner, 0);
            } else if inner.state == GnssState::Receive {
                error!("no navigation data within the receive timeout");
                inner.unrecoverable_error = true;
                inner.events.push(GnssEvent::Error);
            }
        }
        self.drain_events();
    }

    /// Completion callback for raw sends that request notification.
    fn on_send_complete(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.op_state == OpState::Pending {
                self.cancel_timeout(&mut inner);
                inner.op_state = OpState::Success;
                self.run_sm(&mut inner, 0);
            }
        }
        self.drain_events();
    }

    fn notify_send_complete(&self, inner: &mut RxInner) {
        let this = self.clone();
        inner
            .sched
            .post("gnss-tx-done", move || this.on_send_complete());
    }

    fn tick(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            match inner.state {
                GnssState::Idle => {}
                GnssState::PowerOn => self.state_poweron(&mut inner),
                GnssState::Configure => self.state_configure(&mut inner),
                GnssState::SendOfflineDatabase => self.state_send_offline_database(&mut inner),
                GnssState::SendDatabase => self.state_send_database(&mut inner),
                GnssState::StartReceive => self.state_start_receive(&mut inner),
                GnssState::Receive => self.state_receive(&mut inner),
                GnssState::StopReceive => self.state_stop_receive(&mut inner),
                GnssState::FetchDatabase => self.state_fetch_database(&mut inner),
                GnssState::PowerOff => self.state_poweroff(&mut inner),
            }
        }
        self.drain_events();
    }

    fn change(&self, inner: &mut RxInner, to: GnssState) {
        let from = inner.state;
        trace!(?from, ?to, "gnss state change");
        self.exit_hook(inner, from);
        inner.state = to;
        self.enter_hook(inner, to);
        self.run_sm(inner, 0);
    }

    fn enter_hook(&self, inner: &mut RxInner, state: GnssState) {
        inner.step = 0;
        inner.retries = MAX_RETRIES;
        inner.op_state = OpState::Idle;
        match state {
            GnssState::Idle => {
                inner.nav_settings.max_nav_samples = 0;
                inner.nav_settings.max_sat_samples = 0;
            }
            GnssState::PowerOn => {
                inner.uart_error_count = 0;
                inner.fix_was_found = false;
                inner.unrecoverable_error = false;
                inner.comms.set_power(true);
                inner.events.push(GnssEvent::PowerOn);
            }
            GnssState::PowerOff => {
                inner.uart_error_count = 0;
            }
            GnssState::Receive => {
                self.initiate_timeout(inner, RECEIVE_TIMEOUT_MS);
            }
            GnssState::FetchDatabase => {
                inner.ana_db.clear();
                inner.expected_dbd_messages = 0;
                inner.database_overflow = false;
                inner.comms.start_dbd_filter();
            }
            GnssState::SendDatabase => {
                inner.ack_collect.clear();
                inner.comms.start_dbd_filter();
                debug!(len = inner.ana_db.len(), "restoring navigation database");
            }
            GnssState::SendOfflineDatabase => {
                inner.ack_collect.clear();
                inner.ano_db.clear();
                inner.ano_settled = false;
                if !inner.nav_settings.assistnow_offline {
                    trace!("offline assistance not enabled");
                    return;
                }
                if !inner.rtc.is_set() {
                    trace!("offline assistance skipped: time not yet set");
                    return;
                }
                let now = inner.rtc.now().unwrap_or_else(Utc::now);
                let start_pos = inner.ano_start_pos;
                match File::open(&inner.fs, OFFLINE_ASSIST_FILE, OpenFlags::READ)
                    .and_then(|mut f| {
                        select_ano_records(&mut f, NAV_DB_MAX, now, start_pos)
                            .map_err(|e| match e {
                                crate::error::GnssError::Fs(fs) => fs,
                                other => pelagic_fs::FsError::Corrupt(other.to_string()),
                            })
                    }) {
                    Ok(AnoSelection {
                        data,
                        num_messages,
                        start_pos,
                    }) => {
                        inner.ano_db = data;
                        inner.expected_dbd_messages = num_messages;
                        inner.ano_start_pos = start_pos;
                        inner.comms.start_dbd_filter();
                        debug!(len = inner.ano_db.len(), "offline assistance selected");
                    }
                    Err(e) => {
                        warn!(error = %e, "error opening offline assistance file");
                        inner.op_state = OpState::Error;
                    }
                }
            }
            _ => {}
        }
    }

    fn exit_hook(&self, inner: &mut RxInner, state: GnssState) {
        match state {
            GnssState::Receive => self.cancel_timeout(inner),
            GnssState::FetchDatabase
            | GnssState::SendDatabase
            | GnssState::SendOfflineDatabase => inner.comms.stop_dbd_filter(),
            _ => {}
        }
    }

    fn check_for_power_off(&self, inner: &mut RxInner) {
        if inner.num_power_on > 0 || inner.powering_off {
            return;
        }
        inner.powering_off = true;

        // A comms-dead receiver cannot be shut down cleanly; skip straight
        // to the power cut.
        if inner.unrecoverable_error {
            self.change(inner, GnssState::PowerOff);
            return;
        }

        match inner.state {
            GnssState::Idle => {}
            GnssState::Receive => self.change(inner, GnssState::StopReceive),
            _ => self.change(inner, GnssState::PowerOff),
        }
    }

    fn fail_unrecoverable(&self, inner: &mut RxInner, context: &str) {
        error!(context, "gnss unrecoverable error");
        inner.unrecoverable_error = true;
        inner.events.push(GnssEvent::Error);
    }

    // ---- states ----

    fn state_poweron(&self, inner: &mut RxInner) {
        loop {
            match inner.op_state {
                OpState::Idle => {
                    inner.op_state = OpState::Pending;
                    match inner.step {
                        0 => {
                            self.sync_baud_rate(inner, DEFAULT_BAUDRATE);
                            return;
                        }
                        1 => {
                            self.sync_baud_rate(inner, MAX_BAUDRATE);
                            return;
                        }
                        _ => {
                            self.fail_unrecoverable(inner, "failed to sync comms");
                            return;
                        }
                    }
                }
                OpState::Success => {
                    self.change(inner, GnssState::Configure);
                    return;
                }
                OpState::Pending => return,
                OpState::Error => {
                    trace!("baud framing error detected");
                    inner.retries = MAX_RETRIES;
                    inner.step += 1;
                    inner.op_state = OpState::Idle;
                    self.run_sm(inner, 100);
                    return;
                }
                OpState::Nack | OpState::Timeout => {
                    inner.retries -= 1;
                    if inner.retries == 0 {
                        inner.retries = MAX_RETRIES;
                        inner.step += 1;
                    }
                    inner.op_state = OpState::Idle;
                }
            }
        }
    }

    fn state_configure(&self, inner: &mut RxInner) {
        loop {
            match inner.op_state {
                OpState::Idle => {
                    trace!(step = inner.step, "configure");
                    inner.op_state = OpState::Pending;
                    match inner.step {
                        0 => {
                            // The reply to this VALSET arrives garbled at
                            // the old baud rate; re-sync instead of waiting.
                            self.setup_uart_port(inner);
                            inner.step += 1;
                            inner.op_state = OpState::Idle;
                            self.run_sm(inner, 1000);
                            return;
                        }
                        1 => {
                            self.sync_baud_rate(inner, MAX_BAUDRATE);
                            return;
                        }
                        2 => {
                            self.setup_gnss_signals(inner);
                            return;
                        }
                        3 => {
                            // Settling delay for the constellation change.
                            inner.step += 1;
                            inner.op_state = OpState::Idle;
                            self.run_sm(inner, 500);
                            return;
                        }
                        4 => {
                            self.save_config(inner);
                            return;
                        }
                        5 => {
                            inner.step += 1;
                            inner.op_state = OpState::Idle;
                            self.soft_reset(inner);
                            // No response; fall straight into the boot wait.
                        }
                        6 => {
                            inner.step += 1;
                            inner.op_state = OpState::Idle;
                            self.run_sm(inner, 1000);
                            return;
                        }
                        7 => {
                            self.disable_odometer(inner);
                            return;
                        }
                        8 => {
                            self.disable_timepulse(inner);
                            return;
                        }
                        9 => {
                            self.setup_power_management(inner);
                            return;
                        }
                        10 => {
                            self.setup_operating_mode(inner);
                            return;
                        }
                        11 => {
                            self.setup_simple_navigation(inner);
                            return;
                        }
                        12 => {
                            self.setup_expert_navigation(inner);
                            return;
                        }
                        13 => {
                            if inner.rtc.is_set() {
                                self.supply_time_assistance(inner);
                                return;
                            }
                            inner.op_state = OpState::Idle;
                            inner.step += 1;
                        }
                        _ => {
                            // Offline data takes priority over the saved
                            // autonomous database.
                            self.change(inner, GnssState::SendOfflineDatabase);
                            return;
                        }
                    }
                }
                OpState::Success => {
                    inner.step += 1;
                    inner.retries = MAX_RETRIES;
                    inner.op_state = OpState::Idle;
                }
                OpState::Pending => return,
                other => {
                    inner.retries -= 1;
                    if inner.retries == 0 {
                        self.fail_unrecoverable(inner, "configuration failed");
                        return;
                    }
                    if other == OpState::Error {
                        // Restart the receiver link on a comms error.
                        self.initiate_timeout(inner, DEFAULT_TIMEOUT_MS);
                        inner.comms.set_baudrate(MAX_BAUDRATE);
                    }
                    inner.op_state = OpState::Idle;
                }
            }
        }
    }

    fn state_start_receive(&self, inner: &mut RxInner) {
        loop {
            match inner.op_state {
                OpState::Idle => {
                    inner.op_state = OpState::Pending;
                    match inner.step {
                        0 => self.set_nav_message_rate(inner, keys::msgout::NAV_PVT_UART1, 1),
                        1 => self.set_nav_message_rate(inner, keys::msgout::NAV_DOP_UART1, 1),
                        2 => self.set_nav_message_rate(inner, keys::msgout::NAV_STATUS_UART1, 1),
                        3 if inner.nav_settings.sat_tracking => {
                            self.set_nav_message_rate(inner, keys::msgout::NAV_SAT_UART1, 1)
                        }
                        _ => {
                            self.change(inner, GnssState::Receive);
                            return;
                        }
                    }
                    return;
                }
                OpState::Success => {
                    inner.step += 1;
                    inner.retries = MAX_RETRIES;
                    inner.op_state = OpState::Idle;
                }
                OpState::Pending => return,
                other => {
                    inner.retries -= 1;
                    if inner.retries == 0 {
                        self.fail_unrecoverable(inner, "start receive failed");
                        return;
                    }
                    if other == OpState::Error {
                        self.initiate_timeout(inner, DEFAULT_TIMEOUT_MS);
                        inner.comms.set_baudrate(MAX_BAUDRATE);
                    }
                    inner.op_state = OpState::Idle;
                }
            }
        }
    }

    fn state_receive(&self, inner: &mut RxInner) {
        if inner.op_state == OpState::Error {
            inner.retries -= 1;
            if inner.retries > 0 {
                // Restart the receiver on a comms error.
                inner.comms.set_baudrate(MAX_BAUDRATE);
                self.initiate_timeout(inner, RECEIVE_TIMEOUT_MS);
                inner.op_state = OpState::Idle;
            } else {
                self.fail_unrecoverable(inner, "repeated comms errors");
            }
        }
    }

    fn state_stop_receive(&self, inner: &mut RxInner) {
        if !inner.powering_off {
            // Power-off was cancelled by a fresh power_on.
            self.change(inner, GnssState::StartReceive);
            return;
        }

        loop {
            match inner.op_state {
                OpState::Idle => {
                    inner.op_state = OpState::Pending;
                    match inner.step {
                        0 => self.set_nav_message_rate(inner, keys::msgout::NAV_PVT_UART1, 0),
                        1 => self.set_nav_message_rate(inner, keys::msgout::NAV_DOP_UART1, 0),
                        2 => self.set_nav_message_rate(inner, keys::msgout::NAV_STATUS_UART1, 0),
                        3 => {
                            if inner.nav_settings.sat_tracking {
                                self.set_nav_message_rate(inner, keys::msgout::NAV_SAT_UART1, 0);
                            } else {
                                inner.op_state = OpState::Idle;
                                inner.step += 1;
                                continue;
                            }
                        }
                        4 => {
                            // Let any stray periodic messages flush out.
                            inner.step += 1;
                            inner.op_state = OpState::Idle;
                            self.run_sm(inner, 100);
                            return;
                        }
                        _ => {
                            self.change(inner, GnssState::FetchDatabase);
                            return;
                        }
                    }
                    return;
                }
                OpState::Success => {
                    inner.step += 1;
                    inner.retries = MAX_RETRIES;
                    inner.op_state = OpState::Idle;
                }
                OpState::Pending => return,
                other => {
                    inner.retries -= 1;
                    if inner.retries == 0 {
                        warn!("stop receive failed");
                        self.change(inner, GnssState::PowerOff);
                        return;
                    }
                    if other == OpState::Error {
                        self.initiate_timeout(inner, DEFAULT_TIMEOUT_MS);
                        inner.comms.set_baudrate(MAX_BAUDRATE);
                    }
                    inner.op_state = OpState::Idle;
                }
            }
        }
    }

    fn state_fetch_database(&self, inner: &mut RxInner) {
        if !inner.nav_settings.assistnow_autonomous {
            trace!("autonomous assistance not enabled; skipping fetch");
            self.change(inner, GnssState::PowerOff);
            return;
        }
        if !inner.ano_db.is_empty() {
            trace!("offline assistance in use; not fetching");
            self.change(inner, GnssState::PowerOff);
            return;
        }

        loop {
            match inner.op_state {
                OpState::Idle => {
                    inner.op_state = OpState::Pending;
                    if inner.step == 0 {
                        self.fetch_navigation_database(inner);
                        return;
                    }

                    // The dump has gone quiet: surface the MGA-ACK it ends
                    // with, then check the message count against it.
                    inner.comms.expect(class::MGA, mga::ID_ACK);
                    let buffer = std::mem::take(&mut inner.ana_db);
                    let ack_events = inner.comms.filter_buffer(&buffer);
                    inner.comms.cancel_expect();
                    inner.ana_db = buffer;
                    for event in ack_events {
                        self.react(inner, event);
                    }

                    let (ok, actual) = inner.comms.is_expected_msg_count(
                        &inner.ana_db,
                        inner.expected_dbd_messages,
                        class::MGA,
                        mga::ID_DBD,
                    );
                    debug!(
                        bytes = inner.ana_db.len(),
                        actual,
                        expected = inner.expected_dbd_messages,
                        "validating navigation database"
                    );
                    if ok {
                        // Drop the trailing MGA-ACK so it is not replayed
                        // into the device at restore time.
                        let keep = inner.ana_db.len().saturating_sub(MGA_ACK_FRAME_LEN);
                        inner.ana_db.truncate(keep);
                        self.change(inner, GnssState::PowerOff);
                        return;
                    }

                    inner.retries -= 1;
                    if inner.retries == 0 {
                        warn!(
                            actual,
                            expected = inner.expected_dbd_messages,
                            "database fetch failed"
                        );
                        inner.ana_db.clear();
                        self.change(inner, GnssState::PowerOff);
                        return;
                    }
                    if inner.database_overflow {
                        warn!("database buffer full; keeping partial dump");
                        self.change(inner, GnssState::PowerOff);
                        return;
                    }
                    trace!("database validation failed; retrying fetch");
                    inner.ana_db.clear();
                    inner.expected_dbd_messages = 0;
                    inner.op_state = OpState::Idle;
                    inner.step = 0;
                }
                OpState::Success | OpState::Timeout => {
                    inner.step += 1;
                    inner.op_state = OpState::Idle;
                }
                OpState::Pending => return,
                _ => {
                    warn!("UART error during database fetch");
                    inner.ana_db.clear();
                    self.change(inner, GnssState::PowerOff);
                    return;
                }
            }
        }
    }

    fn state_send_database(&self, inner: &mut RxInner) {
        if !inner.nav_settings.assistnow_autonomous {
            trace!("autonomous assistance not enabled; skipping restore");
            self.change(inner, GnssState::StartReceive);
            return;
        }

        loop {
            match inner.op_state {
                OpState::Idle => {
                    inner.op_state = OpState::Pending;
                    let sent = inner.step as usize;
                    if sent < inner.ana_db.len() {
                        let chunk = ANA_CHUNK.min(inner.ana_db.len() - sent);
                        let data = inner.ana_db[sent..sent + chunk].to_vec();
                        if inner.comms.send_raw(&data).is_err() {
                            inner.op_state = OpState::Error;
                            continue;
                        }
                        self.notify_send_complete(inner);
                        inner.step += chunk as u32;
                        return;
                    }

                    let (ok, actual) = inner.comms.is_expected_msg_count(
                        &inner.ack_collect,
                        inner.expected_dbd_messages,
                        class::MGA,
                        mga::ID_ACK,
                    );
                    if ok {
                        debug!(actual, "database restore acknowledged");
                    } else {
                        warn!(
                            actual,
                            expected = inner.expected_dbd_messages,
                            "database restore missing MGA-ACKs"
                        );
                    }
                    self.change(inner, GnssState::StartReceive);
                    return;
                }
                OpState::Success => {
                    inner.op_state = OpState::Idle;
                    // Pace the stream so the device can chew on each chunk.
                    self.run_sm(inner, 5);
                    return;
                }
                OpState::Pending => return,
                _ => {
                    warn!("database restore failed");
                    inner.comms.set_baudrate(MAX_BAUDRATE);
                    self.change(inner, GnssState::StartReceive);
                    return;
                }
            }
        }
    }

    fn state_send_offline_database(&self, inner: &mut RxInner) {
        if !inner.nav_settings.assistnow_offline || inner.ano_db.is_empty() {
            self.change(inner, GnssState::SendDatabase);
            return;
        }

        loop {
            match inner.op_state {
                OpState::Idle => {
                    inner.op_state = OpState::Pending;
                    let sent = inner.step as usize;
                    if sent < inner.ano_db.len() {
                        let chunk = ANO_CHUNK.min(inner.ano_db.len() - sent);
                        let data = inner.ano_db[sent..sent + chunk].to_vec();
                        if inner.comms.send_raw(&data).is_err() {
                            inner.op_state = OpState::Error;
                            continue;
                        }
                        self.notify_send_complete(inner);
                        inner.step += chunk as u32;
                        return;
                    }
                    if !inner.ano_settled {
                        // Allow trailing MGA-ACKs to arrive before counting.
                        inner.ano_settled = true;
                        inner.op_state = OpState::Idle;
                        self.run_sm(inner, 100);
                        return;
                    }

                    let (ok, actual) = inner.comms.is_expected_msg_count(
                        &inner.ack_collect,
                        inner.expected_dbd_messages,
                        class::MGA,
                        mga::ID_ACK,
                    );
                    if !ok {
                        warn!(
                            actual,
                            expected = inner.expected_dbd_messages,
                            "offline assistance missing MGA-ACKs"
                        );
                    }
                    self.change(inner, GnssState::StartReceive);
                    return;
                }
                OpState::Success => {
                    inner.op_state = OpState::Idle;
                    // Chunk pacing for assistance upload.
                    self.run_sm(inner, 1);
                    return;
                }
                OpState::Pending => return,
                _ => {
                    warn!("offline assistance upload failed");
                    self.change(inner, GnssState::StartReceive);
                    return;
                }
            }
        }
    }

    fn state_poweroff(&self, inner: &mut RxInner) {
        if !inner.powering_off {
            // A power_on arrived while shutting down: go back to work.
            self.change(inner, GnssState::Configure);
            return;
        }
        inner.comms.set_power(false);
        let fix_found = inner.fix_was_found;
        inner.events.push(GnssEvent::PowerOff {
            fix_found,
        });
        self.change(inner, GnssState::Idle);
    }

    // ---- reactions to comms events ----

    fn react(&self, inner: &mut RxInner, event: CommsEvent) {
        match event {
            CommsEvent::SendComplete => {
                if inner.op_state == OpState::Pending {
                    self.cancel_timeout(inner);
                    inner.op_state = OpState::Success;
                    self.run_sm(inner, 0);
                }
            }
            CommsEvent::AckNack { ack } => {
                if inner.op_state == OpState::Pending {
                    self.cancel_timeout(inner);
                    inner.op_state = if ack { OpState::Success } else { OpState::Nack };
                    self.run_sm(inner, 0);
                }
            }
            CommsEvent::MgaAck {
                num_dbd_messages, ..
            } => {
                if inner.state == GnssState::FetchDatabase {
                    inner.expected_dbd_messages = num_dbd_messages;
                }
            }
            CommsEvent::MgaDbd { data } => match inner.state {
                GnssState::FetchDatabase => {
                    self.cancel_timeout(inner);
                    if inner.ana_db.len() + data.len() < NAV_DB_MAX {
                        inner.ana_db.extend_from_slice(&data);
                    } else {
                        inner.database_overflow = true;
                    }
                    self.initiate_timeout(inner, DEFAULT_TIMEOUT_MS);
                }
                GnssState::SendDatabase | GnssState::SendOfflineDatabase => {
                    inner.ack_collect.extend_from_slice(&data);
                }
                _ => {}
            },
            CommsEvent::NavReport { pvt, dop, status } => {
                self.react_nav_report(inner, pvt, dop, status);
            }
            CommsEvent::SatReport { sat } => {
                if !inner.nav_settings.sat_tracking {
                    return;
                }
                inner.num_sat_samples += 1;
                let best = sat.svs.iter().map(|sv| sv.quality).max().unwrap_or(0);
                inner.events.push(GnssEvent::SatReport {
                    num_svs: sat.svs.len() as u8,
                    best_signal_quality: best,
                });
                if inner.nav_settings.max_sat_samples > 0
                    && inner.num_sat_samples >= inner.nav_settings.max_sat_samples
                {
                    inner.nav_settings.max_sat_samples = 0;
                    inner.events.push(GnssEvent::MaxSatSamples);
                }
            }
        }
    }

    fn react_nav_report(
        &self,
        inner: &mut RxInner,
        pvt: crate::messages::NavPvt,
        dop: crate::messages::NavDop,
        status: crate::messages::NavStatus,
    ) {
        let dispatched = (|| {
            if inner.state != GnssState::Receive {
                return false;
            }
            inner.num_nav_samples += 1;
            self.initiate_timeout(inner, RECEIVE_TIMEOUT_MS);

            // A resolved date and time updates the host clock even before
            // the position passes the quality gates.
            if pvt.fix_type != FIX_TYPE_NONE
                && pvt.valid & pelagic_types::VALID_DATE != 0
                && pvt.valid & pelagic_types::VALID_TIME != 0
            {
                if let Some(t) = NaiveDate::from_ymd_opt(
                    pvt.year as i32,
                    pvt.month as u32,
                    pvt.day as u32,
                )
                .and_then(|d| d.and_hms_opt(pvt.hour as u32, pvt.min as u32, pvt.sec as u32))
                {
                    inner.rtc.set(t.and_utc());
                }
            }

            if pvt.fix_type != pelagic_types::FIX_TYPE_2D
                && pvt.fix_type != pelagic_types::FIX_TYPE_3D
            {
                return false;
            }
            if inner.nav_settings.hacc_filter_en
                && inner.nav_settings.hacc_filter_threshold_m * 1000 < pvt.h_acc
            {
                inner.num_consecutive_fixes = inner.nav_settings.num_consecutive_fixes;
                return false;
            }
            if inner.nav_settings.hdop_filter_en
                && (100.0 * inner.nav_settings.hdop_filter_threshold) < dop.h_dop as f64
            {
                inner.num_consecutive_fixes = inner.nav_settings.num_consecutive_fixes;
                return false;
            }
            if inner.num_consecutive_fixes > 0 {
                inner.num_consecutive_fixes -= 1;
                if inner.num_consecutive_fixes > 0 {
                    return false;
                }
            }

            let fix = GnssFix {
                itow: pvt.itow,
                year: pvt.year,
                month: pvt.month,
                day: pvt.day,
                hour: pvt.hour,
                min: pvt.min,
                sec: pvt.sec,
                valid: pvt.valid,
                t_acc: pvt.t_acc,
                nano: pvt.nano,
                fix_type: pvt.fix_type,
                flags: pvt.flags,
                flags2: pvt.flags2,
                num_sv: pvt.num_sv,
                lon: pvt.lon as f64 / 1e7,
                lat: pvt.lat as f64 / 1e7,
                height: pvt.height,
                h_msl: pvt.h_msl,
                h_acc: pvt.h_acc,
                v_acc: pvt.v_acc,
                vel_n: pvt.vel_n,
                vel_e: pvt.vel_e,
                vel_d: pvt.vel_d,
                g_speed: pvt.g_speed,
                head_mot: pvt.head_mot as f32 / 1e5,
                s_acc: pvt.s_acc,
                head_acc: pvt.head_acc as f32 / 1e5,
                p_dop: dop.p_dop as f32 / 100.0,
                v_dop: dop.v_dop as f32 / 100.0,
                h_dop: dop.h_dop as f32 / 100.0,
                head_veh: pvt.head_veh as f32 / 1e5,
                ttff: status.ttff,
            };
            inner.fix_was_found = true;
            inner.events.push(GnssEvent::Fix(fix));
            true
        })();

        // A dispatched fix skips the budget check; the event for reaching
        // the budget rides on the next undispatched report.
        if !dispatched
            && inner.nav_settings.max_nav_samples > 0
            && inner.num_nav_samples >= inner.nav_settings.max_nav_samples
        {
            inner.nav_settings.max_nav_samples = 0;
            inner.events.push(GnssEvent::MaxNavSamples);
        }
    }

    // ---- request builders ----

    fn sync_baud_rate(&self, inner: &mut RxInner, baud: u32) {
        trace!(baud, "syncing baud rate");
        inner.comms.set_baudrate(baud);
        self.initiate_timeout(inner, SYNC_TIMEOUT_MS);
        // A deliberately bad CFG message; the NACK proves the link.
        let _ = inner.comms.send_frame_with_expect(
            class::CFG,
            cfg::ID_MSG,
            vec![class::BAD, 0x00],
            class::ACK,
            ack::ID_NACK,
        );
    }

    fn send_valset(&self, inner: &mut RxInner, valset: &CfgValset) {
        self.initiate_timeout(inner, DEFAULT_TIMEOUT_MS);
        let _ = inner.comms.send_frame_with_expect(
            class::CFG,
            cfg::ID_VALSET,
            valset.encode(),
            class::ACK,
            ack::ID_ACK,
        );
    }

    fn setup_uart_port(&self, inner: &mut RxInner) {
        trace!("configuring UART1");
        let mut valset = CfgValset::new(keys::layers::BBR | keys::layers::RAM);
        valset
            .push(keys::uart1::ENABLED, 1)
            .push(keys::uart1::BAUDRATE, MAX_BAUDRATE as u64)
            .push(keys::uart1::STOPBITS, keys::uart1::STOPBITS_ONE)
            .push(keys::uart1::DATABITS, keys::uart1::DATABITS_EIGHT)
            .push(keys::uart1::PARITY, keys::uart1::PARITY_NONE)
            .push(keys::uart1::INPROT_UBX, 1)
            .push(keys::uart1::OUTPROT_UBX, 1)
            .push(keys::uart1::INPROT_NMEA, 0)
            .push(keys::uart1::OUTPROT_NMEA, 0);
        self.send_valset(inner, &valset);
    }

    fn setup_gnss_signals(&self, inner: &mut RxInner) {
        trace!("configuring GNSS signals");
        let mut valset = CfgValset::new(keys::layers::BBR | keys::layers::RAM);
        valset
            .push(keys::signal::GPS_ENA, 1)
            .push(keys::signal::GPS_L1CA_ENA, 1)
            .push(keys::signal::SBAS_ENA, 1)
            .push(keys::signal::SBAS_L1CA_ENA, 0)
            .push(keys::signal::GAL_ENA, 1)
            .push(keys::signal::GAL_E1_ENA, 1)
            .push(keys::signal::BDS_ENA, 0)
            .push(keys::signal::BDS_B1_ENA, 0)
            .push(keys::signal::BDS_B1C_ENA, 0)
            .push(keys::signal::QZSS_ENA, 1)
            .push(keys::signal::QZSS_L1CA_ENA, 1)
            .push(keys::signal::QZSS_L1S_ENA, 0)
            .push(keys::signal::GLO_ENA, 1)
            .push(keys::signal::GLO_L1_ENA, 1);
        self.send_valset(inner, &valset);
    }

    fn save_config(&self, inner: &mut RxInner) {
        trace!("saving configuration");
        self.initiate_timeout(inner, DEFAULT_TIMEOUT_MS);
        let msg = CfgCfg {
            clear_mask: 0,
            save_mask: 0xFFFF_FFFF,
            load_mask: 0,
            device_mask: CfgCfg::DEV_BBR,
        };
        let _ = inner.comms.send_frame_with_expect(
            class::CFG,
            cfg::ID_CFG,
            msg.encode(),
            class::ACK,
            ack::ID_ACK,
        );
    }

    fn soft_reset(&self, inner: &mut RxInner) {
        trace!("soft reset");
        let msg = CfgRst {
            nav_bbr_mask: 0x0000,
            reset_mode: CfgRst::MODE_GNSS_ONLY,
        };
        let _ = inner.comms.send_frame(class::CFG, cfg::ID_RST, msg.encode());
    }

    fn disable_odometer(&self, inner: &mut RxInner) {
        trace!("disabling odometer");
        let mut valset = CfgValset::new(keys::layers::BBR | keys::layers::RAM);
        valset
            .push(keys::odo::USE_ODO, 0)
            .push(keys::odo::USE_COG, 0)
            .push(keys::odo::OUTLPVEL, 0)
            .push(keys::odo::OUTLPCOG, 0)
            .push(keys::odo::PROFILE, keys::odo::PROFILE_RUNNING)
            .push(keys::odo::COG_MAXSPEED, 1)
            .push(keys::odo::COG_MAXPOSACC, 50)
            .push(keys::odo::VEL_LPGAIN, 153)
            .push(keys::odo::COG_LPGAIN, 76);
        self.send_valset(inner, &valset);
    }

    fn disable_timepulse(&self, inner: &mut RxInner) {
        trace!("disabling timepulse output");
        let mut valset = CfgValset::new(keys::layers::BBR | keys::layers::RAM);
        valset
            .push(keys::tp::PULSE_DEF, keys::tp::PULSE_DEF_PERIOD)
            .push(keys::tp::PERIOD_TP1, 1_000_000)
            .push(keys::tp::PERIOD_LOCK_TP1, 1_000_000)
            .push(keys::tp::LEN_TP1, 0)
            .push(keys::tp::POL_TP1, 0)
            .push(keys::tp::TP1_ENA, 0);
        self.send_valset(inner, &valset);
    }

    fn setup_power_management(&self, inner: &mut RxInner) {
        trace!("configuring power management");
        let mode = match inner.nav_settings.power_mode {
            PowerMode::CyclicTracking => keys::pm::MODE_PSMCT,
            PowerMode::FullPower => keys::pm::MODE_FULL,
        };
        let mut valset = CfgValset::new(keys::layers::BBR | keys::layers::RAM);
        valset
            .push(keys::pm::OPERATEMODE, mode)
            .push(keys::pm::POSUPDATEPERIOD, 1000)
            .push(keys::pm::ACQPERIOD, 10_000)
            .push(keys::pm::GRIDOFFSET, 0)
            .push(keys::pm::ONTIME, 1)
            .push(keys::pm::MINACQTIME, 300)
            .push(keys::pm::MAXACQTIME, 0)
            .push(keys::pm::DONOTENTEROFF, 1)
            .push(keys::pm::WAITTIMEFIX, 0)
            .push(keys::pm::UPDATEEPH, 1);
        self.send_valset(inner, &valset);
    }

    fn setup_operating_mode(&self, inner: &mut RxInner) {
        trace!("applying operating mode");
        let mode = match inner.nav_settings.power_mode {
            PowerMode::CyclicTracking => keys::pm::MODE_PSMCT,
            PowerMode::FullPower => keys::pm::MODE_FULL,
        };
        let mut valset = CfgValset::new(keys::layers::BBR | keys::layers::RAM);
        valset.push(keys::pm::OPERATEMODE, mode);
        self.send_valset(inner, &valset);
    }

    fn setup_simple_navigation(&self, inner: &mut RxInner) {
        trace!("configuring navigation engine");
        let mut valset = CfgValset::new(keys::layers::BBR | keys::layers::RAM);
        valset
            .push(keys::navspg::FIXMODE, inner.nav_settings.fix_mode as u64)
            .push(keys::navspg::DYNMODEL, inner.nav_settings.dyn_model as u64)
            .push(keys::navspg::INIFIX3D, 1)
            .push(keys::navspg::WKNROLLOVER, 1024)
            .push(keys::navspg::UTCSTANDARD, keys::navspg::UTC_USNO)
            .push(keys::navspg::INFIL_MINSVS, 4)
            .push(keys::navspg::INFIL_MINCNO, 10)
            .push(keys::navspg::OUTFIL_PDOP, 250)
            .push(keys::navspg::OUTFIL_TDOP, 250)
            .push(keys::navspg::OUTFIL_PACC, 100)
            .push(keys::navspg::OUTFIL_TACC, 350)
            .push(keys::navspg::CONSTR_ALT, 0)
            .push(keys::navspg::CONSTR_ALTVAR, 10_000)
            .push(keys::navspg::INFIL_MINELEV, 5)
            .push(keys::navspg::CONSTR_DGNSSTO, 60)
            .push(keys::navspg::SIGATTCOMP, keys::navspg::SIGATTCOMP_AUTO);
        self.send_valset(inner, &valset);
    }

    fn setup_expert_navigation(&self, inner: &mut RxInner) {
        trace!("configuring assistance options");
        let use_ana = inner.nav_settings.assistnow_autonomous as u64;
        let mut valset = CfgValset::new(keys::layers::BBR | keys::layers::RAM);
        valset
            .push(keys::navspg::INFIL_MINSVS, 3)
            .push(keys::navspg::INFIL_MAXSVS, 32)
            .push(keys::navspg::INIFIX3D, 1)
            .push(keys::navspg::ACKAIDING, 1)
            .push(keys::navspg::SIGATTCOMP, keys::navspg::SIGATTCOMP_DISABLE)
            .push(keys::ana::USE_ANA, use_ana)
            .push(keys::ana::ORBMAXERR, 100);
        self.send_valset(inner, &valset);
    }

    fn supply_time_assistance(&self, inner: &mut RxInner) {
        let Some(now) = inner.rtc.now() else {
            inner.op_state = OpState::Success;
            return;
        };
        trace!(time = %now, "supplying time assistance");
        use chrono::{Datelike, Timelike};
        let msg = MgaIniTimeUtc {
            year: now.year() as u16,
            month: now.month() as u8,
            day: now.day() as u8,
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            second: now.second() as u8,
            t_acc_s: 2,
        };
        self.initiate_timeout(inner, DEFAULT_TIMEOUT_MS);
        let _ = inner.comms.send_frame_with_expect(
            class::MGA,
            mga::ID_INI,
            msg.encode(),
            class::MGA,
            mga::ID_ACK,
        );
    }

    fn set_nav_message_rate(&self, inner: &mut RxInner, key: u32, rate: u64) {
        trace!(key = format_args!("{key:#010x}"), rate, "nav message rate");
        let mut valset = CfgValset::new(keys::layers::BBR | keys::layers::RAM);
        valset.push(key, rate);
        self.send_valset(inner, &valset);
    }

    fn fetch_navigation_database(&self, inner: &mut RxInner) {
        trace!("polling navigation database");
        self.initiate_timeout(inner, DEFAULT_TIMEOUT_MS);
        let _ = inner.comms.send_frame(class::MGA, mga::ID_DBD, Vec::new());
    }
}
