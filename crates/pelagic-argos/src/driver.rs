//! The transceiver driver: a cooperative state machine that keeps the
//! device powered only while there is work.
//!
//! Every state runs as a short tick on the scheduler and re-posts itself
//! with a computed delay; nothing here blocks. Queued work is checked in
//! `Idle` in strict priority order: data packet, then downlink
//! acknowledgement, then reception. `power_off` only sets a flag -- the
//! machine finishes in-flight work and settles into `Stopped`, where the
//! SPI session, the PA driver and the power pins are released.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, error, trace};

use pelagic_fs::{File, Filesystem, OpenFlags, Whence};
use pelagic_sched::{Scheduler, TaskHandle};
use pelagic_types::{ArgosMode, ArgosPower, RadioEvent};

use crate::error::{ArgosError, ArgosResult};
use crate::firmware::{self, FirmwareHeader, ADDRESS_LEN, SECTION_ORDER};
use crate::frame;
use crate::port::ArticPorts;
use crate::registers::*;

/// Driver configuration fixed at construction.
#[derive(Clone, Debug)]
pub struct ArticConfig {
    /// 28-bit Argos platform identifier.
    pub device_id: u32,
    /// TX carrier frequency in MHz (Argos 2/3 band).
    pub tx_frequency_mhz: f64,
    /// TCXO warm-up applied to the first transmission after power-up.
    pub tcxo_warmup_s: u32,
    /// Idle dwell before the device is powered down.
    pub idle_timeout_ms: u64,
    pub tx_power: ArgosPower,
    /// Firmware image file in the filesystem.
    pub firmware_file: String,
}

impl Default for ArticConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            tx_frequency_mhz: 401.65,
            tcxo_warmup_s: 5,
            idle_timeout_ms: 5000,
            tx_power: ArgosPower::Mw500,
            firmware_file: "artic_firmware.dat".into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArticState {
    Stopped,
    Starting,
    PoweringOn,
    ResetAssert,
    ResetDeassert,
    DspReset,
    SendFirmwareImage,
    WaitFirmwareReady,
    CheckFirmwareCrc,
    IdlePending,
    Idle,
    ReceivePending,
    Receiving,
    TransmitPending,
    Transmitting,
    Error,
}

/// Incremental firmware-upload progress, kept across ticks.
struct FwUpload {
    file: File,
    header: FirmwareHeader,
    section: usize,
    bytes_total_read: u32,
    section_len: u32,
    word_len: usize,
    pending: Vec<u8>,
    start_address: u32,
    last_address: u32,
}

struct Inner {
    sched: Scheduler,
    fs: Rc<Filesystem>,
    cfg: ArticConfig,
    make_ports: Box<dyn Fn() -> ArticPorts>,

    state: ArticState,
    task: TaskHandle,
    next_delay: u64,
    state_counter: u32,
    stopping: bool,
    is_first_tx: bool,

    rx_pending: bool,
    rx_mode: ArgosMode,
    tx_mode: ArgosMode,
    packet_buffer: Vec<u8>,
    ack_buffer: Vec<u8>,
    tx_buffer: Vec<u8>,

    rx_total_time_ms: u64,
    rx_timer_start_ms: u64,

    ports: Option<ArticPorts>,
    upload: Option<FwUpload>,
    events: Vec<RadioEvent>,
}

/// Cloneable handle to the satellite transceiver driver.
#[derive(Clone)]
pub struct ArticSat {
    inner: Rc<RefCell<Inner>>,
    sinks: Rc<RefCell<Vec<Box<dyn FnMut(&RadioEvent)>>>>,
}

impl ArticSat {
    pub fn new(
        sched: Scheduler,
        fs: Rc<Filesystem>,
        cfg: ArticConfig,
        make_ports: Box<dyn Fn() -> ArticPorts>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                sched,
                fs,
                cfg,
                make_ports,
                state: ArticState::Stopped,
                task: TaskHandle::INVALID,
                next_delay: 0,
                state_counter: 0,
                stopping: false,
                is_first_tx: true,
                rx_pending: false,
                rx_mode: ArgosMode::A3,
                tx_mode: ArgosMode::A3,
                packet_buffer: Vec::new(),
                ack_buffer: Vec::new(),
                tx_buffer: Vec::new(),
                rx_total_time_ms: 0,
                rx_timer_start_ms: 0,
                ports: None,
                upload: None,
                events: Vec::new(),
            })),
            sinks: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Register an event callback.
    pub fn subscribe(&self, sink: impl FnMut(&RadioEvent) + 'static) {
        self.sinks.borrow_mut().push(Box::new(sink));
    }

    pub fn state(&self) -> ArticState {
        self.inner.borrow().state
    }

    /// Power the device up (no-op beyond clearing a pending power-off when
    /// already running) and start the state machine.
    pub fn power_on(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != ArticState::Stopped {
                inner.stopping = false;
                trace!(state = ?inner.state, "power_on: already running");
                return;
            }
            debug!("power_on");
            inner.state = ArticState::Starting;
            inner.stopping = false;
        }
        self.tick();
    }

    /// Request a graceful shutdown: in-flight work completes first.
    pub fn power_off(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state != ArticState::Stopped {
            debug!("power_off requested");
            inner.stopping = true;
        }
    }

    /// Cancel the state machine and force `Stopped` immediately.
    pub fn power_off_immediate(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == ArticState::Stopped {
                return;
            }
            debug!("power_off_immediate");
            let task = inner.task;
            inner.sched.cancel(task);
            let _ = change(&mut inner, ArticState::Stopped);
        }
        self.drain_events();
    }

    /// Queue a user payload of `payload_bits` bits for transmission and
    /// power the device on.
    pub fn send(&self, mode: ArgosMode, payload: &[u8], payload_bits: u32) -> ArgosResult<()> {
        {
            let mut inner = self.inner.borrow_mut();
            let frame = frame::encode_uplink(mode, inner.cfg.device_id, payload, payload_bits)?;
            trace!(
                bits = frame.total_bits,
                data = %hex::encode_upper(&frame.bytes),
                "uplink queued"
            );
            inner.tx_mode = mode;
            inner.packet_buffer = frame.bytes;
        }
        self.power_on();
        Ok(())
    }

    /// Queue a downlink acknowledgement. ACKs take priority over queued
    /// data packets.
    pub fn send_ack(&self, mode: ArgosMode, a_dcs: u32, dl_msg_id: u32, exec_report: u32) {
        {
            let mut inner = self.inner.borrow_mut();
            let frame =
                frame::encode_ack(mode, inner.cfg.device_id, a_dcs, dl_msg_id, exec_report);
            trace!(bits = frame.total_bits, "ack queued");
            inner.tx_mode = mode;
            inner.ack_buffer = frame.bytes;
        }
        self.power_on();
    }

    /// Ask for continuous reception; delivered packets arrive as
    /// [`RadioEvent::RxPacket`].
    pub fn start_receive(&self, mode: ArgosMode) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.rx_mode = mode;
            inner.rx_pending = true;
        }
        self.power_on();
    }

    pub fn stop_receive(&self) {
        self.inner.borrow_mut().rx_pending = false;
    }

    /// Drop all queued transmissions, aborting one in progress.
    pub fn stop_send(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.packet_buffer.clear();
        inner.ack_buffer.clear();
        inner.tx_buffer.clear();
    }

    /// Total time spent in reception since the last call; resets on read.
    pub fn cumulative_receive_time_ms(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        std::mem::take(&mut inner.rx_total_time_ms)
    }

    pub fn set_frequency(&self, mhz: f64) {
        self.inner.borrow_mut().cfg.tx_frequency_mhz = mhz;
    }

    pub fn set_tx_power(&self, power: ArgosPower) {
        self.inner.borrow_mut().cfg.tx_power = power;
    }

    pub fn set_tcxo_warmup_time(&self, seconds: u32) {
        self.inner.borrow_mut().cfg.tcxo_warmup_s = seconds;
    }

    /// One pass of the state machine; re-posts itself until `Stopped`.
    fn tick(&self) {
        let mut repost = None;
        {
            let mut inner = self.inner.borrow_mut();
            inner.next_delay = 0;
            if let Err(e) = run_state(&mut inner) {
                error!(state = ?inner.state, error = %e, "state machine fault");
                let _ = change(&mut inner, ArticState::Error);
            }
            if inner.state != ArticState::Stopped {
                repost = Some(inner.next_delay);
            }
        }
        self.drain_events();
        if let Some(delay) = repost {
            let this = self.clone();
            let handle = {
                let inner = self.inner.borrow();
                inner
                    .sched
                    .post_delayed("artic-sm", delay, move || this.tick())
            };
            self.inner.borrow_mut().task = handle;
        }
    }

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
}

// ---- state machine ----

fn run_state(inner: &mut Inner) -> ArgosResult<()> {
    match inner.state {
        ArticState::Stopped => Ok(()),
        ArticState::Starting => state_starting(inner),
        ArticState::PoweringOn => state_powering_on(inner),
        ArticState::ResetAssert => state_reset_assert(inner),
        ArticState::ResetDeassert => state_reset_deassert(inner),
        ArticState::DspReset => state_dsp_reset(inner),
        ArticState::SendFirmwareImage => state_send_firmware_image(inner),
        ArticState::WaitFirmwareReady => state_wait_firmware_ready(inner),
        ArticState::CheckFirmwareCrc => state_check_firmware_crc(inner),
        ArticState::IdlePending => state_idle_pending(inner),
        ArticState::Idle => state_idle(inner),
        ArticState::ReceivePending => state_receive_pending(inner),
        ArticState::Receiving => state_receiving(inner),
        ArticState::TransmitPending => state_transmit_pending(inner),
        ArticState::Transmitting => state_transmitting(inner),
        ArticState::Error => state_error(inner),
    }
}

/// Transition: run the old state's exit hook, then the new state's enter
/// hook (which may itself transition again).
fn change(inner: &mut Inner, to: ArticState) -> ArgosResult<()> {
    let from = inner.state;
    trace!(?from, ?to, "state change");
    inner.state = to;
    exit_hook(inner, from)?;
    enter_hook(inner, to)
}

fn exit_hook(inner: &mut Inner, state: ArticState) -> ArgosResult<()> {
    match state {
        ArticState::PoweringOn => inner.next_delay = DELAY_POWER_ON_MS,
        ArticState::ResetAssert | ArticState::ResetDeassert => inner.next_delay = DELAY_RESET_MS,
        ArticState::Receiving => {
            let now = inner.sched.now_ms();
            inner.rx_total_time_ms += now - inner.rx_timer_start_ms;
        }
        ArticState::Transmitting => {
            inner.is_first_tx = false;
            if let Some(ports) = inner.ports.as_mut() {
                ports.pa.set_output_power(0);
            }
        }
        _ => {}
    }
    Ok(())
}

fn enter_hook(inner: &mut Inner, state: ArticState) -> ArgosResult<()> {
    match state {
        ArticState::Stopped => {
            // Release every resource acquired in Starting and drop the
            // power pins.
            if let Some(mut ports) = inner.ports.take() {
                ports.spi.set_reset(false);
                ports.spi.set_power_enable(false);
            }
            inner.upload = None;
            inner.events.push(RadioEvent::PowerOff);
        }
        ArticState::ResetDeassert => inner.next_delay = DELAY_RESET_MS,
        ArticState::DspReset => inner.state_counter = 3,
        ArticState::SendFirmwareImage => {
            let mut file = File::open(&inner.fs, &inner.cfg.firmware_file, OpenFlags::READ)?;
            file.seek(0, Whence::Set)?;
            let mut header = [0u8; FirmwareHeader::LEN];
            if file.read(&mut header)? != FirmwareHeader::LEN {
                return Err(ArgosError::BadImage("image shorter than its header".into()));
            }
            inner.upload = Some(FwUpload {
                file,
                header: FirmwareHeader::from_bytes(&header),
                section: 0,
                bytes_total_read: 0,
                section_len: 0,
                word_len: 0,
                pending: Vec::new(),
                start_address: 0,
                last_address: 0,
            });
        }
        ArticState::WaitFirmwareReady => {
            inner.state_counter = 100;
            dsp_config(inner)?;
        }
        ArticState::IdlePending => {
            inner.state_counter = 100;
            send_command(inner, CMD_GO_TO_IDLE)?;
        }
        ArticState::Idle => {
            if status_has(inner, STATUS_IDLE)? {
                inner.next_delay = DELAY_TICK_MS;
                inner.state_counter = (inner.cfg.idle_timeout_ms / DELAY_TICK_MS) as u32;
            } else {
                change(inner, ArticState::IdlePending)?;
            }
        }
        ArticState::ReceivePending => {
            inner.state_counter = 100;
            initiate_rx(inner)?;
        }
        ArticState::Receiving => {
            send_command(inner, CMD_START_CONTINUOUS_RECEPTION)?;
            inner.rx_timer_start_ms = inner.sched.now_ms();
        }
        ArticState::TransmitPending => {
            inner.state_counter = 100;
            if inner.tx_buffer.is_empty() {
                change(inner, ArticState::Idle)?;
            } else {
                initiate_tx(inner)?;
            }
        }
        ArticState::Transmitting => {
            // Allow for TCXO warm-up on the first transmission.
            inner.state_counter = if inner.is_first_tx {
                500 + inner.cfg.tcxo_warmup_s * 100
            } else {
                500
            };
            send_command(inner, CMD_TRANSMIT_ONE_PACKAGE_AND_GO_IDLE)?;
        }
        ArticState::Error => {
            if let Ok(status) = read_status(inner) {
                for (i, name) in STATUS_NAMES.iter().enumerate() {
                    if status & (1 << i) != 0 {
                        trace!(bit = name, "status");
                    }
                }
            }
            inner.events.push(RadioEvent::DeviceError);
        }
        _ => {}
    }
    Ok(())
}

fn state_starting(inner: &mut Inner) -> ArgosResult<()> {
    inner.is_first_tx = true;
    inner.rx_total_time_ms = 0;
    inner.ports = Some((inner.make_ports)());
    change(inner, ArticState::PoweringOn)
}

fn state_powering_on(inner: &mut Inner) -> ArgosResult<()> {
    let ports = ports(inner)?;
    ports.spi.set_power_enable(true);
    ports.spi.set_reset(true);
    change(inner, ArticState::ResetAssert)
}

fn state_reset_assert(inner: &mut Inner) -> ArgosResult<()> {
    ports(inner)?.spi.set_reset(false);
    change(inner, ArticState::ResetDeassert)
}

fn state_reset_deassert(inner: &mut Inner) -> ArgosResult<()> {
    ports(inner)?.spi.set_reset(true);
    change(inner, ArticState::DspReset)
}

fn state_dsp_reset(inner: &mut Inner) -> ArgosResult<()> {
    // The boot loader reports 0x55 once it is ready for a firmware image.
    let response = dsp_status(inner).unwrap_or(0);
    trace!(response, "DSP status");
    if response == DSP_STATUS_BOOT_READY {
        change(inner, ArticState::SendFirmwareImage)
    } else {
        inner.state_counter -= 1;
        if inner.state_counter == 0 {
            error!("DSP reset failed");
            Err(ArgosError::BootTimeout)
        } else {
            inner.next_delay = DELAY_BOOT_MS;
            Ok(())
        }
    }
}

fn state_send_firmware_image(inner: &mut Inner) -> ArgosResult<()> {
    let mut upload = inner.upload.take().expect("upload state missing");
    let step = upload_step(inner, &mut upload);
    inner.upload = Some(upload);
    if step? {
        change(inner, ArticState::WaitFirmwareReady)?;
    }
    Ok(())
}

/// Push the upload forward by at most one burst write; returns `Ok(true)`
/// once every section has been programmed.
fn upload_step(inner: &mut Inner, upload: &mut FwUpload) -> ArgosResult<bool> {
    let mem = SECTION_ORDER[upload.section];

    if upload.bytes_total_read == 0 {
        upload.section_len = upload.header.section_length(mem)?;
        upload.word_len = mem.word_len();
        upload.pending.clear();
        upload.start_address = 0;
        upload.last_address = 0;
    }

    while upload.bytes_total_read < upload.section_len {
        let record_len = ADDRESS_LEN + upload.word_len;
        let mut buf = vec![0u8; record_len];
        if upload.file.read(&mut buf)? != record_len {
            return Err(ArgosError::BadImage("truncated firmware section".into()));
        }
        let (address, word) = firmware::decode_record(mem, &buf)?;
        upload.bytes_total_read += record_len as u32;

        // A memory discontinuity or a full buffer flushes the accumulated
        // burst; yield to the scheduler between bursts.
        if upload.last_address + 1 < address
            || upload.pending.len() + upload.word_len >= MAX_BURST
        {
            let burst = std::mem::take(&mut upload.pending);
            let start = upload.start_address;
            upload.start_address = address;
            upload.last_address = address;
            upload
                .pending
                .extend(firmware::word_to_wire(word, upload.word_len));
            if !burst.is_empty() {
                burst_write(inner, mem, start, &burst)?;
            }
            return Ok(false);
        }

        upload
            .pending
            .extend(firmware::word_to_wire(word, upload.word_len));
        upload.last_address = address;
    }

    // Section complete: flush the tail burst and move on.
    let burst = std::mem::take(&mut upload.pending);
    if !burst.is_empty() {
        burst_write(inner, mem, upload.start_address, &burst)?;
    }
    upload.bytes_total_read = 0;
    upload.section += 1;
    Ok(upload.section >= SECTION_ORDER.len())
}

fn state_wait_firmware_ready(inner: &mut Inner) -> ArgosResult<()> {
    let ready = (1 << STATUS_IDLE) | (1 << STATUS_RX_CALIBRATION_FINISHED);
    if read_status(inner)? & ready == ready {
        change(inner, ArticState::CheckFirmwareCrc)
    } else {
        inner.state_counter -= 1;
        if inner.state_counter == 0 {
            error!("firmware did not start");
            Err(ArgosError::BootTimeout)
        } else {
            inner.next_delay = DELAY_TICK_MS;
            Ok(())
        }
    }
}

fn state_check_firmware_crc(inner: &mut Inner) -> ArgosResult<()> {
    let mut crc_words = [0u8; 3 * XMEM_WORD];
    burst_read(inner, MemId::Xmem, CRC_RESULTS_ADDRESS, &mut crc_words)?;

    let header = inner.upload.as_ref().expect("upload state missing").header;
    let sections: [(&'static str, u32, &[u8]); 3] = [
        ("PMEM", header.pmem_crc, &crc_words[0..3]),
        ("XMEM", header.xmem_crc, &crc_words[3..6]),
        ("YMEM", header.ymem_crc, &crc_words[6..9]),
    ];
    for (section, image, wire) in sections {
        let device = firmware::wire_to_word(wire);
        if device != image {
            error!(section, device, image, "firmware CRC mismatch");
            return Err(ArgosError::CrcFailure {
                section,
                device,
                image,
            });
        }
    }
    trace!("firmware CRC values all match");
    inner.upload = None;
    inner.events.push(RadioEvent::DeviceReady);
    change(inner, ArticState::Idle)
}

fn state_idle_pending(inner: &mut Inner) -> ArgosResult<()> {
    if status_has(inner, STATUS_IDLE_STATE)? {
        clear_interrupt(inner, 1)?;
        change(inner, ArticState::Idle)
    } else {
        inner.state_counter -= 1;
        if inner.state_counter == 0 {
            error!("failed to enter IDLE state");
            Err(ArgosError::IncorrectStatus("idle request not honoured"))
        } else {
            inner.next_delay = DELAY_TICK_MS;
            Ok(())
        }
    }
}

fn state_idle(inner: &mut Inner) -> ArgosResult<()> {
    if !inner.packet_buffer.is_empty() {
        inner.tx_buffer = std::mem::take(&mut inner.packet_buffer);
        change(inner, ArticState::TransmitPending)?;
    } else if !inner.ack_buffer.is_empty() {
        inner.tx_buffer = std::mem::take(&mut inner.ack_buffer);
        change(inner, ArticState::TransmitPending)?;
    } else if inner.rx_pending {
        change(inner, ArticState::ReceivePending)?;
    } else if inner.stopping {
        change(inner, ArticState::Stopped)?;
        return Ok(());
    } else {
        inner.next_delay = DELAY_TICK_MS;
        inner.state_counter -= 1;
        if inner.state_counter == 0 {
            debug!("idle timeout elapsed");
            change(inner, ArticState::Stopped)?;
        }
        return Ok(());
    }

    inner.state_counter = (inner.cfg.idle_timeout_ms / DELAY_TICK_MS) as u32;
    Ok(())
}

fn state_receive_pending(inner: &mut Inner) -> ArgosResult<()> {
    if status_has(inner, STATUS_MCU_COMMAND_ACCEPTED)? {
        clear_interrupt(inner, 1)?;
        change(inner, ArticState::Receiving)
    } else {
        inner.state_counter -= 1;
        if inner.state_counter == 0 {
            error!("RX mode command not accepted");
            Err(ArgosError::IncorrectStatus("RX mode command rejected"))
        } else {
            inner.next_delay = DELAY_TICK_MS;
            Ok(())
        }
    }
}

fn state_receiving(inner: &mut Inner) -> ArgosResult<()> {
    // Queued transmissions and reception shutdown take priority; both are
    // handled from Idle.
    if !inner.packet_buffer.is_empty() || !inner.ack_buffer.is_empty() || !inner.rx_pending {
        return change(inner, ArticState::Idle);
    }
    if inner.stopping {
        return change(inner, ArticState::Stopped);
    }

    if status_has(inner, STATUS_RX_VALID_MESSAGE)? {
        let mut region = [0u8; MAX_RX_SIZE_BYTES];
        burst_read(inner, MemId::Xmem, RX_PAYLOAD_ADDRESS, &mut region)?;
        clear_interrupt(inner, 1)?;
        if let Some(packet) = frame::decode_downlink(&region) {
            trace!(data = %hex::encode_upper(&packet.data), "downlink packet");
            inner.events.push(RadioEvent::RxPacket {
                data: packet.data,
                size_bits: packet.size_bits,
            });
        }
    }
    inner.next_delay = DELAY_TICK_MS;
    Ok(())
}

fn state_transmit_pending(inner: &mut Inner) -> ArgosResult<()> {
    if status_has(inner, STATUS_MCU_COMMAND_ACCEPTED)? {
        clear_interrupt(inner, 1)?;
        inner.events.push(RadioEvent::TxStarted);
        change(inner, ArticState::Transmitting)
    } else {
        inner.state_counter -= 1;
        if inner.state_counter == 0 {
            error!("PTT TX command not accepted");
            Err(ArgosError::IncorrectStatus("TX mode command rejected"))
        } else {
            inner.next_delay = DELAY_TICK_MS;
            Ok(())
        }
    }
}

fn state_transmitting(inner: &mut Inner) -> ArgosResult<()> {
    if status_has(inner, STATUS_TX_FINISHED)? {
        clear_interrupt(inner, 1)?;
        // An empty TX buffer here means the transmission was aborted.
        if !inner.tx_buffer.is_empty() {
            inner.tx_buffer.clear();
            inner.events.push(RadioEvent::TxComplete);
        }
        change(inner, ArticState::Idle)
    } else if inner.tx_buffer.is_empty() {
        change(inner, ArticState::Idle)
    } else {
        inner.state_counter -= 1;
        if inner.state_counter == 0 {
            error!("transmission did not complete");
            Err(ArgosError::IncorrectStatus("TX did not finish"))
        } else {
            inner.next_delay = DELAY_TICK_MS;
            Ok(())
        }
    }
}

fn state_error(inner: &mut Inner) -> ArgosResult<()> {
    change(inner, ArticState::Stopped)
}

// ---- device access helpers ----

fn ports(inner: &mut Inner) -> ArgosResult<&mut ArticPorts> {
    inner
        .ports
        .as_mut()
        .ok_or_else(|| ArgosError::Spi("device not powered".into()))
}

fn send_command(inner: &mut Inner, command: u8) -> ArgosResult<()> {
    let mut rx = [0u8; 1];
    ports(inner)?.spi.transfer(&[command], &mut rx)
}

fn dsp_status(inner: &mut Inner) -> ArgosResult<u32> {
    let tx = [read_address(ADDRESS_DSP), 0, 0, 0];
    let mut rx = [0u8; 4];
    ports(inner)?.spi.transfer(&tx, &mut rx)?;
    Ok(firmware::wire_to_word(&rx[1..4]))
}

fn dsp_config(inner: &mut Inner) -> ArgosResult<()> {
    let tx = [write_address(ADDRESS_DSP), 0, 0, 0];
    let mut rx = [0u8; 4];
    ports(inner)?.spi.transfer(&tx, &mut rx)
}

fn configure_burst(inner: &mut Inner, mem: MemId, read: bool, start: u32) -> ArgosResult<()> {
    let mut reg = BURST_MODE_ENABLE;
    reg |= (mem.mem_sel() << MEM_SEL_SHIFT) & MEM_SEL_MASK;
    if read {
        reg |= BURST_READ;
    }
    reg |= start & BURST_START_ADDRESS_MASK;

    let tx = [
        write_address(BURST_ADDRESS),
        (reg >> 16) as u8,
        (reg >> 8) as u8,
        reg as u8,
    ];
    let mut rx = [0u8; 4];
    ports(inner)?.spi.transfer(&tx, &mut rx)
}

fn burst_write(inner: &mut Inner, mem: MemId, start: u32, data: &[u8]) -> ArgosResult<()> {
    debug_assert_eq!(data.len() % mem.word_len(), 0);
    configure_burst(inner, mem, false, start)?;
    let word = mem.word_len();
    let result = (|| -> ArgosResult<()> {
        let ports = ports(inner)?;
        let mut scratch = [0u8; PMEM_WORD];
        for chunk in data.chunks(word) {
            ports
                .spi
                .transfer_continuous(chunk, &mut scratch[..chunk.len()])?;
        }
        Ok(())
    })();
    if let Ok(p) = ports(inner) {
        p.spi.finish_transfer();
    }
    result
}

fn burst_read(inner: &mut Inner, mem: MemId, start: u32, out: &mut [u8]) -> ArgosResult<()> {
    debug_assert_eq!(out.len() % mem.word_len(), 0);
    configure_burst(inner, mem, true, start)?;
    let word = mem.word_len();
    let result = (|| -> ArgosResult<()> {
        let ports = ports(inner)?;
        let zeros = [0u8; PMEM_WORD];
        for chunk in out.chunks_mut(word) {
            ports.spi.transfer_continuous(&zeros[..chunk.len()], chunk)?;
        }
        Ok(())
    })();
    if let Ok(p) = ports(inner) {
        p.spi.finish_transfer();
    }
    result
}

fn read_status(inner: &mut Inner) -> ArgosResult<u32> {
    let mut wire = [0u8; XMEM_WORD];
    burst_read(inner, MemId::Iomem, INTERRUPT_ADDRESS, &mut wire)?;
    Ok(firmware::wire_to_word(&wire))
}

fn status_has(inner: &mut Inner, bit: u32) -> ArgosResult<bool> {
    Ok(read_status(inner)? & (1 << bit) != 0)
}

fn clear_interrupt(inner: &mut Inner, which: u8) -> ArgosResult<()> {
    let command = if which == 1 {
        CMD_CLEAR_INT1
    } else {
        CMD_CLEAR_INT2
    };
    send_command(inner, command)
}

fn write_xmem_value(inner: &mut Inner, address: u32, value: u32) -> ArgosResult<()> {
    let wire = firmware::word_to_wire(value, XMEM_WORD);
    burst_write(inner, MemId::Xmem, address, &wire)
}

fn read_xmem_value(inner: &mut Inner, address: u32) -> ArgosResult<u32> {
    let mut wire = [0u8; XMEM_WORD];
    burst_read(inner, MemId::Xmem, address, &mut wire)?;
    Ok(firmware::wire_to_word(&wire))
}

/// Append `address` to the device's RX packet-filter LUT unless it is
/// already present: 24 LSBs in one slot, the 4 MSBs in the next, then the
/// incremented entry count written back.
fn add_rx_packet_filter(inner: &mut Inner, address: u32) -> ArgosResult<()> {
    let lut_size = read_xmem_value(inner, RX_FILTERING_CONFIG + 3)?;

    for i in 0..lut_size {
        let lsb = read_xmem_value(inner, RX_FILTERING_CONFIG + 4 + 2 * i)?;
        let msb = read_xmem_value(inner, RX_FILTERING_CONFIG + 5 + 2 * i)?;
        let existing = lsb | ((msb & 0xF) << 24);
        if existing == address {
            trace!(address = format_args!("{address:#010x}"), "filter already present");
            return Ok(());
        }
    }

    trace!(address = format_args!("{address:#010x}"), "filter added");
    write_xmem_value(inner, RX_FILTERING_CONFIG + 4 + 2 * lut_size, address & 0xFF_FFFF)?;
    write_xmem_value(inner, RX_FILTERING_CONFIG + 5 + 2 * lut_size, (address >> 24) & 0xF)?;
    write_xmem_value(inner, RX_FILTERING_CONFIG + 3, lut_size + 1)
}

fn initiate_rx(inner: &mut Inner) -> ArgosResult<()> {
    // Filter entries for packet types added after the firmware image was
    // frozen, plus our own address.
    add_rx_packet_filter(inner, FILTER_CONSTELLATION_STATUS)?;
    add_rx_packet_filter(inner, FILTER_ORBIT_PARAMETERS)?;
    let device_id = inner.cfg.device_id;
    add_rx_packet_filter(inner, device_id)?;

    let command = match inner.rx_mode {
        ArgosMode::A3 => CMD_SET_ARGOS_3_RX_MODE,
        ArgosMode::A2 => CMD_SET_ARGOS_4_RX_MODE,
    };
    send_command(inner, command)
}

fn initiate_tx(inner: &mut Inner) -> ArgosResult<()> {
    let milliwatts = inner.cfg.tx_power.milliwatts();
    ports(inner)?.pa.set_output_power(milliwatts);

    // Program the synthesizer's fractional part for the 2/3 band.
    let mhz = inner.cfg.tx_frequency_mhz;
    let fractional = (((4.0 * mhz * 1e6) / 26e6 - 61.0) * 4_194_304.0).round() as u32;
    write_xmem_value(inner, TX_FREQUENCY_ARGOS_2_3, fractional)?;

    let tx_buffer = std::mem::take(&mut inner.tx_buffer);
    burst_write(inner, MemId::Xmem, TX_PAYLOAD_ADDRESS, &tx_buffer)?;
    inner.tx_buffer = tx_buffer;

    let warmup = if inner.is_first_tx {
        inner.cfg.tcxo_warmup_s
    } else {
        0
    };
    write_xmem_value(inner, TCXO_WARMUP_TIME_ADDRESS, warmup)?;
    // Keep the TCXO running across the command.
    write_xmem_value(inner, TCXO_CONTROL_ADDRESS, 1)?;

    let command = match inner.tx_mode {
        ArgosMode::A3 => CMD_SET_PTT_A3_TX_MODE,
        ArgosMode::A2 => CMD_SET_PTT_A2_TX_MODE,
    };
    send_command(inner, command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::encode_record;
    use crate::mock::{mock_ports, MockDsp};
    use pelagic_fs::{FsConfig, RamBlockDevice};
    use pelagic_types::{bitpack::pack_bits, crc16};

    const DEVICE_ID: u32 = 0x0123_4567;
    const XMEM_CRC: u32 = 0x11_2233;
    const YMEM_CRC: u32 = 0x44_5566;
    const PMEM_CRC: u32 = 0x77_8899;

    type Section = Vec<(u32, u32)>;

    fn write_firmware_image(fs: &Rc<Filesystem>) -> (Section, Section, Section) {
        // XMEM has a contiguous run then a discontinuity to force a burst
        // flush mid-section.
        let xmem: Section = (0..10)
            .map(|i| (i, 0x00_1000 + i))
            .chain((0x40..0x43).map(|i| (i, 0x00_2000 + i)))
            .collect();
        let ymem: Section = (0..4).map(|i| (i, 0x00_3000 + i)).collect();
        let pmem: Section = (0..3).map(|i| (i, 0xA0B0_C000 | i)).collect();

        let header = FirmwareHeader {
            xmem_length: (xmem.len() * 6) as u32,
            xmem_crc: XMEM_CRC,
            ymem_length: (ymem.len() * 6) as u32,
            ymem_crc: YMEM_CRC,
            pmem_length: (pmem.len() * 7) as u32,
            pmem_crc: PMEM_CRC,
        };

        let mut file = File::open(
            fs,
            "artic_firmware.dat",
            OpenFlags::WRITE | OpenFlags::CREATE,
        )
        .unwrap();
        file.write(&header.to_bytes()).unwrap();
        for &(address, word) in &xmem {
            file.write(&encode_record(MemId::Xmem, address, word)).unwrap();
        }
        for &(address, word) in &ymem {
            file.write(&encode_record(MemId::Ymem, address, word)).unwrap();
        }
        for &(address, word) in &pmem {
            file.write(&encode_record(MemId::Pmem, address, word)).unwrap();
        }
        file.close().unwrap();
        (xmem, ymem, pmem)
    }

    struct Fixture {
        sched: Scheduler,
        dsp: Rc<RefCell<crate::mock::MockDsp>>,
        driver: ArticSat,
        events: Rc<RefCell<Vec<RadioEvent>>>,
        sections: (Section, Section, Section),
    }

    fn fixture(idle_timeout_ms: u64) -> Fixture {
        let dev = RamBlockDevice::shared(64, 4096, 256);
        let fs = Filesystem::new(dev, FsConfig::default());
        fs.format().unwrap();
        fs.mount().unwrap();
        let sections = write_firmware_image(&fs);

        let sched = Scheduler::new();
        let dsp = MockDsp::new();
        dsp.borrow_mut().set_crc_results(PMEM_CRC, XMEM_CRC, YMEM_CRC);

        let cfg = ArticConfig {
            device_id: DEVICE_ID,
            idle_timeout_ms,
            tcxo_warmup_s: 1,
            ..ArticConfig::default()
        };
        let ports_dsp = dsp.clone();
        let driver = ArticSat::new(
            sched.clone(),
            fs,
            cfg,
            Box::new(move || mock_ports(&ports_dsp)),
        );

        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        driver.subscribe(move |e| sink.borrow_mut().push(e.clone()));

        Fixture {
            sched,
            dsp,
            driver,
            events,
            sections,
        }
    }

    fn has_event(fx: &Fixture, wanted: &RadioEvent) -> bool {
        fx.events.borrow().iter().any(|e| e == wanted)
    }

    #[test]
    fn boots_uploads_firmware_and_idles() {
        let fx = fixture(5000);
        fx.driver.power_on();
        fx.sched.run_for(1500);

        assert_eq!(fx.driver.state(), ArticState::Idle);
        assert!(has_event(&fx, &RadioEvent::DeviceReady));

        let dsp = fx.dsp.borrow();
        assert!(dsp.power);
        assert!(dsp.reset);
        assert_eq!(dsp.dsp_config_count, 1);

        let (xmem, ymem, pmem) = &fx.sections;
        for &(address, word) in xmem {
            assert_eq!(
                dsp.mem.get(&(MemId::Xmem.mem_sel(), address)).unwrap(),
                &firmware::word_to_wire(word, 3),
                "XMEM word {address:#x}"
            );
        }
        for &(address, word) in ymem {
            assert_eq!(
                dsp.mem.get(&(MemId::Ymem.mem_sel(), address)).unwrap(),
                &firmware::word_to_wire(word, 3)
            );
        }
        for &(address, word) in pmem {
            assert_eq!(
                dsp.mem.get(&(MemId::Pmem.mem_sel(), address)).unwrap(),
                &firmware::word_to_wire(word, 4)
            );
        }
    }

    #[test]
    fn idle_timeout_powers_off() {
        let fx = fixture(200);
        fx.driver.power_on();
        fx.sched.run_for(3000);

        assert_eq!(fx.driver.state(), ArticState::Stopped);
        assert!(has_event(&fx, &RadioEvent::PowerOff));
        assert!(!fx.dsp.borrow().power);
        assert!(!fx.dsp.borrow().reset);
    }

    #[test]
    fn transmit_frames_payload_and_completes() {
        let fx = fixture(5000);
        let payload = [0x5Au8; 24];
        fx.driver.send(ArgosMode::A3, &payload, 192).unwrap();
        fx.sched.run_for(2500);

        assert!(has_event(&fx, &RadioEvent::TxStarted));
        assert!(has_event(&fx, &RadioEvent::TxComplete));

        let expected = frame::encode_uplink(ArgosMode::A3, DEVICE_ID, &payload, 192)
            .unwrap()
            .bytes;
        let staged = fx
            .dsp
            .borrow()
            .xmem_bytes(TX_PAYLOAD_ADDRESS, expected.len() / 3);
        assert_eq!(staged, expected);

        // PA raised for the transmission and dropped afterwards.
        let pa = fx.dsp.borrow().pa_settings.clone();
        assert!(pa.contains(&500));
        assert_eq!(*pa.last().unwrap(), 0);
    }

    #[test]
    fn queued_packet_preempts_reception() {
        let fx = fixture(5000);
        fx.driver.start_receive(ArgosMode::A3);
        fx.sched.run_for(1500);
        assert_eq!(fx.driver.state(), ArticState::Receiving);
        assert_eq!(fx.dsp.borrow().filter_count(), 3);

        fx.driver.send(ArgosMode::A3, &[1, 2, 3], 24).unwrap();
        fx.sched.run_for(1000);

        assert!(has_event(&fx, &RadioEvent::TxStarted));
        assert!(has_event(&fx, &RadioEvent::TxComplete));
        // Reception resumes afterwards, and re-adding the packet filters
        // does not duplicate LUT entries.
        assert_eq!(fx.driver.state(), ArticState::Receiving);
        assert_eq!(fx.dsp.borrow().filter_count(), 3);
    }

    #[test]
    fn data_packet_sent_before_queued_ack() {
        let fx = fixture(5000);
        fx.driver.send_ack(ArgosMode::A3, 0x0, 0x0042, 0x1);
        fx.driver.send(ArgosMode::A3, &[9, 9, 9], 24).unwrap();
        fx.sched.run_for(3000);

        let completes = fx
            .events
            .borrow()
            .iter()
            .filter(|e| **e == RadioEvent::TxComplete)
            .count();
        assert_eq!(completes, 2);

        // The ACK went out second, so its frame is what remains staged.
        let ack = frame::encode_ack(ArgosMode::A3, DEVICE_ID, 0x0, 0x0042, 0x1).bytes;
        let staged = fx.dsp.borrow().xmem_bytes(TX_PAYLOAD_ADDRESS, ack.len() / 3);
        assert_eq!(staged, ack);
    }

    fn rx_region(payload: &[u8]) -> Vec<u8> {
        let bits = payload.len() * 8;
        let crc = crc16::checksum(payload, bits);
        let mut data = payload.to_vec();
        data.extend_from_slice(&crc.to_be_bytes());

        let mut region = vec![0u8; 3 + data.len()];
        let mut cursor = 0;
        pack_bits((bits + 16) as u32, &mut region, &mut cursor, 24);
        region[3..].copy_from_slice(&data);
        region
    }

    #[test]
    fn downlink_packet_delivered_and_reception_continues() {
        let fx = fixture(5000);
        fx.driver.start_receive(ArgosMode::A3);
        fx.sched.run_for(1500);
        assert_eq!(fx.driver.state(), ArticState::Receiving);

        let payload = [0xC4u8, 0x01, 0x23, 0x45, 0x67, 0x89];
        let region = rx_region(&payload);
        {
            let mut dsp = fx.dsp.borrow_mut();
            dsp.load_xmem(RX_PAYLOAD_ADDRESS, &region);
            dsp.set_status_bit(STATUS_RX_VALID_MESSAGE);
        }
        fx.sched.run_for(100);

        let mut expected = payload.to_vec();
        expected.extend_from_slice(&crc16::checksum(&payload, 48).to_be_bytes());
        assert!(has_event(
            &fx,
            &RadioEvent::RxPacket {
                data: expected,
                size_bits: 64,
            }
        ));
        assert_eq!(fx.driver.state(), ArticState::Receiving);

        // Graceful power-off completes reception and accumulates RX time.
        fx.driver.power_off();
        fx.sched.run_for(500);
        assert_eq!(fx.driver.state(), ArticState::Stopped);
        assert!(has_event(&fx, &RadioEvent::PowerOff));
        assert!(fx.driver.cumulative_receive_time_ms() > 0);
    }

    #[test]
    fn corrupt_downlink_is_dropped() {
        let fx = fixture(5000);
        fx.driver.start_receive(ArgosMode::A3);
        fx.sched.run_for(1500);

        let mut region = rx_region(&[0xAA, 0xBB, 0xCC, 0xDD]);
        region[4] ^= 0x08;
        {
            let mut dsp = fx.dsp.borrow_mut();
            dsp.load_xmem(RX_PAYLOAD_ADDRESS, &region);
            dsp.set_status_bit(STATUS_RX_VALID_MESSAGE);
        }
        fx.sched.run_for(100);

        assert!(!fx
            .events
            .borrow()
            .iter()
            .any(|e| matches!(e, RadioEvent::RxPacket { .. })));
        assert_eq!(fx.driver.state(), ArticState::Receiving);
    }

    #[test]
    fn firmware_crc_mismatch_is_fatal() {
        let fx = fixture(5000);
        fx.dsp
            .borrow_mut()
            .set_crc_results(PMEM_CRC ^ 1, XMEM_CRC, YMEM_CRC);
        fx.driver.power_on();
        fx.sched.run_for(2000);

        assert_eq!(fx.driver.state(), ArticState::Stopped);
        assert!(has_event(&fx, &RadioEvent::DeviceError));
        assert!(has_event(&fx, &RadioEvent::PowerOff));
    }

    #[test]
    fn spi_fault_emits_device_error_and_stops() {
        let fx = fixture(5000);
        fx.driver.power_on();
        fx.sched.run_for(1500);
        assert_eq!(fx.driver.state(), ArticState::Idle);

        fx.dsp.borrow_mut().fail_spi = true;
        fx.driver.send(ArgosMode::A3, &[1, 2, 3], 24).unwrap();
        fx.sched.run_for(200);
        assert_eq!(fx.driver.state(), ArticState::Stopped);
        assert!(has_event(&fx, &RadioEvent::DeviceError));
        assert!(!has_event(&fx, &RadioEvent::TxComplete));
    }

    #[test]
    fn power_off_immediate_forces_stop() {
        let fx = fixture(5000);
        fx.driver.power_on();
        fx.sched.run_for(600);
        assert_ne!(fx.driver.state(), ArticState::Stopped);

        fx.driver.power_off_immediate();
        assert_eq!(fx.driver.state(), ArticState::Stopped);
        assert!(has_event(&fx, &RadioEvent::PowerOff));
        // The cancelled task must not revive the machine.
        fx.sched.run_for(2000);
        assert_eq!(fx.driver.state(), ArticState::Stopped);
    }
}
