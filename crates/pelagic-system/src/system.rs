//! Construction and wiring of the tracker core.
//!
//! Everything shared lives here and is handed down explicitly: the block
//! device, the filesystem, the scheduler, the real-time clock, the logs,
//! the calibration registry, the OTA updater, and the two radio drivers.
//! There is no global mutable state anywhere in the core.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{info, warn};

use pelagic_argos::{ArticConfig, ArticPorts, ArticSat};
use pelagic_config::CalibrationRegistry;
use pelagic_fs::{FsConfig, FsError, FsResult, Filesystem, SharedBlockDevice};
use pelagic_gnss::{GnssConfig, GnssPort, GnssReceiver};
use pelagic_log::{FsLog, LogEntry, LogKind};
use pelagic_ota::FlashFileUpdater;
use pelagic_sched::Scheduler;
use pelagic_types::bitpack::pack_bits;
use pelagic_types::{GnssEvent, GnssFix, Rtc};

/// Geometry and driver configuration for one board.
#[derive(Clone, Debug)]
pub struct SystemConfig {
    pub fs: FsConfig,
    /// First block of the reserved MCU-firmware staging region.
    pub ota_reserved_base: u32,
    pub ota_reserved_blocks: u32,
    pub argos: ArticConfig,
    pub gnss: GnssConfig,
}

/// The assembled tracker core.
pub struct System {
    pub sched: Scheduler,
    pub rtc: Rtc,
    pub fs: Rc<Filesystem>,
    pub sensor_log: Rc<RefCell<FsLog>>,
    pub system_log: Rc<RefCell<FsLog>>,
    pub calibrations: Rc<RefCell<CalibrationRegistry>>,
    pub ota: Rc<RefCell<FlashFileUpdater>>,
    pub radio: ArticSat,
    pub gnss: GnssReceiver,
    /// Session settings handed to the GNSS driver on `start_tracking`.
    pub gnss_config: GnssConfig,
    argos_mode: pelagic_types::ArgosMode,
}

impl System {
    /// Bring the core up over a block device: mount (formatting a corrupt
    /// or factory-fresh part), open the logs, and construct the drivers.
    pub fn new(
        dev: SharedBlockDevice,
        cfg: SystemConfig,
        radio_ports: Box<dyn Fn() -> ArticPorts>,
        gnss_port: Box<dyn GnssPort>,
    ) -> FsResult<Self> {
        let sched = Scheduler::new();
        let rtc = Rtc::new();

        let fs = Filesystem::new(dev.clone(), cfg.fs);
        match fs.mount() {
            Ok(()) => {}
            Err(FsError::Corrupt(reason)) => {
                warn!(reason = %reason, "mount failed; formatting");
                fs.format()?;
                fs.mount()?;
            }
            Err(e) => return Err(e),
        }

        let mut sensor_log = FsLog::sensor(&fs);
        let mut system_log = FsLog::system(&fs);
        if let Err(e) = sensor_log.create() {
            warn!(error = %e, "sensor log corrupt; recreating");
            sensor_log.truncate().map_err(log_to_fs)?;
        }
        if let Err(e) = system_log.create() {
            warn!(error = %e, "system log corrupt; recreating");
            system_log.truncate().map_err(log_to_fs)?;
        }
        let sensor_log = Rc::new(RefCell::new(sensor_log));
        let system_log = Rc::new(RefCell::new(system_log));

        let ota = Rc::new(RefCell::new(FlashFileUpdater::new(
            fs.clone(),
            dev,
            cfg.ota_reserved_base,
            cfg.ota_reserved_blocks,
        )));

        let radio = ArticSat::new(sched.clone(), fs.clone(), cfg.argos.clone(), radio_ports);
        let gnss = GnssReceiver::new(sched.clone(), fs.clone(), rtc.clone(), gnss_port);

        // Telemetry path: every dispatched fix is appended to the sensor
        // log; transmission policy stays with the application.
        {
            let log = sensor_log.clone();
            gnss.subscribe(move |event| {
                if let GnssEvent::Fix(fix) = event {
                    let entry = LogEntry::new(LogKind::Gnss, &fix_log_payload(fix))
                        .expect("fix payload fits a log record");
                    if let Err(e) = log.borrow_mut().write(&entry) {
                        warn!(error = %e, "failed to log fix");
                    }
                }
            });
        }

        info!("tracker core up");
        Ok(Self {
            sched,
            rtc,
            fs,
            sensor_log,
            system_log,
            calibrations: Rc::new(RefCell::new(CalibrationRegistry::new())),
            ota,
            radio,
            gnss,
            gnss_config: cfg.gnss,
            argos_mode: pelagic_types::ArgosMode::A3,
        })
    }

    /// Ask the GNSS driver for fixes with the configured session settings.
    pub fn start_tracking(&self) {
        self.gnss.power_on(&self.gnss_config);
    }

    /// Queue a position report for satellite uplink.
    pub fn transmit_fix(&self, fix: &GnssFix) -> pelagic_argos::ArgosResult<()> {
        let payload = encode_fix_payload(fix);
        self.radio
            .send(self.argos_mode, &payload, FIX_PAYLOAD_BITS)
    }

    /// Orderly shutdown: drivers off, calibrations saved, filesystem
    /// unmounted.
    pub fn shutdown(&self) -> FsResult<()> {
        self.gnss.power_off();
        self.radio.power_off();
        if let Err(e) = self.calibrations.borrow().save_all(false) {
            warn!(error = %e, "calibration save failed during shutdown");
        }
        self.fs.unmount()
    }
}

fn log_to_fs(e: pelagic_log::LogError) -> FsError {
    match e {
        pelagic_log::LogError::Fs(fs) => fs,
        other => FsError::Corrupt(other.to_string()),
    }
}

/// On-air position payload width: flags(4) lat(26) lon(27) spare(7).
pub const FIX_PAYLOAD_BITS: u32 = 64;

/// Pack a fix into the uplink payload. Coordinates are scaled to 1e-5
/// degrees, which keeps metre-level resolution inside 26/27 bits.
pub fn encode_fix_payload(fix: &GnssFix) -> Vec<u8> {
    let lat_q = (fix.lat * 1e5).round() as i64;
    let lon_q = (fix.lon * 1e5).round() as i64;
    let flags = (fix.fix_type & 0x3) as u32 | if fix.has_valid_datetime() { 0x4 } else { 0 };

    let mut payload = vec![0u8; (FIX_PAYLOAD_BITS as usize) / 8];
    let mut cursor = 0;
    pack_bits(flags, &mut payload, &mut cursor, 4);
    pack_bits((lat_q & 0x3FF_FFFF) as u32, &mut payload, &mut cursor, 26);
    pack_bits((lon_q & 0x7FF_FFFF) as u32, &mut payload, &mut cursor, 27);
    pack_bits(0, &mut payload, &mut cursor, 7);
    payload
}

/// Sensor-log record payload for one fix.
pub fn fix_log_payload(fix: &GnssFix) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&fix.itow.to_le_bytes());
    out.extend_from_slice(&((fix.lat * 1e7) as i32).to_le_bytes());
    out.extend_from_slice(&((fix.lon * 1e7) as i32).to_le_bytes());
    out.extend_from_slice(&fix.h_acc.to_le_bytes());
    out.extend_from_slice(&fix.year.to_le_bytes());
    out.push(fix.month);
    out.push(fix.day);
    out.push(fix.hour);
    out.push(fix.min);
    out.push(fix.sec);
    out.push(fix.num_sv);
    out
}
