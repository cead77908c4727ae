//! Simulated transceiver for driver tests: decodes the SPI protocol the
//! driver speaks (single-byte commands, DSP register access, burst
//! transfers) against an in-memory register file.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{ArgosError, ArgosResult};
use crate::port::{ArticPort, ArticPorts, PaDriver};
use crate::registers::*;

pub struct MockDsp {
    pub status: u32,
    pub boot_response: u32,
    pub commands: Vec<u8>,
    pub dsp_config_count: u32,
    pub fail_spi: bool,
    pub power: bool,
    pub reset: bool,
    pub pa_settings: Vec<u32>,
    /// Word store keyed by (mem_sel, word address); values are wire-order
    /// bytes.
    pub mem: HashMap<(u32, u32), Vec<u8>>,
    burst: Option<(u32, bool, u32)>,
}

impl MockDsp {
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            status: 0,
            boot_response: DSP_STATUS_BOOT_READY,
            commands: Vec::new(),
            dsp_config_count: 0,
            fail_spi: false,
            power: false,
            reset: false,
            pa_settings: Vec::new(),
            mem: HashMap::new(),
            burst: None,
        }))
    }

    pub fn set_status_bit(&mut self, bit: u32) {
        self.status |= 1 << bit;
    }

    /// Stage the three post-upload CRC words (PMEM, XMEM, YMEM order) the
    /// driver reads back after DSP configuration.
    pub fn set_crc_results(&mut self, pmem: u32, xmem: u32, ymem: u32) {
        for (i, value) in [pmem, xmem, ymem].into_iter().enumerate() {
            self.mem.insert(
                (MemId::Xmem.mem_sel(), CRC_RESULTS_ADDRESS + i as u32),
                wire3(value),
            );
        }
    }

    /// Load raw bytes into consecutive XMEM words.
    pub fn load_xmem(&mut self, start: u32, bytes: &[u8]) {
        for (i, chunk) in bytes.chunks(XMEM_WORD).enumerate() {
            let mut word = chunk.to_vec();
            word.resize(XMEM_WORD, 0);
            self.mem
                .insert((MemId::Xmem.mem_sel(), start + i as u32), word);
        }
    }

    /// Read back `words` consecutive XMEM words as a flat byte string.
    pub fn xmem_bytes(&self, start: u32, words: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(words * XMEM_WORD);
        for i in 0..words {
            match self.mem.get(&(MemId::Xmem.mem_sel(), start + i as u32)) {
                Some(word) => out.extend_from_slice(word),
                None => out.extend_from_slice(&[0; XMEM_WORD]),
            }
        }
        out
    }

    /// Current RX packet-filter LUT entry count.
    pub fn filter_count(&self) -> u32 {
        self.mem
            .get(&(MemId::Xmem.mem_sel(), RX_FILTERING_CONFIG + 3))
            .map(|w| crate::firmware::wire_to_word(w))
            .unwrap_or(0)
    }

    fn handle_command(&mut self, command: u8) {
        self.commands.push(command);
        match command {
            CMD_CLEAR_INT1 => {
                self.status &= !((1 << STATUS_RX_VALID_MESSAGE)
                    | (1 << STATUS_TX_FINISHED)
                    | (1 << STATUS_MCU_COMMAND_ACCEPTED)
                    | (1 << STATUS_CRC_CALCULATED)
                    | (1 << STATUS_IDLE_STATE));
            }
            CMD_GO_TO_IDLE => {
                self.status |= (1 << STATUS_IDLE) | (1 << STATUS_IDLE_STATE);
            }
            CMD_SET_PTT_A2_TX_MODE
            | CMD_SET_PTT_A3_TX_MODE
            | CMD_SET_ARGOS_3_RX_MODE
            | CMD_SET_ARGOS_4_RX_MODE => {
                self.status |= 1 << STATUS_MCU_COMMAND_ACCEPTED;
            }
            CMD_TRANSMIT_ONE_PACKAGE_AND_GO_IDLE => {
                self.status |= 1 << STATUS_TX_FINISHED;
            }
            CMD_START_CONTINUOUS_RECEPTION => {
                self.status |= 1 << STATUS_RX_IN_PROGRESS;
            }
            _ => {}
        }
    }
}

fn wire3(value: u32) -> Vec<u8> {
    vec![(value >> 16) as u8, (value >> 8) as u8, value as u8]
}

pub struct MockPort(pub Rc<RefCell<MockDsp>>);

impl ArticPort for MockPort {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> ArgosResult<()> {
        let mut dsp = self.0.borrow_mut();
        if dsp.fail_spi {
            return Err(ArgosError::Spi("mock SPI failure".into()));
        }
        if tx.len() == 1 {
            dsp.handle_command(tx[0]);
        } else if tx.len() == 4 {
            if tx[0] == read_address(ADDRESS_DSP) {
                let value = dsp.boot_response;
                rx[1] = (value >> 16) as u8;
                rx[2] = (value >> 8) as u8;
                rx[3] = value as u8;
            } else if tx[0] == write_address(BURST_ADDRESS) {
                let reg =
                    ((tx[1] as u32) << 16) | ((tx[2] as u32) << 8) | tx[3] as u32;
                dsp.burst = Some((
                    (reg & MEM_SEL_MASK) >> MEM_SEL_SHIFT,
                    reg & BURST_READ != 0,
                    reg & BURST_START_ADDRESS_MASK,
                ));
            } else if tx[0] == write_address(ADDRESS_DSP) {
                // DSP config: the uploaded firmware "boots".
                dsp.dsp_config_count += 1;
                dsp.status |= (1 << STATUS_IDLE) | (1 << STATUS_RX_CALIBRATION_FINISHED);
            }
        }
        Ok(())
    }

    fn transfer_continuous(&mut self, tx: &[u8], rx: &mut [u8]) -> ArgosResult<()> {
        let mut dsp = self.0.borrow_mut();
        if dsp.fail_spi {
            return Err(ArgosError::Spi("mock SPI failure".into()));
        }
        let Some((mem_sel, read, addr)) = dsp.burst else {
            return Err(ArgosError::Spi("burst transfer without configuration".into()));
        };
        if read {
            if mem_sel == MemId::Iomem.mem_sel() && addr == INTERRUPT_ADDRESS {
                let status = dsp.status;
                rx.copy_from_slice(&wire3(status)[..rx.len()]);
            } else if let Some(word) = dsp.mem.get(&(mem_sel, addr)) {
                let n = rx.len().min(word.len());
                rx[..n].copy_from_slice(&word[..n]);
            } else {
                rx.fill(0);
            }
        } else {
            dsp.mem.insert((mem_sel, addr), tx.to_vec());
        }
        dsp.burst = Some((mem_sel, read, addr + 1));
        Ok(())
    }

    fn finish_transfer(&mut self) {
        self.0.borrow_mut().burst = None;
    }

    fn set_power_enable(&mut self, on: bool) {
        self.0.borrow_mut().power = on;
    }

    fn set_reset(&mut self, on: bool) {
        self.0.borrow_mut().reset = on;
    }
}

pub struct MockPa(pub Rc<RefCell<MockDsp>>);

impl PaDriver for MockPa {
    fn set_output_power(&mut self, milliwatts: u32) {
        self.0.borrow_mut().pa_settings.push(milliwatts);
    }
}

/// Bundle a mock SPI port and PA sharing one simulated device.
pub fn mock_ports(dsp: &Rc<RefCell<MockDsp>>) -> ArticPorts {
    ArticPorts {
        spi: Box::new(MockPort(dsp.clone())),
        pa: Box::new(MockPa(dsp.clone())),
    }
}
