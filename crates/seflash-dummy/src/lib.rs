//! seflash-dummy - In-memory secure enclave emulator for testing
//!
//! This crate provides a dummy enclave that speaks the ISP protocol over the
//! [`Transport`] trait. It keeps an MRAM image map and the maintenance flag
//! across simulated resets, and can be told to misbehave the way real boards
//! do (ignoring START_ISP, refusing a chunk, the port vanishing while the
//! board reboots). It's useful for testing and development without real
//! hardware.

use seflash_isp::error::{IspError, Result};
use seflash_isp::protocol::{self, Command};
use seflash_isp::transport::{Opener, Transport};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

/// Response code the emulator uses to refuse a command
pub const REFUSED: u8 = 0xEE;

/// Length of the ENQUIRY response payload
pub const ENQUIRY_LEN: usize = 16;

/// Fault injection knobs
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Ignore this many START_ISP frames (`usize::MAX` ignores all of them)
    pub silent_start_isp: usize,
    /// Ignore this many START_ISP frames after each reset
    pub silent_start_isp_after_reset: usize,
    /// Refuse BURN_MRAM
    pub reject_burn: bool,
    /// Refuse the DOWNLOAD_DATA chunk with this sequence number
    pub reject_chunk: Option<u16>,
    /// Commit the last chunk of an image without acknowledging it
    pub silent_final_chunk: bool,
    /// SET_MAINTENANCE is acknowledged but does not latch
    pub flag_does_not_latch: bool,
    /// ENQUIRY answers with a payload too short to carry the flag
    pub short_enquiry: bool,
    /// Fail this many opens from now on
    pub unavailable_opens: usize,
    /// Fail this many opens after each reset
    pub unavailable_after_reset: usize,
    /// Bytes waiting in the input buffer when the port is first opened
    pub stale_bytes: Vec<u8>,
    /// A START_ISP that goes unanswered is refused late: the refusal only
    /// shows up once the host polls or clears its input after giving up
    pub late_refusal: bool,
}

/// Configuration for the dummy enclave
#[derive(Debug, Clone)]
pub struct EnclaveConfig {
    /// Maintenance flag at power-up
    pub maintenance: bool,
    /// Refuse BURN_MRAM unless booted in maintenance mode
    pub require_maintenance: bool,
    /// Misbehaviour to emulate
    pub faults: Faults,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            maintenance: false,
            require_maintenance: true,
            faults: Faults::default(),
        }
    }
}

/// Region opened by BURN_MRAM and filled by DOWNLOAD_DATA
#[derive(Debug)]
struct BurnRegion {
    address: u32,
    size: usize,
    next_sequence: u16,
    buffer: Vec<u8>,
}

#[derive(Debug)]
struct EnclaveState {
    config: EnclaveConfig,
    /// Flag the enclave booted with
    maintenance: bool,
    /// Flag requested by SET_MAINTENANCE, applied at reset
    maintenance_pending: bool,
    isp_active: bool,
    burn: Option<BurnRegion>,
    mram: BTreeMap<u32, Vec<u8>>,
    /// Host -> enclave bytes not yet parsed into a frame
    inbox: Vec<u8>,
    /// Enclave -> host bytes
    outbox: VecDeque<u8>,
    /// Enclave -> host bytes that arrive on the next port access
    late: Vec<u8>,
    /// Generation of the current connection; bumped on reset
    generation: u64,
    connected: bool,
    stale_delivered: bool,
    /// Every frame executed, as (opcode, payload)
    received: Vec<(u8, Vec<u8>)>,
    chunks: Vec<u16>,
    opens: usize,
    closes: usize,
    resets: usize,
}

impl EnclaveState {
    fn new(config: EnclaveConfig) -> Self {
        Self {
            maintenance: config.maintenance,
            config,
            maintenance_pending: false,
            isp_active: false,
            burn: None,
            mram: BTreeMap::new(),
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            late: Vec::new(),
            generation: 0,
            connected: false,
            stale_delivered: false,
            received: Vec::new(),
            chunks: Vec::new(),
            opens: 0,
            closes: 0,
            resets: 0,
        }
    }

    fn reply(&mut self, command: Command, data: &[u8]) {
        if let Ok(frame) = protocol::encode(command, data) {
            self.outbox.extend(frame);
        }
    }

    fn refuse(&mut self) {
        self.outbox.extend(refusal_frame());
    }

    /// Deliver bytes held back by `late_refusal`
    fn release_late(&mut self) {
        let late = std::mem::take(&mut self.late);
        self.outbox.extend(late);
    }

    /// Parse and execute every complete frame in the inbox
    fn process(&mut self) {
        loop {
            let Some(&length) = self.inbox.first() else {
                return;
            };
            // The length byte counts the whole frame
            let total = length as usize;
            if total < protocol::FRAME_OVERHEAD {
                log::debug!("dummy: dropping malformed length byte {}", length);
                self.inbox.remove(0);
                continue;
            }
            if self.inbox.len() < total {
                return;
            }
            let frame: Vec<u8> = self.inbox.drain(..total).collect();
            if frame.iter().fold(0u8, |a, &b| a.wrapping_add(b)) != 0 {
                log::debug!("dummy: dropping frame with bad checksum");
                continue;
            }
            let payload = frame[2..frame.len() - 1].to_vec();
            self.execute(frame[1], &payload);
        }
    }

    fn execute(&mut self, opcode: u8, payload: &[u8]) {
        self.received.push((opcode, payload.to_vec()));
        let Some(command) = Command::from_u8(opcode) else {
            log::debug!("dummy: unknown opcode 0x{:02X}", opcode);
            self.refuse();
            return;
        };
        log::debug!("dummy: <- {}", command);

        if command == Command::StartIsp {
            if self.config.faults.silent_start_isp > 0 {
                if self.config.faults.silent_start_isp != usize::MAX {
                    self.config.faults.silent_start_isp -= 1;
                }
                if self.config.faults.late_refusal {
                    self.late.extend(refusal_frame());
                }
                return;
            }
            self.isp_active = true;
            self.reply(Command::Ack, &[]);
            return;
        }

        // The reset is honoured outside ISP mode too
        if command == Command::ResetDevice {
            self.reset();
            return;
        }

        // Application firmware ignores ISP traffic
        if !self.isp_active {
            return;
        }

        match command {
            Command::StopIsp => {
                self.isp_active = false;
                self.reply(Command::Ack, &[]);
            }
            Command::SetMaintenance => {
                if !self.config.faults.flag_does_not_latch {
                    self.maintenance_pending = true;
                }
                self.reply(Command::Ack, &[]);
            }
            Command::Enquiry => {
                let len = if self.config.faults.short_enquiry {
                    4
                } else {
                    ENQUIRY_LEN
                };
                let mut data = vec![0u8; len];
                if let Some(flag) = data.get_mut(protocol::ENQUIRY_MAINTENANCE_OFFSET) {
                    *flag = self.maintenance as u8;
                }
                self.reply(Command::DataResponse, &data);
            }
            Command::BurnMram => self.burn_mram(payload),
            Command::DownloadData => self.download_data(payload),
            Command::DownloadDone => match self.burn.take() {
                Some(region) => {
                    log::debug!(
                        "dummy: committed {} bytes at 0x{:08X}",
                        region.buffer.len(),
                        region.address
                    );
                    self.mram.insert(region.address, region.buffer);
                    self.reply(Command::Ack, &[]);
                }
                None => self.refuse(),
            },
            Command::Ack | Command::DataResponse => self.refuse(),
            Command::StartIsp | Command::ResetDevice => {}
        }
    }

    fn burn_mram(&mut self, payload: &[u8]) {
        if payload.len() != 8
            || self.config.faults.reject_burn
            || (self.config.require_maintenance && !self.maintenance)
        {
            self.refuse();
            return;
        }
        let address = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let size = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;
        if size % 16 != 0 {
            self.refuse();
            return;
        }
        self.burn = Some(BurnRegion {
            address,
            size,
            next_sequence: 0,
            buffer: Vec::with_capacity(size),
        });
        self.reply(Command::Ack, &[]);
    }

    fn download_data(&mut self, payload: &[u8]) {
        if payload.len() < 2 {
            self.refuse();
            return;
        }
        let sequence = u16::from_le_bytes([payload[0], payload[1]]);
        self.chunks.push(sequence);

        let reject = self.config.faults.reject_chunk == Some(sequence);
        let silent_final = self.config.faults.silent_final_chunk;
        let Some(region) = self.burn.as_mut() else {
            self.refuse();
            return;
        };
        if reject || sequence != region.next_sequence {
            self.refuse();
            return;
        }
        if region.buffer.len() + payload.len() - 2 > region.size {
            self.refuse();
            return;
        }

        region.buffer.extend_from_slice(&payload[2..]);
        region.next_sequence = region.next_sequence.wrapping_add(1);
        let complete = region.buffer.len() == region.size;
        if !(complete && silent_final) {
            self.reply(Command::Ack, &[]);
        }
    }

    fn reset(&mut self) {
        log::debug!("dummy: reset");
        self.resets += 1;
        if self.maintenance_pending {
            self.maintenance = true;
            self.maintenance_pending = false;
        }
        self.isp_active = false;
        self.burn = None;
        self.inbox.clear();
        self.outbox.clear();
        self.late.clear();
        self.connected = false;
        self.generation += 1;
        self.config.faults.unavailable_opens = self.config.faults.unavailable_after_reset;
        self.config.faults.silent_start_isp = self.config.faults.silent_start_isp_after_reset;
    }
}

/// Empty frame the emulator answers refused commands with
fn refusal_frame() -> Vec<u8> {
    // REFUSED is not an opcode, so build the frame by hand
    let mut frame = vec![protocol::FRAME_OVERHEAD as u8, REFUSED];
    frame.push(protocol::checksum(&frame));
    frame
}

/// Dummy enclave
///
/// Cloning gives another handle to the same emulated device, so a test can
/// hand one clone to the code under test and inspect the device through the
/// other.
#[derive(Debug, Clone)]
pub struct DummyEnclave {
    state: Rc<RefCell<EnclaveState>>,
}

impl DummyEnclave {
    /// Create a new dummy enclave with the given configuration
    pub fn new(config: EnclaveConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(EnclaveState::new(config))),
        }
    }

    /// Create a new dummy enclave with default configuration
    pub fn new_default() -> Self {
        Self::new(EnclaveConfig::default())
    }

    /// Create a dummy enclave that already booted in maintenance mode
    pub fn in_maintenance() -> Self {
        Self::new(EnclaveConfig {
            maintenance: true,
            ..EnclaveConfig::default()
        })
    }

    /// Current maintenance flag
    pub fn maintenance(&self) -> bool {
        self.state.borrow().maintenance
    }

    /// Image committed at `address`
    pub fn mram(&self, address: u32) -> Option<Vec<u8>> {
        self.state.borrow().mram.get(&address).cloned()
    }

    /// Opcodes received so far, in order
    pub fn commands(&self) -> Vec<u8> {
        self.state
            .borrow()
            .received
            .iter()
            .map(|(opcode, _)| *opcode)
            .collect()
    }

    /// Payloads of every `command` frame received, in order
    pub fn payloads(&self, command: Command) -> Vec<Vec<u8>> {
        self.state
            .borrow()
            .received
            .iter()
            .filter(|(opcode, _)| *opcode == command as u8)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// How many times `command` was received
    pub fn count(&self, command: Command) -> usize {
        self.payloads(command).len()
    }

    /// Sequence numbers of every DOWNLOAD_DATA received
    pub fn chunk_sequences(&self) -> Vec<u16> {
        self.state.borrow().chunks.clone()
    }

    /// Successful port opens
    pub fn opens(&self) -> usize {
        self.state.borrow().opens
    }

    /// Port releases
    pub fn closes(&self) -> usize {
        self.state.borrow().closes
    }

    /// RESET_DEVICE frames executed
    pub fn resets(&self) -> usize {
        self.state.borrow().resets
    }

    /// Bytes waiting to be read by the host, late ones included
    pub fn pending_output(&self) -> usize {
        let state = self.state.borrow();
        state.outbox.len() + state.late.len()
    }
}

impl Opener for DummyEnclave {
    type Transport = DummyPort;

    fn open(&mut self, port: &str, baud: u32) -> Result<DummyPort> {
        let mut state = self.state.borrow_mut();
        if state.config.faults.unavailable_opens > 0 {
            state.config.faults.unavailable_opens -= 1;
            return Err(IspError::Io(format!("{}: No such device", port)));
        }

        state.opens += 1;
        state.connected = true;
        if !state.stale_delivered {
            state.stale_delivered = true;
            let stale = state.config.faults.stale_bytes.clone();
            state.outbox.extend(stale);
        }
        log::debug!("dummy: opened {} at {} baud", port, baud);

        Ok(DummyPort {
            state: Rc::clone(&self.state),
            generation: state.generation,
        })
    }
}

/// Connection to a [`DummyEnclave`]
pub struct DummyPort {
    state: Rc<RefCell<EnclaveState>>,
    generation: u64,
}

impl DummyPort {
    fn check(&self, state: &EnclaveState) -> Result<()> {
        if state.generation != self.generation || !state.connected {
            return Err(IspError::Io("device disconnected".into()));
        }
        Ok(())
    }
}

impl Transport for DummyPort {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        self.check(&state)?;
        state.inbox.extend_from_slice(data);
        state.process();
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.state.borrow_mut();
        self.check(&state)?;
        let n = buf.len().min(state.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn bytes_available(&mut self) -> Result<usize> {
        let mut state = self.state.borrow_mut();
        self.check(&state)?;
        state.release_late();
        Ok(state.outbox.len())
    }

    fn clear_input(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        self.check(&state)?;
        state.release_late();
        state.outbox.clear();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Drop for DummyPort {
    fn drop(&mut self) {
        self.state.borrow_mut().closes += 1;
    }
}
