//! ISP protocol constants, frame codec and payload layouts
//!
//! Every frame on the wire is
//!
//! ```text
//! [length][command][payload ...][checksum]
//! ```
//!
//! where `length` counts every byte of the frame, itself and the checksum
//! included (`payload.len() + 3`), and the checksum makes all bytes of the
//! frame sum to zero modulo 256.

use crate::error::{IspError, Result};
use crate::transport::Transport;
use std::time::{Duration, Instant};

/// Length, command and checksum bytes around the payload
pub const FRAME_OVERHEAD: usize = 3;

/// Largest payload that still fits in the one-byte length field
pub const MAX_PAYLOAD: usize = u8::MAX as usize - FRAME_OVERHEAD;

/// Byte offset of the maintenance flag in an ENQUIRY response
pub const ENQUIRY_MAINTENANCE_OFFSET: usize = 9;

/// ISP opcodes understood by the secure enclave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Enter ISP mode
    StartIsp = 0x00,
    /// Leave ISP mode
    StopIsp = 0x01,
    /// One sequenced chunk of image data
    DownloadData = 0x04,
    /// End of image data
    DownloadDone = 0x05,
    /// Declare an MRAM write region (address, size)
    BurnMram = 0x08,
    /// Reset the device
    ResetDevice = 0x09,
    /// Query enclave status
    Enquiry = 0x0F,
    /// Latch the maintenance flag
    SetMaintenance = 0x16,
    /// Data response from the enclave
    DataResponse = 0xFD,
    /// Plain acknowledge from the enclave
    Ack = 0xFE,
}

impl Command {
    /// All opcodes, in numeric order
    pub const ALL: [Command; 10] = [
        Command::StartIsp,
        Command::StopIsp,
        Command::DownloadData,
        Command::DownloadDone,
        Command::BurnMram,
        Command::ResetDevice,
        Command::Enquiry,
        Command::SetMaintenance,
        Command::DataResponse,
        Command::Ack,
    ];

    /// Look up an opcode
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| *c as u8 == value)
    }

    /// Wire name, used in logs and diagnostics
    pub fn name(self) -> &'static str {
        match self {
            Command::StartIsp => "START_ISP",
            Command::StopIsp => "STOP_ISP",
            Command::DownloadData => "DOWNLOAD_DATA",
            Command::DownloadDone => "DOWNLOAD_DONE",
            Command::BurnMram => "BURN_MRAM",
            Command::ResetDevice => "RESET_DEVICE",
            Command::Enquiry => "ENQUIRY",
            Command::SetMaintenance => "SET_MAINTENANCE",
            Command::DataResponse => "DATA_RESP",
            Command::Ack => "ACK",
        }
    }
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// One decoded frame received from the enclave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Raw command byte of the response
    pub command: u8,
    /// Payload, without the trailing checksum
    pub data: Vec<u8>,
}

/// Checksum byte that makes `bytes` plus itself sum to zero mod 256
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Build a complete frame for `command` carrying `payload`
pub fn encode(command: Command, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(IspError::FrameTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.push((payload.len() + FRAME_OVERHEAD) as u8);
    frame.push(command as u8);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    Ok(frame)
}

/// Read one frame from `transport`
///
/// Returns `Ok(None)` when nothing arrives within `timeout`, when the
/// length byte is impossibly small, or when the frame is cut short. The
/// checksum is not enforced: a mismatch is only logged.
pub fn decode<T: Transport + ?Sized>(
    transport: &mut T,
    timeout: Duration,
) -> Result<Option<Response>> {
    let deadline = Instant::now() + timeout;

    let mut len_byte = [0u8];
    if read_until(transport, &mut len_byte, deadline)? < 1 {
        return Ok(None);
    }
    let length = len_byte[0] as usize;
    if length < 2 {
        log::trace!("isp: ignoring frame with length byte {}", length);
        return Ok(None);
    }

    let mut rest = vec![0u8; length - 1];
    let got = read_until(transport, &mut rest, deadline)?;
    if got < rest.len() {
        log::debug!(
            "isp: short frame, expected {} bytes after length, got {}",
            rest.len(),
            got
        );
        return Ok(None);
    }

    let sum = rest
        .iter()
        .fold(len_byte[0], |acc, &b| acc.wrapping_add(b));
    if sum != 0 {
        log::debug!("isp: response checksum mismatch (sum 0x{:02X})", sum);
    }

    let command = rest[0];
    let data = if rest.len() > 2 {
        rest[1..rest.len() - 1].to_vec()
    } else {
        Vec::new()
    };
    Ok(Some(Response { command, data }))
}

/// Fill `buf` from the transport until full or the deadline passes
fn read_until<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let n = transport.read_timeout(&mut buf[filled..], remaining)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Number of zero bytes needed to reach the next multiple of `alignment`
pub fn padding_for(len: usize, alignment: usize) -> usize {
    (alignment - len % alignment) % alignment
}

/// Copy `data` and zero-fill it up to a multiple of `alignment`
pub fn pad_to_alignment(data: &[u8], alignment: usize) -> Vec<u8> {
    let mut padded = Vec::with_capacity(data.len() + alignment);
    padded.extend_from_slice(data);
    padded.resize(data.len() + padding_for(data.len(), alignment), 0);
    padded
}

/// Payload of BURN_MRAM: address and size, both u32 little-endian
pub fn burn_mram_payload(address: u32, size: u32) -> [u8; 8] {
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&address.to_le_bytes());
    payload[4..].copy_from_slice(&size.to_le_bytes());
    payload
}

/// Payload of DOWNLOAD_DATA: u16 little-endian sequence number, then the chunk
pub fn download_data_payload(sequence: u16, chunk: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(chunk.len() + 2);
    payload.extend_from_slice(&sequence.to_le_bytes());
    payload.extend_from_slice(chunk);
    payload
}

/// Maintenance flag from an ENQUIRY payload, if it is long enough to carry one
pub fn maintenance_flag(enquiry: &[u8]) -> Option<bool> {
    enquiry.get(ENQUIRY_MAINTENANCE_OFFSET).map(|&b| b != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Byte queue standing in for a serial port
    struct Loopback {
        rx: VecDeque<u8>,
    }

    impl Loopback {
        fn with(bytes: &[u8]) -> Self {
            Self {
                rx: bytes.iter().copied().collect(),
            }
        }
    }

    impl Transport for Loopback {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.rx.extend(data);
            Ok(())
        }

        fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let n = buf.len().min(self.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.rx.pop_front().unwrap();
            }
            Ok(n)
        }

        fn bytes_available(&mut self) -> Result<usize> {
            Ok(self.rx.len())
        }

        fn clear_input(&mut self) -> Result<()> {
            self.rx.clear();
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    const T: Duration = Duration::from_millis(100);

    #[test]
    fn test_encode_start_isp() {
        // length 3, cmd 0x00, checksum 0xFD
        assert_eq!(encode(Command::StartIsp, &[]).unwrap(), vec![0x03, 0x00, 0xFD]);
        assert_eq!(
            encode(Command::Enquiry, &[]).unwrap(),
            vec![0x03, 0x0F, 0xEE]
        );
    }

    #[test]
    fn test_frames_sum_to_zero() {
        for cmd in Command::ALL {
            for len in [0usize, 1, 7, 128, MAX_PAYLOAD] {
                let payload: Vec<u8> = (0..len).map(|i| (i * 37 + 11) as u8).collect();
                let frame = encode(cmd, &payload).unwrap();
                assert_eq!(frame.len(), len + 3);
                assert_eq!(frame[0] as usize, frame.len());
                let sum = frame.iter().fold(0u8, |a, &b| a.wrapping_add(b));
                assert_eq!(sum, 0, "{} with {} byte payload", cmd, len);
            }
        }
    }

    #[test]
    fn test_encode_too_large() {
        assert!(encode(Command::DownloadData, &[0u8; MAX_PAYLOAD]).is_ok());
        assert!(matches!(
            encode(Command::DownloadData, &[0u8; MAX_PAYLOAD + 1]),
            Err(IspError::FrameTooLarge(253))
        ));
    }

    #[test]
    fn test_decode_roundtrip() {
        for len in [0usize, 1, 2, 10, 242, MAX_PAYLOAD] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8 ^ 0x5A).collect();
            let mut link = Loopback::with(&encode(Command::Enquiry, &payload).unwrap());
            let resp = decode(&mut link, T).unwrap().unwrap();
            assert_eq!(resp.command, Command::Enquiry as u8);
            assert_eq!(resp.data, payload);
        }
    }

    #[test]
    fn test_decode_absent_and_malformed() {
        assert_eq!(decode(&mut Loopback::with(&[]), T).unwrap(), None);
        assert_eq!(decode(&mut Loopback::with(&[0x01, 0xFE]), T).unwrap(), None);
        assert_eq!(decode(&mut Loopback::with(&[0x00]), T).unwrap(), None);
        // Declares 4 bytes after the length, only 2 arrive
        assert_eq!(decode(&mut Loopback::with(&[0x05, 0xFD, 0x01]), T).unwrap(), None);
    }

    #[test]
    fn test_decode_ignores_checksum() {
        let resp = decode(&mut Loopback::with(&[0x04, 0xFD, 0x42, 0x00]), T)
            .unwrap()
            .unwrap();
        assert_eq!(resp.command, 0xFD);
        assert_eq!(resp.data, vec![0x42]);
    }

    #[test]
    fn test_padding() {
        for n in 0..64usize {
            let pad = padding_for(n, 16);
            assert_eq!(pad, (16 - n % 16) % 16);
            assert_eq!((n + pad) % 16, 0);
        }
        assert_eq!(padding_for(32, 16), 0);
        let padded = pad_to_alignment(&[0xAA; 1000], 16);
        assert_eq!(padded.len(), 1008);
        assert!(padded[1000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_payload_layouts() {
        assert_eq!(
            burn_mram_payload(0x8000_0000, 1008),
            [0x00, 0x00, 0x00, 0x80, 0xF0, 0x03, 0x00, 0x00]
        );
        assert_eq!(download_data_payload(0x0102, &[0xAA]), vec![0x02, 0x01, 0xAA]);
    }

    #[test]
    fn test_maintenance_flag() {
        let mut enquiry = [0u8; 10];
        assert_eq!(maintenance_flag(&enquiry), Some(false));
        enquiry[ENQUIRY_MAINTENANCE_OFFSET] = 1;
        assert_eq!(maintenance_flag(&enquiry), Some(true));
        assert_eq!(maintenance_flag(&enquiry[..9]), None);
    }

    #[test]
    fn test_command_lookup() {
        assert_eq!(Command::from_u8(0x16), Some(Command::SetMaintenance));
        assert_eq!(Command::from_u8(0x42), None);
        assert_eq!(Command::Ack.to_string(), "ACK");
    }
}
