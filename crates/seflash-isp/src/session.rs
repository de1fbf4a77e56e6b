//! ISP command session
//!
//! Issues individual commands over an [`IspLink`] and classifies what came
//! back. Only START_ISP has built-in retries; everything else goes out once
//! and callers decide whether to try again.

use crate::config::IspConfig;
use crate::error::{IspError, Result};
use crate::link::IspLink;
use crate::protocol::{self, Command, Response};
use crate::transport::Opener;
use std::thread::sleep;

/// How the enclave answered a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// ACK
    Ack,
    /// DATA_RESP carrying a payload
    Data,
    /// Any other response code
    Unknown(u8),
    /// Nothing (or a truncated frame) within the timeout
    Timeout,
}

impl ReplyStatus {
    pub(crate) fn from_response(response: Option<&Response>) -> Self {
        match response.map(|r| r.command) {
            None => ReplyStatus::Timeout,
            Some(code) if code == Command::Ack as u8 => ReplyStatus::Ack,
            Some(code) if code == Command::DataResponse as u8 => ReplyStatus::Data,
            Some(code) => ReplyStatus::Unknown(code),
        }
    }
}

/// Classified response to one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: ReplyStatus,
    pub data: Vec<u8>,
}

impl Reply {
    /// ACK and DATA_RESP count as accepted; anything else is a refusal
    pub fn accepted(&self) -> bool {
        matches!(self.status, ReplyStatus::Ack | ReplyStatus::Data)
    }

    /// Turn a refusal into the matching error
    pub fn into_result(self, command: Command) -> Result<Reply> {
        match self.status {
            ReplyStatus::Ack | ReplyStatus::Data => Ok(self),
            ReplyStatus::Timeout => Err(IspError::Timeout {
                command: command.name(),
            }),
            ReplyStatus::Unknown(response) => Err(IspError::Rejected {
                command: command.name(),
                response,
            }),
        }
    }
}

impl core::fmt::Display for Reply {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.status {
            ReplyStatus::Ack => write!(f, "ACK"),
            ReplyStatus::Data => write!(f, "DATA ({} bytes)", self.data.len()),
            ReplyStatus::Unknown(code) => write!(f, "0x{:02X}", code),
            ReplyStatus::Timeout => write!(f, "no response"),
        }
    }
}

/// Decoded ENQUIRY response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnquiryInfo {
    /// Raw response payload
    pub raw: Vec<u8>,
    /// Maintenance flag, if the payload was long enough to carry it
    pub maintenance: Option<bool>,
}

/// Command session on top of an open link
pub struct IspSession<O: Opener> {
    link: IspLink<O>,
}

impl<O: Opener> IspSession<O> {
    /// Wrap an already open link
    pub fn new(link: IspLink<O>) -> Self {
        Self { link }
    }

    /// Open `port` and wrap it in a session
    pub fn open(opener: O, port: &str, config: &IspConfig) -> Result<Self> {
        Ok(Self::new(IspLink::open(opener, port, config)?))
    }

    /// Underlying link
    pub fn link(&mut self) -> &mut IspLink<O> {
        &mut self.link
    }

    /// Shared configuration
    pub fn config(&self) -> &IspConfig {
        self.link.config()
    }

    /// Issue one command and classify the response
    pub fn issue(&mut self, command: Command, payload: &[u8]) -> Result<Reply> {
        let settle = self.config().command_settle;
        let timeout = self.config().command_timeout;
        let response = self
            .link
            .send_and_receive(command, payload, settle, timeout)?;

        let status = ReplyStatus::from_response(response.as_ref());
        let reply = Reply {
            status,
            data: response.map(|r| r.data).unwrap_or_default(),
        };
        log::debug!("  {}: {}", command, reply);
        Ok(reply)
    }

    /// Issue a command up to `attempts` times until it is accepted
    ///
    /// Returns the last reply, accepted or not.
    pub fn issue_with_retries(
        &mut self,
        command: Command,
        payload: &[u8],
        attempts: u32,
    ) -> Result<Reply> {
        let attempts = attempts.max(1);
        let mut reply = self.issue(command, payload)?;
        for attempt in 2..=attempts {
            if reply.accepted() {
                break;
            }
            log::debug!("  {}: retry {}/{}", command, attempt, attempts);
            reply = self.issue(command, payload)?;
        }
        Ok(reply)
    }

    /// Enter ISP mode
    ///
    /// The first START_ISP after power-up often reads back a frame left over
    /// from before, so the input is drained before every attempt.
    pub fn start_isp(&mut self) -> Result<Reply> {
        let attempts = self.config().start_isp_attempts.max(1);
        let pause = self.config().start_isp_pause;

        let mut last = Reply {
            status: ReplyStatus::Timeout,
            data: Vec::new(),
        };
        for attempt in 1..=attempts {
            self.link.drain()?;
            last = self.issue(Command::StartIsp, &[])?;
            if last.accepted() {
                if attempt > 1 {
                    log::info!("  START_ISP: ACK (attempt {})", attempt);
                }
                return Ok(last);
            }
            if attempt < attempts {
                sleep(pause);
            }
        }

        log::debug!("  START_ISP: {} after {} attempt(s)", last, attempts);
        Ok(last)
    }

    /// Leave ISP mode
    pub fn stop_isp(&mut self) -> Result<Reply> {
        self.issue(Command::StopIsp, &[])
    }

    /// Latch the maintenance flag
    pub fn set_maintenance(&mut self) -> Result<Reply> {
        self.issue(Command::SetMaintenance, &[])
    }

    /// Query enclave status; `None` if the enquiry was not accepted
    pub fn enquiry(&mut self) -> Result<Option<EnquiryInfo>> {
        let reply = self.issue(Command::Enquiry, &[])?;
        if !reply.accepted() {
            return Ok(None);
        }
        Ok(Some(EnquiryInfo {
            maintenance: protocol::maintenance_flag(&reply.data),
            raw: reply.data,
        }))
    }

    /// Send RESET_DEVICE without waiting for an answer
    pub fn reset(&mut self) -> Result<()> {
        self.link.send_only(Command::ResetDevice, &[])
    }

    /// Release the port
    pub fn close(&mut self) {
        self.link.close();
    }
}
