//! Framed command/response link over a transport
//!
//! [`IspLink`] owns the single live connection to the enclave. It knows how
//! to acquire the port (with retries, since the USB device node can vanish
//! while the board power-cycles), how to flush stale bytes a previous session
//! left behind, and how to exchange exactly one frame pair. It never retries
//! a command; that is up to the session layer.
//!
//! The port is released by [`IspLink::close`] or when the link is dropped,
//! whichever comes first.

use crate::config::IspConfig;
use crate::error::{IspError, Result};
use crate::protocol::{self, Command, Response};
use crate::transport::{Opener, Transport};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// Connection to the enclave's SE-UART
pub struct IspLink<O: Opener> {
    opener: O,
    port: String,
    config: IspConfig,
    transport: Option<O::Transport>,
}

impl<O: Opener> IspLink<O> {
    /// Open `port` with the first-connect retry budget and drain stale input
    pub fn open(opener: O, port: &str, config: &IspConfig) -> Result<Self> {
        let mut link = Self {
            opener,
            port: port.to_string(),
            config: config.clone(),
            transport: None,
        };
        link.connect(config.open_retries, config.open_backoff)?;
        Ok(link)
    }

    /// Port identifier this link talks to
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Whether the port is currently held
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Release the port and acquire it again with the given budget
    pub fn reopen(&mut self, retries: u32, backoff: Duration) -> Result<()> {
        self.close();
        self.connect(retries, backoff)
    }

    /// Release the port; does nothing if it is already released
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            log::debug!("isp: closed {}", self.port);
        }
    }

    fn connect(&mut self, retries: u32, backoff: Duration) -> Result<()> {
        let attempts = retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.opener.open(&self.port, self.config.baud_rate) {
                Ok(transport) => {
                    self.transport = Some(transport);
                    log::info!(
                        "Connected to {} at {} baud",
                        self.port,
                        self.config.baud_rate
                    );
                    self.drain()?;
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        log::warn!(
                            "Port {} not ready, retrying in {:.1}s... ({})",
                            self.port,
                            backoff.as_secs_f32(),
                            e
                        );
                        sleep(backoff);
                    }
                }
            }
        }

        Err(IspError::PortUnavailable {
            port: self.port.clone(),
            attempts,
            reason: last_error,
        })
    }

    fn transport(&mut self) -> Result<&mut O::Transport> {
        let port = &self.port;
        self.transport.as_mut().ok_or_else(|| IspError::PortUnavailable {
            port: port.clone(),
            attempts: 0,
            reason: "port is closed".into(),
        })
    }

    /// Read and discard whatever the enclave has already sent
    ///
    /// Stops after `drain_limit` even if input keeps arriving.
    pub fn drain(&mut self) -> Result<usize> {
        let settle = self.config.drain_settle;
        let pause = self.config.drain_pause;
        let limit = self.config.drain_limit;
        let port = self.port.clone();
        let transport = self.transport()?;

        sleep(settle);
        let deadline = Instant::now() + limit;
        let mut discarded = 0;
        let mut scratch = [0u8; 256];
        loop {
            if Instant::now() >= deadline {
                log::warn!(
                    "{} still sending after {:.1}s, discarded {} byte(s); continuing",
                    port,
                    limit.as_secs_f32(),
                    discarded
                );
                break;
            }
            let pending = transport.bytes_available()?;
            if pending == 0 {
                break;
            }
            let want = pending.min(scratch.len());
            let n = transport.read_timeout(&mut scratch[..want], pause)?;
            if n == 0 {
                break;
            }
            discarded += n;
            sleep(pause);
        }

        if discarded > 0 {
            log::debug!("isp: drained {} stale byte(s)", discarded);
        }
        Ok(discarded)
    }

    /// Write one frame without waiting for an answer
    pub fn send_only(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        let frame = protocol::encode(command, payload)?;
        let transport = self.transport()?;
        transport.write(&frame)?;
        transport.flush()?;
        log::trace!("isp: -> {} ({} byte payload)", command, payload.len());
        Ok(())
    }

    /// Send one frame and read one response frame
    ///
    /// Pending input is discarded first so that only a reply to this frame
    /// can be read back. Returns `Ok(None)` if nothing usable arrived within
    /// `timeout`.
    pub fn send_and_receive(
        &mut self,
        command: Command,
        payload: &[u8],
        settle: Duration,
        timeout: Duration,
    ) -> Result<Option<Response>> {
        let frame = protocol::encode(command, payload)?;
        let transport = self.transport()?;

        transport.clear_input()?;
        transport.write(&frame)?;
        transport.flush()?;
        sleep(settle);

        let response = protocol::decode(transport, timeout)?;
        match &response {
            Some(r) => log::trace!(
                "isp: {} -> 0x{:02X} ({} data bytes)",
                command,
                r.command,
                r.data.len()
            ),
            None => log::trace!("isp: {} -> no response", command),
        }
        Ok(response)
    }

    /// Shared configuration
    pub fn config(&self) -> &IspConfig {
        &self.config
    }
}

impl<O: Opener> Drop for IspLink<O> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Port that always has more input, like firmware printing a log
    struct Chatty {
        read: usize,
    }

    impl Transport for Chatty {
        fn write(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            buf.fill(b'.');
            self.read += buf.len();
            Ok(buf.len())
        }

        fn bytes_available(&mut self) -> Result<usize> {
            Ok(64)
        }

        fn clear_input(&mut self) -> Result<()> {
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct ChattyOpener;

    impl Opener for ChattyOpener {
        type Transport = Chatty;

        fn open(&mut self, _port: &str, _baud: u32) -> Result<Chatty> {
            Ok(Chatty { read: 0 })
        }
    }

    fn quick_config() -> IspConfig {
        IspConfig {
            drain_settle: Duration::ZERO,
            drain_pause: Duration::ZERO,
            drain_limit: Duration::from_millis(50),
            ..IspConfig::default()
        }
    }

    #[test]
    fn test_drain_stops_on_endless_input() {
        let start = Instant::now();
        let mut link = IspLink::open(ChattyOpener, "chatty", &quick_config()).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(link.transport.as_ref().unwrap().read > 0);

        let start = Instant::now();
        assert!(link.drain().unwrap() > 0);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(link.port(), "chatty");
    }
}
