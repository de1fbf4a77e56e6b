//! Byte-stream transport underneath the ISP link
//!
//! The [`Transport`] trait is the duplex byte stream a link runs over; an
//! [`Opener`] acquires one by port identifier. Acquisition is separate from
//! the stream itself because the maintenance sequence has to drop the port
//! while the enclave reboots and acquire it again afterwards.

use crate::error::Result;
use std::time::Duration;

/// Transport trait for reading and writing bytes
pub trait Transport {
    /// Write all bytes to the transport
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read with timeout
    ///
    /// Reads up to `buf.len()` bytes, waiting at most `timeout`.
    /// Returns the number of bytes read, or 0 on timeout.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Number of bytes that can be read without blocking
    fn bytes_available(&mut self) -> Result<usize>;

    /// Discard everything in the input buffer
    fn clear_input(&mut self) -> Result<()>;

    /// Flush any buffered output
    fn flush(&mut self) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read_timeout(buf, timeout)
    }

    fn bytes_available(&mut self) -> Result<usize> {
        (**self).bytes_available()
    }

    fn clear_input(&mut self) -> Result<()> {
        (**self).clear_input()
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Acquires transports by port identifier
pub trait Opener {
    /// Transport produced by this opener
    type Transport: Transport;

    /// Open `port` at `baud`; dropping the result releases the port
    fn open(&mut self, port: &str, baud: u32) -> Result<Self::Transport>;
}

impl<O: Opener + ?Sized> Opener for &mut O {
    type Transport = O::Transport;

    fn open(&mut self, port: &str, baud: u32) -> Result<Self::Transport> {
        (**self).open(port, baud)
    }
}

pub mod serial {
    //! Serial port transport implementation

    use super::*;
    use crate::error::IspError;
    use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
    use std::io::{Read, Write};

    /// Serial port transport
    pub struct SerialTransport {
        port: Box<dyn SerialPort>,
    }

    impl SerialTransport {
        /// Open a serial port at the given baud rate, 8N1, no flow control
        pub fn open(device: &str, baud: u32) -> Result<Self> {
            let port = serialport::new(device, baud)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_secs(2))
                .open()?;

            log::debug!("Opened serial port {} at {} baud", device, baud);

            Ok(Self { port })
        }
    }

    impl Transport for SerialTransport {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.port.write_all(data)?;
            Ok(())
        }

        fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
            self.port.set_timeout(timeout)?;

            match self.port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(IspError::from(e)),
            }
        }

        fn bytes_available(&mut self) -> Result<usize> {
            Ok(self.port.bytes_to_read()? as usize)
        }

        fn clear_input(&mut self) -> Result<()> {
            self.port.clear(ClearBuffer::Input)?;
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            self.port.flush()?;
            Ok(())
        }
    }

    /// Opens real serial ports
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SerialOpener;

    impl Opener for SerialOpener {
        type Transport = SerialTransport;

        fn open(&mut self, port: &str, baud: u32) -> Result<SerialTransport> {
            SerialTransport::open(port, baud)
        }
    }
}
