//! Error types for ISP operations

use thiserror::Error;

/// ISP protocol errors
#[derive(Debug, Error)]
pub enum IspError {
    /// The serial port could not be acquired, even after retrying
    #[error("Port {port} unavailable after {attempts} attempt(s): {reason}")]
    PortUnavailable {
        port: String,
        attempts: u32,
        reason: String,
    },

    /// No response (or a truncated one) arrived within the timeout
    #[error("No response to {command} within timeout")]
    Timeout { command: &'static str },

    /// The enclave answered, but not with ACK or DATA
    #[error("{command} rejected with response 0x{response:02X}")]
    Rejected {
        command: &'static str,
        response: u8,
    },

    /// Payload does not fit into a one-byte length field
    #[error("Payload of {0} bytes does not fit in one frame (max {max})", max = crate::protocol::MAX_PAYLOAD)]
    FrameTooLarge(usize),

    /// START_ISP was never acknowledged
    #[error("Secure enclave did not respond to START_ISP")]
    NotResponsive,

    /// A data chunk in the middle of an image was not acknowledged
    #[error("Chunk {index}/{total} of {image} not acknowledged ({})", response_label(*.response))]
    ChunkRejected {
        image: String,
        index: usize,
        total: usize,
        response: Option<u8>,
    },

    /// Image needs more chunks than the 16-bit sequence number can count
    #[error("Image {image} is too large ({size} bytes)")]
    ImageTooLarge { image: String, size: usize },

    /// Nothing to flash
    #[error("No images to flash")]
    NoImages,

    /// Configuration file could not be parsed
    #[error("Invalid ISP configuration: {0}")]
    Config(String),

    /// I/O error during communication
    #[error("I/O error: {0}")]
    Io(String),

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// Result type for ISP operations
pub type Result<T> = core::result::Result<T, IspError>;

impl From<std::io::Error> for IspError {
    fn from(e: std::io::Error) -> Self {
        IspError::Io(e.to_string())
    }
}

fn response_label(response: Option<u8>) -> String {
    match response {
        Some(code) => format!("0x{:02X}", code),
        None => "no response".to_string(),
    }
}
