//! seflash-isp - Secure-enclave ISP protocol engine
//!
//! This crate implements the In-System-Programming protocol spoken by the
//! secure enclave over its SE-UART, and the procedures built on it:
//! entering maintenance mode across a device reset, and writing images to
//! MRAM.
//!
//! # Layers
//!
//! - [`protocol`]: frame codec and payload layouts
//! - [`transport`]: byte-stream trait, port opener, serial implementation
//! - [`link`]: one framed command/response exchange, drain, reconnect
//! - [`session`]: commands and response classification, START_ISP retries
//! - [`maintenance`]: maintenance-mode state machine
//! - [`flasher`]: chunked MRAM image writes
//! - [`orchestrator`]: probe / maintenance / flash entry points
//!
//! # Example
//!
//! ```no_run
//! use seflash_isp::{Image, IspConfig, NoProgress, Orchestrator, SerialOpener};
//!
//! let mut isp = Orchestrator::new(SerialOpener, "/dev/ttyACM0", IspConfig::default());
//! let image = Image::new("bl32.bin", std::fs::read("bl32.bin")?, 0x8000_0000);
//! let outcome = isp.flash(true, || Ok(vec![image]), &mut NoProgress);
//! for line in &outcome.diagnostics {
//!     println!("{}", line);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod flasher;
pub mod link;
pub mod maintenance;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports
pub use config::IspConfig;
pub use error::{IspError, Result};
pub use flasher::{FlashProgress, Image, ImageFlasher, ImageReport, NoProgress, TransferProgress};
pub use link::IspLink;
pub use maintenance::{FlagCheck, MaintenanceMachine, MaintenanceReport, MaintenanceState};
pub use orchestrator::{FlashSummary, Orchestrator, Outcome, ProbeStatus};
pub use protocol::{Command, Response};
pub use session::{EnquiryInfo, IspSession, Reply, ReplyStatus};
pub use transport::serial::{SerialOpener, SerialTransport};
pub use transport::{Opener, Transport};
