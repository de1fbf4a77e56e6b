//! Top-level ISP operations: probe, maintenance and flash
//!
//! Each entry point opens its own session, runs to completion and releases
//! the port before returning. Errors from the lower layers do not escape;
//! they end up as `success: false` plus human-readable diagnostics in an
//! [`Outcome`].

use crate::config::IspConfig;
use crate::error::IspError;
use crate::flasher::{FlashProgress, Image, ImageFlasher, ImageReport};
use crate::maintenance::{MaintenanceMachine, MaintenanceReport};
use crate::session::IspSession;
use crate::transport::Opener;
use std::thread::sleep;
use std::time::{Duration, Instant};

/// Result of a top-level operation
#[derive(Debug)]
pub struct Outcome<T> {
    pub success: bool,
    pub report: T,
    /// Warnings, failure reasons and what to try next
    pub diagnostics: Vec<String>,
}

impl<T> Outcome<T> {
    fn ok(report: T, diagnostics: Vec<String>) -> Self {
        Self {
            success: true,
            report,
            diagnostics,
        }
    }

    fn failed(report: T, diagnostics: Vec<String>) -> Self {
        Self {
            success: false,
            report,
            diagnostics,
        }
    }
}

/// What a probe found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Port could not be opened
    Unreachable,
    /// Port opened but START_ISP was never acknowledged
    NotResponsive,
    /// Enclave entered ISP mode
    IspActive {
        /// Maintenance flag, if ENQUIRY returned it
        maintenance: Option<bool>,
    },
}

/// What a flash run did
#[derive(Debug, Default)]
pub struct FlashSummary {
    /// Maintenance sequence that ran first, if requested
    pub maintenance: Option<MaintenanceReport>,
    /// Images written, in order
    pub images: Vec<ImageReport>,
    /// Time spent writing images
    pub elapsed: Duration,
}

/// Runs ISP operations against one port
pub struct Orchestrator<O: Opener> {
    opener: O,
    port: String,
    config: IspConfig,
}

impl<O: Opener> Orchestrator<O> {
    pub fn new(opener: O, port: impl Into<String>, config: IspConfig) -> Self {
        Self {
            opener,
            port: port.into(),
            config,
        }
    }

    pub fn config(&self) -> &IspConfig {
        &self.config
    }

    fn open_session(&mut self) -> Result<IspSession<&mut O>, IspError> {
        IspSession::open(&mut self.opener, &self.port, &self.config)
    }

    /// Check whether the enclave answers, and whether it is in maintenance mode
    pub fn probe(&mut self) -> Outcome<ProbeStatus> {
        log::info!(
            "Probing SE-UART on {} at {} baud...",
            self.port,
            self.config.baud_rate
        );

        let mut session = match self.open_session() {
            Ok(session) => session,
            Err(e) => {
                log::error!("{}", e);
                return Outcome::failed(ProbeStatus::Unreachable, vec![e.to_string()]);
            }
        };

        match session.start_isp() {
            Ok(reply) if reply.accepted() => {}
            Ok(_) => {
                session.close();
                let diagnostics = vec![
                    "SE did not respond to START_ISP.".to_string(),
                    "The board may need a power cycle, or SE is busy running firmware.".to_string(),
                ];
                for line in &diagnostics {
                    log::warn!("{}", line);
                }
                return Outcome::failed(ProbeStatus::NotResponsive, diagnostics);
            }
            Err(e) => {
                session.close();
                log::error!("{}", e);
                return Outcome::failed(ProbeStatus::NotResponsive, vec![e.to_string()]);
            }
        }

        log::info!("SE is in ISP mode.");
        let maintenance = match session.enquiry() {
            Ok(Some(info)) => info.maintenance,
            Ok(None) => None,
            Err(e) => {
                log::debug!("probe: ENQUIRY failed: {}", e);
                None
            }
        };
        match maintenance {
            Some(active) => log::info!("Maintenance mode: {}", if active { "YES" } else { "NO" }),
            None => log::warn!("Maintenance mode: unknown"),
        }

        let _ = session.stop_isp();
        session.close();
        Outcome::ok(ProbeStatus::IspActive { maintenance }, Vec::new())
    }

    /// Put the enclave into maintenance mode
    pub fn enter_maintenance(&mut self) -> Outcome<MaintenanceReport> {
        log::info!("Entering maintenance mode on {}...", self.port);

        let report = match self.open_session() {
            Ok(session) => MaintenanceMachine::new(session).run(),
            Err(e) => {
                log::error!("{}", e);
                MaintenanceReport::not_started(e)
            }
        };

        let mut diagnostics = report.diagnostics.clone();
        if let Some(e) = &report.error {
            let reason = e.to_string();
            if !diagnostics.contains(&reason) {
                diagnostics.push(reason);
            }
        }

        if report.succeeded() {
            Outcome::ok(report, diagnostics)
        } else {
            Outcome::failed(report, diagnostics)
        }
    }

    /// Write images to MRAM
    ///
    /// With `maintenance` set, the maintenance sequence runs first and the
    /// flash is abandoned if it fails. `prepare` then produces the image list;
    /// it runs before the port is opened for writing, so it can regenerate
    /// and validate inputs. An `Err` from it aborts the flash with that
    /// message.
    pub fn flash<F>(
        &mut self,
        maintenance: bool,
        prepare: F,
        progress: &mut dyn FlashProgress,
    ) -> Outcome<FlashSummary>
    where
        F: FnOnce() -> Result<Vec<Image>, String>,
    {
        let mut summary = FlashSummary::default();
        let mut diagnostics = Vec::new();

        if maintenance {
            let outcome = self.enter_maintenance();
            diagnostics.extend(outcome.diagnostics);
            summary.maintenance = Some(outcome.report);
            if !outcome.success {
                diagnostics.push("Failed to enter maintenance mode. Aborting.".to_string());
                return Outcome::failed(summary, diagnostics);
            }
            sleep(self.config.post_maintenance_delay);
        }

        let images = match prepare() {
            Ok(images) if images.is_empty() => {
                diagnostics.push(IspError::NoImages.to_string());
                return Outcome::failed(summary, diagnostics);
            }
            Ok(images) => images,
            Err(message) => {
                diagnostics.push(message);
                return Outcome::failed(summary, diagnostics);
            }
        };

        log::info!(
            "Connecting to {} at {} baud...",
            self.port,
            self.config.baud_rate
        );
        let mut session = match self.open_session() {
            Ok(session) => session,
            Err(e) => {
                diagnostics.push(e.to_string());
                return Outcome::failed(summary, diagnostics);
            }
        };

        match session.start_isp() {
            Ok(reply) if reply.accepted() => {}
            Ok(_) => {
                session.close();
                diagnostics.push("SE not responding. Is the board in maintenance mode?".into());
                diagnostics.push("Run: seflash maintenance".into());
                return Outcome::failed(summary, diagnostics);
            }
            Err(e) => {
                session.close();
                diagnostics.push(e.to_string());
                return Outcome::failed(summary, diagnostics);
            }
        }

        let start = Instant::now();
        let mut flasher = ImageFlasher::new(&mut session, progress);
        for image in &images {
            match flasher.write_image(image) {
                Ok(report) => summary.images.push(report),
                Err(e) => {
                    log::error!("FAILED writing {}: {}", image.name, e);
                    session.close();
                    diagnostics.push(format!("FAILED writing {}: {}", image.name, e));
                    summary.elapsed = start.elapsed();
                    return Outcome::failed(summary, diagnostics);
                }
            }
        }
        summary.elapsed = start.elapsed();
        log::info!(
            "=== All images written ({:.1}s) ===",
            summary.elapsed.as_secs_f32()
        );

        let finish = session
            .stop_isp()
            .and_then(|_| session.reset());
        if let Err(e) = finish {
            log::warn!("Could not reset device after flashing: {}", e);
            diagnostics.push(format!("Reset after flashing failed: {}", e));
        }
        session.close();

        diagnostics.push("Device resetting. A full power cycle may be needed.".into());
        Outcome::ok(summary, diagnostics)
    }
}
