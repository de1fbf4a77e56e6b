//! Maintenance-mode entry
//!
//! The enclave only accepts MRAM writes after it has booted with the
//! maintenance flag set. Getting there takes a full round trip through a
//! device reset:
//!
//! ```text
//! Running -> IspActive -> MaintenanceSet -> Resetting -> AwaitingReboot
//!         -> Reconnected -> Verified
//! ```
//!
//! Any step may end in `Failed`. The machine owns the session for the whole
//! sequence and releases the port on every way out.

use crate::error::{IspError, Result};
use crate::session::IspSession;
use crate::transport::Opener;
use std::thread::sleep;

/// Where the maintenance sequence currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceState {
    /// Enclave assumed to be running its firmware
    Running,
    /// START_ISP acknowledged
    IspActive,
    /// Maintenance flag requested and ISP stopped
    MaintenanceSet,
    /// Reset sent, port released
    Resetting,
    /// Reboot window elapsed
    AwaitingReboot,
    /// Port acquired again after the reboot
    Reconnected,
    /// Enclave back in ISP mode after the reset
    Verified,
    /// Sequence aborted
    Failed,
}

/// What the post-reset ENQUIRY said about the maintenance flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagCheck {
    /// Flag read back as set
    Confirmed,
    /// Flag read back as clear
    NotSet,
    /// ENQUIRY failed or was too short to carry the flag
    Unknown,
    /// Sequence never got far enough to check
    NotChecked,
}

/// Result of a maintenance sequence
#[derive(Debug)]
pub struct MaintenanceReport {
    /// Terminal state, `Verified` or `Failed`
    pub state: MaintenanceState,
    /// Every state the machine passed through, in order
    pub history: Vec<MaintenanceState>,
    /// Maintenance flag as read after the reset
    pub flag: FlagCheck,
    /// Why the sequence failed
    pub error: Option<IspError>,
    /// Warnings and guidance for the user
    pub diagnostics: Vec<String>,
}

impl MaintenanceReport {
    /// Whether the enclave is ready for MRAM writes
    pub fn succeeded(&self) -> bool {
        self.state == MaintenanceState::Verified
    }

    /// Report for a sequence that could not even acquire the port
    pub fn not_started(error: IspError) -> Self {
        Self {
            state: MaintenanceState::Failed,
            history: vec![MaintenanceState::Running, MaintenanceState::Failed],
            flag: FlagCheck::NotChecked,
            diagnostics: vec![error.to_string()],
            error: Some(error),
        }
    }
}

/// Drives one maintenance sequence
pub struct MaintenanceMachine<O: Opener> {
    session: IspSession<O>,
    history: Vec<MaintenanceState>,
    diagnostics: Vec<String>,
}

impl<O: Opener> MaintenanceMachine<O> {
    /// Take over an open session
    pub fn new(session: IspSession<O>) -> Self {
        Self {
            session,
            history: vec![MaintenanceState::Running],
            diagnostics: Vec::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> MaintenanceState {
        self.history
            .last()
            .copied()
            .unwrap_or(MaintenanceState::Running)
    }

    /// Run the sequence to completion
    pub fn run(mut self) -> MaintenanceReport {
        let result = self.drive();
        self.session.close();

        match result {
            Ok(flag) => MaintenanceReport {
                state: self.state(),
                history: self.history,
                flag,
                error: None,
                diagnostics: self.diagnostics,
            },
            Err(e) => {
                log::error!("Maintenance mode entry failed in state {:?}: {}", self.state(), e);
                self.advance(MaintenanceState::Failed);
                MaintenanceReport {
                    state: MaintenanceState::Failed,
                    history: self.history,
                    flag: FlagCheck::NotChecked,
                    error: Some(e),
                    diagnostics: self.diagnostics,
                }
            }
        }
    }

    fn advance(&mut self, next: MaintenanceState) {
        log::debug!("maintenance: {:?} -> {:?}", self.state(), next);
        self.history.push(next);
    }

    fn warn(&mut self, message: String) {
        log::warn!("{}", message);
        self.diagnostics.push(message);
    }

    fn drive(&mut self) -> Result<FlagCheck> {
        let config = self.session.config().clone();

        // Phase 1: latch the flag
        if !self.session.start_isp()?.accepted() {
            self.warn(
                "SE did not respond. Unplug and replug the PRG_USB cable, \
                 then run this command within 2-3 seconds of plugging in."
                    .into(),
            );
            return Err(IspError::NotResponsive);
        }
        self.advance(MaintenanceState::IspActive);

        // The flag may latch even when these are not acknowledged
        self.best_effort("SET_MAINTENANCE", |s| s.set_maintenance().map(|r| r.accepted()));
        self.best_effort("STOP_ISP", |s| s.stop_isp().map(|r| r.accepted()));
        self.advance(MaintenanceState::MaintenanceSet);

        log::info!("  Resetting device...");
        self.session.reset()?;
        self.session.close();
        self.advance(MaintenanceState::Resetting);

        // Phase 2: reboot barrier
        log::info!(
            "  Waiting for {} to come back ({:.1}s)...",
            self.session.link().port(),
            config.reboot_wait.as_secs_f32()
        );
        sleep(config.reboot_wait);
        self.advance(MaintenanceState::AwaitingReboot);

        self.session
            .link()
            .reopen(config.reopen_retries, config.reopen_backoff)?;
        self.advance(MaintenanceState::Reconnected);

        // Phase 3: verify
        if !self.session.start_isp()?.accepted() {
            self.warn(
                "SE not responding after reset. Power cycle the board \
                 (unplug/replug PRG_USB) and run again."
                    .into(),
            );
            return Err(IspError::NotResponsive);
        }

        let flag = match self.session.enquiry() {
            Ok(Some(info)) => match info.maintenance {
                Some(true) => FlagCheck::Confirmed,
                Some(false) => FlagCheck::NotSet,
                None => FlagCheck::Unknown,
            },
            Ok(None) => FlagCheck::Unknown,
            Err(e) => {
                log::debug!("maintenance: ENQUIRY failed: {}", e);
                FlagCheck::Unknown
            }
        };

        match flag {
            FlagCheck::Confirmed => log::info!("Maintenance mode: ACTIVE"),
            _ => {
                let value = if flag == FlagCheck::NotSet { "0" } else { "unknown" };
                self.warn(format!(
                    "Maintenance flag = {}. Proceeding anyway, MRAM write may still work.",
                    value
                ));
            }
        }

        // Leave the enclave idle; failures here don't matter
        let _ = self.session.stop_isp();
        self.advance(MaintenanceState::Verified);
        Ok(flag)
    }

    fn best_effort<F>(&mut self, label: &str, step: F)
    where
        F: FnOnce(&mut IspSession<O>) -> Result<bool>,
    {
        match step(&mut self.session) {
            Ok(true) => {}
            Ok(false) => log::warn!("  {} not acknowledged, continuing", label),
            Err(e) => log::warn!("  {} failed ({}), continuing", label, e),
        }
    }
}
