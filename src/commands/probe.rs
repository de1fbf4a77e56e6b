//! Probe command

use seflash_isp::{Opener, Orchestrator, ProbeStatus};

/// Check whether the enclave answers and report its maintenance flag
pub fn run_probe<O: Opener>(isp: &mut Orchestrator<O>) -> bool {
    let outcome = isp.probe();
    super::print_diagnostics(&outcome.diagnostics);

    match outcome.report {
        ProbeStatus::Unreachable => println!("Port unavailable."),
        ProbeStatus::NotResponsive => println!("SE not responsive."),
        ProbeStatus::IspActive { maintenance } => {
            let flag = match maintenance {
                Some(true) => "YES",
                Some(false) => "NO",
                None => "unknown",
            };
            println!("SE is in ISP mode. Maintenance mode: {}", flag);
        }
    }
    outcome.success
}
