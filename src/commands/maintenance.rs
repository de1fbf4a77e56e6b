//! Maintenance command

use seflash_isp::{FlagCheck, Opener, Orchestrator};

/// Put the enclave into maintenance mode across a reset
pub fn run_maintenance<O: Opener>(isp: &mut Orchestrator<O>) -> bool {
    let outcome = isp.enter_maintenance();
    super::print_diagnostics(&outcome.diagnostics);

    let states: Vec<String> = outcome
        .report
        .history
        .iter()
        .map(|s| format!("{:?}", s))
        .collect();
    log::debug!("Maintenance states: {}", states.join(" -> "));

    if outcome.success {
        match outcome.report.flag {
            FlagCheck::Confirmed => println!("=== Maintenance mode confirmed ==="),
            _ => println!("=== Maintenance sequence done (flag not confirmed) ==="),
        }
    } else {
        println!("Failed to enter maintenance mode.");
    }
    outcome.success
}
