//! CLI command implementations
//!
//! Each command drives one [`seflash_isp::Orchestrator`] entry point, prints
//! the result, and returns whether it succeeded. They are generic over the
//! port opener so the same code runs against hardware and the emulator.

mod flash;
mod maintenance;
mod probe;
mod progress;

pub use flash::{run_flash, FlashArgs};
pub use maintenance::run_maintenance;
pub use probe::run_probe;
pub use progress::IndicatifProgress;

/// Print an outcome's diagnostics, one per line
fn print_diagnostics(diagnostics: &[String]) {
    for line in diagnostics {
        println!("{}", line);
    }
}
