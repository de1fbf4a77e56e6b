//! seflash - MRAM flasher for the secure enclave's UART ISP protocol
//!
//! The binary wires the command line to [`seflash_isp::Orchestrator`]:
//!
//! - `probe`: is the enclave answering, and is it in maintenance mode?
//! - `maintenance`: enter maintenance mode across a device reset
//! - `flash`: write every image listed in an ATOC JSON config to MRAM
//!
//! `--port dummy` runs against an in-process emulator instead of hardware.

mod cli;
mod commands;
mod manifest;
mod ports;

use clap::Parser;
use cli::{Cli, Commands};
use commands::FlashArgs;
use seflash_isp::{IspConfig, Opener, Orchestrator, SerialOpener};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let config = match &cli.isp_config {
        Some(path) => match IspConfig::load(path) {
            Ok(config) => {
                log::debug!("Loaded ISP settings from {}", path.display());
                config
            }
            Err(e) => {
                eprintln!("Failed to load {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => IspConfig::default(),
    };

    let port = match cli.port.clone() {
        Some(port) => port,
        None => ports::discover()?,
    };

    let success = if port == ports::DUMMY_PORT {
        run_dummy(&port, config, cli.command)?
    } else {
        run(Orchestrator::new(SerialOpener, port, config), cli.command)
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(feature = "dummy")]
fn run_dummy(
    port: &str,
    config: IspConfig,
    command: Commands,
) -> Result<bool, Box<dyn std::error::Error>> {
    log::info!("Using the emulated enclave");
    let enclave = seflash_dummy::DummyEnclave::new_default();
    Ok(run(Orchestrator::new(enclave, port, config), command))
}

#[cfg(not(feature = "dummy"))]
fn run_dummy(
    _port: &str,
    _config: IspConfig,
    _command: Commands,
) -> Result<bool, Box<dyn std::error::Error>> {
    Err("seflash was built without the `dummy` feature".into())
}

fn run<O: Opener>(mut isp: Orchestrator<O>, command: Commands) -> bool {
    match command {
        Commands::Probe => commands::run_probe(&mut isp),
        Commands::Maintenance => commands::run_maintenance(&mut isp),
        Commands::Flash {
            config,
            setools_dir,
            gen_toc,
            maintenance,
        } => {
            let args = FlashArgs {
                config: config.unwrap_or_else(|| setools_dir.join(cli::DEFAULT_CONFIG)),
                setools_dir,
                gen_toc,
                maintenance,
            };
            commands::run_flash(&mut isp, &args)
        }
    }
}
