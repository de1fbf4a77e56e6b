//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default location of the SETOOLS checkout, relative to the workspace
pub const DEFAULT_SETOOLS_DIR: &str = "tools/setools";

/// Default ATOC config, relative to the SETOOLS directory
pub const DEFAULT_CONFIG: &str = "build/config/linux-boot-e7.json";

#[derive(Parser)]
#[command(name = "seflash")]
#[command(author, version, about = "MRAM flash tool (SE-UART ISP protocol)", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Serial port (auto-detected if omitted, `dummy` for the emulator)
    #[arg(long, global = true)]
    pub port: Option<String>,

    /// TOML file overriding ISP timings and retry counts
    #[arg(long, global = true)]
    pub isp_config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check if the secure enclave is responsive
    Probe,

    /// Enter maintenance mode (power cycle the board, then run within 5s)
    Maintenance,

    /// Flash all images from the ATOC JSON config to MRAM
    Flash {
        /// ATOC JSON config path [default: <setools-dir>/build/config/linux-boot-e7.json]
        #[arg(long)]
        config: Option<PathBuf>,

        /// SETOOLS directory
        #[arg(long, default_value = DEFAULT_SETOOLS_DIR)]
        setools_dir: PathBuf,

        /// Run app-gen-toc before flashing
        #[arg(long)]
        gen_toc: bool,

        /// Enter maintenance mode first
        #[arg(long)]
        maintenance: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flash() {
        let cli = Cli::try_parse_from([
            "seflash",
            "--port",
            "/dev/ttyACM0",
            "flash",
            "--gen-toc",
            "--maintenance",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        match cli.command {
            Commands::Flash {
                config,
                setools_dir,
                gen_toc,
                maintenance,
            } => {
                assert!(config.is_none());
                assert_eq!(setools_dir, PathBuf::from(DEFAULT_SETOOLS_DIR));
                assert!(gen_toc);
                assert!(maintenance);
            }
            _ => panic!("expected flash"),
        }
    }
}
