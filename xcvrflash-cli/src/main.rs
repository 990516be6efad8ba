//! xcvrflash CLI - Command-line tool for upgrading optical transceiver
//! module firmware over I2C.
//!
//! ## Features
//!
//! - Legacy vendor bootloader upgrades (DSP firmware family)
//! - CMIS CDB upgrades with EPL or LPL-only transfer
//! - Upgrade image inspection
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use xcvrflash::FirmwareFamily;

mod commands;

use commands::{cdb::cmd_upgrade_cdb, info::cmd_info, upgrade::cmd_upgrade};

/// Set by the Ctrl-C handler; long-running library loops poll it.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Whether the user requested cancellation.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors that carry a dedicated exit code.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// The invocation itself was wrong (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// The user cancelled the operation (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// xcvrflash - A tool for upgrading optical transceiver module firmware.
///
/// Environment variables:
///   XCVRFLASH_BUS   - Default I2C bus device (default: /dev/i2c-1)
#[derive(Parser)]
#[command(name = "xcvrflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// I2C bus device carrying the module.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/dev/i2c-1",
        env = "XCVRFLASH_BUS"
    )]
    bus: String,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Firmware families flashable through the legacy bootloader.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Family {
    /// DSP firmware (default).
    Dsp,
}

impl From<Family> for FirmwareFamily {
    fn from(family: Family) -> Self {
        match family {
            Family::Dsp => FirmwareFamily::Dsp,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Upgrade firmware through the legacy vendor bootloader.
    Upgrade {
        /// Path to the upgrade image (.bin).
        firmware: PathBuf,

        /// Firmware family to flash.
        #[arg(long, default_value = "dsp")]
        family: Family,

        /// Bootloader unlock password (hex, e.g. 0xC24F4F54).
        #[arg(long, value_parser = parse_hex_u32)]
        password: Option<u32>,

        /// Run the upgrade sequence exactly once instead of retrying.
        #[arg(long)]
        no_retry: bool,
    },

    /// Upgrade firmware through the CMIS CDB mechanism.
    UpgradeCdb {
        /// Path to the upgrade image (.bin).
        firmware: PathBuf,

        /// CMIS host password (hex, default 0x00001011).
        #[arg(long, value_parser = parse_hex_u32)]
        password: Option<u32>,

        /// Skip the password command entirely.
        #[arg(long, conflicts_with = "password")]
        no_password: bool,

        /// Force the LPL-only transfer path.
        #[arg(long)]
        lpl: bool,

        /// Run the new image with a full module reset after transfer.
        #[arg(long, conflicts_with_all = ["hitless_restart", "commit_image"])]
        run_image: bool,

        /// Run the new image with a hitless (traffic-preserving) restart.
        #[arg(long, conflicts_with = "commit_image")]
        hitless_restart: bool,

        /// Wait for the module to reboot, then commit the running image.
        #[arg(long)]
        commit_image: bool,
    },

    /// Show information about an upgrade image file.
    Info {
        /// Path to the upgrade image (.bin).
        firmware: PathBuf,
    },
}

/// Parse a hexadecimal value (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex value: {e}"))
}

fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    if env::var("NO_COLOR").is_ok() || !console::Term::stderr().is_term() {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    debug!(
        "xcvrflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Wire Ctrl-C into the library's interrupt hook. The engines finish
    // the current register transaction and then unwind cleanly, which
    // matters once the flash is mid-erase.
    xcvrflash::set_interrupt_checker(was_interrupted);
    let handler = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            // Second Ctrl-C: the user really means it.
            std::process::exit(130);
        }
        eprintln!(
            "\n{} finishing the current step, press Ctrl-C again to force quit",
            style("Interrupted:").yellow().bold()
        );
    });
    if let Err(err) = handler {
        debug!("could not install Ctrl-C handler: {err}");
    }

    if let Err(err) = run(&cli) {
        report_error(&err);
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Upgrade {
            firmware,
            family,
            password,
            no_retry,
        } => cmd_upgrade(cli, firmware, (*family).into(), *password, *no_retry),
        Commands::UpgradeCdb {
            firmware,
            password,
            no_password,
            lpl,
            run_image,
            hitless_restart,
            commit_image,
        } => {
            let finalize = if *commit_image {
                xcvrflash::FinalizeMode::Commit
            } else if *hitless_restart {
                xcvrflash::FinalizeMode::Run { hitless: true }
            } else if *run_image {
                xcvrflash::FinalizeMode::Run { hitless: false }
            } else {
                xcvrflash::FinalizeMode::None
            };
            let password = if *no_password {
                None
            } else {
                Some(password.unwrap_or(xcvrflash::protocol::cdb::DEFAULT_PASSWORD))
            };
            cmd_upgrade_cdb(cli, firmware, password, finalize, *lpl)
        },
        Commands::Info { firmware } => cmd_info(firmware),
    }
}

/// Print the error chain and exit with a code matching its kind.
fn report_error(err: &anyhow::Error) -> ! {
    let code = match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => 2,
        Some(CliError::Cancelled(_)) => 130,
        None => 1,
    };
    eprintln!("{} {err:#}", style("Error:").red().bold());
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_u32_variants() {
        assert_eq!(parse_hex_u32("C24F4F54").unwrap(), 0xC24F_4F54);
        assert_eq!(parse_hex_u32("0x1011").unwrap(), 0x1011);
        assert_eq!(parse_hex_u32("0xC2_4F_4F_54").unwrap(), 0xC24F_4F54);
        assert!(parse_hex_u32("not-hex").is_err());
    }

    #[test]
    fn test_cli_parses_upgrade_command() {
        let cli = Cli::try_parse_from([
            "xcvrflash",
            "--bus",
            "/dev/i2c-3",
            "upgrade",
            "firmware.bin",
            "--password",
            "0xC24F4F54",
            "--no-retry",
        ])
        .unwrap();
        assert_eq!(cli.bus, "/dev/i2c-3");
        assert!(matches!(
            cli.command,
            Commands::Upgrade {
                password: Some(0xC24F_4F54),
                no_retry: true,
                ..
            }
        ));
    }

    #[test]
    fn test_cdb_finalize_flags_conflict() {
        let result = Cli::try_parse_from([
            "xcvrflash",
            "upgrade-cdb",
            "firmware.bin",
            "--hitless-restart",
            "--commit-image",
        ]);
        assert!(result.is_err());
    }
}
