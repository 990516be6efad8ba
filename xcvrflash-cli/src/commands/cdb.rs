//! CMIS CDB upgrade command.

use anyhow::{Context, Result};
use console::style;
use std::fs;
use std::path::Path;
use xcvrflash::{CdbEngine, CdbOptions, FinalizeMode, UpgradeEngine};

use crate::Cli;
use crate::commands::{ensure_bin_extension, ensure_not_interrupted, open_transport, transfer_progress};

/// CDB upgrade command implementation.
pub(crate) fn cmd_upgrade_cdb(
    cli: &Cli,
    firmware: &Path,
    password: Option<u32>,
    finalize: FinalizeMode,
    lpl_only: bool,
) -> Result<()> {
    ensure_bin_extension(firmware)?;

    if !cli.quiet {
        eprintln!(
            "{} Loading upgrade image: {}",
            style("📦").cyan(),
            firmware.display()
        );
    }

    // The vendor header size is negotiated with the module, so the file
    // is handed over raw and split after the capability query.
    let raw = fs::read(firmware)
        .with_context(|| format!("Failed to read upgrade image {}", firmware.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Using I2C bus {} ({} bytes to transfer)",
            style("🔌").cyan(),
            cli.bus,
            raw.len()
        );
        if lpl_only {
            eprintln!("{} LPL-only transfer path forced", style("ℹ").blue());
        }
    }

    let transport = open_transport(&cli.bus)?;
    ensure_not_interrupted()?;

    let options = CdbOptions {
        password,
        finalize,
        lpl_only,
    };
    let mut engine = CdbEngine::new(transport, raw, options);

    if !cli.quiet {
        eprintln!("{} Querying firmware features...", style("⏳").yellow());
    }
    engine.verify()?;
    ensure_not_interrupted()?;
    engine.authenticate()?;

    let pb = transfer_progress(cli, 0);
    pb.set_message("writing");
    engine.transfer_image(&mut |current, total| {
        pb.set_length(total as u64);
        pb.set_position((current as u64).min(total as u64));
    })?;
    pb.finish_with_message("done");

    ensure_not_interrupted()?;
    if !cli.quiet {
        match finalize {
            FinalizeMode::None => {},
            FinalizeMode::Run { hitless: true } => {
                eprintln!("{} Requesting hitless restart...", style("🔄").cyan());
            },
            FinalizeMode::Run { hitless: false } => {
                eprintln!("{} Resetting into the new image...", style("🔄").cyan());
            },
            FinalizeMode::Commit => {
                eprintln!(
                    "{} Waiting for reboot, then committing image...",
                    style("🔄").cyan()
                );
            },
        }
    }
    engine.finalize()?;

    if !cli.quiet {
        eprintln!("\n{} CDB upgrade complete", style("🎉").green().bold());
    }

    Ok(())
}
