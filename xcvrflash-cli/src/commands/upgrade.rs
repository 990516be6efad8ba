//! Legacy bootloader upgrade command.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use xcvrflash::{FirmwareFamily, FirmwareImage, LegacyBootloaderEngine, UpgradeEngine};

use crate::Cli;
use crate::commands::{ensure_bin_extension, ensure_not_interrupted, open_transport, transfer_progress};

/// Upgrade command implementation.
pub(crate) fn cmd_upgrade(
    cli: &Cli,
    firmware: &Path,
    family: FirmwareFamily,
    password: Option<u32>,
    no_retry: bool,
) -> Result<()> {
    ensure_bin_extension(firmware)?;

    if !cli.quiet {
        eprintln!(
            "{} Loading upgrade image: {}",
            style("📦").cyan(),
            firmware.display()
        );
    }

    let image = FirmwareImage::from_file(firmware)
        .with_context(|| format!("Failed to load upgrade image {}", firmware.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} {} {} v{} ({} bytes)",
            style("ℹ").blue(),
            image.header.module_number,
            image.header.firmware_type_name,
            image.header.version_string(),
            image.header.file_size
        );
        eprintln!(
            "{} Using I2C bus {}",
            style("🔌").cyan(),
            cli.bus
        );
    }

    let transport = open_transport(&cli.bus)?;
    ensure_not_interrupted()?;

    let total = u64::from(image.header.file_size);
    let mut engine = LegacyBootloaderEngine::new(transport, image, family).with_retry(!no_retry);
    if let Some(password) = password {
        engine = engine.with_password(password);
    }

    if !cli.quiet {
        eprintln!("{} Verifying module...", style("⏳").yellow());
    }
    engine.verify()?;
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!("{} Unlocking bootloader...", style("🔓").yellow());
    }
    engine.authenticate()?;

    let pb = transfer_progress(cli, total);
    pb.set_message("writing");
    engine.transfer_image(&mut |current, total| {
        pb.set_length(total as u64);
        pb.set_position((current as u64).min(total as u64));
    })?;
    pb.finish_with_message("done");

    ensure_not_interrupted()?;
    engine.finalize()?;

    if !cli.quiet {
        eprintln!(
            "\n{} Upgrade complete, module is starting the new image",
            style("🎉").green().bold()
        );
    }

    Ok(())
}
