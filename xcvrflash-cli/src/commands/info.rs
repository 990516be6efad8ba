//! Upgrade image inspection command.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use xcvrflash::FirmwareImage;

use crate::commands::ensure_bin_extension;

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path) -> Result<()> {
    ensure_bin_extension(firmware)?;

    eprintln!(
        "{} Loading upgrade image: {}",
        style("📦").cyan(),
        firmware.display()
    );

    let image = FirmwareImage::from_file(firmware)
        .with_context(|| format!("Failed to load upgrade image {}", firmware.display()))?;
    let header = &image.header;

    eprintln!("\n{}", style("Upgrade Image").bold().underlined());
    eprintln!("  Module number:  {}", header.module_number);
    eprintln!("  Firmware type:  {}", header.firmware_type_name);
    eprintln!("  Version:        {}", header.version_string());
    eprintln!("  Build:          {}", header.build_version);
    eprintln!("  Image slot:     {}", header.image_slot());
    eprintln!("  Flash offset:   {:#010x}", header.offset_addr);
    eprintln!("  Payload size:   {} bytes", header.file_size);
    eprintln!("  Payload CRC32:  {:#010x}", header.file_crc32);
    // FirmwareImage::from_file already checked the size and CRC.
    eprintln!("  Integrity:      {}", style("valid").green());

    Ok(())
}
