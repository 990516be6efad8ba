//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod cdb;
pub(crate) mod info;
pub(crate) mod upgrade;

use crate::{Cli, CliError, was_interrupted};
use anyhow::Result;
#[cfg(target_os = "linux")]
use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;

pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("upgrade interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Reject anything that is not a `.bin` upgrade image before any device
/// I/O happens.
pub(crate) fn ensure_bin_extension(path: &Path) -> Result<()> {
    let is_bin = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("bin"));
    if is_bin {
        Ok(())
    } else {
        Err(CliError::Usage(format!(
            "invalid file selected: {} (expected a .bin upgrade image)",
            path.display()
        ))
        .into())
    }
}

/// Open the I2C bus named on the command line.
#[cfg(target_os = "linux")]
pub(crate) fn open_transport(
    bus: &str,
) -> Result<xcvrflash::HalI2cTransport<linux_embedded_hal::I2cdev>> {
    let dev = linux_embedded_hal::I2cdev::new(bus)
        .with_context(|| format!("Failed to open I2C bus {bus}"))?;
    Ok(xcvrflash::HalI2cTransport::new(dev))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn open_transport(_bus: &str) -> Result<UnsupportedTransport> {
    anyhow::bail!("I2C bus access is only supported on Linux")
}

/// Placeholder transport for platforms without I2C bus support; never
/// constructed, [`open_transport`] fails first.
#[cfg(not(target_os = "linux"))]
pub(crate) struct UnsupportedTransport;

#[cfg(not(target_os = "linux"))]
impl xcvrflash::Transport for UnsupportedTransport {
    fn write(
        &mut self,
        _slave_addr: u8,
        _reg_addr: Option<u8>,
        _data: &[u8],
    ) -> xcvrflash::Result<()> {
        Err(xcvrflash::Error::Transport("unsupported platform".into()))
    }

    fn read(
        &mut self,
        _slave_addr: u8,
        _reg_addr: Option<u8>,
        _count: usize,
        _cmd: Option<u8>,
    ) -> xcvrflash::Result<Vec<u8>> {
        Err(xcvrflash::Error::Transport("unsupported platform".into()))
    }
}

/// Create a byte-count progress bar on stderr, hidden in quiet mode.
pub(crate) fn transfer_progress(cli: &Cli, total: u64) -> ProgressBar {
    if cli.quiet || !console::Term::stderr().is_term() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_extension_gate() {
        assert!(ensure_bin_extension(Path::new("fw.bin")).is_ok());
        assert!(ensure_bin_extension(Path::new("fw.BIN")).is_ok());
        assert!(ensure_bin_extension(Path::new("fw.hex")).is_err());
        assert!(ensure_bin_extension(Path::new("fw")).is_err());
    }

    #[test]
    fn test_bin_extension_error_is_usage() {
        let err = ensure_bin_extension(Path::new("fw.fwpkg")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }
}
