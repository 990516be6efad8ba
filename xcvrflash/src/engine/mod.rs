//! Upgrade engines.
//!
//! The legacy bootloader and CDB protocols frame their commands very
//! differently but share the same four-phase run shape, captured by
//! [`UpgradeEngine`]. The CLI drives either engine through that trait.

pub mod cdb;
pub mod legacy;

use crate::error::Result;

/// Progress callback: `(bytes_or_blocks_done, total)`.
pub type Progress<'a> = &'a mut dyn FnMut(usize, usize);

/// The common shape of a firmware upgrade run.
///
/// Implementations are single-session state machines: created for one
/// run, driven through the four phases in order, then discarded. On a
/// fatal error after destructive work has begun, `transfer_image` leaves
/// the device in a bootable state before returning the error.
pub trait UpgradeEngine {
    /// Validate the image against the live module before any
    /// destructive operation.
    fn verify(&mut self) -> Result<()>;

    /// Unlock or authenticate against the device, where the protocol
    /// requires it.
    fn authenticate(&mut self) -> Result<()>;

    /// Transfer the image payload to the device.
    fn transfer_image(&mut self, progress: Progress<'_>) -> Result<()>;

    /// Activate, commit, or jump into the transferred image.
    fn finalize(&mut self) -> Result<()>;

    /// Run the whole upgrade: verify, authenticate, transfer, finalize.
    fn run(&mut self, progress: Progress<'_>) -> Result<()> {
        self.verify()?;
        self.authenticate()?;
        self.transfer_image(progress)?;
        self.finalize()
    }
}

/// What to do with the freshly transferred image at the end of a CDB run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalizeMode {
    /// Leave the image inactive; the module decides when to run it.
    #[default]
    None,
    /// Wait for the module to reboot, then commit the running image as
    /// persistent.
    Commit,
    /// Ask the module to run the new image immediately.
    Run {
        /// Request a hitless restart instead of a full reset.
        hitless: bool,
    },
}
