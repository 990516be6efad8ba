//! Upgrade image parsing and validation.

pub mod vendor;

// Re-export common types
pub use vendor::{FirmwareImage, VendorHeader, split_raw};
