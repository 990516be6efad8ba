//! Transport abstraction over the I2C register bus.
//!
//! The engines never touch hardware directly; they drive a [`Transport`],
//! which performs exactly one register transaction per call. All timing,
//! polling and retry live above this line, in the engines.
//!
//! ```text
//! +------------------+     +------------------+
//! |   Engine Layer   |     |   Engine Layer   |
//! |  (legacy, cdb)   |     |  (legacy, cdb)   |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |  Transport Trait |     |  Transport Trait |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! | embedded-hal I2C |     |   test stubs     |
//! +------------------+     +------------------+
//! ```
//!
//! Slave addresses throughout this crate are 8-bit wire addresses
//! (`0xA0` for the module's management map, `0x36` for the bootloader);
//! adapters shift them to 7-bit where their bus API requires it.

#[cfg(feature = "hal")]
pub mod hal;

use crate::error::Result;

/// A single-transaction I2C register transport.
///
/// The register file behind this trait is exclusively owned by one
/// upgrade session at a time; implementations own serialization of
/// access to the physical bus.
pub trait Transport {
    /// Write `data` to the device at `slave_addr`.
    ///
    /// With `reg_addr = Some(r)` the bytes land at register `r`; with
    /// `None` the raw byte sequence is issued as-is (opcode-led command
    /// frames). A write the device does not acknowledge is dropped
    /// without error: the target address may legitimately be absent
    /// while the module switches context, and the engines discover
    /// that through subsequent reads. Only a bus-level failure
    /// is an [`Error::Transport`] error.
    ///
    /// [`Error::Transport`]: crate::Error::Transport
    fn write(&mut self, slave_addr: u8, reg_addr: Option<u8>, data: &[u8]) -> Result<()>;

    /// Read up to `count` bytes from the device at `slave_addr`.
    ///
    /// With `reg_addr = Some(r)` the read is register-addressed; with
    /// `None` it is a current-address read, where `cmd` names the opcode
    /// whose answer is being collected (some adapters need to resend it).
    /// Returns the bytes actually read; an empty vec means the device
    /// did not answer, which polling loops treat as "not yet".
    fn read(
        &mut self,
        slave_addr: u8,
        reg_addr: Option<u8>,
        count: usize,
        cmd: Option<u8>,
    ) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, slave_addr: u8, reg_addr: Option<u8>, data: &[u8]) -> Result<()> {
        (**self).write(slave_addr, reg_addr, data)
    }

    fn read(
        &mut self,
        slave_addr: u8,
        reg_addr: Option<u8>,
        count: usize,
        cmd: Option<u8>,
    ) -> Result<Vec<u8>> {
        (**self).read(slave_addr, reg_addr, count, cmd)
    }
}

// Re-export the adapter when built with the hal feature
#[cfg(feature = "hal")]
pub use hal::HalI2cTransport;
