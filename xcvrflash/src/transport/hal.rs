//! Transport adapter over the `embedded-hal` 1.0 I2C traits.
//!
//! Works with any bus implementing [`embedded_hal::i2c::I2c`], such as
//! `linux-embedded-hal`'s `I2cdev` on a `/dev/i2c-N` device.

use crate::error::{Error, Result};
use crate::transport::Transport;
use embedded_hal::i2c::{ErrorKind, I2c, NoAcknowledgeSource};
use log::trace;

/// [`Transport`] implementation for an `embedded-hal` I2C bus.
pub struct HalI2cTransport<I2C: I2c> {
    bus: I2C,
}

impl<I2C: I2c> HalI2cTransport<I2C> {
    /// Wrap an opened I2C bus.
    pub fn new(bus: I2C) -> Self {
        Self { bus }
    }

    /// Consume the adapter and return the underlying bus.
    pub fn into_bus(self) -> I2C {
        self.bus
    }

    fn seven_bit(slave_addr: u8) -> u8 {
        // Protocol addresses are 8-bit wire addresses (0xA0, 0x36);
        // embedded-hal wants the 7-bit form.
        slave_addr >> 1
    }

    fn is_nack(err: &I2C::Error) -> bool {
        matches!(
            embedded_hal::i2c::Error::kind(err),
            ErrorKind::NoAcknowledge(
                NoAcknowledgeSource::Address | NoAcknowledgeSource::Unknown
            )
        )
    }
}

impl<I2C: I2c> Transport for HalI2cTransport<I2C> {
    fn write(&mut self, slave_addr: u8, reg_addr: Option<u8>, data: &[u8]) -> Result<()> {
        let addr = Self::seven_bit(slave_addr);
        let result = match reg_addr {
            Some(reg) => {
                let mut frame = Vec::with_capacity(1 + data.len());
                frame.push(reg);
                frame.extend_from_slice(data);
                self.bus.write(addr, &frame)
            },
            None => self.bus.write(addr, data),
        };

        match result {
            Ok(()) => Ok(()),
            // The target address may still be absent (bootloader not yet
            // active, module mid-reset); polling loops keep writing until
            // a read shows the device answering.
            Err(e) if Self::is_nack(&e) => {
                trace!("i2c write to {slave_addr:#04x} NACKed");
                Ok(())
            },
            Err(e) => Err(Error::Transport(format!(
                "i2c write to {slave_addr:#04x}: {e:?}"
            ))),
        }
    }

    fn read(
        &mut self,
        slave_addr: u8,
        reg_addr: Option<u8>,
        count: usize,
        cmd: Option<u8>,
    ) -> Result<Vec<u8>> {
        let addr = Self::seven_bit(slave_addr);
        let mut buf = vec![0u8; count];
        let result = match (reg_addr, cmd) {
            (Some(reg), _) => self.bus.write_read(addr, &[reg], &mut buf),
            // Current-address read; nothing to resend, the opcode was
            // already issued by the preceding write.
            (None, _) => self.bus.read(addr, &mut buf),
        };

        match result {
            Ok(()) => Ok(buf),
            // An unanswered poll is not fatal; the engines keep polling.
            Err(e) if Self::is_nack(&e) => {
                trace!("i2c read from {slave_addr:#04x} NACKed");
                Ok(Vec::new())
            },
            Err(e) => Err(Error::Transport(format!(
                "i2c read from {slave_addr:#04x}: {e:?}"
            ))),
        }
    }
}
