//! Wire protocol implementations.

pub mod cdb;
pub mod crc;
pub mod legacy;

// Re-export common types
pub use cdb::CdbCommand;
pub use crc::crc32_ieee;
pub use legacy::{CommandFrame, Opcode};
