//! CRC-32 checksum calculation.
//!
//! The vendor header covers its payload with CRC-32/IEEE (the polynomial
//! used by zlib and Ethernet): init `0xFFFFFFFF`, reflected, final XOR
//! `0xFFFFFFFF`.

/// CRC-32/IEEE lookup table, one entry per byte value.
const fn make_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = make_table();

/// Calculate the CRC-32/IEEE checksum of `data`.
pub fn crc32_ieee(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32_ieee(&[]), 0);
    }

    #[test]
    fn test_crc32_check_value() {
        // Standard check value for CRC-32/ISO-HDLC.
        assert_eq!(crc32_ieee(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_crc32_matches_zlib() {
        // binascii.crc32(b"hello world") & 0xFFFFFFFF
        assert_eq!(crc32_ieee(b"hello world"), 0x0D4A1185);
    }

    #[test]
    fn test_crc32_single_bit_sensitivity() {
        let a = crc32_ieee(&[0x00; 64]);
        let mut flipped = [0x00u8; 64];
        flipped[17] = 0x01;
        assert_ne!(a, crc32_ieee(&flipped));
    }
}
