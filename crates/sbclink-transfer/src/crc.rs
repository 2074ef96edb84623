//! Transfer checksums.
//!
//! Both transfer checksums use CRC32C (Castagnoli): initial value
//! `0xFFFF_FFFF`, final xor `0xFFFF_FFFF`, reflected. This must match the
//! firmware's hardware CRC unit exactly or every transfer degenerates into
//! a retry loop.

use crc::{Crc, CRC_32_ISCSI};

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// CRC32C over `data`.
pub fn checksum(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // The canonical CRC32C check value.
        assert_eq!(checksum(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn empty_input() {
        assert_eq!(checksum(b""), 0);
    }

    #[test]
    fn single_bit_flip_changes_checksum() {
        let mut data = vec![0xA5u8; 64];
        let base = checksum(&data);
        for i in 0..data.len() {
            data[i] ^= 0x01;
            assert_ne!(checksum(&data), base, "flip at byte {i} undetected");
            data[i] ^= 0x01;
        }
    }
}
