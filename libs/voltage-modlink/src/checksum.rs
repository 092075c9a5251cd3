//! Frame checksums
//!
//! CRC16 (polynomial 0xA001, reflected) for RTU and LRC for ASCII.

use crc::{Crc, CRC_16_MODBUS};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC16/MODBUS over `data`, returned in wire order `[low, high]`
pub fn crc16(data: &[u8]) -> [u8; 2] {
    MODBUS_CRC.checksum(data).to_le_bytes()
}

/// Two's complement of the 8-bit wrapping sum of `data`
pub fn lrc(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (sum ^ 0xFF).wrapping_add(1)
}

/// Check that the last two bytes of `frame` are the CRC of everything before them
pub fn verify_crc16(frame: &[u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    crc16(body) == [trailer[0], trailer[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_reference_vector() {
        assert_eq!(crc16(&[0x02, 0x07]), [0x41, 0x12]);
    }

    #[test]
    fn test_crc16_read_holding_request() {
        // 01 03 00 00 00 0A -> C5 CD
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), [0xC5, 0xCD]);
    }

    #[test]
    fn test_crc16_empty_input_is_initial_value() {
        assert_eq!(crc16(&[]), [0xFF, 0xFF]);
    }

    #[test]
    fn test_verify_crc16() {
        let mut frame = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        frame.extend_from_slice(&crc16(&frame));
        assert!(verify_crc16(&frame));

        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(!verify_crc16(&frame));
        assert!(!verify_crc16(&[0x01]));
    }

    #[test]
    fn test_lrc_hand_computed() {
        // :01030000000A -> sum = 0x0E, two's complement = 0xF2
        assert_eq!(lrc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xF2);
        // :F7031389000A -> sum = 0x1A0 (wraps to 0xA0), two's complement = 0x60
        assert_eq!(lrc(&[0xF7, 0x03, 0x13, 0x89, 0x00, 0x0A]), 0x60);
    }

    #[test]
    fn test_lrc_frame_sums_to_zero() {
        let data = [0x11, 0x22, 0x33, 0xFE];
        let check = lrc(&data);
        let total = data.iter().fold(check, |acc, &b| acc.wrapping_add(b));
        assert_eq!(total, 0);
    }
}
