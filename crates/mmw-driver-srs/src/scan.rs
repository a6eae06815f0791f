//! SR830 scan-buffer binary format (`TRCL?`).
//!
//! Each point is four bytes:
//!
//! | byte | meaning |
//! |------|---------|
//! | 0 | mantissa, low byte |
//! | 1 | mantissa, high byte (16-bit two's complement) |
//! | 2 | exponent, unsigned, offset by 124 |
//! | 3 | unused |
//!
//! value = mantissa × 2^(exponent − 124)

use mmw_core::{AppResult, DaqError};

/// Bytes per buffer point.
pub const BYTES_PER_POINT: usize = 4;

const EXPONENT_BIAS: i32 = 124;

/// Decode one point.
pub fn decode_point(point: [u8; 4]) -> f64 {
    let mantissa = i16::from_le_bytes([point[0], point[1]]);
    let exponent = i32::from(point[2]) - EXPONENT_BIAS;
    f64::from(mantissa) * 2f64.powi(exponent)
}

/// Encode one point. Used by simulated lock-ins.
pub fn encode_point(mantissa: i16, exponent: u8) -> [u8; 4] {
    let [lo, hi] = mantissa.to_le_bytes();
    [lo, hi, exponent, 0]
}

/// Decode a `TRCL?` reply that was asked for `points` points.
///
/// # Errors
///
/// [`DaqError::ScanLength`] unless `bytes` holds exactly `points` points.
pub fn decode_buffer(bytes: &[u8], points: usize) -> AppResult<Vec<f64>> {
    let expected = points * BYTES_PER_POINT;
    if bytes.len() != expected {
        return Err(DaqError::ScanLength {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(BYTES_PER_POINT)
        .map(|c| decode_point([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;

    #[test]
    fn unit_exponent_returns_mantissa() {
        assert_eq!(decode_point(encode_point(100, 124)), 100.0);
    }

    #[test]
    fn negative_mantissa_is_twos_complement() {
        // 0b1111_1111_1111_1110
        assert_eq!(decode_point([0xFE, 0xFF, 124, 0]), -2.0);
        // 0b0000_0000_0000_0101
        assert_eq!(decode_point([0x05, 0x00, 124, 0]), 5.0);
        assert_eq!(decode_point([0x00, 0x80, 124, 0]), -32768.0);
    }

    #[test]
    fn exponent_scales_by_powers_of_two() {
        assert_eq!(decode_point(encode_point(3, 126)), 12.0);
        assert_eq!(decode_point(encode_point(1, 100)), 2f64.powi(-24));
        assert_eq!(decode_point(encode_point(-16384, 110)), -16384.0 * 2f64.powi(-14));
    }

    #[test]
    fn high_byte_is_ignored() {
        assert_eq!(decode_point([0x05, 0x00, 124, 0xAB]), 5.0);
    }

    #[test]
    fn buffer_decodes_in_order() {
        let mut bytes = Vec::new();
        bytes.extend(encode_point(1, 124));
        bytes.extend(encode_point(-1, 125));
        bytes.extend(encode_point(7, 123));
        assert_eq!(decode_buffer(&bytes, 3).unwrap(), vec![1.0, -2.0, 3.5]);
    }

    #[test]
    fn short_buffer_is_an_error() {
        let bytes = [0x05, 0x00, 124, 0, 0x01, 0x00];
        match decode_buffer(&bytes, 2) {
            Err(DaqError::ScanLength { expected, actual }) => {
                assert_eq!(expected, 8);
                assert_eq!(actual, 6);
            }
            other => panic!("expected length error, got {:?}", other),
        }
    }

    #[test]
    fn extra_points_are_an_error() {
        let bytes: Vec<u8> = [encode_point(1, 124), encode_point(2, 124)].concat();
        assert!(decode_buffer(&bytes, 1).is_err());
    }
}
