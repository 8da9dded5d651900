//! Unsigned LEB128 helpers used for collection id key prefixes.

use crate::error::{MemdError, MemdResult};

/// Appends `value` as unsigned LEB128.
pub fn append_uleb128_u32(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Encodes `value` as unsigned LEB128.
pub fn encode_uleb128_u32(value: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    append_uleb128_u32(&mut out, value);
    out
}

/// Decodes an unsigned LEB128 value, returning it with the number of bytes read.
pub fn decode_uleb128_u32(buf: &[u8]) -> MemdResult<(u32, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0;
    for (i, byte) in buf.iter().enumerate() {
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return u32::try_from(result)
                .map(|v| (v, i + 1))
                .map_err(|_| MemdError::InvalidLeb128);
        }
        shift += 7;
        if shift > 28 {
            return Err(MemdError::InvalidLeb128);
        }
    }
    Err(MemdError::InvalidLeb128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_encodings() {
        assert_eq!(encode_uleb128_u32(0), vec![0x00]);
        assert_eq!(encode_uleb128_u32(8), vec![0x08]);
        assert_eq!(encode_uleb128_u32(0x80), vec![0x80, 0x01]);
        assert_eq!(encode_uleb128_u32(555), vec![0xab, 0x04]);
        assert_eq!(encode_uleb128_u32(u32::MAX), vec![0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[test]
    fn test_decode_reports_length() {
        let (v, n) = decode_uleb128_u32(&[0xab, 0x04, b'k', b'1']).unwrap();
        assert_eq!(v, 555);
        assert_eq!(n, 2);
    }

    #[test]
    fn test_decode_truncated() {
        assert!(decode_uleb128_u32(&[0x80]).is_err());
        assert!(decode_uleb128_u32(&[]).is_err());
    }
}
