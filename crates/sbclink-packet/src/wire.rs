//! Low-level wire helpers shared by the request and response codecs.
//!
//! Everything on the wire is little-endian. Strings are carried as a `u16`
//! byte length, a reserved zero `u16`, the UTF-8 bytes, then zero padding to
//! the next 4-byte boundary. Packet bodies are padded the same way; padding
//! never counts toward declared lengths.

use bytes::{Buf, BufMut};

use crate::error::{CodecError, Result};

/// Round `len` up to the next 4-byte boundary.
pub fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// Wire size of a string field, padding included.
pub fn string_wire_len(s: &str) -> usize {
    4 + pad4(s.len())
}

/// Append a length-prefixed, padded string.
pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_u16_le(0);
    buf.put_slice(s.as_bytes());
    put_padding(buf, s.len());
}

/// Append zero padding for a field of `len` bytes.
pub fn put_padding(buf: &mut impl BufMut, len: usize) {
    for _ in len..pad4(len) {
        buf.put_u8(0);
    }
}

/// Read a length-prefixed, padded string.
pub fn get_string(buf: &mut &[u8]) -> Result<String> {
    let len = get_u16(buf)? as usize;
    let _reserved = get_u16(buf)?;
    let padded = pad4(len);
    if buf.remaining() < padded {
        return Err(truncated(padded, buf.remaining()));
    }
    let text = std::str::from_utf8(&buf[..len])?.to_owned();
    buf.advance(padded);
    Ok(text)
}

pub fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated(1, 0));
    }
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(truncated(2, buf.remaining()));
    }
    Ok(buf.get_u16_le())
}

pub fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated(4, buf.remaining()));
    }
    Ok(buf.get_u32_le())
}

pub fn get_i32(buf: &mut &[u8]) -> Result<i32> {
    Ok(get_u32(buf)? as i32)
}

/// Skip `count` bytes of reserved space.
pub fn skip(buf: &mut &[u8], count: usize) -> Result<()> {
    if buf.remaining() < count {
        return Err(truncated(count, buf.remaining()));
    }
    buf.advance(count);
    Ok(())
}

fn truncated(claimed: usize, remaining: usize) -> CodecError {
    CodecError::Truncated {
        kind: 0,
        claimed,
        remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad4_boundaries() {
        assert_eq!(pad4(0), 0);
        assert_eq!(pad4(1), 4);
        assert_eq!(pad4(4), 4);
        assert_eq!(pad4(5), 8);
    }

    #[test]
    fn string_roundtrip_with_padding() {
        let mut buf = Vec::new();
        put_string(&mut buf, "abcde");

        // 4-byte prefix + 5 bytes + 3 padding.
        assert_eq!(buf.len(), 12);
        assert_eq!(buf.len(), string_wire_len("abcde"));
        assert_eq!(&buf[9..], &[0, 0, 0]);

        let mut slice = buf.as_slice();
        assert_eq!(get_string(&mut slice).unwrap(), "abcde");
        assert!(slice.is_empty());
    }

    #[test]
    fn empty_string_is_four_bytes() {
        let mut buf = Vec::new();
        put_string(&mut buf, "");
        assert_eq!(buf.len(), 4);

        let mut slice = buf.as_slice();
        assert_eq!(get_string(&mut slice).unwrap(), "");
    }

    #[test]
    fn truncated_string_rejected() {
        let mut buf = Vec::new();
        put_string(&mut buf, "hello world");
        buf.truncate(8);

        let mut slice = buf.as_slice();
        assert!(matches!(
            get_string(&mut slice),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&[0xFF, 0xFE, 0, 0]);

        let mut slice = buf.as_slice();
        assert!(matches!(
            get_string(&mut slice),
            Err(CodecError::BadString(_))
        ));
    }
}
