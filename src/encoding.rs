//! Big-endian framing helpers for on-disk formats
//!
//! Every persisted structure (segment rows, column bodies, commit log
//! records, index entries) is laid out with these primitives: fixed-width
//! big-endian integers and length-prefixed strings/byte buffers.

use crate::Result;
use std::io::{Read, Write};

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> Result<()> {
    w.write_all(&[v])?;
    Ok(())
}

pub fn write_i32<W: Write>(w: &mut W, v: i32) -> Result<()> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

pub fn write_i64<W: Write>(w: &mut W, v: i64) -> Result<()> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<()> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

/// UTF-8 string with an i32 byte-length prefix.
pub fn write_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
    write_i32(w, s.len() as i32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

/// Raw buffer with an i32 byte-length prefix.
pub fn write_bytes<W: Write>(w: &mut W, b: &[u8]) -> Result<()> {
    write_i32(w, b.len() as i32)?;
    w.write_all(b)?;
    Ok(())
}

pub fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

pub fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

pub fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

pub fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let bytes = read_byte_buf(r)?;
    String::from_utf8(bytes)
        .map_err(|e| crate::StorageError::Corruption(format!("invalid UTF-8 string: {}", e)))
}

pub fn read_byte_buf<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_i32(r)?;
    if len < 0 {
        return Err(crate::StorageError::Corruption(format!(
            "negative length prefix: {}",
            len
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Serialized size of a length-prefixed string.
pub fn string_size(s: &str) -> usize {
    4 + s.len()
}

/// Serialized size of a length-prefixed buffer.
pub fn bytes_size(b: &[u8]) -> usize {
    4 + b.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_integer_round_trip() {
        let mut buf = Vec::new();
        write_i32(&mut buf, -42).unwrap();
        write_i64(&mut buf, i64::MIN).unwrap();
        write_u64(&mut buf, u64::MAX).unwrap();
        write_u8(&mut buf, 7).unwrap();

        let mut cur = Cursor::new(buf);
        assert_eq!(read_i32(&mut cur).unwrap(), -42);
        assert_eq!(read_i64(&mut cur).unwrap(), i64::MIN);
        assert_eq!(read_u64(&mut cur).unwrap(), u64::MAX);
        assert_eq!(read_u8(&mut cur).unwrap(), 7);
    }

    #[test]
    fn test_string_round_trip() {
        let mut buf = Vec::new();
        write_string(&mut buf, "row-key:42").unwrap();
        assert_eq!(buf.len(), string_size("row-key:42"));

        let mut cur = Cursor::new(buf);
        assert_eq!(read_string(&mut cur).unwrap(), "row-key:42");
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut buf = Vec::new();
        write_i32(&mut buf, -1).unwrap();
        let mut cur = Cursor::new(buf);
        assert!(read_byte_buf(&mut cur).is_err());
    }

    #[test]
    fn test_big_endian_layout() {
        let mut buf = Vec::new();
        write_i32(&mut buf, 1).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 1]);
    }
}
