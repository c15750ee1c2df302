//! Low-level field codec: fixed-width little-endian integers plus LEB128
//! varints for lengths.
//!
//! Encoders append to a `Vec<u8>`; decoders read from a slice through a
//! cursor position and return [`WireError`] on underrun.

use byteorder::{ByteOrder, LittleEndian};

use crate::WireError;

/// Largest accepted length prefix (64 MiB). Rejecting absurd lengths up
/// front keeps a corrupt frame from triggering a giant allocation.
const MAX_LEN_PREFIX: u64 = 64 * 1024 * 1024;

pub fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(u8::from(v));
}

/// Appends `v` as a LEB128 varint (1..=10 bytes).
pub fn put_varint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Appends a varint length prefix followed by the raw bytes.
pub fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_varint(buf, b.len() as u64);
    buf.extend_from_slice(b);
}

pub fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn get_u8(buf: &[u8], pos: &mut usize) -> Result<u8, WireError> {
    let b = *buf.get(*pos).ok_or(WireError::Truncated)?;
    *pos += 1;
    Ok(b)
}

pub fn get_u32(buf: &[u8], pos: &mut usize) -> Result<u32, WireError> {
    let end = pos.checked_add(4).ok_or(WireError::Truncated)?;
    if end > buf.len() {
        return Err(WireError::Truncated);
    }
    let v = LittleEndian::read_u32(&buf[*pos..end]);
    *pos = end;
    Ok(v)
}

pub fn get_u64(buf: &[u8], pos: &mut usize) -> Result<u64, WireError> {
    let end = pos.checked_add(8).ok_or(WireError::Truncated)?;
    if end > buf.len() {
        return Err(WireError::Truncated);
    }
    let v = LittleEndian::read_u64(&buf[*pos..end]);
    *pos = end;
    Ok(v)
}

pub fn get_bool(buf: &[u8], pos: &mut usize) -> Result<bool, WireError> {
    Ok(get_u8(buf, pos)? != 0)
}

/// Reads a LEB128 varint, rejecting encodings longer than 10 bytes.
pub fn get_varint(buf: &[u8], pos: &mut usize) -> Result<u64, WireError> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        let b = *buf.get(*pos).ok_or(WireError::BadVarint)?;
        *pos += 1;
        if shift == 63 && b > 1 {
            return Err(WireError::BadVarint);
        }
        v |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
        if shift > 63 {
            return Err(WireError::BadVarint);
        }
    }
}

/// Reads a varint length prefix and the bytes that follow it.
pub fn get_bytes(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>, WireError> {
    let len = get_varint(buf, pos)?;
    if len > MAX_LEN_PREFIX {
        return Err(WireError::Corrupt);
    }
    let len = len as usize;
    let end = pos.checked_add(len).ok_or(WireError::Truncated)?;
    if end > buf.len() {
        return Err(WireError::Truncated);
    }
    let out = buf[*pos..end].to_vec();
    *pos = end;
    Ok(out)
}

pub fn get_str(buf: &[u8], pos: &mut usize) -> Result<String, WireError> {
    let raw = get_bytes(buf, pos)?;
    String::from_utf8(raw).map_err(|_| WireError::InvalidUtf8)
}
