//! Little-endian fixed and varint encodings shared by every on-disk format.

use bytes::{Buf, BufMut};

pub fn put_fixed32(dst: &mut Vec<u8>, value: u32) {
    dst.put_u32_le(value);
}

pub fn put_fixed64(dst: &mut Vec<u8>, value: u64) {
    dst.put_u64_le(value);
}

/// Reads a fixed64 from the first 8 bytes of `src`
///
/// Callers guarantee the length.
pub fn decode_fixed64(mut src: &[u8]) -> u64 {
    src.get_u64_le()
}

pub fn decode_fixed32(mut src: &[u8]) -> u32 {
    src.get_u32_le()
}

pub fn put_varint32(dst: &mut Vec<u8>, value: u32) {
    put_varint64(dst, value as u64)
}

pub fn put_varint64(dst: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

pub fn varint_length(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Decodes a varint64 from the front of `src`, advancing it
pub fn get_varint64(src: &mut &[u8]) -> Option<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    while shift <= 63 {
        let (&byte, rest) = src.split_first()?;
        *src = rest;
        if byte & 0x80 != 0 {
            result |= ((byte & 0x7f) as u64) << shift;
        } else {
            result |= (byte as u64) << shift;
            return Some(result);
        }
        shift += 7;
    }
    None
}

pub fn get_varint32(src: &mut &[u8]) -> Option<u32> {
    let value = get_varint64(src)?;
    u32::try_from(value).ok()
}

pub fn put_length_prefixed_slice(dst: &mut Vec<u8>, value: &[u8]) {
    put_varint32(dst, value.len() as u32);
    dst.put_slice(value);
}

/// Splits a varint32-prefixed slice off the front of `src`
pub fn get_length_prefixed_slice<'a>(src: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = get_varint32(src)? as usize;
    if src.len() < len {
        return None;
    }
    let (value, rest) = src.split_at(len);
    *src = rest;
    Some(value)
}

pub fn get_fixed64(src: &mut &[u8]) -> Option<u64> {
    if src.len() < 8 {
        return None;
    }
    Some(src.get_u64_le())
}
