use std::collections::HashMap;

use super::packer::*;
use shared::error::{Error, Result};

// Domain names on the wire are label sequences, each prefixed by a length
// octet, terminated by a zero octet, or cut short by a compression pointer
// (top two bits set, 14-bit absolute back-offset).
//
// Labels use the modified UTF-8 scheme the original multicast responders
// shipped with: NUL and chars above 0x7F take 2 bytes, the BMP takes up
// to 3, and supplementary planes are encoded as surrogate pairs.

pub(crate) fn utf_encode(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for c in s.chars() {
        let code = c as u32;
        if (0x01..=0x7F).contains(&code) {
            out.push(code as u8);
        } else if code <= 0x7FF {
            out.push(0xC0 | ((code >> 6) as u8));
            out.push(0x80 | ((code & 0x3F) as u8));
        } else if code <= 0xFFFF {
            out.push(0xE0 | ((code >> 12) as u8));
            out.push(0x80 | (((code >> 6) & 0x3F) as u8));
            out.push(0x80 | ((code & 0x3F) as u8));
        } else {
            let v = code - 0x1_0000;
            let hi = 0xD800 + (v >> 10);
            let lo = 0xDC00 + (v & 0x3FF);
            for part in [hi, lo] {
                out.push(0xE0 | ((part >> 12) as u8));
                out.push(0x80 | (((part >> 6) & 0x3F) as u8));
                out.push(0x80 | ((part & 0x3F) as u8));
            }
        }
    }
    out
}

pub(crate) fn utf_decode(msg: &[u8], off: usize, len: usize) -> Result<(String, usize)> {
    if off + len > msg.len() {
        return Err(Error::ErrShortBuffer);
    }
    let end = off + len;
    let mut i = off;
    let mut out = String::new();
    while i < end {
        let unit = decode_unit(msg, &mut i, end)?;
        let code = if (0xD800..0xDC00).contains(&unit) {
            let lo = decode_unit(msg, &mut i, end)?;
            if !(0xDC00..0xE000).contains(&lo) {
                return Err(Error::ErrInvalidUtf);
            }
            0x1_0000 + ((unit - 0xD800) << 10) + (lo - 0xDC00)
        } else if (0xDC00..0xE000).contains(&unit) {
            return Err(Error::ErrInvalidUtf);
        } else {
            unit
        };
        out.push(char::from_u32(code).ok_or(Error::ErrInvalidUtf)?);
    }
    Ok((out, end))
}

// One 16-bit code unit of modified UTF-8.
fn decode_unit(msg: &[u8], i: &mut usize, end: usize) -> Result<u32> {
    if *i >= end {
        return Err(Error::ErrInvalidUtf);
    }
    let b = u32::from(msg[*i]);
    *i += 1;
    match b >> 4 {
        0x0..=0x7 => Ok(b),
        0xC | 0xD => {
            let b2 = cont_byte(msg, i, end)?;
            Ok(((b & 0x1F) << 6) | b2)
        }
        0xE => {
            let b2 = cont_byte(msg, i, end)?;
            let b3 = cont_byte(msg, i, end)?;
            Ok(((b & 0x0F) << 12) | (b2 << 6) | b3)
        }
        _ => Err(Error::ErrInvalidUtf),
    }
}

fn cont_byte(msg: &[u8], i: &mut usize, end: usize) -> Result<u32> {
    if *i >= end {
        return Err(Error::ErrInvalidUtf);
    }
    let b = u32::from(msg[*i]);
    *i += 1;
    if b & 0xC0 != 0x80 {
        return Err(Error::ErrInvalidUtf);
    }
    Ok(b & 0x3F)
}

// pack_name appends the wire format of name to msg, reusing a previously
// written occurrence of any identical suffix via a compression pointer.
// Offsets are recorded per suffix, exact match only.
pub(crate) fn pack_name(
    mut msg: Vec<u8>,
    name: &str,
    compression: &mut HashMap<String, usize>,
) -> Result<Vec<u8>> {
    let mut remaining = name;
    loop {
        if remaining.is_empty() || remaining == "." {
            return Ok(pack_byte(msg, 0));
        }
        if let Some(&off) = compression.get(remaining) {
            msg = pack_byte(msg, 0xC0 | ((off >> 8) as u8));
            return Ok(pack_byte(msg, (off & 0xFF) as u8));
        }
        // Pointers only reach 14 bits back.
        if msg.len() < 0x4000 {
            compression.insert(remaining.to_string(), msg.len());
        }
        let (label, rest) = match remaining.split_once('.') {
            Some((label, rest)) => (label, rest),
            None => (remaining, ""),
        };
        let utf = utf_encode(label);
        if utf.is_empty() || utf.len() > 63 {
            return Err(Error::ErrBadLabelLength);
        }
        msg = pack_byte(msg, utf.len() as u8);
        msg.extend_from_slice(&utf);
        remaining = rest;
    }
}

// unpack_name reads a possibly compressed name starting at off. Every
// pointer must land strictly before any position already visited, which
// rules out forward pointers and loops.
pub(crate) fn unpack_name(msg: &[u8], off: usize) -> Result<(String, usize)> {
    let mut off = off;
    let mut first = off;
    let mut next = None;
    let mut name = String::new();
    loop {
        let (len, o) = unpack_byte(msg, off)?;
        off = o;
        match len & 0xC0 {
            0x00 => {
                if len == 0 {
                    break;
                }
                let (label, o) = utf_decode(msg, off, usize::from(len))?;
                off = o;
                name.push_str(&label);
                name.push('.');
            }
            0xC0 => {
                let (lo, o) = unpack_byte(msg, off)?;
                off = o;
                if next.is_none() {
                    next = Some(off);
                }
                let ptr = (usize::from(len & 0x3F) << 8) | usize::from(lo);
                if ptr >= first {
                    return Err(Error::ErrCircularPointer);
                }
                off = ptr;
                first = ptr;
            }
            _ => return Err(Error::ErrBadLabelLength),
        }
    }
    Ok((name, next.unwrap_or(off)))
}

// Case-insensitive name comparison, the protocol treats names as ASCII
// case-blind.
pub(crate) fn names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
