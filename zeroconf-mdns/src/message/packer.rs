use shared::error::{Error, Result};

// pack_uint16 appends the wire format of field to msg.
pub(crate) fn pack_uint16(mut msg: Vec<u8>, field: u16) -> Vec<u8> {
    msg.extend_from_slice(&field.to_be_bytes());
    msg
}

pub(crate) fn unpack_uint16(msg: &[u8], off: usize) -> Result<(u16, usize)> {
    if off + 2 > msg.len() {
        return Err(Error::ErrShortBuffer);
    }
    Ok((
        (u16::from(msg[off]) << 8) | u16::from(msg[off + 1]),
        off + 2,
    ))
}

// pack_uint32 appends the wire format of field to msg.
pub(crate) fn pack_uint32(mut msg: Vec<u8>, field: u32) -> Vec<u8> {
    msg.extend_from_slice(&field.to_be_bytes());
    msg
}

pub(crate) fn unpack_uint32(msg: &[u8], off: usize) -> Result<(u32, usize)> {
    if off + 4 > msg.len() {
        return Err(Error::ErrShortBuffer);
    }
    let v = (u32::from(msg[off]) << 24)
        | (u32::from(msg[off + 1]) << 16)
        | (u32::from(msg[off + 2]) << 8)
        | u32::from(msg[off + 3]);
    Ok((v, off + 4))
}

pub(crate) fn pack_byte(mut msg: Vec<u8>, field: u8) -> Vec<u8> {
    msg.push(field);
    msg
}

pub(crate) fn unpack_byte(msg: &[u8], off: usize) -> Result<(u8, usize)> {
    if off >= msg.len() {
        return Err(Error::ErrShortBuffer);
    }
    Ok((msg[off], off + 1))
}

pub(crate) fn unpack_bytes(msg: &[u8], off: usize, len: usize) -> Result<(Vec<u8>, usize)> {
    if off + len > msg.len() {
        return Err(Error::ErrShortBuffer);
    }
    Ok((msg[off..off + len].to_vec(), off + len))
}
