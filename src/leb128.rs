//! LEB128 varint encoding, used throughout the binary format for lengths,
//! counts and indices.


use crate::error::FormatError;

/// Decodes an unsigned 32-bit LEB128 value starting at `offset`.
/// Returns the value and the number of bytes consumed.
pub fn decode_u32(bytes: &[u8], offset: usize) -> Result<(u32, usize), FormatError> {
    let mut value: u32 = 0;
    let mut shift = 0;
    for (i, &byte) in bytes.iter().skip(offset).enumerate() {
        let bits = (byte & 0x7f) as u32;
        if shift == 28 && bits > 0x0f {
            // A fifth byte may only contribute the low four bits.
            return Err(FormatError::MalformedVarint { offset: offset + i });
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift > 28 {
            return Err(FormatError::MalformedVarint { offset: offset + i });
        }
    }
    Err(FormatError::MalformedVarint {
        offset: bytes.len(),
    })
}

/// Decodes a signed 32-bit LEB128 value starting at `offset`.
pub fn decode_i32(bytes: &[u8], offset: usize) -> Result<(i32, usize), FormatError> {
    let mut value: i32 = 0;
    let mut shift = 0;
    for (i, &byte) in bytes.iter().skip(offset).enumerate() {
        value |= (((byte & 0x7f) as i32) << shift) as i32;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 32 && byte & 0x40 != 0 {
                value |= -1 << shift;
            }
            return Ok((value, i + 1));
        }
        if shift > 28 {
            return Err(FormatError::MalformedVarint { offset: offset + i });
        }
    }
    Err(FormatError::MalformedVarint {
        offset: bytes.len(),
    })
}

/// Appends the minimal unsigned LEB128 encoding of `value` to `out`.
pub fn encode_u32(mut value: u32, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Appends the minimal signed LEB128 encoding of `value` to `out`.
pub fn encode_i32(mut value: i32, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign_clear = byte & 0x40 == 0;
        if (value == 0 && sign_clear) || (value == -1 && !sign_clear) {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Number of bytes the minimal unsigned encoding of `value` occupies.
pub fn len_u32(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0xfff_ffff => 4,
        _ => 5,
    }
}
