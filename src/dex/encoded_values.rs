/* Dex encoded_value parsing, reduced to what field constants need */

use crate::dex::dex_file::DexFile;
use crate::dex::error::DexError;
use crate::dex::{read_u1, read_uleb128};

/// A parsed encoded_value. Only the shapes that can become a classfile
/// `ConstantValue` are kept; aggregates are skipped over and reported as
/// `Invalid` so field indices stay aligned.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedValue {
    None,
    Invalid,
    Int32(u32),
    Int64(u64),
    Str(Vec<u8>),
    Type(String),
}

pub(crate) fn read_encoded_value(
    dex: &DexFile,
    bytes: &[u8],
    ix: &mut usize,
) -> Result<EncodedValue, DexError> {
    let tag = read_u1(bytes, ix)? as u32;
    let (vtype, varg) = (tag & 31, tag >> 5);

    match vtype {
        0x1c => {
            // ARRAY
            let count = read_uleb128(bytes, ix)?;
            for _ in 0..count {
                read_encoded_value(dex, bytes, ix)?;
            }
            return Ok(EncodedValue::Invalid);
        }
        0x1d => {
            // ANNOTATION
            read_uleb128(bytes, ix)?;
            let count = read_uleb128(bytes, ix)?;
            for _ in 0..count {
                read_uleb128(bytes, ix)?;
                read_encoded_value(dex, bytes, ix)?;
            }
            return Ok(EncodedValue::Invalid);
        }
        0x1e => return Ok(EncodedValue::None), // NULL
        0x1f => return Ok(EncodedValue::Int32(varg)), // BOOLEAN
        _ => {}
    }

    // the rest are an integer packed into varg + 1 bytes
    let size = varg + 1;
    let mut val = 0u64;
    for i in 0..size {
        val |= (read_u1(bytes, ix)? as u64) << (i * 8);
    }

    Ok(match vtype {
        0x00 => EncodedValue::Int32(val as i8 as u32),  // BYTE
        0x02 => EncodedValue::Int32(val as i16 as u32), // SHORT
        0x03 => EncodedValue::Int32(val as u16 as u32), // CHAR
        0x04 => EncodedValue::Int32(val as i32 as u32), // INT
        0x06 => EncodedValue::Int64(val),               // LONG

        // floats are zero extended to the right
        0x10 => EncodedValue::Int32((val << (32 - size * 8)) as u32), // FLOAT
        0x11 => EncodedValue::Int64(val << (64 - size * 8)),          // DOUBLE

        0x17 => EncodedValue::Str(dex.string(val as u32)?.utf8_bytes()), // STRING
        0x18 => EncodedValue::Type(dex.cls_type(val as u32)?.to_string()), // TYPE
        _ => EncodedValue::None,
    })
}

/// Reads the encoded_array of static field initial values.
pub(crate) fn read_encoded_array(
    dex: &DexFile,
    bytes: &[u8],
    ix: &mut usize,
) -> Result<Vec<EncodedValue>, DexError> {
    let size = read_uleb128(bytes, ix)?;
    let mut values = Vec::with_capacity(size as usize);
    for _ in 0..size {
        values.push(read_encoded_value(dex, bytes, ix)?);
    }
    Ok(values)
}
