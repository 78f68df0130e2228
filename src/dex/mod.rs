#[macro_use]
pub mod error;

pub(crate) mod leb;
pub(crate) mod formats;
pub(crate) mod instructions;
pub(crate) mod encoded_values;
pub mod dex_file;

use crate::dex::error::DexError;
use crate::dex::leb::{decode_sleb128, decode_uleb128};

// Basic little-endian reading against a cursor. The dex container is little
// endian throughout; all offsets in the header are absolute file offsets.
pub(crate) fn read_u1(bytes: &[u8], ix: &mut usize) -> Result<u8, DexError>
{
    if bytes.len() < *ix + 1
    {
        fail!("Unexpected end of stream reading u1 at index {}", *ix);
    }
    let result = bytes[*ix];
    *ix += 1;
    Ok(result)
}

pub(crate) fn read_u2(bytes: &[u8], ix: &mut usize) -> Result<u16, DexError>
{
    if bytes.len() < *ix + 2
    {
        fail!("Unexpected end of stream reading u2 at index {}", *ix);
    }
    let result = ((bytes[*ix + 1] as u16) << 8) | (bytes[*ix] as u16);
    *ix += 2;
    Ok(result)
}

pub(crate) fn read_u4(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError>
{
    if bytes.len() < *ix + 4
    {
        fail!("Unexpected end of stream reading u4 at index {}", *ix);
    }
    let result = ((bytes[*ix + 3] as u32) << 24)
        | ((bytes[*ix + 2] as u32) << 16)
        | ((bytes[*ix + 1] as u32) << 8)
        | (bytes[*ix] as u32);
    *ix += 4;
    Ok(result)
}

pub(crate) fn read_uleb128(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError>
{
    if *ix >= bytes.len()
    {
        fail!("Unexpected end of stream reading uleb128 at index {}", *ix);
    }
    let (val, size) = decode_uleb128(&bytes[*ix..]);
    *ix += size;
    Ok(val)
}

pub(crate) fn read_sleb128(bytes: &[u8], ix: &mut usize) -> Result<i32, DexError>
{
    if *ix >= bytes.len()
    {
        fail!("Unexpected end of stream reading sleb128 at index {}", *ix);
    }
    let (val, size) = decode_sleb128(&bytes[*ix..]);
    *ix += size;
    Ok(val)
}

pub(crate) fn read_x<'a>(bytes: &'a [u8], ix: &mut usize, length: usize) -> Result<&'a [u8], DexError>
{
    if bytes.len() - *ix >= length
    {
        let slice = &bytes[*ix..*ix + length];
        *ix += length;
        Ok(slice)
    }
    else
    {
        Err(DexError::new("buffer too short for array read"))
    }
}

// Reads the NUL-terminated MUTF-8 payload of a string data item.
pub(crate) fn read_cstr<'a>(bytes: &'a [u8], ix: &mut usize) -> Result<&'a [u8], DexError>
{
    let start = *ix;
    while *ix < bytes.len() && bytes[*ix] != 0
    {
        *ix += 1;
    }
    if *ix >= bytes.len()
    {
        fail!("Unterminated string data at index {}", start);
    }
    let slice = &bytes[start..*ix];
    *ix += 1;
    Ok(slice)
}
