/* Dex file format structures */

use std::collections::HashSet;

use cesu8::{from_java_cesu8, to_java_cesu8};
use log::warn;

use crate::dex::encoded_values::{read_encoded_array, EncodedValue};
use crate::dex::error::DexError;
use crate::dex::instructions::{parse_bytecode, DalvikIns};
use crate::dex::{read_cstr, read_sleb128, read_u2, read_u4, read_uleb128, read_x};

/* Constants */
pub const ENDIAN_CONSTANT: u32 = 0x12345678;
pub const NO_INDEX: u32 = 0xffffffff;


/// A string data item. Dex strings are MUTF-8; nearly all of them decode to
/// real Unicode, but the format permits unpaired surrogates and other relics
/// which are carried through untouched as `Raw`.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum DexString
{
    Decoded(String),
    Raw(Vec<u8>),
}

impl DexString
{
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<DexString, DexError>
    {
        let _utf16_size = read_uleb128(bytes, ix)?;
        let v = read_cstr(bytes, ix)?;

        Ok(match from_java_cesu8(v)
        {
            Ok(converted) => DexString::Decoded(converted.to_string()),
            _ => DexString::Raw(v.to_vec()),
        })
    }

    /// Bytes of this string in normalized classfile UTF-8 (modified UTF-8).
    pub fn utf8_bytes(&self) -> Vec<u8>
    {
        match self
        {
            DexString::Decoded(s) => to_java_cesu8(s).into_owned(),
            DexString::Raw(v) => v.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str>
    {
        match self
        {
            DexString::Decoded(s) => Some(s),
            DexString::Raw(_) => None,
        }
    }
}


/// Identity of a field reference: (class name, member name, descriptor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef
{
    pub cname: String,
    pub name: String,
    pub desc: String,
}

/// Identity of a method reference plus its parsed parameter and return types.
#[derive(Debug, Clone)]
pub struct MethodRef
{
    pub cname: String,
    pub name: String,
    pub desc: String,
    pub return_type: String,
    param_types: Vec<String>,
    cdesc: String,
}

impl MethodRef
{
    /// Parameter descriptors with a `None` slot inserted after every wide
    /// parameter so that positions line up with dalvik register numbering.
    /// For virtual methods the receiver type is prepended.
    pub fn spaced_param_types(&self, is_static: bool) -> Vec<Option<String>>
    {
        let mut res = Vec::with_capacity(self.param_types.len() + 1);
        if !is_static
        {
            res.push(Some(self.cdesc.clone()));
        }
        for param in &self.param_types
        {
            res.push(Some(param.clone()));
            if param.starts_with('J') || param.starts_with('D')
            {
                res.push(None);
            }
        }
        res
    }
}


#[derive(Debug)]
struct ProtoItem
{
    return_type_idx: u32,
    parameters: Vec<u32>,
}

#[derive(Debug)]
struct FieldItem
{
    class_idx: u32,
    type_idx: u32,
    name_idx: u32,
}

#[derive(Debug)]
struct MethodItem
{
    class_idx: u32,
    proto_idx: u32,
    name_idx: u32,
}


#[derive(Debug)]
pub struct CatchItem
{
    /// Catch type in class-name form; the catch-all slot holds
    /// `java/lang/Throwable`.
    pub ctype: String,
    pub target: u32,
}

#[derive(Debug)]
pub struct TryItem
{
    pub start: u32,
    pub end: u32,
    pub catches: Vec<CatchItem>,
}

#[derive(Debug)]
pub struct CodeItem
{
    pub nregs: u16,
    pub tries: Vec<TryItem>,
    pub insns: Vec<DalvikIns>,
}

impl CodeItem
{
    pub fn read(dex: &DexFile, offset: u32) -> Result<CodeItem, DexError>
    {
        let bytes = dex.raw;
        let mut ix = offset as usize;
        let nregs = read_u2(bytes, &mut ix)?;
        let _ins_size = read_u2(bytes, &mut ix)?;
        let _outs_size = read_u2(bytes, &mut ix)?;
        let tries_size = read_u2(bytes, &mut ix)?;
        let _debug_off = read_u4(bytes, &mut ix)?;
        let insns_size = read_u4(bytes, &mut ix)?;

        let mut shorts = Vec::with_capacity(insns_size as usize);
        for _ in 0..insns_size
        {
            shorts.push(read_u2(bytes, &mut ix)?);
        }

        if tries_size != 0 && insns_size & 1 != 0
        {
            read_u2(bytes, &mut ix)?; // alignment padding
        }

        let mut tries = Vec::with_capacity(tries_size as usize);
        let mut handler_offs = Vec::with_capacity(tries_size as usize);
        for _ in 0..tries_size
        {
            let start = read_u4(bytes, &mut ix)?;
            let count = read_u2(bytes, &mut ix)?;
            let handler_off = read_u2(bytes, &mut ix)?;
            tries.push(TryItem { start, end: start + count as u32, catches: Vec::new() });
            handler_offs.push(handler_off as usize);
        }

        // handler lists are addressed relative to the start of the list area
        let list_base = ix;
        for (item, handler_off) in tries.iter_mut().zip(handler_offs)
        {
            let mut hx = list_base + handler_off;
            let size = read_sleb128(bytes, &mut hx)?;
            for _ in 0..size.abs()
            {
                let type_idx = read_uleb128(bytes, &mut hx)?;
                let target = read_uleb128(bytes, &mut hx)?;
                item.catches.push(CatchItem { ctype: dex.cls_type(type_idx)?.to_string(), target });
            }
            // a non-positive size means the list ends with a catch-all
            if size <= 0
            {
                let target = read_uleb128(bytes, &mut hx)?;
                item.catches.push(CatchItem { ctype: "java/lang/Throwable".to_string(), target });
            }
        }

        let mut catch_addrs = HashSet::new();
        for item in &tries
        {
            for catch in &item.catches
            {
                catch_addrs.insert(catch.target);
            }
        }

        let insns = parse_bytecode(dex, &shorts, &catch_addrs)?;
        Ok(CodeItem { nregs, tries, insns })
    }
}


#[derive(Debug)]
pub struct Field
{
    pub id: FieldRef,
    pub access: u32,
    pub constant_value: EncodedValue,
}

#[derive(Debug)]
pub struct Method
{
    pub id: MethodRef,
    pub access: u32,
    pub code: Option<CodeItem>,
    pub method_idx: u32,
}


#[derive(Debug)]
pub struct DexClass
{
    /// Class name in class-name form, e.g. `com/example/Main`.
    pub name: String,
    pub access: u32,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    data_off: u32,
    static_values_off: u32,
}

impl DexClass
{
    /// Parses the class_data_item and static values for this class. Done
    /// lazily per class so that one malformed class body does not poison the
    /// rest of the file.
    pub fn parse_members(&self, dex: &DexFile) -> Result<(Vec<Field>, Vec<Method>), DexError>
    {
        if self.data_off == 0
        {
            return Ok((Vec::new(), Vec::new()));
        }

        let bytes = dex.raw;
        let mut ix = self.data_off as usize;
        let num_static = read_uleb128(bytes, &mut ix)?;
        let num_instance = read_uleb128(bytes, &mut ix)?;
        let num_direct = read_uleb128(bytes, &mut ix)?;
        let num_virtual = read_uleb128(bytes, &mut ix)?;

        let mut fields = Vec::with_capacity((num_static + num_instance) as usize);
        for num in [num_static, num_instance]
        {
            let mut field_idx = 0;
            for _ in 0..num
            {
                field_idx += read_uleb128(bytes, &mut ix)?;
                let access = read_uleb128(bytes, &mut ix)?;
                fields.push(Field {
                    id: dex.field_id(field_idx)?,
                    access,
                    constant_value: EncodedValue::None,
                });
            }
        }

        let mut methods = Vec::with_capacity((num_direct + num_virtual) as usize);
        for num in [num_direct, num_virtual]
        {
            let mut method_idx = 0;
            for _ in 0..num
            {
                method_idx += read_uleb128(bytes, &mut ix)?;
                let access = read_uleb128(bytes, &mut ix)?;
                let code_off = read_uleb128(bytes, &mut ix)?;
                let code = if code_off != 0 { Some(CodeItem::read(dex, code_off)?) } else { None };
                methods.push(Method { id: dex.method_id(method_idx)?, access, code, method_idx });
            }
        }

        if self.static_values_off != 0
        {
            let mut ix = self.static_values_off as usize;
            let values = read_encoded_array(dex, bytes, &mut ix)?;
            for (field, value) in fields.iter_mut().zip(values)
            {
                field.constant_value = value;
            }
        }

        Ok((fields, methods))
    }
}


#[derive(Debug)]
struct SizeOff
{
    size: u32,
    off: u32,
}

impl SizeOff
{
    fn read(bytes: &[u8], ix: &mut usize) -> Result<SizeOff, DexError>
    {
        Ok(SizeOff { size: read_u4(bytes, ix)?, off: read_u4(bytes, ix)? })
    }
}


/// The parsed dex container. Id tables are decoded eagerly; class bodies are
/// parsed on demand via [`DexClass::parse_members`], which reads back into
/// the raw bytes this struct borrows.
pub struct DexFile<'a>
{
    raw: &'a [u8],
    pub strings: Vec<DexString>,
    type_ids: Vec<u32>,
    protos: Vec<ProtoItem>,
    fields: Vec<FieldItem>,
    methods: Vec<MethodItem>,
    pub class_defs: Vec<DexClass>,
}

impl<'a> DexFile<'a>
{
    pub fn read(bytes: &'a [u8]) -> Result<DexFile<'a>, DexError>
    {
        if bytes.len() < 0x70
        {
            fail!("Not enough bytes for dex header");
        }

        let mut ix = 0;
        let magic = read_x(bytes, &mut ix, 8)?;
        if magic[0] != 0x64 || magic[1] != 0x65 || magic[2] != 0x78
        {
            fail!("Invalid magic value");
        }

        let _checksum = read_u4(bytes, &mut ix)?;
        let _signature = read_x(bytes, &mut ix, 20)?;
        let _file_size = read_u4(bytes, &mut ix)?;
        let header_size = read_u4(bytes, &mut ix)?;
        if header_size != 0x70
        {
            warn!("Unexpected header size {:#x}", header_size);
        }
        let endian_tag = read_u4(bytes, &mut ix)?;
        if endian_tag != ENDIAN_CONSTANT
        {
            warn!("Unexpected endianness tag {:#x}", endian_tag);
        }

        let _link = SizeOff::read(bytes, &mut ix)?;
        let _map_off = read_u4(bytes, &mut ix)?;
        let string_ids = SizeOff::read(bytes, &mut ix)?;
        let type_ids = SizeOff::read(bytes, &mut ix)?;
        let proto_ids = SizeOff::read(bytes, &mut ix)?;
        let field_ids = SizeOff::read(bytes, &mut ix)?;
        let method_ids = SizeOff::read(bytes, &mut ix)?;
        let class_defs = SizeOff::read(bytes, &mut ix)?;

        let mut dex = DexFile {
            raw: bytes,
            strings: Vec::with_capacity(string_ids.size as usize),
            type_ids: Vec::with_capacity(type_ids.size as usize),
            protos: Vec::with_capacity(proto_ids.size as usize),
            fields: Vec::with_capacity(field_ids.size as usize),
            methods: Vec::with_capacity(method_ids.size as usize),
            class_defs: Vec::new(),
        };

        ix = string_ids.off as usize;
        for _ in 0..string_ids.size
        {
            let mut data_off = read_u4(bytes, &mut ix)? as usize;
            dex.strings.push(DexString::read(bytes, &mut data_off)?);
        }

        ix = type_ids.off as usize;
        for _ in 0..type_ids.size
        {
            dex.type_ids.push(read_u4(bytes, &mut ix)?);
        }

        ix = proto_ids.off as usize;
        for _ in 0..proto_ids.size
        {
            let _shorty_idx = read_u4(bytes, &mut ix)?;
            let return_type_idx = read_u4(bytes, &mut ix)?;
            let mut params_off = read_u4(bytes, &mut ix)? as usize;
            let parameters = if params_off == 0
            {
                Vec::new()
            }
            else
            {
                let size = read_u4(bytes, &mut params_off)?;
                let mut v = Vec::with_capacity(size as usize);
                for _ in 0..size
                {
                    v.push(read_u2(bytes, &mut params_off)? as u32);
                }
                v
            };
            dex.protos.push(ProtoItem { return_type_idx, parameters });
        }

        ix = field_ids.off as usize;
        for _ in 0..field_ids.size
        {
            dex.fields.push(FieldItem {
                class_idx: read_u2(bytes, &mut ix)? as u32,
                type_idx: read_u2(bytes, &mut ix)? as u32,
                name_idx: read_u4(bytes, &mut ix)?,
            });
        }

        ix = method_ids.off as usize;
        for _ in 0..method_ids.size
        {
            dex.methods.push(MethodItem {
                class_idx: read_u2(bytes, &mut ix)? as u32,
                proto_idx: read_u2(bytes, &mut ix)? as u32,
                name_idx: read_u4(bytes, &mut ix)?,
            });
        }

        ix = class_defs.off as usize;
        for _ in 0..class_defs.size
        {
            let class_idx = read_u4(bytes, &mut ix)?;
            let access = read_u4(bytes, &mut ix)?;
            let superclass_idx = read_u4(bytes, &mut ix)?;
            let mut interfaces_off = read_u4(bytes, &mut ix)? as usize;
            let _source_file_idx = read_u4(bytes, &mut ix)?;
            let _annotations_off = read_u4(bytes, &mut ix)?;
            let data_off = read_u4(bytes, &mut ix)?;
            let static_values_off = read_u4(bytes, &mut ix)?;

            let interfaces = if interfaces_off == 0
            {
                Vec::new()
            }
            else
            {
                let size = read_u4(bytes, &mut interfaces_off)?;
                let mut v = Vec::with_capacity(size as usize);
                for _ in 0..size
                {
                    let idx = read_u2(bytes, &mut interfaces_off)? as u32;
                    v.push(dex.cls_type(idx)?.to_string());
                }
                v
            };

            let super_name = if superclass_idx == NO_INDEX
            {
                None
            }
            else
            {
                Some(dex.cls_type(superclass_idx)?.to_string())
            };

            let name = dex.cls_type(class_idx)?.to_string();
            dex.class_defs.push(DexClass {
                name,
                access,
                super_name,
                interfaces,
                data_off,
                static_values_off,
            });
        }

        Ok(dex)
    }

    pub fn string(&self, i: u32) -> Result<&DexString, DexError>
    {
        match self.strings.get(i as usize)
        {
            Some(s) => Ok(s),
            None => Err(DexError::new(&format!("String index {} out of range", i))),
        }
    }

    fn str_text(&self, i: u32) -> Result<&str, DexError>
    {
        match self.string(i)?.as_str()
        {
            Some(s) => Ok(s),
            None => Err(DexError::new("Undecodable string used as a name or descriptor")),
        }
    }

    /// Type descriptor, e.g. `I`, `[B` or `Ljava/lang/String;`.
    pub fn raw_type(&self, i: u32) -> Result<&str, DexError>
    {
        match self.type_ids.get(i as usize)
        {
            Some(&string_idx) => self.str_text(string_idx),
            None => Err(DexError::new(&format!("Type index {} out of range", i))),
        }
    }

    /// Class-name form of a type: `Lfoo/Bar;` becomes `foo/Bar`; array
    /// descriptors are returned unchanged.
    pub fn cls_type(&self, i: u32) -> Result<&str, DexError>
    {
        let desc = self.raw_type(i)?;
        if desc.starts_with('L')
        {
            Ok(&desc[1..desc.len() - 1])
        }
        else
        {
            Ok(desc)
        }
    }

    pub fn field_id(&self, i: u32) -> Result<FieldRef, DexError>
    {
        let item = match self.fields.get(i as usize)
        {
            Some(f) => f,
            None => return Err(DexError::new(&format!("Field index {} out of range", i))),
        };
        Ok(FieldRef {
            cname: self.cls_type(item.class_idx)?.to_string(),
            desc: self.raw_type(item.type_idx)?.to_string(),
            name: self.str_text(item.name_idx)?.to_string(),
        })
    }

    pub fn method_id(&self, i: u32) -> Result<MethodRef, DexError>
    {
        let item = match self.methods.get(i as usize)
        {
            Some(m) => m,
            None => return Err(DexError::new(&format!("Method index {} out of range", i))),
        };
        let proto = match self.protos.get(item.proto_idx as usize)
        {
            Some(p) => p,
            None => return Err(DexError::new("Proto index out of range")),
        };

        let return_type = self.raw_type(proto.return_type_idx)?.to_string();
        let mut param_types = Vec::with_capacity(proto.parameters.len());
        for &t in &proto.parameters
        {
            param_types.push(self.raw_type(t)?.to_string());
        }

        let mut desc = String::with_capacity(16);
        desc.push('(');
        for p in &param_types
        {
            desc.push_str(p);
        }
        desc.push(')');
        desc.push_str(&return_type);

        Ok(MethodRef {
            cname: self.cls_type(item.class_idx)?.to_string(),
            name: self.str_text(item.name_idx)?.to_string(),
            desc,
            return_type,
            param_types,
            cdesc: self.raw_type(item.class_idx)?.to_string(),
        })
    }
}


#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn dex_string_round_trip()
    {
        // uleb length 5, then "hello\0"
        let bytes = [5u8, b'h', b'e', b'l', b'l', b'o', 0];
        let mut ix = 0;
        let s = DexString::read(&bytes, &mut ix).unwrap();
        assert_eq!(s.as_str(), Some("hello"));
        assert_eq!(s.utf8_bytes(), b"hello");
        assert_eq!(ix, 7);
    }

    #[test]
    fn dex_string_embedded_nul()
    {
        // MUTF-8 encodes U+0000 as C0 80, so the terminator stays unambiguous
        let bytes = [1u8, 0xC0, 0x80, 0];
        let mut ix = 0;
        let s = DexString::read(&bytes, &mut ix).unwrap();
        assert_eq!(s.as_str(), Some("\0"));
        assert_eq!(s.utf8_bytes(), vec![0xC0, 0x80]);
    }

    #[test]
    fn dex_string_surrogate_pair()
    {
        // U+10400 as a CESU-8 surrogate pair
        let bytes = [2u8, 0xED, 0xA0, 0x81, 0xED, 0xB0, 0x80, 0];
        let mut ix = 0;
        let s = DexString::read(&bytes, &mut ix).unwrap();
        assert_eq!(s.as_str(), Some("\u{10400}"));
    }

    #[test]
    fn truncated_header_rejected()
    {
        assert!(DexFile::read(&[0x64, 0x65, 0x78]).is_err());
    }

    #[test]
    fn bad_magic_rejected()
    {
        let bytes = vec![0u8; 0x70];
        assert!(DexFile::read(&bytes).is_err());
    }
}
