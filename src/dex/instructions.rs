//! Decoded representation of the Dalvik instruction stream

use std::collections::{BTreeSet, HashSet};

use crate::dex::dex_file::DexFile;
use crate::dex::error::DexError;
use crate::dex::formats::{decode, InsFields};

/// Operation family of a decoded instruction. Several opcodes collapse into
/// one kind (e.g. all three widths of `move` or all six `if-test` forms);
/// the surviving distinctions are the ones the translator acts on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InsKind {
    Nop,
    Move,
    MoveWide,
    MoveResult,
    Return,
    Const32,
    Const64,
    ConstString,
    ConstClass,
    MonitorEnter,
    MonitorExit,
    CheckCast,
    InstanceOf,
    ArrayLen,
    NewInstance,
    NewArray,
    FilledNewArray,
    FillArrayData,
    Throw,
    Goto,
    Switch,
    Cmp,
    If,
    IfZ,
    ArrayGet,
    ArrayPut,
    InstanceGet,
    InstancePut,
    StaticGet,
    StaticPut,
    InvokeVirtual,
    InvokeSuper,
    InvokeDirect,
    InvokeStatic,
    InvokeInterface,
    UnaryOp,
    BinaryOp,
    BinaryOpConst,
}

impl InsKind {
    pub fn is_invoke(self) -> bool {
        matches!(
            self,
            InsKind::InvokeVirtual
                | InsKind::InvokeSuper
                | InsKind::InvokeDirect
                | InsKind::InvokeStatic
                | InsKind::InvokeInterface
        )
    }

    /// Whether this kind is recognized by inference as possibly raising a
    /// catchable exception. Linkage errors from constants and instance-of
    /// are deliberately ignored.
    pub fn can_pruned_throw(self) -> bool {
        matches!(
            self,
            InsKind::MonitorEnter
                | InsKind::MonitorExit
                | InsKind::CheckCast
                | InsKind::ArrayLen
                | InsKind::NewInstance
                | InsKind::NewArray
                | InsKind::FilledNewArray
                | InsKind::FillArrayData
                | InsKind::Throw
                | InsKind::ArrayGet
                | InsKind::ArrayPut
                | InsKind::InstanceGet
                | InsKind::InstancePut
                | InsKind::StaticGet
                | InsKind::StaticPut
                | InsKind::InvokeVirtual
                | InsKind::InvokeSuper
                | InsKind::InvokeDirect
                | InsKind::InvokeStatic
                | InsKind::InvokeInterface
                | InsKind::BinaryOp
                | InsKind::BinaryOpConst
        )
    }
}

fn op_to_kind(opcode: u8) -> InsKind {
    use InsKind::*;
    match opcode {
        0x00 => Nop,
        0x01..=0x03 => Move,
        0x04..=0x06 => MoveWide,
        0x07..=0x09 => Move,
        0x0a..=0x0d => MoveResult,
        0x0e..=0x11 => Return,
        0x12..=0x15 => Const32,
        0x16..=0x19 => Const64,
        0x1a..=0x1b => ConstString,
        0x1c => ConstClass,
        0x1d => MonitorEnter,
        0x1e => MonitorExit,
        0x1f => CheckCast,
        0x20 => InstanceOf,
        0x21 => ArrayLen,
        0x22 => NewInstance,
        0x23 => NewArray,
        0x24..=0x25 => FilledNewArray,
        0x26 => FillArrayData,
        0x27 => Throw,
        0x28..=0x2a => Goto,
        0x2b..=0x2c => Switch,
        0x2d..=0x31 => Cmp,
        0x32..=0x37 => If,
        0x38..=0x3d => IfZ,
        0x3e..=0x43 => Nop,
        0x44..=0x4a => ArrayGet,
        0x4b..=0x51 => ArrayPut,
        0x52..=0x58 => InstanceGet,
        0x59..=0x5f => InstancePut,
        0x60..=0x66 => StaticGet,
        0x67..=0x6d => StaticPut,
        0x6e => InvokeVirtual,
        0x6f => InvokeSuper,
        0x70 => InvokeDirect,
        0x71 => InvokeStatic,
        0x72 => InvokeInterface,
        0x73 => Nop,
        0x74 => InvokeVirtual,
        0x75 => InvokeSuper,
        0x76 => InvokeDirect,
        0x77 => InvokeStatic,
        0x78 => InvokeInterface,
        0x79..=0x7a => Nop,
        0x7b..=0x8f => UnaryOp,
        0x90..=0xcf => BinaryOp,
        0xd0..=0xe2 => BinaryOpConst,
        0xe3..=0xff => Nop,
    }
}

/// Raw element data of a fill-array-data payload, each element widened to
/// 64 bits without sign extension. Interpretation depends on the array type
/// at the use site.
#[derive(Debug, Clone)]
pub struct FillData {
    pub width: u8,
    pub values: Vec<u64>,
}

#[derive(Debug)]
pub struct DalvikIns {
    pub kind: InsKind,
    pub pos: u32,
    pub pos2: u32,
    pub opcode: u8,

    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub lit64: u64,
    pub regs: Option<Vec<u16>>,
    pub ra: u16,
    pub rb: u16,
    pub rc: u16,

    /// Return descriptor of the preceding invoke or filled-new-array, filled
    /// in for move-result instructions. A move-result that is itself a catch
    /// target receives `Ljava/lang/Throwable;` instead.
    pub prev_result: Option<String>,
    /// For the if-eqz/if-nez following an instance-of: the tested class
    /// descriptor and the registers narrowed by the taken branch.
    pub cast_hints: Option<(String, Vec<u16>)>,
    /// Case keys mapped to absolute code positions, attached to the switch
    /// instruction referencing the payload.
    pub switch_targets: Option<Vec<(i32, u32)>>,
    pub fill_data: Option<FillData>,
}

impl DalvikIns {
    fn from_fields(kind: InsKind, opcode: u8, pos: u32, pos2: u32, f: InsFields) -> DalvikIns {
        DalvikIns {
            kind,
            pos,
            pos2,
            opcode,
            a: f.a,
            b: f.b,
            c: f.c,
            lit64: f.lit64,
            regs: f.regs,
            ra: f.ra,
            rb: f.rb,
            rc: f.rc,
            prev_result: None,
            cast_hints: None,
            switch_targets: None,
            fill_data: None,
        }
    }
}

fn payload_u32(shorts: &[u16], unit: usize) -> u32 {
    (shorts[unit] as u32) | ((shorts[unit + 1] as u32) << 16)
}

fn payload_size(shorts: &[u16], pos: usize) -> Result<usize, DexError> {
    let word = shorts[pos];
    if pos + 2 > shorts.len() {
        fail!("Truncated payload header at pc {}", pos);
    }
    Ok(match word {
        0x0100 => {
            let count = shorts[pos + 1] as usize;
            2 + (1 + count) * 2
        }
        0x0200 => {
            let count = shorts[pos + 1] as usize;
            2 + count * 4
        }
        _ => {
            // 0x0300 fill-array-data
            if pos + 4 > shorts.len() {
                fail!("Truncated fill-array-data header at pc {}", pos);
            }
            let width = (shorts[pos + 1] % 16) as usize;
            let count = payload_u32(shorts, pos + 2) as usize;
            (count * width + 1) / 2 + 4
        }
    })
}

fn parse_switch_payload(shorts: &[u16], at: usize, base: u32) -> Result<Vec<(i32, u32)>, DexError> {
    if at + 2 > shorts.len() {
        fail!("Switch payload out of bounds at pc {}", at);
    }
    let ident = shorts[at];
    let count = shorts[at + 1] as usize;
    match ident {
        0x0100 => {
            if at + 4 + count * 2 > shorts.len() {
                fail!("Truncated packed-switch payload at pc {}", at);
            }
            let first_key = payload_u32(shorts, at + 2);
            Ok((0..count)
                .map(|i| {
                    let key = first_key.wrapping_add(i as u32) as i32;
                    let target = base.wrapping_add(payload_u32(shorts, at + 4 + i * 2));
                    (key, target)
                })
                .collect())
        }
        0x0200 => {
            if at + 2 + count * 4 > shorts.len() {
                fail!("Truncated sparse-switch payload at pc {}", at);
            }
            Ok((0..count)
                .map(|i| {
                    let key = payload_u32(shorts, at + 2 + i * 2) as i32;
                    let target = base.wrapping_add(payload_u32(shorts, at + 2 + count * 2 + i * 2));
                    (key, target)
                })
                .collect())
        }
        _ => fail!("Expected switch payload at pc {}, found {:#06x}", at, ident),
    }
}

fn parse_fill_payload(shorts: &[u16], at: usize) -> Result<FillData, DexError> {
    if at + 4 > shorts.len() {
        fail!("Fill-array payload out of bounds at pc {}", at);
    }
    if shorts[at] != 0x0300 {
        fail!("Expected fill-array-data payload at pc {}, found {:#06x}", at, shorts[at]);
    }
    let width = (shorts[at + 1] % 16) as usize;
    let count = payload_u32(shorts, at + 2) as usize;
    let data_start = at + 4;
    if data_start * 2 + count * width > shorts.len() * 2 {
        fail!("Truncated fill-array-data payload at pc {}", at);
    }

    let byte_at = |i: usize| -> u64 {
        let unit = shorts[data_start + i / 2];
        ((unit >> (8 * (i % 2))) & 0xFF) as u64
    };

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let mut val = 0u64;
        for j in 0..width {
            val |= byte_at(i * width + j) << (8 * j);
        }
        values.push(val);
    }
    Ok(FillData { width: width as u8, values })
}

/// Decodes a method's code-unit stream into instructions, then runs the two
/// derived-data passes: move-result descriptors and implicit-cast hints.
pub fn parse_bytecode(
    dex: &DexFile,
    shorts: &[u16],
    catch_addrs: &HashSet<u32>,
) -> Result<Vec<DalvikIns>, DexError> {
    let mut ops: Vec<DalvikIns> = Vec::with_capacity(shorts.len() / 2 + 1);
    let mut pos = 0;
    while pos < shorts.len() {
        let word = shorts[pos];
        let newpos = match word {
            0x0100 | 0x0200 | 0x0300 => {
                // Payload pseudo-instructions are skipped whole; their data is
                // parsed when the referencing instruction is seen below.
                let newpos = pos + payload_size(shorts, pos)?;
                ops.push(DalvikIns::from_fields(
                    InsKind::Nop,
                    0,
                    pos as u32,
                    newpos as u32,
                    InsFields::default(),
                ));
                newpos
            }
            _ => {
                let opcode = word as u8;
                let (newpos, fields) = decode(shorts, pos, opcode)?;
                ops.push(DalvikIns::from_fields(
                    op_to_kind(opcode),
                    opcode,
                    pos as u32,
                    newpos as u32,
                    fields,
                ));
                newpos
            }
        };
        pos = newpos;
    }

    // Attach switch and fill-array payload data to the referencing instruction
    for instr in ops.iter_mut() {
        match instr.kind {
            InsKind::Switch => {
                let data = parse_switch_payload(shorts, instr.b as usize, instr.pos)?;
                instr.switch_targets = Some(data);
            }
            InsKind::FillArrayData => {
                instr.fill_data = Some(parse_fill_payload(shorts, instr.b as usize)?);
            }
            _ => {}
        }
    }

    // Fill in descriptors for move-result
    {
        let mut prev: Option<String> = None;
        for instr in ops.iter_mut() {
            if instr.kind == InsKind::MoveResult {
                if catch_addrs.contains(&instr.pos) {
                    prev = Some("Ljava/lang/Throwable;".to_string());
                }
                // prev may still be None if the instruction is unreachable
                instr.prev_result = prev.clone();
            }

            prev = if instr.kind.is_invoke() {
                Some(dex.method_id(instr.a)?.return_type)
            } else if instr.kind == InsKind::FilledNewArray {
                Some(dex.raw_type(instr.a)?.to_string())
            } else {
                None
            };
        }
    }

    // Fill in implicit-cast hints for the if-eqz/if-nez after an instance-of
    {
        let mut prev2 = (InsKind::Nop, 0u16, 0u16, 0u32);
        let mut prev = (InsKind::Nop, 0u16, 0u16, 0u32);
        for instr in ops.iter_mut() {
            if instr.opcode == 0x38 || instr.opcode == 0x39 {
                if prev.0 == InsKind::InstanceOf {
                    let desc = dex.raw_type(prev.3)?.to_string();
                    let mut regs = BTreeSet::new();
                    regs.insert(prev.2);
                    // a move alias of the tested register narrows too
                    if prev2.0 == InsKind::Move && prev2.1 == prev.2 {
                        regs.insert(prev2.2);
                    }
                    regs.remove(&prev.1);
                    instr.cast_hints = Some((desc, regs.into_iter().collect()));
                }
            }

            prev2 = prev;
            prev = (instr.kind, instr.ra, instr.rb, instr.c);
        }
    }

    Ok(ops)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_switch_payload() {
        // switch at base 0, payload at 4: keys 10,11 -> base-relative 8, 16
        let shorts = [
            0x002b, 0x0004, 0x0000, 0x0000, // packed-switch v0, @4 (+ pad)
            0x0100, 0x0002, 0x000a, 0x0000, 0x0008, 0x0000, 0x0010, 0x0000,
        ];
        let cases = parse_switch_payload(&shorts, 4, 0).unwrap();
        assert_eq!(cases, vec![(10, 8), (11, 16)]);
    }

    #[test]
    fn sparse_switch_payload() {
        let shorts = [
            0x0200, 0x0002, // ident, count
            0xfff6, 0xffff, 0x0064, 0x0000, // keys -10, 100
            0x0020, 0x0000, 0x0030, 0x0000, // rel targets 0x20, 0x30
        ];
        let cases = parse_switch_payload(&shorts, 0, 100).unwrap();
        assert_eq!(cases, vec![(-10, 132), (100, 148)]);
    }

    #[test]
    fn fill_array_bytes() {
        // width 1, count 3, data 01 02 03
        let shorts = [0x0300, 0x0001, 0x0003, 0x0000, 0x0201, 0x0003];
        let data = parse_fill_payload(&shorts, 0).unwrap();
        assert_eq!(data.width, 1);
        assert_eq!(data.values, vec![1, 2, 3]);
    }

    #[test]
    fn fill_array_longs() {
        let shorts = [
            0x0300, 0x0008, 0x0001, 0x0000, // width 8, count 1
            0xcdef, 0x89ab, 0x4567, 0x0123,
        ];
        let data = parse_fill_payload(&shorts, 0).unwrap();
        assert_eq!(data.values, vec![0x0123_4567_89ab_cdef]);
    }

    #[test]
    fn kind_ranges() {
        assert_eq!(op_to_kind(0x00), InsKind::Nop);
        assert_eq!(op_to_kind(0x0a), InsKind::MoveResult);
        assert_eq!(op_to_kind(0x1f), InsKind::CheckCast);
        assert_eq!(op_to_kind(0x44), InsKind::ArrayGet);
        assert_eq!(op_to_kind(0x6e), InsKind::InvokeVirtual);
        assert_eq!(op_to_kind(0x74), InsKind::InvokeVirtual);
        assert_eq!(op_to_kind(0x8f), InsKind::UnaryOp);
        assert_eq!(op_to_kind(0xcf), InsKind::BinaryOp);
        assert_eq!(op_to_kind(0xe2), InsKind::BinaryOpConst);
        assert_eq!(op_to_kind(0xff), InsKind::Nop);
    }
}
