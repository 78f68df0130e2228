/* Stack-machine IR produced from dalvik instructions */

use std::collections::BTreeMap;

use crate::jvm::cpool::{ConstantPool, Entry};
use crate::jvm::consts;
use crate::jvm::ops::*;
use crate::jvm::scalar::{self, Scalar};
use crate::jvm::writer::op_u16;
use crate::jvm::ClassfileLimitExceeded;

/// Labels mark positions the emitter can branch to. `DPos` anchors the IR
/// block generated for the dalvik instruction at that offset; `EStart` and
/// `EEnd` bracket an exception range; `EHandler` heads the pop-redirect
/// stub synthesized for handlers that do not start with move-exception.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LabelId {
    DPos(u32),
    EStart(u32),
    EEnd(u32),
    EHandler(u32),
}

/// Ordered storage slot identity: dalvik register plus scalar category.
pub type RegKey = (u16, Scalar);
pub const INVALID_KEY: RegKey = (0, scalar::INVALID);

#[derive(Clone, Debug)]
pub struct RegAccessData {
    pub key: RegKey,
    pub store: bool,
}

impl RegAccessData {
    /// Bytecode for this access once a JVM local slot is known.
    pub fn calc_bytecode(&self, local: u16) -> Vec<u8> {
        let st = self.key.1;
        let opoff = if self.store { ISTORE - ILOAD } else { 0 };
        if local < 4 {
            vec![ILOAD_0 + opoff + local as u8 + st.ilfda() * 4]
        } else if local < 256 {
            vec![ILOAD + opoff + st.ilfda(), local as u8]
        } else {
            let mut bc = vec![WIDE, ILOAD + opoff + st.ilfda()];
            bc.extend_from_slice(&local.to_be_bytes());
            bc
        }
    }
}

#[derive(Clone, Debug)]
pub struct PrimConstData {
    pub st: Scalar,
    pub key: Entry,
}

impl PrimConstData {
    /// Retries the constant pool for a shorter encoding once pool state is
    /// final; used by the delayed-constants path for short methods.
    pub fn fix_with_pool(&self, pool: &mut dyn ConstantPool, bc: &mut Option<Vec<u8>>) {
        if bc.as_ref().map_or(0, |b| b.len()) <= 2 {
            return;
        }
        if let Some(newbc) = from_pool(pool, self.key.clone(), self.st.is_wide()) {
            *bc = Some(newbc);
        }
    }
}

fn from_pool(pool: &mut dyn ConstantPool, key: Entry, wide: bool) -> Option<Vec<u8>> {
    pool.try_get(key).map(|index| {
        if wide {
            op_u16(LDC2_W, index)
        } else if index >= 256 {
            op_u16(LDC_W, index)
        } else {
            vec![LDC, index as u8]
        }
    })
}

#[derive(Clone, Debug)]
pub struct GotoData {
    pub target: u32,
    pub wide: bool,
}

#[derive(Clone, Debug)]
pub struct IfData {
    pub op: u8,
    pub target: u32,
    pub wide: bool,
}

#[derive(Clone, Debug)]
pub struct SwitchData {
    pub default: u32,
    pub jumps: BTreeMap<i32, u32>,
    pub low: i32,
    pub high: i32,
    pub is_table: bool,
    pub nopad_size: u32,
}

#[derive(Clone, Debug)]
pub enum IrKind {
    Label(LabelId),
    RegAccess(RegAccessData),
    PrimConst(PrimConstData),
    OtherConst,
    Goto(GotoData),
    If(IfData),
    Switch(Box<SwitchData>),
    Other,
}

#[derive(Clone, Debug)]
pub struct IrIns {
    /// Final code bytes, if already known. Jumps and switches stay `None`
    /// until the widening fixpoint; register accesses until allocation;
    /// primitive constants until pool fixup when constants are delayed.
    pub bytecode: Option<Vec<u8>>,
    pub kind: IrKind,
}

impl IrIns {
    pub fn fallsthrough(&self) -> bool {
        match self.kind {
            IrKind::Goto(_) | IrKind::Switch(_) => false,
            IrKind::Other => {
                let op = self.bytecode.as_ref().unwrap()[0];
                !(op == ATHROW || (IRETURN..=RETURN).contains(&op))
            }
            _ => true,
        }
    }

    pub fn targets(&self) -> Vec<u32> {
        match &self.kind {
            IrKind::Goto(data) => vec![data.target],
            IrKind::If(data) => vec![data.target],
            IrKind::Switch(data) => {
                let mut res: Vec<_> = data.jumps.values().copied().collect();
                res.push(data.default);
                res
            }
            _ => Vec::new(),
        }
    }

    pub fn lbl(&self) -> Option<LabelId> {
        if let IrKind::Label(id) = self.kind {
            Some(id)
        } else {
            None
        }
    }

    pub fn is_jump(&self) -> bool {
        matches!(self.kind, IrKind::Goto(_) | IrKind::If(_) | IrKind::Switch(_))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, IrKind::PrimConst(_) | IrKind::OtherConst)
    }

    /// Width of this instruction assuming all currently narrow jumps stay
    /// narrow; switch width depends on its own alignment padding.
    pub fn min_len(&self, pos: u32) -> u32 {
        match &self.kind {
            IrKind::Goto(data) => {
                if data.wide {
                    5
                } else {
                    3
                }
            }
            IrKind::If(data) => {
                if data.wide {
                    8
                } else {
                    3
                }
            }
            IrKind::Switch(data) => {
                let pad = (!pos) % 4;
                pad + data.nopad_size
            }
            _ => self.bytecode.as_ref().unwrap().len() as u32,
        }
    }

    /// Upper bound on the emitted size, for the 64k-method preflight.
    pub fn upper_bound(&self) -> usize {
        match &self.bytecode {
            Some(bc) => bc.len(),
            None => match &self.kind {
                IrKind::Goto(_) => 5,
                IrKind::If(_) => 8,
                IrKind::Switch(data) => 3 + data.nopad_size as usize,
                _ => unreachable!("instruction without bytecode or jump data"),
            },
        }
    }
}

pub fn label(lbl: LabelId) -> IrIns {
    IrIns { bytecode: Some(Vec::new()), kind: IrKind::Label(lbl) }
}

pub fn reg_access(dreg: u16, st: Scalar, store: bool) -> IrIns {
    IrIns { bytecode: None, kind: IrKind::RegAccess(RegAccessData { key: (dreg, st), store }) }
}

/// Access to an already-placed JVM local, used for the parameter-swap
/// preamble in sorted register allocation.
pub fn raw_access(local: u16, st: Scalar, store: bool) -> IrIns {
    let data = RegAccessData { key: (0, st), store };
    IrIns { bytecode: Some(data.calc_bytecode(local)), kind: IrKind::RegAccess(data) }
}

/// A primitive constant. When `pool` is given, takes a pre-baked short
/// sequence or greedily claims a pool slot, failing on exhaustion; when
/// `None` (delayed constants), synthesizes pool-free bytecode to be fixed
/// up later.
pub fn prim_const(
    st: Scalar,
    val: u64,
    pool: Option<&mut dyn ConstantPool>,
) -> Result<IrIns, ClassfileLimitExceeded> {
    let val = consts::normalize(st, val);
    let key = match st {
        Scalar::INT => Entry::Integer(val as u32),
        Scalar::FLOAT => Entry::Float(val as u32),
        Scalar::LONG => Entry::Long(val),
        Scalar::DOUBLE => Entry::Double(val),
        _ => unreachable!("constants are primitive"),
    };

    let bytecode = match pool {
        Some(pool) => match consts::lookup(st, val) {
            Some(bc) => bc,
            None => from_pool(pool, key.clone(), st.is_wide()).ok_or(ClassfileLimitExceeded)?,
        },
        None => consts::calc(st, val),
    };

    Ok(IrIns { bytecode: Some(bytecode), kind: IrKind::PrimConst(PrimConstData { st, key }) })
}

pub fn other_const(bc: Vec<u8>) -> IrIns {
    IrIns { bytecode: Some(bc), kind: IrKind::OtherConst }
}

pub fn goto(target: u32) -> IrIns {
    IrIns { bytecode: None, kind: IrKind::Goto(GotoData { target, wide: false }) }
}

pub fn if_ins(op: u8, target: u32) -> IrIns {
    IrIns { bytecode: None, kind: IrKind::If(IfData { op, target, wide: false }) }
}

pub fn switch(default: u32, jumps: BTreeMap<i32, u32>) -> IrIns {
    assert!(!jumps.is_empty()); // an empty switch collapses to a goto instead
    // i64 arithmetic so the table count cannot overflow
    let low = *jumps.keys().next().unwrap() as i64;
    let high = *jumps.keys().next_back().unwrap() as i64;
    let table_count = high - low + 1;
    let table_size = 4 * (table_count + 1);
    let jump_size = 8 * (jumps.len() as i64);

    IrIns {
        bytecode: None,
        kind: IrKind::Switch(Box::new(SwitchData {
            default,
            low: low as i32,
            high: high as i32,
            is_table: jump_size > table_size,
            nopad_size: 9 + jump_size.min(table_size) as u32,
            jumps,
        })),
    }
}

pub fn other(bc: Vec<u8>) -> IrIns {
    IrIns { bytecode: Some(bc), kind: IrKind::Other }
}

pub fn pop() -> IrIns {
    other(vec![POP])
}
pub fn pop2() -> IrIns {
    other(vec![POP2])
}
pub fn dup() -> IrIns {
    other(vec![DUP])
}
pub fn dup2() -> IrIns {
    other(vec![DUP2])
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_access_forms() {
        let data = RegAccessData { key: (0, Scalar::INT), store: false };
        assert_eq!(data.calc_bytecode(0), vec![ILOAD_0]);
        assert_eq!(data.calc_bytecode(3), vec![ILOAD_0 + 3]);
        assert_eq!(data.calc_bytecode(4), vec![ILOAD, 4]);
        assert_eq!(data.calc_bytecode(255), vec![ILOAD, 255]);
        assert_eq!(data.calc_bytecode(256), vec![WIDE, ILOAD, 1, 0]);

        let data = RegAccessData { key: (0, Scalar::DOUBLE), store: true };
        assert_eq!(data.calc_bytecode(2), vec![DSTORE_0 + 2]);
        assert_eq!(data.calc_bytecode(9), vec![DSTORE, 9]);
    }

    #[test]
    fn switch_form_selection() {
        // dense keys favor tableswitch
        let jumps: BTreeMap<i32, u32> = (0..4).map(|k| (k, 100)).collect();
        let ins = switch(0, jumps);
        if let IrKind::Switch(data) = &ins.kind {
            assert!(data.is_table);
            assert_eq!(data.nopad_size, 9 + 4 * 5);
        } else {
            panic!("expected switch");
        }

        // sparse keys favor lookupswitch
        let jumps: BTreeMap<i32, u32> = [(0, 100u32), (1000, 100)].into_iter().collect();
        let ins = switch(0, jumps);
        if let IrKind::Switch(data) = &ins.kind {
            assert!(!data.is_table);
            assert_eq!(data.nopad_size, 9 + 16);
        } else {
            panic!("expected switch");
        }
    }

    #[test]
    fn fallthrough_classification() {
        assert!(!other(vec![ATHROW]).fallsthrough());
        assert!(!other(vec![RETURN]).fallsthrough());
        assert!(!other(vec![IRETURN]).fallsthrough());
        assert!(!goto(0).fallsthrough());
        assert!(other(vec![POP]).fallsthrough());
        assert!(if_ins(IFEQ, 0).fallsthrough());
    }

    #[test]
    fn jump_min_lengths() {
        assert_eq!(goto(0).min_len(0), 3);
        let mut g = goto(0);
        if let IrKind::Goto(data) = &mut g.kind {
            data.wide = true;
        }
        assert_eq!(g.min_len(0), 5);
        assert_eq!(if_ins(IFEQ, 0).min_len(0), 3);
    }
}
