//! Register type inference
//!
//! The translator needs to know, for every register at every program point,
//! whether it holds an int, float, long, double or reference, and for array
//! registers the element type, so that the correctly typed JVM instruction
//! can be chosen. Actual classes are irrelevant; the JVM verifier is not a
//! consumer of this output (no StackMapTable is emitted).
//!
//! ART's implicit casts narrow a register's type in the taken branch of an
//! `if-nez` after an `instance-of` instead of replacing it the way checkcast
//! does. There is no JVM equivalent short of whole-hierarchy knowledge, so
//! narrowed registers are marked tainted and every later object use of a
//! tainted register is preceded by an explicit checkcast to the expected
//! class. This can throw on bad interface casts where ART would not, but it
//! is the closest single-class approximation.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::dex::dex_file::{CatchItem, CodeItem, DexFile, Method};
use crate::dex::error::DexError;
use crate::dex::instructions::{DalvikIns, InsKind};
use crate::jvm::array::{self, ArrayType};
use crate::jvm::ops;
use crate::jvm::scalar::{self, Scalar};
use crate::jvm::treemap::RegMap;
use crate::jvm::ACC_STATIC;

/// Lattice element for one program point: scalar categories, array element
/// types and implicit-cast taint, each as a persistent sparse register map.
#[derive(Clone, Default)]
pub struct TypeInfo {
    pub prims: RegMap<Scalar>,
    pub arrs: RegMap<ArrayType>,
    pub tainted: RegMap<bool>,
}

impl PartialEq for TypeInfo {
    fn eq(&self, rhs: &Self) -> bool {
        self.prims.same(&rhs.prims) && self.arrs.same(&rhs.arrs) && self.tainted.same(&rhs.tainted)
    }
}

impl TypeInfo {
    fn move_reg(&mut self, src: u16, dest: u16, wide: bool) {
        if wide {
            self.move_reg(src + 1, dest + 1, false);
        }
        let t = self.prims.get(src);
        self.prims.set(dest, t);
        let t = self.arrs.get(src);
        self.arrs.set(dest, t);
        let t = self.tainted.get(src);
        self.tainted.set(dest, t);
    }

    fn assign(&mut self, reg: u16, st: Scalar) {
        self.assign_at(reg, st, array::INVALID);
    }

    fn assign_at(&mut self, reg: u16, st: Scalar, at: ArrayType) {
        self.assign_full(reg, st, at, false);
    }

    fn assign_full(&mut self, reg: u16, st: Scalar, at: ArrayType, taint: bool) {
        self.prims.set(reg, st);
        self.arrs.set(reg, at);
        self.tainted.set(reg, taint);
    }

    fn assign_wide(&mut self, reg: u16, st: Scalar) {
        self.assign_at(reg, st, array::INVALID);
        self.assign_at(reg + 1, scalar::INVALID, array::INVALID);
    }

    fn assign_from_desc(&mut self, reg: u16, desc: &str) {
        let st = Scalar::from_desc(desc);
        if st.is_wide() {
            self.assign_wide(reg, st);
        } else {
            self.assign_at(reg, st, ArrayType::from_desc(desc));
        }
    }

    fn merge(&mut self, rhs: &Self) -> bool {
        self.prims.merge(&rhs.prims, &|x, y| x & y, true)
            | self.arrs.merge(&rhs.arrs, &|x, y| x.merge(y), false)
            | self.tainted.merge(&rhs.tainted, &|x, y| x || y, false)
    }

    /// Initial state at offset zero, derived from the method's parameter
    /// descriptors. Parameters occupy the top of the register frame.
    fn from_params(method: &Method, nregs: u16) -> TypeInfo {
        let mut res = TypeInfo::default();
        let is_static = method.access as u16 & ACC_STATIC != 0;
        let full_ptypes = method.id.spaced_param_types(is_static);
        let offset = nregs - full_ptypes.len() as u16;

        for (i, desc) in full_ptypes.iter().enumerate() {
            if let Some(desc) = desc {
                res.assign_at(offset + i as u16, Scalar::from_desc(desc), ArrayType::from_desc(desc));
            }
        }
        res
    }
}

/// Per-position exception handlers, pruned to the instructions that can
/// actually raise and deduplicated per catch type.
pub type HandlerMap = FxHashMap<u32, Vec<CatchItem>>;

fn prune_handlers(instr_d: &FxHashMap<u32, &DalvikIns>, all_handlers: HandlerMap) -> HandlerMap {
    let mut result = HandlerMap::default();
    for (pos, handlers) in all_handlers {
        let instr = instr_d[&pos];
        if !instr.kind.can_pruned_throw() {
            continue;
        }
        // binary math only throws for integer division and remainder
        if instr.kind == InsKind::BinaryOp && !ops::math_throws(ops::binary(instr.opcode).op) {
            continue;
        }
        if instr.kind == InsKind::BinaryOpConst && !ops::math_throws(ops::binary_lit(instr.opcode)) {
            continue;
        }

        let mut seen = FxHashSet::default();
        let mut pruned = Vec::new();
        for citem in handlers {
            let is_catch_all = citem.ctype == "java/lang/Throwable";
            // with several handlers for one catch type only the first applies
            if seen.insert(citem.ctype.clone()) {
                pruned.push(citem);
            }
            // nothing after a catch-all handler is reachable
            if is_catch_all {
                break;
            }
        }

        if !pruned.is_empty() {
            result.insert(pos, pruned);
        }
    }
    result
}

fn visit_normal(dex: &DexFile, instr: &DalvikIns, cur: &mut TypeInfo) -> Result<(), DexError> {
    match instr.kind {
        InsKind::ConstString | InsKind::ConstClass | InsKind::NewInstance => {
            cur.assign(instr.ra, Scalar::OBJ);
        }
        InsKind::InstanceOf | InsKind::ArrayLen | InsKind::Cmp | InsKind::BinaryOpConst => {
            cur.assign(instr.ra, Scalar::INT);
        }
        InsKind::Move => {
            cur.move_reg(instr.rb, instr.ra, false);
        }
        InsKind::MoveWide => {
            cur.move_reg(instr.rb, instr.ra, true);
        }
        InsKind::MoveResult => {
            let desc = instr.prev_result.as_deref().unwrap_or("Ljava/lang/Throwable;");
            cur.assign_from_desc(instr.ra, desc);
        }
        InsKind::Const32 => {
            if instr.b == 0 {
                cur.assign_at(instr.ra, Scalar::ZERO, array::NULL);
            } else {
                cur.assign(instr.ra, Scalar::C32);
            }
        }
        InsKind::Const64 => {
            cur.assign_wide(instr.ra, Scalar::C64);
        }
        InsKind::CheckCast => {
            let at = ArrayType::from_desc(dex.raw_type(instr.b)?);
            let at = at.narrow(cur.arrs.get(instr.ra));
            cur.assign_at(instr.ra, Scalar::OBJ, at);
        }
        InsKind::NewArray => {
            cur.assign_at(instr.ra, Scalar::OBJ, ArrayType::from_desc(dex.raw_type(instr.c)?));
        }
        InsKind::ArrayGet => {
            let (st, at) = cur.arrs.get(instr.rb).elem_pair();
            cur.assign_at(instr.ra, st, at);
        }
        InsKind::InstanceGet => {
            let desc = dex.field_id(instr.c)?.desc;
            cur.assign_from_desc(instr.ra, &desc);
        }
        InsKind::StaticGet => {
            let desc = dex.field_id(instr.b)?.desc;
            cur.assign_from_desc(instr.ra, &desc);
        }
        InsKind::UnaryOp => {
            let st = ops::unary(instr.opcode).dest;
            if st.is_wide() {
                cur.assign_wide(instr.ra, st);
            } else {
                cur.assign(instr.ra, st);
            }
        }
        InsKind::BinaryOp => {
            let st = ops::binary(instr.opcode).src;
            if st.is_wide() {
                cur.assign_wide(instr.ra, st);
            } else {
                cur.assign(instr.ra, st);
            }
        }
        _ => {}
    }
    Ok(())
}

struct FlowState<'d> {
    types: FxHashMap<u32, TypeInfo>,
    dirty: FxHashSet<u32>,
    instr_d: &'d FxHashMap<u32, &'d DalvikIns>,
}

impl<'d> FlowState<'d> {
    fn do_merge(&mut self, pos: u32, new: &TypeInfo) {
        if !self.instr_d.contains_key(&pos) {
            return;
        }

        match self.types.get_mut(&pos) {
            Some(existing) => {
                if existing.merge(new) {
                    self.dirty.insert(pos);
                }
            }
            None => {
                self.types.insert(pos, new.clone());
                self.dirty.insert(pos);
            }
        }
    }
}

/// Runs the worklist fixpoint over a method body. Returns the type state at
/// every reachable instruction along with the pruned handler table used for
/// exception edges later.
pub fn infer_types(
    method: &Method,
    dex: &DexFile,
    code: &CodeItem,
    instr_d: &FxHashMap<u32, &DalvikIns>,
) -> Result<(FxHashMap<u32, TypeInfo>, HandlerMap), DexError> {
    let all_handlers = {
        let mut all_handlers: HandlerMap = FxHashMap::default();
        for tryi in &code.tries {
            for instr in &code.insns {
                if tryi.start < instr.pos2 && tryi.end > instr.pos {
                    let val = all_handlers.entry(instr.pos).or_default();
                    for c in &tryi.catches {
                        val.push(CatchItem { ctype: c.ctype.clone(), target: c.target });
                    }
                }
            }
        }
        prune_handlers(instr_d, all_handlers)
    };

    let mut state = FlowState {
        types: FxHashMap::default(),
        dirty: FxHashSet::default(),
        instr_d,
    };
    state.types.insert(0, TypeInfo::from_params(method, code.nregs));
    state.dirty.insert(0);

    // iterate until convergence; joins are monotone over a finite lattice
    while !state.dirty.is_empty() {
        for instr in &code.insns {
            if !state.dirty.remove(&instr.pos) {
                continue;
            }

            let cur = state.types[&instr.pos].clone();
            let mut after = cur.clone();
            visit_normal(dex, instr, &mut after)?;

            match instr.kind {
                InsKind::Goto => {
                    state.do_merge(instr.a, &after);
                }
                InsKind::If => {
                    state.do_merge(instr.c, &after);
                    state.do_merge(instr.pos2, &after);
                }
                InsKind::IfZ => {
                    let mut taken = after.clone();
                    if let Some((desc, regs)) = &instr.cast_hints {
                        let cast_at = ArrayType::from_desc(desc);
                        let mut narrowed = after.clone();
                        for &reg in regs {
                            let st = after.prims.get(reg);
                            let at = after.arrs.get(reg).narrow(cast_at);
                            narrowed.assign_full(reg, st, at, true);
                        }

                        // if-eqz falls through on nonzero (cast succeeded);
                        // if-nez branches on it
                        match instr.opcode {
                            0x38 => after = narrowed,
                            0x39 => taken = narrowed,
                            _ => unreachable!(),
                        }
                    }

                    state.do_merge(instr.b, &taken);
                    state.do_merge(instr.pos2, &after);
                }
                InsKind::Switch => {
                    for &(_, target) in instr.switch_targets.as_ref().unwrap() {
                        state.do_merge(target, &after);
                    }
                    state.do_merge(instr.pos2, &after);
                }
                InsKind::Return | InsKind::Throw => {}
                _ => {
                    state.do_merge(instr.pos2, &after);
                }
            }

            // handler edges receive the state before the faulting instruction
            if let Some(handlers) = all_handlers.get(&instr.pos) {
                for item in handlers {
                    state.do_merge(item.target, &cur);
                }
            }
        }
    }
    Ok((state.types, all_handlers))
}
