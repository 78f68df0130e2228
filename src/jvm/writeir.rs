/* Method-level IR assembly: inference, blocks, redirects, flattening */

use std::mem::swap;

use rustc_hash::FxHashMap;

use crate::dex::dex_file::{CodeItem, DexFile, Method};
use crate::dex::instructions::InsKind;
use crate::jvm::cpool::ConstantPool;
use crate::jvm::inference::infer_types;
use crate::jvm::ir::{self, IrIns, LabelId, RegKey, INVALID_KEY};
use crate::jvm::irblock::translate_instruction;
use crate::jvm::scalar::Scalar;
use crate::jvm::writeclass::ClassError;
use crate::jvm::ACC_STATIC;
use crate::Options;

/// The translated body of one method on its way to becoming a Code
/// attribute. Branch targets refer to label positions, never to indices,
/// so passes are free to splice the instruction vector.
pub struct MethodIr {
    pub method_idx: u32,
    pub instructions: Vec<IrIns>,
    pub target_pred_counts: FxHashMap<LabelId, u32>,
    pub excepts: Vec<(LabelId, LabelId, LabelId, u16)>,

    pub initial_args: Vec<RegKey>,
    /// Set once registers are allocated.
    pub numregs: Option<u16>,
}

impl MethodIr {
    pub fn is_target(&self, target: Option<LabelId>) -> bool {
        match target {
            Some(target) => self.target_pred_counts.contains_key(&target),
            None => false,
        }
    }

    /// The shared splice primitive of every optimizer pass: indices mapped
    /// to replacement sequences, applied in one rebuild.
    pub fn replace_instrs(&mut self, mut replace: FxHashMap<usize, Vec<IrIns>>) {
        if replace.is_empty() {
            return;
        }
        let mut old_instrs = Vec::with_capacity(self.instructions.len());
        swap(&mut self.instructions, &mut old_instrs);

        for (i, instr) in old_instrs.into_iter().enumerate() {
            match replace.remove(&i) {
                Some(replacement) => self.instructions.extend(replacement),
                None => self.instructions.push(instr),
            }
        }
        assert!(replace.is_empty(), "replacement index out of range");
    }

    pub fn upper_bound(&self) -> usize {
        self.instructions.iter().map(|ins| ins.upper_bound()).sum()
    }
}

fn increment(map: &mut FxHashMap<LabelId, u32>, key: LabelId) {
    *map.entry(key).or_insert(0) += 1;
}

/// Runs inference and translates every reachable instruction, wiring up
/// exception ranges and handler redirects along the way.
pub fn build_method_ir(
    pool: &mut (dyn ConstantPool + 'static),
    dex: &DexFile,
    method: &Method,
    code: &CodeItem,
    opts: Options,
) -> Result<MethodIr, ClassError> {
    let instr_d: FxHashMap<u32, &_> = code.insns.iter().map(|i| (i.pos, i)).collect();

    let (types, all_handlers) = infer_types(method, dex, code, &instr_d)?;

    // A handler that does not begin with move-exception needs a redirect
    // stub that pops the caught exception before entering it. Handlers are
    // only reachable through reachable covered instructions; the rest must
    // not leave stubs jumping at labels that will never exist.
    let mut exception_redirects = std::collections::HashSet::new();
    for (pos, handlers) in &all_handlers {
        if !types.contains_key(pos) {
            continue;
        }
        for item in handlers {
            if instr_d[&item.target].kind != InsKind::MoveResult {
                exception_redirects.insert(item.target);
            }
        }
    }

    let mut instructions: Vec<IrIns> = Vec::with_capacity(code.insns.len() * 2);
    for instr in &code.insns {
        // unreachable instructions have no inferred types and are dropped
        if !types.contains_key(&instr.pos) {
            continue;
        }

        if exception_redirects.contains(&instr.pos) {
            // place the handler pop in front of the block when the previous
            // instruction cannot fall into it
            let ft = instructions.last().map_or(true, |ins| ins.fallsthrough());
            if !ft {
                instructions.push(ir::label(LabelId::EHandler(instr.pos)));
                instructions.push(ir::pop());
                exception_redirects.remove(&instr.pos);
            }
        }

        let (_, block) = translate_instruction(
            pool,
            method,
            opts,
            dex,
            instr,
            &types[&instr.pos],
            &instr_d,
            all_handlers.contains_key(&instr.pos),
        )?;
        instructions.extend(block);
    }

    // redirects that could not be placed inline go at the end, jumping back
    let mut redirects_needed: Vec<_> = exception_redirects.into_iter().collect();
    redirects_needed.sort_unstable();
    for target in redirects_needed {
        instructions.push(ir::label(LabelId::EHandler(target)));
        instructions.push(ir::pop());
        instructions.push(ir::goto(target));
    }

    let mut target_pred_counts = FxHashMap::default();
    let mut excepts = Vec::new();
    for instr in &code.insns {
        if !types.contains_key(&instr.pos) {
            continue;
        }
        if let Some(items) = all_handlers.get(&instr.pos) {
            let start = LabelId::EStart(instr.pos);
            let end = LabelId::EEnd(instr.pos);

            for item in items {
                let target_lbl = match instr_d[&item.target].kind {
                    InsKind::MoveResult => LabelId::DPos(item.target),
                    _ => LabelId::EHandler(item.target),
                };
                increment(&mut target_pred_counts, target_lbl);
                // catching Throwable can use the special index 0, saving a
                // pool entry or two
                let jctype = if item.ctype == "java/lang/Throwable" {
                    0
                } else {
                    pool.class(&item.ctype)?
                };
                excepts.push((start, end, target_lbl, jctype));
            }
        }
    }

    for instr in &instructions {
        for target in instr.targets() {
            increment(&mut target_pred_counts, LabelId::DPos(target));
        }
    }

    let is_static = method.access as u16 & ACC_STATIC != 0;
    let arg_descs = method.id.spaced_param_types(is_static);
    let regoff = code.nregs - arg_descs.len() as u16;
    let initial_args = arg_descs
        .iter()
        .enumerate()
        .map(|(i, optdesc)| match optdesc {
            Some(desc) => (regoff + i as u16, Scalar::from_desc(desc)),
            None => INVALID_KEY,
        })
        .collect();

    Ok(MethodIr {
        method_idx: method.method_idx,
        instructions,
        target_pred_counts,
        excepts,
        initial_args,
        numregs: None,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvm::ops::POP;

    #[test]
    fn replace_instrs_splices() {
        let mut ird = MethodIr {
            method_idx: 0,
            instructions: vec![ir::pop(), ir::pop2(), ir::dup()],
            target_pred_counts: FxHashMap::default(),
            excepts: Vec::new(),
            initial_args: Vec::new(),
            numregs: None,
        };
        let mut replace = FxHashMap::default();
        replace.insert(1usize, vec![ir::pop(), ir::pop()]);
        ird.replace_instrs(replace);
        let ops: Vec<u8> = ird.instructions.iter().map(|i| i.bytecode.as_ref().unwrap()[0]).collect();
        assert_eq!(ops, vec![POP, POP, POP, crate::jvm::ops::DUP]);
    }

    #[test]
    fn upper_bound_sums() {
        let ird = MethodIr {
            method_idx: 0,
            instructions: vec![ir::pop(), ir::goto(0), ir::if_ins(crate::jvm::ops::IFEQ, 0)],
            target_pred_counts: FxHashMap::default(),
            excepts: Vec::new(),
            initial_args: Vec::new(),
            numregs: None,
        };
        assert_eq!(ird.upper_bound(), 1 + 5 + 8);
    }
}
