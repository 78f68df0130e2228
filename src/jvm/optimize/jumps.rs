/* Branch widening fixpoint and final code emission */

use rustc_hash::FxHashMap;

use crate::jvm::ir::{IrIns, IrKind, LabelId};
use crate::jvm::ops::{invert_if, GOTO, GOTO_W, LOOKUPSWITCH, TABLESWITCH};
use crate::jvm::writeir::MethodIr;
use crate::jvm::writer::{op_i16, op_i32, Writer};

fn calc_min_positions(instrs: &[IrIns]) -> (Vec<u32>, u32) {
    let mut pos = 0;
    let positions = instrs
        .iter()
        .map(|ins| {
            let old = pos;
            pos += ins.min_len(old);
            old
        })
        .collect();
    (positions, pos)
}

struct PosInfo<'a>(&'a FxHashMap<LabelId, usize>, &'a [u32]);

impl<'a> PosInfo<'a> {
    fn getlbl(&self, lbl: LabelId) -> u32 {
        self.1[self.0[&lbl]]
    }

    fn get(&self, target: u32) -> u32 {
        self.getlbl(LabelId::DPos(target))
    }

    fn offset(&self, pos: u32, target: u32) -> i32 {
        self.get(target).wrapping_sub(pos) as i32
    }
}

fn widen_if_necessary(ins: &mut IrIns, pos: u32, info: PosInfo) -> bool {
    match &mut ins.kind {
        IrKind::Goto(data) => {
            !data.wide && {
                let offset = info.offset(pos, data.target);
                data.wide = offset != (offset as i16 as i32);
                data.wide
            }
        }
        IrKind::If(data) => {
            !data.wide && {
                let offset = info.offset(pos, data.target);
                data.wide = offset != (offset as i16 as i32);
                data.wide
            }
        }
        _ => false,
    }
}

/// Finds optimal jump widths: every branch starts narrow, and branches
/// whose offset cannot fit a signed 16-bit field are widened until nothing
/// changes. (Widening moves code, which can push other branches over the
/// edge, hence the iteration.)
pub fn widen_jumps(irdata: &mut MethodIr) {
    let lbl_to_vind: FxHashMap<LabelId, usize> = irdata
        .instructions
        .iter()
        .enumerate()
        .filter_map(|(i, ins)| ins.lbl().map(|l| (l, i)))
        .collect();

    loop {
        let mut done = true;
        let (mins, _) = calc_min_positions(&irdata.instructions);
        for (ins, pos) in irdata.instructions.iter_mut().zip(mins.iter()) {
            // deliberately not short-circuited
            done &= !widen_if_necessary(ins, *pos, PosInfo(&lbl_to_vind, &mins));
        }

        if done {
            break;
        }
    }
}

/// Serializes the IR into code bytes and the exception table. Every branch
/// target must resolve through a label by now.
pub fn assemble_code(irdata: MethodIr) -> (Vec<u8>, Vec<(u16, u16, u16, u16)>) {
    let lbl_to_vind: FxHashMap<LabelId, usize> = irdata
        .instructions
        .iter()
        .enumerate()
        .filter_map(|(i, ins)| ins.lbl().map(|l| (l, i)))
        .collect();
    let (positions, endpos) = calc_min_positions(&irdata.instructions);
    let info = PosInfo(&lbl_to_vind, &positions);

    let mut stream = Writer::with_capacity(endpos as usize);
    for (ins, pos) in irdata.instructions.iter().zip(positions.iter()) {
        debug_assert!(*pos == stream.0.len() as u32);
        match &ins.kind {
            IrKind::Goto(data) => {
                let offset = info.offset(*pos, data.target);
                stream.write(&if data.wide {
                    op_i32(GOTO_W, offset)
                } else {
                    op_i16(GOTO, offset as i16)
                });
            }
            IrKind::If(data) => {
                let offset = info.offset(*pos, data.target);
                if !data.wide {
                    stream.write(&op_i16(data.op, offset as i16));
                } else {
                    // Unlike goto, conditionals have no 32-bit form, so a
                    // wide one becomes an inverted test over a goto_w:
                    //
                    //   if x goto A            if !x goto B
                    //   B: ...          =>     goto_w A
                    //                          B: ...
                    //
                    // where the 8 bytes of the pair replace the original.
                    stream.write(&op_i16(invert_if(data.op), 8));
                    stream.write(&op_i32(GOTO_W, offset - 3));
                }
            }
            IrKind::Switch(data) => {
                let offset = info.offset(*pos, data.default);
                let pad = (!*pos) % 4;
                if data.is_table {
                    stream.u8(TABLESWITCH);
                    for _ in 0..pad {
                        stream.u8(0);
                    }
                    stream.i32(offset);
                    stream.i32(data.low);
                    stream.i32(data.high);
                    for k in data.low..=data.high {
                        let target = *data.jumps.get(&k).unwrap_or(&data.default);
                        stream.i32(info.offset(*pos, target));
                    }
                } else {
                    stream.u8(LOOKUPSWITCH);
                    for _ in 0..pad {
                        stream.u8(0);
                    }
                    stream.i32(offset);
                    stream.u32(data.jumps.len() as u32);
                    for (&k, &target) in &data.jumps {
                        stream.i32(k);
                        stream.i32(info.offset(*pos, target));
                    }
                }
            }
            _ => {
                stream.write(ins.bytecode.as_ref().unwrap());
            }
        }
    }
    debug_assert!(stream.0.len() as u32 == endpos);

    let mut excepts = Vec::with_capacity(irdata.excepts.len());
    for &(s, e, h, c) in &irdata.excepts {
        let start = info.getlbl(s);
        let end = info.getlbl(e);
        // ranges that optimization emptied out are dropped
        if start >= end {
            continue;
        }
        // Some VMs occasionally attribute an exception to the address of
        // the instruction before the faulting one, which would select the
        // wrong handler at a range boundary. Recording the range from one
        // IR instruction earlier absorbs that; it cannot create an overlap
        // because that instruction is a label whenever it matters.
        let sind = lbl_to_vind[&s].saturating_sub(1);
        let soff = positions[sind];
        excepts.push((soff as u16, end as u16, info.getlbl(h) as u16, c));
    }

    (stream.0, excepts)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvm::ir::{self, LabelId};
    use crate::jvm::ops::*;
    use crate::jvm::writeir::MethodIr;

    fn method_ir(instructions: Vec<IrIns>) -> MethodIr {
        MethodIr {
            method_idx: 0,
            instructions,
            target_pred_counts: FxHashMap::default(),
            excepts: Vec::new(),
            initial_args: Vec::new(),
            numregs: Some(0),
        }
    }

    fn filler(n: usize) -> Vec<IrIns> {
        (0..n).map(|_| ir::other(vec![NOP_BYTE])).collect()
    }

    const NOP_BYTE: u8 = 0;

    #[test]
    fn short_goto_stays_narrow() {
        let mut ird = method_ir(vec![
            ir::label(LabelId::DPos(0)),
            ir::goto(1),
            ir::label(LabelId::DPos(1)),
            ir::other(vec![RETURN]),
        ]);
        widen_jumps(&mut ird);
        let (code, _) = assemble_code(ird);
        assert_eq!(code, vec![GOTO, 0, 3, RETURN]);
    }

    #[test]
    fn long_goto_widens() {
        let mut instrs = vec![ir::label(LabelId::DPos(0)), ir::goto(1)];
        instrs.extend(filler(40000));
        instrs.push(ir::label(LabelId::DPos(1)));
        instrs.push(ir::other(vec![RETURN]));
        let mut ird = method_ir(instrs);
        widen_jumps(&mut ird);
        let (code, _) = assemble_code(ird);
        assert_eq!(code[0], GOTO_W);
        let off = i32::from_be_bytes([code[1], code[2], code[3], code[4]]);
        assert_eq!(off, 40005);
        assert_eq!(code.len(), 5 + 40000 + 1);
    }

    #[test]
    fn long_if_uses_trampoline() {
        let mut instrs = vec![ir::label(LabelId::DPos(0)), ir::if_ins(IFEQ, 1)];
        instrs.extend(filler(40000));
        instrs.push(ir::label(LabelId::DPos(1)));
        instrs.push(ir::other(vec![RETURN]));
        let mut ird = method_ir(instrs);
        widen_jumps(&mut ird);
        let (code, _) = assemble_code(ird);
        // ifne +8 over a goto_w to the far target
        assert_eq!(code[0], IFNE);
        assert_eq!(u16::from_be_bytes([code[1], code[2]]), 8);
        assert_eq!(code[3], GOTO_W);
        let off = i32::from_be_bytes([code[4], code[5], code[6], code[7]]);
        assert_eq!(off, 40008 - 3);
    }

    #[test]
    fn tableswitch_alignment_padding() {
        let jumps: std::collections::BTreeMap<i32, u32> = (0..3).map(|k| (k, 1)).collect();
        let mut ird = method_ir(vec![
            ir::label(LabelId::DPos(0)),
            ir::switch(1, jumps),
            ir::label(LabelId::DPos(1)),
            ir::other(vec![RETURN]),
        ]);
        widen_jumps(&mut ird);
        let (code, _) = assemble_code(ird);
        assert_eq!(code[0], TABLESWITCH);
        // switch at 0: three pad bytes align the default to offset 4
        assert_eq!(&code[1..4], &[0, 0, 0]);
        let default = i32::from_be_bytes([code[4], code[5], code[6], code[7]]);
        let low = i32::from_be_bytes([code[8], code[9], code[10], code[11]]);
        let high = i32::from_be_bytes([code[12], code[13], code[14], code[15]]);
        assert_eq!((low, high), (0, 2));
        assert_eq!(default as usize, code.len() - 1);
    }

    #[test]
    fn lookupswitch_sorted_pairs() {
        let jumps: std::collections::BTreeMap<i32, u32> =
            [(7, 1), (-3, 1)].into_iter().collect();
        let mut ird = method_ir(vec![
            ir::label(LabelId::DPos(0)),
            ir::switch(1, jumps),
            ir::label(LabelId::DPos(1)),
            ir::other(vec![RETURN]),
        ]);
        widen_jumps(&mut ird);
        let (code, _) = assemble_code(ird);
        assert_eq!(code[0], LOOKUPSWITCH);
        let npairs = i32::from_be_bytes([code[8], code[9], code[10], code[11]]);
        assert_eq!(npairs, 2);
        let first_key = i32::from_be_bytes([code[12], code[13], code[14], code[15]]);
        let second_key = i32::from_be_bytes([code[20], code[21], code[22], code[23]]);
        assert!(first_key < second_key);
    }

    #[test]
    fn empty_exception_range_dropped() {
        let mut ird = method_ir(vec![
            ir::label(LabelId::DPos(0)),
            ir::label(LabelId::EStart(0)),
            ir::label(LabelId::EEnd(0)),
            ir::label(LabelId::EHandler(0)),
            ir::other(vec![RETURN]),
        ]);
        ird.excepts =
            vec![(LabelId::EStart(0), LabelId::EEnd(0), LabelId::EHandler(0), 0)];
        widen_jumps(&mut ird);
        let (_, excepts) = assemble_code(ird);
        assert!(excepts.is_empty());
    }

    #[test]
    fn exception_range_starts_one_ir_early() {
        let mut ird = method_ir(vec![
            ir::label(LabelId::DPos(0)),
            ir::other(vec![NOP_BYTE]), // pos 0
            ir::label(LabelId::EStart(1)),
            ir::other(vec![NOP_BYTE, NOP_BYTE]), // pos 1, the guarded span
            ir::label(LabelId::EEnd(1)),
            ir::label(LabelId::DPos(2)),
            ir::other(vec![RETURN]),
        ]);
        ird.excepts = vec![(LabelId::EStart(1), LabelId::EEnd(1), LabelId::DPos(2), 0)];
        widen_jumps(&mut ird);
        let (_, excepts) = assemble_code(ird);
        // the recorded start backs up one IR instruction (the nop at 0)
        assert_eq!(excepts, vec![(0, 3, 3, 0)]);
    }
}
