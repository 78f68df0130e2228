/* Translation of one dalvik instruction into an IR block */

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::dex::dex_file::{DexFile, Method};
use crate::dex::instructions::{DalvikIns, InsKind};
use crate::jvm::array::{self, ArrayType, ElemBase};
use crate::jvm::cpool::ConstantPool;
use crate::jvm::inference::TypeInfo;
use crate::jvm::ir::{self, IrIns, IrKind, LabelId};
use crate::jvm::ops::*;
use crate::jvm::optimize::stack::DupLadder;
use crate::jvm::scalar::Scalar;
use crate::jvm::writeclass::ClassError;
use crate::jvm::writer::op_u16;
use crate::Options;

struct BlockBuilder<'b, 'c> {
    pos: u32,
    pool: &'b mut (dyn ConstantPool + 'b),
    type_info: &'c TypeInfo,
    instructions: Vec<IrIns>,
    delay_consts: bool,
}

impl<'b, 'c> BlockBuilder<'b, 'c> {
    fn add(&mut self, ins: IrIns) {
        self.instructions.push(ins);
    }

    fn other(&mut self, bc: Vec<u8>) {
        self.add(ir::other(bc));
    }

    fn u8(&mut self, op: u8) {
        self.other(vec![op]);
    }

    fn u8u8(&mut self, op: u8, x: u8) {
        self.other(vec![op, x]);
    }

    fn u8u16(&mut self, op: u8, x: u16) {
        self.other(op_u16(op, x));
    }

    fn load(&mut self, reg: u16, st: Scalar) -> Result<(), ClassError> {
        // a register known to hold zero/null loads as a fresh constant
        if self.type_info.arrs.get(reg) == array::NULL {
            self.const_(0, st)
        } else {
            self.add(ir::reg_access(reg, st, false));
            Ok(())
        }
    }

    /// Object load with the taint contract: a tainted register gets an
    /// explicit checkcast to the class the context expects.
    fn load_as(&mut self, reg: u16, cname: &str) -> Result<(), ClassError> {
        self.load(reg, Scalar::OBJ)?;
        if self.type_info.arrs.get(reg) != array::NULL
            && self.type_info.tainted.get(reg)
            && cname != "java/lang/Object"
        {
            let ind = self.pool.class(cname)?;
            self.u8u16(CHECKCAST, ind);
        }
        Ok(())
    }

    fn load_desc(&mut self, reg: u16, desc: &str) -> Result<(), ClassError> {
        let st = Scalar::from_desc(desc);
        if st == Scalar::OBJ {
            let cname = if desc.starts_with('L') { &desc[1..desc.len() - 1] } else { desc };
            self.load_as(reg, cname)
        } else {
            self.load(reg, st)
        }
    }

    fn load_as_array(&mut self, reg: u16) -> Result<(), ClassError> {
        let at = self.type_info.arrs.get(reg);
        if at == array::NULL {
            self.const_null();
            return Ok(());
        }
        self.add(ir::reg_access(reg, Scalar::OBJ, false));
        if self.type_info.tainted.get(reg) {
            let ind = if at == array::INVALID {
                // must be some object array, so Object[] is the safe cast
                self.pool.class("[Ljava/lang/Object;")?
            } else {
                // will throw if the actual type is boolean[] rather than
                // byte[], but there is no way to distinguish them here
                self.pool.class(&at.to_desc())?
            };
            self.u8u16(CHECKCAST, ind);
        }
        Ok(())
    }

    fn store(&mut self, reg: u16, st: Scalar) {
        self.add(ir::reg_access(reg, st, true));
    }

    fn const_(&mut self, val: u64, st: Scalar) -> Result<(), ClassError> {
        if st == Scalar::OBJ {
            self.const_null();
            return Ok(());
        }
        let ins = if self.delay_consts {
            ir::prim_const(st, val, None)?
        } else {
            ir::prim_const(st, val, Some(&mut *self.pool))?
        };
        self.add(ins);
        Ok(())
    }

    fn const_null(&mut self) {
        self.add(ir::other_const(vec![ACONST_NULL]));
    }

    fn ldc(&mut self, ind: u16) {
        self.add(ir::other_const(if ind < 256 {
            vec![LDC, ind as u8]
        } else {
            op_u16(LDC_W, ind)
        }));
    }

    fn new_array(&mut self, desc: &str) -> Result<(), ClassError> {
        match desc {
            "[Z" => self.u8u8(NEWARRAY, 4),
            "[C" => self.u8u8(NEWARRAY, 5),
            "[F" => self.u8u8(NEWARRAY, 6),
            "[D" => self.u8u8(NEWARRAY, 7),
            "[B" => self.u8u8(NEWARRAY, 8),
            "[S" => self.u8u8(NEWARRAY, 9),
            "[I" => self.u8u8(NEWARRAY, 10),
            "[J" => self.u8u8(NEWARRAY, 11),
            _ => {
                // either a multidimensional or an object array descriptor
                let desc = &desc[1..];
                let cname = if desc.starts_with('L') { &desc[1..desc.len() - 1] } else { desc };
                let ind = self.pool.class(cname)?;
                self.u8u16(ANEWARRAY, ind);
            }
        }
        Ok(())
    }

    fn goto(&mut self, target: u32) {
        self.add(ir::goto(target));
    }

    /// Brackets the throwing span of this block with exception-range labels.
    /// Only `Other` instructions can raise, so the labels hug the first and
    /// last of those.
    fn add_except_labels(&mut self) {
        let (mut s, mut e) = (0, self.instructions.len());
        while s < e {
            if matches!(self.instructions[s].kind, IrKind::Other) {
                break;
            }
            s += 1;
        }
        while s < e {
            if matches!(self.instructions[e - 1].kind, IrKind::Other) {
                break;
            }
            e -= 1;
        }
        assert!(s < e, "throwing block contains no throwing instruction");
        self.instructions.insert(s, ir::label(LabelId::EStart(self.pos)));
        self.instructions.insert(e + 1, ir::label(LabelId::EEnd(self.pos)));
    }
}

/// Produces the IR block for one reachable dalvik instruction, starting
/// with its position label.
#[allow(clippy::too_many_arguments)]
pub fn translate_instruction(
    pool: &mut (dyn ConstantPool + 'static),
    method: &Method,
    opts: Options,
    dex: &DexFile,
    instr: &DalvikIns,
    type_info: &TypeInfo,
    instr_d: &FxHashMap<u32, &DalvikIns>,
    can_throw: bool,
) -> Result<(u32, Vec<IrIns>), ClassError> {
    let mut block = BlockBuilder {
        pos: instr.pos,
        pool,
        type_info,
        instructions: vec![ir::label(LabelId::DPos(instr.pos))],
        delay_consts: opts.delay_consts,
    };

    match instr.kind {
        InsKind::Nop => {}
        InsKind::Move => {
            for st in [Scalar::INT, Scalar::OBJ, Scalar::FLOAT] {
                if type_info.prims.get(instr.rb).includes(st) {
                    block.load(instr.rb, st)?;
                    block.store(instr.ra, st);
                }
            }
        }
        InsKind::MoveWide => {
            for st in [Scalar::LONG, Scalar::DOUBLE] {
                if type_info.prims.get(instr.rb).includes(st) {
                    block.load(instr.rb, st)?;
                    block.store(instr.ra, st);
                }
            }
        }
        InsKind::MoveResult => {
            let desc = instr.prev_result.as_deref().unwrap_or("Ljava/lang/Throwable;");
            block.store(instr.ra, Scalar::from_desc(desc));
        }
        InsKind::Return => {
            if method.id.return_type == "V" {
                block.u8(RETURN);
            } else {
                let st = Scalar::from_desc(&method.id.return_type);
                block.load_desc(instr.ra, &method.id.return_type)?;
                block.u8(IRETURN + st.ilfda());
            }
        }
        InsKind::Const32 => {
            let val = instr.b as u64;
            block.const_(val, Scalar::INT)?;
            block.store(instr.ra, Scalar::INT);
            block.const_(val, Scalar::FLOAT)?;
            block.store(instr.ra, Scalar::FLOAT);
            if val == 0 {
                block.const_(val, Scalar::OBJ)?;
                block.store(instr.ra, Scalar::OBJ);
            }
        }
        InsKind::Const64 => {
            let val = instr.lit64;
            block.const_(val, Scalar::LONG)?;
            block.store(instr.ra, Scalar::LONG);
            block.const_(val, Scalar::DOUBLE)?;
            block.store(instr.ra, Scalar::DOUBLE);
        }
        InsKind::ConstString => {
            let ind = block.pool.string(&dex.string(instr.b)?.utf8_bytes())?;
            block.ldc(ind);
            block.store(instr.ra, Scalar::OBJ);
        }
        InsKind::ConstClass => {
            // the JVM accepts the raw descriptor too, but class-name form is cleaner
            let ind = block.pool.class(dex.cls_type(instr.b)?)?;
            block.ldc(ind);
            block.store(instr.ra, Scalar::OBJ);
        }
        InsKind::MonitorEnter => {
            block.load(instr.ra, Scalar::OBJ)?;
            block.u8(MONITORENTER);
        }
        InsKind::MonitorExit => {
            block.load(instr.ra, Scalar::OBJ)?;
            block.u8(MONITOREXIT);
        }
        InsKind::CheckCast => {
            block.load(instr.ra, Scalar::OBJ)?;
            let ind = block.pool.class(dex.cls_type(instr.b)?)?;
            block.u8u16(CHECKCAST, ind);
            block.store(instr.ra, Scalar::OBJ);
        }
        InsKind::InstanceOf => {
            block.load(instr.rb, Scalar::OBJ)?;
            let ind = block.pool.class(dex.cls_type(instr.c)?)?;
            block.u8u16(INSTANCEOF, ind);
            block.store(instr.ra, Scalar::INT);
        }
        InsKind::ArrayLen => {
            block.load_as_array(instr.rb)?;
            block.u8(ARRAYLENGTH);
            block.store(instr.ra, Scalar::INT);
        }
        InsKind::NewInstance => {
            let ind = block.pool.class(dex.cls_type(instr.b)?)?;
            block.u8u16(NEW, ind);
            block.store(instr.ra, Scalar::OBJ);
        }
        InsKind::NewArray => {
            block.load(instr.rb, Scalar::INT)?;
            block.new_array(dex.raw_type(instr.c)?)?;
            block.store(instr.ra, Scalar::OBJ);
        }
        InsKind::FilledNewArray => {
            let regs = instr.regs.as_ref().unwrap();
            let desc = dex.raw_type(instr.a)?;
            block.const_(regs.len() as u64, Scalar::INT)?;
            block.new_array(desc)?;
            let at = ArrayType::from_desc(desc);
            let (st, _) = at.elem_pair();
            let op = array_store_op(at);

            let mustpop = instr_d.get(&instr.pos2).map_or(true, |i| i.kind != InsKind::MoveResult);
            let mut dups = DupLadder::new(regs.len(), if mustpop { 0 } else { 1 });
            for (i, &reg) in regs.iter().enumerate() {
                block.instructions.extend(dups.next().unwrap());
                block.const_(i as u64, Scalar::INT)?;
                block.load(reg, st)?;
                block.u8(op);
            }
            // the ladder's final step pops the leftover reference if needed
            block.instructions.extend(dups.next().unwrap());
        }
        InsKind::FillArrayData => {
            let data = instr.fill_data.as_ref().unwrap();
            let at = type_info.arrs.get(instr.ra);
            block.load_as_array(instr.ra)?;

            if at == array::NULL {
                block.u8(ATHROW);
            } else if data.values.is_empty() {
                // fill-array-data on a null array throws even with no data,
                // so the null check must still happen
                block.u8(ARRAYLENGTH);
                block.u8(POP);
            } else {
                let (st, _) = at.elem_pair();
                let op = array_store_op(at);
                let base = match at {
                    ArrayType::Array(1, base) => base,
                    _ => unreachable!("fill-array-data on non-primitive array"),
                };

                let mut dups = DupLadder::new(data.values.len(), 0);
                for (i, &raw) in data.values.iter().enumerate() {
                    let val = match base {
                        ElemBase::B => raw as u8 as i8 as i32 as u32 as u64,
                        ElemBase::S => raw as u16 as i16 as i32 as u32 as u64,
                        ElemBase::C => raw as u16 as u64,
                        ElemBase::I | ElemBase::F => raw as u32 as u64,
                        ElemBase::J | ElemBase::D => raw,
                    };

                    block.instructions.extend(dups.next().unwrap());
                    block.const_(i as u64, Scalar::INT)?;
                    block.const_(val, st)?;
                    block.u8(op);
                }
                debug_assert!(dups.next().unwrap().is_empty());
            }
        }
        InsKind::Throw => {
            block.load_as(instr.ra, "java/lang/Throwable")?;
            block.u8(ATHROW);
        }
        InsKind::Goto => {
            block.goto(instr.a);
        }
        InsKind::Switch => {
            block.load(instr.ra, Scalar::INT)?;
            let default = instr.pos2;
            let mut jumps = BTreeMap::new();
            for &(key, target) in instr.switch_targets.as_ref().unwrap() {
                // cases that just fall into the default add nothing
                if target != default {
                    jumps.insert(key, target);
                }
            }
            if jumps.is_empty() {
                block.goto(default);
            } else {
                block.add(ir::switch(default, jumps));
            }
        }
        InsKind::Cmp => {
            let kind = instr.opcode as usize - 0x2d;
            let op = [FCMPL, FCMPG, DCMPL, DCMPG, LCMP][kind];
            let st = [Scalar::FLOAT, Scalar::FLOAT, Scalar::DOUBLE, Scalar::DOUBLE, Scalar::LONG][kind];
            block.load(instr.rb, st)?;
            block.load(instr.rc, st)?;
            block.u8(op);
            block.store(instr.ra, Scalar::INT);
        }
        InsKind::If => {
            let kind = instr.opcode as usize - 0x32;
            let st = type_info.prims.get(instr.ra) & type_info.prims.get(instr.rb);
            let op = if st.includes(Scalar::INT) {
                block.load(instr.ra, Scalar::INT)?;
                block.load(instr.rb, Scalar::INT)?;
                [IF_ICMPEQ, IF_ICMPNE, IF_ICMPLT, IF_ICMPGE, IF_ICMPGT, IF_ICMPLE][kind]
            } else {
                block.load(instr.ra, Scalar::OBJ)?;
                block.load(instr.rb, Scalar::OBJ)?;
                [IF_ACMPEQ, IF_ACMPNE][kind]
            };
            block.add(ir::if_ins(op, instr.c));
        }
        InsKind::IfZ => {
            let kind = instr.opcode as usize - 0x38;
            let st = type_info.prims.get(instr.ra);
            let op = if st.includes(Scalar::INT) {
                block.load(instr.ra, Scalar::INT)?;
                [IFEQ, IFNE, IFLT, IFGE, IFGT, IFLE][kind]
            } else {
                block.load(instr.ra, Scalar::OBJ)?;
                [IFNULL, IFNONNULL][kind]
            };
            block.add(ir::if_ins(op, instr.b));
        }
        InsKind::ArrayGet => {
            let at = type_info.arrs.get(instr.rb);
            if at == array::NULL {
                // this always NPEs at runtime; match that with a thrown null
                block.const_null();
                block.u8(ATHROW);
            } else {
                block.load_as_array(instr.rb)?;
                block.load(instr.rc, Scalar::INT)?;
                block.u8(array_load_op(at));
                block.store(instr.ra, at.elem_pair().0);
            }
        }
        InsKind::ArrayPut => {
            let at = type_info.arrs.get(instr.rb);
            if at == array::NULL {
                block.const_null();
                block.u8(ATHROW);
            } else {
                block.load_as_array(instr.rb)?;
                block.load(instr.rc, Scalar::INT)?;
                block.load(instr.ra, at.elem_pair().0)?;
                block.u8(array_store_op(at));
            }
        }
        InsKind::InstanceGet => {
            let field_id = dex.field_id(instr.c)?;
            block.load_as(instr.rb, &field_id.cname)?;
            let ind = block.pool.field(&field_id)?;
            block.u8u16(GETFIELD, ind);
            block.store(instr.ra, Scalar::from_desc(&field_id.desc));
        }
        InsKind::InstancePut => {
            let field_id = dex.field_id(instr.c)?;
            block.load_as(instr.rb, &field_id.cname)?;
            block.load_desc(instr.ra, &field_id.desc)?;
            let ind = block.pool.field(&field_id)?;
            block.u8u16(PUTFIELD, ind);
        }
        InsKind::StaticGet => {
            let field_id = dex.field_id(instr.b)?;
            let ind = block.pool.field(&field_id)?;
            block.u8u16(GETSTATIC, ind);
            block.store(instr.ra, Scalar::from_desc(&field_id.desc));
        }
        InsKind::StaticPut => {
            let field_id = dex.field_id(instr.b)?;
            block.load_desc(instr.ra, &field_id.desc)?;
            let ind = block.pool.field(&field_id)?;
            block.u8u16(PUTSTATIC, ind);
        }
        InsKind::InvokeVirtual
        | InsKind::InvokeSuper
        | InsKind::InvokeDirect
        | InsKind::InvokeStatic
        | InsKind::InvokeInterface => {
            let is_static = instr.kind == InsKind::InvokeStatic;
            let called_id = dex.method_id(instr.a)?;
            let regs = instr.regs.as_ref().unwrap();

            for (reg, desc) in regs.iter().zip(called_id.spaced_param_types(is_static)) {
                if let Some(desc) = desc {
                    // None slots are the high halves of wide arguments
                    block.load_desc(*reg, &desc)?;
                }
            }

            let op = match instr.kind {
                InsKind::InvokeVirtual => INVOKEVIRTUAL,
                InsKind::InvokeSuper => INVOKESPECIAL,
                InsKind::InvokeDirect => INVOKESPECIAL,
                InsKind::InvokeStatic => INVOKESTATIC,
                InsKind::InvokeInterface => INVOKEINTERFACE,
                _ => unreachable!(),
            };

            if instr.kind == InsKind::InvokeInterface {
                let ind = block.pool.imethod(&called_id)?;
                let mut bc = op_u16(op, ind);
                bc.push(regs.len() as u8);
                bc.push(0);
                block.other(bc);
            } else {
                let ind = block.pool.method(&called_id)?;
                block.u8u16(op, ind);
            }

            // an unconsumed result must be popped to keep the stack balanced
            let consumed =
                instr_d.get(&instr.pos2).map_or(false, |i| i.kind == InsKind::MoveResult);
            if !consumed && called_id.return_type != "V" {
                block.u8(if Scalar::from_desc(&called_id.return_type).is_wide() {
                    POP2
                } else {
                    POP
                });
            }
        }
        InsKind::UnaryOp => {
            let data = unary(instr.opcode);
            block.load(instr.rb, data.src)?;
            // dalvik not has no JVM equivalent, so lower it as x ^ -1
            if data.op == IXOR {
                block.u8(ICONST_M1);
            } else if data.op == LXOR {
                block.u8(ICONST_M1);
                block.u8(I2L);
            }
            block.u8(data.op);
            block.store(instr.ra, data.dest);
        }
        InsKind::BinaryOp => {
            let data = binary(instr.opcode);
            if instr.opcode >= 0xb0 {
                // 2addr form
                block.load(instr.ra, data.src)?;
                block.load(instr.rb, data.src2)?;
            } else {
                block.load(instr.rb, data.src)?;
                block.load(instr.rc, data.src2)?;
            }
            block.u8(data.op);
            block.store(instr.ra, data.src);
        }
        InsKind::BinaryOpConst => {
            let op = binary_lit(instr.opcode);
            if op == ISUB {
                // rsub has the operands the other way around
                block.const_(instr.c as u64, Scalar::INT)?;
                block.load(instr.rb, Scalar::INT)?;
            } else {
                block.load(instr.rb, Scalar::INT)?;
                block.const_(instr.c as u64, Scalar::INT)?;
            }
            block.u8(op);
            block.store(instr.ra, Scalar::INT);
        }
    }

    if can_throw {
        block.add_except_labels();
    }
    Ok((instr.pos, block.instructions))
}
