/* JVM opcode values and the dalvik math/array opcode mappings */

#![allow(dead_code)]

use crate::jvm::array::{ArrayType, ElemBase};
use crate::jvm::scalar::Scalar;

pub const ACONST_NULL: u8 = 0x01;
pub const ICONST_M1: u8 = 0x02;
pub const ICONST_0: u8 = 0x03;
pub const ICONST_1: u8 = 0x04;
pub const ICONST_2: u8 = 0x05;
pub const ICONST_3: u8 = 0x06;
pub const ICONST_4: u8 = 0x07;
pub const ICONST_5: u8 = 0x08;
pub const LCONST_0: u8 = 0x09;
pub const LCONST_1: u8 = 0x0a;
pub const FCONST_0: u8 = 0x0b;
pub const FCONST_1: u8 = 0x0c;
pub const FCONST_2: u8 = 0x0d;
pub const DCONST_0: u8 = 0x0e;
pub const DCONST_1: u8 = 0x0f;
pub const BIPUSH: u8 = 0x10;
pub const SIPUSH: u8 = 0x11;
pub const LDC: u8 = 0x12;
pub const LDC_W: u8 = 0x13;
pub const LDC2_W: u8 = 0x14;
pub const ILOAD: u8 = 0x15;
pub const LLOAD: u8 = 0x16;
pub const FLOAD: u8 = 0x17;
pub const DLOAD: u8 = 0x18;
pub const ALOAD: u8 = 0x19;
pub const ILOAD_0: u8 = 0x1a;
pub const LLOAD_0: u8 = 0x1e;
pub const FLOAD_0: u8 = 0x22;
pub const DLOAD_0: u8 = 0x26;
pub const ALOAD_0: u8 = 0x2a;
pub const IALOAD: u8 = 0x2e;
pub const LALOAD: u8 = 0x2f;
pub const FALOAD: u8 = 0x30;
pub const DALOAD: u8 = 0x31;
pub const AALOAD: u8 = 0x32;
pub const BALOAD: u8 = 0x33;
pub const CALOAD: u8 = 0x34;
pub const SALOAD: u8 = 0x35;
pub const ISTORE: u8 = 0x36;
pub const LSTORE: u8 = 0x37;
pub const FSTORE: u8 = 0x38;
pub const DSTORE: u8 = 0x39;
pub const ASTORE: u8 = 0x3a;
pub const ISTORE_0: u8 = 0x3b;
pub const LSTORE_0: u8 = 0x3f;
pub const FSTORE_0: u8 = 0x43;
pub const DSTORE_0: u8 = 0x47;
pub const ASTORE_0: u8 = 0x4b;
pub const IASTORE: u8 = 0x4f;
pub const LASTORE: u8 = 0x50;
pub const FASTORE: u8 = 0x51;
pub const DASTORE: u8 = 0x52;
pub const AASTORE: u8 = 0x53;
pub const BASTORE: u8 = 0x54;
pub const CASTORE: u8 = 0x55;
pub const SASTORE: u8 = 0x56;
pub const POP: u8 = 0x57;
pub const POP2: u8 = 0x58;
pub const DUP: u8 = 0x59;
pub const DUP2: u8 = 0x5c;
pub const IADD: u8 = 0x60;
pub const LADD: u8 = 0x61;
pub const FADD: u8 = 0x62;
pub const DADD: u8 = 0x63;
pub const ISUB: u8 = 0x64;
pub const LSUB: u8 = 0x65;
pub const FSUB: u8 = 0x66;
pub const DSUB: u8 = 0x67;
pub const IMUL: u8 = 0x68;
pub const LMUL: u8 = 0x69;
pub const FMUL: u8 = 0x6a;
pub const DMUL: u8 = 0x6b;
pub const IDIV: u8 = 0x6c;
pub const LDIV: u8 = 0x6d;
pub const FDIV: u8 = 0x6e;
pub const DDIV: u8 = 0x6f;
pub const IREM: u8 = 0x70;
pub const LREM: u8 = 0x71;
pub const FREM: u8 = 0x72;
pub const DREM: u8 = 0x73;
pub const INEG: u8 = 0x74;
pub const LNEG: u8 = 0x75;
pub const FNEG: u8 = 0x76;
pub const DNEG: u8 = 0x77;
pub const ISHL: u8 = 0x78;
pub const LSHL: u8 = 0x79;
pub const ISHR: u8 = 0x7a;
pub const LSHR: u8 = 0x7b;
pub const IUSHR: u8 = 0x7c;
pub const LUSHR: u8 = 0x7d;
pub const IAND: u8 = 0x7e;
pub const LAND: u8 = 0x7f;
pub const IOR: u8 = 0x80;
pub const LOR: u8 = 0x81;
pub const IXOR: u8 = 0x82;
pub const LXOR: u8 = 0x83;
pub const I2L: u8 = 0x85;
pub const I2F: u8 = 0x86;
pub const I2D: u8 = 0x87;
pub const L2I: u8 = 0x88;
pub const L2F: u8 = 0x89;
pub const L2D: u8 = 0x8a;
pub const F2I: u8 = 0x8b;
pub const F2L: u8 = 0x8c;
pub const F2D: u8 = 0x8d;
pub const D2I: u8 = 0x8e;
pub const D2L: u8 = 0x8f;
pub const D2F: u8 = 0x90;
pub const I2B: u8 = 0x91;
pub const I2C: u8 = 0x92;
pub const I2S: u8 = 0x93;
pub const LCMP: u8 = 0x94;
pub const FCMPL: u8 = 0x95;
pub const FCMPG: u8 = 0x96;
pub const DCMPL: u8 = 0x97;
pub const DCMPG: u8 = 0x98;
pub const IFEQ: u8 = 0x99;
pub const IFNE: u8 = 0x9a;
pub const IFLT: u8 = 0x9b;
pub const IFGE: u8 = 0x9c;
pub const IFGT: u8 = 0x9d;
pub const IFLE: u8 = 0x9e;
pub const IF_ICMPEQ: u8 = 0x9f;
pub const IF_ICMPNE: u8 = 0xa0;
pub const IF_ICMPLT: u8 = 0xa1;
pub const IF_ICMPGE: u8 = 0xa2;
pub const IF_ICMPGT: u8 = 0xa3;
pub const IF_ICMPLE: u8 = 0xa4;
pub const IF_ACMPEQ: u8 = 0xa5;
pub const IF_ACMPNE: u8 = 0xa6;
pub const GOTO: u8 = 0xa7;
pub const TABLESWITCH: u8 = 0xaa;
pub const LOOKUPSWITCH: u8 = 0xab;
pub const IRETURN: u8 = 0xac;
pub const LRETURN: u8 = 0xad;
pub const FRETURN: u8 = 0xae;
pub const DRETURN: u8 = 0xaf;
pub const ARETURN: u8 = 0xb0;
pub const RETURN: u8 = 0xb1;
pub const GETSTATIC: u8 = 0xb2;
pub const PUTSTATIC: u8 = 0xb3;
pub const GETFIELD: u8 = 0xb4;
pub const PUTFIELD: u8 = 0xb5;
pub const INVOKEVIRTUAL: u8 = 0xb6;
pub const INVOKESPECIAL: u8 = 0xb7;
pub const INVOKESTATIC: u8 = 0xb8;
pub const INVOKEINTERFACE: u8 = 0xb9;
pub const NEW: u8 = 0xbb;
pub const NEWARRAY: u8 = 0xbc;
pub const ANEWARRAY: u8 = 0xbd;
pub const ARRAYLENGTH: u8 = 0xbe;
pub const ATHROW: u8 = 0xbf;
pub const CHECKCAST: u8 = 0xc0;
pub const INSTANCEOF: u8 = 0xc1;
pub const MONITORENTER: u8 = 0xc2;
pub const MONITOREXIT: u8 = 0xc3;
pub const WIDE: u8 = 0xc4;
pub const IFNULL: u8 = 0xc6;
pub const IFNONNULL: u8 = 0xc7;
pub const GOTO_W: u8 = 0xc8;


/// Dalvik unary op lowered to a JVM op with its operand and result types.
#[derive(Clone, Copy, Debug)]
pub struct UnaryOp {
    pub op: u8,
    pub src: Scalar,
    pub dest: Scalar,
}

pub fn unary(opcode: u8) -> UnaryOp {
    let (op, src, dest) = match opcode {
        0x7b => (INEG, Scalar::INT, Scalar::INT),
        0x7c => (IXOR, Scalar::INT, Scalar::INT), // not-int is x ^ -1
        0x7d => (LNEG, Scalar::LONG, Scalar::LONG),
        0x7e => (LXOR, Scalar::LONG, Scalar::LONG), // not-long is x ^ -1L
        0x7f => (FNEG, Scalar::FLOAT, Scalar::FLOAT),
        0x80 => (DNEG, Scalar::DOUBLE, Scalar::DOUBLE),
        0x81 => (I2L, Scalar::INT, Scalar::LONG),
        0x82 => (I2F, Scalar::INT, Scalar::FLOAT),
        0x83 => (I2D, Scalar::INT, Scalar::DOUBLE),
        0x84 => (L2I, Scalar::LONG, Scalar::INT),
        0x85 => (L2F, Scalar::LONG, Scalar::FLOAT),
        0x86 => (L2D, Scalar::LONG, Scalar::DOUBLE),
        0x87 => (F2I, Scalar::FLOAT, Scalar::INT),
        0x88 => (F2L, Scalar::FLOAT, Scalar::LONG),
        0x89 => (F2D, Scalar::FLOAT, Scalar::DOUBLE),
        0x8a => (D2I, Scalar::DOUBLE, Scalar::INT),
        0x8b => (D2L, Scalar::DOUBLE, Scalar::LONG),
        0x8c => (D2F, Scalar::DOUBLE, Scalar::FLOAT),
        0x8d => (I2B, Scalar::INT, Scalar::INT),
        0x8e => (I2C, Scalar::INT, Scalar::INT),
        0x8f => (I2S, Scalar::INT, Scalar::INT),
        _ => unreachable!("not a unary opcode: {:#04x}", opcode),
    };
    UnaryOp { op, src, dest }
}

/// Dalvik binary op lowered to a JVM op with its two operand types. The
/// result type always matches the first operand.
#[derive(Clone, Copy, Debug)]
pub struct BinaryOp {
    pub op: u8,
    pub src: Scalar,
    pub src2: Scalar,
}

pub fn binary(opcode: u8) -> BinaryOp {
    // 2addr forms mirror the three-register forms exactly
    let base = if opcode >= 0xb0 { opcode - 0x20 } else { opcode };
    let (op, src, src2) = match base {
        0x90 => (IADD, Scalar::INT, Scalar::INT),
        0x91 => (ISUB, Scalar::INT, Scalar::INT),
        0x92 => (IMUL, Scalar::INT, Scalar::INT),
        0x93 => (IDIV, Scalar::INT, Scalar::INT),
        0x94 => (IREM, Scalar::INT, Scalar::INT),
        0x95 => (IAND, Scalar::INT, Scalar::INT),
        0x96 => (IOR, Scalar::INT, Scalar::INT),
        0x97 => (IXOR, Scalar::INT, Scalar::INT),
        0x98 => (ISHL, Scalar::INT, Scalar::INT),
        0x99 => (ISHR, Scalar::INT, Scalar::INT),
        0x9a => (IUSHR, Scalar::INT, Scalar::INT),
        0x9b => (LADD, Scalar::LONG, Scalar::LONG),
        0x9c => (LSUB, Scalar::LONG, Scalar::LONG),
        0x9d => (LMUL, Scalar::LONG, Scalar::LONG),
        0x9e => (LDIV, Scalar::LONG, Scalar::LONG),
        0x9f => (LREM, Scalar::LONG, Scalar::LONG),
        0xa0 => (LAND, Scalar::LONG, Scalar::LONG),
        0xa1 => (LOR, Scalar::LONG, Scalar::LONG),
        0xa2 => (LXOR, Scalar::LONG, Scalar::LONG),
        // long shifts take an int shift distance
        0xa3 => (LSHL, Scalar::LONG, Scalar::INT),
        0xa4 => (LSHR, Scalar::LONG, Scalar::INT),
        0xa5 => (LUSHR, Scalar::LONG, Scalar::INT),
        0xa6 => (FADD, Scalar::FLOAT, Scalar::FLOAT),
        0xa7 => (FSUB, Scalar::FLOAT, Scalar::FLOAT),
        0xa8 => (FMUL, Scalar::FLOAT, Scalar::FLOAT),
        0xa9 => (FDIV, Scalar::FLOAT, Scalar::FLOAT),
        0xaa => (FREM, Scalar::FLOAT, Scalar::FLOAT),
        0xab => (DADD, Scalar::DOUBLE, Scalar::DOUBLE),
        0xac => (DSUB, Scalar::DOUBLE, Scalar::DOUBLE),
        0xad => (DMUL, Scalar::DOUBLE, Scalar::DOUBLE),
        0xae => (DDIV, Scalar::DOUBLE, Scalar::DOUBLE),
        0xaf => (DREM, Scalar::DOUBLE, Scalar::DOUBLE),
        _ => unreachable!("not a binary opcode: {:#04x}", opcode),
    };
    BinaryOp { op, src, src2 }
}

/// JVM op for a binary-with-literal dalvik instruction; these are all int
/// typed. `rsub` variants map to `isub` with swapped operands.
pub fn binary_lit(opcode: u8) -> u8 {
    match opcode {
        0xd0 | 0xd8 => IADD,
        0xd1 | 0xd9 => ISUB,
        0xd2 | 0xda => IMUL,
        0xd3 | 0xdb => IDIV,
        0xd4 | 0xdc => IREM,
        0xd5 | 0xdd => IAND,
        0xd6 | 0xde => IOR,
        0xd7 | 0xdf => IXOR,
        0xe0 => ISHL,
        0xe1 => ISHR,
        0xe2 => IUSHR,
        _ => unreachable!("not a literal binary opcode: {:#04x}", opcode),
    }
}

/// The only math ops that can raise an exception (division by zero).
pub fn math_throws(jvmop: u8) -> bool {
    matches!(jvmop, IDIV | IREM | LDIV | LREM)
}

pub fn array_load_op(at: ArrayType) -> u8 {
    match at {
        ArrayType::Array(1, base) => match base {
            ElemBase::I => IALOAD,
            ElemBase::J => LALOAD,
            ElemBase::F => FALOAD,
            ElemBase::D => DALOAD,
            ElemBase::B => BALOAD,
            ElemBase::C => CALOAD,
            ElemBase::S => SALOAD,
        },
        _ => AALOAD,
    }
}

pub fn array_store_op(at: ArrayType) -> u8 {
    array_load_op(at) + (IASTORE - IALOAD)
}

/// Condition inversion used by the wide-branch trampoline.
pub fn invert_if(op: u8) -> u8 {
    match op {
        IFEQ => IFNE,
        IFNE => IFEQ,
        IFLT => IFGE,
        IFGE => IFLT,
        IFGT => IFLE,
        IFLE => IFGT,
        IF_ICMPEQ => IF_ICMPNE,
        IF_ICMPNE => IF_ICMPEQ,
        IF_ICMPLT => IF_ICMPGE,
        IF_ICMPGE => IF_ICMPLT,
        IF_ICMPGT => IF_ICMPLE,
        IF_ICMPLE => IF_ICMPGT,
        IF_ACMPEQ => IF_ACMPNE,
        IF_ACMPNE => IF_ACMPEQ,
        IFNULL => IFNONNULL,
        IFNONNULL => IFNULL,
        _ => unreachable!("not a conditional branch: {:#04x}", op),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_2addr_mirror() {
        let a = binary(0x90);
        let b = binary(0xb0);
        assert_eq!(a.op, b.op);
        assert_eq!(a.src, b.src);

        let shl = binary(0xa3);
        assert_eq!(shl.op, LSHL);
        assert_eq!(shl.src, Scalar::LONG);
        assert_eq!(shl.src2, Scalar::INT);
    }

    #[test]
    fn inversion_is_involutive() {
        for op in [IFEQ, IFNE, IFLT, IFGE, IFGT, IFLE, IF_ICMPEQ, IF_ACMPNE, IFNULL, IFNONNULL] {
            assert_eq!(invert_if(invert_if(op)), op);
        }
    }

    #[test]
    fn array_ops() {
        use crate::jvm::array::ArrayType;
        assert_eq!(array_load_op(ArrayType::from_desc("[I")), IALOAD);
        assert_eq!(array_store_op(ArrayType::from_desc("[I")), IASTORE);
        assert_eq!(array_load_op(ArrayType::from_desc("[[I")), AALOAD);
        assert_eq!(array_load_op(ArrayType::Invalid), AALOAD);
        assert_eq!(array_store_op(ArrayType::from_desc("[Z")), BASTORE);
    }
}
