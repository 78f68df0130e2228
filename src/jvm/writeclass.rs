/* Per-class assembly into classfile bytes */

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::dex::dex_file::{DexClass, DexFile, Field, Method};
use crate::dex::encoded_values::EncodedValue;
use crate::dex::error::DexError;
use crate::jvm::cpool::{simple_pool, split_pool, ConstantPool};
use crate::jvm::ir::IrKind;
use crate::jvm::optimize::{consts, jumps, registers, stack};
use crate::jvm::writeir::{build_method_ir, MethodIr};
use crate::jvm::writer::Writer;
use crate::jvm::{ClassfileLimitExceeded, CLASS_FLAGS, FIELD_FLAGS, METHOD_FLAGS};
use crate::Options;

/// Everything that can go wrong while emitting one class: a malformed
/// class body, or a classfile limit overflow (recoverable by retrying with
/// the full optimizer).
#[derive(Debug, Error)]
pub enum ClassError {
    #[error("{0}")]
    Dex(#[from] DexError),
    #[error("{0}")]
    Limit(#[from] ClassfileLimitExceeded),
}

fn get_code_ir(
    pool: &mut (dyn ConstantPool + 'static),
    dex: &DexFile,
    method: &Method,
    opts: Options,
) -> Result<Option<MethodIr>, ClassError> {
    let code = match &method.code {
        Some(code) => code,
        None => return Ok(None),
    };

    let mut irdata = build_method_ir(pool, dex, method, code, opts)?;

    if opts.inline_consts {
        stack::inline_consts(&mut irdata);
    }
    if opts.copy_propagation {
        registers::copy_propagation(&mut irdata);
    }
    if opts.remove_unused_regs {
        registers::remove_unused_registers(&mut irdata);
    }
    if opts.dup2ize {
        stack::dup2ize(&mut irdata);
    }

    if opts.prune_store_loads {
        stack::prune_store_loads(&mut irdata);
        if opts.remove_unused_regs {
            registers::remove_unused_registers(&mut irdata);
        }
    }

    if opts.sort_registers {
        registers::allocate_registers_sorted(&mut irdata);
    } else {
        registers::allocate_registers_simple(&mut irdata);
    }
    Ok(Some(irdata))
}

fn finish_code_attrs(
    pool: &mut (dyn ConstantPool + 'static),
    code_irs: Vec<MethodIr>,
    opts: Options,
) -> Result<FxHashMap<u32, Vec<u8>>, ClassError> {
    let mut code_irs = code_irs;

    // any code at all needs the attribute name in the pool
    if !code_irs.is_empty() {
        pool.utf8(b"Code")?;
    }

    if opts.delay_consts {
        // A class can reference more constants than the pool holds. The
        // workaround replaces primitive constants with bytecode computing
        // them, which costs method size, so it should only hit constants in
        // methods that could otherwise overflow 64k.
        //
        // Methods that stay under 64k even with every constant synthesized
        // are safe no matter what; the rest get pool slots reserved for
        // their most valuable constants first.
        {
            let long_irs: Vec<&MethodIr> =
                code_irs.iter().filter(|irw| irw.upper_bound() >= 65536).collect();
            if !long_irs.is_empty() {
                consts::allocate_required_constants(pool, long_irs);
            }
        }

        // leftover pool space serves the short methods
        for irdata in code_irs.iter_mut() {
            for ins in irdata.instructions.iter_mut() {
                let data = match &ins.kind {
                    IrKind::PrimConst(data) => data.clone(),
                    _ => continue,
                };
                data.fix_with_pool(pool, &mut ins.bytecode);
            }
        }
    }

    let mut res = FxHashMap::default();
    for irdata in code_irs {
        let method_idx = irdata.method_idx;
        res.insert(method_idx, write_code_attr(irdata, opts)?);
    }
    Ok(res)
}

fn write_code_attr(mut irdata: MethodIr, opts: Options) -> Result<Vec<u8>, ClassfileLimitExceeded> {
    let nregs = irdata.numregs.unwrap();
    jumps::widen_jumps(&mut irdata);
    let (bytecode, excepts) = jumps::assemble_code(irdata);

    // When code overruns the limit without optimization, report it so the
    // caller can retry optimized. If it is still too long then, emit it
    // anyway: an illegally long method beats producing no output.
    if bytecode.len() > 65535 && opts != Options::all() {
        return Err(ClassfileLimitExceeded);
    }
    if excepts.len() > 65535 {
        return Err(ClassfileLimitExceeded);
    }

    let expectlen = 12 + bytecode.len() + 8 * excepts.len();
    let mut stream = Writer::with_capacity(expectlen);
    // Computing the real maximum stack height is not worth it; use a value
    // that is always enough. 65535 would be legal too but tends to trigger
    // StackOverflowErrors under default JVM memory settings.
    stream.u16(300);
    stream.u16(nregs);

    stream.u32(bytecode.len() as u32);
    stream.write(&bytecode);
    stream.u16(excepts.len() as u16);
    for (s, e, h, c) in excepts {
        stream.u16(s);
        stream.u16(e);
        stream.u16(h);
        stream.u16(c);
    }

    // attributes
    stream.u16(0);
    debug_assert!(stream.0.len() == expectlen);
    Ok(stream.0)
}

fn write_field(
    pool: &mut (dyn ConstantPool + 'static),
    stream: &mut Writer,
    field: &Field,
) -> Result<(), ClassError> {
    stream.u16(field.access as u16 & FIELD_FLAGS);
    stream.u16(pool.utf8(field.id.name.as_bytes())?);
    stream.u16(pool.utf8(field.id.desc.as_bytes())?);

    // Only ConstantValue survives translation, and only where the encoded
    // value matches what the descriptor can legally carry.
    let index = match (field.id.desc.as_str(), &field.constant_value) {
        ("Z" | "B" | "C" | "S" | "I", EncodedValue::Int32(x)) => Some(pool.int(*x)?),
        ("F", EncodedValue::Int32(x)) => Some(pool.float(*x)?),
        ("J", EncodedValue::Int64(x)) => Some(pool.long(*x)?),
        ("D", EncodedValue::Int64(x)) => Some(pool.double(*x)?),
        ("Ljava/lang/String;", EncodedValue::Str(s)) => Some(pool.string(s)?),
        ("Ljava/lang/Class;", EncodedValue::Type(t)) => Some(pool.class(t)?),
        _ => None,
    };

    match index {
        Some(ind) => {
            stream.u16(1);
            stream.u16(pool.utf8(b"ConstantValue")?);
            stream.u32(2);
            stream.u16(ind);
        }
        None => {
            stream.u16(0); // no attributes
        }
    }
    Ok(())
}

fn write_methods(
    pool: &mut (dyn ConstantPool + 'static),
    stream: &mut Writer,
    dex: &DexFile,
    methods: &[Method],
    opts: Options,
) -> Result<(), ClassError> {
    let mut code_irs = Vec::with_capacity(methods.len());
    for method in methods {
        if let Some(irdata) = get_code_ir(pool, dex, method, opts)? {
            code_irs.push(irdata);
        }
    }
    let code_attrs = finish_code_attrs(pool, code_irs, opts)?;

    stream.u16(methods.len() as u16);
    for method in methods {
        stream.u16(method.access as u16 & METHOD_FLAGS);
        stream.u16(pool.utf8(method.id.name.as_bytes())?);
        stream.u16(pool.utf8(method.id.desc.as_bytes())?);

        match code_attrs.get(&method.method_idx) {
            Some(data) => {
                stream.u16(1);
                stream.u16(pool.utf8(b"Code")?);
                stream.u32(data.len() as u32);
                stream.write(data);
            }
            None => {
                stream.u16(0); // no attributes
            }
        }
    }
    Ok(())
}

// The body is accumulated into its own buffer so the pool count and entries
// (which the body keeps allocating into) can be written in front afterwards.
fn after_pool(
    dex: &DexFile,
    cls: &DexClass,
    opts: Options,
) -> Result<(Box<dyn ConstantPool>, Writer), ClassError> {
    let mut stream = Writer::default();
    let mut pool = if opts.split_pool { split_pool() } else { simple_pool() };

    stream.u16(cls.access as u16 & CLASS_FLAGS);
    stream.u16(pool.class(&cls.name)?);
    stream.u16(match &cls.super_name {
        Some(v) => pool.class(v)?,
        None => 0,
    });

    stream.u16(cls.interfaces.len() as u16);
    for interface in &cls.interfaces {
        stream.u16(pool.class(interface)?);
    }

    let (fields, methods) = cls.parse_members(dex)?;
    stream.u16(fields.len() as u16);
    for field in &fields {
        write_field(&mut *pool, &mut stream, field)?;
    }

    write_methods(&mut *pool, &mut stream, dex, &methods, opts)?;

    // class attributes
    stream.u16(0);
    Ok((pool, stream))
}

/// Emits one class as classfile bytes. Translation is attempted once with
/// the caller's options; if a classfile limit overflows, once more with
/// everything enabled. A second overflow propagates.
pub fn to_class_file(dex: &DexFile, cls: &DexClass, opts: Options) -> Result<Vec<u8>, ClassError> {
    let mut stream = Writer::default();
    stream.u32(0xCAFEBABE);
    // bytecode version 49.0, the last before StackMapTable became mandatory
    stream.u16(0);
    stream.u16(49);

    let (pool, rest_stream) = match after_pool(dex, cls, opts) {
        Ok(res) => res,
        Err(ClassError::Limit(_)) if opts != Options::all() => {
            after_pool(dex, cls, Options::all())?
        }
        Err(err) => return Err(err),
    };

    pool.write(&mut stream);
    stream.write(&rest_stream.0);
    Ok(stream.0)
}
