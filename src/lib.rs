//! # dex2class
//!
//! A library for translating Dalvik executables (.dex) into JVM class files
//!
//! Given the bytes of a dex payload, [`translate`] emits, for every class
//! defined in it, a classfile (major version 49.0) whose execution matches
//! the observable behavior of the Dalvik original. Packaging the results
//! into a jar, along with any runtime support stubs, is up to the caller.
//!
//! ```no_run
//! use dex2class::{translate, Options};
//!
//! let dex = std::fs::read("classes.dex").unwrap();
//! for (name, classfile) in translate(&dex, Options::none()).unwrap() {
//!     println!("{}: {} bytes", name, classfile.len());
//! }
//! ```

use log::error;

#[macro_use]
mod dex;
mod jvm;

pub use crate::dex::dex_file::{DexClass, DexFile};
pub use crate::dex::error::DexError;
pub use crate::jvm::writeclass::{to_class_file, ClassError};
pub use crate::jvm::ClassfileLimitExceeded;

/// Translation switches. The first six control optimizer passes over the
/// IR, the last two the constant pool strategy. Everything off produces
/// working output fastest; everything on spends effort shrinking methods
/// and is also the fallback when a classfile limit overflows.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Options {
    pub inline_consts: bool,
    pub copy_propagation: bool,
    pub remove_unused_regs: bool,
    pub dup2ize: bool,
    pub prune_store_loads: bool,
    pub sort_registers: bool,
    pub split_pool: bool,
    pub delay_consts: bool,
}

impl Options {
    pub fn from_bits(bits: u8) -> Options {
        Options {
            inline_consts: bits & (1 << 0) != 0,
            copy_propagation: bits & (1 << 1) != 0,
            remove_unused_regs: bits & (1 << 2) != 0,
            dup2ize: bits & (1 << 3) != 0,
            prune_store_loads: bits & (1 << 4) != 0,
            sort_registers: bits & (1 << 5) != 0,
            split_pool: bits & (1 << 6) != 0,
            delay_consts: bits & (1 << 7) != 0,
        }
    }

    pub fn none() -> Options {
        Options::from_bits(0)
    }

    pub fn all() -> Options {
        Options::from_bits(255)
    }

    /// Every pass that improves the output without the odder pool tricks.
    pub fn pretty() -> Options {
        Options {
            split_pool: false,
            delay_consts: false,
            ..Options::all()
        }
    }
}

/// Translates every class in a dex payload, in definition order, to
/// `(class name, classfile bytes)` pairs. Classes whose bodies fail to
/// parse are reported and skipped; the rest still translate.
pub fn translate(dex_bytes: &[u8], opts: Options) -> Result<Vec<(String, Vec<u8>)>, DexError> {
    let dex = DexFile::read(dex_bytes)?;

    let mut results = Vec::with_capacity(dex.class_defs.len());
    for cls in &dex.class_defs {
        match to_class_file(&dex, cls, opts) {
            Ok(bytes) => results.push((cls.name.clone(), bytes)),
            Err(err) => {
                error!("Skipping class {}: {}", cls.name, err);
            }
        }
    }
    Ok(results)
}
