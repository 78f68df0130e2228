/* Classfile constant pool, in simple and split flavors */

use rustc_hash::FxHashMap;

use crate::dex::dex_file::{FieldRef, MethodRef};
use crate::jvm::writer::Writer;
use crate::jvm::ClassfileLimitExceeded;

/// A constant pool entry keyed by its structural data; deduplication works
/// on this value. Reference entries hold the indices of their components.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum Entry {
    Utf8(Vec<u8>),
    Class(u16),
    Str(u16),
    Integer(u32),
    Float(u32),
    Long(u64),
    Double(u64),
    NameAndType(u16, u16),
    Field(u16, u16),
    Method(u16, u16),
    IMethod(u16, u16),
}

impl Entry {
    /// Long and double entries occupy two indices; the second index must
    /// never be handed out independently.
    pub fn width(&self) -> usize {
        match self {
            Entry::Long(_) | Entry::Double(_) => 2,
            _ => 1,
        }
    }

    /// Deterministic ordering for the greedy constant pre-allocation.
    pub fn cmp_key(&self) -> (u8, u64) {
        match self {
            Entry::Integer(x) => (3, *x as u64),
            Entry::Float(x) => (4, *x as u64),
            Entry::Long(x) => (5, *x),
            Entry::Double(x) => (6, *x),
            _ => unreachable!("only primitive entries are scored"),
        }
    }

    fn write(&self, stream: &mut Writer) {
        match self {
            Entry::Utf8(data) => {
                stream.u8(1);
                stream.u16(data.len() as u16);
                stream.write(data);
            }
            Entry::Integer(x) => {
                stream.u8(3);
                stream.u32(*x);
            }
            Entry::Float(x) => {
                stream.u8(4);
                stream.u32(*x);
            }
            Entry::Long(x) => {
                stream.u8(5);
                stream.u64(*x);
            }
            Entry::Double(x) => {
                stream.u8(6);
                stream.u64(*x);
            }
            Entry::Class(n) => {
                stream.u8(7);
                stream.u16(*n);
            }
            Entry::Str(n) => {
                stream.u8(8);
                stream.u16(*n);
            }
            Entry::Field(c, nat) => {
                stream.u8(9);
                stream.u16(*c);
                stream.u16(*nat);
            }
            Entry::Method(c, nat) => {
                stream.u8(10);
                stream.u16(*c);
                stream.u16(*nat);
            }
            Entry::IMethod(c, nat) => {
                stream.u8(11);
                stream.u16(*c);
                stream.u16(*nat);
            }
            Entry::NameAndType(n, d) => {
                stream.u8(12);
                stream.u16(*n);
                stream.u16(*d);
            }
        }
    }
}

type Result16 = Result<u16, ClassfileLimitExceeded>;

/// Index allocation for a classfile constant pool. Two implementations:
/// an append-only pool, and a split pool that reserves the low 255 indices
/// for entries usable by the short-form `ldc`. Indices are 1-based on the
/// wire; slot 0 is reserved.
pub trait ConstantPool {
    fn space(&self) -> usize;
    fn lowspace(&self) -> usize;
    fn write(&self, stream: &mut Writer);
    fn alloc_ind(&mut self, low: bool, width: usize) -> Result16;
    fn lookup(&mut self) -> &mut FxHashMap<Entry, u16>;
    fn vals(&mut self) -> &mut [Option<Entry>];

    fn get(&mut self, entry: Entry) -> Result16 {
        if let Some(val) = self.lookup().get(&entry) {
            return Ok(*val);
        }

        // ints, floats and strings can be loaded with the one-byte-index ldc
        let low = matches!(entry, Entry::Integer(_) | Entry::Float(_) | Entry::Str(_));
        let index = self.alloc_ind(low, entry.width())?;
        self.lookup().insert(entry.clone(), index);
        self.vals()[index as usize] = Some(entry);
        Ok(index)
    }

    fn insert_directly(&mut self, entry: Entry, low: bool) -> Result16 {
        let index = self.alloc_ind(low, entry.width())?;
        self.lookup().insert(entry.clone(), index);
        self.vals()[index as usize] = Some(entry);
        Ok(index)
    }

    /// Insert-if-fits used during preflight: never errors, reports whether
    /// the entry got (or already had) a slot.
    fn try_get(&mut self, entry: Entry) -> Option<u16> {
        if let Some(val) = self.lookup().get(&entry) {
            return Some(*val);
        }
        if entry.width() > self.space() {
            return None;
        }
        self.insert_directly(entry, true).ok()
    }

    fn utf8(&mut self, s: &[u8]) -> Result16 {
        if s.len() > 65535 {
            return Err(ClassfileLimitExceeded);
        }
        self.get(Entry::Utf8(s.to_vec()))
    }

    fn class(&mut self, s: &str) -> Result16 {
        let ind = self.utf8(s.as_bytes())?;
        self.get(Entry::Class(ind))
    }

    fn string(&mut self, s: &[u8]) -> Result16 {
        let ind = self.utf8(s)?;
        self.get(Entry::Str(ind))
    }

    fn nat(&mut self, name: &[u8], desc: &[u8]) -> Result16 {
        let ind = self.utf8(name)?;
        let ind2 = self.utf8(desc)?;
        self.get(Entry::NameAndType(ind, ind2))
    }

    fn field(&mut self, trip: &FieldRef) -> Result16 {
        let ind = self.class(&trip.cname)?;
        let ind2 = self.nat(trip.name.as_bytes(), trip.desc.as_bytes())?;
        self.get(Entry::Field(ind, ind2))
    }

    fn method(&mut self, trip: &MethodRef) -> Result16 {
        let ind = self.class(&trip.cname)?;
        let ind2 = self.nat(trip.name.as_bytes(), trip.desc.as_bytes())?;
        self.get(Entry::Method(ind, ind2))
    }

    fn imethod(&mut self, trip: &MethodRef) -> Result16 {
        let ind = self.class(&trip.cname)?;
        let ind2 = self.nat(trip.name.as_bytes(), trip.desc.as_bytes())?;
        self.get(Entry::IMethod(ind, ind2))
    }

    fn int(&mut self, x: u32) -> Result16 {
        self.get(Entry::Integer(x))
    }
    fn float(&mut self, x: u32) -> Result16 {
        self.get(Entry::Float(x))
    }
    fn long(&mut self, x: u64) -> Result16 {
        self.get(Entry::Long(x))
    }
    fn double(&mut self, x: u64) -> Result16 {
        self.get(Entry::Double(x))
    }
}

fn write_entry(stream: &mut Writer, entry: &Option<Entry>) {
    if let Some(entry) = entry {
        entry.write(stream);
    }
}

/// Append-only pool: slots are handed out in increasing order.
pub struct SimplePool {
    lookup: FxHashMap<Entry, u16>,
    vals: Vec<Option<Entry>>,
}

impl ConstantPool for SimplePool {
    fn lookup(&mut self) -> &mut FxHashMap<Entry, u16> {
        &mut self.lookup
    }
    fn vals(&mut self) -> &mut [Option<Entry>] {
        &mut self.vals
    }

    fn space(&self) -> usize {
        65535 - self.vals.len()
    }
    fn lowspace(&self) -> usize {
        256usize.saturating_sub(self.vals.len())
    }

    fn alloc_ind(&mut self, _low: bool, width: usize) -> Result16 {
        if self.space() < width {
            return Err(ClassfileLimitExceeded);
        }
        let temp = self.vals.len();
        for _ in 0..width {
            self.vals.push(None);
        }
        Ok(temp as u16)
    }

    fn write(&self, stream: &mut Writer) {
        stream.u16(self.vals.len() as u16);
        for item in &self.vals {
            write_entry(stream, item);
        }
    }
}

pub fn simple_pool() -> Box<dyn ConstantPool> {
    Box::new(SimplePool { lookup: FxHashMap::default(), vals: vec![None] })
}

// Pool slots 1..255 are special: only they can be referenced by the two-byte
// ldc (ldc_w and ldc2_w take three bytes). So ldc-eligible entries are worth
// keeping low, without wasting low slots on entries that can never use ldc.
//
// Allocating ldc entries from 1 upward and the rest from 256 upward leaves a
// non-contiguous gap: with exactly two slots free, a long entry might not
// find two adjacent ones. Instead the pool is created at the maximum size
// and non-ldc entries are allocated from the top down, keeping the free
// region contiguous. The untouched middle is padded with the shortest
// possible entry (an empty Utf8) when written out.
//
// For simplicity, ints, floats and strings always count as low-eligible and
// everything else as high, whether or not an ldc actually references them.

const PLACEHOLDER_ENTRY: &[u8] = b"\x01\x00\x00";

pub struct SplitPool {
    lookup: FxHashMap<Entry, u16>,
    vals: Vec<Option<Entry>>,
    bot: usize,
    top: usize,
}

impl ConstantPool for SplitPool {
    fn lookup(&mut self) -> &mut FxHashMap<Entry, u16> {
        &mut self.lookup
    }
    fn vals(&mut self) -> &mut [Option<Entry>] {
        &mut self.vals
    }

    fn space(&self) -> usize {
        self.top - self.bot
    }
    fn lowspace(&self) -> usize {
        256usize.saturating_sub(self.bot)
    }

    fn alloc_ind(&mut self, low: bool, width: usize) -> Result16 {
        if self.space() < width {
            return Err(ClassfileLimitExceeded);
        }
        Ok(if low {
            self.bot += width;
            (self.bot - width) as u16
        } else {
            self.top -= width;
            self.top as u16
        })
    }

    fn write(&self, stream: &mut Writer) {
        stream.u16(65535);
        assert!(self.bot <= self.top);

        for item in &self.vals[..self.bot] {
            write_entry(stream, item);
        }

        stream.0.reserve(PLACEHOLDER_ENTRY.len() * (self.top - self.bot));
        for _ in 0..(self.top - self.bot) {
            stream.0.extend_from_slice(PLACEHOLDER_ENTRY);
        }

        for item in &self.vals[self.top..] {
            write_entry(stream, item);
        }
    }
}

pub fn split_pool() -> Box<dyn ConstantPool> {
    Box::new(SplitPool {
        lookup: FxHashMap::default(),
        vals: vec![None; 65535],
        bot: 1,
        top: 65535,
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_and_one_based_indices() {
        let mut pool = simple_pool();
        let a = pool.utf8(b"Code").unwrap();
        let b = pool.utf8(b"Code").unwrap();
        assert_eq!(a, 1);
        assert_eq!(a, b);
        let c = pool.class("java/lang/Object").unwrap();
        assert!(c > a);
    }

    #[test]
    fn wide_entries_take_two_slots() {
        let mut pool = simple_pool();
        let a = pool.long(42).unwrap();
        let b = pool.int(7).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 3);
    }

    #[test]
    fn simple_pool_exhaustion() {
        let mut pool = simple_pool();
        for i in 0..65534u32 {
            pool.int(i).unwrap();
        }
        assert_eq!(pool.space(), 0);
        assert_eq!(pool.int(0xdead_0000), Err(ClassfileLimitExceeded));
        // existing entries still resolve
        assert!(pool.int(17).is_ok());
    }

    #[test]
    fn split_pool_partitions_entries() {
        let mut pool = split_pool();
        let low = pool.int(5).unwrap();
        let high = pool.long(5).unwrap();
        let utf = pool.utf8(b"x").unwrap();
        assert_eq!(low, 1);
        assert_eq!(high, 65533);
        assert_eq!(utf, 65532);
    }

    #[test]
    fn split_pool_writes_placeholders() {
        let mut pool = split_pool();
        pool.int(1).unwrap();
        let mut w = Writer::default();
        pool.write(&mut w);
        // count, nothing for reserved slot 0, one int, then empty-utf8 filler
        assert_eq!(&w.0[..2], &[0xFF, 0xFF]);
        assert_eq!(w.0[2], 3); // CONSTANT_Integer tag
        assert_eq!(&w.0[3..7], &[0, 0, 0, 1]);
        let filler_count = 65535 - 2;
        assert_eq!(w.0.len(), 2 + 5 + filler_count * 3);
    }

    #[test]
    fn try_get_reports_fit() {
        let mut pool = simple_pool();
        assert_eq!(pool.try_get(Entry::Integer(9)), Some(1));
        assert_eq!(pool.try_get(Entry::Integer(9)), Some(1));
    }

    #[test]
    fn oversized_utf8_rejected() {
        let mut pool = simple_pool();
        let big = vec![b'a'; 65536];
        assert_eq!(pool.utf8(&big), Err(ClassfileLimitExceeded));
    }

    #[test]
    fn field_refs_chain_through_nat() {
        use crate::dex::dex_file::FieldRef;
        let mut pool = simple_pool();
        let f = FieldRef {
            cname: "foo/Bar".to_string(),
            name: "baz".to_string(),
            desc: "I".to_string(),
        };
        let ind = pool.field(&f).unwrap();
        // Utf8 cname, Class, Utf8 name, Utf8 desc, NameAndType, Fieldref
        assert_eq!(ind, 6);
        assert_eq!(pool.field(&f).unwrap(), ind);
    }
}
