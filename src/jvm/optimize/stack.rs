/* Stack-oriented IR passes: constant inlining, store/load pruning, dup2ize */

use std::mem::swap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::jvm::ir::{self, IrIns, IrKind, LabelId, RegKey};
use crate::jvm::writeir::MethodIr;

trait Visitor {
    fn reset(&mut self);
    fn visit_return(&mut self);
    fn visit(&mut self, i: usize, instr: &IrIns);
}

// Visits linear sections of code, pessimistically treating all exception
// handler ranges as jumps.
fn visit_linear_code<V: Visitor>(irdata: &MethodIr, visitor: &mut V) {
    let mut except_level = 0;
    for (i, instr) in irdata.instructions.iter().enumerate() {
        let lbl = instr.lbl();
        match lbl {
            Some(LabelId::EStart(_)) => {
                except_level += 1;
                visitor.reset();
            }
            Some(LabelId::EEnd(_)) => {
                except_level -= 1;
            }
            _ => {}
        }

        if except_level > 0 {
            continue;
        }

        if irdata.is_target(lbl) || instr.is_jump() {
            visitor.reset();
        } else if !instr.fallsthrough() {
            visitor.visit_return();
        } else {
            visitor.visit(i, instr);
        }
    }
    assert!(except_level == 0);
}

#[derive(Default)]
struct ConstInliner {
    uses: FxHashMap<usize, usize>,
    notmultiused: FxHashSet<usize>,
    current: FxHashMap<RegKey, usize>,
}

impl Visitor for ConstInliner {
    fn reset(&mut self) {
        self.current.clear();
    }

    fn visit_return(&mut self) {
        // a value still outstanding at a return or throw was never read
        for (_, val) in self.current.drain() {
            self.notmultiused.insert(val);
        }
    }

    fn visit(&mut self, i: usize, instr: &IrIns) {
        if let IrKind::RegAccess(data) = &instr.kind {
            let key = data.key;
            if data.store {
                if let Some(&existing) = self.current.get(&key) {
                    self.notmultiused.insert(existing);
                }
                self.current.insert(key, i);
            } else if self.current.contains_key(&key) {
                // a first use records the load; a second use disqualifies
                let existing = self.current[&key];
                if self.uses.contains_key(&existing) {
                    self.current.remove(&key);
                } else {
                    self.uses.insert(existing, i);
                }
            }
        }
    }
}

/// Inlines constants that are used at most once, splicing the constant to
/// its single use site or deleting it outright. Only linear runs are
/// considered; everything is presumed live at a jump or exception boundary.
pub fn inline_consts(irdata: &mut MethodIr) {
    let mut visitor = ConstInliner::default();
    visit_linear_code(irdata, &mut visitor);

    let mut replace = FxHashMap::default();
    for (i, ins1) in irdata.instructions.iter().enumerate() {
        let i2 = i + 1;
        if visitor.notmultiused.contains(&i2) && ins1.is_constant() {
            replace.insert(i, Vec::new());
            replace.insert(i2, Vec::new());
            if let Some(u) = visitor.uses.remove(&i2) {
                replace.insert(u, vec![ins1.clone()]);
            }
        }
    }
    irdata.replace_instrs(replace);
}

#[derive(Default)]
struct StoreLoadPruner {
    current: FxHashMap<RegKey, (usize, usize)>,
    last: Option<(usize, RegKey)>,
    removed: FxHashSet<usize>,
}

impl Visitor for StoreLoadPruner {
    fn reset(&mut self) {
        self.current.clear();
        self.last = None;
    }

    fn visit_return(&mut self) {
        for (_, pair) in self.current.drain() {
            self.removed.insert(pair.0);
            self.removed.insert(pair.1);
        }
        self.last = None;
    }

    fn visit(&mut self, i: usize, instr: &IrIns) {
        if let IrKind::RegAccess(data) = &instr.kind {
            let key = data.key;
            if data.store {
                if let Some(pair) = self.current.remove(&key) {
                    self.removed.insert(pair.0);
                    self.removed.insert(pair.1);
                }
                self.last = Some((i, key));
            } else {
                self.current.remove(&key);
                if let Some((lasti, lastkey)) = self.last {
                    if lastkey == key {
                        self.current.insert(key, (lasti, i));
                    }
                }
                self.last = None;
            }
        } else if instr.lbl().is_none() {
            self.last = None;
        }
    }
}

/// Deletes a store immediately followed by a load of the same register
/// (possibly with a label in between) when the register is provably not
/// read again before the next reset point. Must not run before dup2ize.
pub fn prune_store_loads(irdata: &mut MethodIr) {
    let mut visitor = StoreLoadPruner::default();
    visit_linear_code(irdata, &mut visitor);

    let replace = visitor.removed.into_iter().map(|k| (k, Vec::new())).collect();
    irdata.replace_instrs(replace);
}

/// Yields the dup/dup2 steps that keep copies of a value available on the
/// stack across `n` accesses, up to four copies at a time, then a final
/// step that pops the leftover copy if one remains. Asymptotically this
/// costs about half a byte per access.
pub struct DupLadder {
    n: usize,
    i: usize,
    have: usize,
    needed: usize,
}

impl DupLadder {
    pub fn new(needed: usize, need_after: usize) -> DupLadder {
        DupLadder { n: needed, i: 0, have: 1, needed: needed + need_after }
    }
}

impl Iterator for DupLadder {
    type Item = Vec<IrIns>;

    fn next(&mut self) -> Option<Vec<IrIns>> {
        let mut res = Vec::new();
        if self.i < self.n {
            if self.have == 1 && self.needed >= 2 {
                res.push(ir::dup());
                self.have += 1;
            }
            if self.have == 2 && self.needed >= 4 {
                res.push(ir::dup2());
                self.have += 2;
            }
            self.have -= 1;
            self.needed -= 1;
            self.i += 1;
        } else {
            debug_assert!(self.i == self.n);
            if self.have > self.needed {
                debug_assert!(self.have == self.needed + 1);
                res.push(ir::pop());
            }
        }
        Some(res)
    }
}

#[derive(Default)]
struct UseRange(Vec<usize>);

impl UseRange {
    fn start(&self) -> usize {
        self.0[0]
    }

    fn end(&self) -> usize {
        self.0[self.0.len() - 1]
    }

    fn subtract(&self, other: &Self, out: &mut Vec<Self>) {
        let (s, e) = (other.start(), other.end());
        let left: Vec<_> = self.0.iter().copied().filter(|&x| x < s).collect();
        let right: Vec<_> = self.0.iter().copied().filter(|&x| x > e).collect();
        if left.len() >= 2 {
            out.push(UseRange(left));
        }
        if right.len() >= 2 {
            out.push(UseRange(right));
        }
    }
}

/// Replaces repeated narrow reads of one register at stack height zero by a
/// single load plus a dup ladder.
///
/// Instead of tracking stack heights, this leans on the invariant that the
/// IR run for one dalvik instruction begins with an empty stack, recognized
/// by its position label. (Not true for move-result, but those runs do not
/// begin with a register load, so nothing matches.) prune_store_loads
/// breaks the invariant, so this must run first. Only one value is kept
/// duplicated at a time.
pub fn dup2ize(irdata: &mut MethodIr) {
    let mut ranges = Vec::new();
    let mut current: FxHashMap<RegKey, UseRange> = FxHashMap::default();
    let mut at_head = false;
    for (i, instr) in irdata.instructions.iter().enumerate() {
        // exception ranges are fine (the stack is clear there); jumps are not
        let lbl = instr.lbl();
        if instr.is_jump() || irdata.is_target(lbl) {
            ranges.extend(current.drain().map(|(_, v)| v));
        }

        if let IrKind::RegAccess(data) = &instr.kind {
            let key = data.key;
            if !key.1.is_wide() {
                if data.store {
                    if let Some(ur) = current.remove(&key) {
                        ranges.push(ur);
                    }
                } else if at_head {
                    current.entry(key).or_default().0.push(i);
                }
            }
        }

        at_head = matches!(lbl, Some(LabelId::DPos(_)));
    }
    ranges.extend(current.drain().map(|(_, v)| v));

    let mut ranges: Vec<_> = ranges.into_iter().filter(|ur| ur.0.len() >= 2).collect();
    ranges.sort_by_key(|ur| (ur.0.len(), ur.start()));

    // greedily pick disjoint ranges, largest first
    let mut chosen = Vec::new();
    while let Some(best) = ranges.pop() {
        let mut oldranges = Vec::new();
        swap(&mut ranges, &mut oldranges);
        for ur in oldranges {
            ur.subtract(&best, &mut ranges);
        }

        chosen.push(best);
        ranges.sort_by_key(|ur| (ur.0.len(), ur.start()));
    }

    let mut replace = FxHashMap::default();
    for ur in chosen {
        let mut ladder = DupLadder::new(ur.0.len(), 0);
        let mut first = true;
        for pos in ur.0 {
            let mut ops = ladder.next().unwrap();
            // the first access keeps its load in front of the ladder
            if first {
                ops.insert(0, irdata.instructions[pos].clone());
                first = false;
            }
            replace.insert(pos, ops);
        }
    }
    irdata.replace_instrs(replace);
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvm::ops::{DUP, DUP2, POP};

    fn ops_of(steps: Vec<Vec<IrIns>>) -> Vec<Vec<u8>> {
        steps
            .into_iter()
            .map(|v| v.into_iter().map(|i| i.bytecode.unwrap()[0]).collect())
            .collect()
    }

    #[test]
    fn ladder_single_use() {
        let mut ladder = DupLadder::new(1, 0);
        let steps: Vec<_> = (0..2).map(|_| ladder.next().unwrap()).collect();
        // one access, nothing to duplicate, nothing left over
        assert_eq!(ops_of(steps), vec![Vec::<u8>::new(), Vec::new()]);
    }

    #[test]
    fn ladder_two_uses() {
        let mut ladder = DupLadder::new(2, 0);
        let steps: Vec<_> = (0..3).map(|_| ladder.next().unwrap()).collect();
        assert_eq!(ops_of(steps), vec![vec![DUP], Vec::new(), Vec::new()]);
    }

    #[test]
    fn ladder_many_uses_amortizes() {
        let n = 8;
        let mut ladder = DupLadder::new(n, 0);
        let steps: Vec<_> = (0..n + 1).map(|_| ladder.next().unwrap()).collect();
        let flat: Vec<u8> = steps.iter().flatten().map(|i| i.bytecode.as_ref().unwrap()[0]).collect();
        // dup ladder keeps the invariant: every access consumes one copy
        let dups = flat.iter().filter(|&&op| op == DUP).count();
        let dup2s = flat.iter().filter(|&&op| op == DUP2).count();
        let pops = flat.iter().filter(|&&op| op == POP).count();
        assert_eq!(1 + dups + 2 * dup2s, n + pops);
    }

    #[test]
    fn ladder_keeps_one_after() {
        let mut ladder = DupLadder::new(1, 1);
        let steps: Vec<_> = (0..2).map(|_| ladder.next().unwrap()).collect();
        // the extra needed copy forces a dup and leaves no pop
        assert_eq!(ops_of(steps), vec![vec![DUP], Vec::new()]);
    }
}
