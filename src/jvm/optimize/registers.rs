/* Register-oriented passes: copy propagation, dead stores, allocation */

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::jvm::ir::{self, IrKind, LabelId, RegKey, INVALID_KEY};
use crate::jvm::writeir::MethodIr;

// Copy propagation: when one register is moved to another, later loads of
// the copy read the original register instead (until either is written).
// Stores stay put here; if they end up unused, the dead-store pass removes
// them. As everywhere else, there is no iinc to worry about.

/// Registers currently holding the same value. The designated root is the
/// one loads are redirected to; insertion order is kept so that the oldest
/// surviving member takes over when the root is overwritten.
#[derive(Clone, Default)]
struct CopySet {
    root: RegKey,
    members: FxHashSet<RegKey>,
    order: VecDeque<RegKey>,
}

impl CopySet {
    fn new(key: RegKey) -> CopySet {
        let mut members = FxHashSet::default();
        members.insert(key);
        CopySet { root: key, members, order: VecDeque::new() }
    }

    fn add(&mut self, key: RegKey) {
        debug_assert!(!self.members.is_empty());
        self.members.insert(key);
        self.order.push_back(key);
    }

    fn remove(&mut self, key: RegKey) {
        self.members.remove(&key);
        while !self.order.is_empty() && !self.members.contains(&self.root) {
            self.root = self.order.pop_front().unwrap();
        }
    }
}

/// All live copy sets, as an arena indexed by a per-register map. Cloning
/// gives an independent deep copy, which single-predecessor forward jumps
/// rely on.
#[derive(Clone, Default)]
struct CopySets {
    sets: Vec<CopySet>,
    of: FxHashMap<RegKey, usize>,
}

impl CopySets {
    fn load_root(&self, key: RegKey) -> RegKey {
        match self.of.get(&key) {
            Some(&i) => self.sets[i].root,
            None => key,
        }
    }

    fn clobber(&mut self, key: RegKey) {
        if let Some(i) = self.of.remove(&key) {
            self.sets[i].remove(key);
        }
    }

    /// Records `dest = src`; returns false when both already hold the same
    /// value, meaning the load/store pair can be deleted outright.
    fn move_copy(&mut self, src: RegKey, dest: RegKey) -> bool {
        let s_set = self.of.get(&src).copied();
        let d_set = self.of.get(&dest).copied();
        if let (Some(s), Some(d)) = (s_set, d_set) {
            if s == d {
                return false;
            }
        }
        if let Some(d) = d_set {
            self.sets[d].remove(dest);
        }
        let s = match s_set {
            Some(s) => s,
            None => {
                self.sets.push(CopySet::new(src));
                let s = self.sets.len() - 1;
                self.of.insert(src, s);
                s
            }
        };
        self.sets[s].add(dest);
        self.of.insert(dest, s);
        true
    }
}

pub fn copy_propagation(irdata: &mut MethodIr) {
    let mut replace = FxHashMap::default();
    let mut single_pred_infos: FxHashMap<LabelId, CopySets> = FxHashMap::default();

    let mut current = CopySets::default();
    let mut prev: (usize, bool, Option<ir::RegAccessData>) = (0, true, None);

    for (i, instr) in irdata.instructions.iter().enumerate() {
        if irdata.is_target(instr.lbl()) {
            let lbl = instr.lbl().unwrap();
            // control flow merges wipe the info, except a forward jump from
            // a lone predecessor, whose state was parked below
            let pred_counts = irdata.target_pred_counts[&lbl];
            if !prev.1 && pred_counts == 1 {
                current = single_pred_infos.remove(&lbl).unwrap_or_default();
            } else {
                current = CopySets::default();
            }
        } else if let IrKind::RegAccess(data) = &instr.kind {
            let key = data.key;
            if data.store {
                // a store preceded by a load is a register-to-register copy
                if let Some(data2) = prev.2.take() {
                    if !data2.store {
                        if !current.move_copy(data2.key, key) {
                            replace.insert(prev.0, Vec::new());
                            replace.insert(i, Vec::new());
                        }
                    } else {
                        current.clobber(key);
                    }
                } else {
                    current.clobber(key);
                }
            } else {
                let root_key = current.load_root(key);
                if key != root_key {
                    debug_assert!(!replace.contains_key(&i));
                    replace.insert(i, vec![ir::reg_access(root_key.0, root_key.1, false)]);
                }
            }
        } else {
            for target in instr.targets() {
                let lbl = LabelId::DPos(target);
                if irdata.target_pred_counts[&lbl] == 1 {
                    single_pred_infos.insert(lbl, current.clone());
                }
            }
        }

        prev = (
            i,
            instr.fallsthrough(),
            if let IrKind::RegAccess(data) = &instr.kind { Some(data.clone()) } else { None },
        );
    }

    irdata.replace_instrs(replace);
}

/// Removes stores to registers never read anywhere in the method. The
/// paired load or constant goes with the store when possible; otherwise
/// the store becomes a pop of the right width.
pub fn remove_unused_registers(irdata: &mut MethodIr) {
    let mut used = FxHashSet::default();
    for instr in &irdata.instructions {
        if let IrKind::RegAccess(data) = &instr.kind {
            if !data.store {
                used.insert(data.key);
            }
        }
    }

    let mut replace = FxHashMap::default();
    let mut prev_was_replaceable = false;
    for (i, instr) in irdata.instructions.iter().enumerate() {
        if let IrKind::RegAccess(data) = &instr.kind {
            if !used.contains(&data.key) {
                debug_assert!(data.store);

                if prev_was_replaceable {
                    replace.insert(i - 1, Vec::new());
                    replace.insert(i, Vec::new());
                } else {
                    let wide = data.key.1.is_wide();
                    replace.insert(i, vec![if wide { ir::pop2() } else { ir::pop() }]);
                }
            }

            prev_was_replaceable = !data.store;
        } else {
            prev_was_replaceable = instr.is_constant();
        }
    }
    irdata.replace_instrs(replace);
}

/// First-come-first-served slot assignment. Parameters keep their incoming
/// slots; everything else is appended, wide keys taking two slots.
pub fn allocate_registers_simple(irdata: &mut MethodIr) {
    let mut regmap: FxHashMap<RegKey, u16> =
        irdata.initial_args.iter().enumerate().map(|(i, &v)| (v, i as u16)).collect();
    let mut nextreg = irdata.initial_args.len() as u16;

    for instr in &mut irdata.instructions {
        if let IrKind::RegAccess(data) = &instr.kind {
            let reg = *regmap.entry(data.key).or_insert_with(|| {
                let t = nextreg;
                nextreg += 1;
                if data.key.1.is_wide() {
                    nextreg += 1;
                }
                t
            });
            instr.bytecode = Some(data.calc_bytecode(reg));
        }
    }
    irdata.numregs = Some(nextreg);
}

/// Use-count-sorted allocation: hot registers land in slots 0-3 (one-byte
/// access forms) or 4-255 (two-byte forms). Parameters still keep their
/// slots, with one exception: a single sufficiently hot non-parameter may
/// swap with a cold narrow parameter in the first four slots, paid for by
/// a load/store preamble.
pub fn allocate_registers_sorted(irdata: &mut MethodIr) {
    let mut use_counts: FxHashMap<RegKey, u32> = FxHashMap::default();
    for instr in &irdata.instructions {
        if let IrKind::RegAccess(data) = &instr.kind {
            *use_counts.entry(data.key).or_insert(0) += 1;
        }
    }

    let mut regs = irdata.initial_args.clone();
    let mut rest: Vec<RegKey> = use_counts.keys().copied().collect();
    rest.sort_by_key(|k| (!use_counts[k], *k)); // bitwise not sorts descending
    for key in rest {
        if !irdata.initial_args.contains(&key) {
            regs.push(key);
            if key.1.is_wide() {
                regs.push(INVALID_KEY);
            }
        }
    }

    // parameters may never be accessed; give them a count anyway
    for key in &irdata.initial_args {
        use_counts.entry(*key).or_insert(0);
    }

    // Swapping a parameter out of a prime slot requires moving its incoming
    // value, so the general case is not worth it. One swap of a nonwide
    // candidate with at least 3 more uses than a nonwide parameter in slots
    // 0-3 captures most of the benefit.
    let nargs = irdata.initial_args.len();
    let candidate_i = nargs.max(4);
    if candidate_i < regs.len() && regs[candidate_i] != INVALID_KEY {
        let candidate = regs[candidate_i];
        if !candidate.1.is_wide() && use_counts[&candidate] >= 3 {
            for i in 0..nargs.min(4) {
                // skip wide parameters and wide pair halves
                if regs[i] == INVALID_KEY || regs[i + 1] == INVALID_KEY {
                    continue;
                }

                let target = regs[i];
                if use_counts[&candidate] > use_counts[&target] + 3 {
                    regs[i] = candidate;
                    regs[candidate_i] = target;
                    // move the parameter's incoming value to its new home
                    let load = ir::raw_access(i as u16, target.1, false);
                    let store = ir::reg_access(target.0, target.1, true);
                    irdata.instructions.insert(0, store);
                    irdata.instructions.insert(0, load);
                    break;
                }
            }
        }
    }

    let regmap: FxHashMap<RegKey, u16> =
        regs.iter().enumerate().map(|(i, &v)| (v, i as u16)).collect();
    for instr in &mut irdata.instructions {
        if instr.bytecode.is_none() {
            if let IrKind::RegAccess(data) = &instr.kind {
                instr.bytecode = Some(data.calc_bytecode(regmap[&data.key]));
            }
        }
    }
    irdata.numregs = Some(regs.len() as u16);
}
