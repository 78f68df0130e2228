/* Greedy pool reservation for constants in over-long methods */

use rustc_hash::FxHashMap;

use crate::jvm::cpool::{ConstantPool, Entry};
use crate::jvm::ir::IrKind;
use crate::jvm::writeir::MethodIr;

/// Reserves pool slots for the constants that buy the most bytecode back in
/// methods that might exceed the 64k code limit. The allocation is greedy;
/// far from optimal, but no known real-world class even comes close to
/// exhausting the pool, so the simple policy is enough.
pub fn allocate_required_constants(pool: &mut dyn ConstantPool, irs: Vec<&MethodIr>) {
    if irs.is_empty() {
        return;
    }

    let mut narrow_pairs: FxHashMap<Entry, u32> = FxHashMap::default();
    let mut wide_pairs: FxHashMap<Entry, u32> = FxHashMap::default();
    let mut alt_lens: FxHashMap<Entry, usize> = FxHashMap::default();
    for irdata in irs {
        for ins in &irdata.instructions {
            if let IrKind::PrimConst(data) = &ins.kind {
                let len = ins.bytecode.as_ref().unwrap().len();
                alt_lens.insert(data.key.clone(), len);
                if data.st.is_wide() {
                    if len > 3 {
                        *wide_pairs.entry(data.key.clone()).or_insert(0) += 1;
                    }
                } else if len > 2 {
                    *narrow_pairs.entry(data.key.clone()).or_insert(0) += 1;
                }
            }
        }
    }

    // entries already in the pool cost nothing
    for x in pool.vals() {
        if let Some(x) = x.as_ref() {
            narrow_pairs.remove(x);
            wide_pairs.remove(x);
        }
    }

    // when everything fits, the most used narrow constants take the low
    // slots so they get the two-byte ldc
    if pool.space() >= narrow_pairs.len() + 2 * wide_pairs.len() && pool.lowspace() > 0 {
        let most_common: Vec<Entry> = {
            let mut most_common: Vec<_> = narrow_pairs.iter().collect();
            most_common.sort_by_key(|item| (u32::MAX - *item.1, item.0.cmp_key()));
            most_common.into_iter().take(pool.lowspace()).map(|item| item.0.clone()).collect()
        };
        for k in most_common {
            narrow_pairs.remove(&k);
            let _ = pool.insert_directly(k, true);
        }
    }

    // score = bytes saved per use times use count; ldc_w costs 3 bytes
    let mut scores: FxHashMap<Entry, usize> = FxHashMap::default();
    for (p, &count) in narrow_pairs.iter().chain(wide_pairs.iter()) {
        scores.insert(p.clone(), (alt_lens[p] - 3) * count as usize);
    }

    // queues sorted so the best candidates pop last
    let mut narrowq: Vec<Entry> = {
        let mut items: Vec<Entry> = narrow_pairs.into_keys().collect();
        items.sort_by_key(|p| (scores[p], p.cmp_key()));
        items
    };
    let mut wideq: Vec<Entry> = {
        let mut items: Vec<Entry> = wide_pairs.into_keys().collect();
        items.sort_by_key(|p| (scores[p], p.cmp_key()));
        items
    };

    while pool.space() >= 1 && (!narrowq.is_empty() || !wideq.is_empty()) {
        if narrowq.is_empty() && pool.space() < 2 {
            break;
        }

        // prefer a wide entry only over the two narrow entries it displaces
        let nscore = match narrowq.len() {
            0 => 0,
            1 => scores[&narrowq[0]],
            n => scores[&narrowq[n - 1]] + scores[&narrowq[n - 2]],
        };
        let wscore = match wideq.last() {
            Some(w) => scores[w],
            None => 0,
        };

        if pool.space() >= 2 && wscore > nscore && wscore > 0 {
            let _ = pool.insert_directly(wideq.pop().unwrap(), false);
        } else if nscore > 0 {
            let _ = pool.insert_directly(narrowq.pop().unwrap(), true);
        } else {
            break;
        }
    }
}
