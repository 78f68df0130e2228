/* Persistent sparse register map */

use std::rc::Rc;

// Register state during inference is versioned per program point, so a plain
// array would be cloned on every instruction. Instead registers live in a
// persistent 16-ary tree: the first 16 slots are stored inline in the root,
// deeper indices are routed into one of 16 lazily allocated subtrees by
// index modulo 16. Writes copy only the spine; untouched subtrees are shared
// between versions, and a write that would not change a value returns the
// receiver unchanged (so pointer equality doubles as cheap map equality).

const DIRECT: usize = 16;
const SPLIT: usize = 16;

struct Node<T> {
    direct: [T; DIRECT],
    children: [RegMap<T>; SPLIT],
}

impl<T: Copy + Default + Eq> Clone for Node<T> {
    fn clone(&self) -> Self {
        Node { direct: self.direct, children: self.children.clone() }
    }
}

impl<T: Copy + Default + Eq> Default for Node<T> {
    fn default() -> Self {
        Node { direct: [T::default(); DIRECT], children: Default::default() }
    }
}

impl<T: Copy + Default + Eq> Node<T> {
    fn get(&self, i: usize) -> T {
        if i < DIRECT {
            return self.direct[i];
        }
        let i = i - DIRECT;
        self.children[i % SPLIT].get_at(i / SPLIT)
    }

    fn set(&mut self, i: usize, val: T) {
        if i < DIRECT {
            self.direct[i] = val;
            return;
        }
        let i = i - DIRECT;
        self.children[i % SPLIT].set_at(i / SPLIT, val);
    }

    fn merge<F>(&mut self, rhs: &Self, func: &F, default_is_bottom: bool) -> bool
    where
        F: Fn(T, T) -> T,
    {
        let mut changed = false;
        for i in 0..DIRECT {
            let merged = func(self.direct[i], rhs.direct[i]);
            if merged != self.direct[i] {
                self.direct[i] = merged;
                changed = true;
            }
        }
        for i in 0..SPLIT {
            changed |= self.children[i].merge(&rhs.children[i], func, default_is_bottom);
        }
        changed
    }
}

pub struct RegMap<T>(Option<Rc<Node<T>>>);

impl<T> Clone for RegMap<T> {
    fn clone(&self) -> Self {
        RegMap(self.0.clone())
    }
}

impl<T> Default for RegMap<T> {
    fn default() -> Self {
        RegMap(None)
    }
}

impl<T: Copy + Default + Eq> RegMap<T> {
    fn get_at(&self, i: usize) -> T {
        match &self.0 {
            Some(node) => node.get(i),
            None => T::default(),
        }
    }

    pub fn get(&self, reg: u16) -> T {
        self.get_at(reg as usize)
    }

    fn set_at(&mut self, i: usize, val: T) {
        if val == self.get_at(i) {
            return;
        }
        let node = self.0.get_or_insert_with(|| Rc::new(Node::default()));
        Node::set(Rc::make_mut(node), i, val);
    }

    pub fn set(&mut self, reg: u16, val: T) {
        self.set_at(reg as usize, val);
    }

    /// Identity comparison on the root pointer. Because no-op writes short
    /// circuit, converged dataflow states compare equal by pointer.
    pub fn same(&self, rhs: &Self) -> bool {
        match (&self.0, &rhs.0) {
            (None, None) => true,
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// In-place join with `rhs` under `func`; reports whether anything
    /// changed. `default_is_bottom` describes how the lattice treats absent
    /// entries: if merging any value with the default yields the default,
    /// an absent rhs wipes this side; otherwise an absent side is neutral.
    pub fn merge<F>(&mut self, rhs: &Self, func: &F, default_is_bottom: bool) -> bool
    where
        F: Fn(T, T) -> T,
    {
        if self.same(rhs) {
            return false;
        }

        if default_is_bottom {
            if self.0.is_none() {
                return false;
            }
            if rhs.0.is_none() {
                self.0 = None;
                return true;
            }
        } else {
            if rhs.0.is_none() {
                return false;
            }
            if self.0.is_none() {
                self.0 = rhs.0.clone();
                return true;
            }
        }

        let rhs_node = rhs.0.as_ref().unwrap().clone();
        let node = self.0.as_mut().unwrap();
        Node::merge(Rc::make_mut(node), &rhs_node, func, default_is_bottom)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_defaults() {
        let m: RegMap<u8> = RegMap::default();
        assert_eq!(m.get(0), 0);
        assert_eq!(m.get(1000), 0);
    }

    #[test]
    fn set_and_get_deep() {
        let mut m: RegMap<u32> = RegMap::default();
        for reg in [0u16, 5, 15, 16, 17, 255, 4095] {
            m.set(reg, reg as u32 + 1);
        }
        for reg in [0u16, 5, 15, 16, 17, 255, 4095] {
            assert_eq!(m.get(reg), reg as u32 + 1);
        }
        assert_eq!(m.get(100), 0);
    }

    #[test]
    fn noop_write_shares_root() {
        let mut m: RegMap<u8> = RegMap::default();
        m.set(3, 7);
        let snapshot = m.clone();
        m.set(3, 7);
        assert!(m.same(&snapshot));

        m.set(3, 8);
        assert!(!m.same(&snapshot));
        assert_eq!(snapshot.get(3), 7);
        assert_eq!(m.get(3), 8);
    }

    #[test]
    fn default_write_on_empty_is_noop() {
        let mut m: RegMap<u8> = RegMap::default();
        m.set(40, 0);
        assert!(m.same(&RegMap::default()));
    }

    #[test]
    fn merge_intersection() {
        let mut a: RegMap<u8> = RegMap::default();
        let mut b: RegMap<u8> = RegMap::default();
        a.set(1, 0b11);
        b.set(1, 0b01);
        assert!(a.merge(&b, &|x, y| x & y, true));
        assert_eq!(a.get(1), 0b01);
        // merging again changes nothing
        assert!(!a.merge(&b, &|x, y| x & y, true));
    }

    #[test]
    fn merge_with_empty_bottom() {
        let mut a: RegMap<u8> = RegMap::default();
        a.set(1, 3);
        let empty = RegMap::default();
        assert!(a.merge(&empty, &|x, y| x & y, true));
        assert!(a.same(&empty));
    }

    #[test]
    fn merge_with_empty_neutral() {
        let mut a: RegMap<bool> = RegMap::default();
        a.set(1, true);
        let empty = RegMap::default();
        assert!(!a.merge(&empty, &|x, y| x | y, false));
        assert!(a.get(1));
    }

    #[test]
    fn random_ops_match_reference() {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let mut map: RegMap<u32> = RegMap::default();
        let mut reference = std::collections::HashMap::new();
        let mut snapshots = Vec::new();

        for step in 0..10_000 {
            let reg = rng.gen_range(0..2048u16);
            if rng.gen_bool(0.7) {
                let val = rng.gen_range(0..5u32);
                map.set(reg, val);
                if val == 0 {
                    reference.remove(&reg);
                } else {
                    reference.insert(reg, val);
                }
            } else {
                let expected = reference.get(&reg).copied().unwrap_or(0);
                assert_eq!(map.get(reg), expected);
            }
            if step % 1000 == 0 {
                snapshots.push((map.clone(), reference.clone()));
            }
        }

        // persistence: old versions are unaffected by later writes
        for (snap, reference) in snapshots {
            for (&reg, &val) in &reference {
                assert_eq!(snap.get(reg), val);
            }
        }
    }
}
