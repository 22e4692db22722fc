//! Open-addressed hash table keyed by interned strings.
//!
//! Used for globals, class method tables, and instance field tables. Keys
//! are [`ObjRef`] handles into the [`Heap`]'s string objects; since strings
//! are interned, identity comparison of the handle is all that's needed —
//! the actual probing still hashes by content (`Heap::str_hash`) so two
//! in-flight handles that happen to name the same content always land in
//! the same slot.

use crate::heap::{Heap, ObjRef};

#[derive(Clone)]
enum Slot<V> {
    Empty,
    /// A deleted entry. Kept (rather than cleared) so later probes for keys
    /// that hashed past it still find them.
    Tombstone,
    Occupied(ObjRef, V),
}

/// An open-addressed map from interned strings to `V`, growing at a 0.75
/// load factor with power-of-two capacities.
#[derive(Clone)]
pub struct Table<V> {
    slots: Vec<Slot<V>>,
    /// Live entries *plus* tombstones — this is what the load-factor check
    /// uses, so tombstones still push growth even though they don't hold
    /// live data.
    count: usize,
}

const MIN_CAPACITY: usize = 8;
const MAX_LOAD: f64 = 0.75;

impl<V> Table<V> {
    pub fn new() -> Self {
        Self { slots: Vec::new(), count: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &V)> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied(k, v) => Some((*k, v)),
            _ => None,
        })
    }

    fn find_slot(slots: &[Slot<V>], heap: &Heap, key: ObjRef) -> usize {
        let cap = slots.len();
        let mut idx = (heap.str_hash(key) as usize) & (cap - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            match &slots[idx] {
                Slot::Empty => return tombstone.unwrap_or(idx),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(idx);
                    }
                }
                Slot::Occupied(k, _) => {
                    if *k == key {
                        return idx;
                    }
                }
            }
            idx = (idx + 1) & (cap - 1);
        }
    }

    pub fn get(&self, heap: &Heap, key: ObjRef) -> Option<&V> {
        if self.slots.is_empty() {
            return None;
        }
        match &self.slots[Self::find_slot(&self.slots, heap, key)] {
            Slot::Occupied(_, v) => Some(v),
            _ => None,
        }
    }

    pub fn contains(&self, heap: &Heap, key: ObjRef) -> bool {
        self.get(heap, key).is_some()
    }

    /// Inserts or overwrites `key => value`. Returns `true` if this created a
    /// brand new entry (matches clox's `tableSet` return value, used by
    /// `DEFINE_GLOBAL`/`SET_GLOBAL` to distinguish define-vs-assign).
    pub fn set(&mut self, heap: &Heap, key: ObjRef, value: V) -> bool {
        if self.slots.is_empty() || (self.count + 1) as f64 / self.slots.len() as f64 > MAX_LOAD {
            self.grow(heap);
        }
        let idx = Self::find_slot(&self.slots, heap, key);
        let is_new = !matches!(self.slots[idx], Slot::Occupied(_, _));
        if is_new && matches!(self.slots[idx], Slot::Empty) {
            self.count += 1;
        }
        self.slots[idx] = Slot::Occupied(key, value);
        is_new
    }

    /// Deletes `key`, leaving a tombstone. Returns `true` if it was present.
    pub fn delete(&mut self, heap: &Heap, key: ObjRef) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let idx = Self::find_slot(&self.slots, heap, key);
        match self.slots[idx] {
            Slot::Occupied(..) => {
                self.slots[idx] = Slot::Tombstone;
                true
            }
            _ => false,
        }
    }

    fn grow(&mut self, heap: &Heap) {
        let new_cap = (self.slots.len() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.slots, (0..new_cap).map(|_| Slot::Empty).collect());
        self.count = 0;
        for slot in old {
            if let Slot::Occupied(k, v) = slot {
                let idx = Self::find_slot(&self.slots, heap, k);
                self.count += 1;
                self.slots[idx] = Slot::Occupied(k, v);
            }
        }
    }
}

impl<V> Default for Table<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn set_get_delete_roundtrip() {
        let mut heap = Heap::new();
        let k1 = heap.intern("a");
        let k2 = heap.intern("b");
        let mut t: Table<Value> = Table::new();

        assert!(t.set(&heap, k1, Value::Number(1.0)));
        assert!(!t.set(&heap, k1, Value::Number(2.0)), "re-set of same key is not new");
        assert!(t.set(&heap, k2, Value::Number(3.0)));

        assert_eq!(t.get(&heap, k1), Some(&Value::Number(2.0)));
        assert_eq!(t.get(&heap, k2), Some(&Value::Number(3.0)));

        assert!(t.delete(&heap, k1));
        assert_eq!(t.get(&heap, k1), None);
        // k2 must still be reachable despite the tombstone left behind.
        assert_eq!(t.get(&heap, k2), Some(&Value::Number(3.0)));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let mut t: Table<Value> = Table::new();
        let keys: Vec<_> = (0..100).map(|i| heap.intern(&format!("k{i}"))).collect();
        for (i, k) in keys.iter().enumerate() {
            t.set(&heap, *k, Value::Number(i as f64));
        }
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(t.get(&heap, *k), Some(&Value::Number(i as f64)));
        }
    }
}
