//! Open-addressed hash table: globals, instance fields, class methods, and
//! (via [`Heap`](crate::heap::Heap)) the weak string-intern set all share
//! this implementation.
//!
//! Grounded on `examples/original_source/src/common/hashtable.h` (`Table`,
//! `Entry`, `tableGet`/`tableSet`/`tableDelete`/`tableFindString`,
//! `tableRemoveWhite`). Linear probing with tombstones; load factor capped at
//! 0.75; capacity doubles starting from 8. Keys are [`ObjRef`]s to interned
//! strings, each inserted alongside its precomputed hash so probing never
//! needs to dereference the heap.

use crate::object::ObjRef;
use crate::value::Value;

const INITIAL_CAPACITY: usize = 8;
const MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone)]
enum Slot {
    Empty,
    Tombstone,
    Occupied { key: ObjRef, hash: u32, value: Value },
}

/// Open-addressed hash map from an interned string identity to a [`Value`].
#[derive(Debug, Clone, Default)]
pub struct Table {
    slots: Vec<Slot>,
    /// Number of live (non-tombstone) entries. Spec: "tombstones... count
    /// toward load but not toward `count`".
    occupied: usize,
    tombstones: usize,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self { slots: Vec::new(), occupied: 0, tombstones: 0 }
    }

    /// Number of live entries (excludes tombstones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.occupied
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Index of the first tombstone or empty slot in the probe sequence for
    /// `hash`, or the slot whose key already matches `key`, whichever comes
    /// first ("insertion reuses the first tombstone seen").
    fn probe(&self, key: ObjRef, hash: u32) -> usize {
        let cap = self.capacity() as u32;
        let mut index = hash % cap;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.slots[index as usize] {
                Slot::Empty => return first_tombstone.unwrap_or(index as usize),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index as usize);
                    }
                }
                Slot::Occupied { key: k, .. } if *k == key => return index as usize,
                Slot::Occupied { .. } => {}
            }
            index = (index + 1) % cap;
        }
    }

    fn grow(&mut self) {
        let new_cap = if self.capacity() == 0 { INITIAL_CAPACITY } else { self.capacity() * 2 };
        let old = core::mem::replace(&mut self.slots, vec![]);
        self.slots = (0..new_cap).map(|_| Slot::Empty).collect();
        self.occupied = 0;
        self.tombstones = 0;
        for slot in old {
            if let Slot::Occupied { key, hash, value } = slot {
                self.set(key, hash, value);
            }
        }
    }

    fn maybe_grow(&mut self) {
        let cap = self.capacity();
        if cap == 0 || (self.occupied + self.tombstones + 1) as f64 > cap as f64 * MAX_LOAD {
            self.grow();
        }
    }

    /// Look up `key` (an interned string's [`ObjRef`]) with its precomputed
    /// hash.
    #[must_use]
    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.capacity() == 0 {
            return None;
        }
        let idx = self.probe(key, hash);
        match &self.slots[idx] {
            Slot::Occupied { key: k, value, .. } if *k == key => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn contains(&self, key: ObjRef, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// Inserts or overwrites `key => value`. Returns `true` if `key` was not
    /// already present.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        self.maybe_grow();
        let idx = self.probe(key, hash);
        let is_new = !matches!(&self.slots[idx], Slot::Occupied { key: k, .. } if *k == key);
        let was_tombstone = matches!(&self.slots[idx], Slot::Tombstone);
        self.slots[idx] = Slot::Occupied { key, hash, value };
        if is_new {
            self.occupied += 1;
            if was_tombstone {
                self.tombstones -= 1;
            }
        }
        is_new
    }

    /// Deletes `key`, leaving a tombstone behind so later probe chains stay
    /// intact. Returns `true` if the key was present.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.capacity() == 0 {
            return false;
        }
        let idx = self.probe(key, hash);
        if matches!(&self.slots[idx], Slot::Occupied { key: k, .. } if *k == key) {
            self.slots[idx] = Slot::Tombstone;
            self.occupied -= 1;
            self.tombstones += 1;
            true
        } else {
            false
        }
    }

    /// Bulk-copies all entries of `other` into `self` (used by `OP_INHERIT`
    /// to copy a superclass's methods down into a subclass).
    pub fn add_all(&mut self, other: &Table) {
        for slot in &other.slots {
            if let Slot::Occupied { key, hash, value } = slot {
                self.set(*key, *hash, *value);
            }
        }
    }

    /// Finds an entry whose key satisfies `pred`, scanning the probe chain
    /// for `hash` and stopping at the first empty (non-tombstone) slot, per
    /// spec §3. Used by the string-intern set: `pred` compares candidate
    /// bytes against the heap-resident `ObjString` behind each key.
    pub fn find_with(&self, hash: u32, mut pred: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.capacity() == 0 {
            return None;
        }
        let cap = self.capacity() as u32;
        let mut index = hash % cap;
        loop {
            match &self.slots[index as usize] {
                Slot::Empty => return None,
                Slot::Occupied { key, hash: h, .. } if *h == hash && pred(*key) => {
                    return Some(*key);
                }
                _ => {}
            }
            index = (index + 1) % cap;
        }
    }

    /// Removes every entry whose key satisfies `pred` (turning it into a
    /// tombstone). Used by the GC to prune unmarked strings from the weak
    /// intern table before sweep.
    pub fn retain_keys(&mut self, mut pred: impl FnMut(ObjRef) -> bool) {
        for i in 0..self.slots.len() {
            if let Slot::Occupied { key, .. } = &self.slots[i] {
                if !pred(*key) {
                    self.slots[i] = Slot::Tombstone;
                    self.occupied -= 1;
                    self.tombstones += 1;
                }
            }
        }
    }

    /// Iterates live `(key, value)` pairs, in no particular order. Used by
    /// the GC to mark table contents (keys and values).
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    #[must_use]
    pub fn approx_size(&self) -> usize {
        self.slots.len() * core::mem::size_of::<Slot>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(i: u32) -> ObjRef {
        ObjRef::new(i, 0)
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let mut t = Table::new();
        assert!(t.set(r(1), 100, Value::from(1.0)));
        assert!(!t.set(r(1), 100, Value::from(2.0)));
        assert_eq!(t.get(r(1), 100), Some(Value::from(2.0)));
        assert_eq!(t.len(), 1);
        assert!(t.delete(r(1), 100));
        assert_eq!(t.get(r(1), 100), None);
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn grows_and_keeps_all_entries() {
        let mut t = Table::new();
        for i in 0..200u32 {
            t.set(r(i), i, Value::from(f64::from(i)));
        }
        assert_eq!(t.len(), 200);
        for i in 0..200u32 {
            assert_eq!(t.get(r(i), i), Some(Value::from(f64::from(i))));
        }
    }

    #[test]
    fn tombstones_do_not_break_probe_chains() {
        let mut t = Table::new();
        // Force several keys into the same bucket to build a probe chain.
        for i in 0..4u32 {
            t.set(r(i), 0, Value::from(f64::from(i)));
        }
        assert!(t.delete(r(1), 0));
        // Entries after the tombstone must still be reachable.
        assert_eq!(t.get(r(2), 0), Some(Value::from(2.0)));
        assert_eq!(t.get(r(3), 0), Some(Value::from(3.0)));
    }

    #[test]
    fn retain_keys_prunes_matching_entries() {
        let mut t = Table::new();
        for i in 0..5u32 {
            t.set(r(i), i, Value::nil());
        }
        t.retain_keys(|k| k.index() % 2 == 0);
        assert_eq!(t.len(), 3);
        assert!(t.get(r(1), 1).is_none());
        assert!(t.get(r(2), 2).is_some());
    }
}
