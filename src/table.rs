//! The open-addressed hash table shared by the string interning table and
//! the globals table (spec §4.2: "Generic hash table (globals): same
//! probing scheme").
//!
//! Both tables key on an interned `ObjString` pointer. Because strings are
//! interned (exactly one allocation per distinct byte sequence, spec
//! invariant 1), table lookups by key compare *pointers*, not bytes -- the
//! one place bytes are compared directly is `find_string`, used by the
//! interning protocol itself to discover whether a byte sequence has
//! already been interned.

use std::ptr::NonNull;

use crate::object::Obj;
use crate::value::Value;

const MAX_LOAD_FACTOR: f64 = 0.75;
const FNV_OFFSET_BASIS: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

/// FNV-1a over raw bytes, seed and multiplier pinned by spec §4.2.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Clone, Copy)]
struct Entry {
    /// `None` + `Value::Nil` is an empty slot; `None` + `Value::Bool(true)`
    /// is a tombstone (spec §4.2).
    key: Option<NonNull<Obj>>,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry { key: None, value: Value::Nil }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }

    fn is_empty_slot(&self) -> bool {
        self.key.is_none() && !self.is_tombstone()
    }
}

fn key_hash(key: NonNull<Obj>) -> u32 {
    // SAFETY: table keys are always ObjString objects kept alive by a root
    // (globals/interning table entries are themselves GC roots/weak set).
    unsafe { key.as_ref() }.as_string().expect("table key must be a String object").hash
}

/// Open-addressed, linear-probing hash table keyed by interned strings.
pub struct Table {
    entries: Vec<Entry>,
    /// Occupied slots *and* tombstones, used to decide when to grow (a
    /// table full of tombstones must still be rebuilt, matching the
    /// standard craftinginterpreters-style table).
    count: usize,
}

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry(entries: &[Entry], capacity: usize, hash: u32, is_match: impl Fn(NonNull<Obj>) -> bool) -> usize {
        let mut index = (hash as usize) & (capacity - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                Some(key) if is_match(key) => return index,
                None => {
                    if entry.is_tombstone() {
                        if first_tombstone.is_none() {
                            first_tombstone = Some(index);
                        }
                    } else {
                        return first_tombstone.unwrap_or(index);
                    }
                }
                Some(_) => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() { 8 } else { self.entries.len() * 2 };
        let mut new_entries = vec![Entry::empty(); new_capacity];
        let mut new_count = 0;
        for entry in self.entries.iter() {
            let Some(key) = entry.key else { continue };
            let index = Self::find_entry(&new_entries, new_capacity, key_hash(key), |k| k == key);
            new_entries[index] = Entry { key: Some(key), value: entry.value };
            new_count += 1;
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    /// Inserts or overwrites `key -> value`. Returns `true` if this created
    /// a brand-new entry (matches spec: "set ... returns whether a new
    /// entry was added").
    pub fn set(&mut self, key: NonNull<Obj>, value: Value) -> bool {
        if self.entries.is_empty() || (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD_FACTOR {
            self.grow();
        }
        let capacity = self.entries.len();
        let hash = key_hash(key);
        let index = Self::find_entry(&self.entries, capacity, hash, |k| k == key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        if is_new_key && !entry.is_tombstone() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new_key
    }

    pub fn get(&self, key: NonNull<Obj>) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = Self::find_entry(&self.entries, self.entries.len(), key_hash(key), |k| k == key);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    pub fn contains(&self, key: NonNull<Obj>) -> bool {
        self.get(key).is_some()
    }

    /// Tombstones the entry for `key`. Returns `true` if an entry existed.
    pub fn delete(&mut self, key: NonNull<Obj>) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let capacity = self.entries.len();
        let index = Self::find_entry(&self.entries, capacity, key_hash(key), |k| k == key);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry { key: None, value: Value::Bool(true) };
        true
    }

    /// Copies every entry from `from` into `self`, overwriting collisions.
    pub fn add_all(&mut self, from: &Table) {
        for entry in &from.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.value);
            }
        }
    }

    /// Looks up an interned string by raw content rather than by pointer --
    /// the one place this table compares bytes instead of identity, used
    /// by the "intern or allocate" protocol (spec §4.2 step 2).
    pub fn find_string(&self, bytes: &[u8], hash: u32) -> Option<NonNull<Obj>> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = (hash as usize) & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if !entry.is_tombstone() => return None,
                Some(key) => {
                    // SAFETY: table keys are always live String objects.
                    let s = unsafe { key.as_ref() }.as_string().expect("string key");
                    if s.hash == hash && s.bytes.as_ref() == bytes {
                        return Some(key);
                    }
                }
                None => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    /// GC weak-cleanup (spec §4.6 step 3): drop entries whose key string is
    /// not marked.
    pub fn remove_white(&mut self) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key {
                // SAFETY: see `key_hash`.
                if !unsafe { key.as_ref() }.marked.get() {
                    *entry = Entry { key: None, value: Value::Bool(true) };
                }
            }
        }
    }

    /// Iterates over every live `(key, value)` pair, used by GC root
    /// marking for the globals table (spec §4.6 Roots).
    pub fn iter(&self) -> impl Iterator<Item = (NonNull<Obj>, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fnv1a_matches_known_vector() {
        // Empty-string FNV-1a(32) is the offset basis itself.
        assert_eq!(fnv1a_hash(b""), FNV_OFFSET_BASIS);
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(fnv1a_hash(b"hello"), fnv1a_hash(b"hello"));
        assert_ne!(fnv1a_hash(b"hello"), fnv1a_hash(b"world"));
    }

    proptest! {
        /// Hash determinism (spec §8 property 2): the same bytes always
        /// hash the same, independent of any particular table instance.
        #[test]
        fn hash_determinism(bytes: Vec<u8>) {
            let first = fnv1a_hash(&bytes);
            let second = fnv1a_hash(&bytes);
            prop_assert_eq!(first, second);
        }
    }
}
