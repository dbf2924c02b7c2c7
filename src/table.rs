use super::object::{GcObject, ObjString};
use super::value::Value;
use std::ptr;

const TABLE_MAX_LOAD_NUM: usize = 3;
const TABLE_MAX_LOAD_DEN: usize = 4;
const INITIAL_CAPACITY: usize = 8;

/// An open-addressed hash table keyed by interned strings, so key equality
/// is pointer identity. Deleted slots become tombstones (null key, true
/// value) that keep probe sequences intact; `count` includes tombstones.
#[derive(Clone, Copy)]
pub struct Entry {
    pub key: *mut GcObject<ObjString>,
    pub value: Value,
}

impl Entry {
    fn empty() -> Self {
        Self {
            key: ptr::null_mut(),
            value: Value::Nil,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_null() && !matches!(self.value, Value::Nil)
    }
}

pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

fn find_entry(entries: &[Entry], key: *mut GcObject<ObjString>) -> usize {
    let capacity = entries.len();
    let mut index = unsafe { (*key).data.hash } as usize % capacity;
    let mut tombstone = None;
    loop {
        let entry = &entries[index];
        if entry.key.is_null() {
            if entry.is_tombstone() {
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else {
                // truly empty: reuse the first tombstone passed, if any
                return tombstone.unwrap_or(index);
            }
        } else if ptr::eq(entry.key, key) {
            return index;
        }
        index = (index + 1) % capacity;
    }
}

impl Table {
    pub fn new() -> Self {
        Self {
            count: 0,
            entries: Vec::new(),
        }
    }

    pub fn get(&self, key: *mut GcObject<ObjString>) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[find_entry(&self.entries, key)];
        if entry.key.is_null() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Inserts or overwrites; returns true when the key was not present.
    pub fn set(&mut self, key: *mut GcObject<ObjString>, value: Value) -> bool {
        if (self.count + 1) * TABLE_MAX_LOAD_DEN > self.entries.len() * TABLE_MAX_LOAD_NUM {
            let capacity = if self.entries.is_empty() {
                INITIAL_CAPACITY
            } else {
                self.entries.len() * 2
            };
            self.adjust_capacity(capacity);
        }
        let index = find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_null();
        if is_new_key && !entry.is_tombstone() {
            self.count += 1;
        }
        entry.key = key;
        entry.value = value;
        is_new_key
    }

    /// Replaces the entry with a tombstone. Returns false when the table is
    /// empty or the key is absent.
    pub fn delete(&mut self, key: *mut GcObject<ObjString>) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_null() {
            return false;
        }
        entry.key = ptr::null_mut();
        entry.value = Value::Bool(true);
        true
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let old = std::mem::replace(&mut self.entries, vec![Entry::empty(); capacity]);
        // tombstones are not carried over
        self.count = 0;
        for entry in old {
            if entry.key.is_null() {
                continue;
            }
            let index = find_entry(&self.entries, entry.key);
            self.entries[index] = entry;
            self.count += 1;
        }
    }

    /// Copies every live entry of `source` into this table.
    pub fn add_all(&mut self, source: &Table) {
        for entry in &source.entries {
            if !entry.key.is_null() {
                self.set(entry.key, entry.value);
            }
        }
    }

    /// Content-based lookup used only by string interning.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<*mut GcObject<ObjString>> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            if entry.key.is_null() {
                if !entry.is_tombstone() {
                    return None;
                }
            } else {
                let key = unsafe { &(*entry.key).data };
                if key.hash == hash && key.chars == chars {
                    return Some(entry.key);
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Drops every entry whose key is unmarked. Runs between marking and
    /// sweeping so the intern table behaves as a weak set.
    pub fn remove_white(&mut self) {
        for index in 0..self.entries.len() {
            let key = self.entries[index].key;
            if !key.is_null() && !unsafe { (*key).marked } {
                self.delete(key);
            }
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }
}
