//! Tables: mutable open-addressed hashes with tombstones.
//!
//! Deletion leaves a tombstone so probe chains stay intact; both live
//! entries and tombstones count toward the rehash threshold. Rehashing
//! drops the tombstones. Putting a nil value removes the key, mirroring
//! the nil-as-absence rule of structs.

use std::cell::RefCell;

use crate::gc::Heap;
use crate::ops;
use crate::value::Value;

const MIN_CAPACITY: usize = 16;

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Entry(Value, Value),
}

struct TableData {
    slots: Vec<Slot>,
    count: usize,
    deleted: usize,
}

pub struct Table {
    inner: RefCell<TableData>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            inner: RefCell::new(TableData {
                slots: Vec::new(),
                count: 0,
                deleted: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: Value) -> Value {
        if key.is_nil() {
            return Value::Nil;
        }
        let data = self.inner.borrow();
        if data.slots.is_empty() {
            return Value::Nil;
        }
        let cap = data.slots.len();
        let start = ops::hash(key) as usize % cap;
        for i in 0..cap {
            match data.slots[(start + i) % cap] {
                Slot::Empty => return Value::Nil,
                Slot::Tombstone => {}
                Slot::Entry(k, v) => {
                    if k == key {
                        return v;
                    }
                }
            }
        }
        Value::Nil
    }

    /// Insert or overwrite. A nil value removes the key; a nil key is a
    /// no-op.
    pub fn put(&self, key: Value, value: Value) {
        if key.is_nil() {
            return;
        }
        if value.is_nil() {
            self.remove(key);
            return;
        }
        let mut data = self.inner.borrow_mut();
        if data.slots.is_empty() || (data.count + data.deleted + 1) * 2 > data.slots.len() {
            grow(&mut data);
        }
        let cap = data.slots.len();
        let start = ops::hash(key) as usize % cap;
        let mut first_tomb: Option<usize> = None;
        for i in 0..cap {
            let idx = (start + i) % cap;
            match data.slots[idx] {
                Slot::Empty => {
                    // Reclaim the earliest tombstone on the probe path.
                    let target = first_tomb.unwrap_or(idx);
                    if matches!(data.slots[target], Slot::Tombstone) {
                        data.deleted -= 1;
                    }
                    data.slots[target] = Slot::Entry(key, value);
                    data.count += 1;
                    return;
                }
                Slot::Tombstone => {
                    if first_tomb.is_none() {
                        first_tomb = Some(idx);
                    }
                }
                Slot::Entry(k, _) => {
                    if k == key {
                        data.slots[idx] = Slot::Entry(key, value);
                        return;
                    }
                }
            }
        }
        // The threshold keeps the table under half full, so a probe always
        // terminates at an empty slot above.
        unreachable!("table probe did not terminate");
    }

    pub fn remove(&self, key: Value) {
        if key.is_nil() {
            return;
        }
        let mut data = self.inner.borrow_mut();
        if data.slots.is_empty() {
            return;
        }
        let cap = data.slots.len();
        let start = ops::hash(key) as usize % cap;
        for i in 0..cap {
            let idx = (start + i) % cap;
            match data.slots[idx] {
                Slot::Empty => return,
                Slot::Tombstone => {}
                Slot::Entry(k, _) => {
                    if k == key {
                        data.slots[idx] = Slot::Tombstone;
                        data.count -= 1;
                        data.deleted += 1;
                        return;
                    }
                }
            }
        }
    }

    /// Snapshot of the live entries.
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.inner
            .borrow()
            .slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Entry(k, v) => Some((*k, *v)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn mark_entries(&self, heap: &Heap) {
        for slot in self.inner.borrow().slots.iter() {
            if let Slot::Entry(k, v) = slot {
                heap.mark_value(*k);
                heap.mark_value(*v);
            }
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

fn grow(data: &mut TableData) {
    let new_cap = (data.slots.len() * 2).max(MIN_CAPACITY);
    let old = std::mem::replace(&mut data.slots, vec![Slot::Empty; new_cap]);
    data.count = 0;
    data.deleted = 0;
    for slot in old {
        if let Slot::Entry(key, value) = slot {
            // Reinsert directly; no tombstones exist in the fresh array.
            let start = ops::hash(key) as usize % new_cap;
            for i in 0..new_cap {
                let idx = (start + i) % new_cap;
                if matches!(data.slots[idx], Slot::Empty) {
                    data.slots[idx] = Slot::Entry(key, value);
                    data.count += 1;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let t = Table::new();
        t.put(Value::Int(1), Value::Int(10));
        t.put(Value::Int(2), Value::Int(20));
        assert_eq!(t.get(Value::Int(1)), Value::Int(10));
        assert_eq!(t.len(), 2);
        t.remove(Value::Int(1));
        assert_eq!(t.get(Value::Int(1)), Value::Nil);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_nil_value_removes() {
        let t = Table::new();
        t.put(Value::Int(1), Value::Int(10));
        t.put(Value::Int(1), Value::Nil);
        assert_eq!(t.len(), 0);
        assert_eq!(t.get(Value::Int(1)), Value::Nil);
    }

    #[test]
    fn test_survives_churn_through_rehashes() {
        let t = Table::new();
        // Insert and delete in waves to force tombstone buildup and several
        // rehashes; no entry may be lost.
        for round in 0..4i64 {
            for i in 0..200 {
                t.put(Value::Int(i), Value::Int(i + round));
            }
            for i in 0..200 {
                if i % 3 == 0 {
                    t.remove(Value::Int(i));
                }
            }
            for i in 0..200 {
                let expect = if i % 3 == 0 {
                    Value::Nil
                } else {
                    Value::Int(i + round)
                };
                assert_eq!(t.get(Value::Int(i)), expect, "round {} key {}", round, i);
            }
        }
    }

    #[test]
    fn test_overwrite_keeps_count() {
        let t = Table::new();
        t.put(Value::Int(5), Value::Int(1));
        t.put(Value::Int(5), Value::Int(2));
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(Value::Int(5)), Value::Int(2));
    }
}
