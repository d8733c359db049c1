//! Dense, swap-compacted storage with stable keys.
//!
//! Payloads live in `[0, len)` without holes. Removing swaps the last element into
//! the freed slot and reports the move, so owners of index-based state (an
//! acceleration structure's instance slots, a BVH leaf) can patch it in the same call.

use slotmap::{Key, SlotMap};

/// An element that changed index because of a swap-remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovedEntry<K> {
    pub key: K,
    pub old_index: u32,
    pub new_index: u32,
}

#[derive(Debug)]
pub struct Removed<K, T> {
    pub payload: T,
    /// Index the removed element occupied.
    pub index: u32,
    pub moved: Option<MovedEntry<K>>,
}

pub struct IndexedTable<K: Key, T> {
    slots: SlotMap<K, u32>,
    dense: Vec<(K, T)>,
}

impl<K: Key, T> Default for IndexedTable<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, T> IndexedTable<K, T> {
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            dense: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotMap::with_capacity_and_key(capacity),
            dense: Vec::with_capacity(capacity),
        }
    }

    /// Appends `payload`; its index is the previous `len`.
    pub fn emplace(&mut self, payload: T) -> (K, u32) {
        let index = self.dense.len() as u32;
        let key = self.slots.insert(index);
        self.dense.push((key, payload));
        (key, index)
    }

    pub fn remove(&mut self, key: K) -> Option<Removed<K, T>> {
        let index = self.slots.remove(key)?;
        let (_, payload) = self.dense.swap_remove(index as usize);

        let moved = self.dense.get(index as usize).map(|&(moved_key, _)| {
            self.slots[moved_key] = index;
            MovedEntry {
                key: moved_key,
                old_index: self.dense.len() as u32,
                new_index: index,
            }
        });

        Some(Removed {
            payload,
            index,
            moved,
        })
    }

    /// Replaces the payload in place. Returns the previous one.
    pub fn update(&mut self, key: K, payload: T) -> Option<T> {
        let slot = self.get_mut(key)?;
        Some(std::mem::replace(slot, payload))
    }

    #[inline]
    pub fn index_of(&self, key: K) -> Option<u32> {
        self.slots.get(key).copied()
    }

    #[inline]
    pub fn get(&self, key: K) -> Option<&T> {
        let index = *self.slots.get(key)?;
        Some(&self.dense[index as usize].1)
    }

    #[inline]
    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let index = *self.slots.get(key)?;
        Some(&mut self.dense[index as usize].1)
    }

    #[inline]
    pub fn key_at(&self, index: u32) -> Option<K> {
        self.dense.get(index as usize).map(|(k, _)| *k)
    }

    #[inline]
    pub fn get_at(&self, index: u32) -> Option<&T> {
        self.dense.get(index as usize).map(|(_, t)| t)
    }

    #[inline]
    pub fn get_at_mut(&mut self, index: u32) -> Option<&mut T> {
        self.dense.get_mut(index as usize).map(|(_, t)| t)
    }

    #[inline]
    pub fn contains(&self, key: K) -> bool {
        self.slots.contains_key(key)
    }

    /// Elements in index order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> + '_ {
        self.dense.iter().map(|(k, t)| (*k, t))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> + '_ {
        self.dense.iter_mut().map(|(k, t)| (*k, t))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.dense.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }
}
