// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::InternError;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hash};
use std::mem::size_of;
use std::num::NonZeroU32;

type FxHashMap<K, V> = HashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;

struct Slot<K> {
    key: K,
    refcount: u32,
}

/// Deduplicating storage with an explicit refcount per entry. Ids start at 1
/// and freed slots are recycled, so ids stay dense for the life of the set.
pub(crate) struct InternSet<K> {
    slots: Vec<Option<Slot<K>>>,
    free: Vec<u32>,
    index: FxHashMap<K, NonZeroU32>,
}

impl<K> Default for InternSet<K> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: FxHashMap::default(),
        }
    }
}

impl<K: Clone + Eq + Hash> InternSet<K> {
    /// Returns the id for `key`, adding a reference. New entries start with
    /// a refcount of one.
    pub fn intern<Q>(&mut self, key: &Q) -> Result<NonZeroU32, InternError>
    where
        K: Borrow<Q> + for<'a> From<&'a Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some(id) = self.find(key) {
            self.retain(id)?;
            return Ok(id);
        }
        self.insert_new(K::from(key))
    }

    fn insert_new(&mut self, key: K) -> Result<NonZeroU32, InternError> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index =
                    u32::try_from(self.slots.len()).map_err(|_| InternError::IdsExhausted)?;
                // Keeps index + 1 representable.
                if index == u32::MAX {
                    return Err(InternError::IdsExhausted);
                }
                self.slots.push(None);
                index
            }
        };
        let id = NonZeroU32::MIN.saturating_add(index);
        self.index.insert(key.clone(), id);
        if let Some(slot) = self.slots.get_mut(index as usize) {
            *slot = Some(Slot { key, refcount: 1 });
        }
        Ok(id)
    }

    /// Looks up `key` without touching its refcount.
    pub fn find<Q>(&self, key: &Q) -> Option<NonZeroU32>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.get(key).copied()
    }

    pub fn retain(&mut self, id: NonZeroU32) -> Result<(), InternError> {
        let slot = self.slot_mut(id)?;
        slot.refcount = slot
            .refcount
            .checked_add(1)
            .ok_or(InternError::RefcountOverflow)?;
        Ok(())
    }

    /// Drops a reference. Returns the key when the entry was removed.
    pub fn release(&mut self, id: NonZeroU32) -> Result<Option<K>, InternError> {
        let slot = self.slot_mut(id)?;
        slot.refcount -= 1;
        if slot.refcount > 0 {
            return Ok(None);
        }
        let index = id.get() - 1;
        let removed = self
            .slots
            .get_mut(index as usize)
            .and_then(Option::take)
            .ok_or(InternError::UnknownId(id.get()))?;
        self.index.remove(&removed.key);
        self.free.push(index);
        Ok(Some(removed.key))
    }

    pub fn get(&self, id: NonZeroU32) -> Option<&K> {
        self.slot(id).map(|slot| &slot.key)
    }

    pub fn refcount(&self, id: NonZeroU32) -> Option<u32> {
        self.slot(id).map(|slot| slot.refcount)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Approximate bytes held by the set itself, not counting heap data the
    /// keys own.
    pub fn memory_usage(&self) -> usize {
        self.slots.capacity() * size_of::<Option<Slot<K>>>()
            + self.free.capacity() * size_of::<u32>()
            + self.index.capacity() * (size_of::<K>() + size_of::<NonZeroU32>())
    }

    /// Sums `f` over every live key, for accounting heap data the keys own.
    pub fn key_bytes(&self, f: impl Fn(&K) -> usize) -> usize {
        self.slots
            .iter()
            .filter_map(Option::as_ref)
            .map(|slot| f(&slot.key))
            .sum()
    }

    #[cfg(test)]
    pub fn saturate(&mut self, id: NonZeroU32) {
        if let Ok(slot) = self.slot_mut(id) {
            slot.refcount = u32::MAX;
        }
    }

    fn slot(&self, id: NonZeroU32) -> Option<&Slot<K>> {
        self.slots.get(id.get() as usize - 1)?.as_ref()
    }

    fn slot_mut(&mut self, id: NonZeroU32) -> Result<&mut Slot<K>, InternError> {
        self.slots
            .get_mut(id.get() as usize - 1)
            .and_then(Option::as_mut)
            .ok_or(InternError::UnknownId(id.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn dedup_and_refcount() {
        let mut set = InternSet::<Arc<str>>::default();
        let a = set.intern("a").unwrap();
        let b = set.intern("b").unwrap();
        assert_ne!(a, b);
        assert_eq!(set.intern("a").unwrap(), a);
        assert_eq!(set.refcount(a), Some(2));
        assert_eq!(set.len(), 2);

        assert_eq!(set.release(a).unwrap(), None);
        assert_eq!(set.release(a).unwrap().as_deref(), Some("a"));
        assert_eq!(set.find("a"), None);
        assert_eq!(set.get(a), None);
        assert_eq!(set.release(a), Err(InternError::UnknownId(a.get())));
    }

    #[test]
    fn ids_are_recycled() {
        let mut set = InternSet::<Arc<str>>::default();
        let a = set.intern("a").unwrap();
        set.intern("b").unwrap();
        set.release(a).unwrap();
        let c = set.intern("c").unwrap();
        assert_eq!(a, c);
        assert_eq!(set.get(c).map(|s| &**s), Some("c"));
        assert_eq!(set.len(), 2);
    }
}
