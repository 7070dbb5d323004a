// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::intern_set::InternSet;
use crate::InternError;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Id of an interned string. Id 0 is always the empty string.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StringId(u32);

impl StringId {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn non_zero(self) -> Option<NonZeroU32> {
        NonZeroU32::new(self.0)
    }
}

/// Refcounted string interner. Identical contents share an id while any
/// reference to it survives.
///
/// The empty string is permanently interned as id 0 and is never counted,
/// so interning, retaining or releasing it is always a no-op that succeeds.
#[derive(Default)]
pub struct StringTable {
    set: InternSet<Arc<str>>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, item: &str) -> Result<StringId, InternError> {
        if item.is_empty() {
            return Ok(StringId::EMPTY);
        }
        self.set.intern(item).map(|id| StringId(id.get()))
    }

    /// Looks up `item` without adding a reference.
    pub fn find(&self, item: &str) -> Option<StringId> {
        if item.is_empty() {
            return Some(StringId::EMPTY);
        }
        self.set.find(item).map(|id| StringId(id.get()))
    }

    pub fn retain(&mut self, id: StringId) -> Result<(), InternError> {
        match id.non_zero() {
            Some(id) => self.set.retain(id),
            None => Ok(()),
        }
    }

    /// Drops a reference, freeing the entry when it was the last one.
    pub fn release(&mut self, id: StringId) -> Result<(), InternError> {
        match id.non_zero() {
            Some(id) => self.set.release(id).map(drop),
            None => Ok(()),
        }
    }

    /// Pins the refcount at its maximum so the next retain overflows.
    #[cfg(test)]
    pub(crate) fn saturate(&mut self, id: StringId) {
        if let Some(id) = id.non_zero() {
            self.set.saturate(id);
        }
    }

    pub fn lookup(&self, id: StringId) -> Option<&str> {
        match id.non_zero() {
            Some(id) => self.set.get(id).map(|s| &**s),
            None => Some(""),
        }
    }

    /// Current refcount, or `None` for unknown ids and the empty string.
    pub fn refcount(&self, id: StringId) -> Option<u32> {
        self.set.refcount(id.non_zero()?)
    }

    /// Number of live entries, not counting the empty string.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate heap usage in bytes, string contents included.
    pub fn memory_usage(&self) -> usize {
        self.set.memory_usage() + self.set.key_bytes(|s| s.len())
    }
}

impl std::fmt::Debug for StringTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StringTable")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
