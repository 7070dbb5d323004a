// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::intern_set::InternSet;
use super::string_table::{StringId, StringTable};
use crate::InternError;
use std::num::NonZeroU32;

/// Id of an interned (function, file, line) triple. It doubles as the pprof
/// `Location.id`, which must be non-zero.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LocationId(NonZeroU32);

impl LocationId {
    #[inline]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    #[inline]
    pub const fn to_pprof_id(self) -> u64 {
        self.0.get() as u64
    }
}

/// The deduplication key of a FunctionTable entry. Each entry holds one
/// StringTable reference for `name` and one for `file`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FunctionKey {
    pub name: StringId,
    pub file: StringId,
    pub line: u32,
}

impl From<&FunctionKey> for FunctionKey {
    fn from(key: &FunctionKey) -> Self {
        *key
    }
}

#[derive(Debug)]
pub struct ResolvedLocation<'a> {
    pub function_name: &'a str,
    pub file_name: &'a str,
    pub line: u32,
}

#[derive(Default)]
pub struct FunctionTable {
    set: InternSet<FunctionKey>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns the triple and returns its location id with one new
    /// reference. A hit only touches the entry's own refcount; the name
    /// strings are retained once, when the entry is created.
    pub fn intern(
        &mut self,
        strings: &mut StringTable,
        function_name: &str,
        file_name: &str,
        line: u32,
    ) -> Result<LocationId, InternError> {
        if let Some(id) = self.find(strings, function_name, file_name, line) {
            self.set.retain(id.0)?;
            return Ok(id);
        }

        let name = strings.intern(function_name)?;
        let file = match strings.intern(file_name) {
            Ok(file) => file,
            Err(err) => {
                strings.release(name)?;
                return Err(err);
            }
        };
        let key = FunctionKey { name, file, line };
        debug_assert!(self.set.find(&key).is_none());
        match self.set.intern(&key) {
            Ok(id) => Ok(LocationId(id)),
            Err(err) => {
                strings.release(name)?;
                strings.release(file)?;
                Err(err)
            }
        }
    }

    /// Looks up the triple without adding references anywhere.
    pub fn find(
        &self,
        strings: &StringTable,
        function_name: &str,
        file_name: &str,
        line: u32,
    ) -> Option<LocationId> {
        let key = FunctionKey {
            name: strings.find(function_name)?,
            file: strings.find(file_name)?,
            line,
        };
        self.set.find(&key).map(LocationId)
    }

    pub fn retain(&mut self, id: LocationId) -> Result<(), InternError> {
        self.set.retain(id.0)
    }

    /// Drops a reference. When it was the last one, the entry is removed and
    /// its two string references are released too.
    pub fn release(&mut self, id: LocationId, strings: &mut StringTable) -> Result<(), InternError> {
        if let Some(key) = self.set.release(id.0)? {
            strings.release(key.name)?;
            strings.release(key.file)?;
        }
        Ok(())
    }

    pub fn lookup(&self, id: LocationId) -> Option<FunctionKey> {
        self.set.get(id.0).copied()
    }

    /// Looks up the entry and both of its strings.
    pub fn resolve<'a>(
        &self,
        id: LocationId,
        strings: &'a StringTable,
    ) -> Option<ResolvedLocation<'a>> {
        let key = self.lookup(id)?;
        Some(ResolvedLocation {
            function_name: strings.lookup(key.name)?,
            file_name: strings.lookup(key.file)?,
            line: key.line,
        })
    }

    pub fn refcount(&self, id: LocationId) -> Option<u32> {
        self.set.refcount(id.0)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_usage(&self) -> usize {
        self.set.memory_usage()
    }
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTable")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
