// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collections::{InternTables, LocationId, StringId};
use crate::{AllocationIdentity, InternError};
use std::mem::size_of;

/// A host-specific frame token, such as an instruction pointer or an
/// interpreter frame handle. Only the host knows how to resolve it.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RawFrame(pub u64);

/// Frames captured at allocation time, leaf first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawBacktrace {
    frames: Vec<RawFrame>,
}

impl RawBacktrace {
    pub fn new(frames: Vec<RawFrame>) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> &[RawFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl From<Vec<RawFrame>> for RawBacktrace {
    fn from(frames: Vec<RawFrame>) -> Self {
        Self::new(frames)
    }
}

impl FromIterator<RawFrame> for RawBacktrace {
    fn from_iter<I: IntoIterator<Item = RawFrame>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// A resolved frame, as returned by [crate::HostRuntime::symbolize].
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct SymbolizedFrame {
    pub function_name: String,
    pub file_name: String,
    pub line: u32,
}

/// Set-once sample flags.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SampleFlags(u8);

impl SampleFlags {
    pub const RELEASED: Self = Self(1);
    pub const SYMBOLIZED: Self = Self(1 << 1);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

/// One sampled allocation.
///
/// Once RELEASED is set the identity is cleared, so nothing can reach the
/// host object through it anymore.
#[derive(Debug)]
pub struct Sample {
    identity: Option<AllocationIdentity>,
    raw_backtrace: Option<RawBacktrace>,
    locations: Vec<LocationId>,
    tags: Vec<(StringId, StringId)>,
    size_bytes: Option<u64>,
    flags: SampleFlags,
}

impl Sample {
    pub(crate) fn new(
        identity: AllocationIdentity,
        tags: Vec<(StringId, StringId)>,
        raw_backtrace: RawBacktrace,
    ) -> Self {
        Self {
            identity: Some(identity),
            raw_backtrace: Some(raw_backtrace),
            locations: Vec::new(),
            tags,
            size_bytes: None,
            flags: SampleFlags::default(),
        }
    }

    /// The current identity, or `None` once released.
    pub fn identity(&self) -> Option<AllocationIdentity> {
        self.identity
    }

    pub fn flags(&self) -> SampleFlags {
        self.flags
    }

    pub fn is_released(&self) -> bool {
        self.flags.contains(SampleFlags::RELEASED)
    }

    pub fn is_symbolized(&self) -> bool {
        self.flags.contains(SampleFlags::SYMBOLIZED)
    }

    /// FunctionTable ids, leaf first. Empty until symbolized.
    pub fn locations(&self) -> &[LocationId] {
        &self.locations
    }

    pub fn tags(&self) -> &[(StringId, StringId)] {
        &self.tags
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.size_bytes
    }

    pub(crate) fn take_raw_backtrace(&mut self) -> Option<RawBacktrace> {
        self.raw_backtrace.take()
    }

    pub(crate) fn restore_raw_backtrace(&mut self, backtrace: RawBacktrace) {
        self.raw_backtrace = Some(backtrace);
    }

    pub(crate) fn set_identity(&mut self, identity: AllocationIdentity) {
        self.identity = Some(identity);
    }

    pub(crate) fn mark_released(&mut self) {
        self.identity = None;
        self.flags.insert(SampleFlags::RELEASED);
    }

    /// Stores the symbolized backtrace, consuming any raw frames left.
    pub(crate) fn set_symbolized(&mut self, locations: Vec<LocationId>) {
        self.raw_backtrace = None;
        self.locations = locations;
        self.flags.insert(SampleFlags::SYMBOLIZED);
    }

    pub(crate) fn set_size(&mut self, size_bytes: u64) {
        debug_assert!(!self.is_released());
        self.size_bytes = Some(size_bytes);
    }

    /// Releases one reference on every table entry the sample used.
    pub(crate) fn release_interned(self, tables: &mut InternTables) -> Result<(), InternError> {
        let InternTables { strings, functions } = tables;
        for location in self.locations {
            functions.release(location, strings)?;
        }
        for (key, value) in self.tags {
            strings.release(key)?;
            strings.release(value)?;
        }
        Ok(())
    }

    fn heap_bytes(&self) -> usize {
        self.locations.capacity() * size_of::<LocationId>()
            + self.tags.capacity() * size_of::<(StringId, StringId)>()
            + self
                .raw_backtrace
                .as_ref()
                .map_or(0, |bt| bt.frames.capacity() * size_of::<RawFrame>())
    }
}

/// Generation-checked reference to a sample in a [SampleArena]. A handle
/// whose sample has been destroyed never resolves again, even after its
/// slot is reused.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SampleHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    refcount: u32,
    sample: Option<Sample>,
}

/// Owns every sample. Each occupied slot carries the number of owners the
/// sample has; the sample is handed back for destruction when that count
/// reaches zero.
#[derive(Default)]
pub(crate) struct SampleArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

/// A handle that did not resolve, or a refcount that would overflow.
#[derive(Debug)]
pub(crate) struct StaleHandle(pub SampleHandle);

impl SampleArena {
    /// Stores the sample with a refcount of one.
    pub fn insert(&mut self, sample: Sample) -> Option<SampleHandle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len()).ok()?;
                self.slots.push(Slot {
                    generation: 0,
                    refcount: 0,
                    sample: None,
                });
                index
            }
        };
        let slot = self.slots.get_mut(index as usize)?;
        slot.refcount = 1;
        slot.sample = Some(sample);
        self.len += 1;
        Some(SampleHandle {
            index,
            generation: slot.generation,
        })
    }

    pub fn get(&self, handle: SampleHandle) -> Option<&Sample> {
        self.slot(handle)?.sample.as_ref()
    }

    pub fn get_mut(&mut self, handle: SampleHandle) -> Option<&mut Sample> {
        self.slot_mut(handle)?.sample.as_mut()
    }

    #[cfg(test)]
    pub fn refcount(&self, handle: SampleHandle) -> Option<u32> {
        self.slot(handle).map(|slot| slot.refcount)
    }

    pub fn retain(&mut self, handle: SampleHandle) -> Result<(), StaleHandle> {
        let slot = self.slot_mut(handle).ok_or(StaleHandle(handle))?;
        slot.refcount = slot.refcount.checked_add(1).ok_or(StaleHandle(handle))?;
        Ok(())
    }

    /// Drops one owner. Returns the sample once the last owner is gone; the
    /// caller is responsible for releasing its interned references.
    pub fn release(&mut self, handle: SampleHandle) -> Result<Option<Sample>, StaleHandle> {
        let slot = self.slot_mut(handle).ok_or(StaleHandle(handle))?;
        slot.refcount -= 1;
        if slot.refcount > 0 {
            return Ok(None);
        }
        let sample = slot.sample.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Ok(sample)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn memory_usage(&self) -> usize {
        self.slots.capacity() * size_of::<Slot>()
            + self.free.capacity() * size_of::<u32>()
            + self
                .slots
                .iter()
                .filter_map(|slot| slot.sample.as_ref())
                .map(Sample::heap_bytes)
                .sum::<usize>()
    }

    fn slot(&self, handle: SampleHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.sample.is_some())
    }

    fn slot_mut(&mut self, handle: SampleHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.sample.is_some())
    }
}
