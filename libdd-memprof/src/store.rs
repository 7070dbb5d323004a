// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collections::{InternTables, StringId};
use crate::error::fatal;
use crate::sample::{SampleArena, StaleHandle};
use crate::{AllocationIdentity, RawBacktrace, Sample, SampleHandle};
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::mem::{self, size_of};
use tracing::debug;

type FxHashMap<K, V> = HashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;

/// Returned by [SampleStore::record_allocation] when the store is at
/// capacity. The drop is counted and reported by the next flush.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("the sample store is full")]
pub struct Dropped;

/// Live samples keyed by allocation identity.
///
/// The table owns one reference to each of its samples, and every snapshot
/// owns one more. A sample leaves the table when its allocation is released,
/// but stays readable until the last snapshot holding it is released too.
pub struct SampleStore {
    arena: SampleArena,
    live: FxHashMap<AllocationIdentity, SampleHandle>,
    max_samples: usize,
    dropped: u64,
}

impl SampleStore {
    pub fn new(max_samples: usize) -> Self {
        Self {
            arena: SampleArena::default(),
            live: FxHashMap::default(),
            max_samples,
            dropped: 0,
        }
    }

    /// Adds a sample for a freshly sampled allocation. `tags` must already
    /// hold one StringTable reference per id; ownership passes to the store,
    /// which releases them itself when the allocation is dropped.
    ///
    /// An identity that is already present belongs to an allocation whose
    /// release was never delivered, so that entry is released first.
    pub fn record_allocation(
        &mut self,
        identity: AllocationIdentity,
        tags: Vec<(StringId, StringId)>,
        raw_backtrace: RawBacktrace,
        tables: &mut InternTables,
    ) -> Result<(), Dropped> {
        if let Some(stale) = self.live.remove(&identity) {
            debug!(?identity, "replacing the sample of a reused allocation identity");
            self.release_live(stale, tables);
        }

        if self.is_full() {
            self.dropped += 1;
            for (key, value) in tags {
                release_string(tables, key);
                release_string(tables, value);
            }
            return Err(Dropped);
        }

        let Some(handle) = self
            .arena
            .insert(Sample::new(identity, tags, raw_backtrace))
        else {
            fatal(format_args!("sample arena ran out of slots"))
        };
        self.live.insert(identity, handle);
        Ok(())
    }

    /// Counts an allocation that was dropped before a sample was built for
    /// it.
    pub fn record_drop(&mut self) {
        self.dropped += 1;
    }

    /// Removes the sample for `identity`. Unknown identities are ignored.
    pub fn record_release(&mut self, identity: AllocationIdentity, tables: &mut InternTables) {
        if let Some(handle) = self.live.remove(&identity) {
            self.release_live(handle, tables);
        }
    }

    /// Re-keys a live sample after the host moved its object. Unknown
    /// `old` identities are ignored.
    pub fn record_relocation(
        &mut self,
        old: AllocationIdentity,
        new: AllocationIdentity,
        tables: &mut InternTables,
    ) {
        if old == new {
            return;
        }
        let Some(handle) = self.live.remove(&old) else {
            return;
        };
        if let Some(stale) = self.live.remove(&new) {
            debug!(identity = ?new, "relocation target replaces a stale sample");
            self.release_live(stale, tables);
        }
        match self.arena.get_mut(handle) {
            Some(sample) => sample.set_identity(new),
            None => fatal(format_args!("live sample {handle:?} is missing")),
        }
        self.live.insert(new, handle);
    }

    /// Every live sample, each with one extra reference that must be given
    /// back through [SampleStore::release_snapshot].
    pub fn snapshot(&mut self) -> Vec<SampleHandle> {
        let handles: Vec<SampleHandle> = self.live.values().copied().collect();
        for &handle in &handles {
            if let Err(StaleHandle(handle)) = self.arena.retain(handle) {
                fatal(format_args!("cannot retain live sample {handle:?}"));
            }
        }
        handles
    }

    pub fn release_snapshot(&mut self, handles: Vec<SampleHandle>, tables: &mut InternTables) {
        for handle in handles {
            self.release_handle(handle, tables);
        }
    }

    /// Returns the number of drops since the last call and resets it.
    pub fn take_dropped(&mut self) -> u64 {
        mem::take(&mut self.dropped)
    }

    /// Adds back drops taken by a flush that did not complete.
    pub fn restore_dropped(&mut self, dropped: u64) {
        self.dropped = self.dropped.saturating_add(dropped);
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Releases every live sample. Samples held by a snapshot survive until
    /// it is released.
    pub fn clear(&mut self, tables: &mut InternTables) {
        let handles: Vec<SampleHandle> = self.live.drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            self.release_live(handle, tables);
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn contains(&self, identity: AllocationIdentity) -> bool {
        self.live.contains_key(&identity)
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    /// Lowering the bound below the live count keeps existing samples; only
    /// new ones are rejected until enough are released.
    pub fn set_max_samples(&mut self, max_samples: usize) {
        self.max_samples = max_samples;
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.live.len() >= self.max_samples
    }

    pub fn sample(&self, handle: SampleHandle) -> Option<&Sample> {
        self.arena.get(handle)
    }

    pub(crate) fn sample_mut(&mut self, handle: SampleHandle) -> Option<&mut Sample> {
        self.arena.get_mut(handle)
    }

    /// Samples in the arena, including released ones still held by a
    /// snapshot.
    pub fn retained_count(&self) -> usize {
        self.arena.len()
    }

    pub fn memory_usage(&self) -> usize {
        self.arena.memory_usage()
            + self.live.capacity() * (size_of::<AllocationIdentity>() + size_of::<SampleHandle>())
    }

    fn release_live(&mut self, handle: SampleHandle, tables: &mut InternTables) {
        match self.arena.get_mut(handle) {
            Some(sample) => sample.mark_released(),
            None => fatal(format_args!("live sample {handle:?} is missing")),
        }
        self.release_handle(handle, tables);
    }

    fn release_handle(&mut self, handle: SampleHandle, tables: &mut InternTables) {
        match self.arena.release(handle) {
            Ok(Some(sample)) => {
                if let Err(err) = sample.release_interned(tables) {
                    fatal(format_args!("destroying sample {handle:?}: {err}"));
                }
            }
            Ok(None) => {}
            Err(StaleHandle(handle)) => fatal(format_args!("released stale sample {handle:?}")),
        }
    }
}

fn release_string(tables: &mut InternTables, id: StringId) {
    if let Err(err) = tables.strings.release(id) {
        fatal(format_args!("releasing string {}: {err}", id.get()));
    }
}

impl std::fmt::Debug for SampleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleStore")
            .field("live", &self.live.len())
            .field("retained", &self.arena.len())
            .field("max_samples", &self.max_samples)
            .field("dropped", &self.dropped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawFrame;

    fn id(raw: u64) -> AllocationIdentity {
        AllocationIdentity::new(raw)
    }

    fn tags(tables: &mut InternTables, pairs: &[(&str, &str)]) -> Vec<(StringId, StringId)> {
        pairs
            .iter()
            .map(|(k, v)| {
                (
                    tables.strings.intern(k).unwrap(),
                    tables.strings.intern(v).unwrap(),
                )
            })
            .collect()
    }

    fn allocate(
        store: &mut SampleStore,
        tables: &mut InternTables,
        raw: u64,
    ) -> Result<(), Dropped> {
        let tags = tags(tables, &[("thread", "main")]);
        store.record_allocation(id(raw), tags, RawBacktrace::new(vec![RawFrame(raw)]), tables)
    }

    #[test]
    fn capacity_counts_drops() {
        let mut tables = InternTables::new();
        let mut store = SampleStore::new(2);
        allocate(&mut store, &mut tables, 1).unwrap();
        allocate(&mut store, &mut tables, 2).unwrap();
        assert_eq!(allocate(&mut store, &mut tables, 3), Err(Dropped));
        assert_eq!(allocate(&mut store, &mut tables, 4), Err(Dropped));
        assert_eq!(store.live_count(), 2);
        assert_eq!(store.take_dropped(), 2);
        assert_eq!(store.take_dropped(), 0);

        // Dropped allocations gave their tag references back.
        let thread = tables.strings.find("thread").unwrap();
        assert_eq!(tables.strings.refcount(thread), Some(2));
    }

    #[test]
    fn release_unknown_identity_is_a_noop() {
        let mut tables = InternTables::new();
        let mut store = SampleStore::new(10);
        allocate(&mut store, &mut tables, 1).unwrap();
        store.record_release(id(99), &mut tables);
        assert_eq!(store.live_count(), 1);

        store.record_release(id(1), &mut tables);
        assert_eq!(store.live_count(), 0);
        assert_eq!(store.retained_count(), 0);
        assert!(tables.strings.is_empty());
    }

    #[test]
    fn relocation_rekeys() {
        let mut tables = InternTables::new();
        let mut store = SampleStore::new(10);
        allocate(&mut store, &mut tables, 1).unwrap();
        allocate(&mut store, &mut tables, 2).unwrap();

        store.record_relocation(id(1), id(3), &mut tables);
        assert!(!store.contains(id(1)));
        assert!(store.contains(id(3)));

        // Moving onto an identity that is still tracked replaces it.
        store.record_relocation(id(3), id(2), &mut tables);
        assert_eq!(store.live_count(), 1);
        assert_eq!(store.retained_count(), 1);

        store.record_relocation(id(42), id(43), &mut tables);
        assert_eq!(store.live_count(), 1);
        store.record_relocation(id(2), id(2), &mut tables);
        assert!(store.contains(id(2)));
    }

    #[test]
    fn reused_identity_replaces_stale_sample() {
        let mut tables = InternTables::new();
        let mut store = SampleStore::new(1);
        allocate(&mut store, &mut tables, 1).unwrap();
        allocate(&mut store, &mut tables, 1).unwrap();
        assert_eq!(store.live_count(), 1);
        assert_eq!(store.retained_count(), 1);
        assert_eq!(store.dropped_count(), 0);
    }

    #[test]
    fn snapshot_outlives_release() {
        let mut tables = InternTables::new();
        let mut store = SampleStore::new(10);
        allocate(&mut store, &mut tables, 1).unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);

        store.record_release(id(1), &mut tables);
        assert_eq!(store.live_count(), 0);
        let sample = store.sample(snapshot[0]).unwrap();
        assert!(sample.is_released());
        assert_eq!(sample.identity(), None);

        store.release_snapshot(snapshot, &mut tables);
        assert_eq!(store.retained_count(), 0);
        assert!(tables.strings.is_empty());
    }

    #[test]
    fn clear_and_lower_capacity() {
        let mut tables = InternTables::new();
        let mut store = SampleStore::new(10);
        for raw in 0..5 {
            allocate(&mut store, &mut tables, raw).unwrap();
        }
        store.set_max_samples(3);
        assert_eq!(store.live_count(), 5);
        assert_eq!(allocate(&mut store, &mut tables, 5), Err(Dropped));

        store.clear(&mut tables);
        assert_eq!(store.live_count(), 0);
        assert!(tables.strings.is_empty());
        allocate(&mut store, &mut tables, 6).unwrap();
    }
}
