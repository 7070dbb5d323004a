// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collector::Shared;
use crate::{AllocationIdentity, RawBacktrace, SymbolizationError, SymbolizedFrame};
use std::sync::{Arc, Weak};

/// Services the host runtime provides to the collector.
///
/// Every method may be called while the collector's lock is held, and any of
/// them may re-enter the collector by delivering allocation events.
pub trait HostRuntime: Send + Sync {
    /// Captures the current stack, leaf first. Called synchronously from
    /// [AllocationHooks::on_allocate] for sampled allocations only.
    fn capture_backtrace(&self) -> RawBacktrace;

    /// Resolves raw frames. Called during flush for samples that have not
    /// been symbolized yet. An error skips the sample for that flush only.
    fn symbolize(&self, backtrace: &RawBacktrace)
        -> Result<Vec<SymbolizedFrame>, SymbolizationError>;

    /// Measures a live object, or returns `None` if it is no longer
    /// measurable.
    fn object_size(&self, identity: AllocationIdentity) -> Option<u64>;
}

/// Delivers allocation events to the collector. The collector subscribes on
/// [crate::Collector::start] and unsubscribes on [crate::Collector::stop].
pub trait AllocationEventSource: Send + Sync {
    fn subscribe(&self, hooks: AllocationHooks);
    fn unsubscribe(&self);
}

/// The entry points an [AllocationEventSource] calls. They hold the
/// collector weakly: once it is dropped every call becomes a no-op.
#[derive(Clone)]
pub struct AllocationHooks {
    shared: Weak<Shared>,
}

impl AllocationHooks {
    pub(crate) fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    /// A new object was allocated. `tags` are merged over the collector's
    /// global tags, winning on matching keys.
    pub fn on_allocate(&self, identity: AllocationIdentity, tags: &[(&str, &str)]) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_allocate(identity, tags);
        }
    }

    pub fn on_release(&self, identity: AllocationIdentity) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_release(identity);
        }
    }

    pub fn on_relocate(&self, old: AllocationIdentity, new: AllocationIdentity) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_relocate(old, new);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

impl std::fmt::Debug for AllocationHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationHooks")
            .field("attached", &self.is_attached())
            .finish()
    }
}
