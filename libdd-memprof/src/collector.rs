// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collections::{InternTables, StringId};
use crate::error::fatal;
use crate::flush::FlushCoordinator;
use crate::{
    AllocationEventSource, AllocationHooks, AllocationIdentity, CollectorConfig, CollectorError,
    ConfigError, ExportedProfile, FlushError, HostRuntime, InternError, SampleStore,
    ValidatedConfig,
};
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Everything behind the collector's lock.
pub(crate) struct State {
    pub store: SampleStore,
    pub tables: InternTables,
    pub config: ValidatedConfig,
    pub running: bool,
    pub session_start: Option<Instant>,
}

/// The part of a collector that hooks and fork handlers reach.
pub(crate) struct Shared {
    /// Re-entrant so that allocation events raised by the host while the
    /// collector is calling into it can be recorded. The `RefCell` is never
    /// borrowed across such a call.
    pub state: ReentrantMutex<RefCell<State>>,
    pub flush: FlushCoordinator,
    pub host: Arc<dyn HostRuntime>,
}

impl Shared {
    pub fn on_allocate(&self, identity: AllocationIdentity, tags: &[(&str, &str)]) {
        let guard = self.state.lock();
        {
            let state = guard.borrow();
            if !state.running || !state.config.sample_rate().should_sample() {
                return;
            }
            if state.store.is_full() && !state.store.contains(identity) {
                drop(state);
                guard.borrow_mut().store.record_drop();
                return;
            }
        }

        let backtrace = self.host.capture_backtrace();

        let mut state = guard.borrow_mut();
        let State {
            store,
            tables,
            config,
            running,
            ..
        } = &mut *state;
        // The collector may have been stopped from inside the capture.
        if !*running {
            return;
        }
        let tags = match intern_tags(tables, config.global_tags(), tags) {
            Ok(tags) => tags,
            Err(err) => fatal(format_args!("interning allocation tags: {err}")),
        };
        // A drop is counted by the store and reported by the next flush.
        _ = store.record_allocation(identity, tags, backtrace, tables);
    }

    pub fn on_release(&self, identity: AllocationIdentity) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let State { store, tables, .. } = &mut *state;
        store.record_release(identity, tables);
    }

    pub fn on_relocate(&self, old: AllocationIdentity, new: AllocationIdentity) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let State { store, tables, .. } = &mut *state;
        store.record_relocation(old, new, tables);
    }

    fn flush(&self) -> Result<ExportedProfile, FlushError> {
        self.flush.flush(&self.state, self.host.as_ref())
    }
}

/// Global tags overlaid with the event's tags, interned with one reference
/// per id.
fn intern_tags(
    tables: &mut InternTables,
    global: &BTreeMap<String, String>,
    context: &[(&str, &str)],
) -> Result<Vec<(StringId, StringId)>, InternError> {
    let mut merged: Vec<(&str, &str)> = global
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();
    for &(key, value) in context {
        match merged.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => merged.push((key, value)),
        }
    }

    let mut interned = Vec::with_capacity(merged.len());
    for (key, value) in merged {
        interned.push((tables.strings.intern(key)?, tables.strings.intern(value)?));
    }
    Ok(interned)
}

/// Approximate heap usage of a collector, in bytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MemoryUsage {
    pub samples: usize,
    pub string_table: usize,
    pub function_table: usize,
}

impl MemoryUsage {
    pub fn total(&self) -> usize {
        self.samples + self.string_table + self.function_table
    }
}

/// A sampling heap profiler.
///
/// While running, it samples allocations reported through its
/// [AllocationHooks] and keeps the sampled ones that are still alive.
/// [Collector::flush] exports those as a pprof profile, whether or not the
/// collector is running.
pub struct Collector {
    shared: Arc<Shared>,
    source: Arc<dyn AllocationEventSource>,
}

pub struct CollectorBuilder {
    config: CollectorConfig,
    host: Arc<dyn HostRuntime>,
    source: Arc<dyn AllocationEventSource>,
}

impl CollectorBuilder {
    pub fn config(mut self, config: CollectorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sample_rate(mut self, sample_rate: f64) -> Self {
        self.config.sample_rate = sample_rate;
        self
    }

    pub fn max_samples(mut self, max_samples: usize) -> Self {
        self.config.max_samples = max_samples;
        self
    }

    pub fn global_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.global_tags.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Collector, CollectorError> {
        Collector::new(self.config, self.host, self.source)
    }
}

impl Collector {
    pub fn builder(
        host: Arc<dyn HostRuntime>,
        source: Arc<dyn AllocationEventSource>,
    ) -> CollectorBuilder {
        CollectorBuilder {
            config: CollectorConfig::default(),
            host,
            source,
        }
    }

    /// Creates a stopped collector.
    pub fn new(
        config: CollectorConfig,
        host: Arc<dyn HostRuntime>,
        source: Arc<dyn AllocationEventSource>,
    ) -> Result<Self, CollectorError> {
        let config = config.validate()?;
        let state = State {
            store: SampleStore::new(config.max_samples()),
            tables: InternTables::new(),
            config,
            running: false,
            session_start: None,
        };
        let shared = Arc::new(Shared {
            state: ReentrantMutex::new(RefCell::new(state)),
            flush: FlushCoordinator::default(),
            host,
        });
        #[cfg(unix)]
        crate::fork::register(&shared);
        Ok(Self { shared, source })
    }

    /// Replaces the configuration. An invalid one is rejected and the
    /// current one stays in effect. A lower `max_samples` keeps samples
    /// already collected.
    pub fn configure(&self, config: CollectorConfig) -> Result<(), CollectorError> {
        let config = config.validate()?;
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        state.store.set_max_samples(config.max_samples());
        state.config = config;
        Ok(())
    }

    /// Starts a new session. Samples left from a previous session are
    /// discarded and the drop count is reset.
    pub fn start(&self) -> Result<(), CollectorError> {
        {
            let guard = self.shared.state.lock();
            let mut state = guard.borrow_mut();
            if state.running {
                return Err(CollectorError::AlreadyRunning);
            }
            let State { store, tables, .. } = &mut *state;
            store.clear(tables);
            store.take_dropped();
            state.running = true;
            state.session_start = Some(Instant::now());
        }
        // The source is called without the lock held, so it may wait on
        // hook calls that are blocked on it.
        self.source.subscribe(AllocationHooks::new(&self.shared));
        debug!("heap profiler started");
        Ok(())
    }

    /// Stops sampling. Collected samples are kept and can still be flushed.
    pub fn stop(&self) -> Result<(), CollectorError> {
        {
            let guard = self.shared.state.lock();
            let mut state = guard.borrow_mut();
            if !state.running {
                return Err(CollectorError::NotRunning);
            }
            state.running = false;
        }
        self.source.unsubscribe();
        debug!("heap profiler stopped");
        Ok(())
    }

    /// Exports every live sample. Fails with [FlushError::AlreadyFlushing]
    /// when another flush is in progress, including one further up the
    /// current thread's stack.
    pub fn flush(&self) -> Result<ExportedProfile, FlushError> {
        self.shared.flush()
    }

    /// Starts a session, runs `f`, flushes and stops.
    pub fn profile<R>(&self, f: impl FnOnce() -> R) -> Result<(R, ExportedProfile), CollectorError> {
        self.start()?;
        let value = f();
        let flushed = self.flush();
        match self.stop() {
            // `f` may have stopped the collector itself.
            Ok(()) | Err(CollectorError::NotRunning) => {}
            Err(err) => return Err(err),
        }
        Ok((value, flushed?))
    }

    /// Hooks to hand to an event source other than the one the collector
    /// subscribes to itself.
    pub fn hooks(&self) -> AllocationHooks {
        AllocationHooks::new(&self.shared)
    }

    pub fn live_sample_count(&self) -> usize {
        self.with_state(|state| state.store.live_count())
    }

    pub fn is_running(&self) -> bool {
        self.with_state(|state| state.running)
    }

    pub fn sample_rate(&self) -> f64 {
        self.with_state(|state| state.config.sample_rate().as_fraction())
    }

    pub fn max_samples(&self) -> usize {
        self.with_state(|state| state.store.max_samples())
    }

    /// Samples still allocated, including released ones an in-progress
    /// flush holds on to.
    pub fn retained_sample_count(&self) -> usize {
        self.with_state(|state| state.store.retained_count())
    }

    pub fn config(&self) -> CollectorConfig {
        self.with_state(|state| state.config.as_config().clone())
    }

    /// Replaces the tags attached to samples taken from now on.
    pub fn set_global_tags(&self, tags: BTreeMap<String, String>) -> Result<(), CollectorError> {
        if tags.keys().any(String::is_empty) {
            return Err(ConfigError::EmptyTagKey.into());
        }
        let guard = self.shared.state.lock();
        guard.borrow_mut().config.set_global_tags(tags);
        Ok(())
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.with_state(|state| MemoryUsage {
            samples: state.store.memory_usage(),
            string_table: state.tables.strings.memory_usage(),
            function_table: state.tables.functions.memory_usage(),
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let guard = self.shared.state.lock();
        let state = guard.borrow();
        f(&state)
    }
}

#[cfg(test)]
impl Collector {
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        let was_running = {
            let guard = self.shared.state.lock();
            let mut state = guard.borrow_mut();
            std::mem::replace(&mut state.running, false)
        };
        if was_running {
            self.source.unsubscribe();
        }
        #[cfg(unix)]
        crate::fork::deregister(&self.shared);
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.with_state(|state| {
            f.debug_struct("Collector")
                .field("running", &state.running)
                .field("store", &state.store)
                .finish_non_exhaustive()
        })
    }
}
