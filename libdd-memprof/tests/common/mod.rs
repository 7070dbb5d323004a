// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use libdd_memprof::{
    AllocationEventSource, AllocationHooks, AllocationIdentity, Collector, CollectorConfig,
    HostRuntime, RawBacktrace, RawFrame, SymbolizationError, SymbolizedFrame,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type Callback = Arc<dyn Fn(AllocationIdentity) + Send + Sync>;
pub type SymbolizeCallback = Arc<dyn Fn() + Send + Sync>;

/// A host whose frames are plain numbers. Frame `n` resolves to `fn_n` in
/// `file_{n % 3}.rb` at line `n`, except frame 0 which has no function name.
/// An object's size is `10 * identity + 8` until it is marked gone.
#[derive(Default)]
pub struct FakeHost {
    stack: Mutex<Vec<u64>>,
    gone: Mutex<HashSet<u64>>,
    fail_symbolization: AtomicBool,
    on_symbolize: Mutex<Option<SymbolizeCallback>>,
    on_measure: Mutex<Option<Callback>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        let host = Self::default();
        *host.stack.lock() = vec![1, 2, 3];
        Arc::new(host)
    }

    pub fn set_stack(&self, frames: &[u64]) {
        *self.stack.lock() = frames.to_vec();
    }

    pub fn mark_gone(&self, identity: u64) {
        self.gone.lock().insert(identity);
    }

    pub fn fail_symbolization(&self, fail: bool) {
        self.fail_symbolization.store(fail, Ordering::SeqCst);
    }

    /// Called before each symbolization.
    pub fn on_symbolize(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_symbolize.lock() = Some(Arc::new(callback));
    }

    /// Called with the identity before each size measurement.
    pub fn on_measure(&self, callback: impl Fn(AllocationIdentity) + Send + Sync + 'static) {
        *self.on_measure.lock() = Some(Arc::new(callback));
    }

    pub fn size_of(identity: u64) -> u64 {
        identity * 10 + 8
    }

    pub fn frame(n: u64) -> (String, String, i64) {
        let name = match n {
            0 => String::new(),
            n => format!("fn_{n}"),
        };
        (name, format!("file_{}.rb", n % 3), n as i64)
    }
}

impl HostRuntime for FakeHost {
    fn capture_backtrace(&self) -> RawBacktrace {
        self.stack.lock().iter().copied().map(RawFrame).collect()
    }

    fn symbolize(
        &self,
        backtrace: &RawBacktrace,
    ) -> Result<Vec<SymbolizedFrame>, SymbolizationError> {
        let callback = self.on_symbolize.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
        if self.fail_symbolization.load(Ordering::SeqCst) {
            let first = backtrace.frames().first().map_or(0, |frame| frame.0);
            return Err(SymbolizationError::UnresolvedFrame(first));
        }
        Ok(backtrace
            .frames()
            .iter()
            .map(|&RawFrame(n)| {
                let (function_name, file_name, line) = Self::frame(n);
                SymbolizedFrame {
                    function_name,
                    file_name,
                    line: line as u32,
                }
            })
            .collect())
    }

    fn object_size(&self, identity: AllocationIdentity) -> Option<u64> {
        let callback = self.on_measure.lock().clone();
        if let Some(callback) = callback {
            callback(identity);
        }
        if self.gone.lock().contains(&identity.get()) {
            None
        } else {
            Some(Self::size_of(identity.get()))
        }
    }
}

/// Forwards events to whichever collector is subscribed.
#[derive(Default)]
pub struct FakeSource {
    hooks: Mutex<Option<AllocationHooks>>,
    drain_on_unsubscribe: AtomicBool,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn hooks(&self) -> Option<AllocationHooks> {
        self.hooks.lock().clone()
    }

    /// Makes `unsubscribe` wait for a hook call running on another thread,
    /// like a source that drains in-flight events before detaching.
    pub fn drain_on_unsubscribe(&self, drain: bool) {
        self.drain_on_unsubscribe.store(drain, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self) -> bool {
        self.hooks.lock().is_some()
    }

    pub fn allocate(&self, identity: u64) {
        self.allocate_tagged(identity, &[]);
    }

    pub fn allocate_tagged(&self, identity: u64, tags: &[(&str, &str)]) {
        if let Some(hooks) = self.hooks() {
            hooks.on_allocate(AllocationIdentity::new(identity), tags);
        }
    }

    pub fn release(&self, identity: u64) {
        if let Some(hooks) = self.hooks() {
            hooks.on_release(AllocationIdentity::new(identity));
        }
    }

    pub fn relocate(&self, old: u64, new: u64) {
        if let Some(hooks) = self.hooks() {
            hooks.on_relocate(AllocationIdentity::new(old), AllocationIdentity::new(new));
        }
    }
}

impl AllocationEventSource for FakeSource {
    fn subscribe(&self, hooks: AllocationHooks) {
        *self.hooks.lock() = Some(hooks);
    }

    fn unsubscribe(&self) {
        let hooks = self.hooks.lock().take();
        if let Some(hooks) = hooks {
            if self.drain_on_unsubscribe.load(Ordering::SeqCst) {
                std::thread::spawn(move || hooks.on_release(AllocationIdentity::new(u64::MAX)))
                    .join()
                    .unwrap();
            }
        }
    }
}

pub fn config(max_samples: usize) -> CollectorConfig {
    CollectorConfig {
        sample_rate: 1.0,
        max_samples,
        ..CollectorConfig::default()
    }
}

/// A started collector that samples everything.
pub fn running_collector(max_samples: usize) -> (Collector, Arc<FakeHost>, Arc<FakeSource>) {
    let host = FakeHost::new();
    let source = FakeSource::new();
    let collector = Collector::new(config(max_samples), host.clone(), source.clone()).unwrap();
    collector.start().unwrap();
    (collector, host, source)
}
