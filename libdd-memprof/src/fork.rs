// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Keeps collector locks consistent across `fork`.
//!
//! Before a fork, the forking thread takes the registry lock and then every
//! collector's lock, so no other thread is halfway through a table update
//! when the address space is copied. Both processes release them afterwards.
//! The child also clears in-progress flush markers, because the threads that
//! set them did not survive the fork.

use crate::collector::Shared;
use parking_lot::{const_mutex, Mutex};
use std::sync::{Arc, Once, Weak};
use tracing::warn;

static REGISTRY: Mutex<Vec<Weak<Shared>>> = const_mutex(Vec::new());
static INSTALL_HANDLERS: Once = Once::new();

pub(crate) fn register(shared: &Arc<Shared>) {
    INSTALL_HANDLERS.call_once(install_handlers);
    let mut registry = REGISTRY.lock();
    registry.retain(|weak| weak.strong_count() > 0);
    registry.push(Arc::downgrade(shared));
}

pub(crate) fn deregister(shared: &Arc<Shared>) {
    let target = Arc::downgrade(shared);
    REGISTRY
        .lock()
        .retain(|weak| weak.strong_count() > 0 && !weak.ptr_eq(&target));
}

fn install_handlers() {
    // SAFETY: the handlers take no arguments and never unwind.
    let rc = unsafe { libc::pthread_atfork(Some(prepare), Some(parent), Some(child)) };
    if rc != 0 {
        warn!(rc, "failed to install fork handlers for the heap profiler");
    }
}

extern "C" fn prepare() {
    std::mem::forget(REGISTRY.lock());
    // SAFETY: the registry lock is held by this thread until `parent` or
    // `child` releases it.
    let registry = unsafe { &*REGISTRY.data_ptr() };
    for weak in registry {
        if let Some(shared) = weak.upgrade() {
            std::mem::forget(shared.state.lock());
        }
    }
}

extern "C" fn parent() {
    // SAFETY: `prepare` ran on this thread.
    unsafe { release_all(false) }
}

extern "C" fn child() {
    // SAFETY: `prepare` ran on this thread, which is the only one left.
    unsafe { release_all(true) }
}

/// # Safety
///
/// The calling thread must hold the registry lock and every registered
/// collector lock, as left by `prepare`.
unsafe fn release_all(in_child: bool) {
    let registry = &*REGISTRY.data_ptr();
    for weak in registry {
        if let Some(shared) = weak.upgrade() {
            if in_child {
                shared.flush.reset_after_fork();
            }
            // parking_lot identifies the owner by a thread-local address,
            // which the forking thread keeps in the child, so unlocking here
            // leaves the same state as a freshly created lock.
            shared.state.force_unlock();
        }
    }
    REGISTRY.force_unlock();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AllocationEventSource, AllocationHooks, AllocationIdentity, Collector, HostRuntime,
        RawBacktrace, SymbolizationError, SymbolizedFrame,
    };

    struct NullHost;

    impl HostRuntime for NullHost {
        fn capture_backtrace(&self) -> RawBacktrace {
            RawBacktrace::default()
        }

        fn symbolize(
            &self,
            _: &RawBacktrace,
        ) -> Result<Vec<SymbolizedFrame>, SymbolizationError> {
            Ok(Vec::new())
        }

        fn object_size(&self, _: AllocationIdentity) -> Option<u64> {
            Some(1)
        }
    }

    struct NullSource;

    impl AllocationEventSource for NullSource {
        fn subscribe(&self, _: AllocationHooks) {}
        fn unsubscribe(&self) {}
    }

    fn collector() -> Collector {
        Collector::builder(Arc::new(NullHost), Arc::new(NullSource))
            .sample_rate(1.0)
            .build()
            .unwrap()
    }

    #[test]
    fn drop_deregisters() {
        let collector = collector();
        let shared = Arc::downgrade(collector.shared());
        assert!(REGISTRY.lock().iter().any(|weak| weak.ptr_eq(&shared)));
        drop(collector);
        assert!(!REGISTRY.lock().iter().any(|weak| weak.ptr_eq(&shared)));
    }

    #[test]
    fn locks_are_usable_after_fork() {
        let collector = collector();
        collector.start().unwrap();
        collector.hooks().on_allocate(AllocationIdentity::new(1), &[]);

        // SAFETY: the child only touches the collector and then exits.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            let code = if collector.live_sample_count() == 1 { 0 } else { 1 };
            // SAFETY: exits the child without running the test harness.
            unsafe { libc::_exit(code) };
        }

        let mut status = 0;
        // SAFETY: `pid` is our child.
        let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(waited, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);
        assert_eq!(collector.live_sample_count(), 1);
        assert!(collector.flush().is_ok());
    }
}
