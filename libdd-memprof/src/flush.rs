// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collector::State;
use crate::error::fatal;
use crate::{
    EncodeOptions, FlushError, HostRuntime, ProfileEncoder, Sample, SampleHandle,
    SymbolizationError,
};
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Function name used when the host resolves a frame without one.
pub const UNKNOWN_FUNCTION: &str = "(unknown)";

/// The result of a successful flush.
#[derive(Clone, Debug)]
pub struct ExportedProfile {
    /// The encoded pprof, gzip-compressed unless configured otherwise.
    pub bytes: Vec<u8>,
    /// Samples written to `bytes`.
    pub sample_count: usize,
    /// Allocations dropped at capacity since the previous flush.
    pub dropped_count: u64,
    /// Samples in the snapshot, whether or not they were written.
    pub processed_count: usize,
    /// Samples left out because symbolization failed. They are retried by
    /// the next flush.
    pub skipped_count: usize,
    /// Time spent in the flush, including waiting for the lock.
    pub duration: Duration,
}

/// Runs export cycles, at most one at a time per collector.
#[derive(Debug, Default)]
pub(crate) struct FlushCoordinator {
    flushing: AtomicBool,
}

struct FlushingGuard<'a>(&'a AtomicBool);

impl Drop for FlushingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl FlushCoordinator {
    fn try_begin(&self) -> Option<FlushingGuard<'_>> {
        self.flushing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| FlushingGuard(&self.flushing))
    }

    /// Only the forking thread survives in a child process, so a flush that
    /// was waiting for the lock on another thread will never finish there.
    #[cfg(unix)]
    pub fn reset_after_fork(&self) {
        self.flushing.store(false, Ordering::Relaxed);
    }

    /// Snapshots the live samples, symbolizes and measures them, and encodes
    /// the survivors.
    ///
    /// The lock is held for the whole cycle, but the state is never borrowed
    /// across a host call, so the host may deliver allocation events from
    /// inside `symbolize` or `object_size`.
    pub fn flush(
        &self,
        lock: &ReentrantMutex<RefCell<State>>,
        host: &dyn HostRuntime,
    ) -> Result<ExportedProfile, FlushError> {
        let _flushing = self.try_begin().ok_or(FlushError::AlreadyFlushing)?;
        let started = Instant::now();
        let guard = lock.lock();
        let state: &RefCell<State> = &guard;

        let (handles, dropped_count, options) = {
            let mut state = state.borrow_mut();
            let options = EncodeOptions {
                time: SystemTime::now(),
                duration: state.session_start.map(|s| s.elapsed()).unwrap_or_default(),
                compression: state.config.compression(),
                max_bytes: state.config.max_profile_bytes(),
            };
            let handles = state.store.snapshot();
            (handles, state.store.take_dropped(), options)
        };
        let processed_count = handles.len();

        let mut skipped_count = 0;
        for &handle in &handles {
            if let Err(err) = symbolize(state, host, handle) {
                debug!(%err, "skipping sample that failed to symbolize");
                skipped_count += 1;
            }
        }
        if skipped_count > 0 {
            warn!(
                skipped_count,
                "some heap samples could not be symbolized and were left for the next flush"
            );
        }

        let included: Vec<SampleHandle> = handles
            .iter()
            .copied()
            .filter(|&handle| measure(state, host, handle))
            .collect();

        let encoded = {
            let state = state.borrow();
            let samples: Vec<&Sample> = included
                .iter()
                .filter_map(|&handle| state.store.sample(handle))
                .collect();
            ProfileEncoder::encode(
                &samples,
                &state.tables.functions,
                &state.tables.strings,
                &options,
            )
        };

        {
            let mut state = state.borrow_mut();
            let State { store, tables, .. } = &mut *state;
            store.release_snapshot(handles, tables);
            if encoded.is_err() {
                store.restore_dropped(dropped_count);
            }
        }

        let bytes = encoded.map_err(|err| {
            warn!(%err, "failed to encode heap profile");
            FlushError::EncodingFailure(err)
        })?;
        let profile = ExportedProfile {
            bytes,
            sample_count: included.len(),
            dropped_count,
            processed_count,
            skipped_count,
            duration: started.elapsed(),
        };
        debug!(
            sample_count = profile.sample_count,
            dropped_count = profile.dropped_count,
            processed_count = profile.processed_count,
            skipped_count = profile.skipped_count,
            bytes = profile.bytes.len(),
            duration_ms = profile.duration.as_millis() as u64,
            "heap profile flushed"
        );
        Ok(profile)
    }
}

/// Symbolizes a sample that still carries raw frames. On failure the frames
/// are put back so a later flush can retry.
fn symbolize(
    state: &RefCell<State>,
    host: &dyn HostRuntime,
    handle: SampleHandle,
) -> Result<(), SymbolizationError> {
    let backtrace = {
        let mut state = state.borrow_mut();
        let Some(sample) = state.store.sample_mut(handle) else {
            fatal(format_args!("snapshot sample {handle:?} is missing"))
        };
        if sample.is_released() || sample.is_symbolized() {
            return Ok(());
        }
        match sample.take_raw_backtrace() {
            Some(backtrace) => backtrace,
            None => return Ok(()),
        }
    };

    let frames = match host.symbolize(&backtrace) {
        Ok(frames) => frames,
        Err(err) => {
            if let Some(sample) = state.borrow_mut().store.sample_mut(handle) {
                sample.restore_raw_backtrace(backtrace);
            }
            return Err(err);
        }
    };

    let mut state = state.borrow_mut();
    let State { store, tables, .. } = &mut *state;
    let mut locations = Vec::with_capacity(frames.len());
    for frame in &frames {
        let function_name = match frame.function_name.as_str() {
            "" => UNKNOWN_FUNCTION,
            name => name,
        };
        match tables.functions.intern(
            &mut tables.strings,
            function_name,
            &frame.file_name,
            frame.line,
        ) {
            Ok(id) => locations.push(id),
            Err(err) => fatal(format_args!("interning frame {function_name}: {err}")),
        }
    }
    match store.sample_mut(handle) {
        Some(sample) => sample.set_symbolized(locations),
        None => fatal(format_args!("snapshot sample {handle:?} is missing")),
    }
    Ok(())
}

/// Records the size of a symbolized, still-live sample. Returns whether the
/// sample belongs in this export.
fn measure(state: &RefCell<State>, host: &dyn HostRuntime, handle: SampleHandle) -> bool {
    let identity = {
        let state = state.borrow();
        match state.store.sample(handle) {
            Some(sample) if sample.is_symbolized() => sample.identity(),
            _ => None,
        }
    };
    let Some(identity) = identity else {
        return false;
    };

    let size = host.object_size(identity);

    let mut state = state.borrow_mut();
    match (state.store.sample_mut(handle), size) {
        // Released while it was being measured.
        (Some(sample), _) if sample.is_released() => false,
        (Some(sample), Some(size)) => {
            sample.set_size(size);
            true
        }
        _ => false,
    }
}
