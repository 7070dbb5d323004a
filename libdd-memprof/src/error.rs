// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::borrow::Cow;
use std::collections::TryReserveError;
use std::{fmt, io};

/// Errors from the public collector API.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
    #[error("the collector is already running")]
    AlreadyRunning,
    #[error("the collector is not running")]
    NotRunning,
    #[error(transparent)]
    Flush(#[from] FlushError),
}

/// Why a [crate::CollectorConfig] was rejected.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("sample_rate must be within [0, 1], got {0}")]
    SampleRateOutOfRange(f64),
    #[error("max_samples must be greater than zero")]
    ZeroMaxSamples,
    #[error("max_profile_bytes must be greater than zero")]
    ZeroMaxProfileBytes,
    #[error("global tag keys must not be empty")]
    EmptyTagKey,
}

#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("another flush is already in progress")]
    AlreadyFlushing,
    /// The store is left as it was before the flush started.
    #[error("failed to encode the profile: {0}")]
    EncodingFailure(#[from] EncodeError),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("out of memory")]
    OutOfMemory,
    /// The encoded profile would exceed the configured output limit.
    #[error("profile exceeds the size limit of {0} bytes")]
    SizeLimitExceeded(usize),
    /// More unique strings than a pprof string table can index.
    #[error("string table is full")]
    StorageFull,
    #[error("location {0} is not in the function table")]
    UnknownLocation(u32),
    #[error("string {0} is not in the string table")]
    UnknownString(u32),
}

impl From<TryReserveError> for EncodeError {
    #[cold]
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Misuse of an interning table. Callers treat these as broken invariants.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum InternError {
    #[error("id {0} is not interned")]
    UnknownId(u32),
    #[error("reference count overflow")]
    RefcountOverflow,
    #[error("ran out of ids")]
    IdsExhausted,
}

/// Reported by [crate::HostRuntime::symbolize] when a backtrace can't be
/// resolved. The sample is skipped for the current flush and retried on the
/// next one.
#[derive(Debug, thiserror::Error)]
pub enum SymbolizationError {
    #[error("frame {0:#x} could not be resolved")]
    UnresolvedFrame(u64),
    #[error("{0}")]
    Other(Cow<'static, str>),
}

impl SymbolizationError {
    pub fn other(error: impl Into<Cow<'static, str>>) -> Self {
        Self::Other(error.into())
    }
}

/// Logs and aborts. Reserved for broken refcount or handle invariants, after
/// which the tables can no longer be trusted.
#[cold]
#[inline(never)]
pub(crate) fn fatal(args: fmt::Arguments) -> ! {
    tracing::error!("heap profiler invariant violated: {args}");
    std::process::abort()
}
