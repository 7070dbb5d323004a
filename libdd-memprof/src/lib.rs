// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! An in-process sampling heap profiler.
//!
//! A [Collector] receives allocation, release and relocation events through
//! [AllocationHooks], keeps a bounded table of live samples, and exports the
//! ones still alive as a gzip-compressed pprof profile on [Collector::flush].
//!
//! The host runtime is reached through two traits: [AllocationEventSource]
//! delivers events, and [HostRuntime] captures and symbolizes backtraces and
//! measures objects. Everything else, including the string and function
//! interning tables, lives in this crate.

pub mod collections;
mod collector;
pub mod config;
mod encoder;
mod error;
mod flush;
#[cfg(unix)]
mod fork;
mod host;
mod identity;
pub mod pprof;
mod sample;
mod sampling;
mod store;

pub use collector::*;
pub use config::{CollectorConfig, ValidatedConfig};
pub use encoder::*;
pub use error::*;
pub use flush::{ExportedProfile, UNKNOWN_FUNCTION};
pub use host::*;
pub use identity::*;
pub use sample::*;
pub use sampling::*;
pub use store::*;
