// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Protobuf serializers for the subset of [`profiles`] that a heap profile
//! needs:
//!
//! - [Function]
//! - [Label]
//! - [Location] and [Line]
//! - [Sample]
//! - [ValueType]
//!
//! There is no serializer for the whole Profile. The encoder writes each
//! top-level field as a [Record] directly into a writer, which lets it stream
//! into a compressor without materializing a message tree.
//!
//! Indices into the string table are represented by [StringOffset], which
//! uses a 32-bit number. ID fields are 64-bit on the wire.
//!
//! [`profiles`]: https://github.com/google/pprof/blob/main/proto/profile.proto

mod function;
mod label;
mod location;
mod sample;
mod string;
mod value_type;
mod varint;

#[cfg(feature = "prost_impls")]
pub mod prost_impls;

pub use function::*;
pub use label::*;
pub use location::*;
pub use sample::*;
pub use string::*;
pub use value_type::*;

use std::fmt::{Debug, Formatter};
use std::io::{self, Write};

/// Field numbers of the top-level `Profile` message.
pub mod profile_field {
    pub const SAMPLE_TYPE: u32 = 1;
    pub const SAMPLE: u32 = 2;
    pub const LOCATION: u32 = 4;
    pub const FUNCTION: u32 = 5;
    pub const STRING_TABLE: u32 = 6;
    pub const TIME_NANOS: u32 = 9;
    pub const DURATION_NANOS: u32 = 10;
    pub const DEFAULT_SAMPLE_TYPE: u32 = 14;
}

/// A record is a value paired with its field number, and whether the
/// zero-size optimization applies to it.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
#[repr(transparent)]
#[cfg_attr(test, derive(bolero::generator::TypeGenerator))]
pub struct Record<T: Value, const N: u32, const O: bool> {
    pub value: T,
}

/// Protobuf wire types. Heap profiles only need varints and
/// length-delimited fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    Varint = 0,
    LengthDelimited = 2,
}

/// Something that can be the payload of a [Record].
pub trait Value: Default + Eq {
    const WIRE_TYPE: WireType;

    /// Encoded size in bytes, excluding the tag and any length prefix.
    fn proto_len(&self) -> u64;

    /// Writes the payload without its tag. Writes are small, so callers
    /// wrap unbuffered sinks in a `BufWriter`.
    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()>;
}

/// Marks values that are written as a single varint, which is what packed
/// repeated fields require.
///
/// # Safety
///
/// Implementors must use [`WireType::Varint`] as their [`Value::WIRE_TYPE`].
pub unsafe trait Varint: Value + Sized {}

/// Skip the field entirely when it holds the default value.
pub const OPT_ZERO: bool = true;

/// Always write the field. Repeated top-level fields need this, since an
/// empty message still counts as an element.
pub const NO_OPT_ZERO: bool = false;

impl<T: Value, const N: u32, const O: bool> From<T> for Record<T, N, O> {
    fn from(value: T) -> Self {
        Record { value }
    }
}

impl<T: Value, const N: u32, const O: bool> Record<T, N, O> {
    pub fn proto_len(&self) -> u64 {
        if O && self.value == T::default() {
            return 0;
        }
        let proto_len = self.value.proto_len();
        let len = if T::WIRE_TYPE == WireType::LengthDelimited {
            proto_len.proto_len()
        } else {
            0
        };
        let tag = Tag::new(N, T::WIRE_TYPE).proto_len();
        tag + len + proto_len
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        if O && self.value == T::default() {
            return Ok(());
        }
        Tag::new(N, T::WIRE_TYPE).encode(writer)?;
        if T::WIRE_TYPE == WireType::LengthDelimited {
            self.value.proto_len().encode(writer)?;
        }
        self.value.encode(writer)
    }
}

impl<T: Debug + Value, const N: u32, const O: bool> Debug for Record<T, N, O> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("value", &self.value)
            .field("number", &N)
            .field("optimize_for_zero", &O)
            .finish()
    }
}

const MIN_FIELD: u32 = 1;
const MAX_FIELD: u32 = (1 << 29) - 1;

/// Field number shifted left by three, or'd with the wire type.
#[derive(Copy, Clone)]
pub struct Tag(u32);

impl Tag {
    #[cfg_attr(debug_assertions, track_caller)]
    #[inline]
    pub const fn new(field: u32, wire_type: WireType) -> Self {
        debug_assert!(field >= MIN_FIELD && field <= MAX_FIELD);
        Self((field << 3) | wire_type as u32)
    }

    #[inline]
    pub fn proto_len(self) -> u64 {
        (self.0 as u64).proto_len()
    }

    #[inline]
    pub fn encode<W: Write>(self, writer: &mut W) -> io::Result<()> {
        (self.0 as u64).encode(writer)
    }
}
