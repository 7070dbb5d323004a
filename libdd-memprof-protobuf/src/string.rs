// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{Value, Varint, WireType};
use std::fmt;
use std::io::{self, Write};

impl Value for &str {
    const WIRE_TYPE: WireType = WireType::LengthDelimited;

    fn proto_len(&self) -> u64 {
        self.len() as u64
    }

    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.as_bytes())
    }
}

/// Represents an offset into the Profile's string table. It cannot exceed
/// u32 because an entire protobuf message must be smaller than 2 GiB, and
/// with the tag and length prefix of each string there's no way to fit more
/// unique strings than that.
///
/// A value of 0 means "no string" or "empty string" (they are synonymous).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(test, derive(bolero::generator::TypeGenerator))]
pub struct StringOffset(u32);

impl fmt::Display for StringOffset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Value for StringOffset {
    const WIRE_TYPE: WireType = WireType::Varint;

    fn proto_len(&self) -> u64 {
        u64::from(self.0).proto_len()
    }

    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        u64::from(self.0).encode(writer)
    }
}

unsafe impl Varint for StringOffset {}

impl TryFrom<usize> for StringOffset {
    type Error = <u32 as TryFrom<usize>>::Error;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Ok(StringOffset(u32::try_from(value)?))
    }
}

impl From<u32> for StringOffset {
    fn from(value: u32) -> Self {
        StringOffset(value)
    }
}

impl From<StringOffset> for u32 {
    fn from(s: StringOffset) -> Self {
        s.0
    }
}

impl From<StringOffset> for usize {
    fn from(s: StringOffset) -> Self {
        s.0 as usize
    }
}

impl From<StringOffset> for i64 {
    fn from(s: StringOffset) -> Self {
        s.0 as i64
    }
}

impl StringOffset {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}
