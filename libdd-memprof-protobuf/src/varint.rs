// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{Value, Varint, WireType};
use std::io::{self, Write};

/// Longest varint encoding of a 64-bit value.
const MAX_VARINT_LEN: usize = 10;

impl Value for u64 {
    const WIRE_TYPE: WireType = WireType::Varint;

    #[inline]
    fn proto_len(&self) -> u64 {
        // Seven payload bits per byte; zero still takes one byte.
        let bits = u64::BITS - (self | 1).leading_zeros();
        u64::from(bits.div_ceil(7))
    }

    /// Little-endian base-128, high bit set on every byte but the last.
    #[inline]
    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let mut len = 0;
        let mut value = *self;
        while value >= 0x80 {
            buf[len] = (value as u8) | 0x80;
            value >>= 7;
            len += 1;
        }
        buf[len] = value as u8;
        writer.write_all(&buf[..=len])
    }
}

/// Two's complement, so negative values always take ten bytes, as pprof's
/// `int64` fields expect.
impl Value for i64 {
    const WIRE_TYPE: WireType = WireType::Varint;

    fn proto_len(&self) -> u64 {
        (*self as u64).proto_len()
    }

    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        (*self as u64).encode(writer)
    }
}

unsafe impl Varint for u64 {}
unsafe impl Varint for i64 {}

/// Packed repeated varints.
impl<T: Varint> Value for &'_ [T] {
    const WIRE_TYPE: WireType = WireType::LengthDelimited;

    fn proto_len(&self) -> u64 {
        self.iter().map(Value::proto_len).sum()
    }

    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for value in self.iter() {
            value.encode(writer)?;
        }
        Ok(())
    }
}
