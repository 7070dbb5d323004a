// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{Record, StringOffset, Value, WireType, OPT_ZERO};
use std::io::{self, Write};

/// ValueType describes the semantics and measurement units of a value.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(test, derive(bolero::generator::TypeGenerator))]
pub struct ValueType {
    pub r#type: Record<StringOffset, 1, OPT_ZERO>,
    pub unit: Record<StringOffset, 2, OPT_ZERO>,
}

impl ValueType {
    #[inline]
    pub fn new(r#type: StringOffset, unit: StringOffset) -> Self {
        Self {
            r#type: r#type.into(),
            unit: unit.into(),
        }
    }
}

impl Value for ValueType {
    const WIRE_TYPE: WireType = WireType::LengthDelimited;

    fn proto_len(&self) -> u64 {
        self.r#type.proto_len() + self.unit.proto_len()
    }

    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.r#type.encode(writer)?;
        self.unit.encode(writer)
    }
}

#[cfg(feature = "prost_impls")]
impl From<&ValueType> for crate::prost_impls::ValueType {
    fn from(value: &ValueType) -> Self {
        Self {
            r#type: value.r#type.value.into(),
            unit: value.unit.value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prost_impls;
    use prost::Message;

    #[test]
    fn roundtrip() {
        bolero::check!()
            .with_type::<ValueType>()
            .for_each(|value_type: &ValueType| {
                let expected = prost_impls::ValueType::from(value_type);
                let mut buffer = Vec::with_capacity(value_type.proto_len() as usize);
                value_type.encode(&mut buffer).unwrap();
                let decoded = prost_impls::ValueType::decode(buffer.as_slice()).unwrap();
                assert_eq!(expected, decoded);
            });
    }
}
