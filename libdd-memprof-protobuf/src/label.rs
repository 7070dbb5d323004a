// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{Record, StringOffset, Value, WireType, OPT_ZERO};
use std::io::{self, Write};

/// Additional context attached to a sample. Heap samples carry the
/// collector's global tags as string labels.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(test, derive(bolero::generator::TypeGenerator))]
pub struct Label {
    pub key: Record<StringOffset, 1, OPT_ZERO>,
    /// At most one of `str` and `num` should be set.
    pub str: Record<StringOffset, 2, OPT_ZERO>,
    pub num: Record<i64, 3, OPT_ZERO>,
    /// Units of `num`, only meaningful when `num` is present.
    pub num_unit: Record<StringOffset, 4, OPT_ZERO>,
}

impl Label {
    /// A string-valued label.
    pub fn with_str(key: StringOffset, value: StringOffset) -> Self {
        Self {
            key: key.into(),
            str: value.into(),
            ..Self::default()
        }
    }
}

impl Value for Label {
    const WIRE_TYPE: WireType = WireType::LengthDelimited;

    fn proto_len(&self) -> u64 {
        self.key.proto_len()
            + self.str.proto_len()
            + self.num.proto_len()
            + self.num_unit.proto_len()
    }

    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.key.encode(writer)?;
        self.str.encode(writer)?;
        self.num.encode(writer)?;
        self.num_unit.encode(writer)
    }
}

#[cfg(feature = "prost_impls")]
impl From<Label> for crate::prost_impls::Label {
    fn from(label: Label) -> Self {
        Self::from(&label)
    }
}

#[cfg(feature = "prost_impls")]
impl From<&Label> for crate::prost_impls::Label {
    fn from(label: &Label) -> Self {
        Self {
            key: label.key.value.into(),
            str: label.str.value.into(),
            num: label.num.value,
            num_unit: label.num_unit.value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prost_impls;
    use prost::Message;

    #[test]
    fn string_label() {
        let label = Label::with_str(StringOffset::new(3), StringOffset::new(4));
        let mut buffer = Vec::new();
        label.encode(&mut buffer).unwrap();
        assert_eq!(buffer, [0x08, 0x03, 0x10, 0x04]);
        assert_eq!(label.proto_len(), 4);
    }

    #[test]
    fn roundtrip() {
        bolero::check!().with_type::<Label>().for_each(|label: &Label| {
            let expected = prost_impls::Label::from(label);
            let mut buffer = Vec::with_capacity(label.proto_len() as usize);
            label.encode(&mut buffer).unwrap();
            assert_eq!(buffer.len() as u64, label.proto_len());
            let decoded = prost_impls::Label::decode(buffer.as_slice()).unwrap();
            assert_eq!(expected, decoded);
        });
    }
}
