// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{Record, Value, WireType, NO_OPT_ZERO, OPT_ZERO};
use std::io::{self, Write};

/// A location with a single line of debug information. Heap profiles never
/// carry mappings or addresses, but the fields are kept so the message stays
/// wire-compatible with what other producers emit.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(test, derive(bolero::generator::TypeGenerator))]
pub struct Location {
    /// Unique nonzero id for the location.
    pub id: Record<u64, 1, NO_OPT_ZERO>,
    pub mapping_id: Record<u64, 2, OPT_ZERO>,
    pub address: Record<u64, 3, OPT_ZERO>,
    pub line: Record<Line, 4, OPT_ZERO>,
}

/// Function and line number. Omits column.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(test, derive(bolero::generator::TypeGenerator))]
pub struct Line {
    /// The id of the corresponding Function for this line.
    pub function_id: Record<u64, 1, OPT_ZERO>,
    pub lineno: Record<i64, 2, OPT_ZERO>,
}

impl Value for Line {
    const WIRE_TYPE: WireType = WireType::LengthDelimited;

    fn proto_len(&self) -> u64 {
        self.function_id.proto_len() + self.lineno.proto_len()
    }

    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.function_id.encode(writer)?;
        self.lineno.encode(writer)
    }
}

impl Value for Location {
    const WIRE_TYPE: WireType = WireType::LengthDelimited;

    fn proto_len(&self) -> u64 {
        self.id.proto_len()
            + self.mapping_id.proto_len()
            + self.address.proto_len()
            + self.line.proto_len()
    }

    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.id.encode(writer)?;
        self.mapping_id.encode(writer)?;
        self.address.encode(writer)?;
        self.line.encode(writer)
    }
}

#[cfg(feature = "prost_impls")]
impl From<Line> for crate::prost_impls::Line {
    fn from(line: Line) -> Self {
        Self {
            function_id: line.function_id.value,
            line: line.lineno.value,
        }
    }
}

#[cfg(feature = "prost_impls")]
impl From<&Location> for crate::prost_impls::Location {
    fn from(location: &Location) -> Self {
        Self {
            id: location.id.value,
            mapping_id: location.mapping_id.value,
            address: location.address.value,
            lines: if location.line == Default::default() {
                Vec::new()
            } else {
                vec![crate::prost_impls::Line::from(location.line.value)]
            },
        }
    }
}
