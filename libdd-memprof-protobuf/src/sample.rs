// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{Label, Record, Value, WireType, NO_OPT_ZERO};
use std::io::{self, Write};

/// A sample borrows its data as slices because the fields are walked twice:
/// once to calculate the length, and once to encode it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Sample<'a> {
    /// Ids of Profile.location entries. The leaf is at location_ids\[0\].
    pub location_ids: Record<&'a [u64], 1, NO_OPT_ZERO>,
    /// One value per Profile.sample_type entry.
    pub values: Record<&'a [i64], 2, NO_OPT_ZERO>,
    pub labels: &'a [Record<Label, 3, NO_OPT_ZERO>],
}

impl Value for Sample<'_> {
    const WIRE_TYPE: WireType = WireType::LengthDelimited;

    fn proto_len(&self) -> u64 {
        self.location_ids.proto_len()
            + self.values.proto_len()
            + self.labels.iter().map(Record::proto_len).sum::<u64>()
    }

    fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.location_ids.encode(writer)?;
        self.values.encode(writer)?;
        for label in self.labels {
            label.encode(writer)?;
        }
        Ok(())
    }
}

#[cfg(feature = "prost_impls")]
impl From<Sample<'_>> for crate::prost_impls::Sample {
    fn from(sample: Sample) -> Self {
        Self {
            location_ids: sample.location_ids.value.to_vec(),
            values: sample.values.value.to_vec(),
            labels: sample
                .labels
                .iter()
                .map(|record| crate::prost_impls::Label::from(record.value))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prost_impls;
    use bolero::generator::TypeGenerator;
    use prost::Message;

    #[test]
    fn empty() {
        let sample = Sample {
            location_ids: [].as_slice().into(),
            values: [].as_slice().into(),
            labels: &[],
        };
        let mut buffer = Vec::new();
        sample.encode(&mut buffer).unwrap();
        let decoded = prost_impls::Sample::decode(buffer.as_slice()).unwrap();
        assert_eq!(prost_impls::Sample::default(), decoded);
    }

    #[test]
    fn roundtrip() {
        let generator = (
            Vec::<u64>::produce(),
            Vec::<i64>::produce(),
            Vec::<Label>::produce(),
        );
        bolero::check!()
            .with_generator(generator)
            .for_each(|(location_ids, values, labels)| {
                let labels: Vec<Record<Label, 3, NO_OPT_ZERO>> =
                    labels.iter().copied().map(Record::from).collect();
                let sample = Sample {
                    location_ids: Record::from(location_ids.as_slice()),
                    values: Record::from(values.as_slice()),
                    labels: labels.as_slice(),
                };

                let expected = prost_impls::Sample::from(sample);
                let mut buffer = Vec::with_capacity(sample.proto_len() as usize);
                sample.encode(&mut buffer).unwrap();
                let decoded = prost_impls::Sample::decode(buffer.as_slice()).unwrap();
                assert_eq!(expected, decoded);
            });
    }
}
