// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reference decoding of exported profiles, for tests and for embedders that
//! want to inspect what they are about to upload.

#[cfg(test)]
pub(crate) mod test_utils;

use anyhow::Context;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Read;

pub use libdd_memprof_protobuf::prost_impls::{
    Function, Label, Line, Location, Profile, Sample, ValueType,
};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decodes an exported profile, gunzipping it first when needed.
pub fn decode(encoded: &[u8]) -> anyhow::Result<Profile> {
    use prost::Message;

    let buf = if encoded.starts_with(&GZIP_MAGIC) {
        let mut decoder = flate2::read::GzDecoder::new(encoded);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .context("failed to gunzip profile")?;
        Cow::Owned(out)
    } else {
        Cow::Borrowed(encoded)
    };
    Profile::decode(buf.as_ref()).context("failed to decode pprof")
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResolvedFrame {
    pub function_name: String,
    pub file_name: String,
    pub line: i64,
}

impl ResolvedFrame {
    pub fn new(function_name: &str, file_name: &str, line: i64) -> Self {
        Self {
            function_name: function_name.to_owned(),
            file_name: file_name.to_owned(),
            line,
        }
    }
}

/// A decoded sample with every id resolved to its strings.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResolvedSample {
    /// Leaf first.
    pub frames: Vec<ResolvedFrame>,
    /// Sorted by key.
    pub tags: Vec<(String, String)>,
    pub objects: i64,
    pub size_bytes: i64,
}

/// Resolves every sample of a heap profile, sorted so that two profiles with
/// the same samples compare equal regardless of emission order.
pub fn resolve_samples(profile: &Profile) -> anyhow::Result<Vec<ResolvedSample>> {
    let string = |offset: i64| -> anyhow::Result<String> {
        profile
            .string(offset)
            .map(str::to_owned)
            .with_context(|| format!("string {offset} is out of range"))
    };
    let locations: HashMap<u64, &Location> =
        profile.locations.iter().map(|l| (l.id, l)).collect();
    let functions: HashMap<u64, &Function> =
        profile.functions.iter().map(|f| (f.id, f)).collect();

    let mut resolved = Vec::with_capacity(profile.samples.len());
    for sample in &profile.samples {
        let mut frames = Vec::with_capacity(sample.location_ids.len());
        for id in &sample.location_ids {
            let location = locations
                .get(id)
                .with_context(|| format!("location {id} is missing"))?;
            for line in &location.lines {
                let function = functions
                    .get(&line.function_id)
                    .with_context(|| format!("function {} is missing", line.function_id))?;
                frames.push(ResolvedFrame {
                    function_name: string(function.name)?,
                    file_name: string(function.filename)?,
                    line: line.line,
                });
            }
        }
        let mut tags = sample
            .labels
            .iter()
            .map(|label| Ok((string(label.key)?, string(label.str)?)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        tags.sort();
        let value = |index: usize| sample.values.get(index).copied().unwrap_or(0);
        resolved.push(ResolvedSample {
            frames,
            tags,
            objects: value(0),
            size_bytes: value(1),
        });
    }
    resolved.sort();
    Ok(resolved)
}
