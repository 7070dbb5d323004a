// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collections::{FunctionTable, LocationId, StringId, StringTable};
use crate::{EncodeError, Sample};
use flate2::write::GzEncoder;
use libdd_memprof_protobuf::{
    profile_field, Function, Label, Line, Location, Record, Sample as PprofSample, StringOffset,
    ValueType, NO_OPT_ZERO, OPT_ZERO,
};
use serde::{Deserialize, Serialize};
use std::hash::BuildHasherDefault;
use std::io::{self, BufWriter, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type FxIndexSet<K> = indexmap::IndexSet<K, BuildHasherDefault<rustc_hash::FxHasher>>;
type FxIndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;

/// Upper bound on an encoded profile unless the caller picks another one.
pub const DEFAULT_MAX_PROFILE_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// What pprof tooling expects.
    #[default]
    Gzip,
    None,
}

#[derive(Clone, Debug)]
pub struct EncodeOptions {
    /// Written as the profile's `time_nanos`.
    pub time: SystemTime,
    /// Written as `duration_nanos`; zero omits it.
    pub duration: Duration,
    pub compression: Compression,
    /// Limit on the output size, measured after compression.
    pub max_bytes: usize,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            time: SystemTime::now(),
            duration: Duration::ZERO,
            compression: Compression::default(),
            max_bytes: DEFAULT_MAX_PROFILE_BYTES,
        }
    }
}

/// Wraps a [`Vec`] to provide a [`Write`] interface that never grows past a
/// maximum capacity, and that reports allocation failure instead of
/// aborting.
#[derive(Debug)]
struct SizeRestrictedBuffer {
    vec: Vec<u8>,
    max_capacity: usize,
}

impl SizeRestrictedBuffer {
    fn new(max_capacity: usize) -> Self {
        const MIB: usize = 1024 * 1024;
        let initial_capacity = (max_capacity >> 2).min(MIB).next_power_of_two();
        let mut vec = Vec::new();
        // A failure here shows up again on the first write.
        _ = vec.try_reserve(initial_capacity);
        Self { vec, max_capacity }
    }
}

impl From<SizeRestrictedBuffer> for Vec<u8> {
    fn from(buf: SizeRestrictedBuffer) -> Self {
        buf.vec
    }
}

impl Write for SizeRestrictedBuffer {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let additional = buf.len();
        if additional <= self.max_capacity.wrapping_sub(self.vec.len()) {
            self.vec
                .try_reserve(additional)
                .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
            self.vec.extend_from_slice(buf);
            Ok(additional)
        } else {
            Err(io::ErrorKind::StorageFull.into())
        }
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serializes samples and the interning tables into a pprof `Profile`.
///
/// Each sample carries two values, `retained_objects/count` (always 1) and
/// `retained_size/bytes`, and its tags as string labels. Location ids are
/// the FunctionTable ids the samples reference. Functions are deduplicated
/// by name and file, and strings by content, with `""` at offset 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProfileEncoder;

impl ProfileEncoder {
    /// Encodes every sample in `samples`. Nothing is returned on failure.
    pub fn encode(
        samples: &[&Sample],
        functions: &FunctionTable,
        strings: &StringTable,
        options: &EncodeOptions,
    ) -> Result<Vec<u8>, EncodeError> {
        let prepared = Prepared::new(samples, functions, strings)?;
        let max_bytes = options.max_bytes;
        let buffer = SizeRestrictedBuffer::new(max_bytes);
        let encoded = match options.compression {
            Compression::Gzip => {
                let encoder = GzEncoder::new(buffer, flate2::Compression::default());
                let encoder = prepared
                    .write_into(encoder, options)
                    .map_err(|err| classify(err, max_bytes))?;
                encoder.finish().map_err(|err| classify(err, max_bytes))?
            }
            Compression::None => prepared
                .write_into(buffer, options)
                .map_err(|err| classify(err, max_bytes))?,
        };
        Ok(encoded.into())
    }
}

fn classify(err: io::Error, max_bytes: usize) -> EncodeError {
    match err.kind() {
        io::ErrorKind::StorageFull => EncodeError::SizeLimitExceeded(max_bytes),
        io::ErrorKind::OutOfMemory => EncodeError::OutOfMemory,
        _ => EncodeError::Io(err),
    }
}

struct PreparedSample {
    location_ids: Vec<u64>,
    values: [i64; 2],
    labels: Vec<Record<Label, 3, NO_OPT_ZERO>>,
}

/// Everything the output needs, with string offsets already assigned. The
/// string table can only be written once every other message has claimed
/// its strings.
struct Prepared<'a> {
    strings: FxIndexSet<&'a str>,
    sample_types: [ValueType; 2],
    default_sample_type: StringOffset,
    samples: Vec<PreparedSample>,
    locations: Vec<Location>,
    functions: Vec<Function>,
}

impl<'a> Prepared<'a> {
    fn new(
        samples: &[&Sample],
        function_table: &FunctionTable,
        string_table: &'a StringTable,
    ) -> Result<Self, EncodeError> {
        let mut strings = FxIndexSet::default();
        strings
            .try_reserve(string_table.len() + 5)
            .map_err(|_| EncodeError::OutOfMemory)?;
        offset_of(&mut strings, "")?;

        let sample_types = [
            ValueType::new(
                offset_of(&mut strings, "retained_objects")?,
                offset_of(&mut strings, "count")?,
            ),
            ValueType::new(
                offset_of(&mut strings, "retained_size")?,
                offset_of(&mut strings, "bytes")?,
            ),
        ];
        let default_sample_type = sample_types[1].r#type.value;

        let mut referenced = Vec::new();
        let mut prepared_samples = Vec::new();
        prepared_samples.try_reserve_exact(samples.len())?;
        for sample in samples {
            referenced.extend_from_slice(sample.locations());
            let mut labels = Vec::new();
            labels.try_reserve_exact(sample.tags().len())?;
            for &(key, value) in sample.tags() {
                let key = offset_of(&mut strings, lookup(string_table, key)?)?;
                let value = offset_of(&mut strings, lookup(string_table, value)?)?;
                labels.push(Record::from(Label::with_str(key, value)));
            }
            let size = sample.size_bytes().unwrap_or(0);
            prepared_samples.push(PreparedSample {
                location_ids: sample
                    .locations()
                    .iter()
                    .map(|id| id.to_pprof_id())
                    .collect(),
                values: [1, i64::try_from(size).unwrap_or(i64::MAX)],
                labels,
            });
        }

        referenced.sort_unstable();
        referenced.dedup();

        let mut function_ids = FxIndexMap::<(StringId, StringId), u64>::default();
        let mut functions = Vec::new();
        let mut locations = Vec::new();
        locations.try_reserve_exact(referenced.len())?;
        for id in referenced {
            let key = function_table
                .lookup(id)
                .ok_or(EncodeError::UnknownLocation(id.get()))?;
            let next_id = function_ids.len() as u64 + 1;
            let function_id = *function_ids.entry((key.name, key.file)).or_insert(next_id);
            if function_id == next_id {
                let name = offset_of(&mut strings, lookup(string_table, key.name)?)?;
                let filename = offset_of(&mut strings, lookup(string_table, key.file)?)?;
                functions.push(Function {
                    id: Record::from(function_id),
                    name: Record::from(name),
                    system_name: Record::from(name),
                    filename: Record::from(filename),
                });
            }
            locations.push(location(id, function_id, key.line));
        }

        Ok(Self {
            strings,
            sample_types,
            default_sample_type,
            samples: prepared_samples,
            locations,
            functions,
        })
    }

    fn write_into<W: Write>(&self, writer: W, options: &EncodeOptions) -> io::Result<W> {
        let mut writer = BufWriter::new(writer);
        self.write(&mut writer, options)?;
        writer.into_inner().map_err(|err| err.into_error())
    }

    fn write<W: Write>(&self, writer: &mut W, options: &EncodeOptions) -> io::Result<()> {
        for sample_type in self.sample_types {
            Record::<ValueType, { profile_field::SAMPLE_TYPE }, NO_OPT_ZERO>::from(sample_type)
                .encode(writer)?;
        }
        for sample in &self.samples {
            let sample = PprofSample {
                location_ids: Record::from(sample.location_ids.as_slice()),
                values: Record::from(sample.values.as_slice()),
                labels: sample.labels.as_slice(),
            };
            Record::<PprofSample, { profile_field::SAMPLE }, NO_OPT_ZERO>::from(sample)
                .encode(writer)?;
        }
        for location in &self.locations {
            Record::<Location, { profile_field::LOCATION }, NO_OPT_ZERO>::from(*location)
                .encode(writer)?;
        }
        for function in &self.functions {
            Record::<Function, { profile_field::FUNCTION }, NO_OPT_ZERO>::from(*function)
                .encode(writer)?;
        }
        for string in &self.strings {
            Record::<&str, { profile_field::STRING_TABLE }, NO_OPT_ZERO>::from(*string)
                .encode(writer)?;
        }

        let time_nanos = options
            .time
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX));
        let duration_nanos = i64::try_from(options.duration.as_nanos()).unwrap_or(i64::MAX);
        Record::<i64, { profile_field::TIME_NANOS }, OPT_ZERO>::from(time_nanos).encode(writer)?;
        Record::<i64, { profile_field::DURATION_NANOS }, OPT_ZERO>::from(duration_nanos)
            .encode(writer)?;
        Record::<i64, { profile_field::DEFAULT_SAMPLE_TYPE }, OPT_ZERO>::from(i64::from(
            self.default_sample_type,
        ))
        .encode(writer)
    }
}

fn offset_of<'a>(strings: &mut FxIndexSet<&'a str>, s: &'a str) -> Result<StringOffset, EncodeError> {
    let (index, _) = strings.insert_full(s);
    StringOffset::try_from(index).map_err(|_| EncodeError::StorageFull)
}

fn lookup(strings: &StringTable, id: StringId) -> Result<&str, EncodeError> {
    strings.lookup(id).ok_or(EncodeError::UnknownString(id.get()))
}

fn location(id: LocationId, function_id: u64, line: u32) -> Location {
    Location {
        id: Record::from(id.to_pprof_id()),
        line: Record::from(Line {
            function_id: Record::from(function_id),
            lineno: Record::from(i64::from(line)),
        }),
        ..Location::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::InternTables;
    use crate::pprof::{self, test_utils::string_table_fetch};
    use crate::{AllocationIdentity, RawBacktrace};

    fn sample(
        tables: &mut InternTables,
        frames: &[(&str, &str, u32)],
        tags: &[(&str, &str)],
        size: u64,
    ) -> Sample {
        let tags = tags
            .iter()
            .map(|(k, v)| {
                (
                    tables.strings.intern(k).unwrap(),
                    tables.strings.intern(v).unwrap(),
                )
            })
            .collect();
        let mut sample = Sample::new(AllocationIdentity::new(1), tags, RawBacktrace::default());
        let InternTables { strings, functions } = tables;
        let locations = frames
            .iter()
            .map(|(name, file, line)| functions.intern(strings, name, file, *line).unwrap())
            .collect();
        sample.set_symbolized(locations);
        sample.set_size(size);
        sample
    }

    fn encode(samples: &[&Sample], tables: &InternTables, compression: Compression) -> Vec<u8> {
        let options = EncodeOptions {
            time: UNIX_EPOCH + Duration::from_secs(1),
            compression,
            ..EncodeOptions::default()
        };
        ProfileEncoder::encode(samples, &tables.functions, &tables.strings, &options).unwrap()
    }

    #[test]
    fn empty_profile() {
        let tables = InternTables::new();
        let encoded = encode(&[], &tables, Compression::Gzip);
        assert_eq!(&encoded[..2], &[0x1f, 0x8b]);

        let profile = pprof::decode(&encoded).unwrap();
        assert!(profile.samples.is_empty());
        assert_eq!(profile.string_table[0], "");
        assert_eq!(profile.time_nanos, 1_000_000_000);
        assert_eq!(profile.sample_types.len(), 2);
        assert_eq!(string_table_fetch(&profile, profile.sample_types[0].r#type), "retained_objects");
        assert_eq!(string_table_fetch(&profile, profile.sample_types[1].unit), "bytes");
        assert_eq!(string_table_fetch(&profile, profile.default_sample_type), "retained_size");
    }

    #[test]
    fn functions_are_deduplicated_by_name_and_file() {
        let mut tables = InternTables::new();
        let a = sample(
            &mut tables,
            &[("alloc", "a.rb", 1), ("main", "main.rb", 9)],
            &[("thread", "worker")],
            64,
        );
        let b = sample(&mut tables, &[("alloc", "a.rb", 2), ("main", "main.rb", 9)], &[], 16);
        let encoded = encode(&[&a, &b], &tables, Compression::None);
        let profile = pprof::decode(&encoded).unwrap();

        assert_eq!(profile.samples.len(), 2);
        assert_eq!(profile.locations.len(), 3);
        assert_eq!(profile.functions.len(), 2);

        let mut location_ids: Vec<u64> = profile.locations.iter().map(|l| l.id).collect();
        let sorted = {
            let mut ids = location_ids.clone();
            ids.sort_unstable();
            ids
        };
        assert_eq!(location_ids, sorted);
        location_ids.dedup();
        assert_eq!(location_ids.len(), 3);

        let mut unique = profile.string_table.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), profile.string_table.len());

        for function in &profile.functions {
            assert_eq!(function.name, function.system_name);
        }

        let first = &profile.samples[0];
        assert_eq!(first.values, vec![1, 64]);
        assert_eq!(first.labels.len(), 1);
        assert_eq!(string_table_fetch(&profile, first.labels[0].key), "thread");
        assert_eq!(string_table_fetch(&profile, first.labels[0].str), "worker");
    }

    #[test]
    fn roundtrip_through_decoder() {
        let mut tables = InternTables::new();
        let a = sample(&mut tables, &[("new", "obj.rb", 3), ("run", "app.rb", 12)], &[("k", "v")], 40);
        let encoded = encode(&[&a], &tables, Compression::Gzip);
        let samples = pprof::resolve_samples(&pprof::decode(&encoded).unwrap()).unwrap();
        assert_eq!(
            samples,
            vec![pprof::ResolvedSample {
                frames: vec![
                    pprof::ResolvedFrame::new("new", "obj.rb", 3),
                    pprof::ResolvedFrame::new("run", "app.rb", 12),
                ],
                tags: vec![("k".to_owned(), "v".to_owned())],
                objects: 1,
                size_bytes: 40,
            }]
        );
    }

    #[test]
    fn output_limit() {
        let mut tables = InternTables::new();
        let a = sample(&mut tables, &[("f", "f.rb", 1)], &[], 8);
        let options = EncodeOptions {
            compression: Compression::None,
            max_bytes: 8,
            ..EncodeOptions::default()
        };
        let err =
            ProfileEncoder::encode(&[&a], &tables.functions, &tables.strings, &options).unwrap_err();
        assert!(matches!(err, EncodeError::SizeLimitExceeded(8)), "{err:?}");
    }

    #[test]
    fn unknown_location_is_reported() {
        let mut tables = InternTables::new();
        let a = sample(&mut tables, &[("f", "f.rb", 1)], &[], 8);
        let id = a.locations()[0];
        let InternTables { strings, functions } = &mut tables;
        functions.release(id, strings).unwrap();
        let err = ProfileEncoder::encode(
            &[&a],
            &tables.functions,
            &tables.strings,
            &EncodeOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EncodeError::UnknownLocation(_)), "{err:?}");
    }
}
