// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{Compression, ConfigError, SampleRate, DEFAULT_MAX_PROFILE_BYTES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DD_MEMPROF_SAMPLE_RATE: &str = "DD_MEMPROF_SAMPLE_RATE";
pub const DD_MEMPROF_MAX_SAMPLES: &str = "DD_MEMPROF_MAX_SAMPLES";

pub const DEFAULT_SAMPLE_RATE: f64 = 0.01;
pub const DEFAULT_MAX_SAMPLES: usize = 50_000;

pub mod parse_env {
    use std::{env, str::FromStr};

    pub fn float(name: &str) -> Option<f64> {
        env::var(name).ok()?.trim().parse::<f64>().ok()
    }

    pub fn int<T: FromStr>(name: &str) -> Option<T> {
        env::var(name).ok()?.trim().parse::<T>().ok()
    }
}

/// User-facing settings. Nothing is checked until [CollectorConfig::validate].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Probability in `[0, 1]` that an allocation is sampled.
    pub sample_rate: f64,
    /// Upper bound on retained samples. Allocations past it are dropped and
    /// counted.
    pub max_samples: usize,
    /// Tags attached to every sample. Tags passed with an allocation event
    /// override these when the keys match.
    pub global_tags: BTreeMap<String, String>,
    pub compression: Compression,
    /// A flush whose output would exceed this many bytes, measured after
    /// compression, fails and leaves the samples for the next one.
    pub max_profile_bytes: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            max_samples: DEFAULT_MAX_SAMPLES,
            global_tags: BTreeMap::new(),
            compression: Compression::default(),
            max_profile_bytes: DEFAULT_MAX_PROFILE_BYTES,
        }
    }
}

impl CollectorConfig {
    /// Defaults, overridden by `DD_MEMPROF_SAMPLE_RATE` and
    /// `DD_MEMPROF_MAX_SAMPLES` when they are set and parse.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        if let Some(rate) = parse_env::float(DD_MEMPROF_SAMPLE_RATE) {
            self.sample_rate = rate;
        }
        if let Some(max) = parse_env::int(DD_MEMPROF_MAX_SAMPLES) {
            self.max_samples = max;
        }
    }

    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        let rate = SampleRate::from_fraction(self.sample_rate)
            .ok_or(ConfigError::SampleRateOutOfRange(self.sample_rate))?;
        if self.max_samples == 0 {
            return Err(ConfigError::ZeroMaxSamples);
        }
        if self.max_profile_bytes == 0 {
            return Err(ConfigError::ZeroMaxProfileBytes);
        }
        if self.global_tags.keys().any(String::is_empty) {
            return Err(ConfigError::EmptyTagKey);
        }
        Ok(ValidatedConfig {
            rate,
            config: self.clone(),
        })
    }
}

/// A configuration that passed validation, with the rate converted to its
/// fixed-point form.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedConfig {
    rate: SampleRate,
    config: CollectorConfig,
}

impl ValidatedConfig {
    #[inline]
    pub fn sample_rate(&self) -> SampleRate {
        self.rate
    }

    #[inline]
    pub fn max_samples(&self) -> usize {
        self.config.max_samples
    }

    #[inline]
    pub fn compression(&self) -> Compression {
        self.config.compression
    }

    #[inline]
    pub fn max_profile_bytes(&self) -> usize {
        self.config.max_profile_bytes
    }

    pub fn global_tags(&self) -> &BTreeMap<String, String> {
        &self.config.global_tags
    }

    pub(crate) fn set_global_tags(&mut self, tags: BTreeMap<String, String>) {
        self.config.global_tags = tags;
    }

    pub fn as_config(&self) -> &CollectorConfig {
        &self.config
    }
}
