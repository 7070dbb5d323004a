// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use rand::Rng;

/// Probability of sampling an allocation, stored as a fixed-point fraction
/// of `u32::MAX`. Each draw compares a fresh random `u32` against it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SampleRate(u32);

impl SampleRate {
    pub const NEVER: Self = Self(0);
    pub const ALWAYS: Self = Self(u32::MAX);

    /// Converts a fraction in `[0, 1]`. Anything else, NaN included, is
    /// rejected.
    pub fn from_fraction(rate: f64) -> Option<Self> {
        if !(0.0..=1.0).contains(&rate) {
            return None;
        }
        let scaled = (rate * f64::from(u32::MAX)).round();
        // The range check above keeps `scaled` within u32.
        Some(Self(scaled as u32))
    }

    pub fn as_fraction(self) -> f64 {
        f64::from(self.0) / f64::from(u32::MAX)
    }

    pub const fn threshold(self) -> u32 {
        self.0
    }

    /// Draws from the calling thread's generator. There is no shared state
    /// between threads.
    #[inline]
    pub fn should_sample(self) -> bool {
        self.should_sample_with(&mut rand::thread_rng())
    }

    #[inline]
    pub fn should_sample_with<R: Rng + ?Sized>(self, rng: &mut R) -> bool {
        match self.0 {
            0 => false,
            u32::MAX => true,
            threshold => rng.gen::<u32>() < threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn bounds() {
        assert_eq!(SampleRate::from_fraction(0.0), Some(SampleRate::NEVER));
        assert_eq!(SampleRate::from_fraction(1.0), Some(SampleRate::ALWAYS));
        assert_eq!(SampleRate::from_fraction(-0.1), None);
        assert_eq!(SampleRate::from_fraction(1.5), None);
        assert_eq!(SampleRate::from_fraction(f64::NAN), None);
    }

    #[test]
    fn extremes_ignore_the_generator() {
        let mut rng = StepRng::new(u64::MAX, 0);
        assert!(SampleRate::ALWAYS.should_sample_with(&mut rng));
        let mut rng = StepRng::new(0, 0);
        assert!(!SampleRate::NEVER.should_sample_with(&mut rng));
    }

    #[test]
    fn threshold_comparison() {
        let half = SampleRate::from_fraction(0.5).unwrap();
        let mut low = StepRng::new(0, 0);
        assert!(half.should_sample_with(&mut low));
        let mut high = StepRng::new(u64::MAX, 0);
        assert!(!half.should_sample_with(&mut high));
        assert!((half.as_fraction() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn thread_rng_respects_rate() {
        let rate = SampleRate::from_fraction(0.25).unwrap();
        let hits = (0..20_000).filter(|_| rate.should_sample()).count();
        assert!((3_000..7_000).contains(&hits), "hits: {hits}");
    }
}
