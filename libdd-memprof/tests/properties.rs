// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::running_collector;
use libdd_memprof::pprof;
use proptest::prelude::*;
use std::collections::HashSet;

const MAX_SAMPLES: usize = 6;

#[derive(Clone, Debug)]
enum Op {
    Allocate(u64),
    Release(u64),
    Relocate(u64, u64),
    Flush,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..16u64).prop_map(Op::Allocate),
        2 => (0..16u64).prop_map(Op::Release),
        1 => (0..16u64, 0..16u64).prop_map(|(old, new)| Op::Relocate(old, new)),
        1 => Just(Op::Flush),
    ]
}

/// Identities the collector should be tracking, with the drops it should
/// report next.
#[derive(Default)]
struct Model {
    live: HashSet<u64>,
    dropped: u64,
}

impl Model {
    fn allocate(&mut self, identity: u64) {
        if self.live.len() >= MAX_SAMPLES && !self.live.contains(&identity) {
            self.dropped += 1;
        } else {
            self.live.insert(identity);
        }
    }

    fn relocate(&mut self, old: u64, new: u64) {
        if old != new && self.live.remove(&old) {
            self.live.insert(new);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: if cfg!(miri) { 4 } else { 64 },
        ..ProptestConfig::default()
    })]

    #[test]
    fn proptest_collector_matches_model(ops in proptest::collection::vec(op(), 0..64)) {
        let (collector, _host, source) = running_collector(MAX_SAMPLES);
        let mut model = Model::default();

        for op in ops {
            match op {
                Op::Allocate(identity) => {
                    source.allocate(identity);
                    model.allocate(identity);
                }
                Op::Release(identity) => {
                    source.release(identity);
                    model.live.remove(&identity);
                }
                Op::Relocate(old, new) => {
                    source.relocate(old, new);
                    model.relocate(old, new);
                }
                Op::Flush => {
                    let profile = collector.flush().unwrap();
                    prop_assert_eq!(profile.sample_count, model.live.len());
                    prop_assert_eq!(profile.dropped_count, std::mem::take(&mut model.dropped));
                    let decoded = pprof::decode(&profile.bytes).unwrap();
                    prop_assert_eq!(decoded.samples.len(), model.live.len());
                }
            }
            prop_assert_eq!(collector.live_sample_count(), model.live.len());
        }
    }
}
