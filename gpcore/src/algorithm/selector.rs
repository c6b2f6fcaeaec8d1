use std::cmp::Reverse;

use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::algorithm::matcher::MatchResult;
use crate::data::layers::Region;
use crate::pattern::golden::PatternKey;

/// Final trigger candidate, one per (region, bx) at most.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub region: Region,
    pub bx: i32,
    pub pattern: usize,
    pub key: PatternKey,
    pub ref_stub: usize,
    /// Phi and eta of the reference stub.
    pub phi: i32,
    pub eta: i32,
    pub quality: u8,
    pub score: f64,
    pub fired_layers: u64,
    pub fired_count: u8,
}

impl Candidate {
    pub fn charge(&self) -> i8 {
        self.key.charge
    }

    pub fn pt_class(&self) -> u16 {
        self.key.pt_class
    }

    pub fn ref_layer(&self) -> u8 {
        self.key.ref_layer
    }
}

/// Quality of a candidate from its number of fired layers.
pub fn quality_from_fired(fired_count: u8) -> u8 {
    match fired_count {
        n if n >= 6 => 12,
        n if n >= 4 => 8,
        n if n >= 2 => 4,
        _ => 1,
    }
}

/// Ghost-busting: keep the best result of every (region, bx) group.
///
/// Highest score wins; ties go to the lower reference layer, then the lower
/// pattern index, then the lower reference stub index. Output is ordered by
/// region then bx.
pub fn select(results: &[MatchResult]) -> Vec<Candidate> {
    results
        .iter()
        .into_group_map_by(|r| (r.region, r.bx))
        .into_iter()
        .sorted_by_key(|(k, _)| *k)
        .filter_map(|(_, group)| {
            group
                .into_iter()
                .max_by_key(|r| {
                    (
                        OrderedFloat(r.score),
                        Reverse(r.ref_layer),
                        Reverse(r.pattern),
                        Reverse(r.ref_stub),
                    )
                })
                .map(to_candidate)
        })
        .collect()
}

fn to_candidate(r: &MatchResult) -> Candidate {
    Candidate {
        region: r.region,
        bx: r.bx,
        pattern: r.pattern,
        key: r.key,
        ref_stub: r.ref_stub,
        phi: r.ref_phi,
        eta: r.ref_eta,
        quality: quality_from_fired(r.fired_count),
        score: r.score,
        fired_layers: r.fired_layers,
        fired_count: r.fired_count,
    }
}
