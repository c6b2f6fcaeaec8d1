//! Match the stubs of one event against the pattern bank.
//!
//! For every bunch crossing, every eligible reference stub (in reference-layer
//! priority order) is projected onto the other layers and scored by all
//! patterns of its reference layer.

use log::debug;

use crate::algorithm::extrapolation::{ExtrapolationFactorTable, ExtrapolationTarget, Extrapolator};
use crate::config::EmulatorConfig;
use crate::data::layers::{wrap_phi, Region};
use crate::data::store::StubStore;
use crate::data::stub::Stub;
use crate::error::Result;
use crate::pattern::bank::{LayerHits, PatternBank, RefContext};
use crate::pattern::golden::PatternKey;
use crate::pattern::score::FinalizeMode;
use crate::pattern::stats::{TrainingSample, TruthMuon};

/// One pattern that passed the thresholds for one reference stub.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchResult {
    pub pattern: usize,
    pub key: PatternKey,
    pub ref_layer: u8,
    /// Position of the reference layer in the priority list.
    pub ref_priority: usize,
    /// Index of the reference stub within its layer.
    pub ref_stub: usize,
    pub ref_phi: i32,
    pub ref_eta: i32,
    pub bx: i32,
    pub region: Region,
    pub score: f64,
    pub fired_layers: u64,
    pub fired_count: u8,
    pub finalize: FinalizeMode,
}

#[derive(Clone, Debug)]
pub struct Matcher<'a> {
    cfg: &'a EmulatorConfig,
    bank: &'a PatternBank,
    extrapolator: Extrapolator<'a>,
}

impl<'a> Matcher<'a> {
    /// Fails when the bank does not fit the layer map or extrapolation is
    /// switched on without a usable mode.
    pub fn new(
        cfg: &'a EmulatorConfig,
        bank: &'a PatternBank,
        table: Option<&'a ExtrapolationFactorTable>,
    ) -> Result<Self> {
        bank.check_layers(&cfg.layers)?;
        let extrapolator = Extrapolator::new(
            &cfg.layers,
            &cfg.extrapolation,
            table,
            cfg.eta_encoding,
            cfg.stubs.n_phi_bins,
        );
        extrapolator.check()?;
        Ok(Matcher { cfg, bank, extrapolator })
    }

    pub fn bank(&self) -> &PatternBank {
        self.bank
    }

    /// All results above the score and fired-layer thresholds.
    ///
    /// Ordered by bx, then reference priority, then reference stub, then score.
    pub fn match_event(&self, store: &StubStore) -> Vec<MatchResult> {
        let m = &self.cfg.matching;
        let mut out = Vec::new();

        for bx in store.bunch_crossings() {
            for rs in store.reference_stubs(bx, &m.ref_layers) {
                let hits = match self.project(store, bx, rs.stub) {
                    Ok(hits) => hits,
                    Err(e) => {
                        debug!("bx {}: skipping reference stub {} of layer {}: {}", bx, rs.index, rs.stub.layer, e);
                        continue;
                    }
                };
                let reference = RefContext {
                    layer: rs.stub.layer,
                    phi: rs.stub.phi,
                    phi_b: rs.stub.phi_b.unwrap_or(0),
                };

                for s in self.bank.match_reference(&reference, &hits, m.finalize) {
                    if s.fired_count < m.min_fired_layers || s.score <= m.min_score {
                        continue;
                    }
                    let Some(pattern) = self.bank.get(s.pattern) else {
                        continue;
                    };
                    out.push(MatchResult {
                        pattern: s.pattern,
                        key: pattern.key,
                        ref_layer: rs.stub.layer,
                        ref_priority: rs.priority,
                        ref_stub: rs.index,
                        ref_phi: rs.stub.phi,
                        ref_eta: rs.stub.eta,
                        bx,
                        region: rs.stub.region,
                        score: s.score,
                        fired_layers: s.fired_layers,
                        fired_count: s.fired_count,
                        finalize: m.finalize,
                    });
                }
            }
        }
        out
    }

    /// Distances recorded for training, keyed by the truth pattern.
    ///
    /// Uses the highest-priority reference stub (bunch crossings closest to
    /// zero first) whose truth pattern exists; per layer the stub closest to
    /// the pattern's expected distance is recorded.
    pub fn training_sample(&self, store: &StubStore, truth: &TruthMuon) -> Option<(usize, TrainingSample)> {
        let mut bxs = store.bunch_crossings();
        bxs.sort_by_key(|bx| (bx.abs(), *bx));

        for bx in bxs {
            for rs in store.reference_stubs(bx, &self.cfg.matching.ref_layers) {
                let key = PatternKey::new(rs.stub.layer, truth.charge, truth.pt_class);
                let Some(idx) = self.bank.find(&key) else {
                    continue;
                };
                let Some(pattern) = self.bank.get(idx) else {
                    continue;
                };
                let hits = match self.project(store, bx, rs.stub) {
                    Ok(hits) => hits,
                    Err(e) => {
                        debug!("training: skipping reference stub of layer {}: {}", rs.stub.layer, e);
                        continue;
                    }
                };

                let ref_phi = rs.stub.phi;
                let ref_phi_b = rs.stub.phi_b.unwrap_or(0);
                let layers = pattern
                    .layers
                    .iter()
                    .map(|lp| {
                        let expected = lp.expected_dist(ref_phi, ref_phi_b);
                        let closest = hits
                            .iter()
                            .find(|h| h.layer == lp.layer)
                            .and_then(|h| h.dists.iter().map(|&(_, d)| d).min_by_key(|d| d.abs_diff(expected)));
                        (lp.layer, closest)
                    })
                    .collect();

                return Some((idx, TrainingSample { ref_phi, ref_phi_b, layers }));
            }
        }
        None
    }

    /// Raw distances of every other layer's stubs to the reference prediction.
    fn project(&self, store: &StubStore, bx: i32, reference: &Stub) -> Result<Vec<LayerHits>> {
        let n_phi_bins = self.cfg.stubs.n_phi_bins;
        let extrapolate = self.extrapolator.is_enabled_for(reference.layer);
        let own_bend = self.cfg.layers.get(reference.layer).and_then(|l| l.bend_layer);

        let mut out = Vec::new();
        for spec in self.cfg.layers.iter() {
            if spec.id == reference.layer {
                continue;
            }
            let stubs = store.layer_stubs(bx, spec.id);
            if stubs.is_empty() {
                continue;
            }

            let mut dists = Vec::with_capacity(stubs.len());
            for (i, stub) in stubs.iter().enumerate() {
                let d = if spec.is_bending() {
                    let Some(phi_b) = stub.phi_b else {
                        continue;
                    };
                    if own_bend == Some(spec.id) || !extrapolate {
                        phi_b
                    } else {
                        phi_b.saturating_sub(self.extrapolator.extrapolate(reference, &ExtrapolationTarget::stub(stub))?.phi_b)
                    }
                } else if extrapolate {
                    let predicted = self.extrapolator.extrapolate(reference, &ExtrapolationTarget::stub(stub))?;
                    wrap_phi(stub.phi - predicted.phi, n_phi_bins)
                } else {
                    wrap_phi(stub.phi - reference.phi, n_phi_bins)
                };
                dists.push((i, d));
            }
            if !dists.is_empty() {
                out.push(LayerHits { layer: spec.id, dists });
            }
        }
        Ok(out)
    }
}
