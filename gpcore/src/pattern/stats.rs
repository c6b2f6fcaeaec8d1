//! Training statistics.
//!
//! Kept apart from the immutable bank so that workers can fill private copies
//! and merge them at the end of a run.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::data::stub::MAX_ABS_PHI_B;
use crate::pattern::bank::PatternBank;
use crate::pattern::golden::MAX_ABS_MEAN_DIST;

/// Truth association of one event, supplied by the external matcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct TruthMuon {
    pub pt_class: u16,
    pub charge: i8,
}

/// Variable the mean distance is allowed to depend on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlopeVariable {
    None,
    RefPhiB,
    RefPhi,
}

/// Histogram binning of the statistics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatBinning {
    /// Raw distances in `[-dist_half_range, dist_half_range)` are histogrammed.
    pub dist_half_range: i32,
    pub dist_bin_width: i32,
    /// Reference phi-bend range covered by the slope bins.
    pub phi_b_half_range: i32,
    pub n_slope_bins: usize,
}

impl Default for StatBinning {
    fn default() -> Self {
        Self {
            dist_half_range: 512,
            dist_bin_width: 4,
            phi_b_half_range: 1024,
            n_slope_bins: 16,
        }
    }
}

impl StatBinning {
    pub fn validate(&self) -> Result<()> {
        if self.dist_bin_width <= 0 || self.dist_half_range <= 0 || self.dist_half_range % self.dist_bin_width != 0 {
            return Err(Error::Configuration(format!(
                "distance half range {} must be a positive multiple of the bin width {}",
                self.dist_half_range, self.dist_bin_width
            )));
        }
        if self.dist_half_range > MAX_ABS_MEAN_DIST {
            return Err(Error::Configuration(format!(
                "distance half range {} above {}",
                self.dist_half_range, MAX_ABS_MEAN_DIST
            )));
        }
        if self.n_slope_bins == 0 || self.phi_b_half_range <= 0 {
            return Err(Error::Configuration("slope binning must be non-empty".into()));
        }
        if self.phi_b_half_range > MAX_ABS_PHI_B {
            return Err(Error::Configuration(format!(
                "phi-bend half range {} above {}",
                self.phi_b_half_range, MAX_ABS_PHI_B
            )));
        }
        Ok(())
    }
}

/// Per-layer distances recorded for one event.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingSample {
    pub ref_phi: i32,
    pub ref_phi_b: i32,
    /// (layer, closest raw distance or `None` when the layer is silent)
    pub layers: Vec<(u8, Option<i32>)>,
}

/// Counters and (slope variable x distance) histogram of one layer.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerHist {
    pub layer: u8,
    pub hits: u64,
    pub misses: u64,
    /// Hits whose distance fell outside the histogram.
    pub overflows: u64,
    /// Row-major: `counts[slope_bin * n_dist_bins + dist_bin]`.
    pub counts: Vec<u32>,
}

impl LayerHist {
    fn new(layer: u8, n_cells: usize) -> Self {
        LayerHist {
            layer,
            hits: 0,
            misses: 0,
            overflows: 0,
            counts: vec![0; n_cells],
        }
    }

    pub fn total(&self) -> u64 {
        self.hits + self.misses + self.overflows
    }

    fn merge(&mut self, other: &LayerHist) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.overflows += other.overflows;
        for (a, b) in self.counts.iter_mut().zip(other.counts.iter()) {
            *a += *b;
        }
    }
}

#[derive(Clone, Debug)]
pub struct PatternStats {
    slope_var: SlopeVariable,
    dist_half_range: i32,
    dist_bin_width: i32,
    n_dist_bins: usize,
    slope_lo: i32,
    slope_width: i32,
    n_slope_bins: usize,
    layer_ids: Vec<Vec<u8>>,
    /// Allocated on first use.
    hists: Vec<Option<Vec<LayerHist>>>,
    events: Vec<u64>,
}

impl PatternStats {
    pub fn new(bank: &PatternBank, binning: &StatBinning, slope_var: SlopeVariable, n_phi_bins: i32) -> Self {
        let (slope_half, n_slope_bins) = match slope_var {
            SlopeVariable::None => (1, 1),
            SlopeVariable::RefPhiB => (binning.phi_b_half_range, binning.n_slope_bins),
            SlopeVariable::RefPhi => (n_phi_bins / 2, binning.n_slope_bins),
        };
        let slope_width = ((2 * slope_half) as f64 / n_slope_bins as f64).ceil().max(1.0) as i32;
        PatternStats {
            slope_var,
            dist_half_range: binning.dist_half_range,
            dist_bin_width: binning.dist_bin_width,
            n_dist_bins: (2 * binning.dist_half_range / binning.dist_bin_width) as usize,
            slope_lo: -slope_half,
            slope_width,
            n_slope_bins,
            layer_ids: bank
                .patterns()
                .iter()
                .map(|p| p.layers.iter().map(|l| l.layer).collect())
                .collect(),
            hists: vec![None; bank.len()],
            events: vec![0; bank.len()],
        }
    }

    pub fn slope_variable(&self) -> SlopeVariable {
        self.slope_var
    }

    pub fn n_dist_bins(&self) -> usize {
        self.n_dist_bins
    }

    pub fn n_slope_bins(&self) -> usize {
        self.n_slope_bins
    }

    pub fn dist_bin_width(&self) -> i32 {
        self.dist_bin_width
    }

    pub fn dist_bin_center(&self, bin: usize) -> f64 {
        -self.dist_half_range as f64 + (bin as f64 + 0.5) * self.dist_bin_width as f64
    }

    pub fn slope_bin_center(&self, bin: usize) -> f64 {
        match self.slope_var {
            SlopeVariable::None => 0.0,
            _ => self.slope_lo as f64 + (bin as f64 + 0.5) * self.slope_width as f64,
        }
    }

    fn slope_bin(&self, x: i32) -> usize {
        let b = (x as i64 - self.slope_lo as i64).div_euclid(self.slope_width as i64);
        b.clamp(0, self.n_slope_bins as i64 - 1) as usize
    }

    /// Number of events accumulated for a pattern.
    pub fn events(&self, pattern: usize) -> u64 {
        self.events.get(pattern).copied().unwrap_or(0)
    }

    pub fn total_events(&self) -> u64 {
        self.events.iter().sum()
    }

    pub fn layer_hist(&self, pattern: usize, layer: u8) -> Option<&LayerHist> {
        self.hists.get(pattern)?.as_ref()?.iter().find(|h| h.layer == layer)
    }

    /// Record one event for `pattern`.
    pub fn accumulate(&mut self, pattern: usize, sample: &TrainingSample) {
        if pattern >= self.hists.len() {
            return;
        }
        let x = match self.slope_var {
            SlopeVariable::None => 0,
            SlopeVariable::RefPhiB => sample.ref_phi_b,
            SlopeVariable::RefPhi => sample.ref_phi,
        };
        let sbin = self.slope_bin(x);
        let (half, width, n_dist) = (self.dist_half_range, self.dist_bin_width, self.n_dist_bins);
        let n_cells = self.n_slope_bins * n_dist;

        self.events[pattern] += 1;
        let layer_ids = &self.layer_ids[pattern];
        let hists = self.hists[pattern]
            .get_or_insert_with(|| layer_ids.iter().map(|&l| LayerHist::new(l, n_cells)).collect());

        for &(layer, dist) in &sample.layers {
            let Some(h) = hists.iter_mut().find(|h| h.layer == layer) else {
                continue;
            };
            match dist {
                None => h.misses += 1,
                Some(d) if d < -half || d >= half => h.overflows += 1,
                Some(d) => {
                    let dbin = ((d + half) / width) as usize;
                    h.counts[sbin * n_dist + dbin] += 1;
                    h.hits += 1;
                }
            }
        }
    }

    /// Fold another worker's statistics into this one.
    pub fn merge(&mut self, other: PatternStats) {
        debug_assert_eq!(self.hists.len(), other.hists.len());
        for (mine, theirs) in self.events.iter_mut().zip(other.events.iter()) {
            *mine += *theirs;
        }
        for (mine, theirs) in self.hists.iter_mut().zip(other.hists.into_iter()) {
            let Some(t) = theirs else {
                continue;
            };
            match mine {
                Some(m) => {
                    for (a, b) in m.iter_mut().zip(t.iter()) {
                        a.merge(b);
                    }
                }
                None => *mine = Some(t),
            }
        }
    }
}
