//! The golden-pattern bank.
//!
//! A bank is immutable once built; construction validates the whole file so a
//! structurally broken bank is never used, not even partially.

use std::collections::{BTreeMap, HashMap};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::data::layers::LayerMap;
use crate::error::{Error, Result};
use crate::pattern::golden::{GoldenPattern, LayerPdf, PatternKey, MAX_ABS_MEAN_DIST, MAX_ABS_SLOPE, MAX_DIST_SHIFT};
use crate::pattern::score::{FinalizeMode, LayerContribution, PatternScore};

/// Current pattern file layout version.
pub const PATTERN_FILE_VERSION: u32 = 1;

/// Serialized form of a bank.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct PatternFile {
    pub version: u32,
    pub n_pdf_bins: u16,
    pub pdf_max_val: u16,
    /// Number of logic layers the patterns were built for.
    pub n_layers: u8,
    pub patterns: Vec<GoldenPattern>,
}

/// The reference stub as seen by the patterns.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefContext {
    pub layer: u8,
    pub phi: i32,
    pub phi_b: i32,
}

/// Candidate stubs of one layer, as raw distances to the prediction.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerHits {
    pub layer: u8,
    /// (stub index within the layer, raw distance)
    pub dists: Vec<(usize, i32)>,
}

#[derive(Clone, Debug)]
pub struct PatternBank {
    n_pdf_bins: u16,
    pdf_max_val: u16,
    n_layers: u8,
    patterns: Vec<GoldenPattern>,
    by_key: HashMap<PatternKey, usize>,
    by_ref_layer: BTreeMap<u8, Vec<usize>>,
}

impl PatternBank {
    /// Empty patterns for every (reference layer, charge, pT class).
    ///
    /// Each pattern gets a zero table for every layer except its reference
    /// layer; used as the starting point of pattern generation.
    pub fn template(
        layers: &LayerMap,
        ref_layers: &[u8],
        pt_classes: &[u16],
        n_pdf_bins: u16,
        pdf_max_val: u16,
    ) -> Result<Self> {
        let mut patterns = Vec::with_capacity(ref_layers.len() * pt_classes.len() * 2);
        for &ref_layer in ref_layers {
            if !layers.contains(ref_layer) {
                return Err(Error::Configuration(format!(
                    "reference layer {} is not in the layer map",
                    ref_layer
                )));
            }
            for charge in [-1i8, 1] {
                for &pt_class in pt_classes {
                    let pdfs = layers
                        .iter()
                        .filter(|l| l.id != ref_layer)
                        .map(|l| LayerPdf::empty(l.id, n_pdf_bins as usize))
                        .collect();
                    patterns.push(GoldenPattern {
                        index: patterns.len() as u32,
                        key: PatternKey::new(ref_layer, charge, pt_class),
                        layers: pdfs,
                    });
                }
            }
        }
        PatternBank::try_from(PatternFile {
            version: PATTERN_FILE_VERSION,
            n_pdf_bins,
            pdf_max_val,
            n_layers: layers.len() as u8,
            patterns,
        })
    }

    pub fn to_file(&self) -> PatternFile {
        PatternFile {
            version: PATTERN_FILE_VERSION,
            n_pdf_bins: self.n_pdf_bins,
            pdf_max_val: self.pdf_max_val,
            n_layers: self.n_layers,
            patterns: self.patterns.clone(),
        }
    }

    /// Check that the bank was built for `layers`.
    pub fn check_layers(&self, layers: &LayerMap) -> Result<()> {
        if self.n_layers as usize != layers.len() {
            return Err(Error::MalformedPatternFile(format!(
                "patterns were built for {} layers, the layer map has {}",
                self.n_layers,
                layers.len()
            )));
        }
        for p in &self.patterns {
            if layers.get(p.key.ref_layer).map(|l| l.is_bending()).unwrap_or(true) {
                return Err(Error::MalformedPatternFile(format!(
                    "pattern {} uses layer {} as reference",
                    p.index, p.key.ref_layer
                )));
            }
        }
        Ok(())
    }

    pub fn n_pdf_bins(&self) -> u16 {
        self.n_pdf_bins
    }

    pub fn pdf_max_val(&self) -> u16 {
        self.pdf_max_val
    }

    pub fn n_layers(&self) -> u8 {
        self.n_layers
    }

    pub fn patterns(&self) -> &[GoldenPattern] {
        &self.patterns
    }

    pub fn get(&self, index: usize) -> Option<&GoldenPattern> {
        self.patterns.get(index)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn find(&self, key: &PatternKey) -> Option<usize> {
        self.by_key.get(key).copied()
    }

    /// Indices of the patterns built for one reference layer.
    pub fn for_ref_layer(&self, ref_layer: u8) -> &[usize] {
        self.by_ref_layer.get(&ref_layer).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Score every pattern of the reference layer against the projected hits.
    ///
    /// In each layer the stub with the highest table value is used (ties: the
    /// smaller residual, then the lower stub index). The result is ordered by
    /// score, best first, then by pattern index.
    pub fn match_reference(
        &self,
        reference: &RefContext,
        hits: &[LayerHits],
        mode: FinalizeMode,
    ) -> Vec<PatternScore> {
        let mut slots: Vec<Option<&LayerHits>> = vec![None; self.n_layers as usize];
        for h in hits {
            if let Some(slot) = slots.get_mut(h.layer as usize) {
                *slot = Some(h);
            }
        }

        let mut out: Vec<PatternScore> = self
            .for_ref_layer(reference.layer)
            .iter()
            .map(|&idx| {
                let pattern = &self.patterns[idx];
                let contributions = pattern
                    .layers
                    .iter()
                    .map(|lp| score_layer(lp, reference, slots[lp.layer as usize]))
                    .collect();
                PatternScore::new(idx, contributions, mode)
            })
            .collect();

        out.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.pattern.cmp(&b.pattern)));
        out
    }
}

fn score_layer(lp: &LayerPdf, reference: &RefContext, hits: Option<&LayerHits>) -> LayerContribution {
    let expected = lp.expected_dist(reference.phi, reference.phi_b);
    let best = hits.and_then(|h| {
        h.dists
            .iter()
            .map(|&(stub, raw)| {
                let residual = raw.saturating_sub(expected);
                (lp.value(residual), residual.unsigned_abs(), stub)
            })
            .filter(|(v, _, _)| *v > 0)
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(b.2.cmp(&a.2)))
    });
    match best {
        Some((pdf_val, _, stub)) => LayerContribution {
            layer: lp.layer,
            fired: true,
            pdf_val,
            no_hit_val: lp.no_hit_val,
            stub: Some(stub),
        },
        None => LayerContribution {
            layer: lp.layer,
            fired: false,
            pdf_val: 0,
            no_hit_val: lp.no_hit_val,
            stub: None,
        },
    }
}

impl TryFrom<PatternFile> for PatternBank {
    type Error = Error;

    fn try_from(file: PatternFile) -> Result<Self> {
        let bad = |msg: String| Err(Error::MalformedPatternFile(msg));

        if file.version != PATTERN_FILE_VERSION {
            return bad(format!("unsupported version {}", file.version));
        }
        if file.n_pdf_bins == 0 || file.n_pdf_bins % 2 != 0 {
            return bad(format!("table size must be positive and even, got {}", file.n_pdf_bins));
        }
        if file.pdf_max_val == 0 {
            return bad("maximal table value is zero".into());
        }
        if file.n_layers == 0 || file.n_layers > 64 {
            return bad(format!("layer count {} out of range", file.n_layers));
        }

        let mut by_key = HashMap::with_capacity(file.patterns.len());
        let mut by_ref_layer: BTreeMap<u8, Vec<usize>> = BTreeMap::new();

        for (i, p) in file.patterns.iter().enumerate() {
            if p.index as usize != i {
                return bad(format!("pattern at position {} carries index {}", i, p.index));
            }
            if p.key.ref_layer >= file.n_layers {
                return bad(format!("pattern {}: unknown reference layer {}", i, p.key.ref_layer));
            }
            if p.key.charge != -1 && p.key.charge != 1 {
                return bad(format!("pattern {}: charge {} is not +-1", i, p.key.charge));
            }
            if by_key.insert(p.key, i).is_some() {
                return bad(format!("pattern {}: duplicate key {}", i, p.key));
            }
            let mut last_layer: Option<u8> = None;
            for lp in &p.layers {
                if lp.layer >= file.n_layers {
                    return bad(format!("pattern {}: unknown layer {}", i, lp.layer));
                }
                if lp.layer == p.key.ref_layer {
                    return bad(format!("pattern {}: table for its own reference layer", i));
                }
                if last_layer.map(|l| l >= lp.layer).unwrap_or(false) {
                    return bad(format!("pattern {}: layers not strictly ascending at {}", i, lp.layer));
                }
                last_layer = Some(lp.layer);
                if lp.pdf.len() != file.n_pdf_bins as usize {
                    return bad(format!(
                        "pattern {} layer {}: table has {} bins, expected {}",
                        i,
                        lp.layer,
                        lp.pdf.len(),
                        file.n_pdf_bins
                    ));
                }
                if lp.dist_shift > MAX_DIST_SHIFT {
                    return bad(format!("pattern {} layer {}: distance shift {}", i, lp.layer, lp.dist_shift));
                }
                if !(lp.slope_phi_b.abs() <= MAX_ABS_SLOPE && lp.slope_phi_ref.abs() <= MAX_ABS_SLOPE) {
                    return bad(format!(
                        "pattern {} layer {}: slope ({}, {}) outside +-{}",
                        i, lp.layer, lp.slope_phi_b, lp.slope_phi_ref, MAX_ABS_SLOPE
                    ));
                }
                if lp.mean_dist_phi.unsigned_abs() > MAX_ABS_MEAN_DIST as u32 {
                    return bad(format!(
                        "pattern {} layer {}: mean distance {} outside +-{}",
                        i, lp.layer, lp.mean_dist_phi, MAX_ABS_MEAN_DIST
                    ));
                }
                if lp.no_hit_val > file.pdf_max_val || lp.pdf.iter().any(|&v| v > file.pdf_max_val) {
                    return bad(format!(
                        "pattern {} layer {}: value above {}",
                        i, lp.layer, file.pdf_max_val
                    ));
                }
            }
            by_ref_layer.entry(p.key.ref_layer).or_default().push(i);
        }

        Ok(PatternBank {
            n_pdf_bins: file.n_pdf_bins,
            pdf_max_val: file.pdf_max_val,
            n_layers: file.n_layers,
            patterns: file.patterns,
            by_key,
            by_ref_layer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian_pdf(layer: u8, n: usize) -> LayerPdf {
        let mut lp = LayerPdf::empty(layer, n);
        let c = n / 2;
        lp.pdf[c] = 100;
        lp.pdf[c - 1] = 60;
        lp.pdf[c + 1] = 60;
        lp.pdf[c - 2] = 10;
        lp.pdf[c + 2] = 10;
        lp.no_hit_val = 5;
        lp
    }

    fn file() -> PatternFile {
        PatternFile {
            version: PATTERN_FILE_VERSION,
            n_pdf_bins: 16,
            pdf_max_val: 127,
            n_layers: 4,
            patterns: vec![
                GoldenPattern {
                    index: 0,
                    key: PatternKey::new(0, 1, 5),
                    layers: vec![gaussian_pdf(1, 16), gaussian_pdf(2, 16)],
                },
                GoldenPattern {
                    index: 1,
                    key: PatternKey::new(0, -1, 5),
                    layers: vec![gaussian_pdf(1, 16), gaussian_pdf(3, 16)],
                },
            ],
        }
    }

    #[test]
    fn test_valid_file() {
        let bank = PatternBank::try_from(file()).unwrap();
        assert_eq!(bank.len(), 2);
        assert_eq!(bank.find(&PatternKey::new(0, -1, 5)), Some(1));
        assert_eq!(bank.for_ref_layer(0), &[0, 1]);
        assert!(bank.for_ref_layer(2).is_empty());
    }

    #[test]
    fn test_rejects_unknown_layer() {
        let mut f = file();
        f.patterns[1].layers[1].layer = 9;
        assert!(matches!(PatternBank::try_from(f), Err(Error::MalformedPatternFile(_))));
    }

    #[test]
    fn test_rejects_inconsistent_grid() {
        let mut f = file();
        f.patterns[0].layers[0].pdf.pop();
        assert!(matches!(PatternBank::try_from(f), Err(Error::MalformedPatternFile(_))));
    }

    #[test]
    fn test_rejects_duplicate_key() {
        let mut f = file();
        f.patterns[1].key = f.patterns[0].key;
        assert!(PatternBank::try_from(f).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_line() {
        let mut f = file();
        f.patterns[0].layers[0].mean_dist_phi = i32::MAX;
        assert!(matches!(PatternBank::try_from(f), Err(Error::MalformedPatternFile(_))));

        let mut f = file();
        f.patterns[1].layers[0].slope_phi_b = 1e12;
        assert!(matches!(PatternBank::try_from(f), Err(Error::MalformedPatternFile(_))));

        let mut f = file();
        f.patterns[1].layers[0].slope_phi_ref = f64::NAN;
        assert!(PatternBank::try_from(f).is_err());

        let mut f = file();
        f.patterns[0].layers[0].mean_dist_phi = -MAX_ABS_MEAN_DIST;
        f.patterns[0].layers[0].slope_phi_b = -MAX_ABS_SLOPE;
        assert!(PatternBank::try_from(f).is_ok());
    }

    #[test]
    fn test_extreme_distances_miss() {
        let mut f = file();
        f.patterns[0].layers[0].mean_dist_phi = MAX_ABS_MEAN_DIST;
        let bank = PatternBank::try_from(f).unwrap();
        let reference = RefContext { layer: 0, phi: 0, phi_b: 0 };
        let hits = vec![LayerHits { layer: 1, dists: vec![(0, i32::MIN), (1, i32::MAX)] }];
        let scores = bank.match_reference(&reference, &hits, FinalizeMode::LayerCount);
        assert!(scores.iter().all(|s| s.fired_count == 0));
    }

    #[test]
    fn test_match_picks_best_stub_per_layer() {
        let bank = PatternBank::try_from(file()).unwrap();
        let reference = RefContext { layer: 0, phi: 0, phi_b: 0 };
        let hits = vec![
            LayerHits { layer: 1, dists: vec![(0, 2), (1, 0)] },
            LayerHits { layer: 2, dists: vec![(0, -1)] },
        ];
        let scores = bank.match_reference(&reference, &hits, FinalizeMode::WeightedLikelihood);
        assert_eq!(scores.len(), 2);
        // pattern 0: layer1 best stub 1 (100) + layer2 (60)
        assert_eq!(scores[0].pattern, 0);
        assert_eq!(scores[0].score, 160.0);
        assert_eq!(scores[0].contributions[0].stub, Some(1));
        // pattern 1: only layer1
        assert_eq!(scores[1].score, 100.0);
        assert_eq!(scores[1].fired_count, 1);
    }

    #[test]
    fn test_template_shape() {
        let layers = LayerMap::omtf_default();
        let bank = PatternBank::template(&layers, &[0, 2], &[3, 7, 12], 64, 255).unwrap();
        assert_eq!(bank.len(), 2 * 2 * 3);
        assert!(bank.patterns().iter().all(|p| p.layers.len() == layers.len() - 1));
        assert!(bank.check_layers(&layers).is_ok());
        assert!(bank.patterns()[0].layers.iter().all(|l| l.is_empty()));
    }
}
