//! Turn accumulated statistics into golden patterns.
//!
//! The generator is chosen by name at startup (`2DHists`, `deltaPhiVsPhiRef`,
//! `patternGen`) and differs only in what the mean distance may depend on.

use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use log::debug;
use nalgebra::{Matrix2, Vector2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, Normal};

use crate::error::{Error, Result};
use crate::pattern::bank::{PatternBank, PatternFile, PATTERN_FILE_VERSION};
use crate::pattern::golden::{log_scaled, GoldenPattern, LayerPdf, MAX_ABS_MEAN_DIST, MAX_ABS_SLOPE, MAX_DIST_SHIFT};
use crate::pattern::stats::{LayerHist, PatternStats, SlopeVariable, StatBinning};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PatternGeneratorKind {
    /// Mean distance linear in the reference phi-bend.
    #[default]
    #[serde(rename = "2DHists")]
    TwoDHists,
    /// Mean distance linear in the reference phi.
    #[serde(rename = "deltaPhiVsPhiRef")]
    DeltaPhiVsPhiRef,
    /// Constant mean distance.
    #[serde(rename = "patternGen")]
    PatternGen,
}

impl PatternGeneratorKind {
    pub fn slope_variable(&self) -> SlopeVariable {
        match self {
            PatternGeneratorKind::TwoDHists => SlopeVariable::RefPhiB,
            PatternGeneratorKind::DeltaPhiVsPhiRef => SlopeVariable::RefPhi,
            PatternGeneratorKind::PatternGen => SlopeVariable::None,
        }
    }

    /// Build a new bank from `bank` and the statistics collected for it.
    ///
    /// Layers with fewer than `opts.min_events` hits keep their input table.
    pub fn generate(&self, bank: &PatternBank, stats: &PatternStats, opts: &GeneratorOpts) -> Result<PatternBank> {
        let n_pdf_bins = bank.n_pdf_bins() as usize;
        let pdf_max_val = bank.pdf_max_val();

        let patterns: Vec<GoldenPattern> = bank
            .patterns()
            .par_iter()
            .enumerate()
            .map(|(i, p)| {
                let layers = p
                    .layers
                    .iter()
                    .map(|lp| match stats.layer_hist(i, lp.layer) {
                        Some(h) if h.hits >= opts.min_events && h.hits > 0 => {
                            self.build_layer(lp, h, stats, n_pdf_bins, pdf_max_val, opts)
                        }
                        _ => lp.clone(),
                    })
                    .collect();
                GoldenPattern { index: p.index, key: p.key, layers }
            })
            .collect();

        debug!(
            "{} generated {} patterns from {} events",
            self,
            patterns.len(),
            stats.total_events()
        );

        PatternBank::try_from(PatternFile {
            version: PATTERN_FILE_VERSION,
            n_pdf_bins: bank.n_pdf_bins(),
            pdf_max_val,
            n_layers: bank.n_layers(),
            patterns,
        })
    }

    fn build_layer(
        &self,
        old: &LayerPdf,
        hist: &LayerHist,
        stats: &PatternStats,
        n_pdf_bins: usize,
        pdf_max_val: u16,
        opts: &GeneratorOpts,
    ) -> LayerPdf {
        let n_dist = stats.n_dist_bins();
        // (slope variable, distance, weight)
        let points: Vec<(f64, f64, f64)> = hist
            .counts
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .map(|(cell, &c)| {
                (
                    stats.slope_bin_center(cell / n_dist),
                    stats.dist_bin_center(cell % n_dist),
                    c as f64,
                )
            })
            .collect();

        let (intercept, slope) = match self.slope_variable() {
            SlopeVariable::None => (weighted_mean(&points), 0.0),
            _ => fit_line(&points),
        };
        let slope = slope.clamp(-MAX_ABS_SLOPE, MAX_ABS_SLOPE);
        let mean = intercept.round().clamp(-MAX_ABS_MEAN_DIST as f64, MAX_ABS_MEAN_DIST as f64) as i32;
        let residual = |x: f64, y: f64| y - (mean as f64 + (slope * x).round());

        let sw: f64 = points.iter().map(|p| p.2).sum();
        let var = points.iter().map(|&(x, y, w)| w * residual(x, y).powi(2)).sum::<f64>() / sw;
        let sd = var.sqrt().max(stats.dist_bin_width() as f64);

        let half_bins = n_pdf_bins / 2;
        let dist_shift = (0..=MAX_DIST_SHIFT)
            .find(|&s| (half_bins << s) as f64 >= opts.coverage_sigmas * sd)
            .unwrap_or(MAX_DIST_SHIFT);

        let mut counts = vec![0.0f64; n_pdf_bins];
        for &(x, y, w) in &points {
            let r = residual(x, y).round() as i32;
            let b = (r >> dist_shift) + half_bins as i32;
            if b >= 0 && (b as usize) < n_pdf_bins {
                counts[b as usize] += w;
            }
        }

        // histogram bins wider than table bins would leave holes
        let min_sigma = stats.dist_bin_width() as f64 / (1u32 << dist_shift) as f64 / 2.0;
        let sigma = if opts.smoothing_sigma_bins > 0.0 {
            opts.smoothing_sigma_bins.max(min_sigma)
        } else {
            0.0
        };
        let counts = smooth(&counts, sigma);

        let total = hist.total() as f64;
        let pdf = counts
            .iter()
            .map(|&c| log_scaled(c / total, opts.p_min, pdf_max_val))
            .collect();
        let no_hit_val = log_scaled((hist.misses + hist.overflows) as f64 / total, opts.p_min, pdf_max_val);

        let slope_var = self.slope_variable();
        LayerPdf {
            layer: old.layer,
            mean_dist_phi: mean,
            slope_phi_b: if slope_var == SlopeVariable::RefPhiB { slope } else { 0.0 },
            slope_phi_ref: if slope_var == SlopeVariable::RefPhi { slope } else { 0.0 },
            dist_shift,
            no_hit_val,
            pdf,
        }
    }
}

impl FromStr for PatternGeneratorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "2DHists" => Ok(PatternGeneratorKind::TwoDHists),
            "deltaPhiVsPhiRef" => Ok(PatternGeneratorKind::DeltaPhiVsPhiRef),
            "patternGen" => Ok(PatternGeneratorKind::PatternGen),
            other => Err(Error::Configuration(format!("unknown pattern generator `{}`", other))),
        }
    }
}

impl Display for PatternGeneratorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PatternGeneratorKind::TwoDHists => write!(f, "2DHists"),
            PatternGeneratorKind::DeltaPhiVsPhiRef => write!(f, "deltaPhiVsPhiRef"),
            PatternGeneratorKind::PatternGen => write!(f, "patternGen"),
        }
    }
}

/// Pattern generation knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratorOpts {
    /// Layers with fewer hits keep their input table.
    pub min_events: u64,
    /// Probabilities below this map to zero.
    pub p_min: f64,
    /// Gaussian smoothing width in table bins (0 disables).
    pub smoothing_sigma_bins: f64,
    /// The table must span this many residual standard deviations on each side.
    pub coverage_sigmas: f64,
    pub binning: StatBinning,
}

impl Default for GeneratorOpts {
    fn default() -> Self {
        Self {
            min_events: 20,
            p_min: 1e-3,
            smoothing_sigma_bins: 1.0,
            coverage_sigmas: 3.0,
            binning: StatBinning::default(),
        }
    }
}

impl GeneratorOpts {
    pub fn validate(&self) -> Result<()> {
        if !(self.p_min > 0.0 && self.p_min < 1.0) {
            return Err(Error::Configuration(format!("p_min {} must lie in (0, 1)", self.p_min)));
        }
        if !(self.smoothing_sigma_bins.is_finite() && self.smoothing_sigma_bins >= 0.0) {
            return Err(Error::Configuration("smoothing width must be non-negative".into()));
        }
        if !(self.coverage_sigmas.is_finite() && self.coverage_sigmas > 0.0) {
            return Err(Error::Configuration("coverage must be positive".into()));
        }
        self.binning.validate()
    }
}

fn weighted_mean(points: &[(f64, f64, f64)]) -> f64 {
    let sw: f64 = points.iter().map(|p| p.2).sum();
    if sw <= 0.0 {
        return 0.0;
    }
    points.iter().map(|&(_, y, w)| w * y).sum::<f64>() / sw
}

/// Weighted least squares `y = a + b x`; falls back to the mean when x does
/// not vary.
fn fit_line(points: &[(f64, f64, f64)]) -> (f64, f64) {
    let (mut sw, mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for &(x, y, w) in points {
        sw += w;
        sx += w * x;
        sy += w * y;
        sxx += w * x * x;
        sxy += w * x * y;
    }
    if sw <= 0.0 {
        return (0.0, 0.0);
    }
    let var_x = sxx / sw - (sx / sw).powi(2);
    if var_x <= 1e-9 {
        return (sy / sw, 0.0);
    }
    let a = Matrix2::new(sw, sx, sx, sxx);
    let b = Vector2::new(sy, sxy);
    match a.lu().solve(&b) {
        Some(sol) => (sol[0], sol[1]),
        None => (sy / sw, 0.0),
    }
}

fn smooth(counts: &[f64], sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 {
        return counts.to_vec();
    }
    let Ok(kernel_dist) = Normal::new(0.0, sigma) else {
        return counts.to_vec();
    };
    let half = (3.0 * sigma).ceil() as i64;
    let kernel: Vec<f64> = (-half..=half).map(|k| kernel_dist.pdf(k as f64)).collect();
    let norm: f64 = kernel.iter().sum();
    let n = counts.len() as i64;
    (0..n)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(j, kv)| {
                    let src = i + j as i64 - half;
                    if src >= 0 && src < n {
                        counts[src as usize] * kv
                    } else {
                        0.0
                    }
                })
                .sum::<f64>()
                / norm
        })
        .collect()
}
