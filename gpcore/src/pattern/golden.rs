use std::fmt;
use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Largest supported distance bit shift.
pub const MAX_DIST_SHIFT: u8 = 12;

/// Largest |mean distance| a layer table may carry.
pub const MAX_ABS_MEAN_DIST: i32 = 1 << 16;

/// Largest |slope| of the mean distance against the reference phi or phi-bend.
pub const MAX_ABS_SLOPE: f64 = 64.0;

/// Identifies a golden pattern: the trajectory hypothesis it encodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode)]
pub struct PatternKey {
    pub ref_layer: u8,
    /// -1 or +1.
    pub charge: i8,
    pub pt_class: u16,
}

impl PatternKey {
    pub fn new(ref_layer: u8, charge: i8, pt_class: u16) -> Self {
        PatternKey { ref_layer, charge, pt_class }
    }
}

impl Display for PatternKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ref={} q={} ipt={}",
            self.ref_layer,
            if self.charge < 0 { "-" } else { "+" },
            self.pt_class
        )
    }
}

/// Learned distribution of one layer's distance to the reference prediction.
///
/// The expected distance is `mean_dist_phi + slope_phi_b * phi_b_ref +
/// slope_phi_ref * phi_ref`; the residual is shifted right by `dist_shift` and
/// centred on the table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct LayerPdf {
    pub layer: u8,
    pub mean_dist_phi: i32,
    #[serde(default)]
    pub slope_phi_b: f64,
    #[serde(default)]
    pub slope_phi_ref: f64,
    #[serde(default)]
    pub dist_shift: u8,
    /// Log-scaled probability of seeing no stub in this layer.
    #[serde(default)]
    pub no_hit_val: u16,
    /// Log-scaled probabilities, zero means "not compatible".
    pub pdf: Vec<u16>,
}

impl LayerPdf {
    pub fn empty(layer: u8, n_pdf_bins: usize) -> Self {
        LayerPdf {
            layer,
            mean_dist_phi: 0,
            slope_phi_b: 0.0,
            slope_phi_ref: 0.0,
            dist_shift: 0,
            no_hit_val: 0,
            pdf: vec![0; n_pdf_bins],
        }
    }

    /// Expected raw distance for a reference stub.
    #[inline]
    pub fn expected_dist(&self, ref_phi: i32, ref_phi_b: i32) -> i32 {
        let shift = self.slope_phi_b * ref_phi_b as f64 + self.slope_phi_ref * ref_phi as f64;
        (self.mean_dist_phi as f64 + shift.round()) as i32
    }

    /// Table bin of a residual, `None` when it falls off the table.
    #[inline]
    pub fn bin(&self, residual: i32) -> Option<usize> {
        let n = self.pdf.len() as i64;
        let b = (residual >> self.dist_shift) as i64 + n / 2;
        if b >= 0 && b < n {
            Some(b as usize)
        } else {
            None
        }
    }

    /// Table value of a residual, zero off the table.
    #[inline]
    pub fn value(&self, residual: i32) -> u16 {
        self.bin(residual).map(|b| self.pdf[b]).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.pdf.iter().all(|&v| v == 0)
    }
}

/// One golden pattern.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct GoldenPattern {
    /// Position in the bank.
    pub index: u32,
    pub key: PatternKey,
    /// One entry per non-reference layer, ascending layer id.
    pub layers: Vec<LayerPdf>,
}

impl GoldenPattern {
    pub fn layer(&self, layer: u8) -> Option<&LayerPdf> {
        self.layers.iter().find(|l| l.layer == layer)
    }
}

/// Map a probability to the integer log scale used by the tables.
///
/// `p_min` maps to 1, `p = 1` to `max_val`, anything below `p_min` to 0.
///
/// # Example
///
/// ```rust
/// # use gpcore::pattern::golden::log_scaled;
/// assert_eq!(log_scaled(1.0, 1e-3, 255), 255);
/// assert_eq!(log_scaled(1e-4, 1e-3, 255), 0);
/// assert_eq!(log_scaled(1e-3, 1e-3, 255), 1);
/// ```
pub fn log_scaled(p: f64, p_min: f64, max_val: u16) -> u16 {
    if !(p > 0.0) || p < p_min {
        return 0;
    }
    let span = -p_min.ln();
    let v = (max_val as f64 * (p.min(1.0).ln() - p_min.ln()) / span).round();
    (v as u16).clamp(1, max_val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_centering_and_shift() {
        let mut lp = LayerPdf::empty(3, 8);
        assert_eq!(lp.bin(0), Some(4));
        assert_eq!(lp.bin(-4), Some(0));
        assert_eq!(lp.bin(-5), None);
        assert_eq!(lp.bin(4), None);
        lp.dist_shift = 2;
        assert_eq!(lp.bin(-16), Some(0));
        assert_eq!(lp.bin(15), Some(7));
        assert_eq!(lp.bin(16), None);
    }

    #[test]
    fn test_expected_dist_with_slopes() {
        let mut lp = LayerPdf::empty(3, 8);
        lp.mean_dist_phi = 10;
        lp.slope_phi_b = 0.5;
        assert_eq!(lp.expected_dist(0, 8), 14);
        lp.slope_phi_ref = -0.1;
        assert_eq!(lp.expected_dist(100, 8), 4);
    }

    #[test]
    fn test_log_scaled_monotonic() {
        let mut last = 0;
        for p in [1e-3, 1e-2, 0.05, 0.2, 0.6, 1.0] {
            let v = log_scaled(p, 1e-3, 255);
            assert!(v > last);
            last = v;
        }
    }
}
