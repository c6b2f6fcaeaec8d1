use std::fmt;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the per-layer contributions of one pattern become a score.
///
/// Selected at startup by its numeric code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FinalizeMode {
    /// Sum of the log-scaled table values of fired layers (code 0).
    WeightedLikelihood,
    /// As above, plus the no-hit value of every silent layer (code 1).
    LikelihoodWithNoHit,
    /// Number of fired non-reference layers (code 3).
    #[default]
    LayerCount,
}

impl FinalizeMode {
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(FinalizeMode::WeightedLikelihood),
            1 => Ok(FinalizeMode::LikelihoodWithNoHit),
            3 => Ok(FinalizeMode::LayerCount),
            other => Err(Error::Configuration(format!(
                "unsupported pattern result finalize function {}",
                other
            ))),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            FinalizeMode::WeightedLikelihood => 0,
            FinalizeMode::LikelihoodWithNoHit => 1,
            FinalizeMode::LayerCount => 3,
        }
    }

    pub fn finalize(&self, contributions: &[LayerContribution]) -> f64 {
        match self {
            FinalizeMode::WeightedLikelihood => contributions
                .iter()
                .filter(|c| c.fired)
                .map(|c| c.pdf_val as f64)
                .sum(),
            FinalizeMode::LikelihoodWithNoHit => contributions
                .iter()
                .map(|c| if c.fired { c.pdf_val as f64 } else { c.no_hit_val as f64 })
                .sum(),
            FinalizeMode::LayerCount => contributions.iter().filter(|c| c.fired).count() as f64,
        }
    }
}

impl Display for FinalizeMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FinalizeMode::WeightedLikelihood => write!(f, "WeightedLikelihood"),
            FinalizeMode::LikelihoodWithNoHit => write!(f, "LikelihoodWithNoHit"),
            FinalizeMode::LayerCount => write!(f, "LayerCount"),
        }
    }
}

/// What one layer added to one pattern's score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LayerContribution {
    pub layer: u8,
    pub fired: bool,
    pub pdf_val: u16,
    pub no_hit_val: u16,
    /// Index of the chosen stub within its layer.
    pub stub: Option<usize>,
}

/// Score of one pattern against one reference stub.
#[derive(Clone, Debug, PartialEq)]
pub struct PatternScore {
    /// Index in the bank.
    pub pattern: usize,
    pub score: f64,
    pub fired_layers: u64,
    pub fired_count: u8,
    pub contributions: Vec<LayerContribution>,
}

impl PatternScore {
    pub fn new(pattern: usize, contributions: Vec<LayerContribution>, mode: FinalizeMode) -> Self {
        let fired_layers = contributions
            .iter()
            .filter(|c| c.fired)
            .fold(0u64, |m, c| m | (1u64 << c.layer));
        let fired_count = fired_layers.count_ones() as u8;
        let score = mode.finalize(&contributions);
        PatternScore {
            pattern,
            score,
            fired_layers,
            fired_count,
            contributions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(layer: u8, fired: bool, pdf_val: u16, no_hit_val: u16) -> LayerContribution {
        LayerContribution {
            layer,
            fired,
            pdf_val,
            no_hit_val,
            stub: if fired { Some(0) } else { None },
        }
    }

    #[test]
    fn test_finalize_modes() {
        let c = vec![
            contribution(2, true, 40, 3),
            contribution(4, false, 0, 7),
            contribution(6, true, 25, 1),
        ];
        assert_eq!(FinalizeMode::LayerCount.finalize(&c), 2.0);
        assert_eq!(FinalizeMode::WeightedLikelihood.finalize(&c), 65.0);
        assert_eq!(FinalizeMode::LikelihoodWithNoHit.finalize(&c), 72.0);
    }

    #[test]
    fn test_codes() {
        for mode in [
            FinalizeMode::WeightedLikelihood,
            FinalizeMode::LikelihoodWithNoHit,
            FinalizeMode::LayerCount,
        ] {
            assert_eq!(FinalizeMode::from_code(mode.code()).unwrap(), mode);
        }
        assert!(FinalizeMode::from_code(2).is_err());
    }

    #[test]
    fn test_fired_mask() {
        let s = PatternScore::new(
            0,
            vec![contribution(3, true, 1, 0), contribution(5, true, 1, 0), contribution(9, false, 0, 0)],
            FinalizeMode::LayerCount,
        );
        assert_eq!(s.fired_layers, (1 << 3) | (1 << 5));
        assert_eq!(s.fired_count, 2);
    }
}
