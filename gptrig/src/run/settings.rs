//! Settings file of a run.
//!
//! JSON with camelCase keys. Everything has a default except `lctCentralBx`,
//! whose value depends on how the input stubs were produced.

use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use gpcore::config::{EmulatorConfig, ExtrapolationConfig, MatchConfig, StubFilterConfig};
use gpcore::data::layers::{LayerMap, LayerSpec, N_PHI_BINS};
use gpcore::data::stub::StubEtaEncoding;
use gpcore::pattern::generator::{GeneratorOpts, PatternGeneratorKind};
use gpcore::pattern::score::FinalizeMode;
use gpcore::Error;

use crate::data::patterns::open_input;
use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunSettings {
    // ---- stub store ----
    #[serde(default)]
    pub bx_min: i32,
    #[serde(default)]
    pub bx_max: i32,
    #[serde(default = "defaults::min_dt_phi_quality")]
    pub min_dt_phi_quality: u8,
    #[serde(default = "defaults::min_dt_phi_b_quality")]
    pub min_dt_phi_b_quality: u8,
    #[serde(default = "defaults::dt_ref_hit_min_quality")]
    pub dt_ref_hit_min_quality: u8,
    #[serde(default = "defaults::rpc_max_cluster_size")]
    pub rpc_max_cluster_size: u8,
    #[serde(default = "defaults::rpc_max_cluster_cnt")]
    pub rpc_max_cluster_cnt: usize,
    #[serde(default = "defaults::yes")]
    pub rpc_drop_all_clusters_if_more_than_max: bool,
    pub lct_central_bx: i32,

    // ---- extrapolation ----
    #[serde(default, rename = "usePhiBExtrapolationFromMB1")]
    pub use_phi_b_extrapolation_from_mb1: bool,
    #[serde(default, rename = "usePhiBExtrapolationFromMB2")]
    pub use_phi_b_extrapolation_from_mb2: bool,
    #[serde(default)]
    pub use_stub_qual_in_extr: bool,
    #[serde(default)]
    pub use_endcap_stubs_r_in_extr: bool,
    #[serde(default)]
    pub use_floating_point_extrapolation: bool,
    /// Empty: no factor table.
    #[serde(default)]
    pub extrapol_factors_filename: String,
    #[serde(default = "defaults::dt_phi_b_units_rad")]
    pub dt_phi_b_units_rad: f64,
    #[serde(default)]
    pub stub_eta_encoding: StubEtaEncoding,

    // ---- matching ----
    #[serde(default = "defaults::finalize_function")]
    pub golden_pattern_result_finalize_function: i32,
    #[serde(default)]
    pub ref_layers: Option<Vec<u8>>,
    #[serde(default)]
    pub min_score: f64,
    #[serde(default = "defaults::min_fired_layers")]
    pub min_fired_layers: u8,
    /// Custom layer map, the overlap-region map when absent.
    #[serde(default)]
    pub layers: Option<Vec<LayerSpec>>,

    // ---- patterns ----
    #[serde(default)]
    pub patterns_file: String,
    #[serde(default)]
    pub optimised_pats_file: String,
    #[serde(default)]
    pub generate_patterns: bool,
    #[serde(default)]
    pub pattern_generator: PatternGeneratorKind,
    #[serde(default)]
    pub generator: GeneratorOpts,
    /// pT classes of the template bank used when training without input patterns.
    #[serde(default = "defaults::pt_classes")]
    pub pt_classes: Vec<u16>,
    #[serde(default = "defaults::n_pdf_bins")]
    pub n_pdf_bins: u16,
    #[serde(default = "defaults::pdf_max_val")]
    pub pdf_max_val: u16,

    /// Worker threads, 0 lets rayon decide.
    #[serde(default)]
    pub threads: usize,
}

mod defaults {
    pub fn min_dt_phi_quality() -> u8 {
        2
    }
    pub fn min_dt_phi_b_quality() -> u8 {
        4
    }
    pub fn dt_ref_hit_min_quality() -> u8 {
        4
    }
    pub fn rpc_max_cluster_size() -> u8 {
        3
    }
    pub fn rpc_max_cluster_cnt() -> usize {
        2
    }
    pub fn yes() -> bool {
        true
    }
    pub fn dt_phi_b_units_rad() -> f64 {
        2048.0
    }
    pub fn finalize_function() -> i32 {
        3
    }
    pub fn min_fired_layers() -> u8 {
        2
    }
    pub fn pt_classes() -> Vec<u16> {
        vec![4, 8, 12, 16, 20]
    }
    pub fn n_pdf_bins() -> u16 {
        64
    }
    pub fn pdf_max_val() -> u16 {
        255
    }
}

impl RunSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Configuration(format!("settings: {}", e)).into())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let f = BufReader::new(open_input(path)?);
        serde_json::from_reader(f)
            .map_err(|e| Error::Configuration(format!("settings {}: {}", path.display(), e)).into())
    }

    pub fn has_factor_table(&self) -> bool {
        !self.extrapol_factors_filename.trim().is_empty()
    }

    /// Build and validate the immutable engine configuration.
    pub fn to_config(&self) -> Result<EmulatorConfig> {
        let layers = match &self.layers {
            Some(specs) => LayerMap::new(specs.clone())?,
            None => LayerMap::omtf_default(),
        };

        let stubs = StubFilterConfig {
            bx_min: self.bx_min,
            bx_max: self.bx_max,
            min_dt_phi_quality: self.min_dt_phi_quality,
            min_dt_phi_b_quality: self.min_dt_phi_b_quality,
            dt_ref_hit_min_quality: self.dt_ref_hit_min_quality,
            rpc_max_cluster_size: self.rpc_max_cluster_size,
            rpc_max_cluster_cnt: self.rpc_max_cluster_cnt,
            rpc_drop_all_clusters_if_more_than_max: self.rpc_drop_all_clusters_if_more_than_max,
            lct_central_bx: self.lct_central_bx,
            n_phi_bins: N_PHI_BINS,
        };

        let extrapolation = ExtrapolationConfig {
            use_phi_b_extrapolation_from_mb1: self.use_phi_b_extrapolation_from_mb1,
            use_phi_b_extrapolation_from_mb2: self.use_phi_b_extrapolation_from_mb2,
            use_stub_qual_in_extr: self.use_stub_qual_in_extr,
            use_endcap_stubs_r_in_extr: self.use_endcap_stubs_r_in_extr,
            use_floating_point_extrapolation: self.use_floating_point_extrapolation,
            dt_phi_b_units_rad: self.dt_phi_b_units_rad,
            ..Default::default()
        };

        let defaults = MatchConfig::default();
        let matching = MatchConfig {
            ref_layers: self.ref_layers.clone().unwrap_or(defaults.ref_layers),
            finalize: FinalizeMode::from_code(self.golden_pattern_result_finalize_function)?,
            min_score: self.min_score,
            min_fired_layers: self.min_fired_layers,
        };

        let config = EmulatorConfig {
            layers,
            stubs,
            extrapolation,
            matching,
            eta_encoding: self.stub_eta_encoding,
            generate_patterns: self.generate_patterns,
            pattern_generator: self.pattern_generator,
            generator: self.generator.clone(),
        };
        config.validate(self.has_factor_table())?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunError;

    #[test]
    fn test_minimal_settings() {
        let s = RunSettings::from_json_str(r#"{"lctCentralBx": 8}"#).unwrap();
        assert_eq!(s.rpc_max_cluster_cnt, 2);
        assert!(s.rpc_drop_all_clusters_if_more_than_max);
        let cfg = s.to_config().unwrap();
        assert_eq!(cfg.stubs.lct_central_bx, 8);
        assert_eq!(cfg.matching.finalize, FinalizeMode::LayerCount);
        assert_eq!(cfg.layers.len(), 18);
    }

    #[test]
    fn test_lct_central_bx_is_required() {
        let err = RunSettings::from_json_str(r#"{"bxMin": 0}"#).unwrap_err();
        assert!(matches!(err, RunError::Core(Error::Configuration(_))));
    }

    #[test]
    fn test_option_names() {
        let s = RunSettings::from_json_str(
            r#"{
                "lctCentralBx": 6,
                "usePhiBExtrapolationFromMB1": true,
                "useFloatingPointExtrapolation": true,
                "useStubQualInExtr": true,
                "stubEtaEncoding": "bits",
                "goldenPatternResultFinalizeFunction": 1,
                "patternGenerator": "deltaPhiVsPhiRef",
                "minDtPhiBQuality": 5
            }"#,
        )
        .unwrap();
        let cfg = s.to_config().unwrap();
        assert!(cfg.extrapolation.enabled_for(0));
        assert_eq!(cfg.eta_encoding, StubEtaEncoding::Bits);
        assert_eq!(cfg.matching.finalize, FinalizeMode::LikelihoodWithNoHit);
        assert_eq!(cfg.pattern_generator, PatternGeneratorKind::DeltaPhiVsPhiRef);
        assert_eq!(cfg.stubs.min_dt_phi_b_quality, 5);
    }

    #[test]
    fn test_inconsistent_flags_rejected() {
        let s = RunSettings::from_json_str(r#"{"lctCentralBx": 8, "usePhiBExtrapolationFromMB2": true}"#).unwrap();
        assert!(s.to_config().is_err());
        let s = RunSettings::from_json_str(r#"{"lctCentralBx": 8, "goldenPatternResultFinalizeFunction": 2}"#).unwrap();
        assert!(s.to_config().is_err());
        assert!(RunSettings::from_json_str(r#"{"lctCentralBx": 8, "useFloatingPointExtrapoltion": true}"#).is_err());
    }
}
