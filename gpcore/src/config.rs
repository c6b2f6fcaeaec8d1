//! Immutable emulator configuration.
//!
//! Built once at startup and validated eagerly: every inconsistent flag
//! combination is rejected here so that matching never has to re-check.

use serde::{Deserialize, Serialize};

use crate::data::layers::{LayerKind, LayerMap, MB1_LAYER, MB2_LAYER, N_PHI_BINS};
use crate::data::stub::{StubEtaEncoding, MAX_ABS_BX};
use crate::error::{Error, Result};
use crate::pattern::generator::{GeneratorOpts, PatternGeneratorKind};
use crate::pattern::score::FinalizeMode;

/// Stub acceptance rules applied by the stub store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StubFilterConfig {
    /// Bunch-crossing window, inclusive.
    pub bx_min: i32,
    pub bx_max: i32,
    pub min_dt_phi_quality: u8,
    pub min_dt_phi_b_quality: u8,
    /// DT stubs below this quality never serve as reference.
    pub dt_ref_hit_min_quality: u8,
    pub rpc_max_cluster_size: u8,
    pub rpc_max_cluster_cnt: usize,
    pub rpc_drop_all_clusters_if_more_than_max: bool,
    /// CSC bunch-crossing number of the central (in-time) crossing.
    pub lct_central_bx: i32,
    pub n_phi_bins: i32,
}

impl StubFilterConfig {
    /// The central-bx constant depends on how the input was produced, so it
    /// has to be supplied.
    pub fn new(lct_central_bx: i32) -> Self {
        StubFilterConfig {
            bx_min: 0,
            bx_max: 0,
            min_dt_phi_quality: 2,
            min_dt_phi_b_quality: 4,
            dt_ref_hit_min_quality: 4,
            rpc_max_cluster_size: 3,
            rpc_max_cluster_cnt: 2,
            rpc_drop_all_clusters_if_more_than_max: true,
            lct_central_bx,
            n_phi_bins: N_PHI_BINS,
        }
    }
}

/// Phi-bend extrapolation switches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtrapolationConfig {
    pub use_phi_b_extrapolation_from_mb1: bool,
    pub use_phi_b_extrapolation_from_mb2: bool,
    pub use_stub_qual_in_extr: bool,
    pub use_endcap_stubs_r_in_extr: bool,
    pub use_floating_point_extrapolation: bool,
    /// Phi-bend hardware units per radian (2048 phase-2 scale, 512 phase-1 scale).
    pub dt_phi_b_units_rad: f64,
    /// DT stubs at or above this quality fall into the high-quality bucket.
    pub correlated_min_quality: u8,
    /// Phi-bend scale per quality bucket (floating-point mode).
    pub float_qual_scale: [f64; 2],
    pub mb1_layer: u8,
    pub mb2_layer: u8,
}

impl Default for ExtrapolationConfig {
    fn default() -> Self {
        Self {
            use_phi_b_extrapolation_from_mb1: false,
            use_phi_b_extrapolation_from_mb2: false,
            use_stub_qual_in_extr: false,
            use_endcap_stubs_r_in_extr: false,
            use_floating_point_extrapolation: false,
            dt_phi_b_units_rad: 2048.0,
            correlated_min_quality: 6,
            float_qual_scale: [1.0, 1.0],
            mb1_layer: MB1_LAYER,
            mb2_layer: MB2_LAYER,
        }
    }
}

impl ExtrapolationConfig {
    pub fn any_enabled(&self) -> bool {
        self.use_phi_b_extrapolation_from_mb1 || self.use_phi_b_extrapolation_from_mb2
    }

    /// Whether phi-bend extrapolation is switched on for `ref_layer`.
    #[inline]
    pub fn enabled_for(&self, ref_layer: u8) -> bool {
        (self.use_phi_b_extrapolation_from_mb1 && ref_layer == self.mb1_layer)
            || (self.use_phi_b_extrapolation_from_mb2 && ref_layer == self.mb2_layer)
    }

    /// Quality bucket used to key factors (always 0 without stub quality).
    #[inline]
    pub fn quality_bucket(&self, quality: u8) -> u8 {
        if self.use_stub_qual_in_extr && quality >= self.correlated_min_quality {
            1
        } else {
            0
        }
    }
}

/// Reference layers and score thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Reference layers in priority order.
    pub ref_layers: Vec<u8>,
    pub finalize: FinalizeMode,
    /// Results must score strictly above this.
    pub min_score: f64,
    pub min_fired_layers: u8,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            ref_layers: vec![0, 7, 2, 6, 16, 4, 10, 11],
            finalize: FinalizeMode::LayerCount,
            min_score: 0.0,
            min_fired_layers: 2,
        }
    }
}

/// Everything the engine needs for one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmulatorConfig {
    pub layers: LayerMap,
    pub stubs: StubFilterConfig,
    pub extrapolation: ExtrapolationConfig,
    pub matching: MatchConfig,
    pub eta_encoding: StubEtaEncoding,
    pub generate_patterns: bool,
    pub pattern_generator: PatternGeneratorKind,
    pub generator: GeneratorOpts,
}

impl EmulatorConfig {
    pub fn new(layers: LayerMap, lct_central_bx: i32) -> Self {
        EmulatorConfig {
            layers,
            stubs: StubFilterConfig::new(lct_central_bx),
            extrapolation: ExtrapolationConfig::default(),
            matching: MatchConfig::default(),
            eta_encoding: StubEtaEncoding::default(),
            generate_patterns: false,
            pattern_generator: PatternGeneratorKind::default(),
            generator: GeneratorOpts::default(),
        }
    }

    /// Reject inconsistent settings.
    ///
    /// `has_factor_table` tells whether an extrapolation factor file was given.
    pub fn validate(&self, has_factor_table: bool) -> Result<()> {
        let s = &self.stubs;
        for (name, v) in [("bxMin", s.bx_min), ("bxMax", s.bx_max), ("lctCentralBx", s.lct_central_bx)] {
            if v.unsigned_abs() > MAX_ABS_BX as u32 {
                return Err(cfg_err(format!("{} {} is out of range", name, v)));
            }
        }
        if s.bx_min > s.bx_max {
            return Err(cfg_err(format!("bxMin {} is above bxMax {}", s.bx_min, s.bx_max)));
        }
        if s.n_phi_bins <= 0 || s.n_phi_bins % 2 != 0 {
            return Err(cfg_err(format!("phi bin count must be positive and even, got {}", s.n_phi_bins)));
        }
        if s.rpc_max_cluster_size == 0 {
            return Err(cfg_err("rpcMaxClusterSize must be at least 1"));
        }

        let m = &self.matching;
        if m.ref_layers.is_empty() {
            return Err(cfg_err("no reference layers configured"));
        }
        for (i, &rl) in m.ref_layers.iter().enumerate() {
            let spec = self
                .layers
                .get(rl)
                .ok_or_else(|| cfg_err(format!("reference layer {} is not in the layer map", rl)))?;
            if spec.is_bending() {
                return Err(cfg_err(format!("bending layer `{}` cannot be a reference layer", spec.name)));
            }
            if m.ref_layers[..i].contains(&rl) {
                return Err(cfg_err(format!("reference layer {} listed twice", rl)));
            }
        }
        if !m.min_score.is_finite() {
            return Err(cfg_err("minScore must be finite"));
        }

        self.validate_extrapolation(has_factor_table)?;
        self.generator.validate()?;
        Ok(())
    }

    fn validate_extrapolation(&self, has_factor_table: bool) -> Result<()> {
        let e = &self.extrapolation;
        if !e.any_enabled() {
            if e.use_stub_qual_in_extr || e.use_endcap_stubs_r_in_extr {
                return Err(cfg_err(
                    "stub quality / endcap radius in extrapolation set while phi-bend extrapolation is off",
                ));
            }
            if has_factor_table {
                return Err(cfg_err("extrapolation factor file given while phi-bend extrapolation is off"));
            }
            return Ok(());
        }

        for (enabled, layer, label) in [
            (e.use_phi_b_extrapolation_from_mb1, e.mb1_layer, "MB1"),
            (e.use_phi_b_extrapolation_from_mb2, e.mb2_layer, "MB2"),
        ] {
            if !enabled {
                continue;
            }
            match self.layers.get(layer) {
                Some(spec) if spec.kind == LayerKind::DtPhi && spec.bend_layer.is_some() => {}
                _ => {
                    return Err(cfg_err(format!(
                        "extrapolation from {} needs layer {} to be a DT phi layer with a bending layer",
                        label, layer
                    )))
                }
            }
        }

        if !(e.dt_phi_b_units_rad.is_finite() && e.dt_phi_b_units_rad > 0.0) {
            return Err(cfg_err("dtPhiBUnitsRad must be positive"));
        }
        match (e.use_floating_point_extrapolation, has_factor_table) {
            (true, true) => Err(cfg_err(
                "both floating-point extrapolation and an extrapolation factor file are configured",
            )),
            (false, false) => Err(cfg_err(
                "phi-bend extrapolation enabled without floating-point mode or an extrapolation factor file",
            )),
            (false, true) if e.use_endcap_stubs_r_in_extr => Err(cfg_err(
                "endcap stub radius is only used by floating-point extrapolation",
            )),
            _ => Ok(()),
        }
    }
}

fn cfg_err(msg: impl Into<String>) -> Error {
    Error::Configuration(msg.into())
}
