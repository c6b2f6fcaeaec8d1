//! Phi-bend extrapolation of a reference stub onto other layers.
//!
//! Two modes exist. The floating-point mode projects a straight line from the
//! reference radius to the target radius; the table mode applies a
//! `(scale, offset)` pair looked up per (reference layer, target layer,
//! quality bucket).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ExtrapolationConfig;
use crate::data::layers::{rad_to_hw_phi, shift_phi, LayerMap, Region};
use crate::data::stub::{Stub, StubEtaEncoding};
use crate::error::{Error, Result};

/// One entry of the factor table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtrapolationFactor {
    pub ref_layer: u8,
    pub target_layer: u8,
    #[serde(default)]
    pub quality_bucket: u8,
    pub scale: f64,
    #[serde(default)]
    pub offset: i32,
}

/// Read-only lookup of extrapolation factors.
#[derive(Clone, Debug, Default)]
pub struct ExtrapolationFactorTable {
    entries: Vec<ExtrapolationFactor>,
    index: HashMap<(u8, u8, u8), usize>,
}

impl ExtrapolationFactorTable {
    pub fn from_entries(entries: Vec<ExtrapolationFactor>) -> Result<Self> {
        let mut index = HashMap::with_capacity(entries.len());
        for (i, f) in entries.iter().enumerate() {
            if !f.scale.is_finite() {
                return Err(Error::Configuration(format!(
                    "extrapolation factor {}->{} has a non-finite scale",
                    f.ref_layer, f.target_layer
                )));
            }
            if index.insert((f.ref_layer, f.target_layer, f.quality_bucket), i).is_some() {
                return Err(Error::Configuration(format!(
                    "duplicate extrapolation factor {}->{} (bucket {})",
                    f.ref_layer, f.target_layer, f.quality_bucket
                )));
            }
        }
        Ok(ExtrapolationFactorTable { entries, index })
    }

    /// Every entry must name layers of `layers`.
    pub fn check_layers(&self, layers: &LayerMap) -> Result<()> {
        for f in &self.entries {
            for id in [f.ref_layer, f.target_layer] {
                if !layers.contains(id) {
                    return Err(Error::Configuration(format!(
                        "extrapolation factor {}->{} names layer {} outside the layer map",
                        f.ref_layer, f.target_layer, id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, ref_layer: u8, target_layer: u8, quality_bucket: u8) -> Option<&ExtrapolationFactor> {
        self.index
            .get(&(ref_layer, target_layer, quality_bucket))
            .map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[ExtrapolationFactor] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where to extrapolate to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExtrapolationTarget {
    pub layer: u8,
    /// Radial position of the target stub in cm, endcap only.
    pub r: Option<i32>,
}

impl ExtrapolationTarget {
    pub fn layer(layer: u8) -> Self {
        ExtrapolationTarget { layer, r: None }
    }

    pub fn stub(stub: &Stub) -> Self {
        ExtrapolationTarget { layer: stub.layer, r: stub.r }
    }
}

/// Predicted phi and phi-bend at the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extrapolated {
    pub phi: i32,
    pub phi_b: i32,
}

#[derive(Clone, Debug)]
pub struct Extrapolator<'a> {
    layers: &'a LayerMap,
    cfg: &'a ExtrapolationConfig,
    table: Option<&'a ExtrapolationFactorTable>,
    eta_encoding: StubEtaEncoding,
    n_phi_bins: i32,
}

impl<'a> Extrapolator<'a> {
    pub fn new(
        layers: &'a LayerMap,
        cfg: &'a ExtrapolationConfig,
        table: Option<&'a ExtrapolationFactorTable>,
        eta_encoding: StubEtaEncoding,
        n_phi_bins: i32,
    ) -> Self {
        Extrapolator {
            layers,
            cfg,
            table,
            eta_encoding,
            n_phi_bins,
        }
    }

    /// Startup check: extrapolation switched on without any way to compute
    /// it, or a factor table built for other layers.
    pub fn check(&self) -> Result<()> {
        if self.cfg.any_enabled() && !self.cfg.use_floating_point_extrapolation && self.table.is_none() {
            return Err(Error::Configuration(
                "phi-bend extrapolation enabled but neither floating-point mode nor a factor table is available"
                    .into(),
            ));
        }
        match self.table {
            Some(table) => table.check_layers(self.layers),
            None => Ok(()),
        }
    }

    #[inline]
    pub fn is_enabled_for(&self, ref_layer: u8) -> bool {
        self.cfg.enabled_for(ref_layer)
    }

    /// Extrapolate `reference` onto `target`.
    ///
    /// Fails with `UnsupportedExtrapolation` when extrapolation is off for the
    /// reference layer, the reference has no phi-bend, the table has no entry,
    /// the target radius cannot be reached or no mode is configured.
    pub fn extrapolate(&self, reference: &Stub, target: &ExtrapolationTarget) -> Result<Extrapolated> {
        let ref_layer = reference.layer;
        if !self.is_enabled_for(ref_layer) {
            return Err(Error::unsupported(ref_layer, "phi-bend extrapolation is off for this layer"));
        }
        let phi_b = reference
            .phi_b
            .ok_or_else(|| Error::unsupported(ref_layer, "reference stub carries no phi-bend"))?;
        let bucket = self.cfg.quality_bucket(reference.quality);

        if self.cfg.use_floating_point_extrapolation {
            return self.extrapolate_float(reference, phi_b, bucket, target);
        }
        if let Some(table) = self.table {
            let f = table.get(ref_layer, target.layer, bucket).ok_or_else(|| {
                Error::unsupported(
                    ref_layer,
                    format!("no factor for target layer {} (bucket {})", target.layer, bucket),
                )
            })?;
            let delta = ((phi_b as f64 * f.scale).round() as i64).saturating_add(f.offset as i64);
            return Ok(Extrapolated {
                phi: shift_phi(reference.phi, delta, self.n_phi_bins),
                phi_b,
            });
        }
        Err(Error::unsupported(ref_layer, "no extrapolation mode configured"))
    }

    fn extrapolate_float(
        &self,
        reference: &Stub,
        phi_b: i32,
        bucket: u8,
        target: &ExtrapolationTarget,
    ) -> Result<Extrapolated> {
        let ref_layer = reference.layer;
        let ref_spec = self
            .layers
            .get(ref_layer)
            .ok_or_else(|| Error::unsupported(ref_layer, "reference layer is not in the layer map"))?;
        let target_spec = self.layers.get(target.layer).ok_or_else(|| {
            Error::unsupported(ref_layer, format!("target layer {} is not in the layer map", target.layer))
        })?;

        let r_target = match target_spec.region {
            Region::Barrel => target_spec.radius_cm,
            Region::Endcap => self.endcap_radius(reference, target, target_spec.z_cm, target_spec.radius_cm),
        };
        if !(r_target > 0.0) {
            return Err(Error::unsupported(ref_layer, format!("target radius {} is not positive", r_target)));
        }

        let units = self.cfg.dt_phi_b_units_rad;
        let phi_b_rad = phi_b as f64 * self.cfg.float_qual_scale[bucket as usize] / units;
        let arg = ref_spec.radius_cm / r_target * phi_b_rad.sin();
        if arg.abs() > 1.0 {
            return Err(Error::unsupported(
                ref_layer,
                format!("layer {} at r={:.1} cm is out of reach", target.layer, r_target),
            ));
        }
        let bend = arg.asin();
        let delta = phi_b_rad - bend;
        Ok(Extrapolated {
            phi: shift_phi(reference.phi, rad_to_hw_phi(delta, self.n_phi_bins) as i64, self.n_phi_bins),
            phi_b: (bend * units).round() as i32,
        })
    }

    fn endcap_radius(&self, reference: &Stub, target: &ExtrapolationTarget, z_cm: Option<f64>, nominal: f64) -> f64 {
        if self.cfg.use_endcap_stubs_r_in_extr {
            if let Some(r) = target.r.filter(|&r| r > 0) {
                return r as f64;
            }
        }
        let eta = self.eta_encoding.decode(reference.eta).map(f64::abs);
        match (z_cm, eta) {
            (Some(z), Some(eta)) if eta > 1e-3 => z.abs() / eta.sinh(),
            _ => nominal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mb1(phi: i32, phi_b: i32, quality: u8) -> Stub {
        Stub::new(0, phi, quality, 0, Region::Barrel).with_phi_b(phi_b)
    }

    fn float_cfg() -> ExtrapolationConfig {
        ExtrapolationConfig {
            use_phi_b_extrapolation_from_mb1: true,
            use_floating_point_extrapolation: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_float_zero_bend_is_identity() {
        let layers = LayerMap::omtf_default();
        let cfg = float_cfg();
        let ex = Extrapolator::new(&layers, &cfg, None, StubEtaEncoding::default(), 5400);
        let out = ex.extrapolate(&mb1(120, 0, 6), &ExtrapolationTarget::layer(2)).unwrap();
        assert_eq!(out, Extrapolated { phi: 120, phi_b: 0 });
    }

    #[test]
    fn test_float_outward_bend() {
        let layers = LayerMap::omtf_default();
        let cfg = float_cfg();
        let ex = Extrapolator::new(&layers, &cfg, None, StubEtaEncoding::default(), 5400);
        let out = ex.extrapolate(&mb1(0, 200, 6), &ExtrapolationTarget::layer(4)).unwrap();
        // larger radius: smaller bend, positive shift
        assert!(out.phi > 0);
        assert!(out.phi_b > 0 && out.phi_b < 200);
    }

    #[test]
    fn test_float_unreachable_radius() {
        let layers = LayerMap::omtf_default();
        let cfg = float_cfg();
        let ex = Extrapolator::new(&layers, &cfg, None, StubEtaEncoding::default(), 5400);
        // ~80 degrees of bend cannot reach an inner layer
        let res = ex.extrapolate(&mb1(0, 2850, 6), &ExtrapolationTarget::layer(10));
        assert!(matches!(res, Err(Error::UnsupportedExtrapolation { ref_layer: 0, .. })));
    }

    #[test]
    fn test_table_mode() {
        let layers = LayerMap::omtf_default();
        let cfg = ExtrapolationConfig {
            use_phi_b_extrapolation_from_mb1: true,
            use_stub_qual_in_extr: true,
            ..Default::default()
        };
        let table = ExtrapolationFactorTable::from_entries(vec![
            ExtrapolationFactor { ref_layer: 0, target_layer: 2, quality_bucket: 0, scale: 0.5, offset: 1 },
            ExtrapolationFactor { ref_layer: 0, target_layer: 2, quality_bucket: 1, scale: 0.25, offset: 0 },
        ])
        .unwrap();
        let ex = Extrapolator::new(&layers, &cfg, Some(&table), StubEtaEncoding::default(), 5400);

        let low = ex.extrapolate(&mb1(100, 40, 4), &ExtrapolationTarget::layer(2)).unwrap();
        assert_eq!(low, Extrapolated { phi: 121, phi_b: 40 });
        let high = ex.extrapolate(&mb1(100, 40, 6), &ExtrapolationTarget::layer(2)).unwrap();
        assert_eq!(high.phi, 110);

        let missing = ex.extrapolate(&mb1(100, 40, 4), &ExtrapolationTarget::layer(6));
        assert!(matches!(missing, Err(Error::UnsupportedExtrapolation { .. })));
    }

    #[test]
    fn test_fallback_errors() {
        let layers = LayerMap::omtf_default();

        // disabled for the reference layer
        let cfg = float_cfg();
        let ex = Extrapolator::new(&layers, &cfg, None, StubEtaEncoding::default(), 5400);
        let mb2 = Stub::new(2, 0, 6, 0, Region::Barrel).with_phi_b(10);
        assert!(matches!(
            ex.extrapolate(&mb2, &ExtrapolationTarget::layer(4)),
            Err(Error::UnsupportedExtrapolation { ref_layer: 2, .. })
        ));

        // no phi-bend
        let bare = Stub::new(0, 0, 6, 0, Region::Barrel);
        assert!(ex.extrapolate(&bare, &ExtrapolationTarget::layer(4)).is_err());

        // enabled without any mode
        let cfg = ExtrapolationConfig { use_phi_b_extrapolation_from_mb1: true, ..Default::default() };
        let ex = Extrapolator::new(&layers, &cfg, None, StubEtaEncoding::default(), 5400);
        assert!(matches!(ex.check(), Err(Error::Configuration(_))));
        assert!(matches!(
            ex.extrapolate(&mb1(0, 10, 6), &ExtrapolationTarget::layer(4)),
            Err(Error::UnsupportedExtrapolation { .. })
        ));
    }

    #[test]
    fn test_endcap_radius_sources() {
        let layers = LayerMap::omtf_default();
        let mut cfg = float_cfg();
        let ex = Extrapolator::new(&layers, &cfg, None, StubEtaEncoding::default(), 5400);
        let reference = mb1(0, 100, 6).with_eta(92); // eta ~ 1.0
        let target = ExtrapolationTarget { layer: 7, r: Some(300) };
        let from_eta = ex.extrapolate(&reference, &target).unwrap();

        cfg.use_endcap_stubs_r_in_extr = true;
        let ex = Extrapolator::new(&layers, &cfg, None, StubEtaEncoding::default(), 5400);
        let from_r = ex.extrapolate(&reference, &target).unwrap();
        assert_ne!(from_eta, from_r);
    }

    #[test]
    fn test_factor_outside_layer_map() {
        let layers = LayerMap::omtf_default();
        let cfg = ExtrapolationConfig { use_phi_b_extrapolation_from_mb1: true, ..Default::default() };
        let table = ExtrapolationFactorTable::from_entries(vec![ExtrapolationFactor {
            ref_layer: 0,
            target_layer: 40,
            quality_bucket: 0,
            scale: 1.0,
            offset: 0,
        }])
        .unwrap();
        assert!(matches!(table.check_layers(&layers), Err(Error::Configuration(_))));
        let ex = Extrapolator::new(&layers, &cfg, Some(&table), StubEtaEncoding::default(), 5400);
        assert!(matches!(ex.check(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_table_mode_extreme_factor_wraps() {
        let layers = LayerMap::omtf_default();
        let cfg = ExtrapolationConfig { use_phi_b_extrapolation_from_mb1: true, ..Default::default() };
        let table = ExtrapolationFactorTable::from_entries(vec![ExtrapolationFactor {
            ref_layer: 0,
            target_layer: 2,
            quality_bucket: 0,
            scale: 1e30,
            offset: i32::MAX,
        }])
        .unwrap();
        let ex = Extrapolator::new(&layers, &cfg, Some(&table), StubEtaEncoding::default(), 5400);
        let out = ex.extrapolate(&mb1(2000, 100, 6), &ExtrapolationTarget::layer(2)).unwrap();
        assert!((-2700..2700).contains(&out.phi));
    }

    #[test]
    fn test_duplicate_factor_rejected() {
        let f = ExtrapolationFactor { ref_layer: 0, target_layer: 2, quality_bucket: 0, scale: 1.0, offset: 0 };
        assert!(ExtrapolationFactorTable::from_entries(vec![f.clone(), f]).is_err());
    }
}
