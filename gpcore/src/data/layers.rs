use std::f64::consts::PI;
use std::fmt;
use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of hardware phi units per full turn.
pub const N_PHI_BINS: i32 = 5400;

/// Logic layer of the default map holding MB1 phi.
pub const MB1_LAYER: u8 = 0;
/// Logic layer of the default map holding MB2 phi.
pub const MB2_LAYER: u8 = 2;

/// Wrap a hardware phi value into `[-n_phi_bins / 2, n_phi_bins / 2)`.
///
/// # Example
///
/// ```rust
/// # use gpcore::data::layers::wrap_phi;
/// assert_eq!(wrap_phi(2700, 5400), -2700);
/// assert_eq!(wrap_phi(-2701, 5400), 2699);
/// assert_eq!(wrap_phi(15, 5400), 15);
/// ```
#[inline]
pub fn wrap_phi(phi: i32, n_phi_bins: i32) -> i32 {
    shift_phi(phi, 0, n_phi_bins)
}

/// `wrap_phi(phi + delta)`, computed without intermediate overflow.
///
/// ```rust
/// # use gpcore::data::layers::shift_phi;
/// assert_eq!(shift_phi(i32::MAX, 1, 5400), 848);
/// assert_eq!(shift_phi(2690, 20, 5400), -2690);
/// ```
#[inline]
pub fn shift_phi(phi: i32, delta: i64, n_phi_bins: i32) -> i32 {
    let n = n_phi_bins as i64;
    let half = n / 2;
    ((phi as i64).saturating_add(delta).saturating_add(half).rem_euclid(n) - half) as i32
}

/// Hardware phi units to radians.
#[inline]
pub fn hw_phi_to_rad(phi: i32, n_phi_bins: i32) -> f64 {
    phi as f64 * 2.0 * PI / n_phi_bins as f64
}

/// Radians to (rounded) hardware phi units.
#[inline]
pub fn rad_to_hw_phi(rad: f64, n_phi_bins: i32) -> i32 {
    (rad * n_phi_bins as f64 / (2.0 * PI)).round() as i32
}

/// Detection region of a stub or candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode)]
pub enum Region {
    Barrel,
    Endcap,
}

impl Region {
    pub fn code(&self) -> u8 {
        match self {
            Region::Barrel => 0,
            Region::Endcap => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Region> {
        match code {
            0 => Some(Region::Barrel),
            1 => Some(Region::Endcap),
            _ => None,
        }
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Region::Barrel => write!(f, "barrel"),
            Region::Endcap => write!(f, "endcap"),
        }
    }
}

/// What a logic layer measures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    /// Drift-tube segment position
    DtPhi,
    /// Drift-tube segment bending angle
    DtBend,
    /// Cathode-strip segment
    Csc,
    /// Resistive-plate cluster
    Rpc,
}

/// One logic layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub id: u8,
    pub name: String,
    pub kind: LayerKind,
    pub region: Region,
    /// Nominal radius in cm.
    pub radius_cm: f64,
    /// Disk position in cm (endcap layers).
    #[serde(default)]
    pub z_cm: Option<f64>,
    /// Bending layer fed by this phi layer (`DtPhi` only).
    #[serde(default)]
    pub bend_layer: Option<u8>,
}

impl LayerSpec {
    pub fn new(id: u8, name: &str, kind: LayerKind, region: Region, radius_cm: f64) -> Self {
        LayerSpec {
            id,
            name: name.to_string(),
            kind,
            region,
            radius_cm,
            z_cm: None,
            bend_layer: None,
        }
    }

    pub fn with_z(mut self, z_cm: f64) -> Self {
        self.z_cm = Some(z_cm);
        self
    }

    pub fn with_bend_layer(mut self, bend_layer: u8) -> Self {
        self.bend_layer = Some(bend_layer);
        self
    }

    #[inline]
    pub fn is_bending(&self) -> bool {
        self.kind == LayerKind::DtBend
    }
}

/// Ordered logic layers; a layer's id is its position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<LayerSpec>", into = "Vec<LayerSpec>")]
pub struct LayerMap {
    layers: Vec<LayerSpec>,
}

impl LayerMap {
    /// Build a map, checking ids, bend-layer links and geometry.
    pub fn new(layers: Vec<LayerSpec>) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::Configuration("layer map is empty".into()));
        }
        if layers.len() > 64 {
            return Err(Error::Configuration(format!(
                "at most 64 layers are supported, got {}",
                layers.len()
            )));
        }
        for (i, l) in layers.iter().enumerate() {
            if l.id as usize != i {
                return Err(Error::Configuration(format!(
                    "layer `{}` has id {} but sits at position {}",
                    l.name, l.id, i
                )));
            }
            if !(l.radius_cm.is_finite() && l.radius_cm > 0.0) {
                return Err(Error::Configuration(format!(
                    "layer `{}` has invalid radius {}",
                    l.name, l.radius_cm
                )));
            }
            if let Some(b) = l.bend_layer {
                if l.kind != LayerKind::DtPhi {
                    return Err(Error::Configuration(format!(
                        "only DT phi layers can own a bending layer (layer `{}`)",
                        l.name
                    )));
                }
                match layers.get(b as usize) {
                    Some(bl) if bl.kind == LayerKind::DtBend => {}
                    _ => {
                        return Err(Error::Configuration(format!(
                            "layer `{}` points to bending layer {} which is not a DT bending layer",
                            l.name, b
                        )))
                    }
                }
            }
        }
        Ok(LayerMap { layers })
    }

    /// Overlap-region map with DT, CSC and RPC logic layers.
    ///
    /// Radii and disk positions are nominal.
    pub fn omtf_default() -> Self {
        use LayerKind::*;
        use Region::*;
        let layers = vec![
            LayerSpec::new(0, "MB1", DtPhi, Barrel, 431.1).with_bend_layer(1),
            LayerSpec::new(1, "MB1b", DtBend, Barrel, 431.1),
            LayerSpec::new(2, "MB2", DtPhi, Barrel, 512.4).with_bend_layer(3),
            LayerSpec::new(3, "MB2b", DtBend, Barrel, 512.4),
            LayerSpec::new(4, "MB3", DtPhi, Barrel, 617.4).with_bend_layer(5),
            LayerSpec::new(5, "MB3b", DtBend, Barrel, 617.4),
            LayerSpec::new(6, "ME1/3", Csc, Endcap, 600.0).with_z(690.0),
            LayerSpec::new(7, "ME2/2", Csc, Endcap, 600.0).with_z(830.0),
            LayerSpec::new(8, "ME3/2", Csc, Endcap, 600.0).with_z(935.0),
            LayerSpec::new(9, "ME1/2", Csc, Endcap, 480.0).with_z(700.0),
            LayerSpec::new(10, "RB1in", Rpc, Barrel, 410.0),
            LayerSpec::new(11, "RB1out", Rpc, Barrel, 445.0),
            LayerSpec::new(12, "RB2in", Rpc, Barrel, 490.0),
            LayerSpec::new(13, "RB2out", Rpc, Barrel, 530.0),
            LayerSpec::new(14, "RB3", Rpc, Barrel, 597.0),
            LayerSpec::new(15, "RE1/3", Rpc, Endcap, 560.0).with_z(720.0),
            LayerSpec::new(16, "RE2/3", Rpc, Endcap, 560.0).with_z(790.0),
            LayerSpec::new(17, "RE3/3", Rpc, Endcap, 560.0).with_z(970.0),
        ];
        LayerMap { layers }
    }

    #[inline]
    pub fn get(&self, id: u8) -> Option<&LayerSpec> {
        self.layers.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerSpec> {
        self.layers.iter()
    }

    pub fn contains(&self, id: u8) -> bool {
        (id as usize) < self.layers.len()
    }
}

impl Default for LayerMap {
    fn default() -> Self {
        LayerMap::omtf_default()
    }
}

impl TryFrom<Vec<LayerSpec>> for LayerMap {
    type Error = Error;

    fn try_from(layers: Vec<LayerSpec>) -> Result<Self> {
        LayerMap::new(layers)
    }
}

impl From<LayerMap> for Vec<LayerSpec> {
    fn from(map: LayerMap) -> Self {
        map.layers
    }
}
