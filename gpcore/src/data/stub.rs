use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::data::layers::Region;
use crate::error::Error;

/// Eta value of one hardware eta unit in the `valueP1Scale` encoding.
pub const ETA_UNIT: f64 = 2.61 / 240.0;

/// Eta centres of the seven theta segments addressed by the `bits` encoding.
pub const ETA_BIT_CENTERS: [f64; 7] = [-1.05, -0.75, -0.42, 0.0, 0.42, 0.75, 1.05];

/// Largest accepted |bx| of an input stub, before and after alignment.
pub const MAX_ABS_BX: i32 = 1 << 10;

/// Largest accepted |phi-bend| of an input stub, in hardware units.
pub const MAX_ABS_PHI_B: i32 = 1 << 14;

/// One hit candidate in one logic layer for one bunch crossing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Stub {
    pub layer: u8,
    /// Position in hardware phi units.
    pub phi: i32,
    /// Bending angle in hardware phi-bend units.
    #[serde(default)]
    pub phi_b: Option<i32>,
    /// Eta in hardware units, see [`StubEtaEncoding`].
    #[serde(default)]
    pub eta: i32,
    /// Radial position in cm (endcap stubs).
    #[serde(default)]
    pub r: Option<i32>,
    pub quality: u8,
    pub bx: i32,
    pub region: Region,
    #[serde(default = "default_cluster_size")]
    pub cluster_size: u8,
}

fn default_cluster_size() -> u8 {
    1
}

impl Stub {
    pub fn new(layer: u8, phi: i32, quality: u8, bx: i32, region: Region) -> Self {
        Stub {
            layer,
            phi,
            phi_b: None,
            eta: 0,
            r: None,
            quality,
            bx,
            region,
            cluster_size: 1,
        }
    }

    pub fn with_phi_b(mut self, phi_b: i32) -> Self {
        self.phi_b = Some(phi_b);
        self
    }

    pub fn with_eta(mut self, eta: i32) -> Self {
        self.eta = eta;
        self
    }

    pub fn with_r(mut self, r: i32) -> Self {
        self.r = Some(r);
        self
    }

    pub fn with_cluster_size(mut self, cluster_size: u8) -> Self {
        self.cluster_size = cluster_size;
        self
    }
}

/// How the hardware eta of a stub is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StubEtaEncoding {
    /// Signed value, one unit is [`ETA_UNIT`].
    #[default]
    #[serde(rename = "valueP1Scale")]
    ValueP1Scale,
    /// Bit field of fired theta segments, see [`ETA_BIT_CENTERS`].
    #[serde(rename = "bits")]
    Bits,
}

impl StubEtaEncoding {
    /// Decode a hardware eta. `Bits` yields `None` when no segment fired.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpcore::data::stub::StubEtaEncoding;
    /// let eta = StubEtaEncoding::Bits.decode(0b0011000).unwrap();
    /// assert!((eta - 0.21).abs() < 1e-9);
    /// assert_eq!(StubEtaEncoding::Bits.decode(0), None);
    /// ```
    pub fn decode(&self, eta_hw: i32) -> Option<f64> {
        match self {
            StubEtaEncoding::ValueP1Scale => Some(eta_hw as f64 * ETA_UNIT),
            StubEtaEncoding::Bits => {
                let (sum, n) = ETA_BIT_CENTERS
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| eta_hw & (1 << i) != 0)
                    .fold((0.0, 0usize), |(s, n), (_, c)| (s + c, n + 1));
                if n == 0 {
                    None
                } else {
                    Some(sum / n as f64)
                }
            }
        }
    }
}

impl FromStr for StubEtaEncoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valueP1Scale" => Ok(StubEtaEncoding::ValueP1Scale),
            "bits" => Ok(StubEtaEncoding::Bits),
            other => Err(Error::Configuration(format!("unknown stub eta encoding `{}`", other))),
        }
    }
}

impl Display for StubEtaEncoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StubEtaEncoding::ValueP1Scale => write!(f, "valueP1Scale"),
            StubEtaEncoding::Bits => write!(f, "bits"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_scale_decode() {
        let eta = StubEtaEncoding::ValueP1Scale.decode(-92).unwrap();
        assert!((eta + 92.0 * ETA_UNIT).abs() < 1e-12);
    }

    #[test]
    fn test_parse_encoding() {
        assert_eq!("bits".parse::<StubEtaEncoding>().unwrap(), StubEtaEncoding::Bits);
        assert!("raw".parse::<StubEtaEncoding>().is_err());
    }

    #[test]
    fn test_stub_defaults_from_json() {
        let stub: Stub = serde_json::from_str(
            r#"{"layer": 10, "phi": 120, "quality": 1, "bx": 0, "region": "Barrel"}"#,
        )
        .unwrap();
        assert_eq!(stub.cluster_size, 1);
        assert_eq!(stub.phi_b, None);
        assert_eq!(stub.r, None);
    }
}
