//! Synthetic single-muon events.
//!
//! A toy bending model good enough to exercise training and matching end to
//! end: every layer sees the muon at `phi0 + q * bend / ipt * (r / r0 - 1)`
//! plus Gaussian noise, DT layers also carry a proportional phi-bend.

use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;

use gpcore::data::layers::{wrap_phi, LayerKind, LayerMap, Region};
use gpcore::data::stub::{Stub, ETA_UNIT};
use gpcore::pattern::stats::TruthMuon;
use gpcore::Error;

use crate::data::events::Event;
use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MuonGunOpts {
    pub seed: u64,
    /// pT classes drawn uniformly.
    pub pt_classes: Vec<u16>,
    /// Phi deflection scale in hw units times pT class.
    pub bend_scale: f64,
    /// Radius at which the deflection is zero (cm).
    pub r0_cm: f64,
    pub phi_resolution: f64,
    pub phi_b_resolution: f64,
    /// Probability that a layer records the muon.
    pub efficiency: f64,
    /// Uniformly distributed noise stubs per event.
    pub noise_stubs: usize,
    /// Added to the bx of CSC stubs, as the hardware does.
    pub lct_central_bx: i32,
    pub n_phi_bins: i32,
}

impl Default for MuonGunOpts {
    fn default() -> Self {
        Self {
            seed: 42,
            pt_classes: vec![4, 8, 12, 16, 20],
            bend_scale: 2400.0,
            r0_cm: 400.0,
            phi_resolution: 2.0,
            phi_b_resolution: 8.0,
            efficiency: 0.95,
            noise_stubs: 0,
            lct_central_bx: 8,
            n_phi_bins: 5400,
        }
    }
}

pub struct MuonGun<'a> {
    layers: &'a LayerMap,
    opts: MuonGunOpts,
    rng: StdRng,
    phi_noise: Normal,
    phi_b_noise: Normal,
}

impl<'a> MuonGun<'a> {
    pub fn new(layers: &'a LayerMap, opts: MuonGunOpts) -> Result<Self> {
        if opts.pt_classes.is_empty() || opts.pt_classes.contains(&0) {
            return Err(Error::Configuration("muon gun needs non-zero pT classes".into()).into());
        }
        if !(0.0..=1.0).contains(&opts.efficiency) {
            return Err(Error::Configuration(format!("efficiency {} out of [0, 1]", opts.efficiency)).into());
        }
        let phi_noise = Normal::new(0.0, opts.phi_resolution)
            .map_err(|e| Error::Configuration(format!("phi resolution: {}", e)))?;
        let phi_b_noise = Normal::new(0.0, opts.phi_b_resolution)
            .map_err(|e| Error::Configuration(format!("phi-bend resolution: {}", e)))?;
        Ok(MuonGun {
            layers,
            rng: StdRng::seed_from_u64(opts.seed),
            opts,
            phi_noise,
            phi_b_noise,
        })
    }

    pub fn generate(&mut self, n_events: usize) -> Vec<Event> {
        (0..n_events as u64).map(|id| self.event(id)).collect()
    }

    pub fn event(&mut self, id: u64) -> Event {
        let pt_class = self.opts.pt_classes[self.rng.gen_range(0..self.opts.pt_classes.len())];
        let charge: i8 = if self.rng.gen_bool(0.5) { 1 } else { -1 };
        let half = self.opts.n_phi_bins / 2;
        let phi0 = self.rng.gen_range(-half..half);
        let eta = self.rng.gen_range(0.85..1.2f64);
        let bend = charge as f64 * self.opts.bend_scale / pt_class as f64;

        let layers = self.layers;
        let mut stubs = Vec::new();
        for spec in layers.iter() {
            if spec.is_bending() || !self.rng.gen_bool(self.opts.efficiency) {
                continue;
            }
            let dphi = bend * (spec.radius_cm / self.opts.r0_cm - 1.0) + self.phi_noise.sample(&mut self.rng);
            let phi = wrap_phi(phi0 + dphi.round() as i32, self.opts.n_phi_bins);
            let mut stub = match spec.kind {
                LayerKind::DtPhi => {
                    let phi_b = bend + self.phi_b_noise.sample(&mut self.rng);
                    Stub::new(spec.id, phi, self.rng.gen_range(4..=6), 0, spec.region).with_phi_b(phi_b.round() as i32)
                }
                LayerKind::Csc => Stub::new(spec.id, phi, 1, self.opts.lct_central_bx, spec.region)
                    .with_r(spec.radius_cm.round() as i32),
                LayerKind::Rpc => Stub::new(spec.id, phi, 1, 0, spec.region).with_cluster_size(self.rng.gen_range(1..=2)),
                LayerKind::DtBend => continue,
            };
            stub = stub.with_eta((eta / ETA_UNIT).round() as i32);
            if spec.region == Region::Endcap && stub.r.is_none() {
                stub = stub.with_r(spec.radius_cm.round() as i32);
            }
            stubs.push(stub);
        }

        for _ in 0..self.opts.noise_stubs {
            let layer = self.rng.gen_range(0..layers.len() as u8);
            let Some(spec) = layers.get(layer) else {
                continue;
            };
            if spec.is_bending() {
                continue;
            }
            let bx = if spec.kind == LayerKind::Csc { self.opts.lct_central_bx } else { 0 };
            stubs.push(Stub::new(layer, self.rng.gen_range(-half..half), 4, bx, spec.region));
        }

        Event::new(id, stubs).with_truth(TruthMuon { pt_class, charge })
    }
}
