//! Per-event stub store.
//!
//! Stubs are kept per (bx, layer). Quality thresholds are applied on insert;
//! the RPC cluster-count cap is applied on read so that insertion order does
//! not matter.

use std::collections::BTreeMap;

use log::trace;

use crate::config::StubFilterConfig;
use crate::data::layers::{wrap_phi, LayerKind, LayerMap};
use crate::data::stub::{Stub, MAX_ABS_BX, MAX_ABS_PHI_B};
use crate::error::{Error, Result};

/// A stub eligible as reference, with its position in the store.
#[derive(Clone, Copy, Debug)]
pub struct RefStub<'a> {
    /// Position of the stub's layer in the reference-layer list.
    pub priority: usize,
    /// Index of the stub inside its (bx, layer) slot.
    pub index: usize,
    pub stub: &'a Stub,
}

#[derive(Clone, Debug)]
pub struct StubStore<'a> {
    layers: &'a LayerMap,
    cfg: &'a StubFilterConfig,
    stubs: BTreeMap<(i32, u8), Vec<Stub>>,
    dropped: usize,
}

impl<'a> StubStore<'a> {
    pub fn new(layers: &'a LayerMap, cfg: &'a StubFilterConfig) -> Self {
        StubStore {
            layers,
            cfg,
            stubs: BTreeMap::new(),
            dropped: 0,
        }
    }

    /// Insert one stub.
    ///
    /// Returns `Ok(false)` when the stub is silently dropped (outside the bx
    /// window, below quality, oversized cluster) and an error when the layer is
    /// not part of the layer map or bx or phi-bend are out of range. Phi is
    /// wrapped, never rejected.
    pub fn add_stub(&mut self, stub: Stub) -> Result<bool> {
        let layers = self.layers;
        let spec = layers.get(stub.layer).ok_or_else(|| {
            Error::InvalidStub(format!("layer {} is not in the layer map", stub.layer))
        })?;

        if stub.bx.unsigned_abs() > MAX_ABS_BX as u32 {
            return Err(Error::InvalidStub(format!("layer {}: bx {} out of range", stub.layer, stub.bx)));
        }
        if let Some(phi_b) = stub.phi_b.filter(|b| b.unsigned_abs() > MAX_ABS_PHI_B as u32) {
            return Err(Error::InvalidStub(format!("layer {}: phi-bend {} out of range", stub.layer, phi_b)));
        }

        let mut stub = stub;
        if spec.kind == LayerKind::Csc {
            stub.bx -= self.cfg.lct_central_bx;
        }
        if stub.bx < self.cfg.bx_min || stub.bx > self.cfg.bx_max {
            return Ok(self.reject(&stub, "outside bx window"));
        }
        stub.phi = wrap_phi(stub.phi, self.cfg.n_phi_bins);

        match spec.kind {
            LayerKind::DtPhi => {
                if stub.quality < self.cfg.min_dt_phi_quality {
                    return Ok(self.reject(&stub, "DT phi quality"));
                }
                if stub.quality < self.cfg.min_dt_phi_b_quality {
                    stub.phi_b = None;
                }
                if let (Some(bend), Some(_)) = (spec.bend_layer, stub.phi_b) {
                    let mut bend_stub = stub.clone();
                    bend_stub.layer = bend;
                    self.push(bend_stub);
                }
            }
            LayerKind::DtBend => {
                if stub.quality < self.cfg.min_dt_phi_b_quality || stub.phi_b.is_none() {
                    return Ok(self.reject(&stub, "DT phi-bend quality"));
                }
            }
            LayerKind::Rpc => {
                if stub.cluster_size > self.cfg.rpc_max_cluster_size {
                    return Ok(self.reject(&stub, "RPC cluster size"));
                }
            }
            LayerKind::Csc => {}
        }

        self.push(stub);
        Ok(true)
    }

    fn push(&mut self, stub: Stub) {
        self.stubs.entry((stub.bx, stub.layer)).or_default().push(stub);
    }

    fn reject(&mut self, stub: &Stub, reason: &str) -> bool {
        trace!("dropping stub layer={} bx={} q={}: {}", stub.layer, stub.bx, stub.quality, reason);
        self.dropped += 1;
        false
    }

    /// Number of stubs dropped on insert.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Stubs of one layer in one bunch crossing, after the RPC cluster cap.
    pub fn layer_stubs(&self, bx: i32, layer: u8) -> &[Stub] {
        let Some(v) = self.stubs.get(&(bx, layer)) else {
            return &[];
        };
        let is_rpc = self.layers.get(layer).map(|l| l.kind == LayerKind::Rpc).unwrap_or(false);
        if is_rpc && v.len() > self.cfg.rpc_max_cluster_cnt {
            if self.cfg.rpc_drop_all_clusters_if_more_than_max {
                &[]
            } else {
                &v[..self.cfg.rpc_max_cluster_cnt]
            }
        } else {
            v
        }
    }

    /// Distinct bunch crossings holding stubs, ascending.
    pub fn bunch_crossings(&self) -> Vec<i32> {
        let mut out: Vec<i32> = self.stubs.keys().map(|&(bx, _)| bx).collect();
        out.dedup();
        out
    }

    /// Restartable iteration over non-empty (bx, layer) slots, bx-major.
    pub fn iter(&self) -> impl Iterator<Item = (i32, u8, &[Stub])> + Clone + '_ {
        self.stubs
            .keys()
            .map(move |&(bx, layer)| (bx, layer, self.layer_stubs(bx, layer)))
            .filter(|(_, _, s)| !s.is_empty())
    }

    /// Reference candidates of one bunch crossing, in `ref_layers` order.
    ///
    /// DT stubs below the reference quality threshold are excluded.
    pub fn reference_stubs(&self, bx: i32, ref_layers: &[u8]) -> Vec<RefStub<'_>> {
        let mut out = Vec::new();
        for (priority, &layer) in ref_layers.iter().enumerate() {
            let Some(spec) = self.layers.get(layer) else {
                continue;
            };
            for (index, stub) in self.layer_stubs(bx, layer).iter().enumerate() {
                if spec.kind == LayerKind::DtPhi && stub.quality < self.cfg.dt_ref_hit_min_quality {
                    continue;
                }
                out.push(RefStub { priority, index, stub });
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.stubs.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::layers::Region;

    fn cfg() -> StubFilterConfig {
        StubFilterConfig::new(8)
    }

    #[test]
    fn test_dt_quality_thresholds() {
        let layers = LayerMap::omtf_default();
        let cfg = cfg();
        let mut store = StubStore::new(&layers, &cfg);

        // below phi quality: dropped
        assert!(!store.add_stub(Stub::new(0, 10, 1, 0, Region::Barrel).with_phi_b(5)).unwrap());
        // phi kept, phi-bend below threshold
        assert!(store.add_stub(Stub::new(0, 20, 3, 0, Region::Barrel).with_phi_b(5)).unwrap());
        // both kept
        assert!(store.add_stub(Stub::new(2, 30, 6, 0, Region::Barrel).with_phi_b(-7)).unwrap());

        assert_eq!(store.layer_stubs(0, 0).len(), 1);
        assert_eq!(store.layer_stubs(0, 0)[0].phi_b, None);
        assert!(store.layer_stubs(0, 1).is_empty());
        assert_eq!(store.layer_stubs(0, 3).len(), 1);
        assert_eq!(store.layer_stubs(0, 3)[0].phi_b, Some(-7));
        assert_eq!(store.dropped(), 1);
    }

    #[test]
    fn test_csc_bx_alignment() {
        let layers = LayerMap::omtf_default();
        let cfg = cfg();
        let mut store = StubStore::new(&layers, &cfg);
        assert!(store.add_stub(Stub::new(7, 100, 1, 8, Region::Endcap)).unwrap());
        assert!(!store.add_stub(Stub::new(7, 100, 1, 0, Region::Endcap)).unwrap());
        assert_eq!(store.bunch_crossings(), vec![0]);
    }

    #[test]
    fn test_rpc_cluster_cap_drop_all() {
        let layers = LayerMap::omtf_default();
        let cfg = cfg();
        let mut store = StubStore::new(&layers, &cfg);
        for phi in [10, 40, 70] {
            store.add_stub(Stub::new(12, phi, 0, 0, Region::Barrel)).unwrap();
        }
        assert!(store.layer_stubs(0, 12).is_empty());
        assert_eq!(store.iter().count(), 0);
    }

    #[test]
    fn test_rpc_cluster_cap_keep_first() {
        let layers = LayerMap::omtf_default();
        let mut cfg = cfg();
        cfg.rpc_drop_all_clusters_if_more_than_max = false;
        let mut store = StubStore::new(&layers, &cfg);
        for phi in [10, 40, 70] {
            store.add_stub(Stub::new(12, phi, 0, 0, Region::Barrel)).unwrap();
        }
        let kept: Vec<i32> = store.layer_stubs(0, 12).iter().map(|s| s.phi).collect();
        assert_eq!(kept, vec![10, 40]);
    }

    #[test]
    fn test_wide_cluster_dropped() {
        let layers = LayerMap::omtf_default();
        let cfg = cfg();
        let mut store = StubStore::new(&layers, &cfg);
        assert!(!store
            .add_stub(Stub::new(12, 10, 0, 0, Region::Barrel).with_cluster_size(4))
            .unwrap());
    }

    #[test]
    fn test_unknown_layer_is_error() {
        let layers = LayerMap::omtf_default();
        let cfg = cfg();
        let mut store = StubStore::new(&layers, &cfg);
        assert!(matches!(
            store.add_stub(Stub::new(40, 0, 5, 0, Region::Barrel)),
            Err(Error::InvalidStub(_))
        ));
    }

    #[test]
    fn test_reference_pool_excludes_low_quality() {
        let layers = LayerMap::omtf_default();
        let cfg = cfg();
        let mut store = StubStore::new(&layers, &cfg);
        store.add_stub(Stub::new(0, 10, 3, 0, Region::Barrel)).unwrap();
        store.add_stub(Stub::new(0, 50, 5, 0, Region::Barrel)).unwrap();
        store.add_stub(Stub::new(10, 60, 0, 0, Region::Barrel)).unwrap();
        let refs = store.reference_stubs(0, &[10, 0]);
        let phis: Vec<(usize, i32)> = refs.iter().map(|r| (r.priority, r.stub.phi)).collect();
        assert_eq!(phis, vec![(0, 60), (1, 50)]);
    }

    #[test]
    fn test_out_of_range_values() {
        let layers = LayerMap::omtf_default();
        let cfg = cfg();
        let mut store = StubStore::new(&layers, &cfg);
        assert!(matches!(
            store.add_stub(Stub::new(7, 100, 1, i32::MIN, Region::Endcap)),
            Err(Error::InvalidStub(_))
        ));
        assert!(matches!(
            store.add_stub(Stub::new(0, 100, 5, 0, Region::Barrel).with_phi_b(i32::MAX)),
            Err(Error::InvalidStub(_))
        ));
        assert!(store.is_empty());

        // extreme phi is wrapped
        assert!(store.add_stub(Stub::new(10, i32::MAX, 0, 0, Region::Barrel)).unwrap());
        assert_eq!(store.layer_stubs(0, 10)[0].phi, 848);
    }

    #[test]
    fn test_iter_is_restartable() {
        let layers = LayerMap::omtf_default();
        let cfg = cfg();
        let mut store = StubStore::new(&layers, &cfg);
        store.add_stub(Stub::new(10, 1, 0, 0, Region::Barrel)).unwrap();
        store.add_stub(Stub::new(11, 2, 0, 0, Region::Barrel)).unwrap();
        let it = store.iter();
        let first: Vec<u8> = it.clone().map(|(_, l, _)| l).collect();
        let second: Vec<u8> = it.map(|(_, l, _)| l).collect();
        assert_eq!(first, vec![10, 11]);
        assert_eq!(first, second);
    }
}
