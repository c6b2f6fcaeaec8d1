use gpcore::algorithm::extrapolation::{ExtrapolationTarget, Extrapolator};
use gpcore::algorithm::matcher::{MatchResult, Matcher};
use gpcore::algorithm::selector::{select, Candidate};
use gpcore::config::{EmulatorConfig, ExtrapolationConfig};
use gpcore::data::layers::{LayerKind, LayerMap, LayerSpec, Region};
use gpcore::data::store::StubStore;
use gpcore::data::stub::{Stub, StubEtaEncoding};
use gpcore::pattern::bank::{PatternBank, PatternFile, PATTERN_FILE_VERSION};
use gpcore::pattern::golden::{GoldenPattern, LayerPdf, PatternKey};
use gpcore::pattern::score::FinalizeMode;
use gpcore::Error;

fn layer_map() -> LayerMap {
    let mut layers = vec![LayerSpec::new(0, "L0", LayerKind::DtPhi, Region::Barrel, 400.0)];
    for id in 1..6u8 {
        layers.push(LayerSpec::new(
            id,
            &format!("L{}", id),
            LayerKind::Rpc,
            Region::Barrel,
            400.0 + 30.0 * id as f64,
        ));
    }
    LayerMap::new(layers).unwrap()
}

/// Tolerant table: +-4 units around zero.
fn window_pdf(layer: u8) -> LayerPdf {
    let mut lp = LayerPdf::empty(layer, 32);
    for b in 12..20 {
        lp.pdf[b] = 50;
    }
    lp.no_hit_val = 2;
    lp
}

fn bank() -> PatternBank {
    PatternBank::try_from(PatternFile {
        version: PATTERN_FILE_VERSION,
        n_pdf_bins: 32,
        pdf_max_val: 100,
        n_layers: 6,
        patterns: vec![
            GoldenPattern {
                index: 0,
                key: PatternKey::new(0, 1, 10),
                layers: vec![window_pdf(3), window_pdf(5)],
            },
            GoldenPattern {
                index: 1,
                key: PatternKey::new(0, -1, 10),
                layers: (1..6).map(|l| LayerPdf::empty(l, 32)).collect(),
            },
        ],
    })
    .unwrap()
}

fn config() -> EmulatorConfig {
    let mut cfg = EmulatorConfig::new(layer_map(), 8);
    cfg.matching.ref_layers = vec![0];
    cfg.matching.finalize = FinalizeMode::LayerCount;
    cfg.validate(false).unwrap();
    cfg
}

fn run(cfg: &EmulatorConfig, bank: &PatternBank, stubs: &[Stub]) -> Vec<Candidate> {
    let matcher = Matcher::new(cfg, bank, None).unwrap();
    let mut store = StubStore::new(&cfg.layers, &cfg.stubs);
    for s in stubs {
        store.add_stub(s.clone()).unwrap();
    }
    select(&matcher.match_event(&store))
}

fn three_stubs() -> Vec<Stub> {
    vec![
        Stub::new(0, 100, 5, 0, Region::Barrel),
        Stub::new(3, 102, 1, 0, Region::Barrel),
        Stub::new(5, 99, 1, 0, Region::Barrel),
    ]
}

#[test]
fn test_three_stub_scenario() {
    let cfg = config();
    let bank = bank();
    let cands = run(&cfg, &bank, &three_stubs());

    assert_eq!(cands.len(), 1);
    let c = &cands[0];
    assert_eq!(c.pattern, 0);
    assert_eq!(c.key, PatternKey::new(0, 1, 10));
    assert_eq!(c.score, 2.0);
    assert_eq!(c.fired_layers, (1 << 3) | (1 << 5));
    assert_eq!((c.phi, c.bx, c.region), (100, 0, Region::Barrel));
}

#[test]
fn test_weighted_likelihood_scores_tables() {
    let mut cfg = config();
    cfg.matching.finalize = FinalizeMode::WeightedLikelihood;
    let cands = run(&cfg, &bank(), &three_stubs());
    assert_eq!(cands[0].score, 100.0);

    cfg.matching.finalize = FinalizeMode::LikelihoodWithNoHit;
    let cands = run(&cfg, &bank(), &three_stubs());
    assert_eq!(cands[0].score, 100.0);
}

#[test]
fn test_reference_quality_exclusion() {
    let cfg = config();
    let mut stubs = three_stubs();
    // kept as a hit, below the reference threshold
    stubs[0].quality = 3;
    assert!(run(&cfg, &bank(), &stubs).is_empty());
}

#[test]
fn test_min_score_is_strict() {
    let mut cfg = config();
    cfg.matching.min_score = 2.0;
    assert!(run(&cfg, &bank(), &three_stubs()).is_empty());
}

#[test]
fn test_rpc_drop_all_removes_layer() {
    let cfg = config();
    let mut stubs = three_stubs();
    stubs.push(Stub::new(5, 300, 1, 0, Region::Barrel));
    stubs.push(Stub::new(5, -800, 1, 0, Region::Barrel));

    let mut store = StubStore::new(&cfg.layers, &cfg.stubs);
    for s in &stubs {
        store.add_stub(s.clone()).unwrap();
    }
    assert!(store.layer_stubs(0, 5).is_empty());

    // only layer 3 left: one fired layer is below the minimum
    assert!(run(&cfg, &bank(), &stubs).is_empty());
}

#[test]
fn test_determinism() {
    let cfg = config();
    let bank = bank();
    let mut stubs = three_stubs();
    stubs.push(Stub::new(0, 400, 6, 0, Region::Barrel));
    stubs.push(Stub::new(2, 401, 1, 0, Region::Barrel));
    stubs.push(Stub::new(4, 398, 1, 0, Region::Barrel));

    let first = run(&cfg, &bank, &stubs);
    for _ in 0..10 {
        assert_eq!(run(&cfg, &bank, &stubs), first);
    }
}

#[test]
fn test_ghost_busting_keeps_best() {
    let result = |score: f64, pattern: usize| MatchResult {
        pattern,
        key: PatternKey::new(0, 1, 10),
        ref_layer: 0,
        ref_priority: 0,
        ref_stub: pattern,
        ref_phi: 0,
        ref_eta: 0,
        bx: 0,
        region: Region::Barrel,
        score,
        fired_layers: 0b110,
        fired_count: 2,
        finalize: FinalizeMode::WeightedLikelihood,
    };
    let cands = select(&[result(7.0, 0), result(10.0, 1)]);
    assert_eq!(cands.len(), 1);
    assert_eq!(cands[0].score, 10.0);
}

#[test]
fn test_bank_json_round_trip_keeps_candidates() {
    let cfg = config();
    let bank = bank();
    let json = serde_json::to_string(&bank.to_file()).unwrap();
    let file: PatternFile = serde_json::from_str(&json).unwrap();
    let reloaded = PatternBank::try_from(file).unwrap();
    assert_eq!(run(&cfg, &reloaded, &three_stubs()), run(&cfg, &bank, &three_stubs()));
}

#[test]
fn test_extrapolation_fallback() {
    let layers = LayerMap::omtf_default();
    let cfg = ExtrapolationConfig {
        use_phi_b_extrapolation_from_mb1: true,
        use_floating_point_extrapolation: false,
        ..Default::default()
    };
    let ex = Extrapolator::new(&layers, &cfg, None, StubEtaEncoding::default(), 5400);
    let reference = Stub::new(0, 0, 6, 0, Region::Barrel).with_phi_b(100);
    let res = ex.extrapolate(&reference, &ExtrapolationTarget::layer(2));
    assert!(matches!(res, Err(Error::UnsupportedExtrapolation { .. })));
}
