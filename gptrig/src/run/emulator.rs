//! Run context.
//!
//! Owns the immutable configuration, the pattern bank and the factor table
//! for the duration of a run, and drives events through the engine on a
//! rayon pool. Training statistics are accumulated per worker and merged.

use std::fmt;
use std::fmt::{Display, Formatter};
use std::path::Path;

use log::{debug, info, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use gpcore::algorithm::extrapolation::ExtrapolationFactorTable;
use gpcore::algorithm::matcher::Matcher;
use gpcore::algorithm::selector::{select, Candidate};
use gpcore::config::EmulatorConfig;
use gpcore::data::store::StubStore;
use gpcore::pattern::bank::PatternBank;
use gpcore::pattern::stats::{PatternStats, TrainingSample};

use crate::data::candidates::EventCandidates;
use crate::data::events::Event;
use crate::data::factors::load_factors;
use crate::data::patterns::{load_patterns, save_patterns};
use crate::error::{Result, RunError};
use crate::run::settings::RunSettings;

/// Lifecycle of a run.
///
/// `Idle -> Loaded -> Matching` for inference, `Idle -> Loaded ->
/// Accumulating -> Saved` for training.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Loaded,
    Matching,
    Accumulating,
    Saved,
}

impl Display for RunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Loaded => "loaded",
            RunState::Matching => "matching",
            RunState::Accumulating => "accumulating",
            RunState::Saved => "saved",
        };
        write!(f, "{}", name)
    }
}

/// Counters of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub events: usize,
    /// Events dropped because of an event-level error.
    pub failed: usize,
    pub candidates: usize,
    /// Training events that contributed to the statistics.
    pub trained: usize,
}

#[derive(Debug)]
pub struct Emulator {
    settings: RunSettings,
    config: EmulatorConfig,
    factors: Option<ExtrapolationFactorTable>,
    bank: Option<PatternBank>,
    stats: Option<PatternStats>,
    state: RunState,
    pool: ThreadPool,
    summary: RunSummary,
}

impl Emulator {
    /// Validate the settings, read the factor table and set up the worker pool.
    pub fn new(settings: RunSettings) -> Result<Self> {
        let config = settings.to_config()?;
        let factors = load_factors(&settings.extrapol_factors_filename)?;
        if let Some(table) = &factors {
            table.check_layers(&config.layers)?;
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.threads)
            .build()
            .map_err(|e| gpcore::Error::Configuration(format!("thread pool: {}", e)))?;
        info!(
            "emulator ready: {} layers, finalize {}, {}",
            config.layers.len(),
            config.matching.finalize,
            if config.generate_patterns { "training" } else { "inference" }
        );
        Ok(Emulator {
            settings,
            config,
            factors,
            bank: None,
            stats: None,
            state: RunState::Idle,
            pool,
            summary: RunSummary::default(),
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn bank(&self) -> Option<&PatternBank> {
        self.bank.as_ref()
    }

    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    pub fn is_training(&self) -> bool {
        self.config.generate_patterns
    }

    fn expect_state(&self, allowed: &[RunState], action: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(RunError::InvalidState(format!("cannot {} while {}", action, self.state)))
        }
    }

    /// Load the bank named in the settings.
    ///
    /// In training without a patterns file an empty template bank is used.
    pub fn load_patterns(&mut self) -> Result<()> {
        self.expect_state(&[RunState::Idle], "load patterns")?;
        let path = self.settings.patterns_file.trim().to_string();
        let bank = if path.is_empty() {
            if !self.is_training() {
                return Err(gpcore::Error::Configuration("no patternsFile given".into()).into());
            }
            info!("no patterns file, training from an empty template");
            PatternBank::template(
                &self.config.layers,
                &self.config.matching.ref_layers,
                &self.settings.pt_classes,
                self.settings.n_pdf_bins,
                self.settings.pdf_max_val,
            )?
        } else {
            load_patterns(Path::new(&path))?
        };
        self.set_bank(bank)
    }

    /// Use an already built bank.
    pub fn set_bank(&mut self, bank: PatternBank) -> Result<()> {
        self.expect_state(&[RunState::Idle], "set patterns")?;
        bank.check_layers(&self.config.layers)?;
        self.bank = Some(bank);
        self.state = RunState::Loaded;
        Ok(())
    }

    /// Run a batch of events.
    ///
    /// Inference returns the candidates of every successfully processed event;
    /// training accumulates statistics and returns nothing. Failing events are
    /// logged and counted, the batch goes on.
    pub fn process_events(&mut self, events: &[Event]) -> Result<Vec<EventCandidates>> {
        if self.is_training() {
            self.expect_state(&[RunState::Loaded, RunState::Accumulating], "accumulate")?;
            self.accumulate(events)?;
            self.state = RunState::Accumulating;
            Ok(Vec::new())
        } else {
            self.expect_state(&[RunState::Loaded, RunState::Matching], "match")?;
            let out = self.match_events(events)?;
            self.state = RunState::Matching;
            Ok(out)
        }
    }

    fn match_events(&mut self, events: &[Event]) -> Result<Vec<EventCandidates>> {
        let bank = self
            .bank
            .as_ref()
            .ok_or_else(|| RunError::InvalidState("no pattern bank".into()))?;
        let matcher = Matcher::new(&self.config, bank, self.factors.as_ref())?;
        let config = &self.config;

        let outcomes: Vec<(u64, Result<Vec<Candidate>>)> = self.pool.install(|| {
            events
                .par_iter()
                .map(|ev| (ev.id, match_event(config, &matcher, ev)))
                .collect()
        });

        let mut out = Vec::with_capacity(outcomes.len());
        let mut failed = 0;
        for (event_id, outcome) in outcomes {
            match outcome {
                Ok(candidates) => out.push(EventCandidates { event_id, candidates }),
                Err(e) => {
                    warn!("event {} dropped: {}", event_id, e);
                    failed += 1;
                }
            }
        }

        self.summary.events += events.len();
        self.summary.failed += failed;
        self.summary.candidates += out.iter().map(|e| e.candidates.len()).sum::<usize>();
        debug!("matched {} events, {} failed", events.len(), failed);
        Ok(out)
    }

    fn accumulate(&mut self, events: &[Event]) -> Result<()> {
        let bank = self
            .bank
            .as_ref()
            .ok_or_else(|| RunError::InvalidState("no pattern bank".into()))?;
        let matcher = Matcher::new(&self.config, bank, self.factors.as_ref())?;
        let config = &self.config;
        let slope_var = config.pattern_generator.slope_variable();
        let empty = || PatternStats::new(bank, &config.generator.binning, slope_var, config.stubs.n_phi_bins);

        let (batch, trained, failed) = self.pool.install(|| {
            events
                .par_iter()
                .fold(
                    || (empty(), 0usize, 0usize),
                    |(mut stats, trained, failed), ev| match train_event(config, &matcher, ev) {
                        Ok(Some((pattern, sample))) => {
                            stats.accumulate(pattern, &sample);
                            (stats, trained + 1, failed)
                        }
                        Ok(None) => (stats, trained, failed),
                        Err(e) => {
                            warn!("event {} dropped: {}", ev.id, e);
                            (stats, trained, failed + 1)
                        }
                    },
                )
                .reduce(
                    || (empty(), 0, 0),
                    |(mut a, ta, fa), (b, tb, fb)| {
                        a.merge(b);
                        (a, ta + tb, fa + fb)
                    },
                )
        });

        match self.stats.as_mut() {
            Some(stats) => stats.merge(batch),
            None => self.stats = Some(batch),
        }
        self.summary.events += events.len();
        self.summary.failed += failed;
        self.summary.trained += trained;
        debug!("accumulated {} of {} events", trained, events.len());
        Ok(())
    }

    /// End the run.
    ///
    /// Training turns the statistics into a new bank, writes it to
    /// `optimisedPatsFile` (when set) and returns it. Inference has nothing to
    /// finalize and returns `None`.
    pub fn finish(&mut self) -> Result<Option<PatternBank>> {
        if !self.is_training() {
            self.expect_state(&[RunState::Loaded, RunState::Matching], "finish")?;
            info!(
                "run done: {} events, {} failed, {} candidates",
                self.summary.events, self.summary.failed, self.summary.candidates
            );
            return Ok(None);
        }

        self.expect_state(&[RunState::Loaded, RunState::Accumulating], "finish")?;
        let bank = self
            .bank
            .as_ref()
            .ok_or_else(|| RunError::InvalidState("no pattern bank".into()))?;
        let config = &self.config;
        let stats = match self.stats.take() {
            Some(stats) => stats,
            None => PatternStats::new(
                bank,
                &config.generator.binning,
                config.pattern_generator.slope_variable(),
                config.stubs.n_phi_bins,
            ),
        };
        let generated = config.pattern_generator.generate(bank, &stats, &config.generator)?;

        let out = self.settings.optimised_pats_file.trim();
        if !out.is_empty() {
            save_patterns(Path::new(out), &generated)?;
        }
        info!(
            "training done: {} of {} events used, {} failed",
            self.summary.trained, self.summary.events, self.summary.failed
        );
        self.state = RunState::Saved;
        Ok(Some(generated))
    }
}

fn fill_store<'a>(config: &'a EmulatorConfig, ev: &Event) -> Result<StubStore<'a>> {
    let mut store = StubStore::new(&config.layers, &config.stubs);
    for stub in &ev.stubs {
        store.add_stub(stub.clone())?;
    }
    Ok(store)
}

fn match_event(config: &EmulatorConfig, matcher: &Matcher, ev: &Event) -> Result<Vec<Candidate>> {
    let store = fill_store(config, ev)?;
    Ok(select(&matcher.match_event(&store)))
}

fn train_event(
    config: &EmulatorConfig,
    matcher: &Matcher,
    ev: &Event,
) -> Result<Option<(usize, TrainingSample)>> {
    let Some(truth) = ev.truth else {
        debug!("event {} has no truth muon", ev.id);
        return Ok(None);
    };
    let store = fill_store(config, ev)?;
    Ok(matcher.training_sample(&store, &truth))
}
