use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{error, info};

use gpcore::data::layers::LayerMap;
use gpcore::pattern::bank::PatternBank;
use gptrig::data::candidates::{save_candidates_json, CandidateDb};
use gptrig::data::events::{load_events, save_events, Event};
use gptrig::data::patterns::save_patterns;
use gptrig::data::raw::{load_raw, save_raw};
use gptrig::run::emulator::Emulator;
use gptrig::run::settings::RunSettings;
use gptrig::sim::muon::{MuonGun, MuonGunOpts};
use gptrig::Result;

/// Golden-pattern muon trigger emulator.
#[derive(Parser, Debug)]
#[command(name = "gptrig", version, about)]
struct Cli {
    /// Worker threads, overrides the settings file (0 = auto).
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write an empty pattern bank to start training from.
    Template {
        #[arg(long)]
        settings: PathBuf,
        /// Output bank (.json, .bin or .zst).
        #[arg(long)]
        out: PathBuf,
    },
    /// Match events and write the candidates (.db/.sqlite or .json).
    Run {
        #[arg(long)]
        settings: PathBuf,
        /// Event file (.json, .bin, .zst or packed .raw).
        #[arg(long)]
        events: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Overrides `patternsFile`.
        #[arg(long)]
        patterns: Option<PathBuf>,
        #[arg(long, default_value = "4096")]
        batch_size: usize,
    },
    /// Accumulate statistics over events with truth and generate a new bank.
    Train {
        #[arg(long)]
        settings: PathBuf,
        #[arg(long)]
        events: PathBuf,
        /// Overrides `optimisedPatsFile`.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Starting bank, overrides `patternsFile`.
        #[arg(long)]
        patterns: Option<PathBuf>,
        #[arg(long, default_value = "4096")]
        batch_size: usize,
    },
    /// Write synthetic single-muon events.
    Simulate {
        #[arg(long)]
        out: PathBuf,
        #[arg(short, long, default_value = "1000")]
        n_events: usize,
        #[arg(long, default_value = "42")]
        seed: u64,
        #[arg(long, default_value = "8")]
        lct_central_bx: i32,
        /// Noise stubs per event.
        #[arg(long, default_value = "0")]
        noise: usize,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = execute(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Template { settings, out } => {
            let settings = read_settings(&settings, cli.threads)?;
            let config = settings.to_config()?;
            let bank = PatternBank::template(
                &config.layers,
                &config.matching.ref_layers,
                &settings.pt_classes,
                settings.n_pdf_bins,
                settings.pdf_max_val,
            )?;
            save_patterns(&out, &bank)
        }
        Command::Run { settings, events, out, patterns, batch_size } => {
            let mut settings = read_settings(&settings, cli.threads)?;
            if let Some(p) = patterns {
                settings.patterns_file = p.to_string_lossy().into_owned();
            }
            if settings.generate_patterns {
                info!("generatePatterns is set, running as training");
                return train(settings, &events, batch_size);
            }
            infer(settings, &events, &out, batch_size)
        }
        Command::Train { settings, events, out, patterns, batch_size } => {
            let mut settings = read_settings(&settings, cli.threads)?;
            settings.generate_patterns = true;
            if let Some(p) = patterns {
                settings.patterns_file = p.to_string_lossy().into_owned();
            }
            if let Some(o) = out {
                settings.optimised_pats_file = o.to_string_lossy().into_owned();
            }
            train(settings, &events, batch_size)
        }
        Command::Simulate { out, n_events, seed, lct_central_bx, noise } => {
            let layers = LayerMap::omtf_default();
            let opts = MuonGunOpts { seed, lct_central_bx, noise_stubs: noise, ..Default::default() };
            let events = MuonGun::new(&layers, opts)?.generate(n_events);
            write_events(&out, &events)?;
            info!("wrote {} events to {}", events.len(), out.display());
            Ok(())
        }
    }
}

fn read_settings(path: &Path, threads: Option<usize>) -> Result<RunSettings> {
    let mut settings = RunSettings::from_file(path)?;
    if let Some(t) = threads {
        settings.threads = t;
    }
    Ok(settings)
}

fn is_raw(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("raw")
}

fn read_events(path: &Path) -> Result<Vec<Event>> {
    if is_raw(path) {
        load_raw(path)
    } else {
        load_events(path)
    }
}

fn write_events(path: &Path, events: &[Event]) -> Result<()> {
    if is_raw(path) {
        save_raw(path, events)
    } else {
        save_events(path, events)
    }
}

fn infer(settings: RunSettings, events: &Path, out: &Path, batch_size: usize) -> Result<()> {
    let mut emu = Emulator::new(settings)?;
    emu.load_patterns()?;
    let events = read_events(events)?;

    let to_sql = matches!(out.extension().and_then(|e| e.to_str()), Some("db") | Some("sqlite"));
    let mut db = if to_sql { Some(CandidateDb::new(out)?) } else { None };
    let mut collected = Vec::new();

    for batch in events.chunks(batch_size.max(1)) {
        let results = emu.process_events(batch)?;
        match db.as_mut() {
            Some(db) => {
                db.write(&results)?;
            }
            None => collected.extend(results),
        }
    }
    if !to_sql {
        save_candidates_json(out, &collected)?;
    }
    emu.finish()?;
    Ok(())
}

fn train(settings: RunSettings, events: &Path, batch_size: usize) -> Result<()> {
    let mut emu = Emulator::new(settings)?;
    emu.load_patterns()?;
    let events = read_events(events)?;
    for batch in events.chunks(batch_size.max(1)) {
        emu.process_events(batch)?;
    }
    emu.finish()?;
    Ok(())
}
