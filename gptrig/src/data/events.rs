use std::path::Path;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use gpcore::data::stub::Stub;
use gpcore::pattern::stats::TruthMuon;

use crate::data::patterns::{read_file, write_file};
use crate::error::Result;

/// Stubs of one event and, for training, the associated muon.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Event {
    pub id: u64,
    pub stubs: Vec<Stub>,
    #[serde(default)]
    pub truth: Option<TruthMuon>,
}

impl Event {
    pub fn new(id: u64, stubs: Vec<Stub>) -> Self {
        Event { id, stubs, truth: None }
    }

    pub fn with_truth(mut self, truth: TruthMuon) -> Self {
        self.truth = Some(truth);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct EventFile {
    pub events: Vec<Event>,
}

/// Write events as JSON, bincode or zstd-compressed bincode (by extension).
pub fn save_events(path: &Path, events: &[Event]) -> Result<()> {
    write_file(path, &EventFile { events: events.to_vec() })
}

pub fn load_events(path: &Path) -> Result<Vec<Event>> {
    let file: EventFile = read_file(path)?;
    Ok(file.events)
}
