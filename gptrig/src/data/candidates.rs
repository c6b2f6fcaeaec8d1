use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use gpcore::algorithm::selector::Candidate;
use gpcore::data::layers::Region;
use gpcore::pattern::golden::PatternKey;

use crate::error::Result;

/// Candidates of one event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventCandidates {
    pub event_id: u64,
    pub candidates: Vec<Candidate>,
}

pub fn save_candidates_json(path: &Path, events: &[EventCandidates]) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut w, events)?;
    w.flush()?;
    Ok(())
}

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS candidates (
    event_id INTEGER NOT NULL,
    region INTEGER NOT NULL,
    bx INTEGER NOT NULL,
    pattern INTEGER NOT NULL,
    ref_layer INTEGER NOT NULL,
    charge INTEGER NOT NULL,
    pt_class INTEGER NOT NULL,
    ref_stub INTEGER NOT NULL,
    phi INTEGER NOT NULL,
    eta INTEGER NOT NULL,
    quality INTEGER NOT NULL,
    score REAL NOT NULL,
    fired_layers INTEGER NOT NULL,
    fired_count INTEGER NOT NULL
)";

const INSERT: &str = "INSERT INTO candidates (event_id, region, bx, pattern, ref_layer, charge, pt_class, \
    ref_stub, phi, eta, quality, score, fired_layers, fired_count) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";

/// SQLite table of candidates, one row per candidate.
#[derive(Debug)]
pub struct CandidateDb {
    pub connection: Connection,
}

impl CandidateDb {
    pub fn new(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(connection: Connection) -> Result<Self> {
        connection.execute_batch(CREATE_TABLE)?;
        Ok(Self { connection })
    }

    /// Insert all candidates of a batch of events in one transaction.
    pub fn write(&mut self, events: &[EventCandidates]) -> Result<usize> {
        let tx = self.connection.transaction()?;
        let mut rows = 0;
        {
            let mut stmt = tx.prepare_cached(INSERT)?;
            for ev in events {
                for c in &ev.candidates {
                    stmt.execute(params![
                        ev.event_id as i64,
                        c.region.code(),
                        c.bx,
                        c.pattern as i64,
                        c.key.ref_layer,
                        c.key.charge,
                        c.key.pt_class,
                        c.ref_stub as i64,
                        c.phi,
                        c.eta,
                        c.quality,
                        c.score,
                        c.fired_layers as i64,
                        c.fired_count,
                    ])?;
                    rows += 1;
                }
            }
        }
        tx.commit()?;
        Ok(rows)
    }

    /// All rows ordered by event, region and bx.
    pub fn read_all(&self) -> Result<Vec<(u64, Candidate)>> {
        let mut stmt = self.connection.prepare(
            "SELECT event_id, region, bx, pattern, ref_layer, charge, pt_class, ref_stub, phi, eta, \
             quality, score, fired_layers, fired_count FROM candidates ORDER BY event_id, region, bx",
        )?;
        let rows_iter = stmt.query_map([], |row| {
            let event_id: i64 = row.get(0)?;
            let region: u8 = row.get(1)?;
            let pattern: i64 = row.get(3)?;
            let ref_stub: i64 = row.get(7)?;
            let fired_layers: i64 = row.get(12)?;
            Ok((
                event_id as u64,
                Candidate {
                    region: Region::from_code(region).unwrap_or(Region::Barrel),
                    bx: row.get(2)?,
                    pattern: pattern as usize,
                    key: PatternKey::new(row.get(4)?, row.get(5)?, row.get(6)?),
                    ref_stub: ref_stub as usize,
                    phi: row.get(8)?,
                    eta: row.get(9)?,
                    quality: row.get(10)?,
                    score: row.get(11)?,
                    fired_layers: fired_layers as u64,
                    fired_count: row.get(13)?,
                },
            ))
        })?;
        let mut rows = Vec::new();
        for row in rows_iter {
            rows.push(row?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(bx: i32, score: f64) -> Candidate {
        Candidate {
            region: Region::Endcap,
            bx,
            pattern: 12,
            key: PatternKey::new(7, -1, 18),
            ref_stub: 1,
            phi: -2200,
            eta: 88,
            quality: 8,
            score,
            fired_layers: (1 << 6) | (1 << 9) | (1 << 15) | (1 << 16),
            fired_count: 4,
        }
    }

    #[test]
    fn test_sqlite_round_trip() {
        let mut db = CandidateDb::in_memory().unwrap();
        let events = vec![
            EventCandidates { event_id: 2, candidates: vec![candidate(0, 310.5)] },
            EventCandidates { event_id: 1, candidates: vec![candidate(-1, 4.0), candidate(1, 5.0)] },
        ];
        assert_eq!(db.write(&events).unwrap(), 3);
        let rows = db.read_all().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], (1, candidate(-1, 4.0)));
        assert_eq!(rows[2], (2, candidate(0, 310.5)));
    }
}
