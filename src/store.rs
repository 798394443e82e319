//! Document-store binding for itineraries, heat-map records, and
//! simulation bookkeeping.
//!
//! The trait is the abstract store the rest of the crate programs
//! against; `SqliteResultStore` is the concrete binding. Itinerary legs
//! are stored as JSON documents, mirroring the collections the external
//! ingestion and intake services read.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::generator::Leg;
use crate::heatmap::{HeatKey, HeatMapRecord};
use crate::network::AirportCode;
use crate::request::{SimulationId, SimulationRequest};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("bad timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("simulation {0} was already dispatched")]
    DuplicateSimulation(SimulationId),
    #[error("unknown simulation {0}")]
    UnknownSimulation(SimulationId),
    #[error("malformed stored record: {0}")]
    MalformedRecord(String),
}

/// One persisted passenger itinerary. `id` is derived deterministically
/// from (simulation, origin, sequence), so a redelivered job writes the
/// same ids again and the store can treat the writes as duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItineraryRecord {
    pub id: String,
    pub simulation_id: SimulationId,
    pub origin: AirportCode,
    pub sequence_id: u32,
    pub legs: Vec<Leg>,
    pub generated_at: DateTime<Utc>,
}

impl ItineraryRecord {
    pub fn record_id(simulation: &SimulationId, origin: AirportCode, sequence_id: u32) -> String {
        format!("{simulation}:{origin}:{sequence_id}")
    }
}

/// Partial-failure marker for one origin whose itineraries could not be
/// generated (schedule gap). Surfaces as reduced heat-map coverage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginFailure {
    pub simulation_id: SimulationId,
    pub origin: AirportCode,
    pub lost_share: u32,
    pub reason: String,
}

/// Derived from counting persisted itineraries and failure markers
/// against the expected passenger total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationStatus {
    Pending,
    Partial {
        persisted: u64,
        failed_share: u64,
        expected: u64,
    },
    Complete {
        persisted: u64,
        failed_share: u64,
    },
}

pub trait ResultStore: Send + Sync {
    /// Register a dispatched simulation. Dispatching the same simulation
    /// id twice is a contract violation and fails.
    fn record_simulation(
        &self,
        request: &SimulationRequest,
        expected_jobs: usize,
    ) -> Result<(), StoreError>;

    /// Idempotent write: returns `false` when a record with the same id
    /// already exists (duplicate from a redelivered job).
    fn insert_itinerary(&self, record: &ItineraryRecord) -> Result<bool, StoreError>;

    fn itineraries(
        &self,
        simulation: &SimulationId,
        limit: Option<usize>,
    ) -> Result<Vec<ItineraryRecord>, StoreError>;

    fn count_itineraries(&self, simulation: &SimulationId) -> Result<u64, StoreError>;

    /// Idempotent: re-marking the same origin overwrites the marker.
    fn record_origin_failure(&self, failure: &OriginFailure) -> Result<(), StoreError>;

    fn origin_failures(&self, simulation: &SimulationId) -> Result<Vec<OriginFailure>, StoreError>;

    /// Replace every heat-map record for the simulation in one
    /// transaction; readers never observe a partial overwrite.
    fn replace_heat_map(
        &self,
        simulation: &SimulationId,
        records: &[HeatMapRecord],
    ) -> Result<(), StoreError>;

    fn heat_map(&self, simulation: &SimulationId) -> Result<Vec<HeatMapRecord>, StoreError>;

    fn simulation_status(&self, simulation: &SimulationId) -> Result<SimulationStatus, StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS simulations (
    sim_id              TEXT PRIMARY KEY,
    expected_passengers INTEGER NOT NULL,
    expected_jobs       INTEGER NOT NULL,
    submitted_by        TEXT NOT NULL,
    window_start        TEXT NOT NULL,
    window_end          TEXT NOT NULL,
    dispatched_at       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS itineraries (
    id           TEXT PRIMARY KEY,
    sim_id       TEXT NOT NULL,
    origin       TEXT NOT NULL,
    sequence_id  INTEGER NOT NULL,
    legs         TEXT NOT NULL,
    generated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_itineraries_sim ON itineraries (sim_id);
CREATE TABLE IF NOT EXISTS origin_failures (
    sim_id     TEXT NOT NULL,
    origin     TEXT NOT NULL,
    lost_share INTEGER NOT NULL,
    reason     TEXT NOT NULL,
    PRIMARY KEY (sim_id, origin)
);
CREATE TABLE IF NOT EXISTS heat_map (
    sim_id          TEXT NOT NULL,
    key             TEXT NOT NULL,
    traversal_count INTEGER NOT NULL,
    PRIMARY KEY (sim_id, key)
);
";

pub struct SqliteResultStore {
    conn: Mutex<Connection>,
}

impl SqliteResultStore {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ResultStore for SqliteResultStore {
    fn record_simulation(
        &self,
        request: &SimulationRequest,
        expected_jobs: usize,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let result = conn.execute(
            "INSERT INTO simulations (sim_id, expected_passengers, expected_jobs, submitted_by, window_start, window_end, dispatched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                request.id.as_str(),
                request.passenger_count,
                expected_jobs as i64,
                request.submitted_by,
                request.window.start.to_rfc3339(),
                request.window.end.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateSimulation(request.id.clone()))
            }
            Err(other) => Err(other.into()),
        }
    }

    fn insert_itinerary(&self, record: &ItineraryRecord) -> Result<bool, StoreError> {
        let legs = serde_json::to_string(&record.legs)?;
        let conn = self.conn.lock().expect("store lock poisoned");
        let changed = conn.execute(
            "INSERT OR IGNORE INTO itineraries (id, sim_id, origin, sequence_id, legs, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.simulation_id.as_str(),
                record.origin.as_str(),
                record.sequence_id,
                legs,
                record.generated_at.to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            debug!("duplicate itinerary {} ignored", record.id);
        }
        Ok(changed == 1)
    }

    fn itineraries(
        &self,
        simulation: &SimulationId,
        limit: Option<usize>,
    ) -> Result<Vec<ItineraryRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, origin, sequence_id, legs, generated_at FROM itineraries
             WHERE sim_id = ?1 ORDER BY origin, sequence_id LIMIT ?2",
        )?;
        // Negative LIMIT means unbounded in SQLite.
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let mut rows = stmt.query(params![simulation.as_str(), limit])?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let origin: String = row.get("origin")?;
            let legs: String = row.get("legs")?;
            let generated_at: String = row.get("generated_at")?;
            records.push(ItineraryRecord {
                id: row.get("id")?,
                simulation_id: simulation.clone(),
                origin: origin
                    .parse()
                    .map_err(|_| StoreError::MalformedRecord(format!("origin {origin:?}")))?,
                sequence_id: row.get("sequence_id")?,
                legs: serde_json::from_str(&legs)?,
                generated_at: DateTime::parse_from_rfc3339(&generated_at)?.with_timezone(&Utc),
            });
        }
        Ok(records)
    }

    fn count_itineraries(&self, simulation: &SimulationId) -> Result<u64, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM itineraries WHERE sim_id = ?1",
            params![simulation.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn record_origin_failure(&self, failure: &OriginFailure) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO origin_failures (sim_id, origin, lost_share, reason)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                failure.simulation_id.as_str(),
                failure.origin.as_str(),
                failure.lost_share,
                failure.reason,
            ],
        )?;
        Ok(())
    }

    fn origin_failures(&self, simulation: &SimulationId) -> Result<Vec<OriginFailure>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT origin, lost_share, reason FROM origin_failures
             WHERE sim_id = ?1 ORDER BY origin",
        )?;
        let mut rows = stmt.query(params![simulation.as_str()])?;

        let mut failures = Vec::new();
        while let Some(row) = rows.next()? {
            let origin: String = row.get("origin")?;
            failures.push(OriginFailure {
                simulation_id: simulation.clone(),
                origin: origin
                    .parse()
                    .map_err(|_| StoreError::MalformedRecord(format!("origin {origin:?}")))?,
                lost_share: row.get("lost_share")?,
                reason: row.get("reason")?,
            });
        }
        Ok(failures)
    }

    fn replace_heat_map(
        &self,
        simulation: &SimulationId,
        records: &[HeatMapRecord],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM heat_map WHERE sim_id = ?1",
            params![simulation.as_str()],
        )?;
        for record in records {
            tx.execute(
                "INSERT INTO heat_map (sim_id, key, traversal_count) VALUES (?1, ?2, ?3)",
                params![
                    simulation.as_str(),
                    record.key.to_string(),
                    record.traversal_count as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn heat_map(&self, simulation: &SimulationId) -> Result<Vec<HeatMapRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt =
            conn.prepare("SELECT key, traversal_count FROM heat_map WHERE sim_id = ?1")?;
        let mut rows = stmt.query(params![simulation.as_str()])?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get("key")?;
            let traversal_count: i64 = row.get("traversal_count")?;
            records.push(HeatMapRecord {
                simulation_id: simulation.clone(),
                key: HeatKey::decode(&key)
                    .ok_or_else(|| StoreError::MalformedRecord(format!("heat key {key:?}")))?,
                traversal_count: traversal_count as u64,
            });
        }
        // Canonical order matches what the aggregator emits.
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    fn simulation_status(&self, simulation: &SimulationId) -> Result<SimulationStatus, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let expected: Option<i64> = conn
            .query_row(
                "SELECT expected_passengers FROM simulations WHERE sim_id = ?1",
                params![simulation.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(expected) = expected else {
            return Err(StoreError::UnknownSimulation(simulation.clone()));
        };

        let persisted: i64 = conn.query_row(
            "SELECT COUNT(*) FROM itineraries WHERE sim_id = ?1",
            params![simulation.as_str()],
            |row| row.get(0),
        )?;
        let failed: i64 = conn.query_row(
            "SELECT COALESCE(SUM(lost_share), 0) FROM origin_failures WHERE sim_id = ?1",
            params![simulation.as_str()],
            |row| row.get(0),
        )?;

        let (persisted, failed_share, expected) = (persisted as u64, failed as u64, expected as u64);
        Ok(if persisted + failed_share == 0 {
            SimulationStatus::Pending
        } else if persisted + failed_share < expected {
            SimulationStatus::Partial {
                persisted,
                failed_share,
                expected,
            }
        } else {
            SimulationStatus::Complete {
                persisted,
                failed_share,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::TravelWindow;
    use chrono::TimeDelta;

    fn store() -> SqliteResultStore {
        SqliteResultStore::open_in_memory().unwrap()
    }

    fn sim() -> SimulationId {
        SimulationId::new("sim-1").unwrap()
    }

    fn request(passengers: u32) -> SimulationRequest {
        let start: DateTime<Utc> = "2020-03-01T00:00:00Z".parse().unwrap();
        SimulationRequest::new(
            sim(),
            vec!["AAA".parse().unwrap()],
            passengers,
            TravelWindow {
                start,
                end: start + TimeDelta::days(2),
            },
            "analyst@example.org",
        )
        .unwrap()
    }

    fn itinerary(seq: u32) -> ItineraryRecord {
        ItineraryRecord {
            id: ItineraryRecord::record_id(&sim(), "AAA".parse().unwrap(), seq),
            simulation_id: sim(),
            origin: "AAA".parse().unwrap(),
            sequence_id: seq,
            legs: vec![Leg {
                from: "AAA".parse().unwrap(),
                to: "BBB".parse().unwrap(),
                departure_offset: 30,
                duration: 120,
            }],
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn duplicate_simulation_fails_loudly() {
        let store = store();
        store.record_simulation(&request(10), 1).unwrap();
        assert!(matches!(
            store.record_simulation(&request(10), 1),
            Err(StoreError::DuplicateSimulation(_))
        ));
    }

    #[test]
    fn itinerary_writes_are_idempotent() {
        let store = store();
        assert!(store.insert_itinerary(&itinerary(0)).unwrap());
        assert!(!store.insert_itinerary(&itinerary(0)).unwrap());
        assert_eq!(store.count_itineraries(&sim()).unwrap(), 1);

        let fetched = store.itineraries(&sim(), None).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].legs, itinerary(0).legs);
    }

    #[test]
    fn itinerary_fetch_honors_limit() {
        let store = store();
        for seq in 0..5 {
            store.insert_itinerary(&itinerary(seq)).unwrap();
        }
        assert_eq!(store.itineraries(&sim(), Some(3)).unwrap().len(), 3);
        assert_eq!(store.itineraries(&sim(), None).unwrap().len(), 5);
    }

    #[test]
    fn heat_map_replace_is_total() {
        let store = store();
        let record = |key: &str, n: u64| HeatMapRecord {
            simulation_id: sim(),
            key: HeatKey::decode(key).unwrap(),
            traversal_count: n,
        };
        store
            .replace_heat_map(&sim(), &[record("AAA", 1), record("AAA-BBB", 1)])
            .unwrap();
        store.replace_heat_map(&sim(), &[record("CCC", 7)]).unwrap();

        let fetched = store.heat_map(&sim()).unwrap();
        assert_eq!(fetched, vec![record("CCC", 7)]);
    }

    #[test]
    fn status_tracks_progress_and_failures() {
        let store = store();
        store.record_simulation(&request(3), 1).unwrap();
        assert_eq!(
            store.simulation_status(&sim()).unwrap(),
            SimulationStatus::Pending
        );

        store.insert_itinerary(&itinerary(0)).unwrap();
        assert_eq!(
            store.simulation_status(&sim()).unwrap(),
            SimulationStatus::Partial {
                persisted: 1,
                failed_share: 0,
                expected: 3
            }
        );

        store
            .record_origin_failure(&OriginFailure {
                simulation_id: sim(),
                origin: "BBB".parse().unwrap(),
                lost_share: 2,
                reason: "no outbound flights".to_owned(),
            })
            .unwrap();
        assert_eq!(
            store.simulation_status(&sim()).unwrap(),
            SimulationStatus::Complete {
                persisted: 1,
                failed_share: 2
            }
        );
    }

    #[test]
    fn status_for_unknown_simulation_is_an_error() {
        assert!(matches!(
            store().simulation_status(&sim()),
            Err(StoreError::UnknownSimulation(_))
        ));
    }
}
