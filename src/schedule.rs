//! Adapters for constructing flight networks from external schedule
//! datasets. The datasets themselves are produced by an external
//! ingestion pipeline; these loaders are only the read path.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use chrono::TimeDelta;
use rusqlite::Connection;
use serde::Deserialize;
use thiserror::Error;

use crate::network::{Airport, AirportCode, FlightEdge, FlightNetwork, MalformedScheduleError};

pub trait ScheduleLoader {
    fn load(&self) -> Result<FlightNetwork, ScheduleLoadError>;
}

#[derive(Debug, Error)]
pub enum ScheduleLoadError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Malformed(#[from] MalformedScheduleError),
}

/// Loads `airports(code, latitude, longitude)` and
/// `flights(origin, dest, weight, duration_min, capacity)` tables.
pub struct SqliteScheduleLoader {
    conn: Connection,
}

impl SqliteScheduleLoader {
    pub fn new(path: &str) -> Result<Self, ScheduleLoadError> {
        Ok(Self {
            conn: Connection::open(path)?,
        })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }
}

impl ScheduleLoader for SqliteScheduleLoader {
    fn load(&self) -> Result<FlightNetwork, ScheduleLoadError> {
        let mut airports = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT code, latitude, longitude FROM airports")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let code: String = row.get("code")?;
                airports.push(Airport {
                    code: code.parse::<AirportCode>()?,
                    latitude: row.get("latitude")?,
                    longitude: row.get("longitude")?,
                });
            }
        }

        let mut edges = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT origin, dest, weight, duration_min, capacity FROM flights")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let origin: String = row.get("origin")?;
                let dest: String = row.get("dest")?;
                edges.push(FlightEdge {
                    origin: origin.parse::<AirportCode>()?,
                    dest: dest.parse::<AirportCode>()?,
                    weight: row.get("weight")?,
                    duration: TimeDelta::minutes(row.get("duration_min")?),
                    capacity: row.get("capacity")?,
                });
            }
        }

        Ok(FlightNetwork::build(airports, edges)?)
    }
}

#[derive(Debug, Deserialize)]
struct AirportRow {
    code: AirportCode,
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct FlightRow {
    origin: AirportCode,
    dest: AirportCode,
    weight: f64,
    duration_min: i64,
    capacity: Option<u32>,
}

/// Loads the same dataset from a pair of headered CSV files.
pub struct CsvScheduleLoader {
    airports: PathBuf,
    flights: PathBuf,
}

impl CsvScheduleLoader {
    pub fn new(airports: impl Into<PathBuf>, flights: impl Into<PathBuf>) -> Self {
        Self {
            airports: airports.into(),
            flights: flights.into(),
        }
    }

    pub fn read(
        airports: impl Read,
        flights: impl Read,
    ) -> Result<FlightNetwork, ScheduleLoadError> {
        let mut airport_rows = Vec::new();
        for row in csv::Reader::from_reader(airports).deserialize() {
            let row: AirportRow = row?;
            airport_rows.push(Airport {
                code: row.code,
                latitude: row.latitude,
                longitude: row.longitude,
            });
        }

        let mut edges = Vec::new();
        for row in csv::Reader::from_reader(flights).deserialize() {
            let row: FlightRow = row?;
            edges.push(FlightEdge {
                origin: row.origin,
                dest: row.dest,
                weight: row.weight,
                duration: TimeDelta::minutes(row.duration_min),
                capacity: row.capacity,
            });
        }

        Ok(FlightNetwork::build(airport_rows, edges)?)
    }
}

impl ScheduleLoader for CsvScheduleLoader {
    fn load(&self) -> Result<FlightNetwork, ScheduleLoadError> {
        Self::read(File::open(&self.airports)?, File::open(&self.flights)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_network_from_sqlite() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE airports (code TEXT, latitude REAL, longitude REAL);
             CREATE TABLE flights (origin TEXT, dest TEXT, weight REAL, duration_min INTEGER, capacity INTEGER);
             INSERT INTO airports VALUES ('JFK', 40.6413, -73.7781), ('LHR', 51.4700, -0.4543);
             INSERT INTO flights VALUES ('JFK', 'LHR', 3000.0, 420, 300);",
        )
        .unwrap();

        let network = SqliteScheduleLoader::from_connection(conn).load().unwrap();
        assert_eq!(network.num_airports(), 2);
        assert_eq!(network.num_edges(), 1);
        let out = network.neighbors("JFK".parse().unwrap());
        assert_eq!(out[0].dest.as_str(), "LHR");
        assert_eq!(out[0].capacity, Some(300));
    }

    #[test]
    fn loads_network_from_csv() {
        let airports = "code,latitude,longitude\nJFK,40.6413,-73.7781\nLHR,51.4700,-0.4543\n";
        let flights = "origin,dest,weight,duration_min,capacity\nJFK,LHR,3000.0,420,\n";

        let network = CsvScheduleLoader::read(airports.as_bytes(), flights.as_bytes()).unwrap();
        assert_eq!(network.num_airports(), 2);
        let out = network.neighbors("JFK".parse().unwrap());
        assert_eq!(out[0].duration, TimeDelta::minutes(420));
        assert_eq!(out[0].capacity, None);
    }

    #[test]
    fn malformed_dataset_is_rejected() {
        let airports = "code,latitude,longitude\nJFK,40.6413,-73.7781\n";
        let flights = "origin,dest,weight,duration_min,capacity\nJFK,LHR,3000.0,420,\n";
        assert!(matches!(
            CsvScheduleLoader::read(airports.as_bytes(), flights.as_bytes()),
            Err(ScheduleLoadError::Malformed(_))
        ));
    }
}
