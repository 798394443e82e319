//! Airports, flight edges, and the read-only flight network graph.
//!
//! The network is built once from a schedule dataset and never mutated
//! afterwards; workers share it through an `Arc` without synchronization.
//! A schedule refresh builds a fresh network and swaps the `Arc` wholesale.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::TimeDelta;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Three-letter IATA-style airport code, stored inline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AirportCode([u8; 3]);

impl AirportCode {
    pub fn parse(code: &str) -> Result<Self, MalformedScheduleError> {
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
            return Err(MalformedScheduleError::BadAirportCode(code.to_owned()));
        }
        let mut inner = [0u8; 3];
        inner.copy_from_slice(bytes);
        inner.make_ascii_uppercase();
        Ok(Self(inner))
    }

    pub fn as_str(&self) -> &str {
        // ASCII alphanumeric by construction
        std::str::from_utf8(&self.0).expect("airport code is ASCII")
    }
}

impl fmt::Display for AirportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for AirportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AirportCode {
    type Err = MalformedScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for AirportCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AirportCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Airport {
    pub code: AirportCode,
    pub latitude: f64,
    pub longitude: f64,
}

/// A scheduled route between two airports. `weight` is the weekly seat
/// frequency used for choice weighting; `capacity` is informational.
#[derive(Debug, Clone, PartialEq)]
pub struct FlightEdge {
    pub origin: AirportCode,
    pub dest: AirportCode,
    pub weight: f64,
    pub duration: TimeDelta,
    pub capacity: Option<u32>,
}

#[derive(Debug, Error)]
pub enum MalformedScheduleError {
    #[error("invalid airport code {0:?}")]
    BadAirportCode(String),
    #[error("duplicate airport {0}")]
    DuplicateAirport(AirportCode),
    #[error("edge {origin}->{dest} references unknown airport {unknown}")]
    UnknownAirport {
        origin: AirportCode,
        dest: AirportCode,
        unknown: AirportCode,
    },
    #[error("edge {origin}->{dest} has non-positive duration")]
    NonPositiveDuration {
        origin: AirportCode,
        dest: AirportCode,
    },
    #[error("edge {origin}->{dest} has non-positive weight")]
    NonPositiveWeight {
        origin: AirportCode,
        dest: AirportCode,
    },
}

#[derive(Debug)]
pub struct FlightNetwork {
    airports: HashMap<AirportCode, Airport>,
    adjacency: HashMap<AirportCode, Vec<FlightEdge>>,
}

impl FlightNetwork {
    /// Validate airports and edges and assemble the adjacency lists.
    /// Outbound edges keep their input order per origin, which gives
    /// deterministic tie-breaking for a fixed dataset.
    pub fn build(
        airports: Vec<Airport>,
        edges: Vec<FlightEdge>,
    ) -> Result<Self, MalformedScheduleError> {
        let mut by_code = HashMap::with_capacity(airports.len());
        for airport in airports {
            if by_code.insert(airport.code, airport.clone()).is_some() {
                return Err(MalformedScheduleError::DuplicateAirport(airport.code));
            }
        }

        let mut adjacency: HashMap<AirportCode, Vec<FlightEdge>> = HashMap::new();
        for edge in edges {
            for endpoint in [edge.origin, edge.dest] {
                if !by_code.contains_key(&endpoint) {
                    return Err(MalformedScheduleError::UnknownAirport {
                        origin: edge.origin,
                        dest: edge.dest,
                        unknown: endpoint,
                    });
                }
            }
            if edge.duration <= TimeDelta::zero() {
                return Err(MalformedScheduleError::NonPositiveDuration {
                    origin: edge.origin,
                    dest: edge.dest,
                });
            }
            if edge.weight <= 0.0 {
                return Err(MalformedScheduleError::NonPositiveWeight {
                    origin: edge.origin,
                    dest: edge.dest,
                });
            }
            adjacency.entry(edge.origin).or_default().push(edge);
        }

        Ok(Self {
            airports: by_code,
            adjacency,
        })
    }

    pub fn airport(&self, code: AirportCode) -> Option<&Airport> {
        self.airports.get(&code)
    }

    pub fn contains(&self, code: AirportCode) -> bool {
        self.airports.contains_key(&code)
    }

    /// Outbound edges from `code`, in input order. Empty for unknown
    /// airports and for airports with no departures.
    pub fn neighbors(&self, code: AirportCode) -> &[FlightEdge] {
        self.adjacency.get(&code).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn num_airports(&self) -> usize {
        self.airports.len()
    }

    pub fn num_edges(&self) -> usize {
        self.adjacency.values().map(Vec::len).sum()
    }

    /// Great-circle distance between two loaded airports, in kilometers.
    pub fn distance_km(&self, a: AirportCode, b: AirportCode) -> Option<f64> {
        let a = self.airports.get(&a)?;
        let b = self.airports.get(&b)?;
        Some(haversine_km(
            a.latitude,
            a.longitude,
            b.latitude,
            b.longitude,
        ))
    }
}

const EARTH_RADIUS_KM: f64 = 6371.0;

fn haversine_km(lat_a: f64, lon_a: f64, lat_b: f64, lon_b: f64) -> f64 {
    let d_lat = (lat_b - lat_a).to_radians();
    let d_lon = (lon_b - lon_a).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat_a.to_radians().cos() * lat_b.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}
