//! Reduces persisted itineraries into per-edge and per-node counters.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use log::info;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::network::AirportCode;
use crate::request::SimulationId;
use crate::store::{ItineraryRecord, ResultStore, StoreError};

/// A heat-map bucket: one airport or one directed route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeatKey {
    Node(AirportCode),
    Edge { from: AirportCode, to: AirportCode },
}

impl HeatKey {
    /// Inverse of the `Display` form (`"JFK"` or `"JFK-LHR"`).
    pub fn decode(s: &str) -> Option<Self> {
        match s.split_once('-') {
            Some((from, to)) => Some(Self::Edge {
                from: from.parse().ok()?,
                to: to.parse().ok()?,
            }),
            None => Some(Self::Node(s.parse().ok()?)),
        }
    }
}

impl fmt::Display for HeatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(code) => write!(f, "{code}"),
            Self::Edge { from, to } => write!(f, "{from}-{to}"),
        }
    }
}

impl Serialize for HeatKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HeatKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::decode(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid heat-map key {raw:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeatMapRecord {
    pub simulation_id: SimulationId,
    pub key: HeatKey,
    pub traversal_count: u64,
}

/// Rebuild the heat map for one simulation from its persisted itineraries
/// and atomically replace any prior records. Pure function of the stored
/// itineraries; safe to re-run at any time.
pub fn aggregate(
    store: &dyn ResultStore,
    simulation: &SimulationId,
) -> Result<Vec<HeatMapRecord>, StoreError> {
    let itineraries = store.itineraries(simulation, None)?;
    let records = reduce(simulation, &itineraries);
    store.replace_heat_map(simulation, &records)?;
    info!(
        "aggregated {} itineraries into {} heat-map records for {}",
        itineraries.len(),
        records.len(),
        simulation
    );
    Ok(records)
}

/// The order-independent count reduction. Each traversed edge contributes
/// one traversal to the edge and one to each endpoint. Duplicate record
/// ids (possible when redelivered jobs hit a store without a key
/// constraint) count once.
pub fn reduce(simulation: &SimulationId, itineraries: &[ItineraryRecord]) -> Vec<HeatMapRecord> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(itineraries.len());
    let mut counts: BTreeMap<HeatKey, u64> = BTreeMap::new();
    for record in itineraries {
        if !seen.insert(record.id.as_str()) {
            continue;
        }
        for leg in &record.legs {
            *counts
                .entry(HeatKey::Edge {
                    from: leg.from,
                    to: leg.to,
                })
                .or_default() += 1;
            *counts.entry(HeatKey::Node(leg.from)).or_default() += 1;
            *counts.entry(HeatKey::Node(leg.to)).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .map(|(key, traversal_count)| HeatMapRecord {
            simulation_id: simulation.clone(),
            key,
            traversal_count,
        })
        .collect()
}
