//! Distributed passenger-itinerary simulation over a flight network.
//!
//! A simulation request fans out into one job per departure airport; a
//! pool of workers walks the read-only network to generate per-passenger
//! itineraries, persists them idempotently, and the aggregator reduces
//! them into per-edge and per-node heat-map records queryable by
//! simulation id. Request intake, completion notification, and schedule
//! ingestion live outside this crate.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub mod generator;
pub mod heatmap;
pub mod network;
pub mod queue;
pub mod request;
pub mod schedule;
pub mod store;
pub mod worker;

use generator::InvalidDistribution;
use heatmap::HeatMapRecord;
use network::FlightNetwork;
use queue::InMemoryJobQueue;
use request::{DispatchError, Distributor, SimulationRequest};
use store::{ResultStore, StoreError};
use worker::{WorkerConfig, WorkerPool};

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Params(#[from] InvalidDistribution),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Run one simulation end to end inside this process: dispatch the
/// request onto an in-memory queue, drain it with a worker pool, then
/// aggregate. Distributed deployments wire the same pieces against an
/// external queue and store instead.
pub fn run_simulation(
    network: Arc<FlightNetwork>,
    store: Arc<dyn ResultStore>,
    request: &SimulationRequest,
    config: WorkerConfig,
) -> Result<Vec<HeatMapRecord>, SimulationError> {
    let queue = Arc::new(InMemoryJobQueue::new(Duration::from_secs(60)));
    let distributor = Distributor::new(queue.clone(), Arc::clone(&store));
    distributor.dispatch(request)?;
    queue.close();

    let pool = WorkerPool::start(config, network, queue, Arc::clone(&store))?;
    pool.join();

    Ok(heatmap::aggregate(store.as_ref(), &request.id)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::TravelWindow;
    use crate::heatmap::HeatKey;
    use crate::network::{Airport, FlightEdge};
    use crate::request::SimulationId;
    use crate::store::{SimulationStatus, SqliteResultStore};
    use chrono::{DateTime, TimeDelta, Utc};

    fn network() -> Arc<FlightNetwork> {
        let airport = |code: &str| Airport {
            code: code.parse().unwrap(),
            latitude: 0.0,
            longitude: 0.0,
        };
        let edge = |origin: &str, dest: &str, weight: f64| FlightEdge {
            origin: origin.parse().unwrap(),
            dest: dest.parse().unwrap(),
            weight,
            duration: TimeDelta::minutes(150),
            capacity: Some(200),
        };
        Arc::new(
            FlightNetwork::build(
                vec![
                    airport("AAA"),
                    airport("BBB"),
                    airport("CCC"),
                    airport("DDD"),
                ],
                vec![
                    edge("AAA", "BBB", 5.0),
                    edge("AAA", "CCC", 1.0),
                    edge("BBB", "CCC", 2.0),
                    edge("CCC", "AAA", 2.0),
                ],
            )
            .unwrap(),
        )
    }

    fn request(passengers: u32) -> SimulationRequest {
        let start: DateTime<Utc> = "2020-03-01T00:00:00Z".parse().unwrap();
        SimulationRequest::new(
            SimulationId::new("sim-e2e").unwrap(),
            vec!["AAA".parse().unwrap(), "DDD".parse().unwrap()],
            passengers,
            TravelWindow {
                start,
                end: start + TimeDelta::days(3),
            },
            "analyst@example.org",
        )
        .unwrap()
    }

    #[test]
    fn end_to_end_accounts_for_every_passenger() {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Arc::new(SqliteResultStore::open_in_memory().unwrap());
        let request = request(101);

        let records = run_simulation(
            network(),
            Arc::clone(&store) as Arc<dyn ResultStore>,
            &request,
            WorkerConfig {
                workers: 3,
                dequeue_wait: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        )
        .unwrap();

        // DDD has no outbound flights: its 50-passenger share becomes an
        // origin-failure marker, AAA's 51 passengers all persist.
        assert_eq!(store.count_itineraries(&request.id).unwrap(), 51);
        let failures = store.origin_failures(&request.id).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].lost_share, 50);
        assert!(matches!(
            store.simulation_status(&request.id).unwrap(),
            SimulationStatus::Complete {
                persisted: 51,
                failed_share: 50
            }
        ));

        // Heat map is internally consistent: every edge traversal puts
        // one count on each endpoint.
        let edge_total: u64 = records
            .iter()
            .filter(|r| matches!(r.key, HeatKey::Edge { .. }))
            .map(|r| r.traversal_count)
            .sum();
        let node_total: u64 = records
            .iter()
            .filter(|r| matches!(r.key, HeatKey::Node(_)))
            .map(|r| r.traversal_count)
            .sum();
        assert_eq!(node_total, 2 * edge_total);
        assert_eq!(store.heat_map(&request.id).unwrap(), records);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let store = Arc::new(SqliteResultStore::open_in_memory().unwrap());
        let request = request(40);

        let first = run_simulation(
            network(),
            Arc::clone(&store) as Arc<dyn ResultStore>,
            &request,
            WorkerConfig {
                workers: 2,
                dequeue_wait: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        )
        .unwrap();
        let second = heatmap::aggregate(store.as_ref(), &request.id).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.heat_map(&request.id).unwrap(), second);
    }

    #[test]
    fn duplicate_dispatch_is_rejected() {
        let store = Arc::new(SqliteResultStore::open_in_memory().unwrap());
        let request = request(10);

        run_simulation(
            network(),
            Arc::clone(&store) as Arc<dyn ResultStore>,
            &request,
            WorkerConfig {
                workers: 1,
                dequeue_wait: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        )
        .unwrap();

        let result = run_simulation(
            network(),
            Arc::clone(&store) as Arc<dyn ResultStore>,
            &request,
            WorkerConfig::default(),
        );
        assert!(matches!(
            result,
            Err(SimulationError::Dispatch(DispatchError::Store(
                StoreError::DuplicateSimulation(_)
            )))
        ));
    }
}
