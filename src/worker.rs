//! Long-lived worker loop: pull a job, generate its passenger share,
//! persist each itinerary, ack.
//!
//! Workers share nothing but the read-only network, the queue, and the
//! store. A worker that dies mid-job simply never acks; the lease expires
//! and another worker repeats the job. Seeds and record ids are derived
//! from (simulation, origin, sequence), so the repeat writes identical
//! records and the store's key constraint absorbs them.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use thiserror::Error;

use crate::generator::{GenerateError, GeneratorParams, InvalidDistribution, ItineraryGenerator};
use crate::network::{AirportCode, FlightNetwork};
use crate::queue::{JobQueue, QueueError};
use crate::request::{SimulationId, SimulationJob};
use crate::store::{ItineraryRecord, OriginFailure, ResultStore, StoreError};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    /// Write re-attempts within one job attempt before the job is left
    /// for lease-timeout redelivery.
    pub max_write_retries: u32,
    pub dequeue_wait: Duration,
    pub generator: GeneratorParams,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_write_retries: 3,
            dequeue_wait: Duration::from_millis(500),
            generator: GeneratorParams::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("store write failed after {attempts} attempts: {source}")]
    StoreGaveUp { attempts: u32, source: StoreError },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every passenger in the share was generated; `duplicates` already
    /// existed from an earlier delivery of the same job.
    Persisted { fresh: u32, duplicates: u32 },
    /// Schedule gap at the origin; the lost share was recorded as a
    /// partial-failure marker. Not retried.
    OriginFailed,
}

/// Execute one job attempt. Pure apart from writes to `store`; safe to
/// repeat after a redelivery.
pub fn process_job(
    generator: &ItineraryGenerator,
    network: &FlightNetwork,
    store: &dyn ResultStore,
    job: &SimulationJob,
    max_write_retries: u32,
) -> Result<JobOutcome, WorkerError> {
    let mut fresh = 0u32;
    let mut duplicates = 0u32;
    for sequence_id in 0..job.passenger_share {
        let seed = itinerary_seed(&job.simulation_id, job.origin, sequence_id);
        match generator.generate(network, job.origin, &job.window, seed) {
            Ok(itinerary) => {
                let record = ItineraryRecord {
                    id: ItineraryRecord::record_id(&job.simulation_id, job.origin, sequence_id),
                    simulation_id: job.simulation_id.clone(),
                    origin: job.origin,
                    sequence_id,
                    legs: itinerary.legs,
                    generated_at: Utc::now(),
                };
                if persist_with_retry(store, &record, max_write_retries)? {
                    fresh += 1;
                } else {
                    duplicates += 1;
                }
            }
            Err(err @ (GenerateError::UnknownOrigin(_) | GenerateError::UnreachableOrigin(_))) => {
                warn!(
                    "job {}/{}: {err}; marking origin failed",
                    job.simulation_id, job.origin
                );
                store.record_origin_failure(&OriginFailure {
                    simulation_id: job.simulation_id.clone(),
                    origin: job.origin,
                    lost_share: job.passenger_share - sequence_id,
                    reason: err.to_string(),
                })?;
                return Ok(JobOutcome::OriginFailed);
            }
        }
    }
    Ok(JobOutcome::Persisted { fresh, duplicates })
}

/// Deterministic per-passenger seed. Redelivered jobs regenerate the
/// exact itineraries of the first attempt.
fn itinerary_seed(simulation: &SimulationId, origin: AirportCode, sequence_id: u32) -> u64 {
    let mut hasher = DefaultHasher::new();
    simulation.as_str().hash(&mut hasher);
    origin.as_str().hash(&mut hasher);
    sequence_id.hash(&mut hasher);
    hasher.finish()
}

fn persist_with_retry(
    store: &dyn ResultStore,
    record: &ItineraryRecord,
    max_retries: u32,
) -> Result<bool, WorkerError> {
    let mut attempts = 0;
    loop {
        match store.insert_itinerary(record) {
            Ok(fresh) => return Ok(fresh),
            Err(source) => {
                attempts += 1;
                if attempts > max_retries {
                    return Err(WorkerError::StoreGaveUp { attempts, source });
                }
                warn!("write of {} failed (attempt {attempts}): {source}", record.id);
            }
        }
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.workers` threads against the shared queue and store.
    /// The pool runs until the queue reports closed-and-drained.
    pub fn start(
        config: WorkerConfig,
        network: Arc<FlightNetwork>,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ResultStore>,
    ) -> Result<Self, InvalidDistribution> {
        let generator = Arc::new(ItineraryGenerator::new(config.generator.clone())?);
        let mut handles = Vec::new();
        for worker_id in 0..config.workers.max(1) {
            let generator = Arc::clone(&generator);
            let network = Arc::clone(&network);
            let queue = Arc::clone(&queue);
            let store = Arc::clone(&store);
            let wait = config.dequeue_wait;
            let retries = config.max_write_retries;
            let handle = thread::Builder::new()
                .name(format!("flightflow-worker-{worker_id}"))
                .spawn(move || {
                    worker_loop(worker_id, wait, retries, generator, network, queue, store)
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        Ok(Self { handles })
    }

    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(
    worker_id: usize,
    wait: Duration,
    retries: u32,
    generator: Arc<ItineraryGenerator>,
    network: Arc<FlightNetwork>,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ResultStore>,
) {
    loop {
        match queue.dequeue(wait) {
            Ok(Some(delivery)) => {
                let job = &delivery.job;
                match process_job(&generator, &network, store.as_ref(), job, retries) {
                    Ok(outcome) => {
                        if let Err(err) = queue.ack(&delivery) {
                            // Lease expired mid-job; the redelivered copy
                            // writes the same ids, so nothing is lost.
                            warn!(
                                "worker {worker_id}: ack rejected for {}/{}: {err}",
                                job.simulation_id, job.origin
                            );
                        }
                        info!(
                            "worker {worker_id}: finished {}/{}: {outcome:?}",
                            job.simulation_id, job.origin
                        );
                    }
                    Err(err) => {
                        warn!(
                            "worker {worker_id}: job {}/{} failed, left for redelivery: {err}",
                            job.simulation_id, job.origin
                        );
                    }
                }
            }
            Ok(None) => continue,
            Err(QueueError::Closed) => break,
            Err(err) => {
                error!("worker {worker_id}: queue error: {err}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::TravelWindow;
    use crate::network::{Airport, FlightEdge};
    use crate::queue::InMemoryJobQueue;
    use crate::store::{SimulationStatus, SqliteResultStore};
    use chrono::{DateTime, TimeDelta};

    fn network() -> FlightNetwork {
        let airport = |code: &str| Airport {
            code: code.parse().unwrap(),
            latitude: 0.0,
            longitude: 0.0,
        };
        let edge = |origin: &str, dest: &str| FlightEdge {
            origin: origin.parse().unwrap(),
            dest: dest.parse().unwrap(),
            weight: 1.0,
            duration: TimeDelta::minutes(120),
            capacity: Some(180),
        };
        FlightNetwork::build(
            vec![airport("AAA"), airport("BBB"), airport("CCC")],
            vec![edge("AAA", "BBB"), edge("BBB", "CCC")],
        )
        .unwrap()
    }

    fn job(origin: &str, share: u32) -> SimulationJob {
        let start: DateTime<chrono::Utc> = "2020-03-01T00:00:00Z".parse().unwrap();
        SimulationJob {
            simulation_id: SimulationId::new("sim-1").unwrap(),
            origin: origin.parse().unwrap(),
            passenger_share: share,
            window: TravelWindow {
                start,
                end: start + TimeDelta::days(2),
            },
        }
    }

    fn generator() -> ItineraryGenerator {
        ItineraryGenerator::new(GeneratorParams::default()).unwrap()
    }

    #[test]
    fn redelivered_job_does_not_inflate_counts() {
        let network = network();
        let store = SqliteResultStore::open_in_memory().unwrap();
        let gen = generator();
        let job = job("AAA", 5);

        let first = process_job(&gen, &network, &store, &job, 3).unwrap();
        assert_eq!(
            first,
            JobOutcome::Persisted {
                fresh: 5,
                duplicates: 0
            }
        );

        // Second delivery of the same job, as after a lease timeout.
        let second = process_job(&gen, &network, &store, &job, 3).unwrap();
        assert_eq!(
            second,
            JobOutcome::Persisted {
                fresh: 0,
                duplicates: 5
            }
        );
        assert_eq!(
            store.count_itineraries(&job.simulation_id).unwrap(),
            5,
            "exactly one record per logical passenger"
        );
    }

    #[test]
    fn schedule_gap_marks_origin_failed() {
        let network = network();
        let store = SqliteResultStore::open_in_memory().unwrap();
        // CCC has no outbound edges.
        let job = job("CCC", 4);

        let outcome = process_job(&generator(), &network, &store, &job, 3).unwrap();
        assert_eq!(outcome, JobOutcome::OriginFailed);

        let failures = store.origin_failures(&job.simulation_id).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].origin.as_str(), "CCC");
        assert_eq!(failures[0].lost_share, 4);
        assert_eq!(store.count_itineraries(&job.simulation_id).unwrap(), 0);
    }

    #[test]
    fn pool_drains_queue_and_completes_simulation() {
        let network = Arc::new(network());
        let store = Arc::new(SqliteResultStore::open_in_memory().unwrap());
        let queue = Arc::new(InMemoryJobQueue::new(Duration::from_secs(30)));

        let start: DateTime<chrono::Utc> = "2020-03-01T00:00:00Z".parse().unwrap();
        let request = crate::request::SimulationRequest::new(
            SimulationId::new("sim-1").unwrap(),
            vec!["AAA".parse().unwrap(), "BBB".parse().unwrap()],
            21,
            TravelWindow {
                start,
                end: start + TimeDelta::days(2),
            },
            "analyst@example.org",
        )
        .unwrap();
        store.record_simulation(&request, 2).unwrap();
        queue.enqueue(job("AAA", 11)).unwrap();
        queue.enqueue(job("BBB", 10)).unwrap();
        queue.close();

        let pool = WorkerPool::start(
            WorkerConfig {
                workers: 3,
                dequeue_wait: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
            network,
            queue,
            Arc::clone(&store) as Arc<dyn ResultStore>,
        )
        .unwrap();
        pool.join();

        assert_eq!(store.count_itineraries(&request.id).unwrap(), 21);
        assert!(matches!(
            store.simulation_status(&request.id).unwrap(),
            SimulationStatus::Complete {
                persisted: 21,
                failed_share: 0
            }
        ));
    }
}
