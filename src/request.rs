//! Simulation requests, their expansion into independent jobs, and the
//! distributor that publishes jobs to the work queue.
//!
//! Requests arrive pre-validated from the intake service, but every
//! constructor here re-checks its inputs: malformed payloads are rejected
//! at this boundary instead of surfacing somewhere inside a worker.

use std::fmt;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::generator::TravelWindow;
use crate::network::AirportCode;
use crate::queue::{JobQueue, QueueError};
use crate::store::{ResultStore, SimulationStatus, StoreError};

/// Identifier assigned by the intake service, opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimulationId(String);

impl SimulationId {
    pub fn new(id: impl Into<String>) -> Result<Self, RequestError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(RequestError::EmptySimulationId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SimulationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("simulation id must not be empty")]
    EmptySimulationId,
    #[error("at least one departure airport is required")]
    EmptyOrigins,
    #[error("passenger count must be positive")]
    ZeroPassengers,
    #[error("window start must precede window end")]
    EmptyWindow,
    #[error("submitter {0:?} is not an email address")]
    BadSubmitter(String),
}

/// An accepted simulation request. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationRequest {
    pub id: SimulationId,
    pub origins: Vec<AirportCode>,
    pub passenger_count: u32,
    pub window: TravelWindow,
    pub submitted_by: String,
}

impl SimulationRequest {
    pub fn new(
        id: SimulationId,
        origins: Vec<AirportCode>,
        passenger_count: u32,
        window: TravelWindow,
        submitted_by: impl Into<String>,
    ) -> Result<Self, RequestError> {
        let mut deduped: Vec<AirportCode> = Vec::with_capacity(origins.len());
        for origin in origins {
            if !deduped.contains(&origin) {
                deduped.push(origin);
            }
        }
        if deduped.is_empty() {
            return Err(RequestError::EmptyOrigins);
        }
        if passenger_count == 0 {
            return Err(RequestError::ZeroPassengers);
        }
        if window.start >= window.end {
            return Err(RequestError::EmptyWindow);
        }
        let submitted_by = submitted_by.into();
        if !email_shaped(&submitted_by) {
            return Err(RequestError::BadSubmitter(submitted_by));
        }
        Ok(Self {
            id,
            origins: deduped,
            passenger_count,
            window,
            submitted_by,
        })
    }
}

fn email_shaped(s: &str) -> bool {
    let mut parts = s.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        _ => false,
    }
}

/// The unit of distributable work: simulate `passenger_share` passengers
/// departing `origin` within `window`, for one simulation. Self-describing
/// and independent of every other job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationJob {
    pub simulation_id: SimulationId,
    pub origin: AirportCode,
    pub passenger_share: u32,
    pub window: TravelWindow,
}

/// Split the requested passenger count evenly across the origins, handing
/// the remainder to the first jobs. Shares always sum exactly to the
/// requested count; anything else is a programming error and panics.
pub fn expand(request: &SimulationRequest) -> Vec<SimulationJob> {
    let origins = request.origins.len() as u32;
    let base = request.passenger_count / origins;
    let remainder = request.passenger_count % origins;

    let jobs: Vec<SimulationJob> = request
        .origins
        .iter()
        .enumerate()
        .map(|(i, origin)| SimulationJob {
            simulation_id: request.id.clone(),
            origin: *origin,
            passenger_share: base + u32::from((i as u32) < remainder),
            window: request.window,
        })
        .collect();

    let total: u32 = jobs.iter().map(|job| job.passenger_share).sum();
    assert_eq!(
        total, request.passenger_count,
        "job shares must sum to the requested passenger count"
    );
    jobs
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    pub simulation_id: SimulationId,
    pub jobs: usize,
    pub passengers: u32,
}

/// Fans a request out into per-origin jobs and publishes them. Does not
/// wait for completion; progress is observed through `status`.
pub struct Distributor {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ResultStore>,
}

impl Distributor {
    pub fn new(queue: Arc<dyn JobQueue>, store: Arc<dyn ResultStore>) -> Self {
        Self { queue, store }
    }

    /// Record the simulation and enqueue one job per origin. A simulation
    /// id that was already dispatched fails loudly before any job is
    /// published.
    pub fn dispatch(&self, request: &SimulationRequest) -> Result<DispatchSummary, DispatchError> {
        let jobs = expand(request);
        self.store.record_simulation(request, jobs.len())?;
        for job in &jobs {
            debug!(
                "enqueueing job {}/{} ({} passengers)",
                job.simulation_id, job.origin, job.passenger_share
            );
            self.queue.enqueue(job.clone())?;
        }
        info!(
            "dispatched simulation {}: {} jobs, {} passengers",
            request.id,
            jobs.len(),
            request.passenger_count
        );
        Ok(DispatchSummary {
            simulation_id: request.id.clone(),
            jobs: jobs.len(),
            passengers: request.passenger_count,
        })
    }

    /// Completion is observed indirectly, by comparing persisted
    /// itineraries and failure markers against the expected total.
    pub fn status(&self, simulation: &SimulationId) -> Result<SimulationStatus, DispatchError> {
        Ok(self.store.simulation_status(simulation)?)
    }
}
