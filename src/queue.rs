//! Message-passing work queue with at-least-once delivery.
//!
//! Workers coordinate only through this queue and the result store. Each
//! delivery carries a lease; a job not acked before the lease deadline is
//! handed to the next caller of `dequeue`. Lease expiry is the only
//! failure-detection mechanism, there are no heartbeats.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::warn;
use thiserror::Error;

use crate::request::SimulationJob;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was closed and every job has been delivered and acked.
    #[error("queue is closed and drained")]
    Closed,
    /// The delivery's lease already expired and the job was redelivered.
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),
}

/// A leased job. Dropping it without `ack` leaves the job eligible for
/// redelivery once the lease runs out.
#[derive(Debug)]
pub struct Delivery {
    pub job: SimulationJob,
    tag: u64,
}

pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: SimulationJob) -> Result<(), QueueError>;

    /// Block until a job is available or `wait` elapses. `Ok(None)` means
    /// the wait timed out and the caller should try again;
    /// `Err(QueueError::Closed)` means no work will ever arrive again.
    fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

struct Leased {
    job: SimulationJob,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    ready: VecDeque<SimulationJob>,
    leased: HashMap<u64, Leased>,
    next_tag: u64,
    closed: bool,
    redeliveries: u64,
}

/// In-process `JobQueue` built on a mutex and condvar; the stand-in for
/// the external broker in tests and single-process runs.
pub struct InMemoryJobQueue {
    state: Mutex<State>,
    available: Condvar,
    lease: Duration,
}

impl InMemoryJobQueue {
    pub fn new(lease: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            lease,
        }
    }

    /// Stop accepting jobs. Already-queued jobs are still delivered;
    /// `dequeue` reports `Closed` once everything is delivered and acked.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.closed = true;
        self.available.notify_all();
    }

    /// Jobs delivered again after a lease expired, cumulative.
    pub fn redeliveries(&self) -> u64 {
        self.state.lock().expect("queue lock poisoned").redeliveries
    }

    fn reclaim_expired(state: &mut State, now: Instant) {
        let expired: Vec<u64> = state
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in expired {
            let lease = state.leased.remove(&tag).expect("tag just observed");
            warn!(
                "lease expired for job {}/{}, requeueing",
                lease.job.simulation_id, lease.job.origin
            );
            state.redeliveries += 1;
            state.ready.push_back(lease.job);
        }
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: SimulationJob) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.ready.push_back(job);
        self.available.notify_one();
        Ok(())
    }

    fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let give_up = Instant::now() + wait;
        let mut state = self.state.lock().expect("queue lock poisoned");
        loop {
            let now = Instant::now();
            Self::reclaim_expired(&mut state, now);

            if let Some(job) = state.ready.pop_front() {
                let tag = state.next_tag;
                state.next_tag += 1;
                state.leased.insert(
                    tag,
                    Leased {
                        job: job.clone(),
                        deadline: now + self.lease,
                    },
                );
                return Ok(Some(Delivery { job, tag }));
            }
            if state.closed && state.leased.is_empty() {
                return Err(QueueError::Closed);
            }
            if now >= give_up {
                return Ok(None);
            }

            // Sleep until new work, the give-up deadline, or the earliest
            // lease expiry, whichever comes first.
            let mut timeout = give_up - now;
            if let Some(earliest) = state.leased.values().map(|l| l.deadline).min() {
                timeout = timeout.min(earliest.saturating_duration_since(now) + Duration::from_millis(1));
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, timeout)
                .expect("queue lock poisoned");
            state = guard;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.leased.remove(&delivery.tag).is_none() {
            return Err(QueueError::UnknownDelivery(delivery.tag));
        }
        if state.closed && state.ready.is_empty() && state.leased.is_empty() {
            // Wake idle workers so they observe the drain.
            self.available.notify_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::TravelWindow;
    use crate::request::SimulationId;
    use chrono::{DateTime, TimeDelta, Utc};

    fn job(origin: &str) -> SimulationJob {
        let start: DateTime<Utc> = "2020-03-01T00:00:00Z".parse().unwrap();
        SimulationJob {
            simulation_id: SimulationId::new("sim-1").unwrap(),
            origin: origin.parse().unwrap(),
            passenger_share: 10,
            window: TravelWindow {
                start,
                end: start + TimeDelta::days(2),
            },
        }
    }

    #[test]
    fn delivers_in_fifo_order_and_acks() {
        let queue = InMemoryJobQueue::new(Duration::from_secs(30));
        queue.enqueue(job("AAA")).unwrap();
        queue.enqueue(job("BBB")).unwrap();

        let first = queue.dequeue(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(first.job.origin.as_str(), "AAA");
        queue.ack(&first).unwrap();
        let second = queue.dequeue(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(second.job.origin.as_str(), "BBB");
        queue.ack(&second).unwrap();

        assert!(queue.dequeue(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn expired_lease_redelivers() {
        let queue = InMemoryJobQueue::new(Duration::from_millis(20));
        queue.enqueue(job("AAA")).unwrap();

        let stale = queue.dequeue(Duration::from_millis(10)).unwrap().unwrap();
        // No ack: simulate a worker crash mid-job.
        let again = queue.dequeue(Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(again.job, stale.job);
        assert_eq!(queue.redeliveries(), 1);

        // The stale tag is dead, only the fresh lease can ack.
        assert!(matches!(
            queue.ack(&stale),
            Err(QueueError::UnknownDelivery(_))
        ));
        queue.ack(&again).unwrap();
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let queue = InMemoryJobQueue::new(Duration::from_secs(30));
        queue.enqueue(job("AAA")).unwrap();
        queue.close();
        assert!(matches!(queue.enqueue(job("BBB")), Err(QueueError::Closed)));

        let last = queue.dequeue(Duration::from_millis(10)).unwrap().unwrap();
        queue.ack(&last).unwrap();
        assert!(matches!(
            queue.dequeue(Duration::from_millis(10)),
            Err(QueueError::Closed)
        ));
    }
}
