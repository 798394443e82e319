//! Simulates a single passenger's journey through the flight network.
//!
//! At each airport the passenger picks an outbound edge with probability
//! proportional to its weight, commits to it only if it fits the remaining
//! time budget, and may end the journey there according to a tunable
//! leg-count distribution. Generation is deterministic for a fixed seed,
//! network, and parameter set.

use chrono::{DateTime, TimeDelta, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::{AirportCode, FlightEdge, FlightNetwork};

/// The date range a simulated passenger travels within. All itinerary
/// offsets are minutes relative to `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TravelWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TravelWindow {
    pub fn length(&self) -> TimeDelta {
        self.end - self.start
    }
}

/// One flown leg. Offsets and durations are in whole minutes relative to
/// the window start, which keeps the persisted form trivially portable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub from: AirportCode,
    pub to: AirportCode,
    pub departure_offset: i64,
    pub duration: i64,
}

/// An ordered sequence of legs flown by one simulated passenger. Zero legs
/// is a valid outcome: the passenger never found a departure that fit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Itinerary {
    pub origin: AirportCode,
    pub legs: Vec<Leg>,
}

impl Itinerary {
    /// Where the passenger ended up.
    pub fn terminal(&self) -> AirportCode {
        self.legs.last().map(|leg| leg.to).unwrap_or(self.origin)
    }
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("origin {0} is not in the network")]
    UnknownOrigin(AirportCode),
    #[error("origin {0} has no outbound flights")]
    UnreachableOrigin(AirportCode),
}

#[derive(Debug, Error)]
#[error("invalid leg distribution: {0}")]
pub struct InvalidDistribution(pub &'static str);

/// Tunables for itinerary generation.
///
/// `leg_distribution[n]` is the probability that a journey is exactly `n`
/// legs long; index 0 must be zero. The default table was fitted against
/// observed journey lengths in historical itinerary data, and implies a
/// maximum of `len - 1` legs.
#[derive(Debug, Clone)]
pub struct GeneratorParams {
    pub leg_distribution: Vec<f64>,
    /// Mean connection time between consecutive legs.
    pub mean_layover: TimeDelta,
    /// Drop candidate destinations that move the passenger back towards
    /// the journey origin. Long-haul passengers rarely double back.
    pub prune_backtracking: bool,
}

impl Default for GeneratorParams {
    fn default() -> Self {
        Self {
            leg_distribution: vec![
                0.0, 0.6772732, 0.2997706, 0.0211374, 0.0016254, 0.0001632, 0.0000215, 0.0000072,
                0.0000012, 0.0000002, 0.0000001,
            ],
            mean_layover: TimeDelta::hours(2),
            prune_backtracking: true,
        }
    }
}

pub struct ItineraryGenerator {
    params: GeneratorParams,
    /// `terminal[n]` = probability the journey ends at leg `n` given the
    /// passenger reached leg `n`, derived by conditioning the leg-count
    /// distribution on the legs already flown.
    terminal: Vec<f64>,
}

impl ItineraryGenerator {
    pub fn new(params: GeneratorParams) -> Result<Self, InvalidDistribution> {
        let dist = &params.leg_distribution;
        if dist.len() < 2 {
            return Err(InvalidDistribution("needs at least one positive leg count"));
        }
        if dist[0] != 0.0 {
            return Err(InvalidDistribution("index 0 must be zero"));
        }
        if dist.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(InvalidDistribution("probabilities must be in [0, 1]"));
        }
        let total: f64 = dist.iter().sum();
        if !(total > 0.0 && total <= 1.0 + 1e-9) {
            return Err(InvalidDistribution("probabilities must sum to at most 1"));
        }

        let mut terminal = vec![0.0; dist.len()];
        let mut reached = 1.0;
        for n in 1..dist.len() {
            terminal[n] = if reached > f64::EPSILON {
                (dist[n] / reached).min(1.0)
            } else {
                1.0
            };
            reached -= dist[n];
        }

        Ok(Self { params, terminal })
    }

    pub fn max_legs(&self) -> usize {
        self.params.leg_distribution.len() - 1
    }

    /// Simulate one passenger departing from `origin` inside `window`.
    ///
    /// Fails only when the origin is missing from the network or has no
    /// outbound edges at all (a schedule gap, not a transient fault). An
    /// itinerary that never leaves the origin is an `Ok` outcome.
    pub fn generate(
        &self,
        network: &FlightNetwork,
        origin: AirportCode,
        window: &TravelWindow,
        seed: u64,
    ) -> Result<Itinerary, GenerateError> {
        if !network.contains(origin) {
            return Err(GenerateError::UnknownOrigin(origin));
        }
        if network.neighbors(origin).is_empty() {
            return Err(GenerateError::UnreachableOrigin(origin));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let budget = window.length().num_minutes().max(0);
        let mut legs: Vec<Leg> = Vec::new();
        let mut here = origin;
        // Minutes since the window start; the passenger is ready to fly
        // connections from this point on.
        let mut clock: i64 = 0;

        while legs.len() < self.max_legs() {
            let first_leg = legs.is_empty();
            // Connections include a drawn layover; the first departure is
            // placed inside the window after the edge is known.
            let depart = if first_leg {
                0
            } else {
                clock + self.draw_layover(&mut rng)
            };

            let candidates: Vec<&FlightEdge> = network
                .neighbors(here)
                .iter()
                .filter(|e| depart + e.duration.num_minutes() <= budget)
                .filter(|e| !self.params.prune_backtracking || outbound(network, origin, here, e))
                .collect();
            if candidates.is_empty() {
                break;
            }

            let Some((edge, journey_ends)) =
                self.choose_edge(&candidates, legs.len() + 1, &mut rng)
            else {
                // Probability mass exhausted without a pick: the passenger
                // stays put, as in the original flow calculator.
                break;
            };

            let departure_offset = if first_leg {
                // Drawn uniformly over the slack so first legs spread
                // across the whole travel window.
                let slack = budget - edge.duration.num_minutes();
                if slack > 0 {
                    rng.random_range(0..=slack)
                } else {
                    0
                }
            } else {
                depart
            };

            let duration = edge.duration.num_minutes();
            legs.push(Leg {
                from: here,
                to: edge.dest,
                departure_offset,
                duration,
            });
            clock = departure_offset + duration;
            here = edge.dest;
            if journey_ends {
                break;
            }
        }

        Ok(Itinerary { origin, legs })
    }

    /// Weighted pick over `candidates`, resolved edge by edge the way the
    /// original flow calculator walks its flight list: each edge claims a
    /// share of the remaining probability mass, split between continuing
    /// the journey there and ending it there.
    fn choose_edge<'a>(
        &self,
        candidates: &[&'a FlightEdge],
        leg_number: usize,
        rng: &mut StdRng,
    ) -> Option<(&'a FlightEdge, bool)> {
        let total: f64 = candidates.iter().map(|e| e.weight).sum();
        let terminal_p = self
            .terminal
            .get(leg_number)
            .copied()
            .unwrap_or(1.0);

        let mut inflow_sofar: f64 = 0.0;
        for edge in candidates {
            let inflow = edge.weight / total;
            let headroom = (1.0 - inflow_sofar).max(f64::EPSILON);
            let continue_on = inflow * (1.0 - terminal_p) / headroom;
            let stop_here = inflow * terminal_p / headroom;
            let draw: f64 = rng.random();
            if draw <= continue_on {
                return Some((edge, false));
            }
            if draw > 1.0 - stop_here {
                return Some((edge, true));
            }
            inflow_sofar += inflow;
        }
        None
    }

    fn draw_layover(&self, rng: &mut StdRng) -> i64 {
        let mean = self.params.mean_layover.num_minutes().max(1) as f64;
        let u: f64 = rng.random();
        (-mean * (1.0 - u).ln()).round() as i64
    }
}

/// Keep a candidate only if it does not land closer to the journey origin
/// than the current airport already is. Ties (including degenerate
/// coordinates) are kept.
fn outbound(
    network: &FlightNetwork,
    journey_origin: AirportCode,
    here: AirportCode,
    edge: &FlightEdge,
) -> bool {
    match (
        network.distance_km(journey_origin, edge.dest),
        network.distance_km(here, edge.dest),
    ) {
        (Some(from_origin), Some(from_here)) => from_origin >= from_here,
        _ => true,
    }
}
