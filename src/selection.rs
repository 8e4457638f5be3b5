//! Realm selection – a deterministic chain of narrowing strategies.
//!
//! ```text
//! candidates ─▶ drop full realms ─▶ strategy 1 ─▶ strategy 2 ─▶ … ─▶ head
//! ```
//!
//! | Rule                                   | Effect                          |
//! |----------------------------------------|---------------------------------|
//! | strategy would leave nothing           | previous list is kept           |
//! | exactly one candidate left             | chain stops early               |
//! | every realm full / no candidates       | `None`                          |
//!
//! The chain is configured as JSON, tagged by `type`:
//!
//! ```json
//! [{ "type": "LargeLatency", "threshold_ms": 1000 },
//!  { "type": "LoadBalancing" }]
//! ```
//!
//! Given the same candidates and local parcel, the result is always the
//! same realm (`RandomTopN` included: its RNG is seeded from the inputs).

use async_trait::async_trait;
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::types::{Candidate, Parcel, ProtocolVersion, Realm};

/// Candidates whose scores are this close count as tied.
const SCORE_TOLERANCE: f64 = 1.0;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StrategyConfig {
    /// Drop candidates whose status round-trip exceeded the threshold.
    LargeLatency {
        #[serde(default = "default_latency_threshold")]
        threshold_ms: u64,
    },
    /// Prefer realms with many users near the local parcel.
    ClosePeersScore {
        #[serde(default = "default_close_distance")]
        distance: u32,
        /// Score points lost per second of latency.
        #[serde(default = "default_latency_deduction")]
        latency_deduction: f64,
        /// A lead this large picks the winner outright.
        #[serde(default = "default_definitive_threshold")]
        definitive_decision_threshold: f64,
    },
    /// Prefer realms filled close to a target fraction of capacity.
    AllPeersScore {
        #[serde(default = "default_fill_target")]
        fill_target_percentage: f64,
        #[serde(default = "default_discourage_fill")]
        discourage_fill_target_percentage: f64,
        #[serde(default = "default_latency_deduction")]
        latency_deduction: f64,
    },
    LoadBalancing,
    LowestLatency,
    RandomTopN {
        n: usize,
        #[serde(default)]
        seed: Option<u64>,
    },
}

fn default_latency_threshold() -> u64 {
    1500
}
fn default_close_distance() -> u32 {
    5
}
fn default_latency_deduction() -> f64 {
    10.0
}
fn default_definitive_threshold() -> f64 {
    20.0
}
fn default_fill_target() -> f64 {
    0.5
}
fn default_discourage_fill() -> f64 {
    0.8
}

impl StrategyConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LargeLatency { .. } => "LargeLatency",
            Self::ClosePeersScore { .. } => "ClosePeersScore",
            Self::AllPeersScore { .. } => "AllPeersScore",
            Self::LoadBalancing => "LoadBalancing",
            Self::LowestLatency => "LowestLatency",
            Self::RandomTopN { .. } => "RandomTopN",
        }
    }
}

/// `[LargeLatency, ClosePeersScore, AllPeersScore, LoadBalancing]`
pub fn default_strategies() -> Vec<StrategyConfig> {
    vec![
        StrategyConfig::LargeLatency {
            threshold_ms: default_latency_threshold(),
        },
        StrategyConfig::ClosePeersScore {
            distance: default_close_distance(),
            latency_deduction: default_latency_deduction(),
            definitive_decision_threshold: default_definitive_threshold(),
        },
        StrategyConfig::AllPeersScore {
            fill_target_percentage: default_fill_target(),
            discourage_fill_target_percentage: default_discourage_fill(),
            latency_deduction: default_latency_deduction(),
        },
        StrategyConfig::LoadBalancing,
    ]
}

// ---------------------------------------------------------------------------
// Algorithm
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionAlgorithm {
    strategies: Vec<StrategyConfig>,
}

impl Default for SelectionAlgorithm {
    fn default() -> Self {
        Self {
            strategies: default_strategies(),
        }
    }
}

impl SelectionAlgorithm {
    /// An empty chain is replaced by the default one.
    pub fn new(strategies: Vec<StrategyConfig>) -> Self {
        if strategies.is_empty() {
            return Self::default();
        }
        Self { strategies }
    }

    /// Parse a JSON strategy list; invalid input falls back to the default.
    pub fn from_json(json: &str) -> Self {
        if json.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<Vec<StrategyConfig>>(json) {
            Ok(strategies) => Self::new(strategies),
            Err(e) => {
                warn!("Invalid selection algorithm config, using default: {}", e);
                Self::default()
            }
        }
    }

    pub fn strategies(&self) -> &[StrategyConfig] {
        &self.strategies
    }

    /// Pick a realm for a user standing on `origin`.
    pub fn select(&self, candidates: &[Candidate], origin: Parcel) -> Option<Candidate> {
        let mut current: Vec<Candidate> = candidates
            .iter()
            .filter(|c| !c.is_full())
            .cloned()
            .collect();
        if current.is_empty() {
            debug!("No candidate with spare capacity");
            return None;
        }

        for strategy in &self.strategies {
            if current.len() == 1 {
                break;
            }
            let next = apply(strategy, &current, origin);
            if next.is_empty() {
                debug!("{} left no candidates, keeping previous set", strategy.name());
                continue;
            }
            debug!(
                "{} narrowed {} → {} candidates",
                strategy.name(),
                current.len(),
                next.len()
            );
            current = next;
        }

        current.into_iter().next()
    }
}

fn apply(strategy: &StrategyConfig, candidates: &[Candidate], origin: Parcel) -> Vec<Candidate> {
    match strategy {
        StrategyConfig::LargeLatency { threshold_ms } => candidates
            .iter()
            .filter(|c| c.elapsed_ms <= *threshold_ms)
            .cloned()
            .collect(),
        StrategyConfig::ClosePeersScore {
            distance,
            latency_deduction,
            definitive_decision_threshold,
        } => close_peers(
            candidates,
            origin,
            *distance,
            *latency_deduction,
            *definitive_decision_threshold,
        ),
        StrategyConfig::AllPeersScore {
            fill_target_percentage,
            discourage_fill_target_percentage,
            latency_deduction,
        } => all_peers(
            candidates,
            *fill_target_percentage,
            *discourage_fill_target_percentage,
            *latency_deduction,
        ),
        StrategyConfig::LoadBalancing => {
            let mut sorted = candidates.to_vec();
            sorted.sort_by(|a, b| {
                a.users_count
                    .cmp(&b.users_count)
                    .then_with(|| a.realm.hostname.cmp(&b.realm.hostname))
            });
            sorted
        }
        StrategyConfig::LowestLatency => {
            let mut sorted = candidates.to_vec();
            sorted.sort_by(|a, b| {
                a.elapsed_ms
                    .cmp(&b.elapsed_ms)
                    .then_with(|| a.realm.hostname.cmp(&b.realm.hostname))
            });
            sorted
        }
        StrategyConfig::RandomTopN { n, seed } => {
            let n = (*n).max(1).min(candidates.len());
            let mut top = candidates[..n].to_vec();
            let seed = seed.unwrap_or_else(|| derived_seed(candidates, origin));
            top.shuffle(&mut StdRng::seed_from_u64(seed));
            top
        }
    }
}

fn latency_penalty(candidate: &Candidate, per_second: f64) -> f64 {
    candidate.elapsed_ms as f64 / 1000.0 * per_second
}

fn by_score_desc(a: &(f64, Candidate), b: &(f64, Candidate)) -> Ordering {
    b.0.partial_cmp(&a.0)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.1.realm.hostname.cmp(&b.1.realm.hostname))
}

fn close_peers(
    candidates: &[Candidate],
    origin: Parcel,
    distance: u32,
    latency_deduction: f64,
    definitive_threshold: f64,
) -> Vec<Candidate> {
    if candidates.iter().all(|c| c.users_near(&origin, distance) == 0) {
        // Nobody nearby anywhere: no signal, leave the list alone.
        return candidates.to_vec();
    }

    let mut scored: Vec<(f64, Candidate)> = candidates
        .iter()
        .map(|c| {
            let score =
                c.users_near(&origin, distance) as f64 - latency_penalty(c, latency_deduction);
            (score, c.clone())
        })
        .collect();
    scored.sort_by(by_score_desc);

    let best = scored[0].0;
    let runner_up = scored.get(1).map(|s| s.0).unwrap_or(f64::NEG_INFINITY);
    if best - runner_up >= definitive_threshold {
        return vec![scored.swap_remove(0).1];
    }
    scored
        .into_iter()
        .filter(|(score, _)| best - score < definitive_threshold)
        .map(|(_, c)| c)
        .collect()
}

fn all_peers(
    candidates: &[Candidate],
    fill_target: f64,
    discourage_fill: f64,
    latency_deduction: f64,
) -> Vec<Candidate> {
    let busiest = candidates.iter().map(|c| c.users_count).max().unwrap_or(0);

    let mut scored: Vec<(f64, Candidate)> = candidates
        .iter()
        .map(|c| {
            let capacity = c.max_users.unwrap_or(busiest).max(1);
            let fill = c.users_count as f64 / capacity as f64;
            let mut score = 100.0 - (fill - fill_target).abs() * 100.0;
            if fill >= discourage_fill {
                score -= 50.0;
            }
            score -= latency_penalty(c, latency_deduction);
            (score, c.clone())
        })
        .collect();
    scored.sort_by(by_score_desc);

    let best = scored[0].0;
    scored
        .into_iter()
        .filter(|(score, _)| best - score <= SCORE_TOLERANCE)
        .map(|(_, c)| c)
        .collect()
}

fn derived_seed(candidates: &[Candidate], origin: Parcel) -> u64 {
    let mut input = format!("{}", origin);
    for c in candidates {
        input.push('|');
        input.push_str(&c.realm.hostname);
    }
    let digest = md5::compute(input.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(seed)
}

// ---------------------------------------------------------------------------
// Lookup helpers
// ---------------------------------------------------------------------------

/// Candidate whose realm answers to `name` (server name, layer or host).
pub fn find_candidate_by_name<'a>(
    candidates: &'a [Candidate],
    name: &str,
) -> Option<&'a Candidate> {
    candidates.iter().find(|c| c.realm.matches(name))
}

/// Liveness probe used before trusting a `v2` query-parameter realm.
#[async_trait]
pub trait RealmPinger: Send + Sync {
    async fn ping(&self, realm: &Realm) -> bool;
}

/// Pinger that trusts every realm.
pub struct AlwaysReachable;

#[async_trait]
impl RealmPinger for AlwaysReachable {
    async fn ping(&self, _realm: &Realm) -> bool {
        true
    }
}

/// Whether a query-parameter realm must be pinged before use.
pub fn requires_ping(realm: &Realm) -> bool {
    realm.protocol == ProtocolVersion::V2
}
