//! Scorer framework (C7): composable per-instance scoring with snapshot
//! freshness semantics, and the per-instance prefix tree prefix-affinity
//! scoring reads from.
//!
//! The set of scorers is closed: `ScorerKind` is a plain enum, not a
//! registry of trait objects discovered at runtime.

use std::cell::Cell;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Freshness rule for a scorer's underlying metrics.
/// `Interval(delta_us)` reuses the cached value until `now - tick_taken >=
/// delta_us`; the very first snapshot at any tick is always taken fresh,
/// since there is no previous sample to compare an age against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotPolicy {
    Immediate,
    Interval { delta_us: u64 },
}

/// An immutable scorer snapshot: `(instance_id, tick_taken, metrics)`.
#[derive(Debug, Clone)]
pub struct ScorerSnapshot {
    pub instance_id: u32,
    pub tick_taken: u64,
    pub metrics: InstanceSnapshot,
}

/// Metrics the instance runtime exposes for scoring.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InstanceSnapshot {
    pub kv_utilization: f64,
    pub queue_depth: u32,
    pub running_count: u32,
    pub in_flight_tokens: u32,
    pub cache_hit_rate: f64,
}

/// Per-scorer cache enforcing the `Interval` freshness contract. Owned by
/// the router (one per `(instance_id, scorer_name)` pair) since the router
/// is the sole reader/writer of snapshot freshness; single-threaded, so a
/// plain map suffices with no locking.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    cached: HashMap<(u32, &'static str), ScorerSnapshot>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh-enough snapshot for `(instance_id, scorer_name)`,
    /// taking a new one via `take` if the cache is empty for this key or
    /// the policy demands it.
    pub fn get_or_refresh(
        &mut self,
        instance_id: u32,
        scorer_name: &'static str,
        policy: SnapshotPolicy,
        now: u64,
        take: impl FnOnce() -> InstanceSnapshot,
    ) -> ScorerSnapshot {
        let key = (instance_id, scorer_name);
        let needs_refresh = match (self.cached.get(&key), policy) {
            (None, _) => true,
            (Some(_), SnapshotPolicy::Immediate) => true,
            (Some(existing), SnapshotPolicy::Interval { delta_us }) => {
                now.saturating_sub(existing.tick_taken) >= delta_us
            }
        };
        if needs_refresh {
            let snapshot = ScorerSnapshot {
                instance_id,
                tick_taken: now,
                metrics: take(),
            };
            self.cached.insert(key, snapshot.clone());
        }
        self.cached[&key].clone()
    }
}

impl Clone for ScorerSnapshot {
    fn clone(&self) -> Self {
        Self {
            instance_id: self.instance_id,
            tick_taken: self.tick_taken,
            metrics: self.metrics,
        }
    }
}

/// Context a scorer needs to produce a score in `[0, 1]` for one candidate
/// instance, for one routing decision.
pub struct ScoringContext<'a> {
    pub instance_id: u32,
    pub instance_ids_sorted: &'a [u32],
    pub snapshot: InstanceSnapshot,
    /// Fraction of the incoming request's prompt that matches cached
    /// prefixes at this instance, consumed by `prefix-affinity` scoring.
    pub prefix_match_fraction: f64,
}

pub trait Scorer: std::fmt::Debug {
    fn name(&self) -> &'static str;
    fn policy(&self) -> SnapshotPolicy;
    /// Score in `[0, 1]`; higher is a better target.
    fn score(&self, ctx: &ScoringContext) -> f64;
    /// Called once per routing decision with the chosen instance and the
    /// sorted candidate id list it was chosen from, after all candidates
    /// have been scored. Only `RoundRobin` needs this.
    fn on_decision(&self, _chosen_instance_id: u32, _instance_ids_sorted: &[u32]) {}
}

#[derive(Debug, Default)]
pub struct QueueDepthScorer;

impl Scorer for QueueDepthScorer {
    fn name(&self) -> &'static str {
        "queue-depth"
    }
    fn policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::Immediate
    }
    fn score(&self, ctx: &ScoringContext) -> f64 {
        1.0 / (1.0 + ctx.snapshot.queue_depth as f64)
    }
}

#[derive(Debug, Default)]
pub struct KvUtilizationScorer;

impl Scorer for KvUtilizationScorer {
    fn name(&self) -> &'static str {
        "kv-utilization"
    }
    fn policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::Immediate
    }
    fn score(&self, ctx: &ScoringContext) -> f64 {
        (1.0 - ctx.snapshot.kv_utilization).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Default)]
pub struct PrefixAffinityScorer;

impl Scorer for PrefixAffinityScorer {
    fn name(&self) -> &'static str {
        "prefix-affinity"
    }
    fn policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::Immediate
    }
    fn score(&self, ctx: &ScoringContext) -> f64 {
        ctx.prefix_match_fraction.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Default)]
pub struct LeastLoadedScorer;

impl Scorer for LeastLoadedScorer {
    fn name(&self) -> &'static str {
        "least-loaded"
    }
    fn policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::Immediate
    }
    fn score(&self, ctx: &ScoringContext) -> f64 {
        1.0 / (1.0 + ctx.snapshot.running_count as f64)
    }
}

/// Stateful rotating scorer: scores 1.0 for whichever instance currently
/// holds the rotor position, 0.0 for everyone else; `on_decision` advances
/// the rotor. Interior mutability is a plain `Cell`: execution is
/// single-threaded, so no locking is needed.
#[derive(Debug, Default)]
pub struct RoundRobinScorer {
    rotor: Cell<usize>,
}

impl Scorer for RoundRobinScorer {
    fn name(&self) -> &'static str {
        "round-robin"
    }
    fn policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::Immediate
    }
    fn score(&self, ctx: &ScoringContext) -> f64 {
        if ctx.instance_ids_sorted.is_empty() {
            return 0.0;
        }
        let rotor_idx = self.rotor.get() % ctx.instance_ids_sorted.len();
        if ctx.instance_ids_sorted[rotor_idx] == ctx.instance_id {
            1.0
        } else {
            0.0
        }
    }
    fn on_decision(&self, chosen_instance_id: u32, instance_ids_sorted: &[u32]) {
        if let Some(pos) = instance_ids_sorted.iter().position(|&id| id == chosen_instance_id) {
            self.rotor.set(pos + 1);
        }
    }
}

/// Closed set of built-in scorer kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ScorerKind {
    QueueDepth,
    KvUtilization,
    PrefixAffinity,
    LeastLoaded,
    RoundRobin,
}

impl ScorerKind {
    pub fn build(self) -> Box<dyn Scorer> {
        match self {
            ScorerKind::QueueDepth => Box::new(QueueDepthScorer),
            ScorerKind::KvUtilization => Box::new(KvUtilizationScorer),
            ScorerKind::PrefixAffinity => Box::new(PrefixAffinityScorer),
            ScorerKind::LeastLoaded => Box::new(LeastLoadedScorer),
            ScorerKind::RoundRobin => Box::new(RoundRobinScorer::default()),
        }
    }
}

/// Trie over token-id sequences, one per instance, used only to compute
/// `prefix-affinity` scores. Mutated only by the owning instance.
#[derive(Debug, Default)]
pub struct PrefixTree {
    children: HashMap<u32, PrefixTree>,
}

impl PrefixTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tokens: &[u32]) {
        let mut node = self;
        for &tok in tokens {
            node = node.children.entry(tok).or_default();
        }
    }

    /// Number of leading tokens of `tokens` that match an existing path in
    /// the tree.
    pub fn longest_match_len(&self, tokens: &[u32]) -> usize {
        let mut node = self;
        let mut matched = 0;
        for &tok in tokens {
            match node.children.get(&tok) {
                Some(next) => {
                    node = next;
                    matched += 1;
                }
                None => break,
            }
        }
        matched
    }

    /// Fraction of `tokens` that matched, in `[0, 1]`.
    pub fn match_fraction(&self, tokens: &[u32]) -> f64 {
        if tokens.is_empty() {
            return 0.0;
        }
        self.longest_match_len(tokens) as f64 / tokens.len() as f64
    }
}
