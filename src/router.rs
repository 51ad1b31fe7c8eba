//! Cluster-level router (C8): composes weighted scorers into one routing
//! decision per request, and keeps the trace the metrics collector reports
//! on (target distribution and regret figures).
//!
//! Single-threaded by design: `SnapshotCache` and `RoutingTrace` are owned
//! outright by the router, no interior mutability needed beyond what the
//! cache itself uses.

use std::collections::HashMap;

use crate::instance::Instance;
use crate::request::Request;
use crate::scorer::{Scorer, ScorerKind, ScoringContext, SnapshotCache, SnapshotPolicy};

/// One weighted scorer entry: `(scorer, weight)`. Negative weights are
/// rejected at config validation time, not here. `policy` is the scorer's
/// own default unless the run config overrides it by name.
pub struct WeightedScorer {
    pub scorer: Box<dyn Scorer>,
    pub weight: f64,
    pub policy: SnapshotPolicy,
}

pub struct Router {
    scorers: Vec<WeightedScorer>,
    cache: SnapshotCache,
    trace: RoutingTrace,
}

impl Router {
    pub fn new(weights: &[(ScorerKind, f64)]) -> Self {
        Self::with_snapshot_overrides(weights, &HashMap::new())
    }

    /// Builds a router whose per-scorer snapshot freshness can be
    /// overridden by name via `overrides`; scorers not named there keep
    /// their own built-in policy.
    pub fn with_snapshot_overrides(
        weights: &[(ScorerKind, f64)],
        overrides: &HashMap<String, SnapshotPolicy>,
    ) -> Self {
        let scorers = weights
            .iter()
            .map(|(kind, weight)| {
                let scorer = kind.build();
                let policy = overrides.get(scorer.name()).copied().unwrap_or_else(|| scorer.policy());
                WeightedScorer { scorer, weight: *weight, policy }
            })
            .collect();
        Self {
            scorers,
            cache: SnapshotCache::new(),
            trace: RoutingTrace::default(),
        }
    }

    /// Pick the best target among `instances` for `request` at tick `now`.
    /// Ties break on the lowest `instance_id` (a deterministic argmax
    /// tiebreak). Returns `None` only when `instances` is empty.
    pub fn route(&mut self, request: &Request, instances: &[&Instance], now: u64) -> Option<u32> {
        if instances.is_empty() {
            return None;
        }
        let mut instance_ids: Vec<u32> = instances.iter().map(|i| i.id).collect();
        instance_ids.sort_unstable();

        let mut best: Option<(u32, f64)> = None;
        let mut scored: HashMap<u32, f64> = HashMap::new();
        for instance in instances {
            let mut total_weight = 0.0;
            let mut total_score = 0.0;
            for entry in &self.scorers {
                let snapshot = self.cache.get_or_refresh(
                    instance.id,
                    entry.scorer.name(),
                    entry.policy,
                    now,
                    || instance.snapshot(),
                );
                let ctx = ScoringContext {
                    instance_id: instance.id,
                    instance_ids_sorted: &instance_ids,
                    snapshot: snapshot.metrics,
                    prefix_match_fraction: instance.prefix_match_fraction(&request.prompt_tokens),
                };
                total_score += entry.weight * entry.scorer.score(&ctx);
                total_weight += entry.weight;
            }
            let combined = if total_weight > 0.0 {
                total_score / total_weight
            } else {
                0.0
            };
            scored.insert(instance.id, combined);
            best = match best {
                None => Some((instance.id, combined)),
                Some((best_id, best_score)) => {
                    if combined > best_score || (combined == best_score && instance.id < best_id) {
                        Some((instance.id, combined))
                    } else {
                        Some((best_id, best_score))
                    }
                }
            };
        }

        let (chosen, chosen_score) = best?;
        for entry in &self.scorers {
            entry.scorer.on_decision(chosen, &instance_ids);
        }
        self.trace.record_decision(chosen, chosen_score, &scored);
        tracing::debug!(chosen, chosen_score, candidates = ?scored, "routed request");
        Some(chosen)
    }

    pub fn trace(&self) -> &RoutingTrace {
        &self.trace
    }

    pub fn record_rejection(&mut self) {
        self.trace.rejected += 1;
    }
}

/// Accumulated routing statistics over a run. Regret for a decision is
/// `best_score - chosen_score` across the candidate set, zero when the
/// router picked the top-scoring instance, which it always does by
/// construction, so regret here only departs from zero when a tie was
/// broken by instance id away from a strictly-higher-scoring alternative.
#[derive(Debug, Clone, Default)]
pub struct RoutingTrace {
    pub total_decisions: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub target_counts: HashMap<u32, u64>,
    regret_sum: f64,
    regret_max: f64,
}

impl RoutingTrace {
    fn record_decision(&mut self, chosen: u32, chosen_score: f64, scored: &HashMap<u32, f64>) {
        self.total_decisions += 1;
        self.admitted += 1;
        *self.target_counts.entry(chosen).or_insert(0) += 1;

        let best_score = scored.values().cloned().fold(f64::MIN, f64::max);
        let regret = (best_score - chosen_score).max(0.0);
        self.regret_sum += regret;
        self.regret_max = self.regret_max.max(regret);
    }

    pub fn unique_targets_used(&self) -> usize {
        self.target_counts.len()
    }

    pub fn mean_regret(&self) -> f64 {
        if self.total_decisions == 0 {
            0.0
        } else {
            self.regret_sum / self.total_decisions as f64
        }
    }

    pub fn max_regret(&self) -> f64 {
        self.regret_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvCacheEngine;
    use crate::latency::{AlphaBeta, AlphaCoeffs, BetaCoeffs, LatencyModelConfig};
    use crate::request::SloClass;
    use crate::scheduler::{PreemptionPolicy, QueueDiscipline, SchedulerConfig};

    fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            queue_discipline: QueueDiscipline::Fcfs,
            preemption_policy: PreemptionPolicy::LastAdmitted,
            max_num_running_requests: 4,
            max_num_scheduled_tokens: 64,
            max_model_len: 4096,
            chunked_prefill_threshold: 0,
        }
    }

    fn latency() -> LatencyModelConfig {
        LatencyModelConfig::AlphaBeta(AlphaBeta {
            alpha: AlphaCoeffs([5.0, 0.0, 0.0]),
            beta: BetaCoeffs([0.0, 1.0, 1.0]),
        })
    }

    fn instance(id: u32) -> Instance {
        Instance::new(id, scheduler_config(), KvCacheEngine::new(16, 64, 0, 10), latency())
    }

    fn req() -> Request {
        Request::new("r1", 0, vec![1, 2, 3], 4, SloClass::Interactive, 0, None)
    }

    #[test]
    fn routes_to_least_loaded_instance() {
        let mut busy = instance(0);
        busy.enqueue(req());
        busy.enqueue(Request::new("r2", 0, vec![1], 1, SloClass::Interactive, 0, None));
        let idle = instance(1);

        let mut router = Router::new(&[(ScorerKind::QueueDepth, 1.0)]);
        let chosen = router.route(&req(), &[&busy, &idle], 0);
        assert_eq!(chosen, Some(1));
    }

    #[test]
    fn ties_break_on_lowest_instance_id() {
        let a = instance(5);
        let b = instance(2);
        let mut router = Router::new(&[(ScorerKind::QueueDepth, 1.0)]);
        let chosen = router.route(&req(), &[&a, &b], 0);
        assert_eq!(chosen, Some(2));
    }

    #[test]
    fn empty_instance_set_routes_to_none() {
        let mut router = Router::new(&[(ScorerKind::QueueDepth, 1.0)]);
        assert_eq!(router.route(&req(), &[], 0), None);
    }

    #[test]
    fn round_robin_rotates_across_successive_decisions() {
        let a = instance(0);
        let b = instance(1);
        let mut router = Router::new(&[(ScorerKind::RoundRobin, 1.0)]);
        let first = router.route(&req(), &[&a, &b], 0).unwrap();
        let second = router.route(&req(), &[&a, &b], 0).unwrap();
        let third = router.route(&req(), &[&a, &b], 0).unwrap();
        assert_ne!(first, second, "round-robin must alternate targets");
        assert_eq!(first, third, "round-robin must cycle back after a full rotation");
    }

    #[test]
    fn trace_counts_decisions_and_targets() {
        let idle = instance(0);
        let mut router = Router::new(&[(ScorerKind::QueueDepth, 1.0)]);
        router.route(&req(), &[&idle], 0);
        router.route(&req(), &[&idle], 0);
        assert_eq!(router.trace().total_decisions, 2);
        assert_eq!(router.trace().target_counts[&0], 2);
        assert_eq!(router.trace().unique_targets_used(), 1);
    }
}
