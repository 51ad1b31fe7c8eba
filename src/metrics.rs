//! Metrics collector (C12): per-request records, percentiles, aggregate
//! reporting, and the fixed-form text blocks that are this crate's external
//! compatibility surface: labels and numeric formats parsed by post-hoc
//! analyses must match exactly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::request::{Phase, RequestRecord, SloClass};
use crate::router::RoutingTrace;

/// Linear-interpolated percentile of an already-sorted slice. `None` if
/// `sorted` is empty. `p` is in `[0, 100]`.
pub fn percentile_sorted(sorted: &[u64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    if sorted.len() == 1 {
        return Some(sorted[0] as f64);
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo] as f64);
    }
    let frac = rank - lo as f64;
    Some(sorted[lo] as f64 * (1.0 - frac) + sorted[hi] as f64 * frac)
}

fn percentile_f64_sorted(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let frac = rank - lo as f64;
    Some(sorted[lo] * (1.0 - frac) + sorted[hi] * frac)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub n: usize,
}

impl LatencyStats {
    fn from_values(mut values: Vec<f64>) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let n = values.len();
        let mean = values.iter().sum::<f64>() / n as f64;
        Self {
            mean,
            p50: percentile_f64_sorted(&values, 50.0).unwrap_or(0.0),
            p90: percentile_f64_sorted(&values, 90.0).unwrap_or(0.0),
            p95: percentile_f64_sorted(&values, 95.0).unwrap_or(0.0),
            p99: percentile_f64_sorted(&values, 99.0).unwrap_or(0.0),
            n,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceCounters {
    pub injected: u64,
    pub completed: u64,
    pub still_queued: u64,
    pub still_running: u64,
    pub dropped_unservable: u64,
    pub preemption_count: u64,
}

impl InstanceCounters {
    /// Conservation, per instance and cluster: injected = completed + still_waiting +
    /// still_running + dropped_unservable.
    pub fn conservation_holds(&self) -> bool {
        self.injected
            == self.completed + self.still_queued + self.still_running + self.dropped_unservable
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub instance_id: String,
    pub ttft: LatencyStats,
    pub itl: LatencyStats,
    pub e2e: LatencyStats,
    pub scheduling_delay: LatencyStats,
    pub counters: InstanceCounters,
    pub rejected_requests: u64,
    pub preemption_rate: f64,
    pub cache_hit_rate: f64,
    pub kv_thrashing_rate: f64,
    pub responses_per_sec: f64,
    pub tokens_per_sec: f64,
    pub per_slo_class: HashMap<String, SloAggregate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SloAggregate {
    pub ttft: LatencyStats,
    pub e2e: LatencyStats,
}

/// Full per-request + aggregate output envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationOutput {
    /// Wall-clock instant the run was finalized, RFC 3339.
    pub run_at: String,
    pub num_requests: u64,
    pub injected_requests: u64,
    pub completed_requests: u64,
    pub still_queued: u64,
    pub still_running: u64,
    pub dropped_unservable: u64,
    pub rejected_requests: u64,
    pub requests: Vec<RequestRecord>,
    pub cluster: AggregateMetrics,
    pub per_instance: Vec<AggregateMetrics>,
    pub routing_trace: RoutingTrace,
}

/// Accumulates finalized `RequestRecord`s and per-instance counters over the
/// life of a run; produces the aggregate report at `finalize`.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    records: Vec<RequestRecord>,
    per_instance_counters: HashMap<u32, InstanceCounters>,
    rejected: u64,
    horizon_us: u64,
}

impl MetricsCollector {
    pub fn new(horizon_us: u64) -> Self {
        Self {
            records: Vec::new(),
            per_instance_counters: HashMap::new(),
            rejected: 0,
            horizon_us,
        }
    }

    pub fn record_completion(&mut self, record: RequestRecord) {
        self.records.push(record);
    }

    pub fn record_rejection(&mut self) {
        self.rejected += 1;
    }

    pub fn instance_counters_mut(&mut self, instance_id: u32) -> &mut InstanceCounters {
        self.per_instance_counters.entry(instance_id).or_default()
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }

    pub fn total_injected(&self) -> u64 {
        self.per_instance_counters.values().map(|c| c.injected).sum()
    }

    /// Builds the cluster-wide and per-instance aggregates. Truncated
    /// requests (phase queued/dropped without a completion tick, or beyond
    /// `horizon_us`) are excluded from latency distributions but still
    /// counted in conservation.
    pub fn finalize(
        &self,
        kv_cache_hit_rate: impl Fn(u32) -> f64,
        kv_thrashing_rate: impl Fn(u32) -> f64,
        preemption_counts: impl Fn(u32) -> u64,
        routing_trace: RoutingTrace,
    ) -> SimulationOutput {
        let completed: Vec<&RequestRecord> = self
            .records
            .iter()
            .filter(|r| r.phase == Phase::Finished && r.completion_tick.unwrap_or(u64::MAX) <= self.horizon_us)
            .collect();

        let cluster = self.build_aggregate("cluster".to_string(), &completed, &self.cluster_counters());

        let mut per_instance = Vec::new();
        let mut instance_ids: Vec<u32> = self.per_instance_counters.keys().copied().collect();
        instance_ids.sort_unstable();
        for id in instance_ids {
            let counters = self.per_instance_counters.get(&id).cloned().unwrap_or_default();
            let subset: Vec<&RequestRecord> = completed
                .iter()
                .filter(|r| r.handled_by == Some(id))
                .copied()
                .collect();
            let mut agg = self.build_aggregate(id.to_string(), &subset, &counters);
            agg.cache_hit_rate = kv_cache_hit_rate(id);
            agg.kv_thrashing_rate = kv_thrashing_rate(id);
            agg.preemption_rate = if counters.completed == 0 {
                0.0
            } else {
                preemption_counts(id) as f64 / counters.completed as f64
            };
            per_instance.push(agg);
        }

        let mut cluster = cluster;
        if !per_instance.is_empty() {
            cluster.cache_hit_rate =
                per_instance.iter().map(|a| a.cache_hit_rate).sum::<f64>() / per_instance.len() as f64;
            cluster.kv_thrashing_rate =
                per_instance.iter().map(|a| a.kv_thrashing_rate).sum::<f64>() / per_instance.len() as f64;
            cluster.preemption_rate =
                per_instance.iter().map(|a| a.preemption_rate).sum::<f64>() / per_instance.len() as f64;
        }

        let counters = self.cluster_counters();
        SimulationOutput {
            run_at: chrono::Utc::now().to_rfc3339(),
            num_requests: counters.injected + self.rejected,
            injected_requests: counters.injected,
            completed_requests: counters.completed,
            still_queued: counters.still_queued,
            still_running: counters.still_running,
            dropped_unservable: counters.dropped_unservable,
            rejected_requests: self.rejected,
            requests: self.records.clone(),
            cluster,
            per_instance,
            routing_trace,
        }
    }

    fn cluster_counters(&self) -> InstanceCounters {
        let mut total = InstanceCounters::default();
        for c in self.per_instance_counters.values() {
            total.injected += c.injected;
            total.completed += c.completed;
            total.still_queued += c.still_queued;
            total.still_running += c.still_running;
            total.dropped_unservable += c.dropped_unservable;
            total.preemption_count += c.preemption_count;
        }
        total
    }

    fn build_aggregate(
        &self,
        instance_id: String,
        records: &[&RequestRecord],
        counters: &InstanceCounters,
    ) -> AggregateMetrics {
        let ttft_values: Vec<f64> = records.iter().filter_map(|r| r.ttft_us.map(|v| v as f64)).collect();
        let e2e_values: Vec<f64> = records.iter().filter_map(|r| r.e2e_us.map(|v| v as f64)).collect();
        let itl_values: Vec<f64> = records.iter().filter_map(|r| r.itl_mean_us).collect();
        let sched_values: Vec<f64> = records
            .iter()
            .filter_map(|r| r.scheduling_delay_us.map(|v| v as f64))
            .collect();

        let horizon_secs = (self.horizon_us as f64 / 1_000_000.0).max(1e-9);
        let total_decode_tokens: u64 = records.iter().map(|r| r.num_decode_tokens as u64).sum();

        let mut per_slo: HashMap<String, Vec<&RequestRecord>> = HashMap::new();
        for r in records {
            per_slo.entry(slo_label(r.slo_class)).or_default().push(r);
        }
        let per_slo_class = per_slo
            .into_iter()
            .map(|(label, recs)| {
                let ttft: Vec<f64> = recs.iter().filter_map(|r| r.ttft_us.map(|v| v as f64)).collect();
                let e2e: Vec<f64> = recs.iter().filter_map(|r| r.e2e_us.map(|v| v as f64)).collect();
                (
                    label,
                    SloAggregate {
                        ttft: LatencyStats::from_values(ttft),
                        e2e: LatencyStats::from_values(e2e),
                    },
                )
            })
            .collect();

        AggregateMetrics {
            instance_id,
            ttft: LatencyStats::from_values(ttft_values),
            itl: LatencyStats::from_values(itl_values),
            e2e: LatencyStats::from_values(e2e_values),
            scheduling_delay: LatencyStats::from_values(sched_values),
            counters: counters.clone(),
            rejected_requests: self.rejected,
            preemption_rate: 0.0,
            cache_hit_rate: 1.0,
            kv_thrashing_rate: 0.0,
            responses_per_sec: records.len() as f64 / horizon_secs,
            tokens_per_sec: total_decode_tokens as f64 / horizon_secs,
            per_slo_class,
        }
    }
}

fn slo_label(slo: SloClass) -> String {
    match slo {
        SloClass::Realtime => "realtime",
        SloClass::Interactive => "interactive",
        SloClass::Batch => "batch",
        SloClass::None => "none",
    }
    .to_string()
}

/// Renders the fixed-form trace summary text block. Labels and layout
/// must match exactly: this is a parsed compatibility surface.
pub fn render_trace_summary(trace: &RoutingTrace) -> String {
    let mut out = String::new();
    out.push_str(&format!("Total Decisions: {}\n", trace.total_decisions));
    out.push_str(&format!("  Admitted: {}\n", trace.admitted));
    out.push_str(&format!("  Rejected: {}\n", trace.rejected));
    out.push_str(&format!("Unique Targets: {}\n", trace.unique_targets_used()));
    out.push_str(&format!("Mean Regret: {:.6}\n", trace.mean_regret()));
    out.push_str(&format!("Max Regret: {:.6}\n", trace.max_regret()));
    out.push_str("Target Distribution:\n");
    let mut targets: Vec<(&u32, &u64)> = trace.target_counts.iter().collect();
    targets.sort_by_key(|(id, _)| **id);
    for (id, count) in targets {
        out.push_str(&format!("  {}: {}\n", id, count));
    }
    out
}

/// Renders the fixed-form KV cache metrics block.
pub fn render_kv_cache_block(preemption_rate: f64, cache_hit_rate: f64, kv_thrashing_rate: f64) -> String {
    format!(
        "Preemption Rate: {:.6}\nCache Hit Rate: {:.6}\nKV Thrashing Rate: {:.6}\n",
        preemption_rate, cache_hit_rate, kv_thrashing_rate
    )
}

/// Renders the fixed-form per-SLO-class metrics block, emitted only when
/// more than one `slo_class` is present in the run.
pub fn render_per_slo_block(per_slo_class: &HashMap<String, SloAggregate>) -> String {
    let mut out = String::new();
    let mut classes: Vec<&String> = per_slo_class.keys().collect();
    classes.sort();
    for class in classes {
        let agg = &per_slo_class[class];
        out.push_str(&format!(
            "{} TTFT: mean={:.3} p99={:.3} (n={})\n",
            class, agg.ttft.mean, agg.ttft.p99, agg.ttft.n
        ));
        out.push_str(&format!(
            "{} E2E: mean={:.3} p99={:.3} (n={})\n",
            class, agg.e2e.mean, agg.e2e.p99, agg.e2e.n
        ));
    }
    out
}
