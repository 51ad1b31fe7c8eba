//! Instance (C6): thin coupling layer binding one scheduler to one KV
//! engine and one latency model, and exposing the metrics the scorer
//! framework and cluster driver need.
//!
//! A thin coupling layer: the scheduler decides *what* to run, the KV
//! engine tracks *capacity*, the latency model prices *how long*;
//! `Instance` just wires the three together per tick and keeps the
//! counters the rest of the crate reads.

use crate::clock::Clock;
use crate::error::SimError;
use crate::kv::KvCacheEngine;
use crate::latency::LatencyModelConfig;
use crate::request::{Request, RequestRecord};
use crate::scheduler::{Scheduler, SchedulerConfig, StepOutcome};
use crate::scorer::{InstanceSnapshot, PrefixTree};

#[derive(Debug)]
pub struct Instance {
    pub id: u32,
    pub scheduler: Scheduler,
    pub kv: KvCacheEngine,
    pub latency: LatencyModelConfig,
    prefix_tree: PrefixTree,

    injected: u64,
    completed: u64,
    dropped_unservable: u64,
}

impl Instance {
    pub fn new(
        id: u32,
        scheduler_config: SchedulerConfig,
        kv: KvCacheEngine,
        latency: LatencyModelConfig,
    ) -> Self {
        Self {
            id,
            scheduler: Scheduler::new(scheduler_config),
            kv,
            latency,
            prefix_tree: PrefixTree::new(),
            injected: 0,
            completed: 0,
            dropped_unservable: 0,
        }
    }

    /// Enqueue a newly routed+admitted request. Records its prefix in the
    /// instance's prefix tree for future `prefix-affinity` scoring, then
    /// hands it to the scheduler's waiting queue.
    pub fn enqueue(&mut self, request: Request) {
        self.injected += 1;
        self.prefix_tree.insert(&request.prompt_tokens);
        self.scheduler.enqueue(request);
    }

    /// Fraction of `prompt_tokens` that matches a previously-seen prefix at
    /// this instance, used by the `prefix-affinity` scorer.
    pub fn prefix_match_fraction(&self, prompt_tokens: &[u32]) -> f64 {
        self.prefix_tree.match_fraction(prompt_tokens)
    }

    /// Admit waiting requests into the running set. Returns a finalized
    /// record for each request dropped as unservable this call, so the
    /// caller (cluster driver) can hand them straight to metrics instead of
    /// losing them when the underlying `Request` is discarded.
    pub fn admit(&mut self, now: u64) -> Vec<RequestRecord> {
        let dropped = self.scheduler.admit_from_waiting(&mut self.kv, now);
        self.dropped_unservable += dropped.len() as u64;
        dropped.iter().map(RequestRecord::from_request).collect()
    }

    /// Run one scheduling step. Returns the outcome plus the finished
    /// requests (already removed from the running set and KV-released) so
    /// the caller can finalize their `RequestRecord`s.
    pub fn try_step(&mut self, clock: &mut Clock) -> Result<(StepOutcome, Vec<Request>), SimError> {
        let outcome = self.scheduler.try_step(clock, &mut self.kv, &self.latency, self.id)?;
        let mut finished = Vec::new();
        if let StepOutcome::Scheduled { ref finished_request_ids, .. } = outcome {
            for id in finished_request_ids {
                if let Some(request) = self.scheduler.take_finished(id) {
                    self.scheduler.release_finished(&mut self.kv, &request);
                    self.completed += 1;
                    finished.push(request);
                }
            }
        }
        Ok((outcome, finished))
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let total_capacity = (self.kv.total_gpu_blocks as f64).max(1.0);
        let used = total_capacity - self.kv.gpu_blocks_free() as f64;
        InstanceSnapshot {
            kv_utilization: (used / total_capacity).clamp(0.0, 1.0),
            queue_depth: self.scheduler.waiting_len() as u32,
            running_count: self.scheduler.running_len() as u32,
            in_flight_tokens: self
                .scheduler
                .running_requests()
                .iter()
                .map(|r| r.current_kv_len())
                .sum(),
            cache_hit_rate: self.kv.cache_hit_rate(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.scheduler.waiting_len() == 0 && self.scheduler.running_len() == 0
    }

    pub fn injected(&self) -> u64 {
        self.injected
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn dropped_unservable(&self) -> u64 {
        self.dropped_unservable
    }

    pub fn still_queued(&self) -> u64 {
        self.scheduler.waiting_len() as u64
    }

    pub fn still_running(&self) -> u64 {
        self.scheduler.running_len() as u64
    }

    pub fn preemption_count(&self) -> u64 {
        self.kv.preemption_count()
    }

    pub fn cache_hit_rate(&self) -> f64 {
        self.kv.cache_hit_rate()
    }

    pub fn kv_thrashing_rate(&self) -> f64 {
        self.kv.kv_thrashing_rate()
    }

    /// Finalize any requests still queued or running at the horizon, for
    /// conservation accounting: truncated requests are counted but
    /// excluded from latency distributions.
    pub fn drain_unfinished(&mut self) -> Vec<RequestRecord> {
        self.scheduler
            .waiting_requests()
            .iter()
            .chain(self.scheduler.running_requests())
            .map(RequestRecord::from_request)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvCacheEngine;
    use crate::latency::{AlphaBeta, AlphaCoeffs, BetaCoeffs, LatencyModelConfig};
    use crate::request::SloClass;
    use crate::scheduler::{PreemptionPolicy, QueueDiscipline};

    fn instance() -> Instance {
        let scheduler_config = SchedulerConfig {
            queue_discipline: QueueDiscipline::Fcfs,
            preemption_policy: PreemptionPolicy::LastAdmitted,
            max_num_running_requests: 4,
            max_num_scheduled_tokens: 64,
            max_model_len: 4096,
            chunked_prefill_threshold: 0,
        };
        let kv = KvCacheEngine::new(16, 64, 0, 10);
        let latency = LatencyModelConfig::AlphaBeta(AlphaBeta {
            alpha: AlphaCoeffs([5.0, 0.0, 0.0]),
            beta: BetaCoeffs([0.0, 1.0, 1.0]),
        });
        Instance::new(0, scheduler_config, kv, latency)
    }

    fn req(id: &str) -> Request {
        Request::new(id, 0, vec![1, 2, 3, 4], 2, SloClass::Interactive, 0, None)
    }

    #[test]
    fn enqueue_increments_injected_and_records_prefix() {
        let mut inst = instance();
        inst.enqueue(req("a"));
        assert_eq!(inst.injected(), 1);
        assert_eq!(inst.prefix_match_fraction(&[1, 2, 3, 4]), 1.0);
    }

    #[test]
    fn snapshot_reports_queue_and_kv_utilization() {
        let mut inst = instance();
        inst.enqueue(req("a"));
        let snap = inst.snapshot();
        assert_eq!(snap.queue_depth, 1);
        assert_eq!(snap.running_count, 0);
    }

    #[test]
    fn admit_then_step_runs_prefill_and_eventually_completes() {
        let mut inst = instance();
        inst.enqueue(req("a"));
        let mut clock = Clock::new();
        inst.admit(0);
        assert_eq!(inst.scheduler.running_len(), 1);
        let (outcome, finished) = inst.try_step(&mut clock).unwrap();
        assert!(matches!(outcome, StepOutcome::Scheduled { .. }));
        assert!(finished.is_empty());
    }

    #[test]
    fn is_idle_true_when_nothing_queued_or_running() {
        let inst = instance();
        assert!(inst.is_idle());
    }
}
