//! Request entity and lifecycle record (C2).
//!
//! Pure data; all mutation goes through the owning scheduler or metrics
//! collector. `Request` is created by the workload generator
//! and destroyed after its `RequestRecord` is finalized by the metrics
//! collector.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SloClass {
    Realtime,
    Interactive,
    Batch,
    None,
}

impl SloClass {
    /// Lower rank = more urgent. Used by priority-FCFS tiebreak.
    pub fn rank(self) -> u8 {
        match self {
            SloClass::Realtime => 0,
            SloClass::Interactive => 1,
            SloClass::Batch => 2,
            SloClass::None => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    Prefilling,
    Decoding,
    Finished,
    Rejected,
    DroppedUnservable,
}

/// Immutable identity + mutable lifecycle state for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    // Immutable fields.
    pub id: String,
    pub arrival_tick: u64,
    pub prompt_tokens: Vec<u32>,
    pub output_len_target: u32,
    pub slo_class: SloClass,
    pub priority: i64,
    pub shared_prefix_id: Option<String>,

    // Mutable lifecycle fields.
    pub admitted_tick: Option<u64>,
    pub routed_tick: Option<u64>,
    pub first_scheduled_tick: Option<u64>,
    pub first_token_tick: Option<u64>,
    pub completion_tick: Option<u64>,
    pub handling_instance_id: Option<u32>,
    pub num_decode_tokens_produced: u32,
    pub preemption_count: u32,
    pub phase: Phase,

    /// Tick at which each produced output token was emitted, in order.
    pub token_emission_ticks: Vec<u64>,

    /// Prefill tokens not yet processed (supports chunked prefill).
    pub prefill_remaining: u32,

    /// Number of GPU blocks currently charged to this request (0 when not running).
    pub kv_blocks_held: u32,
    /// Whether this request's blocks currently live in the CPU tier.
    pub kv_in_cpu_tier: bool,
    /// Tick at which the GPU->CPU transfer started by a preemption settles;
    /// re-admission must wait until this tick before the reciprocal
    /// CPU->GPU transfer can start.
    pub cpu_transfer_ready_tick: Option<u64>,
}

impl Request {
    pub fn new(
        id: impl Into<String>,
        arrival_tick: u64,
        prompt_tokens: Vec<u32>,
        output_len_target: u32,
        slo_class: SloClass,
        priority: i64,
        shared_prefix_id: Option<String>,
    ) -> Self {
        let input_len = prompt_tokens.len() as u32;
        Self {
            id: id.into(),
            arrival_tick,
            prompt_tokens,
            output_len_target,
            slo_class,
            priority,
            shared_prefix_id,
            admitted_tick: None,
            routed_tick: None,
            first_scheduled_tick: None,
            first_token_tick: None,
            completion_tick: None,
            handling_instance_id: None,
            num_decode_tokens_produced: 0,
            preemption_count: 0,
            phase: Phase::Queued,
            token_emission_ticks: Vec::new(),
            prefill_remaining: input_len,
            kv_blocks_held: 0,
            kv_in_cpu_tier: false,
            cpu_transfer_ready_tick: None,
        }
    }

    pub fn input_len(&self) -> u32 {
        self.prompt_tokens.len() as u32
    }

    pub fn current_kv_len(&self) -> u32 {
        self.input_len() - self.prefill_remaining + self.num_decode_tokens_produced
    }

    pub fn is_prefill_complete(&self) -> bool {
        self.prefill_remaining == 0
    }

    pub fn is_output_complete(&self) -> bool {
        self.num_decode_tokens_produced >= self.output_len_target
    }

    /// Mark a preemption: running -> queued, increments the counter. Per
    /// INV (lifecycle monotonicity) this is the one allowed non-monotone
    /// phase transition.
    pub fn preempt(&mut self) {
        self.phase = Phase::Queued;
        self.preemption_count += 1;
    }
}

/// Serializable per-request record emitted on completion.
///
/// `scheduling_delay_us` is genuinely microseconds, not the misleading
/// `_ms` naming its source bears; every tick-valued field here is in
/// microseconds, matching the simulator's tick unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub arrival_tick: u64,
    pub first_token_tick: Option<u64>,
    pub completion_tick: Option<u64>,
    pub ttft_us: Option<u64>,
    pub itl_mean_us: Option<f64>,
    pub itl_p99_us: Option<f64>,
    pub e2e_us: Option<u64>,
    pub handled_by: Option<u32>,
    pub slo_class: SloClass,
    pub num_prefill_tokens: u32,
    pub num_decode_tokens: u32,
    pub preemption_count: u32,
    pub scheduling_delay_us: Option<u64>,
    pub phase: Phase,
}

impl RequestRecord {
    pub fn from_request(req: &Request) -> Self {
        let ttft_us = req
            .first_token_tick
            .map(|t| t.saturating_sub(req.arrival_tick));
        let e2e_us = req
            .completion_tick
            .map(|t| t.saturating_sub(req.arrival_tick));
        let scheduling_delay_us = match (req.first_scheduled_tick, req.admitted_tick) {
            (Some(sched), Some(adm)) => Some(sched.saturating_sub(adm)),
            _ => None,
        };

        let (itl_mean_us, itl_p99_us) = inter_token_latencies(&req.token_emission_ticks);

        Self {
            id: req.id.clone(),
            arrival_tick: req.arrival_tick,
            first_token_tick: req.first_token_tick,
            completion_tick: req.completion_tick,
            ttft_us,
            itl_mean_us,
            itl_p99_us,
            e2e_us,
            handled_by: req.handling_instance_id,
            slo_class: req.slo_class,
            num_prefill_tokens: req.input_len(),
            num_decode_tokens: req.num_decode_tokens_produced,
            preemption_count: req.preemption_count,
            scheduling_delay_us,
            phase: req.phase,
        }
    }
}

/// Mean and p99 of consecutive-gap inter-token latency from an ordered
/// list of emission ticks. `None` if fewer than two tokens were produced.
fn inter_token_latencies(ticks: &[u64]) -> (Option<f64>, Option<f64>) {
    if ticks.len() < 2 {
        return (None, None);
    }
    let mut gaps: Vec<u64> = ticks.windows(2).map(|w| w[1].saturating_sub(w[0])).collect();
    let mean = gaps.iter().sum::<u64>() as f64 / gaps.len() as f64;
    gaps.sort_unstable();
    let p99 = crate::metrics::percentile_sorted(&gaps, 99.0);
    (Some(mean), p99)
}
