//! Per-instance scheduler (C5): waiting queue, running batch, state machine.
//!
//! Owns no clock and no KV engine of its own; those are passed in by the
//! owning `Instance` (C6) on each call: the scheduler decides *what* to
//! run, the instance supplies *with what*.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Event, EventKind};
use crate::error::SimError;
use crate::kv::{AllocOutcome, KvCacheEngine};
use crate::latency::{BatchShape, LatencyModel};
use crate::request::{Phase, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDiscipline {
    Fcfs,
    PriorityFcfs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionPolicy {
    LastAdmitted,
    LowestPriority,
    MostBlocksHeld,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub queue_discipline: QueueDiscipline,
    pub preemption_policy: PreemptionPolicy,
    pub max_num_running_requests: u32,
    pub max_num_scheduled_tokens: u32,
    pub max_model_len: u32,
    /// 0 disables chunked prefill: a request's entire remaining prefill is
    /// scheduled in one step (subject to the joint token budget).
    pub chunked_prefill_threshold: u32,
}

/// Outcome of one `try_step`. `Empty` means there was no admissible work,
/// which suspends the scheduler (the caller simply doesn't schedule a
/// `StepStart` until the next inbound event) rather than erroring.
#[derive(Debug)]
pub enum StepOutcome {
    Empty,
    Scheduled {
        duration_us: u64,
        finished_request_ids: Vec<String>,
        token_emitting_request_ids: Vec<String>,
    },
}

#[derive(Debug)]
pub struct Scheduler {
    pub config: SchedulerConfig,
    waiting: Vec<Request>,
    running: Vec<Request>,
    /// Requests preempted during the step currently being formed. Cleared
    /// at the start of every `try_step`. Prevents a request preempted in
    /// tick t from being re-admitted in that same step.
    preempted_this_step: HashSet<String>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            waiting: Vec::new(),
            running: Vec::new(),
            preempted_this_step: HashSet::new(),
        }
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn enqueue(&mut self, request: Request) {
        self.waiting.push(request);
        self.sort_waiting();
    }

    fn sort_waiting(&mut self) {
        match self.config.queue_discipline {
            QueueDiscipline::Fcfs => {
                self.waiting.sort_by_key(|r| (r.arrival_tick, r.id.clone()));
            }
            QueueDiscipline::PriorityFcfs => {
                self.waiting
                    .sort_by_key(|r| (r.slo_class.rank(), r.priority, r.arrival_tick, r.id.clone()));
            }
        }
    }

    /// Admit requests from the front of the waiting queue into the running
    /// set, bounded by `max_num_running_requests` and the KV engine's
    /// admission classification. Requests whose peak KV demand can never
    /// fit are finished immediately with `phase = dropped_unservable`;
    /// requests that merely can't fit *right now* stay waiting.
    ///
    /// Returns the requests dropped as unservable this call, each already
    /// finalized with `phase = DroppedUnservable` and a `completion_tick`
    /// (the instance forwards these straight to metrics/cluster for record
    /// finalization rather than losing them on drop).
    pub fn admit_from_waiting(&mut self, kv: &mut KvCacheEngine, now: u64) -> Vec<Request> {
        let mut dropped = Vec::new();
        let mut still_waiting = Vec::new();

        for mut request in self.waiting.drain(..) {
            if self.running.len() as u32 >= self.config.max_num_running_requests {
                still_waiting.push(request);
                continue;
            }
            if self.preempted_this_step.contains(&request.id) {
                still_waiting.push(request);
                continue;
            }
            if let Some(ready) = request.cpu_transfer_ready_tick {
                if now < ready {
                    still_waiting.push(request);
                    continue;
                }
            }

            let capped_output = request.output_len_target.min(
                self.config.max_model_len.saturating_sub(request.input_len()),
            );
            let peak_tokens = request.input_len() + capped_output;
            if kv.peak_demand_blocks(peak_tokens) > kv.total_gpu_blocks {
                request.phase = Phase::DroppedUnservable;
                request.completion_tick = Some(now);
                dropped.push(request);
                continue;
            }

            let first_chunk = self.first_chunk_tokens(&request);
            let needed_blocks = kv.blocks_for_tokens(first_chunk.max(1));
            match kv.try_allocate(&request, needed_blocks) {
                AllocOutcome::Ok => {
                    if request.first_scheduled_tick.is_none() {
                        request.first_scheduled_tick = Some(now);
                    }
                    request.phase = Phase::Prefilling;
                    request.kv_blocks_held = needed_blocks;
                    if request.kv_in_cpu_tier {
                        kv.complete_cpu_to_gpu_transfer(&mut request);
                    }
                    self.running.push(request);
                }
                AllocOutcome::Insufficient | AllocOutcome::DroppedUnservable => {
                    still_waiting.push(request);
                }
            }
        }

        self.waiting = still_waiting;
        dropped
    }

    fn first_chunk_tokens(&self, request: &Request) -> u32 {
        if self.config.chunked_prefill_threshold == 0
            || request.prefill_remaining <= self.config.chunked_prefill_threshold
        {
            request.prefill_remaining
        } else {
            self.config.chunked_prefill_threshold
        }
    }

    /// Form and execute one scheduling step: chunk prefill work, assign one
    /// decode token per running decoder, respect the joint token+batch-size
    /// budget, ask the latency model for the step duration, and advance
    /// request state (prefill progress, decode token counts, completions).
    pub fn try_step(
        &mut self,
        clock: &mut Clock,
        kv: &mut KvCacheEngine,
        latency: &dyn LatencyModel,
        instance_id: u32,
    ) -> Result<StepOutcome, SimError> {
        self.preempted_this_step.clear();

        if self.running.is_empty() {
            return Ok(StepOutcome::Empty);
        }

        let now = clock.now();
        let mut prefill_budget = self.config.max_num_scheduled_tokens;
        let mut prefill_tokens_this_step = 0u32;
        let mut decode_requests_this_step = 0u32;
        let mut max_kv_len: u64 = 0;

        // Prefill work first, in running-set (admission) order, so partially
        // chunked requests keep making progress before fresh decoders eat
        // the budget. Ids rather than indices: growth-triggered preemption
        // below removes entries from `running`, which would otherwise
        // invalidate later positional indices mid-loop.
        let mut chunk_plan: Vec<(String, u32)> = Vec::new();
        for request in self.running.iter() {
            if request.is_prefill_complete() || prefill_budget == 0 {
                continue;
            }
            let want = self.first_chunk_tokens(request).min(prefill_budget);
            if want == 0 {
                continue;
            }
            chunk_plan.push((request.id.clone(), want));
            prefill_budget -= want;
            prefill_tokens_this_step += want;
        }

        let mut decode_plan: Vec<String> = Vec::new();
        for request in self.running.iter() {
            if !request.is_prefill_complete() || request.is_output_complete() {
                continue;
            }
            if prefill_tokens_this_step + decode_requests_this_step + 1
                > self.config.max_num_scheduled_tokens
            {
                break;
            }
            decode_plan.push(request.id.clone());
            decode_requests_this_step += 1;
        }

        if chunk_plan.is_empty() && decode_plan.is_empty() {
            return Ok(StepOutcome::Empty);
        }

        for request in &self.running {
            if request.is_prefill_complete() {
                max_kv_len = max_kv_len.max(request.current_kv_len() as u64);
            }
        }

        let shape = BatchShape {
            num_sequences: (chunk_plan.len() + decode_plan.len()) as u32,
            num_prefill_tokens: prefill_tokens_this_step,
            num_decode_tokens: decode_requests_this_step,
            max_kv_len,
        };
        tracing::debug!(
            instance_id,
            prefill_tokens = shape.num_prefill_tokens,
            decode_tokens = shape.num_decode_tokens,
            max_kv_len,
            "step start: batch formed"
        );
        let duration_us = latency.step_duration_us(&shape)?;
        let token_overhead_us = latency.per_emitted_token_overhead_us();

        // Grow KV for decoders first (decode growth is the usual source of
        // `insufficient`); preempt victims as needed before committing. A
        // decoder that is itself preempted mid-plan (as someone else's
        // victim) is simply skipped below: `position` returns `None`.
        let mut actual_decode_plan = Vec::new();
        for id in &decode_plan {
            if self.preempted_this_step.contains(id) {
                continue;
            }
            if self.grow_decoder_with_preemption(kv, id, clock)? {
                actual_decode_plan.push(id.clone());
            }
        }
        // `actual_decode_plan` drives token emission below; requests that
        // stalled (no victim available) or were themselves preempted as
        // someone else's victim keep their current kv_len this step.

        let mut finished = Vec::new();
        let mut token_emitting = Vec::new();

        for (id, tokens) in &chunk_plan {
            if self.preempted_this_step.contains(id) {
                continue;
            }
            let Some(pos) = self.running.iter().position(|r| &r.id == id) else {
                continue;
            };
            let request = &mut self.running[pos];
            request.prefill_remaining -= tokens;
            if request.is_prefill_complete() {
                request.phase = Phase::Decoding;
            }
        }

        for id in &actual_decode_plan {
            let Some(pos) = self.running.iter().position(|r| &r.id == id) else {
                continue;
            };
            let request = &mut self.running[pos];
            request.num_decode_tokens_produced += 1;
            let emit_tick = now + duration_us + token_overhead_us;
            request.token_emission_ticks.push(emit_tick);
            if request.first_token_tick.is_none() {
                request.first_token_tick = Some(emit_tick);
            }
            token_emitting.push(request.id.clone());
            if request.is_output_complete() {
                request.phase = Phase::Finished;
                request.completion_tick = Some(emit_tick);
                finished.push(request.id.clone());
            }
        }

        let complete_tick = now + duration_us;
        clock.schedule(
            Event::new(complete_tick, EventKind::StepComplete).with_instance(instance_id),
        )?;

        if !finished.is_empty() {
            self.running.retain(|r| r.phase != Phase::Finished);
        }

        Ok(StepOutcome::Scheduled {
            duration_us,
            finished_request_ids: finished,
            token_emitting_request_ids: token_emitting,
        })
    }

    /// Release KV blocks for a finished/dropped request; called by the
    /// instance after it has consumed the `StepOutcome`.
    pub fn release_finished(&mut self, kv: &mut KvCacheEngine, request: &Request) {
        kv.free(request);
    }

    /// Grow one decoder by one token, preempting victims as needed. Returns
    /// `Ok(true)` if the decoder is still running and grew successfully,
    /// `Ok(false)` if it stalled (no victim available) or was itself
    /// preempted as someone else's victim while growing a different decoder
    /// earlier in this same step.
    fn grow_decoder_with_preemption(
        &mut self,
        kv: &mut KvCacheEngine,
        id: &str,
        clock: &mut Clock,
    ) -> Result<bool, SimError> {
        let Some(mut idx) = self.running.iter().position(|r| r.id == id) else {
            return Ok(false);
        };

        loop {
            let new_total = self.running[idx].current_kv_len() + 1;
            if let AllocOutcome::Ok = kv.grow(&self.running[idx], new_total) {
                return Ok(true);
            }

            let Some(victim_idx) = self.select_victim(idx) else {
                // No victim available; the decoder simply doesn't grow this
                // step (stalls at its current kv_len). A capacity shortfall
                // the simulator reports, not an error.
                return Ok(false);
            };
            let victim_id = self.running[victim_idx].id.clone();
            self.preempted_this_step.insert(victim_id);
            let mut victim = self.running.remove(victim_idx);
            kv.preempt(&mut victim, clock);
            self.waiting.push(victim);
            self.sort_waiting();

            // Removing a lower index shifts idx down by one.
            if victim_idx < idx {
                idx -= 1;
            }
            if self.running.len() <= 1 {
                // idx is the last survivor; try once more next loop
                // iteration, then Ok(false) if select_victim finds nobody.
                continue;
            }
        }
    }

    /// Select a preemption victim among running requests, excluding `keep_idx`
    /// and anything already preempted this step (cycle prevention).
    fn select_victim(&self, keep_idx: usize) -> Option<usize> {
        let candidates: Vec<usize> = self
            .running
            .iter()
            .enumerate()
            .filter(|(i, r)| *i != keep_idx && !self.preempted_this_step.contains(&r.id))
            .map(|(i, _)| i)
            .collect();

        match self.config.preemption_policy {
            PreemptionPolicy::LastAdmitted => candidates
                .into_iter()
                .max_by_key(|&i| (self.running[i].arrival_tick, self.running[i].id.clone())),
            PreemptionPolicy::LowestPriority => candidates
                .into_iter()
                .max_by_key(|&i| (self.running[i].priority, self.running[i].id.clone())),
            PreemptionPolicy::MostBlocksHeld => candidates
                .into_iter()
                .max_by_key(|&i| (self.running[i].kv_blocks_held, self.running[i].id.clone())),
        }
    }

    pub fn running_requests(&self) -> &[Request] {
        &self.running
    }

    pub fn waiting_requests(&self) -> &[Request] {
        &self.waiting
    }

    pub fn take_finished(&mut self, id: &str) -> Option<Request> {
        let pos = self.running.iter().position(|r| r.id == id)?;
        Some(self.running.remove(pos))
    }
}
