//! KV cache engine (C3): block allocation, CPU tier offload, preemption.
//!
//! Mutated only by the owning instance's scheduler: no cross-instance
//! sharing, so this is plain owned state, no locking.

use std::collections::HashMap;

use crate::clock::{Clock, Event, EventKind};
use crate::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocOutcome {
    Ok,
    DroppedUnservable,
    Insufficient,
}

/// Per-request block accounting the engine tracks independently of the
/// `Request` struct's `kv_blocks_held`/`kv_in_cpu_tier` mirror fields (the
/// scheduler is the canonical owner; the engine enforces physical limits).
#[derive(Debug, Default, Clone, Copy)]
struct Holding {
    gpu_blocks: u32,
    cpu_blocks: u32,
}

#[derive(Debug)]
pub struct KvCacheEngine {
    pub block_size_tokens: u32,
    pub total_gpu_blocks: u32,
    pub total_cpu_blocks: u32,
    pub per_block_transfer_us: u64,

    gpu_blocks_used: u32,
    cpu_blocks_used: u32,
    holdings: HashMap<String, Holding>,

    // Metrics accumulators.
    preemption_count: u64,
    decode_growth_steps: u64,
    decode_growth_without_preemption: u64,
    completed_requests: u64,
}

impl KvCacheEngine {
    pub fn new(
        block_size_tokens: u32,
        total_gpu_blocks: u32,
        total_cpu_blocks: u32,
        per_block_transfer_us: u64,
    ) -> Self {
        Self {
            block_size_tokens: block_size_tokens.max(1),
            total_gpu_blocks,
            total_cpu_blocks,
            per_block_transfer_us,
            gpu_blocks_used: 0,
            cpu_blocks_used: 0,
            holdings: HashMap::new(),
            preemption_count: 0,
            decode_growth_steps: 0,
            decode_growth_without_preemption: 0,
            completed_requests: 0,
        }
    }

    pub fn blocks_for_tokens(&self, tokens: u32) -> u32 {
        tokens.div_ceil(self.block_size_tokens)
    }

    pub fn gpu_blocks_free(&self) -> u32 {
        self.total_gpu_blocks - self.gpu_blocks_used
    }

    /// Peak block demand a request could ever reach (at `max_model_len` or
    /// its own `output_len_target` + input length, whichever the caller
    /// passes in as `peak_tokens`).
    pub fn peak_demand_blocks(&self, peak_tokens: u32) -> u32 {
        self.blocks_for_tokens(peak_tokens)
    }

    /// Try to reserve `needed_blocks` physical GPU blocks for `request`.
    pub fn try_allocate(&mut self, request: &Request, needed_blocks: u32) -> AllocOutcome {
        if needed_blocks > self.total_gpu_blocks + self.total_cpu_blocks {
            return AllocOutcome::DroppedUnservable;
        }
        if needed_blocks > self.gpu_blocks_free() {
            return AllocOutcome::Insufficient;
        }
        self.gpu_blocks_used += needed_blocks;
        let holding = self.holdings.entry(request.id.clone()).or_default();
        holding.gpu_blocks += needed_blocks;
        AllocOutcome::Ok
    }

    /// Charge additional blocks for decode growth. Returns `Insufficient`
    /// if the request cannot grow right now (the scheduler must preempt a
    /// victim and retry).
    pub fn grow(&mut self, request: &Request, new_total_tokens: u32) -> AllocOutcome {
        self.decode_growth_steps += 1;
        let holding = self.holdings.entry(request.id.clone()).or_default();
        let target_blocks = self.blocks_for_tokens(new_total_tokens);
        if target_blocks <= holding.gpu_blocks {
            self.decode_growth_without_preemption += 1;
            return AllocOutcome::Ok;
        }
        let delta = target_blocks - holding.gpu_blocks;
        if delta > self.gpu_blocks_free() {
            return AllocOutcome::Insufficient;
        }
        self.gpu_blocks_used += delta;
        self.holdings.get_mut(&request.id).unwrap().gpu_blocks += delta;
        self.decode_growth_without_preemption += 1;
        AllocOutcome::Ok
    }

    /// Preempt a request: return its GPU blocks. If the CPU tier has room,
    /// the blocks logically move there and a `KvTransferComplete` event is
    /// scheduled at `now + blocks * per_block_transfer_us`; otherwise they
    /// are simply freed.
    pub fn preempt(&mut self, request: &mut Request, clock: &mut Clock) -> u32 {
        let holding = self.holdings.entry(request.id.clone()).or_default();
        let freed = holding.gpu_blocks;
        self.gpu_blocks_used -= freed;
        holding.gpu_blocks = 0;
        self.preemption_count += 1;

        let cpu_free = self.total_cpu_blocks - self.cpu_blocks_used;
        if self.total_cpu_blocks > 0 && cpu_free >= freed && freed > 0 {
            self.cpu_blocks_used += freed;
            holding.cpu_blocks += freed;
            request.kv_in_cpu_tier = true;
            let transfer_us = freed as u64 * self.per_block_transfer_us;
            let ready_tick = clock.now() + transfer_us;
            request.cpu_transfer_ready_tick = Some(ready_tick);
            let _ = clock.schedule(
                Event::new(ready_tick, EventKind::KvTransferComplete)
                    .with_request(request.id.clone()),
            );
        } else {
            request.kv_in_cpu_tier = false;
            request.cpu_transfer_ready_tick = None;
        }

        request.kv_blocks_held = 0;
        request.preempt();
        freed
    }

    /// Complete the reciprocal CPU->GPU transfer on re-admission: drop the
    /// CPU-tier hold for this request (its GPU blocks were already
    /// re-reserved via `try_allocate`/`grow` by the scheduler).
    pub fn complete_cpu_to_gpu_transfer(&mut self, request: &mut Request) {
        if let Some(holding) = self.holdings.get_mut(&request.id) {
            self.cpu_blocks_used -= holding.cpu_blocks;
            holding.cpu_blocks = 0;
        }
        request.kv_in_cpu_tier = false;
        request.cpu_transfer_ready_tick = None;
    }

    pub fn free(&mut self, request: &Request) {
        if let Some(holding) = self.holdings.remove(&request.id) {
            self.gpu_blocks_used -= holding.gpu_blocks;
            self.cpu_blocks_used -= holding.cpu_blocks;
        }
        self.completed_requests += 1;
    }

    pub fn held_blocks(&self, request_id: &str) -> u32 {
        self.holdings.get(request_id).map(|h| h.gpu_blocks).unwrap_or(0)
    }

    pub fn preemption_count(&self) -> u64 {
        self.preemption_count
    }

    /// Fraction of decode-growth steps across all requests that did not
    /// trigger a preemption.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.decode_growth_steps == 0 {
            1.0
        } else {
            self.decode_growth_without_preemption as f64 / self.decode_growth_steps as f64
        }
    }

    pub fn kv_thrashing_rate(&self) -> f64 {
        if self.completed_requests == 0 {
            0.0
        } else {
            self.preemption_count as f64 / self.completed_requests as f64
        }
    }

    /// True when total GPU blocks held by running requests never exceeds
    /// the physical pool.
    pub fn invariant_gpu_bound_holds(&self) -> bool {
        self.gpu_blocks_used <= self.total_gpu_blocks
    }
}
