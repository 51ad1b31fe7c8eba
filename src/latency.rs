//! Batch step latency models (C4): linear alpha/beta and analytical roofline.
//!
//! Both models implement the same contract so the scheduler never branches
//! on which one is configured: heterogeneous latency models are a tagged
//! variant with a polymorphic call at runtime, not an if/else on a kind
//! field scattered through the scheduler.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// Everything a cost model needs to know about the batch it is about to run
/// for one scheduling step.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchShape {
    pub num_sequences: u32,
    pub num_prefill_tokens: u32,
    pub num_decode_tokens: u32,
    /// Max `current_kv_len()` across every decoding sequence in the batch:
    /// attention cost for decode is dominated by the longest context, not
    /// the sum.
    pub max_kv_len: u64,
}

impl BatchShape {
    pub fn total_tokens(&self) -> u32 {
        self.num_prefill_tokens + self.num_decode_tokens
    }
}

/// Per-model-call breakdown exposed to the instrumentation layer so the
/// alpha-term and beta-term of a step can be verified independently,
/// keeping phase decomposition testable without re-deriving it from the
/// combined duration.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepCostBreakdown {
    pub alpha_term_us: f64,
    pub beta_term_us: f64,
}

impl StepCostBreakdown {
    pub fn total_us(&self) -> f64 {
        self.alpha_term_us + self.beta_term_us
    }
}

pub trait LatencyModel: std::fmt::Debug {
    /// Duration in microseconds of one scheduling step processing `batch`.
    /// Must be non-negative; implementations that could produce a negative
    /// value return `SimError::NegativeStepDuration` instead of clamping,
    /// so a misconfigured model surfaces at validation time rather than
    /// silently warping the timeline.
    fn step_duration_us(&self, batch: &BatchShape) -> Result<u64, SimError>;

    fn breakdown(&self, batch: &BatchShape) -> StepCostBreakdown;

    /// Extra cost charged once per emitted output token, on top of the
    /// shared batched step cost. Zero for models with no such term.
    fn per_emitted_token_overhead_us(&self) -> u64 {
        0
    }

    fn name(&self) -> &'static str;
}

/// The three alpha coefficients: `alpha[0]` is fixed per-step
/// dispatch/queueing overhead, `alpha[1]` scales with total tokens
/// processed in the batch, `alpha[2]` is the "output processing time" term.
///
/// `alpha[2]` is NOT folded into `step_duration_us`: it applies
/// per-output-token outside the batched step cost, so it is exposed via
/// `per_emitted_token_overhead_us` and charged once per emitted decode
/// token (see `Scheduler::try_step`), not once per batch. `alpha[2]` and
/// `beta[2]` overlap physically and are under-identified if fit
/// independently from the same trace; a caller fitting both from one
/// regression should expect that ambiguity rather than treat either
/// coefficient as independently meaningful.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AlphaCoeffs(pub [f64; 3]);

/// The three beta coefficients: `beta[0]` fixed per-step compute overhead,
/// `beta[1]` per prefill token, `beta[2]` per decode token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BetaCoeffs(pub [f64; 3]);

/// Linear regression cost model fit offline against real batch traces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlphaBeta {
    pub alpha: AlphaCoeffs,
    pub beta: BetaCoeffs,
}

impl AlphaBeta {
    fn alpha_term(&self, batch: &BatchShape) -> f64 {
        self.alpha.0[0] + self.alpha.0[1] * batch.total_tokens() as f64
    }

    fn beta_term(&self, batch: &BatchShape) -> f64 {
        self.beta.0[0]
            + self.beta.0[1] * batch.num_prefill_tokens as f64
            + self.beta.0[2] * batch.num_decode_tokens as f64
    }
}

impl LatencyModel for AlphaBeta {
    fn step_duration_us(&self, batch: &BatchShape) -> Result<u64, SimError> {
        let duration = self.alpha_term(batch) + self.beta_term(batch);
        if duration < 0.0 {
            return Err(SimError::NegativeStepDuration(duration as i64));
        }
        Ok(duration.round() as u64)
    }

    fn breakdown(&self, batch: &BatchShape) -> StepCostBreakdown {
        StepCostBreakdown {
            alpha_term_us: self.alpha_term(batch),
            beta_term_us: self.beta_term(batch),
        }
    }

    fn per_emitted_token_overhead_us(&self) -> u64 {
        self.alpha.0[2].max(0.0).round() as u64
    }

    fn name(&self) -> &'static str {
        "alpha_beta"
    }
}

/// Architectural parameters consumed by the roofline model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelArchitectureSpec {
    pub num_layers: u32,
    pub num_heads: u32,
    pub num_kv_heads: u32,
    pub head_dim: u32,
    pub hidden_size: u32,
    pub vocab_size: u32,
    pub intermediate_size: u32,
}

/// Per-shape MFU (Model FLOP Utilization) lookup table: maps a shape
/// bucket (token count, rounded the same way the caller buckets its
/// batches) to an efficiency in (0,1]. Looked up by largest key <= the
/// query size; falls back to the smallest entry for queries below the
/// smallest bucket, and to 1.0 (full utilization) if the table is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MfuTable(pub BTreeMap<u32, f64>);

impl MfuTable {
    pub fn lookup(&self, tokens: u32) -> f64 {
        if let Some((_, &mfu)) = self.0.range(..=tokens).next_back() {
            return mfu;
        }
        self.0.values().next().copied().unwrap_or(1.0)
    }
}

/// Hardware parameters consumed by the roofline model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareSpec {
    pub peak_flops_per_second: f64,
    pub peak_memory_bandwidth_bytes_per_second: f64,
    #[serde(default)]
    pub gemm_mfu_table: MfuTable,
    #[serde(default)]
    pub attention_mfu_table: MfuTable,
}

/// Analytical roofline model: per-layer `max(flops_time, mem_bandwidth_time)`,
/// summed across layers and added to a fixed kernel-launch overhead that
/// scales with depth and tensor-parallel degree. Captures the compute/
/// memory-bound crossover a single linear fit cannot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roofline {
    pub model: ModelArchitectureSpec,
    pub hardware: HardwareSpec,
    pub tensor_parallelism: u32,
    pub bw_efficiency_factor: f64,
    pub scheduling_overhead_base_us: f64,
    /// Bucket prefill attention FLOPs to the next power-of-2 >= 512 before
    /// costing them. A known overestimate for very short prefills, so this
    /// is exposed as a knob rather than hard-coded on.
    pub bucket_prefill_attention: bool,
}

impl Roofline {
    fn bytes_per_param(&self) -> f64 {
        2.0 // bf16/fp16 weights and KV cache, the common serving dtype.
    }

    fn gemm_flops_per_token_per_layer(&self) -> f64 {
        let h = self.model.hidden_size as f64;
        let ffn = self.model.intermediate_size as f64;
        // QKVO projections (~4h^2) plus gated FFN up/down (~2h*ffn*2), each
        // multiply-accumulate counted as 2 FLOPs. A standard dense-layer
        // proxy, not a kernel-accurate count.
        2.0 * (4.0 * h * h + 2.0 * h * ffn)
    }

    fn attention_flops(&self, query_tokens: u64, kv_len: u64) -> f64 {
        let heads = self.model.num_heads as f64;
        let head_dim = self.model.head_dim as f64;
        // QK^T plus attn*V, each a multiply-accumulate over head_dim.
        4.0 * heads * head_dim * query_tokens as f64 * kv_len as f64
    }

    fn bucket_tokens(tokens: u32) -> u32 {
        if tokens == 0 {
            return 0;
        }
        tokens.max(512).next_power_of_two()
    }

    fn gemm_time_us(&self, tokens: u32) -> f64 {
        if tokens == 0 {
            return 0.0;
        }
        let mfu = self.hardware.gemm_mfu_table.lookup(tokens);
        let flops = self.gemm_flops_per_token_per_layer() * tokens as f64;
        let effective_flops_per_second =
            self.hardware.peak_flops_per_second * mfu * self.bw_efficiency_factor;
        (flops / effective_flops_per_second) * 1_000_000.0
    }

    fn gemm_mem_time_us(&self, tokens: u32) -> f64 {
        if tokens == 0 {
            return 0.0;
        }
        // Weight bytes touched once per step regardless of batch size; KV
        // read/write bytes scale with tokens.
        let weight_bytes = self.bytes_per_param()
            * (4.0 * self.model.hidden_size as f64 * self.model.hidden_size as f64
                + 2.0 * self.model.hidden_size as f64 * self.model.intermediate_size as f64);
        let kv_bytes = self.bytes_per_param()
            * 2.0
            * self.model.num_kv_heads as f64
            * self.model.head_dim as f64
            * tokens as f64;
        let bytes = weight_bytes + kv_bytes;
        let effective_bw =
            self.hardware.peak_memory_bandwidth_bytes_per_second * self.bw_efficiency_factor;
        (bytes / effective_bw) * 1_000_000.0
    }

    fn attention_time_us(&self, query_tokens: u64, kv_len: u64, shape_bucket: u32) -> f64 {
        if query_tokens == 0 {
            return 0.0;
        }
        let mfu = self.hardware.attention_mfu_table.lookup(shape_bucket);
        let flops = self.attention_flops(query_tokens, kv_len);
        let effective_flops_per_second =
            self.hardware.peak_flops_per_second * mfu * self.bw_efficiency_factor;
        let flops_time = (flops / effective_flops_per_second) * 1_000_000.0;

        let bytes = self.bytes_per_param()
            * 2.0
            * self.model.num_kv_heads as f64
            * self.model.head_dim as f64
            * kv_len as f64;
        let effective_bw =
            self.hardware.peak_memory_bandwidth_bytes_per_second * self.bw_efficiency_factor;
        let mem_time = (bytes / effective_bw) * 1_000_000.0;

        flops_time.max(mem_time)
    }

    fn per_layer_time_us(&self, batch: &BatchShape) -> f64 {
        let prefill_tokens = batch.num_prefill_tokens;
        let decode_tokens = batch.num_decode_tokens as u64;

        let prefill_gemm = self.gemm_time_us(prefill_tokens).max(self.gemm_mem_time_us(prefill_tokens));
        let decode_gemm = self
            .gemm_time_us(batch.num_decode_tokens)
            .max(self.gemm_mem_time_us(batch.num_decode_tokens));

        let prefill_attn_bucket = if self.bucket_prefill_attention {
            Self::bucket_tokens(prefill_tokens)
        } else {
            prefill_tokens
        };
        // Prefill attention reads its own growing prefix; approximate with
        // the bucketed token count standing in for both query and kv extent.
        let prefill_attn = self.attention_time_us(
            prefill_tokens as u64,
            prefill_attn_bucket as u64,
            prefill_attn_bucket,
        );
        let decode_attn = self.attention_time_us(decode_tokens, batch.max_kv_len, decode_tokens as u32);

        prefill_gemm + decode_gemm + prefill_attn + decode_attn
    }

    fn overhead_us(&self) -> f64 {
        let tp = self.tensor_parallelism.max(1) as f64;
        self.scheduling_overhead_base_us * self.model.num_layers as f64 / tp
    }
}

impl LatencyModel for Roofline {
    fn step_duration_us(&self, batch: &BatchShape) -> Result<u64, SimError> {
        let duration =
            self.overhead_us() + self.per_layer_time_us(batch) * self.model.num_layers as f64;
        if duration < 0.0 {
            return Err(SimError::NegativeStepDuration(duration as i64));
        }
        Ok(duration.round() as u64)
    }

    fn breakdown(&self, batch: &BatchShape) -> StepCostBreakdown {
        StepCostBreakdown {
            alpha_term_us: self.overhead_us(),
            beta_term_us: self.per_layer_time_us(batch) * self.model.num_layers as f64,
        }
    }

    fn name(&self) -> &'static str {
        "roofline"
    }
}

/// Tagged union so config deserialization can pick a concrete model without
/// the scheduler ever needing to match on it itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LatencyModelConfig {
    AlphaBeta(AlphaBeta),
    Roofline(Box<Roofline>),
}

impl LatencyModel for LatencyModelConfig {
    fn step_duration_us(&self, batch: &BatchShape) -> Result<u64, SimError> {
        match self {
            LatencyModelConfig::AlphaBeta(m) => m.step_duration_us(batch),
            LatencyModelConfig::Roofline(m) => m.step_duration_us(batch),
        }
    }

    fn breakdown(&self, batch: &BatchShape) -> StepCostBreakdown {
        match self {
            LatencyModelConfig::AlphaBeta(m) => m.breakdown(batch),
            LatencyModelConfig::Roofline(m) => m.breakdown(batch),
        }
    }

    fn per_emitted_token_overhead_us(&self) -> u64 {
        match self {
            LatencyModelConfig::AlphaBeta(m) => m.per_emitted_token_overhead_us(),
            LatencyModelConfig::Roofline(m) => m.per_emitted_token_overhead_us(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            LatencyModelConfig::AlphaBeta(m) => m.name(),
            LatencyModelConfig::Roofline(m) => m.name(),
        }
    }
}
