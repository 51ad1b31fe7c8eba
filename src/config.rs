//! Simulation configuration: `SimulationConfig` plus the architecture and
//! hardware specs the roofline model consumes, loaded from JSON
//! (`serde_json::from_str`, with explicit `#[serde(default = "...")]`
//! functions for optional numeric fields).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionPolicyConfig;
use crate::error::SimError;
use crate::latency::{
    AlphaBeta, AlphaCoeffs, BetaCoeffs, HardwareSpec, LatencyModelConfig, ModelArchitectureSpec,
    Roofline,
};
use crate::scheduler::{PreemptionPolicy, QueueDiscipline, SchedulerConfig};
use crate::scorer::SnapshotPolicy;
use crate::workload::{TraceRow, WorkloadConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyModelKind {
    AlphaBeta,
    Roofline,
}

fn default_total_cpu_blocks() -> u32 {
    0
}

fn default_per_block_transfer_us() -> u64 {
    0
}

fn default_chunked_prefill_threshold() -> u32 {
    0
}

fn default_queue_discipline() -> QueueDiscipline {
    QueueDiscipline::Fcfs
}

fn default_preemption_policy() -> PreemptionPolicy {
    PreemptionPolicy::LastAdmitted
}

fn default_bucket_prefill_attention() -> bool {
    true
}

fn default_bw_efficiency_factor() -> f64 {
    1.0
}

fn default_tensor_parallelism() -> u32 {
    1
}

fn default_num_instances() -> u32 {
    1
}

/// Top-level config record, deserialized from the caller's JSON file: a
/// flat struct with `#[serde(default = "...")]` on every field that has a
/// sane default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub model_id: String,
    #[serde(default = "default_tensor_parallelism")]
    pub tensor_parallelism: u32,
    #[serde(default)]
    pub hardware_id: String,

    /// Number of homogeneous instances the cluster coordinator spins up.
    #[serde(default = "default_num_instances")]
    pub num_instances: u32,

    pub total_gpu_blocks: u32,
    #[serde(default = "default_total_cpu_blocks")]
    pub total_cpu_blocks: u32,
    #[serde(default = "default_per_block_transfer_us")]
    pub per_block_transfer_us: u64,
    pub block_size_tokens: u32,

    pub max_num_running_requests: u32,
    pub max_num_scheduled_tokens: u32,
    pub max_model_len: u32,

    pub latency_model: LatencyModelKind,
    #[serde(default)]
    pub alpha_coeffs: Option<[f64; 3]>,
    #[serde(default)]
    pub beta_coeffs: Option<[f64; 3]>,
    #[serde(default)]
    pub model_architecture: Option<ModelArchitectureSpec>,
    #[serde(default)]
    pub hardware: Option<HardwareSpec>,
    #[serde(default = "default_bw_efficiency_factor")]
    pub bw_efficiency_factor: f64,
    #[serde(default)]
    pub scheduling_overhead_us: f64,
    /// Exposes the roofline model's next-power-of-2 prefill-attention
    /// bucketing as a config knob instead of hard-coding it on.
    #[serde(default = "default_bucket_prefill_attention")]
    pub roofline_bucket_prefill_attention: bool,

    pub admission_policy: AdmissionPolicyConfig,
    pub routing_weights: HashMap<String, f64>,
    #[serde(default)]
    pub snapshot_policy: HashMap<String, SnapshotPolicy>,

    #[serde(default = "default_chunked_prefill_threshold")]
    pub chunked_prefill_threshold: u32,
    #[serde(default = "default_queue_discipline")]
    pub queue_discipline: QueueDiscipline,
    #[serde(default = "default_preemption_policy")]
    pub preemption_policy: PreemptionPolicy,

    pub horizon_us: u64,
    pub seed: u64,
    pub workload: WorkloadConfig,
}

impl SimulationConfig {
    /// Config-validation checks, run once before a simulation starts.
    /// Distinct from `SimError::NegativeStepDuration` /
    /// `CausalityViolation`, which can only be detected at runtime.
    pub fn validate(&self) -> Result<(), SimError> {
        if self.num_instances == 0 {
            return Err(SimError::ConfigValidation("num_instances must be > 0".to_string()));
        }
        if self.block_size_tokens == 0 {
            return Err(SimError::ConfigValidation(
                "block_size_tokens must be > 0".to_string(),
            ));
        }
        if self.max_num_running_requests == 0 {
            return Err(SimError::ConfigValidation(
                "max_num_running_requests must be > 0".to_string(),
            ));
        }
        if self.max_num_scheduled_tokens == 0 {
            return Err(SimError::ConfigValidation(
                "max_num_scheduled_tokens must be > 0".to_string(),
            ));
        }
        if self.max_model_len == 0 {
            return Err(SimError::ConfigValidation("max_model_len must be > 0".to_string()));
        }
        match self.latency_model {
            LatencyModelKind::AlphaBeta => {
                if self.alpha_coeffs.is_none() || self.beta_coeffs.is_none() {
                    return Err(SimError::ConfigValidation(
                        "alpha_coeffs and beta_coeffs are required when latency_model = alpha_beta"
                            .to_string(),
                    ));
                }
            }
            LatencyModelKind::Roofline => {
                if self.model_architecture.is_none() || self.hardware.is_none() {
                    return Err(SimError::ConfigValidation(
                        "model_architecture and hardware are required when latency_model = roofline"
                            .to_string(),
                    ));
                }
            }
        }
        for (name, weight) in &self.routing_weights {
            if *weight < 0.0 {
                return Err(SimError::ConfigValidation(format!(
                    "routing_weights[{name}] must be non-negative"
                )));
            }
        }
        Ok(())
    }

    pub fn build_latency_model(&self) -> Result<LatencyModelConfig, SimError> {
        match self.latency_model {
            LatencyModelKind::AlphaBeta => {
                let alpha = self.alpha_coeffs.ok_or_else(|| {
                    SimError::ConfigValidation("alpha_coeffs missing".to_string())
                })?;
                let beta = self.beta_coeffs.ok_or_else(|| {
                    SimError::ConfigValidation("beta_coeffs missing".to_string())
                })?;
                Ok(LatencyModelConfig::AlphaBeta(AlphaBeta {
                    alpha: AlphaCoeffs(alpha),
                    beta: BetaCoeffs(beta),
                }))
            }
            LatencyModelKind::Roofline => {
                let model = self
                    .model_architecture
                    .clone()
                    .ok_or_else(|| SimError::ConfigValidation("model_architecture missing".to_string()))?;
                let hardware = self
                    .hardware
                    .clone()
                    .ok_or_else(|| SimError::ConfigValidation("hardware missing".to_string()))?;
                Ok(LatencyModelConfig::Roofline(Box::new(Roofline {
                    model,
                    hardware,
                    tensor_parallelism: self.tensor_parallelism,
                    bw_efficiency_factor: self.bw_efficiency_factor,
                    scheduling_overhead_base_us: self.scheduling_overhead_us,
                    bucket_prefill_attention: self.roofline_bucket_prefill_attention,
                })))
            }
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            queue_discipline: self.queue_discipline,
            preemption_policy: self.preemption_policy,
            max_num_running_requests: self.max_num_running_requests,
            max_num_scheduled_tokens: self.max_num_scheduled_tokens,
            max_model_len: self.max_model_len,
            chunked_prefill_threshold: self.chunked_prefill_threshold,
        }
    }
}

/// Loads a `TraceReplay` arrival stream from a CSV file with columns
/// `arrived_at_seconds, num_prefill_tokens, num_decode_tokens`. A first
/// line that doesn't parse as a number is treated as a header and skipped.
pub fn load_trace_rows_csv(path: &str) -> Result<Vec<TraceRow>, SimError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| SimError::ConfigValidation(format!("reading trace file {path}: {e}")))?;

    let mut rows = Vec::new();
    for (i, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let Ok(arrived_at_seconds) = fields.first().copied().unwrap_or("").parse::<f64>() else {
            if i == 0 {
                continue;
            }
            return Err(SimError::ConfigValidation(format!(
                "trace file {path} line {}: invalid arrived_at_seconds",
                i + 1
            )));
        };
        if fields.len() != 3 {
            return Err(SimError::ConfigValidation(format!(
                "trace file {path} line {}: expected 3 columns, got {}",
                i + 1,
                fields.len()
            )));
        }
        let num_prefill_tokens: u32 = fields[1].parse().map_err(|_| {
            SimError::ConfigValidation(format!(
                "trace file {path} line {}: invalid num_prefill_tokens",
                i + 1
            ))
        })?;
        let num_decode_tokens: u32 = fields[2].parse().map_err(|_| {
            SimError::ConfigValidation(format!(
                "trace file {path} line {}: invalid num_decode_tokens",
                i + 1
            ))
        })?;
        rows.push(TraceRow {
            arrived_at_seconds,
            num_prefill_tokens,
            num_decode_tokens,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionPolicyConfig;
    use crate::latency::LatencyModel;
    use crate::request::SloClass;
    use crate::workload::{ArrivalConfig, LengthDistribution, PrefixMode, WorkloadConfig};

    fn base() -> SimulationConfig {
        SimulationConfig {
            model_id: "test-model".to_string(),
            tensor_parallelism: 1,
            hardware_id: String::new(),
            num_instances: 2,
            total_gpu_blocks: 64,
            total_cpu_blocks: 0,
            per_block_transfer_us: 0,
            block_size_tokens: 16,
            max_num_running_requests: 4,
            max_num_scheduled_tokens: 64,
            max_model_len: 4096,
            latency_model: LatencyModelKind::AlphaBeta,
            alpha_coeffs: Some([10.0, 0.0, 0.0]),
            beta_coeffs: Some([0.0, 1.0, 1.0]),
            model_architecture: None,
            hardware: None,
            bw_efficiency_factor: 1.0,
            scheduling_overhead_us: 0.0,
            roofline_bucket_prefill_attention: true,
            admission_policy: AdmissionPolicyConfig::AlwaysAdmit,
            routing_weights: HashMap::from([("least-loaded".to_string(), 1.0)]),
            snapshot_policy: HashMap::new(),
            chunked_prefill_threshold: 0,
            queue_discipline: QueueDiscipline::Fcfs,
            preemption_policy: PreemptionPolicy::LastAdmitted,
            horizon_us: 1_000_000,
            seed: 1,
            workload: WorkloadConfig {
                arrival: ArrivalConfig::Deterministic { rate_per_sec: 10.0 },
                input_distribution: LengthDistribution::Constant { n: 16 },
                output_distribution: LengthDistribution::Constant { n: 8 },
                prefix_mode: PrefixMode::None,
                vocab_size: 1000,
                num_requests: Some(10),
                slo_class: SloClass::Interactive,
            },
        }
    }

    #[test]
    fn valid_alpha_beta_config_passes_validation() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn alpha_beta_without_coefficients_fails_validation() {
        let mut config = base();
        config.alpha_coeffs = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn roofline_without_model_architecture_fails_validation() {
        let mut config = base();
        config.latency_model = LatencyModelKind::Roofline;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_block_size_fails_validation() {
        let mut config = base();
        config.block_size_tokens = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn negative_routing_weight_fails_validation() {
        let mut config = base();
        config.routing_weights.insert("queue-depth".to_string(), -1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn build_latency_model_dispatches_alpha_beta() {
        let model = base().build_latency_model().unwrap();
        assert_eq!(model.name(), "alpha_beta");
    }

    #[test]
    fn load_trace_rows_csv_parses_header_and_rows() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "arrived_at_seconds,num_prefill_tokens,num_decode_tokens").unwrap();
        writeln!(file, "0.0,10,4").unwrap();
        writeln!(file, "0.5,20,8").unwrap();
        file.flush().unwrap();

        let rows = load_trace_rows_csv(file.path().to_str().unwrap()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].num_prefill_tokens, 10);
        assert_eq!(rows[0].num_decode_tokens, 4);
        assert_eq!(rows[1].arrived_at_seconds, 0.5);
        assert_eq!(rows[1].num_decode_tokens, 8);
    }

    #[test]
    fn load_trace_rows_csv_rejects_malformed_row() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0.0,10").unwrap();
        file.flush().unwrap();

        assert!(load_trace_rows_csv(file.path().to_str().unwrap()).is_err());
    }
}
