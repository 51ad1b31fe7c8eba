//! End-to-end scenario 1: at low load, the choice of routing policy should
//! not materially affect mean TTFT, since no instance is ever queued deeply
//! enough for the policies to actually disagree.

use std::collections::HashMap;

use llm_cluster_sim::admission::AdmissionPolicyConfig;
use llm_cluster_sim::config::{LatencyModelKind, SimulationConfig};
use llm_cluster_sim::request::SloClass;
use llm_cluster_sim::scheduler::{PreemptionPolicy, QueueDiscipline};
use llm_cluster_sim::workload::{ArrivalConfig, LengthDistribution, PrefixMode, WorkloadConfig};

fn config_with_policy(weights: HashMap<String, f64>) -> SimulationConfig {
    SimulationConfig {
        model_id: "low-load".to_string(),
        tensor_parallelism: 1,
        hardware_id: String::new(),
        num_instances: 4,
        total_gpu_blocks: 4096,
        total_cpu_blocks: 0,
        per_block_transfer_us: 0,
        block_size_tokens: 16,
        max_num_running_requests: 64,
        max_num_scheduled_tokens: 4096,
        max_model_len: 8192,
        latency_model: LatencyModelKind::AlphaBeta,
        alpha_coeffs: Some([50.0, 0.0, 0.0]),
        beta_coeffs: Some([0.0, 0.5, 1.5]),
        model_architecture: None,
        hardware: None,
        bw_efficiency_factor: 1.0,
        scheduling_overhead_us: 0.0,
        roofline_bucket_prefill_attention: true,
        admission_policy: AdmissionPolicyConfig::AlwaysAdmit,
        routing_weights: weights,
        snapshot_policy: HashMap::new(),
        chunked_prefill_threshold: 0,
        queue_discipline: QueueDiscipline::Fcfs,
        preemption_policy: PreemptionPolicy::LastAdmitted,
        horizon_us: 60_000_000,
        seed: 7,
        workload: WorkloadConfig {
            arrival: ArrivalConfig::Deterministic { rate_per_sec: 1.0 },
            input_distribution: LengthDistribution::Constant { n: 128 },
            output_distribution: LengthDistribution::Constant { n: 64 },
            prefix_mode: PrefixMode::None,
            vocab_size: 32000,
            num_requests: Some(50),
            slo_class: SloClass::Interactive,
        },
    }
}

#[test]
fn routing_policy_choice_barely_affects_ttft_under_low_load() {
    let policies: Vec<(&str, HashMap<String, f64>)> = vec![
        ("round-robin", HashMap::from([("round-robin".to_string(), 1.0)])),
        ("least-loaded", HashMap::from([("least-loaded".to_string(), 1.0)])),
        (
            "weighted",
            HashMap::from([("least-loaded".to_string(), 0.5), ("queue-depth".to_string(), 0.5)]),
        ),
        ("prefix-affinity", HashMap::from([("prefix-affinity".to_string(), 1.0)])),
    ];

    let mut means = Vec::new();
    for (name, weights) in policies {
        let config = config_with_policy(weights);
        let output = llm_cluster_sim::cluster::run(&config).unwrap();
        assert!(output.cluster.ttft.n > 0, "{name} produced no completions");
        means.push((name, output.cluster.ttft.mean));
    }

    let max_mean = means.iter().map(|(_, m)| *m).fold(f64::MIN, f64::max);
    let min_mean = means.iter().map(|(_, m)| *m).fold(f64::MAX, f64::min);
    let relative_deviation = if max_mean > 0.0 { (max_mean - min_mean) / max_mean } else { 0.0 };

    assert!(
        relative_deviation < 0.05,
        "mean TTFT deviation across policies too large: {means:?} ({relative_deviation:.4})"
    );
}
