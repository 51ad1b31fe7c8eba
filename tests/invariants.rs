//! Property-based checks of the simulator's core conservation and
//! determinism invariants, run across randomly generated configurations
//! rather than single fixed scenarios.

use std::collections::HashMap;

use proptest::prelude::*;

use llm_cluster_sim::admission::AdmissionPolicyConfig;
use llm_cluster_sim::config::{LatencyModelKind, SimulationConfig};
use llm_cluster_sim::request::SloClass;
use llm_cluster_sim::scheduler::{PreemptionPolicy, QueueDiscipline};
use llm_cluster_sim::workload::{ArrivalConfig, LengthDistribution, PrefixMode, WorkloadConfig};

fn config_with(
    num_instances: u32,
    total_gpu_blocks: u32,
    rate_per_sec: f64,
    num_requests: u64,
    seed: u64,
) -> SimulationConfig {
    SimulationConfig {
        model_id: "prop-test".to_string(),
        tensor_parallelism: 1,
        hardware_id: String::new(),
        num_instances,
        total_gpu_blocks,
        total_cpu_blocks: 0,
        per_block_transfer_us: 0,
        block_size_tokens: 8,
        max_num_running_requests: 8,
        max_num_scheduled_tokens: 128,
        max_model_len: 2048,
        latency_model: LatencyModelKind::AlphaBeta,
        alpha_coeffs: Some([5.0, 0.0, 0.0]),
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
        horizon_us: 5_000_000,
        seed,
        workload: WorkloadConfig {
            arrival: ArrivalConfig::Poisson { rate_per_sec },
            input_distribution: LengthDistribution::Constant { n: 8 },
            output_distribution: LengthDistribution::Constant { n: 4 },
            prefix_mode: PrefixMode::None,
            vocab_size: 500,
            num_requests: Some(num_requests),
            slo_class: SloClass::Interactive,
        },
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    /// Every injected request ends up completed, still queued, still
    /// running, or dropped unservable: nothing vanishes.
    #[test]
    fn conservation_holds_across_random_configs(
        num_instances in 1u32..4,
        total_gpu_blocks in 1u32..64,
        rate_per_sec in 1.0f64..200.0,
        num_requests in 0u64..60,
        seed in any::<u64>(),
    ) {
        let config = config_with(num_instances, total_gpu_blocks, rate_per_sec, num_requests, seed);
        let output = llm_cluster_sim::cluster::run(&config).unwrap();
        prop_assert_eq!(
            output.injected_requests,
            output.completed_requests + output.still_queued + output.still_running + output.dropped_unservable
        );
        prop_assert_eq!(output.num_requests, output.injected_requests + output.rejected_requests);
    }

    /// Two runs from an identical config (including seed) produce
    /// byte-identical completion ticks for every request id.
    #[test]
    fn determinism_holds_across_random_configs(
        num_instances in 1u32..4,
        total_gpu_blocks in 1u32..64,
        rate_per_sec in 1.0f64..200.0,
        num_requests in 0u64..60,
        seed in any::<u64>(),
    ) {
        let config = config_with(num_instances, total_gpu_blocks, rate_per_sec, num_requests, seed);
        let a = llm_cluster_sim::cluster::run(&config).unwrap();
        let b = llm_cluster_sim::cluster::run(&config).unwrap();

        let mut ticks_a: Vec<(String, Option<u64>)> =
            a.requests.iter().map(|r| (r.id.clone(), r.completion_tick)).collect();
        let mut ticks_b: Vec<(String, Option<u64>)> =
            b.requests.iter().map(|r| (r.id.clone(), r.completion_tick)).collect();
        ticks_a.sort();
        ticks_b.sort();
        prop_assert_eq!(ticks_a, ticks_b);
    }

    /// Every completed/dropped record's scheduling delay, when present, is
    /// representable (not a saturated near-u64::MAX value that would
    /// indicate the admitted tick came after the first-scheduled tick).
    #[test]
    fn scheduling_delay_never_looks_like_an_underflow(
        num_instances in 1u32..3,
        total_gpu_blocks in 1u32..32,
        rate_per_sec in 1.0f64..100.0,
        num_requests in 0u64..40,
        seed in any::<u64>(),
    ) {
        let config = config_with(num_instances, total_gpu_blocks, rate_per_sec, num_requests, seed);
        let output = llm_cluster_sim::cluster::run(&config).unwrap();
        for record in &output.requests {
            if let Some(delay) = record.scheduling_delay_us {
                prop_assert!(delay < config.horizon_us * 10);
            }
        }
    }
}
