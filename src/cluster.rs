//! Cluster coordinator (C10): owns the instance list, workload generator,
//! router and admission controller, and drives the single outer event
//! loop as a plain function, not a background runtime.
//!
//! Data flow: workload -> admission -> router -> instance scheduler ->
//! metrics. The per-instance scheduler already performs all batch-formation
//! and state-transition work synchronously inside `Scheduler::try_step`;
//! the `StepStart`/`StepComplete` events this module schedules exist purely
//! to pace the clock and re-trigger the next step at the right tick, not to
//! repeat any work the scheduler already did.

use crate::admission::{AdmissionController, AdmissionDecision};
use crate::clock::{Clock, Event, EventKind};
use crate::config::SimulationConfig;
use crate::error::SimError;
use crate::instance::Instance;
use crate::metrics::MetricsCollector;
use crate::request::{Request, RequestRecord};
use crate::router::{Router, ScorerKind};
use crate::workload::WorkloadGenerator;

/// Runs one complete simulation from a validated `SimulationConfig` to a
/// finalized `SimulationOutput`. The only public entry point of the core
/// simulation engine; CLI/logging/config-loading live in `main.rs`.
pub fn run(config: &SimulationConfig) -> Result<crate::metrics::SimulationOutput, SimError> {
    config.validate()?;

    let mut clock = Clock::new();
    let scheduler_config = config.scheduler_config();
    let latency = config.build_latency_model()?;

    let mut instances: Vec<Instance> = (0..config.num_instances)
        .map(|id| {
            let kv = crate::kv::KvCacheEngine::new(
                config.block_size_tokens,
                config.total_gpu_blocks,
                config.total_cpu_blocks,
                config.per_block_transfer_us,
            );
            Instance::new(id, scheduler_config.clone(), kv, latency.clone())
        })
        .collect();
    let mut active = vec![false; instances.len()];

    let weights: Vec<(ScorerKind, f64)> = config
        .routing_weights
        .iter()
        .filter_map(|(name, weight)| parse_scorer_kind(name).map(|kind| (kind, *weight)))
        .collect();
    let mut router = Router::with_snapshot_overrides(&weights, &config.snapshot_policy);

    let mut admission = AdmissionController::from_config(config.admission_policy);
    let mut workload = WorkloadGenerator::new(config.workload.clone(), config.seed);
    let mut metrics = MetricsCollector::new(config.horizon_us);

    let mut pending_arrival: Option<Request> = workload.next_request(config.horizon_us);
    if let Some(ref req) = pending_arrival {
        clock.schedule(Event::new(req.arrival_tick, EventKind::Arrival))?;
    }

    while let Some(next_tick) = clock.peek_next_tick() {
        if next_tick > config.horizon_us {
            break;
        }
        let event = clock.advance().expect("peeked tick must still be present");

        match event.kind {
            EventKind::Arrival => {
                let request = pending_arrival
                    .take()
                    .expect("Arrival event fired with no pending request");
                handle_arrival(
                    request,
                    event.tick,
                    &mut instances,
                    &mut active,
                    &mut router,
                    &mut admission,
                    &mut metrics,
                    &mut clock,
                )?;

                pending_arrival = workload.next_request(config.horizon_us);
                if let Some(ref next) = pending_arrival {
                    clock.schedule(Event::new(next.arrival_tick, EventKind::Arrival))?;
                }
            }
            EventKind::StepStart => {
                let id = event.instance_id.expect("StepStart always carries an instance id");
                run_step(id, &mut instances, &mut active, &mut clock, &mut metrics, config.horizon_us)?;
            }
            EventKind::StepComplete => {
                let id = event.instance_id.expect("StepComplete always carries an instance id");
                // Re-enter the scheduler at the same tick to form the next batch.
                clock.schedule(Event::new(event.tick, EventKind::StepStart).with_instance(id))?;
            }
            EventKind::KvTransferComplete => {
                // Bookkeeping only: `admit_from_waiting` checks
                // `cpu_transfer_ready_tick` directly rather than reacting to
                // this event, so no action is needed here beyond having let
                // the clock advance past it.
            }
            EventKind::Admission
            | EventKind::Route
            | EventKind::Enqueue
            | EventKind::TokenGenerated
            | EventKind::RequestFinished
            | EventKind::Preemption
            | EventKind::HorizonReached => {
                // Not independently scheduled by this coordinator: Admission/
                // Route/Enqueue collapse into the synchronous `Arrival`
                // handling below, and TokenGenerated/RequestFinished/
                // Preemption are produced and consumed inside
                // `Scheduler::try_step` without a standalone event pop.
            }
        }
    }

    finalize(instances, router, metrics, config.horizon_us)
}

#[allow(clippy::too_many_arguments)]
fn handle_arrival(
    mut request: Request,
    now: u64,
    instances: &mut [Instance],
    active: &mut [bool],
    router: &mut Router,
    admission: &mut AdmissionController,
    metrics: &mut MetricsCollector,
    clock: &mut Clock,
) -> Result<(), SimError> {
    match admission.admit(now) {
        AdmissionDecision::Reject => {
            metrics.record_rejection();
            router.record_rejection();
            return Ok(());
        }
        AdmissionDecision::Admit => {}
    }
    request.admitted_tick = Some(now);

    let refs: Vec<&Instance> = instances.iter().collect();
    let Some(target) = router.route(&request, &refs, now) else {
        // No live instances to route to: treat like a rejection so the
        // request doesn't vanish from conservation accounting.
        metrics.record_rejection();
        router.record_rejection();
        return Ok(());
    };

    request.routed_tick = Some(now);
    request.handling_instance_id = Some(target);
    let inst = &mut instances[target as usize];
    inst.enqueue(request);
    metrics.instance_counters_mut(target).injected += 1;

    if !active[target as usize] {
        clock.schedule(Event::new(now, EventKind::StepStart).with_instance(target))?;
        active[target as usize] = true;
    }
    Ok(())
}

fn run_step(
    instance_id: u32,
    instances: &mut [Instance],
    active: &mut [bool],
    clock: &mut Clock,
    metrics: &mut MetricsCollector,
    horizon_us: u64,
) -> Result<(), SimError> {
    let inst = &mut instances[instance_id as usize];

    let dropped = inst.admit(clock.now());
    if !dropped.is_empty() {
        metrics.instance_counters_mut(instance_id).dropped_unservable += dropped.len() as u64;
        for record in dropped {
            metrics.record_completion(record);
        }
    }

    let (outcome, finished) = inst.try_step(clock)?;
    for request in finished {
        // A step that starts at or before the horizon can still finish a
        // request after it (completion_tick = now + duration_us +
        // token_overhead_us). Such a request is truncated by the horizon
        // exactly like one still queued or running there, so it is
        // counted as still running rather than completed, keeping it out
        // of the latency aggregates alongside every other truncated tail.
        let record = RequestRecord::from_request(&request);
        if record.completion_tick.map_or(false, |tick| tick <= horizon_us) {
            metrics.instance_counters_mut(instance_id).completed += 1;
        } else {
            metrics.instance_counters_mut(instance_id).still_running += 1;
        }
        metrics.record_completion(record);
    }

    match outcome {
        crate::scheduler::StepOutcome::Empty => {
            active[instance_id as usize] = false;
        }
        crate::scheduler::StepOutcome::Scheduled { .. } => {
            // `Scheduler::try_step` already scheduled the `StepComplete`
            // event that will re-enter this instance; stay active.
        }
    }
    Ok(())
}

fn finalize(
    mut instances: Vec<Instance>,
    router: Router,
    mut metrics: MetricsCollector,
    horizon_us: u64,
) -> Result<crate::metrics::SimulationOutput, SimError> {
    for inst in &mut instances {
        let id = inst.id;
        let still_queued = inst.still_queued();
        let still_running = inst.still_running();
        for record in inst.drain_unfinished() {
            metrics.record_completion(record);
        }
        let counters = metrics.instance_counters_mut(id);
        counters.still_queued = still_queued;
        // Add rather than overwrite: `run_step` may already have credited
        // this instance with requests that finished after the horizon
        // (see the still_running bump there), which never show up in
        // `inst.still_running()` since the scheduler has already released
        // them.
        counters.still_running += still_running;
        counters.preemption_count = inst.preemption_count();
    }

    let hit_rates: Vec<(u32, f64)> = instances.iter().map(|i| (i.id, i.cache_hit_rate())).collect();
    let thrash_rates: Vec<(u32, f64)> = instances.iter().map(|i| (i.id, i.kv_thrashing_rate())).collect();
    let preemptions: Vec<(u32, u64)> = instances.iter().map(|i| (i.id, i.preemption_count())).collect();

    let output = metrics.finalize(
        |id| hit_rates.iter().find(|(i, _)| *i == id).map(|(_, v)| *v).unwrap_or(1.0),
        |id| thrash_rates.iter().find(|(i, _)| *i == id).map(|(_, v)| *v).unwrap_or(0.0),
        |id| preemptions.iter().find(|(i, _)| *i == id).map(|(_, v)| *v).unwrap_or(0),
        router.trace().clone(),
    );

    tracing::info!(
        injected = output.injected_requests,
        completed = output.completed_requests,
        rejected = output.rejected_requests,
        dropped_unservable = output.dropped_unservable,
        horizon_us,
        "simulation finalized"
    );
    Ok(output)
}

fn parse_scorer_kind(name: &str) -> Option<ScorerKind> {
    match name {
        "queue-depth" => Some(ScorerKind::QueueDepth),
        "kv-utilization" => Some(ScorerKind::KvUtilization),
        "prefix-affinity" => Some(ScorerKind::PrefixAffinity),
        "least-loaded" => Some(ScorerKind::LeastLoaded),
        "round-robin" => Some(ScorerKind::RoundRobin),
        _ => None,
    }
}
