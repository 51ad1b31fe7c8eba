use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_cluster_sim::config::SimulationConfig;
use llm_cluster_sim::cluster;
use llm_cluster_sim::metrics::{render_kv_cache_block, render_per_slo_block, render_trace_summary};

#[derive(Parser)]
#[command(name = "llm-cluster-sim")]
#[command(about = "Deterministic discrete-event simulator for a clustered LLM inference service", long_about = None)]
struct Cli {
    /// Path to the simulation config file (JSON)
    #[arg(short, long, env = "SIM_CONFIG")]
    config: String,

    /// Override the config's RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Override the config's simulation horizon, in microseconds
    #[arg(long)]
    horizon_us: Option<u64>,

    /// Write the full JSON output envelope to this path instead of stdout
    #[arg(short, long)]
    out: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_cluster_sim=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = shellexpand::tilde(&cli.config).to_string();
    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("reading config file {config_path}"))?;
    let mut config: SimulationConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {config_path}"))?;

    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(horizon_us) = cli.horizon_us {
        config.horizon_us = horizon_us;
    }

    tracing::info!(model_id = %config.model_id, seed = config.seed, horizon_us = config.horizon_us, "starting simulation run");

    let started = std::time::Instant::now();
    let output = cluster::run(&config)?;
    tracing::info!(
        elapsed = %humantime::format_duration(started.elapsed()),
        run_at = %output.run_at,
        "simulation run completed"
    );

    print!("{}", render_trace_summary(&output.routing_trace));
    print!(
        "{}",
        render_kv_cache_block(
            output.cluster.preemption_rate,
            output.cluster.cache_hit_rate,
            output.cluster.kv_thrashing_rate,
        )
    );
    print!("{}", render_per_slo_block(&output.cluster.per_slo_class));

    let json = serde_json::to_string_pretty(&output)?;
    match cli.out {
        Some(path) => {
            std::fs::write(&path, json).with_context(|| format!("writing output to {path}"))?;
            tracing::info!(path, "wrote simulation output");
        }
        None => println!("{json}"),
    }

    Ok(())
}
