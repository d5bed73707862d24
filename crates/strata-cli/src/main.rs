use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use strata_placement::{parse_policy, EvalOptions, Placement, PlanCache};
use strata_types::{ContainerId, NetworkMap, NodeInfo, PlacementPolicy};

#[derive(clap::Parser, Debug)]
#[command(name = "strata-place", about = "Evaluate a placement policy against a network map")]
struct Cli {
    /// Network map snapshot (JSON)
    #[arg(long)]
    netmap: PathBuf,
    /// Placement policy: `.json` files are read as JSON, anything else as policy text
    #[arg(long)]
    policy: PathBuf,
    /// Container identifier, 64 hex characters
    #[arg(long)]
    container: ContainerId,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Debug, Deserialize)]
struct PlacementConfig {
    deadline_ms: u64,
    plan_cache_capacity: usize,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    placement: PlacementConfig,
    observability: ObservabilityConfig,
}

fn load_policy(path: &Path) -> anyhow::Result<PlacementPolicy> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON policy {}", path.display()))
    } else {
        parse_policy(&raw).with_context(|| format!("invalid policy {}", path.display()))
    }
}

fn load_netmap(path: &Path) -> anyhow::Result<NetworkMap> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read network map {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid network map {}", path.display()))
}

fn describe(node: &NodeInfo) -> String {
    let key = hex::encode(&node.public_key);
    match node.addresses.first() {
        Some(addr) => format!("{key} {addr}"),
        None => key,
    }
}

fn print_text(placement: &Placement) {
    println!("container {} epoch {}", placement.container, placement.epoch);
    for group in &placement.groups {
        println!(
            "replica {} ({}):",
            group.replica,
            group.selector.as_deref().unwrap_or("*")
        );
        for node in &group.primary {
            println!("  primary {}", describe(node));
        }
        for node in &group.backups {
            println!("  backup  {}", describe(node));
        }
        if let Some(s) = group.shortfall {
            println!("  short: {} of {} nodes available", s.available, s.requested);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("STRATA_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    // stdout carries the placement; logs go to stderr.
    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    let policy = load_policy(&cli.policy)?;
    let netmap = load_netmap(&cli.netmap)?;
    tracing::info!(
        policy = %cli.policy.display(),
        epoch = netmap.epoch(),
        nodes = netmap.len(),
        container = %cli.container,
        "evaluating placement"
    );

    let cache = PlanCache::new(config.placement.plan_cache_capacity);
    let plan = cache
        .get_or_compile(&policy)
        .context("policy failed to compile")?;

    let cancel = CancellationToken::new();
    let mut opts = EvalOptions::default().with_cancel(cancel.clone());
    if config.placement.deadline_ms > 0 {
        opts = opts.with_timeout(Duration::from_millis(config.placement.deadline_ms));
    }

    let container = cli.container;
    let task = tokio::task::spawn_blocking(move || plan.place(&netmap, &container, &opts));
    let placement = tokio::select! {
        joined = task => joined.context("placement task panicked")??,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            anyhow::bail!("interrupted");
        }
    };

    for (replica, s) in placement.shortfalls() {
        tracing::warn!(replica, requested = s.requested, available = s.available, "replica short of nodes");
    }

    match cli.format {
        OutputFormat::Json => {
            let out = serde_json::to_string_pretty(&placement).context("failed to encode placement")?;
            println!("{out}");
        }
        OutputFormat::Text => print_text(&placement),
    }

    Ok(())
}
