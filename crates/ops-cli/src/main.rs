use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use contracts::{EngineConfig, HostRecord, Operation, ProgressView, ValidationResult};
use ops_api::{default_sqlite_path, serve, EngineApi};
use ops_core::OperationEngine;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "opsctl", about = "Operation engine tooling", version)]
struct Cli {
    /// Engine configuration in TOML. Missing keys use defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API backed by a SQLite store.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
        /// Defaults to OPS_SQLITE_PATH, then ./operations.sqlite.
        #[arg(long)]
        sqlite: Option<PathBuf>,
    },
    /// Validate an operation registry without serving it.
    Check {
        registry: PathBuf,
        #[arg(long)]
        hosts: Option<PathBuf>,
    },
    /// Replay terminal commands for one player against an in-memory engine.
    Play {
        registry: PathBuf,
        #[arg(long)]
        hosts: PathBuf,
        /// One command per line. `confirm <operation_id>` confirms a manual step.
        #[arg(long)]
        actions: PathBuf,
        #[arg(long, default_value = "player-1")]
        player: String,
    },
}

#[derive(Debug, Serialize)]
struct PlayLine<'a> {
    line: &'a str,
    result: ValidationResult,
}

#[derive(Debug, Serialize)]
struct PlaySummary {
    progress: ProgressView,
    inbox: usize,
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid json in {}", path.display()))
}

async fn run_serve(
    config: EngineConfig,
    addr: SocketAddr,
    sqlite: Option<PathBuf>,
) -> anyhow::Result<()> {
    let sqlite_path = sqlite.unwrap_or_else(|| PathBuf::from(default_sqlite_path()));
    let mut api = EngineApi::from_config(config);
    api.attach_sqlite_store(&sqlite_path)
        .with_context(|| format!("failed to attach sqlite store {}", sqlite_path.display()))?;
    info!(sqlite = %sqlite_path.display(), "store ready");
    serve(addr, api).await.context("server error")
}

fn run_check(
    config: EngineConfig,
    registry: &Path,
    hosts: Option<&Path>,
) -> anyhow::Result<()> {
    let mut engine = OperationEngine::new(config);
    if let Some(hosts) = hosts {
        let records: Vec<HostRecord> = read_json(hosts)?;
        engine
            .register_hosts(records)
            .context("host catalog rejected")?;
    }

    let operations: Vec<Operation> = read_json(registry)?;
    match engine.publish(operations) {
        Ok(report) => {
            for warning in &report.warnings {
                println!("warning {}: {}", warning.operation_id, warning.message);
            }
            println!(
                "ok: {} operation(s), {} warning(s)",
                report.published.len(),
                report.warnings.len()
            );
            Ok(())
        }
        Err(err) => {
            for issue in err.issues() {
                println!("error {}: {}", issue.operation_id, issue.message);
            }
            bail!("registry rejected with {} issue(s)", err.issues().len())
        }
    }
}

fn run_play(
    config: EngineConfig,
    registry: &Path,
    hosts: &Path,
    actions: &Path,
    player: &str,
) -> anyhow::Result<()> {
    let api = EngineApi::from_config(config);
    api.register_hosts(read_json(hosts)?)
        .context("host catalog rejected")?;
    api.publish_operations(read_json(registry)?)
        .context("registry rejected")?;

    let script = fs::read_to_string(actions)
        .with_context(|| format!("failed to read {}", actions.display()))?;

    api.open_session(player);
    for line in script.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let result = match line.strip_prefix("confirm ") {
            Some(operation_id) => api.confirm_step(player, operation_id.trim()),
            None => api.submit_command(player, line),
        }
        .with_context(|| format!("command failed: {line}"))?;
        println!("{}", serde_json::to_string(&PlayLine { line, result })?);
    }

    let summary = PlaySummary {
        progress: api.get_progress_state(player),
        inbox: api.list_inbox_messages(player).len(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { addr, sqlite } => run_serve(config, addr, sqlite).await,
        Command::Check { registry, hosts } => run_check(config, &registry, hosts.as_deref()),
        Command::Play {
            registry,
            hosts,
            actions,
            player,
        } => run_play(config, &registry, &hosts, &actions, &player),
    }
}
