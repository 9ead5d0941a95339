// CLI subcommand dispatch.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Subcommand, ValueEnum};

use statesync_client::channel::TransportKind;
use statesync_client::config::{self, ClientConfig};
use statesync_client::store::DirtyState;

use crate::exit_code::CliError;

pub mod snapshot;
pub mod watch;

#[derive(Subcommand)]
pub enum Command {
    /// Stream project state changes until interrupted
    Watch(watch::WatchArgs),
    /// Wait for the first full snapshot and print it once
    Snapshot(snapshot::SnapshotArgs),
}

impl Command {
    pub fn json_flag(&self) -> bool {
        match self {
            Command::Watch(args) => args.json,
            Command::Snapshot(args) => args.json,
        }
    }
}

pub fn run(cmd: Command) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    match cmd {
        Command::Watch(args) => runtime.block_on(watch::run(args)),
        Command::Snapshot(args) => runtime.block_on(snapshot::run(args)),
    }
}

// ── Shared connection flags ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Ws,
    Sse,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Ws => TransportKind::Websocket,
            TransportArg::Sse => TransportKind::Sse,
        }
    }
}

#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Project to follow.
    pub project: String,

    /// Server base URL. Overrides `server_url` from the config file.
    #[arg(long)]
    pub server: Option<String>,

    /// Push transport. Overrides `transport` from the config file.
    #[arg(long, value_enum)]
    pub transport: Option<TransportArg>,

    /// Config file (default: ~/.statesync/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ConnectArgs {
    /// Load the config file and apply command-line overrides.
    pub fn resolve_config(&self) -> anyhow::Result<ClientConfig> {
        let mut cfg = match &self.config {
            Some(path) => ClientConfig::load_from(path)
                .with_context(|| format!("failed to load config `{}`", path.display()))?,
            None => ClientConfig::load(),
        };
        apply_overrides(&mut cfg, self.server.as_deref(), self.transport);

        if cfg.server_url.is_none() {
            let path = self
                .config
                .clone()
                .or_else(config::global_config_path)
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "the config file".to_string());
            return Err(CliError::Usage(format!(
                "no server configured; pass --server or set server_url in {path}"
            ))
            .into());
        }
        Ok(cfg)
    }
}

/// The push channel spent its retry budget: initial attempt plus retries.
pub fn cannot_connect(project: &str, cfg: &ClientConfig) -> CliError {
    CliError::CannotConnect {
        project: project.to_string(),
        attempts: cfg.reconnect.max_attempts.saturating_add(1),
    }
}

fn apply_overrides(cfg: &mut ClientConfig, server: Option<&str>, transport: Option<TransportArg>) {
    if let Some(server) = server {
        cfg.server_url = Some(server.to_string());
    }
    if let Some(transport) = transport {
        cfg.transport = transport.into();
    }
}

// ── Human rendering ─────────────────────────────────────────────────

/// One-line summary of a dirty state.
pub fn summarize(state: &DirtyState) -> String {
    let mut parts = Vec::new();
    parts.push(if state.is_ready { "ready".to_string() } else { "loading".to_string() });
    parts.push(format!("running={}", if state.any_running { "yes" } else { "no" }));
    parts.push(format!(
        "dirty={}/{}",
        state.dirty_module_count(),
        state.module_dirty_states.len()
    ));
    if let Some(ts) = &state.any_module_last_run {
        parts.push(format!("last_run={ts}"));
    }
    if let Some(ts) = &state.project_last_updated {
        parts.push(format!("project_updated={ts}"));
    }
    let entities: usize = state.last_updated.values().map(|entries| entries.len()).sum();
    parts.push(format!("entities={entities}"));
    parts.join("  ")
}
