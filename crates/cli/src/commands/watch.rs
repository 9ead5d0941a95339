// `statesync watch`: stream state changes for one project.

use std::future::Future;

use clap::Args;
use serde::Serialize;
use tracing::debug;

use statesync_client::channel::ConnectionState;
use statesync_client::config::ClientConfig;
use statesync_client::session::{ProjectSession, SessionHandle};
use statesync_client::store::DirtyState;

use super::{cannot_connect, summarize, ConnectArgs};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct WatchArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Force JSON output (one event per line).
    #[arg(long)]
    pub json: bool,
}

/// One line of `watch` output.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WatchEvent {
    Connection { state: ConnectionState },
    State { state: Box<DirtyState> },
}

pub async fn run(args: WatchArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let config = args.connect.resolve_config()?;
    let interrupted = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    follow(format, &args.connect.project, &config, interrupted).await
}

/// Print events until `interrupted` resolves or the channel gives up.
async fn follow(
    format: OutputFormat,
    project: &str,
    config: &ClientConfig,
    interrupted: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let handle = SessionHandle::new();
    let mut session = ProjectSession::from_config(&handle, project, config)?;
    let scope = session.scope();
    let mut state_rx = scope.subscribe()?;
    let mut connection_rx = scope.subscribe_connection()?;
    session.connect();
    tokio::pin!(interrupted);
    let mut previous = ConnectionState::Disconnected;

    let outcome = loop {
        tokio::select! {
            _ = &mut interrupted => {
                debug!("interrupted");
                break Ok(());
            }
            changed = connection_rx.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = *connection_rx.borrow_and_update();
                if previous == ConnectionState::Connected && state == ConnectionState::Connecting {
                    output::print_warning(format, "CHANNEL_LOST", "push channel dropped; retrying");
                }
                previous = state;
                output::print_output(format, &WatchEvent::Connection { state }, format_human)?;
                if state.is_terminal() {
                    break Err(cannot_connect(project, config).into());
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = Box::new(state_rx.borrow_and_update().clone());
                output::print_output(format, &WatchEvent::State { state }, format_human)?;
            }
        }
    };

    session.shutdown().await;
    outcome
}

fn format_human(event: &WatchEvent) -> String {
    match event {
        WatchEvent::Connection { state } => format!("connection: {}", connection_label(*state)),
        WatchEvent::State { state } => summarize(state),
    }
}

fn connection_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "connected",
        ConnectionState::Failed => "failed",
    }
}
