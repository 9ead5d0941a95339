// `statesync snapshot`: wait for readiness, print the state once.

use std::time::Duration;

use anyhow::anyhow;
use clap::Args;

use statesync_client::session::{ProjectSession, SessionHandle};
use statesync_client::store::DirtyState;

use super::{cannot_connect, summarize, ConnectArgs};
use crate::exit_code::CliError;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct SnapshotArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Give up if no snapshot arrives within this many seconds.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Force JSON output.
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: SnapshotArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let state = fetch_snapshot(&args).await?;
    output::print_output(format, &state, format_human)?;
    Ok(())
}

/// How waiting for the first snapshot ended.
enum Waited {
    Ready,
    Stopped,
    GaveUp,
}

async fn fetch_snapshot(args: &SnapshotArgs) -> anyhow::Result<DirtyState> {
    let config = args.connect.resolve_config()?;
    let project = &args.connect.project;
    let handle = SessionHandle::new();
    let mut session = ProjectSession::from_config(&handle, project, &config)?;
    let mut state_rx = session.scope().subscribe()?;
    let mut connection_rx = session.subscribe_connection();
    session.connect();

    let timeout = Duration::from_secs(args.timeout_secs);
    let waited = tokio::time::timeout(timeout, async {
        tokio::select! {
            biased;
            ready = state_rx.wait_for(|state| state.is_ready) => {
                if ready.is_ok() { Waited::Ready } else { Waited::Stopped }
            }
            _ = connection_rx.wait_for(|state| state.is_terminal()) => Waited::GaveUp,
        }
    })
    .await;
    let last_connection = session.connection_state();
    let snapshot = handle.get_snapshot();
    session.shutdown().await;

    match waited {
        Ok(Waited::Ready) => {
            snapshot.ok_or_else(|| anyhow!("session unmounted before the snapshot was read"))
        }
        Ok(Waited::Stopped) => Err(anyhow!("push channel stopped before a snapshot arrived")),
        Ok(Waited::GaveUp) => Err(cannot_connect(project, &config).into()),
        Err(_) => Err(CliError::NotReady { secs: args.timeout_secs, connection: last_connection }.into()),
    }
}

fn format_human(state: &DirtyState) -> String {
    let mut lines = vec![summarize(state)];
    for (module_id, status) in &state.module_dirty_states {
        let mut line = format!("  {module_id}  {status}");
        if let Some(ts) = state.module_last_run(module_id) {
            line.push_str(&format!("  last_run={ts}"));
        }
        if let Some(log) = state.module_log_lines.get(module_id) {
            line.push_str(&format!("  \"{log}\""));
        }
        lines.push(line);
    }
    for (table, entries) in &state.last_updated {
        lines.push(format!("  {table}: {} updated", entries.len()));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use statesync_common::types::{RunStatus, TableName, Timestamp};

    #[test]
    fn human_output_lists_modules_and_tables() {
        let mut state = DirtyState { is_ready: true, ..DirtyState::default() };
        state.module_dirty_states.insert("m001".into(), RunStatus::Running);
        state.module_log_lines.insert("m001".into(), "Loading data".into());
        state
            .last_updated
            .entry(TableName::Slides)
            .or_default()
            .insert("abc".into(), Timestamp::from("2024-01-01T00:00:00Z"));

        let text = format_human(&state);
        assert!(text.contains("m001  running  \"Loading data\""));
        assert!(text.contains("slides: 1 updated"));
    }

    #[tokio::test]
    async fn missing_server_is_a_usage_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();

        let args = SnapshotArgs {
            connect: ConnectArgs { project: "p1".into(), server: None, transport: None, config: Some(path) },
            timeout_secs: 1,
            json: true,
        };
        let error = fetch_snapshot(&args).await.unwrap_err();
        assert!(matches!(error.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    #[tokio::test]
    async fn unreachable_server_fails_fast_with_cannot_connect() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            format!(
                "server_url = \"http://{addr}\"\n\n[reconnect]\nbase_delay_ms = 10\nmax_delay_ms = 50\nmax_attempts = 2\n"
            ),
        )
        .unwrap();

        let args = SnapshotArgs {
            connect: ConnectArgs { project: "p1".into(), server: None, transport: None, config: Some(path) },
            timeout_secs: 60,
            json: true,
        };
        let error = tokio::time::timeout(Duration::from_secs(5), fetch_snapshot(&args))
            .await
            .expect("should not wait out the readiness timeout")
            .unwrap_err();

        assert!(matches!(
            error.downcast_ref::<CliError>(),
            Some(CliError::CannotConnect { attempts: 3, .. })
        ));
        assert_eq!(crate::exit_code::ExitCode::from_error(&error).code(), 10);
        assert!(error.to_string().starts_with("cannot connect to project `p1`"));
    }
}
