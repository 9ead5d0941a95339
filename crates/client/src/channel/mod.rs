// Push-channel manager: one long-lived inbound connection per project session.
//
// Owns the connection state machine and reconnect backoff, and decodes push
// messages into the dirty-state store. Transport is abstracted via
// `PushTransport` for testability; WebSocket and SSE implementations live in
// the submodules.

pub mod sse;
pub mod ws;

#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;

use statesync_common::protocol::push::PushMessage;

use crate::project::ProjectRefetcher;
use crate::store::DirtyStateStore;

// ── Configuration ───────────────────────────────────────────────────

/// Reconnection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl ReconnectPolicy {
    /// `min(max_delay, base_delay * 2^attempt)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(31);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Wire transport used for the push channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Websocket,
    Sse,
}

/// Build the push endpoint for a project: `{server}/project/{id}/dirty_states`.
///
/// The server URL must use https unless it points at a loopback host. For the
/// WebSocket transport the scheme is mapped to `ws`/`wss`.
pub fn push_endpoint(server_url: &str, project_id: &str, kind: TransportKind) -> Result<Url> {
    let mut url = validate_server_url(server_url)?;
    if project_id.trim().is_empty() {
        return Err(anyhow!("project id must not be empty"));
    }

    url.path_segments_mut()
        .map_err(|_| anyhow!("server_url `{server_url}` cannot carry a path"))?
        .pop_if_empty()
        .extend(["project", project_id, "dirty_states"]);

    if kind == TransportKind::Websocket {
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| anyhow!("cannot switch `{url}` to {scheme}"))?;
    }

    Ok(url)
}

pub(crate) fn validate_server_url(value: &str) -> Result<Url> {
    let parsed =
        Url::parse(value).map_err(|error| anyhow!("invalid server_url `{value}`: {error}"))?;
    match parsed.scheme() {
        "https" => Ok(parsed),
        "http" if is_loopback_host(parsed.host_str()) => Ok(parsed),
        _ => Err(anyhow!("server_url must use https (http is allowed only for localhost testing)")),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

// ── Transport trait ─────────────────────────────────────────────────

/// Abstraction over the network transport for testability.
pub trait PushTransport: Send + 'static {
    /// Open the channel.
    fn open(&mut self, endpoint: &Url) -> impl Future<Output = Result<()>> + Send;

    /// Next message payload. Returns `None` on clean close.
    fn recv(&mut self) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Close the channel. Safe to call when nothing is open.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

// ── Connection state ────────────────────────────────────────────────

/// Current state of the push channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Opening, or waiting out the backoff before the next attempt.
    Connecting,
    Connected,
    /// Retry budget spent. No further automatic connects.
    Failed,
}

impl ConnectionState {
    /// Whether the channel gave up and will not recover on its own.
    pub fn is_terminal(self) -> bool {
        self == Self::Failed
    }
}

/// What the run loop does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep reading from the open channel.
    Continue,
    /// The channel failed; reconnect after the delay.
    RetryAfter(Duration),
    /// The retry budget is spent.
    Exhausted,
}

// ── Connection manager ──────────────────────────────────────────────

/// Manages the push-channel lifecycle for one project session.
pub struct PushChannelManager<T: PushTransport> {
    endpoint: Url,
    policy: ReconnectPolicy,
    transport: T,
    /// Detached on teardown, before the transport is closed.
    store: Option<DirtyStateStore>,
    refetcher: Option<Arc<dyn ProjectRefetcher>>,
    state_tx: watch::Sender<ConnectionState>,
    attempts: u32,
}

impl<T: PushTransport> PushChannelManager<T> {
    pub fn new(endpoint: Url, store: DirtyStateStore, transport: T) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            endpoint,
            policy: ReconnectPolicy::default(),
            transport,
            store: Some(store),
            refetcher: None,
            state_tx,
            attempts: 0,
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_refetcher(mut self, refetcher: Arc<dyn ProjectRefetcher>) -> Self {
        self.refetcher = Some(refetcher);
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Open the channel. A no-op while already connecting or connected.
    /// From `Failed` this is the manual path back: the retry budget starts over.
    pub async fn connect(&mut self) -> Step {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!(endpoint = %self.endpoint, "push channel already active");
                return Step::Continue;
            }
            ConnectionState::Failed => self.attempts = 0,
            ConnectionState::Disconnected => {}
        }
        self.open().await
    }

    /// One open attempt, regardless of the current state.
    async fn open(&mut self) -> Step {
        self.set_state(ConnectionState::Connecting);
        match self.transport.open(&self.endpoint).await {
            Ok(()) => {
                self.attempts = 0;
                self.set_state(ConnectionState::Connected);
                info!(endpoint = %self.endpoint, "push channel connected");
                Step::Continue
            }
            Err(error) => self.fail(&format!("open failed: {error:#}")).await,
        }
    }

    /// Read and apply the next message, opening first if not connected.
    pub async fn poll_message(&mut self) -> Step {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Disconnected | ConnectionState::Connecting => return self.open().await,
            ConnectionState::Failed => return Step::Exhausted,
        }

        match self.transport.recv().await {
            Ok(Some(payload)) => {
                self.dispatch(&payload);
                Step::Continue
            }
            Ok(None) => self.fail("connection closed by server").await,
            Err(error) => self.fail(&format!("{error:#}")).await,
        }
    }

    /// Close the failed channel and decide whether to retry. Stays
    /// `Connecting` while a retry is pending; `Failed` only once the budget
    /// is spent.
    async fn fail(&mut self, reason: &str) -> Step {
        self.transport.close().await;

        if self.attempts >= self.policy.max_attempts {
            self.set_state(ConnectionState::Failed);
            warn!(
                endpoint = %self.endpoint,
                attempts = self.attempts,
                reason,
                "push channel retry budget exhausted"
            );
            return Step::Exhausted;
        }

        self.set_state(ConnectionState::Connecting);
        let delay = self.policy.delay(self.attempts);
        self.attempts += 1;
        warn!(
            endpoint = %self.endpoint,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            reason,
            "push channel failed, scheduling reconnect"
        );
        Step::RetryAfter(delay)
    }

    /// Decode one payload and apply it. Malformed payloads are dropped.
    pub fn dispatch(&self, payload: &str) {
        match PushMessage::decode(payload) {
            Ok(message) => self.apply(message),
            Err(error) if PushMessage::is_snapshot_payload(payload) => {
                error!(
                    %error,
                    len = payload.len(),
                    "dropping undecodable dirty-state snapshot; state stays not ready until the next snapshot"
                );
            }
            Err(error) => {
                warn!(%error, len = payload.len(), "dropping malformed push message");
            }
        }
    }

    fn apply(&self, message: PushMessage) {
        let Some(store) = &self.store else {
            debug!(kind = message.kind(), "store detached, dropping push message");
            return;
        };
        debug!(kind = message.kind(), "applying push message");

        match message {
            PushMessage::StartingProjectDirtyStates(snapshot) => store.apply_snapshot(snapshot),
            PushMessage::AnyRunning { any_running } => store.set_any_running(any_running),
            PushMessage::RScript { module_id, text } => store.set_module_log_line(&module_id, &text),
            PushMessage::ModuleDirtyStateAndLastRun { ids, dirty_or_run_status, last_run } => {
                store.set_module_statuses(&ids, dirty_or_run_status, last_run.as_ref());
            }
            PushMessage::LastUpdated { ids, table_name, last_updated } => {
                store.set_entities_last_updated(table_name, &ids, &last_updated);
            }
            PushMessage::ProjectUpdated { last_updated } => {
                store.set_project_last_updated(&last_updated);
                if let Some(refetcher) = &self.refetcher {
                    refetcher.request_refetch(&last_updated);
                }
            }
        }
    }

    /// Detach from the store, close the transport, and reset to disconnected.
    pub async fn teardown(&mut self) {
        self.store = None;
        self.transport.close().await;
        self.set_state(ConnectionState::Disconnected);
        info!(endpoint = %self.endpoint, "push channel torn down");
    }

    /// Drive the channel until `shutdown` flips to true or its sender drops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut step = Step::Continue;
        loop {
            step = tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => break,
                next = self.advance(step) => next,
            };
        }
        self.teardown().await;
    }

    async fn advance(&mut self, previous: Step) -> Step {
        match previous {
            Step::Continue => self.poll_message().await,
            Step::RetryAfter(delay) => {
                tokio::time::sleep(delay).await;
                self.open().await
            }
            Step::Exhausted => std::future::pending().await,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
    }
}

/// Resolves once shutdown is requested or its sender is gone.
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
