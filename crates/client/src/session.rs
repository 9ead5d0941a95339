// Project session lifecycle and the accessor surface consumers go through.
//
// `ProjectSession` owns one store and one push channel for the lifetime of a
// mounted project. It registers itself with a `SessionHandle`, which is the
// injected, non-reactive way to read a snapshot, and hands out
// `ProjectScope`s, whose accessors fail fast once no session is mounted.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use statesync_common::types::{TableName, Timestamp};

use crate::bridge::OptimisticBridge;
use crate::channel::sse::SseTransport;
use crate::channel::ws::WsTransport;
use crate::channel::{
    push_endpoint, ConnectionState, PushChannelManager, PushTransport, ReconnectPolicy,
    TransportKind,
};
use crate::config::ClientConfig;
use crate::poller;
use crate::project::{metadata_url, HttpProjectRefetcher, ProjectMetadata, ProjectRefetcher};
use crate::store::{DirtyState, DirtyStateStore};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("`{accessor}` called outside an active project session")]
    OutsideSession { accessor: &'static str },
}

// ── Session slot ────────────────────────────────────────────────────

#[derive(Clone)]
struct MountedSession {
    id: Uuid,
    project_id: String,
    store: DirtyStateStore,
    connection: watch::Receiver<ConnectionState>,
    metadata: Option<watch::Receiver<Option<ProjectMetadata>>>,
}

type Slot = Arc<RwLock<Option<MountedSession>>>;

/// Injected handle for code that runs outside the reactive graph.
///
/// Cloning is cheap; every clone observes the same mount.
#[derive(Clone, Default)]
pub struct SessionHandle {
    slot: Slot,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep copy of the mounted session's state, or `None` when nothing is
    /// mounted. Registers no subscription.
    pub fn get_snapshot(&self) -> Option<DirtyState> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).as_ref().map(|s| s.store.current())
    }

    pub fn is_mounted(&self) -> bool {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Accessor surface bound to this handle's mount.
    pub fn scope(&self) -> ProjectScope {
        ProjectScope { slot: self.slot.clone() }
    }

    fn mount(&self, session: MountedSession) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.as_ref() {
            warn!(
                previous = %previous.project_id,
                next = %session.project_id,
                "replacing a mounted project session"
            );
        }
        *slot = Some(session);
    }

    /// Clear the slot if it still holds session `id`.
    fn unmount(&self, id: Uuid) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|s| s.id == id) {
            *slot = None;
        }
    }
}

// ── Accessor surface ────────────────────────────────────────────────

/// Read and optimistic-write accessors for the mounted project.
#[derive(Clone, Default)]
pub struct ProjectScope {
    slot: Slot,
}

impl ProjectScope {
    /// A scope with no session behind it. Every accessor fails.
    pub fn detached() -> Self {
        Self::default()
    }

    fn with_session<R>(
        &self,
        accessor: &'static str,
        f: impl FnOnce(&MountedSession) -> R,
    ) -> Result<R, ScopeError> {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().map(f).ok_or(ScopeError::OutsideSession { accessor })
    }

    pub fn project_id(&self) -> Result<String, ScopeError> {
        self.with_session("project_id", |s| s.project_id.clone())
    }

    pub fn dirty_state(&self) -> Result<DirtyState, ScopeError> {
        self.with_session("dirty_state", |s| s.store.current())
    }

    /// Reactive read: notified on every effective change.
    pub fn subscribe(&self) -> Result<watch::Receiver<DirtyState>, ScopeError> {
        self.with_session("subscribe", |s| s.store.subscribe())
    }

    pub fn is_ready(&self) -> Result<bool, ScopeError> {
        self.with_session("is_ready", |s| s.store.is_ready())
    }

    pub fn connection_state(&self) -> Result<ConnectionState, ScopeError> {
        self.with_session("connection_state", |s| *s.connection.borrow())
    }

    pub fn subscribe_connection(&self) -> Result<watch::Receiver<ConnectionState>, ScopeError> {
        self.with_session("subscribe_connection", |s| s.connection.clone())
    }

    /// Last fetched project metadata, if a refetcher is configured and has
    /// completed at least once.
    pub fn project_metadata(&self) -> Result<Option<ProjectMetadata>, ScopeError> {
        self.with_session("project_metadata", |s| {
            s.metadata.as_ref().and_then(|rx| rx.borrow().clone())
        })
    }

    pub fn optimistic_bridge(&self) -> Result<OptimisticBridge, ScopeError> {
        self.with_session("optimistic_bridge", |s| OptimisticBridge::new(s.store.clone()))
    }

    pub fn set_project_last_updated(&self, ts: &Timestamp) -> Result<bool, ScopeError> {
        self.with_session("set_project_last_updated", |s| {
            OptimisticBridge::new(s.store.clone()).set_project_last_updated(ts)
        })
    }

    pub fn set_entity_last_updated(
        &self,
        table: TableName,
        entity_id: &str,
        ts: &Timestamp,
    ) -> Result<bool, ScopeError> {
        self.with_session("set_entity_last_updated", |s| {
            OptimisticBridge::new(s.store.clone()).set_entity_last_updated(table, entity_id, ts)
        })
    }
}

// ── Session lifecycle ───────────────────────────────────────────────

/// Optional collaborators for a session.
#[derive(Clone, Default)]
pub struct SessionOptions {
    pub reconnect: ReconnectPolicy,
    pub refetcher: Option<Arc<dyn ProjectRefetcher>>,
}

/// One mounted project: store, push channel and their teardown.
pub struct ProjectSession {
    id: Uuid,
    project_id: String,
    store: DirtyStateStore,
    handle: SessionHandle,
    connection: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    /// The channel's run loop until `connect` spawns it.
    pending: Option<BoxFuture<'static, ()>>,
    task: Option<JoinHandle<()>>,
}

impl ProjectSession {
    /// Create the store and channel and register with `handle`. Does not
    /// connect yet.
    pub fn mount<T: PushTransport>(
        handle: &SessionHandle,
        project_id: impl Into<String>,
        endpoint: url::Url,
        transport: T,
        options: SessionOptions,
    ) -> Self {
        let id = Uuid::new_v4();
        let project_id = project_id.into();
        let store = DirtyStateStore::new();

        let mut manager = PushChannelManager::new(endpoint, store.clone(), transport)
            .with_reconnect_policy(options.reconnect);
        let metadata = options.refetcher.as_ref().and_then(|r| r.subscribe_metadata());
        if let Some(refetcher) = options.refetcher {
            manager = manager.with_refetcher(refetcher);
        }
        let connection = manager.subscribe_state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        handle.mount(MountedSession {
            id,
            project_id: project_id.clone(),
            store: store.clone(),
            connection: connection.clone(),
            metadata,
        });
        info!(%project_id, session_id = %id, endpoint = %manager.endpoint(), "project session mounted");

        Self {
            id,
            project_id,
            store,
            handle: handle.clone(),
            connection,
            shutdown_tx,
            pending: Some(manager.run(shutdown_rx).boxed()),
            task: None,
        }
    }

    /// Mount and connect in one step. Must be called inside a tokio runtime.
    pub fn start<T: PushTransport>(
        handle: &SessionHandle,
        project_id: impl Into<String>,
        endpoint: url::Url,
        transport: T,
        options: SessionOptions,
    ) -> Self {
        let mut session = Self::mount(handle, project_id, endpoint, transport, options);
        session.connect();
        session
    }

    /// Mount using the transport, cookie and backoff from `config`.
    pub fn from_config(
        handle: &SessionHandle,
        project_id: &str,
        config: &ClientConfig,
    ) -> Result<Self> {
        let server_url =
            config.server_url.as_deref().ok_or_else(|| anyhow!("server_url is not configured"))?;
        let endpoint = push_endpoint(server_url, project_id, config.transport)
            .context("failed to build push endpoint")?;
        let refetcher = HttpProjectRefetcher::new(
            metadata_url(server_url, project_id).context("failed to build metadata url")?,
            config.cookie.clone(),
        );
        let options = SessionOptions {
            reconnect: config.reconnect.policy(),
            refetcher: Some(Arc::new(refetcher)),
        };

        let cookie = config.cookie.clone();
        Ok(match config.transport {
            TransportKind::Websocket => {
                Self::mount(handle, project_id, endpoint, WsTransport::new(cookie), options)
            }
            TransportKind::Sse => {
                Self::mount(handle, project_id, endpoint, SseTransport::new(cookie), options)
            }
        })
    }

    /// Spawn the channel. Returns false (and does nothing) if it is already
    /// running or the session was shut down.
    pub fn connect(&mut self) -> bool {
        let Some(run) = self.pending.take() else {
            debug!(project_id = %self.project_id, "push channel already started");
            return false;
        };
        self.task = Some(tokio::spawn(run));
        true
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn scope(&self) -> ProjectScope {
        self.handle.scope()
    }

    pub fn store(&self) -> &DirtyStateStore {
        &self.store
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Run `tick` every `interval` while the channel is connected, stopping
    /// when the session shuts down.
    pub fn spawn_poller<F, Fut>(&self, interval: Duration, tick: F) -> JoinHandle<u64>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(poller::poll_while_connected(
            self.connection.clone(),
            interval,
            self.shutdown_tx.subscribe(),
            tick,
        ))
    }

    /// Stop the channel, wait for its teardown, then unmount.
    pub async fn shutdown(mut self) {
        self.shutdown_tx.send_replace(true);
        self.pending = None;
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(%error, project_id = %self.project_id, "push channel task ended abnormally");
            }
        }
        self.handle.unmount(self.id);
        info!(project_id = %self.project_id, session_id = %self.id, "project session unmounted");
    }
}

impl Drop for ProjectSession {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        self.handle.unmount(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MockTransport;

    const SNAPSHOT: &str = r#"{"type":"starting_project_dirty_states","anyRunning":true,"lastUpdated":{"slides":{"abc":"2024-01-01T00:00:00Z"}}}"#;

    fn mount(handle: &SessionHandle, transport: MockTransport) -> ProjectSession {
        let endpoint = url::Url::parse("wss://app.test/project/p1/dirty_states").unwrap();
        ProjectSession::mount(handle, "p1", endpoint, transport, SessionOptions::default())
    }

    // ── Snapshot access ─────────────────────────────────────────────

    #[test]
    fn snapshot_is_absent_before_mount() {
        assert!(SessionHandle::new().get_snapshot().is_none());
    }

    #[tokio::test]
    async fn snapshot_is_present_while_mounted_and_absent_after_shutdown() {
        let handle = SessionHandle::new();
        let session = mount(&handle, MockTransport::default());

        let snapshot = handle.get_snapshot().expect("mounted session should have a snapshot");
        assert!(!snapshot.is_ready);

        session.shutdown().await;
        assert!(handle.get_snapshot().is_none());
        assert!(!handle.is_mounted());
    }

    #[tokio::test]
    async fn snapshot_is_a_detached_copy() {
        let handle = SessionHandle::new();
        let session = mount(&handle, MockTransport::default());

        let before = handle.get_snapshot().unwrap();
        session.store().set_any_running(true);
        assert!(!before.any_running);
        assert!(handle.get_snapshot().unwrap().any_running);
    }

    // ── Scope ───────────────────────────────────────────────────────

    #[test]
    fn detached_scope_fails_fast() {
        let scope = ProjectScope::detached();
        assert_eq!(
            scope.dirty_state().unwrap_err(),
            ScopeError::OutsideSession { accessor: "dirty_state" }
        );
        let ts = Timestamp::from("2024-01-01T00:00:00Z");
        assert!(scope.set_entity_last_updated(TableName::Slides, "abc", &ts).is_err());
        assert!(scope.set_project_last_updated(&ts).is_err());
        assert!(scope.optimistic_bridge().is_err());
    }

    #[test]
    fn scope_error_names_the_accessor() {
        let error = ProjectScope::detached().is_ready().unwrap_err();
        assert_eq!(error.to_string(), "`is_ready` called outside an active project session");
    }

    #[tokio::test]
    async fn scope_outlives_session_but_fails_after_shutdown() {
        let handle = SessionHandle::new();
        let session = mount(&handle, MockTransport::default());
        let scope = session.scope();
        assert_eq!(scope.project_id().unwrap(), "p1");
        assert_eq!(scope.connection_state().unwrap(), ConnectionState::Disconnected);

        session.shutdown().await;
        assert!(scope.project_id().is_err());
    }

    #[tokio::test]
    async fn scope_writes_go_through_the_ordering_gate() {
        let handle = SessionHandle::new();
        let _session = mount(&handle, MockTransport::default());
        let scope = handle.scope();
        let t1 = Timestamp::from("2024-01-01T00:00:00Z");

        assert!(scope.set_entity_last_updated(TableName::Slides, "abc", &t1).unwrap());
        assert!(!scope.set_entity_last_updated(TableName::Slides, "abc", &t1).unwrap());
        assert_eq!(
            scope.dirty_state().unwrap().entity_last_updated(TableName::Slides, "abc"),
            Some(&t1)
        );
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    #[tokio::test]
    async fn start_mounts_and_connects() {
        let handle = SessionHandle::new();
        let transport = MockTransport::default();
        transport.queue_message(SNAPSHOT);
        let observed = transport.clone();
        let endpoint = url::Url::parse("wss://app.test/project/p1/dirty_states").unwrap();
        let mut session =
            ProjectSession::start(&handle, "p1", endpoint, transport, SessionOptions::default());

        let mut state = session.scope().subscribe().unwrap();
        state.wait_for(|s| s.is_ready).await.unwrap();
        assert!(!session.connect());
        assert_eq!(observed.opens(), 1);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let handle = SessionHandle::new();
        let transport = MockTransport::default();
        let observed = transport.clone();
        let mut session = mount(&handle, transport);

        assert!(session.connect());
        assert!(!session.connect());

        let mut connection = session.subscribe_connection();
        connection.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
        assert_eq!(observed.opens(), 1);
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_server_is_failed_only_once_retries_run_out() {
        let handle = SessionHandle::new();
        let transport = MockTransport::default();
        transport.fail_next_opens(100);
        let observed = transport.clone();
        let mut session = mount(&handle, transport);
        let mut connection = session.subscribe_connection();
        session.connect();

        // Inside the first 1s backoff: retrying, not given up.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(observed.opens(), 1);
        assert_eq!(session.connection_state(), ConnectionState::Connecting);

        connection.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(observed.opens(), 4, "initial attempt plus three retries");

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(observed.opens(), 4);
        assert_eq!(session.connection_state(), ConnectionState::Failed);
        assert!(!handle.get_snapshot().unwrap().is_ready);

        session.shutdown().await;
        assert_eq!(*connection.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn session_applies_snapshot_and_tears_down_in_order() {
        let handle = SessionHandle::new();
        let transport = MockTransport::default();
        transport.queue_message(SNAPSHOT);
        let observed = transport.clone();
        let mut session = mount(&handle, transport);
        let scope = session.scope();

        let mut state = scope.subscribe().unwrap();
        session.connect();
        state.wait_for(|s| s.is_ready).await.unwrap();
        assert!(scope.is_ready().unwrap());

        let connection = session.subscribe_connection();
        session.shutdown().await;
        assert_eq!(*connection.borrow(), ConnectionState::Disconnected);
        assert_eq!(observed.closes(), 1);
        assert!(handle.get_snapshot().is_none());
    }

    #[tokio::test]
    async fn dropping_an_old_session_keeps_the_new_mount() {
        let handle = SessionHandle::new();
        let old = mount(&handle, MockTransport::default());
        let new = mount(&handle, MockTransport::default());

        drop(old);
        assert!(handle.is_mounted());
        drop(new);
        assert!(!handle.is_mounted());
    }

    #[tokio::test(start_paused = true)]
    async fn poller_ticks_while_connected_and_stops_with_session() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let handle = SessionHandle::new();
        let mut session = mount(&handle, MockTransport::default());
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let poller = session.spawn_poller(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        });

        session.connect();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        session.shutdown().await;

        assert_eq!(poller.await.unwrap(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn from_config_requires_server_url() {
        let error = ProjectSession::from_config(&SessionHandle::new(), "p1", &ClientConfig::default())
            .err()
            .expect("missing server_url should fail");
        assert!(error.to_string().contains("server_url is not configured"));
    }
}
