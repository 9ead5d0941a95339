// Dirty-state store: the client's projection of server-side project state.
//
// Backed by a `tokio::sync::watch` channel so consumers can either subscribe
// (reactive) or clone the current value. Every timestamped field is written
// through `statesync_common::ordering::accept`; subscribers are notified only
// when a write actually changes something.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use statesync_common::ordering;
use statesync_common::protocol::push::{DirtyStateSnapshot, LastUpdatedMap};
use statesync_common::types::{ModuleId, RunStatus, TableName, Timestamp};

/// Current view of one project session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtyState {
    /// Latched once the first snapshot has been applied.
    pub is_ready: bool,
    pub project_last_updated: Option<Timestamp>,
    pub any_running: bool,
    /// Never pruned: every module the server mentioned keeps an entry.
    pub module_dirty_states: BTreeMap<ModuleId, RunStatus>,
    pub any_module_last_run: Option<Timestamp>,
    pub module_last_run: BTreeMap<ModuleId, Timestamp>,
    pub last_updated: LastUpdatedMap,
    /// Latest script output line per module. Transient, not ordered.
    #[serde(default)]
    pub module_log_lines: BTreeMap<ModuleId, String>,
}

impl DirtyState {
    pub fn entity_last_updated(&self, table: TableName, entity_id: &str) -> Option<&Timestamp> {
        self.last_updated.get(&table).and_then(|entries| entries.get(entity_id))
    }

    pub fn module_status(&self, module_id: &str) -> Option<RunStatus> {
        self.module_dirty_states.get(module_id).copied()
    }

    pub fn module_last_run(&self, module_id: &str) -> Option<&Timestamp> {
        self.module_last_run.get(module_id)
    }

    /// Number of modules that still need a run.
    pub fn dirty_module_count(&self) -> usize {
        self.module_dirty_states.values().filter(|s| **s != RunStatus::Ready).count()
    }
}

/// Cloneable handle to the shared dirty state of one session.
#[derive(Debug, Clone)]
pub struct DirtyStateStore {
    tx: Arc<watch::Sender<DirtyState>>,
}

impl Default for DirtyStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DirtyStateStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(DirtyState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Reactive read: the receiver is notified on every effective change.
    pub fn subscribe(&self) -> watch::Receiver<DirtyState> {
        self.tx.subscribe()
    }

    /// Deep copy of the current state. Registers no subscription.
    pub fn current(&self) -> DirtyState {
        self.tx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.tx.borrow().is_ready
    }

    /// Apply a full snapshot.
    ///
    /// The first snapshot of a session overwrites every scalar field and
    /// latches `is_ready`. Later snapshots (after a reconnect) still
    /// overwrite flags and statuses but guard every timestamp. Per-entity
    /// timestamps are always guarded since an optimistic write may have
    /// landed first.
    pub fn apply_snapshot(&self, snapshot: DirtyStateSnapshot) {
        self.tx.send_modify(|state| {
            let first = !state.is_ready;

            if first {
                if let Some(ts) = snapshot.project_last_updated {
                    state.project_last_updated = Some(ts);
                }
                if let Some(ts) = snapshot.any_module_last_run {
                    state.any_module_last_run = Some(ts);
                }
                state.module_last_run.extend(snapshot.module_last_run);
            } else {
                if let Some(ts) = &snapshot.project_last_updated {
                    guarded_set(&mut state.project_last_updated, ts, "projectLastUpdated");
                }
                if let Some(ts) = &snapshot.any_module_last_run {
                    guarded_set(&mut state.any_module_last_run, ts, "anyModuleLastRun");
                }
                for (module_id, ts) in &snapshot.module_last_run {
                    guarded_insert(&mut state.module_last_run, module_id, ts, "moduleLastRun");
                }
            }

            state.any_running = snapshot.any_running;
            let module_count = snapshot.module_dirty_states.len();
            state.module_dirty_states.extend(snapshot.module_dirty_states);

            let mut accepted = 0usize;
            for (table, entries) in snapshot.last_updated {
                for (entity_id, ts) in entries {
                    if guarded_insert_entity(&mut state.last_updated, table, &entity_id, &ts) {
                        accepted += 1;
                    }
                }
            }

            state.is_ready = true;
            info!(first, modules = module_count, entities = accepted, "applied dirty-state snapshot");
        });
    }

    pub fn set_any_running(&self, any_running: bool) {
        self.tx.send_if_modified(|state| {
            let changed = state.any_running != any_running;
            state.any_running = any_running;
            changed
        });
    }

    pub fn set_module_log_line(&self, module_id: &str, text: &str) {
        self.tx.send_if_modified(|state| {
            if state.module_log_lines.get(module_id).is_some_and(|line| line == text) {
                return false;
            }
            state.module_log_lines.insert(module_id.to_string(), text.to_string());
            true
        });
    }

    /// Record a status for each module.
    ///
    /// A `ready` status carrying `last_run` also advances `module_last_run`
    /// for each id and `any_module_last_run`, both through the ordering gate.
    pub fn set_module_statuses(
        &self,
        module_ids: &[ModuleId],
        status: RunStatus,
        last_run: Option<&Timestamp>,
    ) {
        self.tx.send_if_modified(|state| {
            let mut changed = false;
            for module_id in module_ids {
                if state.module_dirty_states.insert(module_id.clone(), status) != Some(status) {
                    changed = true;
                }
            }

            match (status, last_run) {
                (RunStatus::Ready, Some(ts)) => {
                    for module_id in module_ids {
                        changed |=
                            guarded_insert(&mut state.module_last_run, module_id, ts, "moduleLastRun");
                    }
                    changed |= guarded_set(&mut state.any_module_last_run, ts, "anyModuleLastRun");
                }
                (_, Some(ts)) => {
                    debug!(%status, last_run = %ts, "ignoring lastRun on non-ready status");
                }
                (_, None) => {}
            }

            changed
        });
    }

    /// Guarded write of the project-level timestamp. Returns whether it was accepted.
    pub fn set_project_last_updated(&self, ts: &Timestamp) -> bool {
        let mut accepted = false;
        self.tx.send_if_modified(|state| {
            accepted = guarded_set(&mut state.project_last_updated, ts, "projectLastUpdated");
            accepted
        });
        accepted
    }

    /// Guarded write of one entity's timestamp. Returns whether it was accepted.
    pub fn set_entity_last_updated(&self, table: TableName, entity_id: &str, ts: &Timestamp) -> bool {
        let mut accepted = false;
        self.tx.send_if_modified(|state| {
            accepted = guarded_insert_entity(&mut state.last_updated, table, entity_id, ts);
            accepted
        });
        accepted
    }

    /// Guarded write of the same timestamp to several entities of one table.
    /// Returns how many entities accepted it.
    pub fn set_entities_last_updated(
        &self,
        table: TableName,
        entity_ids: &[String],
        ts: &Timestamp,
    ) -> usize {
        let mut accepted = 0;
        self.tx.send_if_modified(|state| {
            accepted = entity_ids
                .iter()
                .filter(|id| guarded_insert_entity(&mut state.last_updated, table, id, ts))
                .count();
            accepted > 0
        });
        accepted
    }
}

fn guarded_set(slot: &mut Option<Timestamp>, candidate: &Timestamp, context: &str) -> bool {
    if !ordering::accept(candidate, slot.as_ref(), context) {
        return false;
    }
    *slot = Some(candidate.clone());
    true
}

fn guarded_insert(
    map: &mut BTreeMap<String, Timestamp>,
    key: &str,
    candidate: &Timestamp,
    context: &str,
) -> bool {
    if !ordering::accept(candidate, map.get(key), context) {
        return false;
    }
    map.insert(key.to_string(), candidate.clone());
    true
}

/// Like `guarded_insert`, but only creates the table entry once a write is
/// accepted.
fn guarded_insert_entity(
    map: &mut LastUpdatedMap,
    table: TableName,
    entity_id: &str,
    candidate: &Timestamp,
) -> bool {
    let current = map.get(&table).and_then(|entries| entries.get(entity_id));
    if !ordering::accept(candidate, current, table.as_str()) {
        return false;
    }
    map.entry(table).or_default().insert(entity_id.to_string(), candidate.clone());
    true
}
