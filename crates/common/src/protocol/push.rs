// Message types for the project dirty-state push channel.
//
// Server -> client only. One JSON object per frame, discriminated by `type`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{EntityId, ModuleId, RunStatus, TableName, Timestamp};

/// Per-entity last-modification timestamps, partitioned by table.
pub type LastUpdatedMap = BTreeMap<TableName, BTreeMap<EntityId, Timestamp>>;

/// Full projection sent as the first message of every channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DirtyStateSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_last_updated: Option<Timestamp>,
    #[serde(default)]
    pub any_running: bool,
    #[serde(default)]
    pub module_dirty_states: BTreeMap<ModuleId, RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any_module_last_run: Option<Timestamp>,
    #[serde(default)]
    pub module_last_run: BTreeMap<ModuleId, Timestamp>,
    #[serde(default)]
    pub last_updated: LastUpdatedMap,
}

/// Every message the push channel can carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// Initial full snapshot.
    StartingProjectDirtyStates(DirtyStateSnapshot),

    /// Whether any background work is executing.
    #[serde(rename_all = "camelCase")]
    AnyRunning { any_running: bool },

    /// One line of script output for a module.
    #[serde(rename_all = "camelCase")]
    RScript { module_id: ModuleId, text: String },

    /// Status change for a batch of modules.
    #[serde(rename_all = "camelCase")]
    ModuleDirtyStateAndLastRun {
        ids: Vec<ModuleId>,
        dirty_or_run_status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_run: Option<Timestamp>,
    },

    /// Rows in one table were modified.
    #[serde(rename_all = "camelCase")]
    LastUpdated { ids: Vec<EntityId>, table_name: TableName, last_updated: Timestamp },

    /// Project-level metadata changed.
    #[serde(rename_all = "camelCase")]
    ProjectUpdated { last_updated: Timestamp },
}

impl PushMessage {
    /// Wire discriminators, in declaration order.
    pub const KINDS: [&'static str; 6] = [
        "starting_project_dirty_states",
        "any_running",
        "r_script",
        "module_dirty_state_and_last_run",
        "last_updated",
        "project_updated",
    ];

    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Read just the `type` tag of a payload that may not decode as a whole.
    pub fn peek_kind(payload: &str) -> Option<String> {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "type")]
            kind: String,
        }
        serde_json::from_str::<Envelope>(payload).ok().map(|envelope| envelope.kind)
    }

    /// Whether `payload` is tagged as the initial snapshot.
    pub fn is_snapshot_payload(payload: &str) -> bool {
        Self::peek_kind(payload).as_deref() == Some(Self::KINDS[0])
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartingProjectDirtyStates(_) => Self::KINDS[0],
            Self::AnyRunning { .. } => Self::KINDS[1],
            Self::RScript { .. } => Self::KINDS[2],
            Self::ModuleDirtyStateAndLastRun { .. } => Self::KINDS[3],
            Self::LastUpdated { .. } => Self::KINDS[4],
            Self::ProjectUpdated { .. } => Self::KINDS[5],
        }
    }
}
