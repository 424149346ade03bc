use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Reserved key inside `data_store` holding the request history.
pub const HISTORY_KEY: &str = "history";

/// How many history records are kept for display.
pub const HISTORY_LIMIT: usize = 10;

/// One remembered free-text request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub text: String,
}

/// Durable snapshot of agent identity plus session-visible data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub version: String,
    /// Immutable after first creation; survives every save/load cycle.
    pub created_at: DateTime<Utc>,
    /// Incremented exactly once per successfully committed mutation.
    pub mutation_count: u64,
    #[serde(default)]
    pub data_store: HashMap<String, Value>,
}

impl Default for AgentState {
    fn default() -> Self {
        let mut data_store = HashMap::new();
        data_store.insert(
            "sample_data".to_string(),
            serde_json::json!(["Rust", "AI", "Networking"]),
        );
        data_store.insert(
            "settings".to_string(),
            serde_json::json!({"auto_backup": true, "verbose": true}),
        );
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
            mutation_count: 0,
            data_store,
        }
    }
}

impl AgentState {
    /// Append a history record, trimming to the last `HISTORY_LIMIT` entries.
    pub fn push_history(&mut self, actor: &str, text: &str) {
        let mut records = self.history();
        records.push(HistoryRecord {
            timestamp: Utc::now(),
            actor: actor.to_string(),
            text: text.to_string(),
        });
        if records.len() > HISTORY_LIMIT {
            let drop = records.len() - HISTORY_LIMIT;
            records.drain(..drop);
        }
        match serde_json::to_value(&records) {
            Ok(value) => {
                self.data_store.insert(HISTORY_KEY.to_string(), value);
            }
            Err(e) => warn!(error = %e, "failed to serialize history records"),
        }
    }

    /// Current history window, oldest first. Malformed entries are dropped.
    pub fn history(&self) -> Vec<HistoryRecord> {
        self.data_store
            .get(HISTORY_KEY)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Errors from persisting the state snapshot.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// JSON snapshot store for `AgentState`.
///
/// Loading tolerates a missing or corrupt file by falling back to defaults;
/// saving writes a temp file and renames it so a crash mid-write cannot leave
/// a truncated snapshot.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load the previous snapshot, or defaults when absent or unreadable.
    pub fn load(&self) -> AgentState {
        match fs::read_to_string(&self.path) {
            Ok(data) => match serde_json::from_str::<AgentState>(&data) {
                Ok(state) => {
                    info!(
                        version = %state.version,
                        mutations = state.mutation_count,
                        "previous state loaded"
                    );
                    state
                }
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "state file corrupt, starting from defaults"
                    );
                    AgentState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AgentState::default(),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "state file unreadable, starting from defaults"
                );
                AgentState::default()
            }
        }
    }

    /// Persist the snapshot atomically.
    pub fn save(&self, state: &AgentState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
