//! Atomic JSON snapshots of agent, task-queue, and sleep state.
//!
//! Layout: `state_dir/{agents,tasks,sleep,system}/`. Every write is
//! serialize → `*.tmp` → fsync → rename, guarded by a per-file lock so
//! concurrent snapshots never interleave. Records carry `{_saved_at,
//! _session_id, _version}` metadata that is stripped on load. Persistence
//! failures are non-fatal: the next snapshot retries.

use crate::types::Task;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const STATE_VERSION: &str = "1.0";

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid state record: {0}")]
    Validation(String),
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateRecord {
    pub agent_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub message_count: usize,
    pub error_count: u32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueState {
    pub agent_id: String,
    pub pending_tasks: Vec<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepState {
    pub agent_id: String,
    pub is_sleeping: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub wake_events: Vec<String>,
}

pub struct StatePersistence {
    state_dir: PathBuf,
    session_id: String,
    file_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl StatePersistence {
    /// Create the store, ensuring the subdirectory layout exists.
    pub fn new(
        state_dir: impl Into<PathBuf>,
        session_id: impl Into<String>,
    ) -> Result<Self, PersistenceError> {
        let state_dir = state_dir.into();
        for sub in ["agents", "tasks", "sleep", "system"] {
            let dir = state_dir.join(sub);
            std::fs::create_dir_all(&dir).map_err(|source| PersistenceError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }
        Ok(Self {
            state_dir,
            session_id: session_id.into(),
            file_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    // -- Agent records --

    pub fn save_agent_state(&self, record: &AgentStateRecord) -> Result<(), PersistenceError> {
        let path = self.agent_path(&record.agent_id);
        self.write_record(&path, record)
    }

    pub fn load_agent_state(
        &self,
        agent_id: &str,
    ) -> Result<Option<AgentStateRecord>, PersistenceError> {
        let record: Option<AgentStateRecord> = self.read_record(&self.agent_path(agent_id))?;
        if let Some(record) = &record {
            if record.agent_id.is_empty() {
                return Err(PersistenceError::Validation(
                    "agent record missing agent_id".into(),
                ));
            }
        }
        Ok(record)
    }

    // -- Task queues --

    pub fn save_task_queue_state(&self, state: &TaskQueueState) -> Result<(), PersistenceError> {
        self.write_record(&self.tasks_path(&state.agent_id), state)
    }

    pub fn load_task_queue_state(
        &self,
        agent_id: &str,
    ) -> Result<Option<TaskQueueState>, PersistenceError> {
        self.read_record(&self.tasks_path(agent_id))
    }

    // -- Sleep state --

    pub fn save_sleep_state(&self, state: &SleepState) -> Result<(), PersistenceError> {
        self.write_record(&self.sleep_path(&state.agent_id), state)
    }

    pub fn load_sleep_state(&self, agent_id: &str) -> Result<Option<SleepState>, PersistenceError> {
        self.read_record(&self.sleep_path(agent_id))
    }

    // -- Maintenance --

    /// Agent ids that have a persisted agent record.
    pub fn list_persisted_agents(&self) -> Vec<String> {
        let dir = self.state_dir.join("agents");
        let mut ids = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(stem) = name.strip_suffix(".json") {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        ids
    }

    /// Remove snapshot files older than `max_age_hours`. Returns the number
    /// removed.
    pub fn cleanup(&self, max_age_hours: u64) -> usize {
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(max_age_hours * 3600);
        let mut removed = 0;
        for sub in ["agents", "tasks", "sleep", "system"] {
            let dir = self.state_dir.join(sub);
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let stale = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(|modified| modified < cutoff)
                    .unwrap_or(false);
                if stale && std::fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, "cleaned up stale state snapshots");
        }
        removed
    }

    pub fn remove_agent(&self, agent_id: &str) {
        for path in [
            self.agent_path(agent_id),
            self.tasks_path(agent_id),
            self.sleep_path(agent_id),
        ] {
            let _ = std::fs::remove_file(path);
        }
    }

    // -- Internals --

    fn agent_path(&self, agent_id: &str) -> PathBuf {
        self.state_dir.join("agents").join(format!("{agent_id}.json"))
    }

    fn tasks_path(&self, agent_id: &str) -> PathBuf {
        self.state_dir
            .join("tasks")
            .join(format!("{agent_id}_tasks.json"))
    }

    fn sleep_path(&self, agent_id: &str) -> PathBuf {
        self.state_dir
            .join("sleep")
            .join(format!("{agent_id}_sleep.json"))
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.file_locks
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn write_record<T: Serialize>(&self, path: &Path, record: &T) -> Result<(), PersistenceError> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap();

        let mut value = serde_json::to_value(record)?;
        if let Some(map) = value.as_object_mut() {
            map.insert("_saved_at".into(), serde_json::json!(Utc::now()));
            map.insert("_session_id".into(), serde_json::json!(self.session_id));
            map.insert("_version".into(), serde_json::json!(STATE_VERSION));
        }
        let serialized = serde_json::to_string_pretty(&value)?;

        let tmp_path = path.with_extension("json.tmp");
        let io_err = |source: std::io::Error, p: &Path| PersistenceError::Io {
            path: p.display().to_string(),
            source,
        };
        {
            let mut file =
                std::fs::File::create(&tmp_path).map_err(|e| io_err(e, &tmp_path))?;
            file.write_all(serialized.as_bytes())
                .map_err(|e| io_err(e, &tmp_path))?;
            file.sync_all().map_err(|e| io_err(e, &tmp_path))?;
        }
        std::fs::rename(&tmp_path, path).map_err(|e| io_err(e, path))?;
        Ok(())
    }

    fn read_record<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, PersistenceError> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap();

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let mut value: serde_json::Value = serde_json::from_str(&raw)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("_saved_at");
            map.remove("_session_id");
            map.remove("_version");
        }
        match serde_json::from_value(value) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "rejecting invalid state record");
                Err(PersistenceError::Validation(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskKind;

    fn store() -> (tempfile::TempDir, StatePersistence) {
        let dir = tempfile::tempdir().unwrap();
        let store = StatePersistence::new(dir.path().join("state"), "session-1").unwrap();
        (dir, store)
    }

    fn record(agent_id: &str) -> AgentStateRecord {
        AgentStateRecord {
            agent_id: agent_id.into(),
            status: "idle".into(),
            created_at: Utc::now(),
            last_active: Utc::now(),
            model: "openai/gpt-4o".into(),
            system_prompt: Some("prompt".into()),
            message_count: 3,
            error_count: 0,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn agent_state_round_trip_strips_metadata() {
        let (_dir, store) = store();
        store.save_agent_state(&record("debbie")).unwrap();

        // The on-disk record carries the wrapper fields.
        let raw = std::fs::read_to_string(store.state_dir().join("agents/debbie.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["_session_id"], "session-1");
        assert_eq!(value["_version"], STATE_VERSION);

        let loaded = store.load_agent_state("debbie").unwrap().unwrap();
        assert_eq!(loaded.agent_id, "debbie");
        assert_eq!(loaded.message_count, 3);
    }

    #[test]
    fn missing_record_is_none() {
        let (_dir, store) = store();
        assert!(store.load_agent_state("ghost").unwrap().is_none());
        assert!(store.load_sleep_state("ghost").unwrap().is_none());
    }

    #[test]
    fn task_queue_round_trip() {
        let (_dir, store) = store();
        let state = TaskQueueState {
            agent_id: "debbie".into(),
            pending_tasks: vec![Task::direct("check the logs")],
            current_task: None,
        };
        store.save_task_queue_state(&state).unwrap();
        let loaded = store.load_task_queue_state("debbie").unwrap().unwrap();
        assert_eq!(loaded.pending_tasks.len(), 1);
        assert_eq!(loaded.pending_tasks[0].kind, TaskKind::Direct);
    }

    #[test]
    fn sleep_state_round_trip() {
        let (_dir, store) = store();
        let state = SleepState {
            agent_id: "debbie".into(),
            is_sleeping: true,
            sleep_until: Some(Utc::now() + chrono::Duration::seconds(60)),
            wake_events: vec!["mail_received".into()],
        };
        store.save_sleep_state(&state).unwrap();
        let loaded = store.load_sleep_state("debbie").unwrap().unwrap();
        assert!(loaded.is_sleeping);
        assert_eq!(loaded.wake_events, vec!["mail_received".to_string()]);
    }

    #[test]
    fn invalid_record_is_rejected() {
        let (_dir, store) = store();
        std::fs::write(
            store.state_dir().join("sleep/broken_sleep.json"),
            r#"{"agent_id": "broken", "is_sleeping": "yes"}"#,
        )
        .unwrap();
        assert!(matches!(
            store.load_sleep_state("broken"),
            Err(PersistenceError::Validation(_))
        ));
    }

    #[test]
    fn list_and_remove_persisted_agents() {
        let (_dir, store) = store();
        store.save_agent_state(&record("a")).unwrap();
        store.save_agent_state(&record("b")).unwrap();
        assert_eq!(store.list_persisted_agents(), vec!["a", "b"]);

        store.remove_agent("a");
        assert_eq!(store.list_persisted_agents(), vec!["b"]);
    }

    #[test]
    fn cleanup_removes_only_stale_files() {
        let (_dir, store) = store();
        store.save_agent_state(&record("fresh")).unwrap();
        // Nothing is older than one hour.
        assert_eq!(store.cleanup(1), 0);
        assert_eq!(store.list_persisted_agents(), vec!["fresh"]);
        // Everything is older than zero hours.
        assert_eq!(store.cleanup(0), 1);
        assert!(store.list_persisted_agents().is_empty());
    }

    #[test]
    fn no_tmp_files_left_behind() {
        let (_dir, store) = store();
        store.save_agent_state(&record("a")).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(store.state_dir().join("agents"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
