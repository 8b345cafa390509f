//! State Persistence
//!
//! Stores one versioned JSON document per workflow id. Any backend with
//! atomic read-modify-write per key works; the file store gets atomicity
//! from a write-to-temp-then-rename, and the in-memory store backs tests
//! and embedded use.
//!
//! Records are wrapped in an envelope carrying a schema version and a save
//! timestamp so stored state stays loadable across engine revisions.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

use super::state::ExecutionState;

/// Version written into every stored record.
pub const SCHEMA_VERSION: u32 = 1;

/// Envelope persisted per workflow id.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct StoredRecord {
    schema_version: u32,
    saved_at: DateTime<Utc>,
    state: ExecutionState,
}

/// Persistence backend for execution state, keyed by workflow id.
pub trait StateStore: Send + Sync {
    /// Persists the full state, replacing any previous record.
    fn save(&self, state: &ExecutionState) -> Result<()>;

    /// Loads the state for a workflow id, if one exists.
    fn load(&self, workflow_id: &str) -> Result<Option<ExecutionState>>;

    /// Removes the record for a workflow id. Missing records are fine.
    fn delete(&self, workflow_id: &str) -> Result<()>;

    /// All persisted states, in unspecified order.
    fn list(&self) -> Result<Vec<ExecutionState>>;
}

/// File-backed store: `{dir}/{workflow_id}.json`.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Creates a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!("State store at {}", dir.display());
        Ok(Self { dir })
    }

    fn path_for(&self, workflow_id: &str) -> PathBuf {
        // Workflow ids are caller-controlled; keep them out of path syntax.
        // ASCII alphanumerics and '-' pass through, every other byte is
        // hex-escaped (including '_', the escape marker), so distinct ids
        // never share a file.
        let mut safe = String::with_capacity(workflow_id.len());
        for b in workflow_id.bytes() {
            match b {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => safe.push(b as char),
                _ => {
                    use std::fmt::Write;
                    let _ = write!(safe, "_{b:02x}");
                }
            }
        }
        self.dir.join(format!("{safe}.json"))
    }

    fn read_record(path: &Path) -> Result<StoredRecord> {
        let content = fs::read_to_string(path)?;
        let record: StoredRecord = serde_json::from_str(&content)?;
        if record.schema_version > SCHEMA_VERSION {
            return Err(EngineError::Storage(format!(
                "record at {} has schema version {} (supported: {})",
                path.display(),
                record.schema_version,
                SCHEMA_VERSION
            )));
        }
        Ok(record)
    }
}

impl StateStore for JsonFileStore {
    fn save(&self, state: &ExecutionState) -> Result<()> {
        let record = StoredRecord {
            schema_version: SCHEMA_VERSION,
            saved_at: Utc::now(),
            state: state.clone(),
        };

        let path = self.path_for(&state.workflow_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&record)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;

        debug!("Saved state for '{}' to {}", state.workflow_id, path.display());
        Ok(())
    }

    fn load(&self, workflow_id: &str) -> Result<Option<ExecutionState>> {
        let path = self.path_for(workflow_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_record(&path)?.state))
    }

    fn delete(&self, workflow_id: &str) -> Result<()> {
        let path = self.path_for(workflow_id);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!("Deleted state for '{workflow_id}'");
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<ExecutionState>> {
        let mut states = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                states.push(Self::read_record(&path)?.state);
            }
        }
        Ok(states)
    }
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, ExecutionState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn save(&self, state: &ExecutionState) -> Result<()> {
        self.records
            .lock()
            .expect("store lock poisoned")
            .insert(state.workflow_id.clone(), state.clone());
        Ok(())
    }

    fn load(&self, workflow_id: &str) -> Result<Option<ExecutionState>> {
        Ok(self
            .records
            .lock()
            .expect("store lock poisoned")
            .get(workflow_id)
            .cloned())
    }

    fn delete(&self, workflow_id: &str) -> Result<()> {
        self.records
            .lock()
            .expect("store lock poisoned")
            .remove(workflow_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ExecutionState>> {
        Ok(self
            .records
            .lock()
            .expect("store lock poisoned")
            .values()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::state::WorkflowState;
    use crate::workflow::{WorkflowDefinition, WorkflowStep};
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_state(workflow_id: &str) -> ExecutionState {
        let definition = WorkflowDefinition::new(
            workflow_id,
            "Store test",
            vec![
                WorkflowStep::new("a", "noop"),
                WorkflowStep::new("b", "noop").depends_on("a"),
            ],
        )
        .unwrap();
        ExecutionState::new(&definition)
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        let mut state = sample_state("wf-rt");
        state.record_success("a", json!({"n": 1}));
        store.save(&state).unwrap();

        let loaded = store.load("wf-rt").unwrap().unwrap();
        assert_eq!(loaded.workflow_id, "wf-rt");
        assert_eq!(loaded.step_results["a"].output, json!({"n": 1}));
    }

    #[test]
    fn test_file_store_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_file_store_overwrite_keeps_latest() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        let mut state = sample_state("wf-ow");
        store.save(&state).unwrap();

        state.transition(WorkflowState::Running, "start").unwrap();
        state.record_success("a", json!(1));
        store.save(&state).unwrap();

        let loaded = store.load("wf-ow").unwrap().unwrap();
        assert_eq!(loaded.state, WorkflowState::Running);
        assert_eq!(loaded.step_results.len(), 1);
    }

    #[test]
    fn test_stored_records_carry_schema_version() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        store.save(&sample_state("wf-v")).unwrap();

        let content = fs::read_to_string(dir.path().join("wf-v.json")).unwrap();
        let raw: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(raw["schema_version"], SCHEMA_VERSION);
        assert!(raw["saved_at"].is_string());
    }

    #[test]
    fn test_future_schema_version_rejected() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        store.save(&sample_state("wf-f")).unwrap();

        let path = dir.path().join("wf-f.json");
        let content = fs::read_to_string(&path).unwrap();
        let mut raw: serde_json::Value = serde_json::from_str(&content).unwrap();
        raw["schema_version"] = json!(SCHEMA_VERSION + 1);
        fs::write(&path, raw.to_string()).unwrap();

        assert!(matches!(
            store.load("wf-f"),
            Err(EngineError::Storage(_))
        ));
    }

    #[test]
    fn test_file_store_sanitizes_ids() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        let state = sample_state("../evil/id");
        store.save(&state).unwrap();

        // The record is stored inside the directory and loads back by id.
        assert!(store.load("../evil/id").unwrap().is_some());
        assert!(!dir.path().parent().unwrap().join("evil").exists());
    }

    #[test]
    fn test_file_store_keeps_similar_ids_distinct() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        let mut slashed = sample_state("a/b");
        slashed.record_success("a", json!("slashed"));
        let mut underscored = sample_state("a_b");
        underscored.record_success("a", json!("underscored"));

        store.save(&slashed).unwrap();
        store.save(&underscored).unwrap();

        // Ids that only differ in escaped characters must not collide.
        let slashed = store.load("a/b").unwrap().unwrap();
        let underscored = store.load("a_b").unwrap().unwrap();
        assert_eq!(slashed.step_results["a"].output, json!("slashed"));
        assert_eq!(underscored.step_results["a"].output, json!("underscored"));
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_file_store_delete() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        store.save(&sample_state("wf-del")).unwrap();

        store.delete("wf-del").unwrap();
        assert!(store.load("wf-del").unwrap().is_none());
        // Deleting again is fine.
        store.delete("wf-del").unwrap();
    }

    #[test]
    fn test_file_store_list() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        store.save(&sample_state("wf-1")).unwrap();
        store.save(&sample_state("wf-2")).unwrap();

        let states = store.list().unwrap();
        assert_eq!(states.len(), 2);
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let mut state = sample_state("wf-mem");
        state.record_success("a", json!("out"));

        store.save(&state).unwrap();
        let loaded = store.load("wf-mem").unwrap().unwrap();
        assert_eq!(loaded.step_results["a"].output, json!("out"));

        store.delete("wf-mem").unwrap();
        assert!(store.load("wf-mem").unwrap().is_none());
    }
}
