// ABOUTME: Persistence of deployment state keyed by run ID.
// ABOUTME: The file store writes JSON atomically via a temp file and rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::error::DeployError;
use super::state::DeploymentState;
use crate::types::RunId;

/// Where run state lives between invocations.
pub trait StateStore: Send + Sync {
    /// Persist the full state, replacing any previous copy.
    fn save(&self, state: &DeploymentState) -> Result<(), DeployError>;

    fn load(&self, run_id: &RunId) -> Result<Option<DeploymentState>, DeployError>;

    /// Delete a run's state. Returns whether anything was removed.
    fn purge(&self, run_id: &RunId) -> Result<bool, DeployError>;

    /// Most recently updated run, if any.
    fn latest(&self) -> Result<Option<RunId>, DeployError>;

    /// Human-readable location of a run's state, for error messages.
    fn location(&self, run_id: &RunId) -> String;
}

/// Stores each run as `<dir>/<run_id>.json`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    fn io_error(path: &Path, source: std::io::Error) -> DeployError {
        DeployError::StateIo {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl StateStore for FileStateStore {
    fn save(&self, state: &DeploymentState) -> Result<(), DeployError> {
        fs::create_dir_all(&self.dir).map_err(|e| Self::io_error(&self.dir, e))?;

        let path = self.path_for(&state.run_id);
        let tmp = self.dir.join(format!(".{}.json.tmp", state.run_id));
        let json = serde_json::to_vec_pretty(state).map_err(|source| DeployError::StateFormat {
            path: path.clone(),
            source,
        })?;

        let mut file = fs::File::create(&tmp).map_err(|e| Self::io_error(&tmp, e))?;
        file.write_all(&json).map_err(|e| Self::io_error(&tmp, e))?;
        file.sync_all().map_err(|e| Self::io_error(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &path).map_err(|e| Self::io_error(&path, e))?;
        tracing::debug!("persisted state for run {} to {}", state.run_id, path.display());
        Ok(())
    }

    fn load(&self, run_id: &RunId) -> Result<Option<DeploymentState>, DeployError> {
        let path = self.path_for(run_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_error(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| DeployError::StateFormat { path, source })
    }

    fn purge(&self, run_id: &RunId) -> Result<bool, DeployError> {
        let path = self.path_for(run_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }

    fn latest(&self) -> Result<Option<RunId>, DeployError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_error(&self.dir, e)),
        };

        let mut newest: Option<(std::time::SystemTime, RunId)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(run_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| RunId::new(s).ok())
            else {
                continue;
            };
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
                newest = Some((modified, run_id));
            }
        }
        Ok(newest.map(|(_, id)| id))
    }

    fn location(&self, run_id: &RunId) -> String {
        self.path_for(run_id).display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::state::StageStatus;
    use crate::types::StageName;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("runs"));
        let mut state = DeploymentState::new(RunId::new("demo-1").unwrap());
        state
            .result_mut(&StageName::new("provision").unwrap())
            .status = StageStatus::Succeeded;

        store.save(&state).unwrap();
        let loaded = store.load(&state.run_id).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(store.latest().unwrap(), Some(state.run_id.clone()));
    }

    #[test]
    fn missing_run_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(store.load(&RunId::new("nope").unwrap()).unwrap().is_none());
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn purge_removes_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let state = DeploymentState::new(RunId::new("demo-2").unwrap());
        store.save(&state).unwrap();

        assert!(store.purge(&state.run_id).unwrap());
        assert!(!store.purge(&state.run_id).unwrap());
        assert!(store.load(&state.run_id).unwrap().is_none());
    }

    #[test]
    fn corrupt_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let run_id = RunId::new("broken").unwrap();
        fs::write(store.path_for(&run_id), "{not json").unwrap();
        assert!(matches!(
            store.load(&run_id),
            Err(DeployError::StateFormat { .. })
        ));
    }
}
