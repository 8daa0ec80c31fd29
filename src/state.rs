use crate::config::{atomic_write, SyncDirs};
use crate::types::{PageId, SyncError, TrackedPage};
use std::collections::HashMap;

/// Persistent record of the last successful run. Loaded once at orchestrator
/// start, written once at orchestrator end; intermediate states never hit disk.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SyncState {
    /// UTC instant of the last full sync. None before the first one.
    #[serde(default)]
    pub last_synced: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub tracked_pages: Vec<TrackedPage>,
}

impl SyncState {
    /// None when no state file exists yet (first-ever sync).
    pub fn load(dirs: &SyncDirs) -> Result<Option<Self>, SyncError> {
        let path = dirs.state_path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::fs("read", &path, e)),
        };
        let state = serde_yaml::from_str(&content).map_err(|e| SyncError::Config {
            path,
            reason: format!("state file is corrupt: {}", e),
        })?;
        Ok(Some(state))
    }

    pub fn save(&self, dirs: &SyncDirs) -> Result<(), SyncError> {
        let content = serde_yaml::to_string(self).map_err(|e| SyncError::Config {
            path: dirs.state_path(),
            reason: e.to_string(),
        })?;
        atomic_write(&dirs.temp_dir(), &dirs.state_path(), content.as_bytes())
    }

    pub fn tracked_by_id(&self) -> HashMap<&PageId, &TrackedPage> {
        self.tracked_pages.iter().map(|t| (&t.page_id, t)).collect()
    }
}
