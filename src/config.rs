use crate::types::{PageId, SyncError};
use std::path::{Path, PathBuf};

pub const SYNC_DIR: &str = ".confluence-sync";
const CONFIG_FILE: &str = "config.yaml";
const STATE_FILE: &str = "state.yaml";

/// Layout of the `.confluence-sync/` state directory.
#[derive(Debug, Clone)]
pub struct SyncDirs {
    root: PathBuf,
}

impl SyncDirs {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            root: base.into().join(SYNC_DIR),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn baseline_dir(&self) -> PathBuf {
        self.root.join("baseline")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn ensure(&self) -> Result<(), SyncError> {
        for dir in [&self.root, &self.baseline_dir(), &self.temp_dir()] {
            std::fs::create_dir_all(dir).map_err(|e| SyncError::fs("create_dir", dir, e))?;
        }
        Ok(())
    }

    /// Scratch files are only interesting while a write is in flight.
    pub fn purge_temp(&self) {
        let temp = self.temp_dir();
        if let Ok(entries) = std::fs::read_dir(&temp) {
            for entry in entries.flatten() {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

/// Writes `bytes` to `dest` through a uniquely named scratch file in
/// `temp_dir`, then renames. Readers never observe a half-written file.
pub fn atomic_write(temp_dir: &Path, dest: &Path, bytes: &[u8]) -> Result<(), SyncError> {
    let scratch = temp_dir.join(format!(
        "{}.{}.tmp",
        dest.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("write"),
        uuid::Uuid::new_v4()
    ));
    std::fs::write(&scratch, bytes).map_err(|e| SyncError::fs("write", &scratch, e))?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SyncError::fs("create_dir", parent, e))?;
    }
    std::fs::rename(&scratch, dest).map_err(|e| SyncError::fs("rename", dest, e))
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SpaceConfig {
    pub space_key: String,
    /// None syncs the whole space from its root.
    pub parent_page_id: Option<PageId>,
    pub local_path: PathBuf,
    #[serde(default)]
    pub exclude_page_ids: Vec<PageId>,
}

fn default_page_limit() -> usize {
    1000
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub spaces: Vec<SpaceConfig>,
    /// Abort discovery when a subtree exceeds this many pages.
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
}

impl Config {
    pub fn load(dirs: &SyncDirs) -> Result<Self, SyncError> {
        let path = dirs.config_path();
        let content = std::fs::read_to_string(&path).map_err(|e| SyncError::Config {
            path: path.clone(),
            reason: format!("{}; run `confluence-sync --init` first", e),
        })?;
        serde_yaml::from_str(&content).map_err(|e| SyncError::Config {
            path,
            reason: e.to_string(),
        })
    }

    pub fn save(&self, dirs: &SyncDirs) -> Result<(), SyncError> {
        dirs.ensure()?;
        let content = serde_yaml::to_string(self).map_err(|e| SyncError::Config {
            path: dirs.config_path(),
            reason: e.to_string(),
        })?;
        atomic_write(&dirs.temp_dir(), &dirs.config_path(), content.as_bytes())
    }
}

/// Remote credentials. The token is deliberately excluded from Debug output
/// and never logged.
#[derive(Clone)]
pub struct Credentials {
    pub url: String,
    pub user: String,
    pub api_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("api_token", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Loads `CONFLUENCE_URL`, `CONFLUENCE_USER`, `CONFLUENCE_API_TOKEN`,
    /// taking a `.env` file into account when present.
    pub fn from_env() -> Result<Self, SyncError> {
        dotenvy::dotenv().ok();
        let get = |key: &str| {
            std::env::var(key).map_err(|_| SyncError::Config {
                path: PathBuf::from(".env"),
                reason: format!("{} is not set; add it to the environment or a .env file", key),
            })
        };
        Ok(Self {
            url: get("CONFLUENCE_URL")?,
            user: get("CONFLUENCE_USER")?,
            api_token: get("CONFLUENCE_API_TOKEN")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_round_trips_through_yaml() {
        let tmp = TempDir::new().unwrap();
        let dirs = SyncDirs::new(tmp.path());
        let config = Config {
            version: 1,
            spaces: vec![SpaceConfig {
                space_key: "DOCS".to_string(),
                parent_page_id: Some("1000".to_string()),
                local_path: PathBuf::from("docs"),
                exclude_page_ids: vec!["2000".to_string()],
            }],
            page_limit: 500,
        };
        config.save(&dirs).unwrap();
        let loaded = Config::load(&dirs).unwrap();
        assert_eq!(loaded.spaces[0].space_key, "DOCS");
        assert_eq!(loaded.spaces[0].exclude_page_ids, vec!["2000".to_string()]);
        assert_eq!(loaded.page_limit, 500);
    }

    #[test]
    fn unknown_keys_and_missing_defaults_are_tolerated() {
        let tmp = TempDir::new().unwrap();
        let dirs = SyncDirs::new(tmp.path());
        dirs.ensure().unwrap();
        std::fs::write(
            dirs.config_path(),
            "version: 1\nfuture_option: true\nspaces:\n  - space_key: X\n    parent_page_id: null\n    local_path: wiki\n",
        )
        .unwrap();
        let loaded = Config::load(&dirs).unwrap();
        assert_eq!(loaded.page_limit, 1000);
        assert!(loaded.spaces[0].parent_page_id.is_none());
        assert!(loaded.spaces[0].exclude_page_ids.is_empty());
    }

    #[test]
    fn missing_config_suggests_init() {
        let tmp = TempDir::new().unwrap();
        let dirs = SyncDirs::new(tmp.path());
        let err = Config::load(&dirs).unwrap_err();
        assert!(err.to_string().contains("--init"));
    }

    #[test]
    fn atomic_write_replaces_existing_content() {
        let tmp = TempDir::new().unwrap();
        let dirs = SyncDirs::new(tmp.path());
        dirs.ensure().unwrap();
        let dest = tmp.path().join("out.txt");
        atomic_write(&dirs.temp_dir(), &dest, b"first").unwrap();
        atomic_write(&dirs.temp_dir(), &dest, b"second").unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"second");
        dirs.purge_temp();
        assert_eq!(std::fs::read_dir(dirs.temp_dir()).unwrap().count(), 0);
    }
}
