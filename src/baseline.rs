use crate::config::{atomic_write, SyncDirs};
use crate::types::{PageId, SyncError};
use std::path::PathBuf;

/// Last-synced markdown per page id, used as the common ancestor for
/// three-way merge. One file per page under `.confluence-sync/baseline/`.
/// Entries are only advanced after the remote acknowledged the operation.
#[derive(Debug, Clone)]
pub struct BaselineStore {
    dir: PathBuf,
    temp_dir: PathBuf,
}

impl BaselineStore {
    pub fn new(dirs: &SyncDirs) -> Self {
        Self {
            dir: dirs.baseline_dir(),
            temp_dir: dirs.temp_dir(),
        }
    }

    pub fn init_if_missing(&self) -> Result<(), SyncError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| SyncError::fs("create_dir", &self.dir, e))
    }

    fn entry_path(&self, page_id: &PageId) -> PathBuf {
        // Page ids are opaque but filesystem-hostile characters are possible
        // in principle; keep the key flat and escaped.
        let safe: String = page_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.md", safe))
    }

    pub fn get(&self, page_id: &PageId) -> Result<Option<String>, SyncError> {
        let path = self.entry_path(page_id);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::fs("read", &path, e)),
        }
    }

    pub fn put(&self, page_id: &PageId, content: &str) -> Result<(), SyncError> {
        atomic_write(&self.temp_dir, &self.entry_path(page_id), content.as_bytes())
    }

    pub fn remove(&self, page_id: &PageId) -> Result<(), SyncError> {
        let path = self.entry_path(page_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::fs("remove", &path, e)),
        }
    }

    pub fn is_empty(&self) -> Result<bool, SyncError> {
        match std::fs::read_dir(&self.dir) {
            Ok(mut entries) => Ok(entries.next().is_none()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(SyncError::fs("read_dir", &self.dir, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, BaselineStore) {
        let tmp = TempDir::new().unwrap();
        let dirs = SyncDirs::new(tmp.path());
        dirs.ensure().unwrap();
        let store = BaselineStore::new(&dirs);
        (tmp, store)
    }

    #[test]
    fn get_of_unknown_page_is_none() {
        let (_tmp, store) = store();
        assert_eq!(store.get(&"123".to_string()).unwrap(), None);
    }

    #[test]
    fn put_then_get_returns_bytes() {
        let (_tmp, store) = store();
        let id = "123".to_string();
        store.put(&id, "---\npage_id: \"123\"\n---\nbody\n").unwrap();
        assert_eq!(
            store.get(&id).unwrap().unwrap(),
            "---\npage_id: \"123\"\n---\nbody\n"
        );
    }

    #[test]
    fn put_overwrites_atomically() {
        let (_tmp, store) = store();
        let id = "9".to_string();
        store.put(&id, "old").unwrap();
        store.put(&id, "new").unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap(), "new");
    }

    #[test]
    fn remove_is_idempotent() {
        let (_tmp, store) = store();
        let id = "7".to_string();
        store.put(&id, "x").unwrap();
        store.remove(&id).unwrap();
        store.remove(&id).unwrap();
        assert_eq!(store.get(&id).unwrap(), None);
        assert!(store.is_empty().unwrap());
    }
}
