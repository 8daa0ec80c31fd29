use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Remote page identifier. Opaque, assigned by the remote on create.
pub type PageId = String;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LocalPage {
    /// Path relative to the configured local root.
    pub path: PathBuf,
    /// None means the file has never been pushed (no binding yet).
    pub page_id: Option<PageId>,
    /// Raw file content including the front-matter header.
    pub content: String,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Ancestor {
    pub id: PageId,
    pub title: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemotePage {
    pub id: PageId,
    pub title: String,
    pub last_modified: chrono::DateTime<chrono::Utc>,
    /// Root first, direct parent last. Empty for a space root page.
    pub ancestor_chain: Vec<Ancestor>,
    pub space_key: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TrackedPage {
    pub page_id: PageId,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ChangeClass {
    Unchanged,
    PushContent,
    PullContent,
    Conflict,
    DeleteLocal,
    DeleteRemote,
    MoveLocal,
    MoveRemote,
    CreateLocal,
    CreateRemote,
    MoveConflict,
}

impl std::fmt::Display for ChangeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChangeClass::Unchanged => "unchanged",
            ChangeClass::PushContent => "push",
            ChangeClass::PullContent => "pull",
            ChangeClass::Conflict => "conflict",
            ChangeClass::DeleteLocal => "delete-local",
            ChangeClass::DeleteRemote => "delete-remote",
            ChangeClass::MoveLocal => "move-local",
            ChangeClass::MoveRemote => "move-remote",
            ChangeClass::CreateLocal => "create-local",
            ChangeClass::CreateRemote => "create-remote",
            ChangeClass::MoveConflict => "move-conflict",
        };
        f.write_str(name)
    }
}

/// A single mutation against the remote's structured document, addressed by
/// the stable node id the remote assigns to each block.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SurgicalOp {
    UpdateText {
        target_local_id: String,
        new_text: String,
    },
    DeleteBlock {
        target_local_id: String,
    },
    InsertBlock {
        /// None inserts at the start of the document.
        after_local_id: Option<String>,
        new_content: String,
    },
    ChangeHeadingLevel {
        target_local_id: String,
        new_level: u8,
    },
    TableInsertRow {
        target_local_id: String,
        row_index: usize,
        cells: Vec<String>,
    },
    TableDeleteRow {
        target_local_id: String,
        row_index: usize,
    },
    TableUpdateCell {
        target_local_id: String,
        row_index: usize,
        col_index: usize,
        new_content: String,
    },
}

impl SurgicalOp {
    pub fn target_local_id(&self) -> Option<&str> {
        match self {
            SurgicalOp::UpdateText { target_local_id, .. }
            | SurgicalOp::DeleteBlock { target_local_id }
            | SurgicalOp::ChangeHeadingLevel { target_local_id, .. }
            | SurgicalOp::TableInsertRow { target_local_id, .. }
            | SurgicalOp::TableDeleteRow { target_local_id, .. }
            | SurgicalOp::TableUpdateCell { target_local_id, .. } => Some(target_local_id),
            SurgicalOp::InsertBlock { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeResult {
    pub merged: String,
    pub conflict_count: usize,
}

impl MergeResult {
    pub fn has_conflicts(&self) -> bool {
        self.conflict_count > 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("authentication failed for {user} at {endpoint}; regenerate the API token in your .env file")]
    AuthFailure { user: String, endpoint: String },

    #[error("page {page_id} not found on the remote; re-run sync to reconcile deletions")]
    PageNotFound { page_id: PageId },

    #[error("a page titled '{title}' already exists under parent {parent_id}; rename the local file or pull first")]
    PageAlreadyExists { title: String, parent_id: PageId },

    #[error("version conflict on page {page_id}: pushed against v{expected} but remote is at v{actual}")]
    VersionConflict {
        page_id: PageId,
        expected: u64,
        actual: u64,
    },

    #[error("rate limited by the remote (hint: {retry_hint:?})")]
    RateLimit { retry_hint: Option<Duration> },

    #[error("network error calling {endpoint}: {cause}; check connectivity and CONFLUENCE_URL")]
    Network { endpoint: String, cause: String },

    #[error("conversion failed: {reason}; check the converter binary is installed and on PATH")]
    Conversion { reason: String },

    #[error("page {page_id} has {conflict_count} unresolved conflicts; edit the markers in the local file and re-run")]
    MergeUnresolved {
        page_id: PageId,
        conflict_count: usize,
    },

    #[error("page {page_id} was moved on both sides (local wants {target_path}); reparent it manually and re-run")]
    MoveConflict { page_id: PageId, target_path: PathBuf },

    #[error("config error in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("bad front-matter in {path} (line {line}): {detail}; fix the YAML header")]
    Frontmatter {
        path: PathBuf,
        line: usize,
        detail: String,
    },

    #[error("filesystem {op} failed for {path}: {source}")]
    Filesystem {
        path: PathBuf,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub fn fs(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Filesystem {
            path: path.into(),
            op,
            source,
        }
    }

    pub fn rate_limit_exhausted(endpoint: &str) -> Self {
        SyncError::Network {
            endpoint: endpoint.to_string(),
            cause: "rate_limit_exhausted".to_string(),
        }
    }

    /// Errors that abort the whole run rather than a single page.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::AuthFailure { .. } | SyncError::Network { .. } | SyncError::Config { .. }
        )
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::AuthFailure { .. } => 3,
            SyncError::Network { .. } | SyncError::RateLimit { .. } => 4,
            SyncError::MergeUnresolved { .. } => 2,
            _ => 1,
        }
    }
}
