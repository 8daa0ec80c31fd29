use crate::baseline::BaselineStore;
use crate::config::SpaceConfig;
use crate::indexer::slugify;
use crate::state::SyncState;
use crate::types::{ChangeClass, LocalPage, PageId, RemotePage, SyncError, TrackedPage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForceMode {
    #[default]
    None,
    Push,
    Pull,
}

/// One classified action for one page. A page that both moved and changed
/// content yields two entries; the orchestrator applies the move first.
#[derive(Debug, Clone)]
pub struct Entry {
    pub page_id: Option<PageId>,
    /// Current local path, when the page exists locally.
    pub path: Option<PathBuf>,
    pub class: ChangeClass,
    /// MoveLocal: the remote parent to reparent under.
    pub new_parent_id: Option<PageId>,
    /// MoveRemote: where the local file should land.
    pub new_path: Option<PathBuf>,
}

impl Entry {
    fn new(page_id: Option<PageId>, path: Option<PathBuf>, class: ChangeClass) -> Self {
        Self {
            page_id,
            path,
            class,
            new_parent_id: None,
            new_path: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Classification {
    pub entries: Vec<Entry>,
    /// Pages that could not be classified; reported, sync continues.
    pub errors: Vec<SyncError>,
}

impl Classification {
    pub fn has_conflicts(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.class, ChangeClass::Conflict | ChangeClass::MoveConflict))
    }

    pub fn is_noop(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.class == ChangeClass::Unchanged)
    }
}

/// The expected path of a remote page below the configured subtree root:
/// slugified ancestor titles as directories, slugified title as file name.
pub fn expected_rel_path(page: &RemotePage, parent_page_id: Option<&PageId>) -> PathBuf {
    let mut ancestors: &[_] = &page.ancestor_chain;
    if let Some(root) = parent_page_id {
        if let Some(pos) = page.ancestor_chain.iter().rposition(|a| &a.id == root) {
            ancestors = &page.ancestor_chain[pos + 1..];
        }
    }
    let mut path = PathBuf::new();
    for ancestor in ancestors {
        path.push(slugify(&ancestor.title));
    }
    path.push(format!("{}.md", slugify(&page.title)));
    path
}

pub struct ChangeDetector<'a> {
    baseline: &'a BaselineStore,
    state: Option<&'a SyncState>,
    space: &'a SpaceConfig,
    force: ForceMode,
    single_file: Option<PathBuf>,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(
        baseline: &'a BaselineStore,
        state: Option<&'a SyncState>,
        space: &'a SpaceConfig,
        force: ForceMode,
        single_file: Option<PathBuf>,
    ) -> Self {
        Self {
            baseline,
            state,
            space,
            force,
            single_file,
        }
    }

    pub fn classify(
        &self,
        local: &[LocalPage],
        remote: &[RemotePage],
    ) -> Result<Classification, SyncError> {
        let mut out = Classification::default();

        let local_by_id: HashMap<&PageId, &LocalPage> = local
            .iter()
            .filter_map(|p| p.page_id.as_ref().map(|id| (id, p)))
            .collect();
        let remote_by_id: HashMap<&PageId, &RemotePage> =
            remote.iter().map(|p| (&p.id, p)).collect();
        let tracked: HashMap<&PageId, &TrackedPage> = self
            .state
            .map(|s| s.tracked_by_id())
            .unwrap_or_default();
        let last_synced = self.state.and_then(|s| s.last_synced);

        // Local files with no binding are new pages to create.
        for page in local.iter().filter(|p| p.page_id.is_none()) {
            let class = match self.force {
                ForceMode::Pull => ChangeClass::DeleteRemote,
                _ => ChangeClass::CreateLocal,
            };
            out.entries
                .push(Entry::new(None, Some(page.path.clone()), class));
        }

        // Remote pages with no local counterpart: new remote pages, or local
        // deletions to push.
        for page in remote {
            if local_by_id.contains_key(&page.id) {
                continue;
            }
            let was_tracked = tracked.contains_key(&page.id);
            let class = match (was_tracked, self.force) {
                (true, ForceMode::Pull) | (false, ForceMode::None | ForceMode::Pull) => {
                    ChangeClass::CreateRemote
                }
                (true, _) => ChangeClass::DeleteLocal,
                (false, ForceMode::Push) => ChangeClass::DeleteLocal,
            };
            // A never-tracked remote page is a fresh pull unless force-push
            // says local layout wins.
            let path = tracked.get(&page.id).map(|t| t.local_path.clone());
            out.entries
                .push(Entry::new(Some(page.id.clone()), path, class));
        }

        // Bound local files whose remote page is gone.
        for (id, page) in &local_by_id {
            if remote_by_id.contains_key(*id) {
                continue;
            }
            if tracked.contains_key(*id) {
                let class = match self.force {
                    ForceMode::Push => ChangeClass::CreateLocal,
                    _ => ChangeClass::DeleteRemote,
                };
                out.entries
                    .push(Entry::new(Some((*id).clone()), Some(page.path.clone()), class));
            } else {
                out.errors.push(SyncError::PageNotFound {
                    page_id: (*id).clone(),
                });
            }
        }

        // Maps each remote page's child directory to its id, for resolving
        // local moves to a reparent target.
        let dir_index: HashMap<PathBuf, PageId> = remote
            .iter()
            .map(|p| {
                let child_dir = expected_rel_path(p, self.space.parent_page_id.as_ref())
                    .with_extension("");
                (child_dir, p.id.clone())
            })
            .collect();

        // Pages present on both sides: moves, then content.
        for (id, local_page) in &local_by_id {
            let Some(remote_page) = remote_by_id.get(*id) else {
                continue;
            };

            if let Some(tracked_page) = tracked.get(*id) {
                self.classify_move(&mut out, local_page, remote_page, tracked_page, &dir_index);
            }

            let class = self.classify_content(local_page, remote_page, last_synced)?;
            out.entries.push(Entry::new(
                Some((*id).clone()),
                Some(local_page.path.clone()),
                class,
            ));
        }

        if let Some(filter) = &self.single_file {
            out.entries.retain(|e| {
                e.path.as_deref() == Some(filter.as_path())
                    || e.new_path.as_deref() == Some(filter.as_path())
            });
        }

        out.entries
            .sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.page_id.cmp(&b.page_id)));
        Ok(out)
    }

    fn classify_move(
        &self,
        out: &mut Classification,
        local_page: &LocalPage,
        remote_page: &RemotePage,
        tracked_page: &TrackedPage,
        dir_index: &HashMap<PathBuf, PageId>,
    ) {
        let local_dir = parent_dir(&local_page.path);
        let tracked_dir = parent_dir(&tracked_page.local_path);
        let remote_rel = expected_rel_path(remote_page, self.space.parent_page_id.as_ref());
        let remote_dir = parent_dir(&remote_rel);

        let local_moved = local_dir != tracked_dir;
        let remote_moved = remote_dir != tracked_dir;

        let decided = match (local_moved, remote_moved, self.force) {
            (false, false, _) => return,
            // Both sides landed in the same place; nothing to reconcile.
            (true, true, _) if local_dir == remote_dir => return,
            (true, false, ForceMode::Pull) => ChangeClass::MoveRemote,
            (false, true, ForceMode::Push) => ChangeClass::MoveLocal,
            (true, false, _) => ChangeClass::MoveLocal,
            (false, true, _) => ChangeClass::MoveRemote,
            (true, true, ForceMode::Push) => ChangeClass::MoveLocal,
            (true, true, ForceMode::Pull) => ChangeClass::MoveRemote,
            (true, true, ForceMode::None) => ChangeClass::MoveConflict,
        };

        let mut entry = Entry::new(
            Some(remote_page.id.clone()),
            Some(local_page.path.clone()),
            decided,
        );
        match decided {
            ChangeClass::MoveLocal => {
                match self.resolve_dir_to_parent(&local_dir, dir_index) {
                    Some(parent) => entry.new_parent_id = Some(parent),
                    None => {
                        // No remote page owns that directory; the move
                        // cannot be expressed as a reparent.
                        out.errors.push(SyncError::MoveConflict {
                            page_id: remote_page.id.clone(),
                            target_path: local_page.path.clone(),
                        });
                        return;
                    }
                }
            }
            ChangeClass::MoveRemote => {
                let file_name = local_page
                    .path
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("page.md"));
                entry.new_path = Some(remote_dir.join(file_name));
            }
            ChangeClass::MoveConflict => {
                entry.new_path = Some(remote_rel);
            }
            _ => {}
        }
        out.entries.push(entry);
    }

    /// Resolves a local directory to the remote page whose children live
    /// there. The subtree root itself maps to the configured parent.
    fn resolve_dir_to_parent(
        &self,
        dir: &Path,
        dir_index: &HashMap<PathBuf, PageId>,
    ) -> Option<PageId> {
        if dir.as_os_str().is_empty() {
            return self.space.parent_page_id.clone();
        }
        dir_index.get(dir).cloned()
    }

    fn classify_content(
        &self,
        local_page: &LocalPage,
        remote_page: &RemotePage,
        last_synced: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<ChangeClass, SyncError> {
        let page_id = remote_page.id.clone();

        let remote_modified =
            last_synced.map_or(true, |ts| remote_page.last_modified > ts);

        let local_modified = match self.force {
            // Force modes skip the baseline check: the mtime filter decides.
            ForceMode::Push | ForceMode::Pull => {
                mtime_after(local_page.modified, last_synced)
            }
            ForceMode::None => self.is_locally_modified(local_page, &page_id, last_synced)?,
        };

        let class = match (self.force, local_modified, remote_modified) {
            (_, false, false) => ChangeClass::Unchanged,
            (ForceMode::Push, _, _) => ChangeClass::PushContent,
            (ForceMode::Pull, _, _) => ChangeClass::PullContent,
            (ForceMode::None, true, false) => ChangeClass::PushContent,
            (ForceMode::None, false, true) => ChangeClass::PullContent,
            (ForceMode::None, true, true) => ChangeClass::Conflict,
        };
        Ok(class)
    }

    /// Hybrid local-change detection: the mtime filter first, then baseline
    /// equality to recover from touch and clock skew.
    fn is_locally_modified(
        &self,
        local_page: &LocalPage,
        page_id: &PageId,
        last_synced: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<bool, SyncError> {
        if !mtime_after(local_page.modified, last_synced) {
            return Ok(false);
        }
        match self.baseline.get(page_id)? {
            Some(baseline) => Ok(baseline != local_page.content),
            None => Ok(true),
        }
    }
}

fn mtime_after(mtime: SystemTime, last_synced: Option<chrono::DateTime<chrono::Utc>>) -> bool {
    match last_synced {
        Some(ts) => mtime > SystemTime::from(ts),
        None => true,
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent().map(PathBuf::from).unwrap_or_default()
}
