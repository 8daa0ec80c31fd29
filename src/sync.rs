use crate::baseline::BaselineStore;
use crate::config::{atomic_write, Config, SpaceConfig, SyncDirs};
use crate::converter::DocConverter;
use crate::detector::{expected_rel_path, ChangeDetector, Classification, Entry, ForceMode};
use crate::document::StructuredDoc;
use crate::frontmatter;
use crate::indexer::LocalScanner;
use crate::merge;
use crate::remote::{PageFormat, RemoteApi, RemoteScanner, RetryShell};
use crate::state::SyncState;
use crate::surgical;
use crate::types::{ChangeClass, LocalPage, PageId, RemotePage, SyncError};
use futures_util::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Bounded worker count for per-page fetches and pushes.
const CONCURRENT_PAGE_TASKS: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub force: ForceMode,
    pub single_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub pushed: usize,
    pub pulled: usize,
    pub created_remote: usize,
    pub created_local: usize,
    pub deleted_remote: usize,
    pub deleted_local: usize,
    pub moved_remote: usize,
    pub moved_local: usize,
    pub merged: usize,
    pub unresolved_conflicts: usize,
    pub unchanged: usize,
    pub errors: Vec<SyncError>,
    pub fatal: Option<SyncError>,
    pub dry_run_conflicts: bool,
}

impl RunReport {
    pub fn exit_code(&self) -> u8 {
        if let Some(fatal) = &self.fatal {
            return fatal.exit_code();
        }
        if self.unresolved_conflicts > 0 || self.dry_run_conflicts {
            return 2;
        }
        if !self.errors.is_empty() {
            return 1;
        }
        0
    }

    pub fn summary(&self) -> String {
        let synced = self.pushed + self.pulled + self.created_remote + self.created_local;
        let mut line = format!(
            "Synced {} pages ({} pushed, {} pulled)",
            synced, self.pushed, self.pulled
        );
        if self.created_remote + self.created_local > 0 {
            line.push_str(&format!(
                ", {} created",
                self.created_remote + self.created_local
            ));
        }
        if self.deleted_remote + self.deleted_local > 0 {
            line.push_str(&format!(
                ", {} deleted",
                self.deleted_remote + self.deleted_local
            ));
        }
        if self.moved_remote + self.moved_local > 0 {
            line.push_str(&format!(", {} moved", self.moved_remote + self.moved_local));
        }
        if self.unresolved_conflicts > 0 {
            line.push_str(&format!(", {} conflicts", self.unresolved_conflicts));
        }
        line
    }
}

enum TaskOutcome {
    Pushed {
        page_id: PageId,
        path: PathBuf,
        was_merge: bool,
    },
    Pulled {
        page_id: PageId,
        path: PathBuf,
        fresh_file: bool,
    },
    Unchanged,
    ConflictMarkers {
        page_id: PageId,
        conflict_count: usize,
    },
    Skipped,
    Failed(SyncError),
}

/// Drives the whole pipeline: discover, scan, classify, then the phase
/// sequence creations -> deletions -> moves -> content -> conflicts, with a
/// single state commit at the end.
pub struct SyncEngine {
    api: Arc<dyn RemoteApi>,
    converter: DocConverter,
    shell: RetryShell,
    baseline: tokio::sync::Mutex<BaselineStore>,
    dirs: SyncDirs,
    config: Config,
    cancel: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        converter: DocConverter,
        shell: RetryShell,
        dirs: SyncDirs,
        config: Config,
    ) -> Self {
        let baseline = tokio::sync::Mutex::new(BaselineStore::new(&dirs));
        Self {
            api,
            converter,
            shell,
            baseline,
            dirs,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for Ctrl-C wiring: setting it lets in-flight calls finish,
    /// launches nothing new, and skips the final state write.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub async fn run(&self, opts: &SyncOptions) -> RunReport {
        let mut report = RunReport::default();
        if let Err(e) = self.run_inner(opts, &mut report).await {
            report.fatal = Some(e);
        }
        report
    }

    async fn run_inner(
        &self,
        opts: &SyncOptions,
        report: &mut RunReport,
    ) -> Result<(), SyncError> {
        self.dirs.ensure()?;
        let state = SyncState::load(&self.dirs)?;
        self.baseline.lock().await.init_if_missing()?;
        self.converter.probe().await?;

        let mut new_tracked: HashMap<PageId, PathBuf> = HashMap::new();
        if opts.single_file.is_some() {
            // A single-file run must not forget the pages it did not touch.
            if let Some(state) = &state {
                for t in &state.tracked_pages {
                    new_tracked.insert(t.page_id.clone(), t.local_path.clone());
                }
            }
        }
        for space in &self.config.spaces {
            self.sync_space(space, state.as_ref(), opts, report, &mut new_tracked)
                .await?;
            if self.cancelled() {
                break;
            }
        }

        if opts.dry_run {
            return Ok(());
        }
        if self.cancelled() {
            tracing::warn!("cancelled; state file left untouched, partial baselines kept");
            return Ok(());
        }

        let last_synced = if opts.single_file.is_some() {
            state.as_ref().and_then(|s| s.last_synced)
        } else {
            Some(chrono::Utc::now())
        };
        let mut tracked_pages: Vec<crate::types::TrackedPage> = new_tracked
            .into_iter()
            .map(|(page_id, local_path)| crate::types::TrackedPage {
                page_id,
                local_path,
            })
            .collect();
        tracked_pages.sort_by(|a, b| a.local_path.cmp(&b.local_path));
        SyncState {
            last_synced,
            tracked_pages,
        }
        .save(&self.dirs)?;
        self.dirs.purge_temp();
        Ok(())
    }

    async fn sync_space(
        &self,
        space: &SpaceConfig,
        state: Option<&SyncState>,
        opts: &SyncOptions,
        report: &mut RunReport,
        new_tracked: &mut HashMap<PageId, PathBuf>,
    ) -> Result<(), SyncError> {
        let scanner = RemoteScanner::new(self.api.as_ref(), &self.shell);
        let remotes = scanner.discover(space, self.config.page_limit).await?;

        let local_scanner = LocalScanner::new(space.local_path.clone());
        std::fs::create_dir_all(&space.local_path)
            .map_err(|e| SyncError::fs("create_dir", &space.local_path, e))?;
        let local_scan = local_scanner.scan()?;
        report.errors.extend(local_scan.errors);

        if state.is_none()
            && self.baseline.lock().await.is_empty()?
            && opts.force == ForceMode::None
            && !local_scan.pages.is_empty()
            && !remotes.is_empty()
        {
            return Err(SyncError::Config {
                path: self.dirs.state_path(),
                reason: format!(
                    "first sync of space {} found content on both sides; start from one empty side, or pick a winner with --force-push / --force-pull",
                    space.space_key
                ),
            });
        }

        let mut classification = {
            let baseline = self.baseline.lock().await;
            let detector = ChangeDetector::new(
                &baseline,
                state,
                space,
                opts.force,
                opts.single_file.clone(),
            );
            detector.classify(&local_scan.pages, &remotes)?
        };
        report.errors.append(&mut classification.errors);

        if opts.dry_run {
            render_dry_run(space, &classification);
            report.dry_run_conflicts |= classification.has_conflicts();
            return Ok(());
        }

        // Pages surviving on both sides stay tracked even if untouched.
        for entry in &classification.entries {
            if let (Some(id), Some(path)) = (&entry.page_id, &entry.path) {
                if !matches!(
                    entry.class,
                    ChangeClass::DeleteLocal | ChangeClass::DeleteRemote
                ) {
                    new_tracked.insert(id.clone(), path.clone());
                }
            }
        }

        let remotes_by_id: HashMap<&PageId, &RemotePage> =
            remotes.iter().map(|p| (&p.id, p)).collect();
        let locals_by_path: HashMap<&Path, &LocalPage> = local_scan
            .pages
            .iter()
            .map(|p| (p.path.as_path(), p))
            .collect();

        self.phase_creations(space, &classification, &locals_by_path, report, new_tracked)
            .await;
        self.phase_deletions(space, &classification, report, new_tracked)
            .await;
        self.phase_moves(space, &classification, report, new_tracked)
            .await;
        self.phase_content(
            space,
            &classification,
            &remotes_by_id,
            &locals_by_path,
            report,
            new_tracked,
        )
        .await;
        self.phase_conflicts(space, &classification, &locals_by_path, report, new_tracked)
            .await;

        for entry in &classification.entries {
            if entry.class == ChangeClass::Unchanged {
                report.unchanged += 1;
            }
        }
        Ok(())
    }

    /// Phase a: create remote pages for unbound local files, parents before
    /// children so a new parent exists before anything lands under it.
    async fn phase_creations(
        &self,
        space: &SpaceConfig,
        classification: &Classification,
        locals_by_path: &HashMap<&Path, &LocalPage>,
        report: &mut RunReport,
        new_tracked: &mut HashMap<PageId, PathBuf>,
    ) {
        let mut dir_to_id: HashMap<PathBuf, Option<PageId>> = HashMap::new();
        dir_to_id.insert(PathBuf::new(), space.parent_page_id.clone());
        for page in locals_by_path.values() {
            if let Some(id) = &page.page_id {
                dir_to_id.insert(page.path.with_extension(""), Some(id.clone()));
            }
        }

        let mut creations: Vec<&Entry> = classification
            .entries
            .iter()
            .filter(|e| e.class == ChangeClass::CreateLocal)
            .collect();
        creations.sort_by_key(|e| {
            e.path
                .as_ref()
                .map(|p| p.components().count())
                .unwrap_or(usize::MAX)
        });

        for entry in creations {
            if self.cancelled() {
                return;
            }
            let Some(path) = &entry.path else { continue };
            match self
                .create_one(space, path, entry, locals_by_path, &mut dir_to_id)
                .await
            {
                Ok(page_id) => {
                    // A force-push re-creation leaves a stale binding behind.
                    if let Some(old) = &entry.page_id {
                        new_tracked.remove(old);
                    }
                    new_tracked.insert(page_id, path.clone());
                    report.created_remote += 1;
                }
                Err(e) => {
                    if e.is_fatal() {
                        self.cancel.store(true, Ordering::SeqCst);
                    }
                    tracing::warn!(path = %path.display(), error = %e, "create failed");
                    report.errors.push(e);
                }
            }
        }
    }

    async fn create_one(
        &self,
        space: &SpaceConfig,
        path: &Path,
        entry: &Entry,
        locals_by_path: &HashMap<&Path, &LocalPage>,
        dir_to_id: &mut HashMap<PathBuf, Option<PageId>>,
    ) -> Result<PageId, SyncError> {
        let (content, stale_id) = match locals_by_path.get(path) {
            Some(page) => (page.content.clone(), page.page_id.clone()),
            None => {
                // Re-creation of a remotely deleted page under force-push.
                let content = std::fs::read_to_string(space.local_path.join(path))
                    .map_err(|e| SyncError::fs("read", path, e))?;
                (content, entry.page_id.clone())
            }
        };
        let body = frontmatter::parse(path, &content)?.body;

        let parent_dir = path.parent().map(PathBuf::from).unwrap_or_default();
        let parent = match dir_to_id.get(&parent_dir) {
            Some(parent) => parent.clone(),
            None => {
                return Err(SyncError::Config {
                    path: path.to_path_buf(),
                    reason: format!(
                        "no page owns directory {}; create the parent page first",
                        parent_dir.display()
                    ),
                })
            }
        };

        let title = derive_title(path, &body);
        let storage = self.converter.markdown_to_storage(&body).await?;

        let api = self.api.as_ref();
        let space_key = space.space_key.as_str();
        let parent_ref = parent.as_ref();
        let title_ref = title.as_str();
        let storage_ref = storage.as_str();
        let page_ref = self
            .shell
            .call("create_page", move || {
                api.create_page(space_key, title_ref, storage_ref, parent_ref)
                    .boxed()
            })
            .await?;

        let rebound = frontmatter::rebind(path, &content, &page_ref.id)?;
        atomic_write(
            &self.dirs.temp_dir(),
            &space.local_path.join(path),
            rebound.as_bytes(),
        )?;
        {
            let baseline = self.baseline.lock().await;
            if let Some(old) = &stale_id {
                baseline.remove(old)?;
            }
            baseline.put(&page_ref.id, &rebound)?;
        }
        dir_to_id.insert(path.with_extension(""), Some(page_ref.id.clone()));
        tracing::info!(page_id = %page_ref.id, path = %path.display(), "created remote page");
        Ok(page_ref.id)
    }

    /// Phase b: deletions. A locally deleted page moves the remote page to
    /// trash; a remotely deleted page unlinks the one local file.
    async fn phase_deletions(
        &self,
        space: &SpaceConfig,
        classification: &Classification,
        report: &mut RunReport,
        new_tracked: &mut HashMap<PageId, PathBuf>,
    ) {
        for entry in &classification.entries {
            if self.cancelled() {
                return;
            }
            match entry.class {
                ChangeClass::DeleteLocal => {
                    let Some(id) = &entry.page_id else { continue };
                    let api = self.api.as_ref();
                    let id_ref = id;
                    let result = self
                        .shell
                        .call("delete_page", move || api.delete_page(id_ref).boxed())
                        .await;
                    match result {
                        Ok(()) | Err(SyncError::PageNotFound { .. }) => {
                            if let Err(e) = self.baseline.lock().await.remove(id) {
                                report.errors.push(e);
                            }
                            new_tracked.remove(id);
                            report.deleted_remote += 1;
                            tracing::info!(page_id = %id, "trashed remote page");
                        }
                        Err(e) => {
                            if e.is_fatal() {
                                self.cancel.store(true, Ordering::SeqCst);
                            }
                            report.errors.push(e);
                        }
                    }
                }
                ChangeClass::DeleteRemote => {
                    let Some(path) = &entry.path else { continue };
                    let abs = space.local_path.join(path);
                    match std::fs::remove_file(&abs) {
                        Ok(()) => {
                            prune_empty_dirs(&space.local_path, path);
                            if let Some(id) = &entry.page_id {
                                if let Err(e) = self.baseline.lock().await.remove(id) {
                                    report.errors.push(e);
                                }
                                new_tracked.remove(id);
                            }
                            report.deleted_local += 1;
                            tracing::info!(path = %path.display(), "unlinked local file");
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => report.errors.push(SyncError::fs("remove", &abs, e)),
                    }
                }
                _ => {}
            }
        }
    }

    /// Phase c: moves, after creations so any new parent already exists.
    async fn phase_moves(
        &self,
        space: &SpaceConfig,
        classification: &Classification,
        report: &mut RunReport,
        new_tracked: &mut HashMap<PageId, PathBuf>,
    ) {
        for entry in &classification.entries {
            if self.cancelled() {
                return;
            }
            match entry.class {
                ChangeClass::MoveLocal => {
                    let (Some(id), Some(parent)) = (&entry.page_id, &entry.new_parent_id)
                    else {
                        continue;
                    };
                    match self.reparent(id, parent).await {
                        Ok(()) => {
                            report.moved_local += 1;
                            tracing::info!(page_id = %id, parent = %parent, "reparented remote page");
                        }
                        Err(e) => {
                            if e.is_fatal() {
                                self.cancel.store(true, Ordering::SeqCst);
                            }
                            report.errors.push(e);
                        }
                    }
                }
                ChangeClass::MoveRemote => {
                    let (Some(id), Some(path), Some(new_path)) =
                        (&entry.page_id, &entry.path, &entry.new_path)
                    else {
                        continue;
                    };
                    let from = space.local_path.join(path);
                    let to = space.local_path.join(new_path);
                    let result = to
                        .parent()
                        .map(|p| {
                            std::fs::create_dir_all(p)
                                .map_err(|e| SyncError::fs("create_dir", p, e))
                        })
                        .unwrap_or(Ok(()))
                        .and_then(|_| {
                            std::fs::rename(&from, &to)
                                .map_err(|e| SyncError::fs("rename", &from, e))
                        });
                    match result {
                        Ok(()) => {
                            prune_empty_dirs(&space.local_path, path);
                            new_tracked.insert(id.clone(), new_path.clone());
                            report.moved_remote += 1;
                            tracing::info!(
                                page_id = %id,
                                from = %path.display(),
                                to = %new_path.display(),
                                "relocated local file"
                            );
                        }
                        Err(e) => report.errors.push(e),
                    }
                }
                ChangeClass::MoveConflict => {
                    let Some(id) = &entry.page_id else { continue };
                    report.errors.push(SyncError::MoveConflict {
                        page_id: id.clone(),
                        target_path: entry
                            .new_path
                            .clone()
                            .or_else(|| entry.path.clone())
                            .unwrap_or_default(),
                    });
                }
                _ => {}
            }
        }
    }

    async fn reparent(&self, id: &PageId, parent: &PageId) -> Result<(), SyncError> {
        let api = self.api.as_ref();
        let page = self
            .shell
            .call("get_page", move || {
                api.get_page(id, PageFormat::Storage).boxed()
            })
            .await?;
        let version = page.version + 1;
        self.shell
            .call("update_parent", move || {
                api.update_parent(id, parent, version).boxed()
            })
            .await?;
        Ok(())
    }

    /// Phase d: content pushes and pulls through the bounded worker pool.
    async fn phase_content(
        &self,
        space: &SpaceConfig,
        classification: &Classification,
        remotes_by_id: &HashMap<&PageId, &RemotePage>,
        locals_by_path: &HashMap<&Path, &LocalPage>,
        report: &mut RunReport,
        new_tracked: &mut HashMap<PageId, PathBuf>,
    ) {
        let mut jobs: Vec<(Entry, PathBuf)> = Vec::new();
        for entry in &classification.entries {
            match entry.class {
                ChangeClass::PushContent | ChangeClass::PullContent => {
                    let Some(id) = &entry.page_id else { continue };
                    // Moves ran first; the tracked map knows the current path.
                    let path = new_tracked
                        .get(id)
                        .cloned()
                        .or_else(|| entry.path.clone());
                    if let Some(path) = path {
                        jobs.push((entry.clone(), path));
                    }
                }
                ChangeClass::CreateRemote => {
                    let Some(id) = &entry.page_id else { continue };
                    if let Some(remote) = remotes_by_id.get(id) {
                        let path =
                            expected_rel_path(remote, space.parent_page_id.as_ref());
                        jobs.push((entry.clone(), path));
                    }
                }
                _ => {}
            }
        }

        let outcomes: Vec<(Entry, PathBuf, TaskOutcome)> = futures_util::stream::iter(
            jobs.into_iter().map(|(entry, path)| async move {
                let outcome = if self.cancelled() {
                    TaskOutcome::Skipped
                } else {
                    self.content_task(space, &entry, &path, locals_by_path).await
                };
                (entry, path, outcome)
            }),
        )
        .buffer_unordered(CONCURRENT_PAGE_TASKS)
        .collect()
        .await;

        for (entry, path, outcome) in outcomes {
            Self::fold_outcome(entry, path, outcome, report, new_tracked);
        }
    }

    async fn content_task(
        &self,
        space: &SpaceConfig,
        entry: &Entry,
        path: &Path,
        locals_by_path: &HashMap<&Path, &LocalPage>,
    ) -> TaskOutcome {
        let Some(id) = entry.page_id.clone() else {
            return TaskOutcome::Skipped;
        };
        let result = match entry.class {
            ChangeClass::PushContent => {
                let content = match local_content(space, path, locals_by_path) {
                    Ok(content) => content,
                    Err(e) => return TaskOutcome::Failed(e),
                };
                self.push_page(&id, path, &content).await.map(|pushed| {
                    if pushed {
                        TaskOutcome::Pushed {
                            page_id: id.clone(),
                            path: path.to_path_buf(),
                            was_merge: false,
                        }
                    } else {
                        TaskOutcome::Unchanged
                    }
                })
            }
            ChangeClass::PullContent | ChangeClass::CreateRemote => {
                let fresh = entry.class == ChangeClass::CreateRemote;
                self.pull_page(space, &id, path).await.map(|wrote| {
                    if wrote {
                        TaskOutcome::Pulled {
                            page_id: id.clone(),
                            path: path.to_path_buf(),
                            fresh_file: fresh,
                        }
                    } else {
                        TaskOutcome::Unchanged
                    }
                })
            }
            _ => Ok(TaskOutcome::Skipped),
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_fatal() {
                    self.cancel.store(true, Ordering::SeqCst);
                }
                TaskOutcome::Failed(e)
            }
        }
    }

    /// Pushes local content to the remote, surgically when the block match
    /// holds, as a full-body replace otherwise. Returns false when the
    /// remote already matches. One version-conflict retry re-fetches.
    async fn push_page(
        &self,
        id: &PageId,
        path: &Path,
        local_content: &str,
    ) -> Result<bool, SyncError> {
        let local_body = frontmatter::parse(path, local_content)?.body;
        let baseline_body = match self.baseline.lock().await.get(id)? {
            Some(content) => Some(frontmatter::parse(path, &content)?.body),
            None => None,
        };

        let mut retried = false;
        loop {
            let api = self.api.as_ref();
            let page = self
                .shell
                .call("get_page", move || {
                    api.get_page(id, PageFormat::RichDocument).boxed()
                })
                .await?;

            let result = self
                .push_against(
                    id,
                    &page.title,
                    page.version,
                    &page.body,
                    &local_body,
                    baseline_body.as_deref(),
                )
                .await;
            match result {
                Err(SyncError::VersionConflict { .. }) if !retried => {
                    tracing::warn!(page_id = %id, "version conflict, re-fetching once");
                    retried = true;
                }
                Err(e) => return Err(e),
                Ok(pushed) => {
                    if pushed {
                        self.baseline.lock().await.put(id, local_content)?;
                    }
                    return Ok(pushed);
                }
            }
        }
    }

    async fn push_against(
        &self,
        id: &PageId,
        title: &str,
        current_version: u64,
        rich_body: &str,
        local_body: &str,
        baseline_body: Option<&str>,
    ) -> Result<bool, SyncError> {
        let doc = StructuredDoc::parse(rich_body)?;

        let plan = match baseline_body {
            Some(base) => surgical::diff(base, local_body, &doc)?,
            None => surgical::SurgicalPlan {
                ops: Vec::new(),
                fallback_required: true,
            },
        };

        let api = self.api.as_ref();
        let version = current_version + 1;
        if plan.fallback_required {
            let storage = self.converter.markdown_to_storage(local_body).await?;
            let storage_ref = storage.as_str();
            self.shell
                .call("update_page", move || {
                    api.update_page(id, title, storage_ref, version).boxed()
                })
                .await?;
            tracing::debug!(page_id = %id, "full-body replace push");
            return Ok(true);
        }
        if plan.ops.is_empty() {
            return Ok(false);
        }

        let mut patched = doc;
        patched.apply_ops(&plan.ops)?;
        let body = serde_json::to_string(&patched).map_err(|e| SyncError::Conversion {
            reason: format!("serializing patched document: {}", e),
        })?;
        let body_ref = body.as_str();
        self.shell
            .call("update_page", move || {
                api.update_page(id, title, body_ref, version).boxed()
            })
            .await?;
        tracing::debug!(page_id = %id, ops = plan.ops.len(), "surgical push");
        Ok(true)
    }

    /// Pulls remote content into the local file. Returns false when the
    /// fetched content already equals the baseline and the local file.
    async fn pull_page(
        &self,
        space: &SpaceConfig,
        id: &PageId,
        path: &Path,
    ) -> Result<bool, SyncError> {
        let api = self.api.as_ref();
        let page = self
            .shell
            .call("get_page", move || {
                api.get_page(id, PageFormat::Storage).boxed()
            })
            .await?;
        if crate::document::storage_has_extension_elements(&page.body) {
            tracing::debug!(page_id = %id, "page carries extension elements; placeholders preserved");
        }
        let markdown = self.converter.storage_to_markdown(&page.body).await?;
        let content = frontmatter::render(Some(id), &markdown);

        let abs = space.local_path.join(path);
        let on_disk = std::fs::read_to_string(&abs).ok();
        let baseline_same =
            self.baseline.lock().await.get(id)?.as_deref() == Some(content.as_str());
        if baseline_same && on_disk.as_deref() == Some(content.as_str()) {
            return Ok(false);
        }

        atomic_write(&self.dirs.temp_dir(), &abs, content.as_bytes())?;
        self.baseline.lock().await.put(id, &content)?;
        Ok(true)
    }

    /// Phase e: three-way merge per conflicted page, then push the merged
    /// result or write markers and report.
    async fn phase_conflicts(
        &self,
        space: &SpaceConfig,
        classification: &Classification,
        locals_by_path: &HashMap<&Path, &LocalPage>,
        report: &mut RunReport,
        new_tracked: &mut HashMap<PageId, PathBuf>,
    ) {
        for entry in &classification.entries {
            if entry.class != ChangeClass::Conflict {
                continue;
            }
            if self.cancelled() {
                return;
            }
            let (Some(id), Some(path)) = (entry.page_id.clone(), entry.path.clone()) else {
                continue;
            };
            let path = new_tracked.get(&id).cloned().unwrap_or(path);
            let outcome = self
                .conflict_task(space, &id, &path, locals_by_path)
                .await;
            Self::fold_outcome(entry.clone(), path, outcome, report, new_tracked);
        }
    }

    async fn conflict_task(
        &self,
        space: &SpaceConfig,
        id: &PageId,
        path: &Path,
        locals_by_path: &HashMap<&Path, &LocalPage>,
    ) -> TaskOutcome {
        match self
            .resolve_conflict(space, id, path, locals_by_path)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_fatal() {
                    self.cancel.store(true, Ordering::SeqCst);
                }
                TaskOutcome::Failed(e)
            }
        }
    }

    async fn resolve_conflict(
        &self,
        space: &SpaceConfig,
        id: &PageId,
        path: &Path,
        locals_by_path: &HashMap<&Path, &LocalPage>,
    ) -> Result<TaskOutcome, SyncError> {
        let local_content = local_content(space, path, locals_by_path)?;
        let local_body = frontmatter::parse(path, &local_content)?.body;

        let api = self.api.as_ref();
        let page = self
            .shell
            .call("get_page", move || {
                api.get_page(id, PageFormat::Storage).boxed()
            })
            .await?;
        let theirs_body = self.converter.storage_to_markdown(&page.body).await?;

        let baseline_content = self.baseline.lock().await.get(id)?;
        let baseline_body = match &baseline_content {
            Some(content) => Some(frontmatter::parse(path, content)?.body),
            None => None,
        };

        // The timestamp check is only a fast filter; content settles it.
        if baseline_body.as_deref() == Some(theirs_body.as_str()) {
            let pushed = self.push_page(id, path, &local_content).await?;
            return Ok(if pushed {
                TaskOutcome::Pushed {
                    page_id: id.clone(),
                    path: path.to_path_buf(),
                    was_merge: false,
                }
            } else {
                TaskOutcome::Unchanged
            });
        }
        if baseline_body.as_deref() == Some(local_body.as_str()) {
            let wrote = self.pull_page(space, id, path).await?;
            return Ok(if wrote {
                TaskOutcome::Pulled {
                    page_id: id.clone(),
                    path: path.to_path_buf(),
                    fresh_file: false,
                }
            } else {
                TaskOutcome::Unchanged
            });
        }

        let result = match &baseline_body {
            Some(base) => merge::merge(base, &local_body, &theirs_body),
            None => {
                tracing::warn!(page_id = %id, "no baseline, falling back to two-way merge");
                merge::merge_two_way(&local_body, &theirs_body)
            }
        };

        let merged_content = frontmatter::render(Some(id), &result.merged);
        atomic_write(
            &self.dirs.temp_dir(),
            &space.local_path.join(path),
            merged_content.as_bytes(),
        )?;

        if result.has_conflicts() {
            return Ok(TaskOutcome::ConflictMarkers {
                page_id: id.clone(),
                conflict_count: result.conflict_count,
            });
        }

        self.push_page(id, path, &merged_content).await?;
        Ok(TaskOutcome::Pushed {
            page_id: id.clone(),
            path: path.to_path_buf(),
            was_merge: true,
        })
    }

    fn fold_outcome(
        entry: Entry,
        path: PathBuf,
        outcome: TaskOutcome,
        report: &mut RunReport,
        new_tracked: &mut HashMap<PageId, PathBuf>,
    ) {
        match outcome {
            TaskOutcome::Pushed {
                page_id, was_merge, ..
            } => {
                new_tracked.insert(page_id, path);
                report.pushed += 1;
                if was_merge {
                    report.merged += 1;
                }
            }
            TaskOutcome::Pulled {
                page_id,
                fresh_file,
                ..
            } => {
                new_tracked.insert(page_id, path);
                if fresh_file {
                    report.created_local += 1;
                } else {
                    report.pulled += 1;
                }
            }
            TaskOutcome::Unchanged => {
                if let Some(id) = entry.page_id {
                    new_tracked.insert(id, path);
                }
                report.unchanged += 1;
            }
            TaskOutcome::ConflictMarkers {
                page_id,
                conflict_count,
            } => {
                new_tracked.insert(page_id.clone(), path);
                report.unresolved_conflicts += 1;
                report.errors.push(SyncError::MergeUnresolved {
                    page_id,
                    conflict_count,
                });
            }
            TaskOutcome::Skipped => {}
            TaskOutcome::Failed(e) => report.errors.push(e),
        }
    }
}

/// Reads the page's current content, preferring the scan snapshot.
fn local_content(
    space: &SpaceConfig,
    path: &Path,
    locals_by_path: &HashMap<&Path, &LocalPage>,
) -> Result<String, SyncError> {
    if let Some(page) = locals_by_path.get(path) {
        return Ok(page.content.clone());
    }
    let abs = space.local_path.join(path);
    std::fs::read_to_string(&abs).map_err(|e| SyncError::fs("read", &abs, e))
}

fn derive_title(path: &Path, body: &str) -> String {
    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("# ") {
            if !rest.trim().is_empty() {
                return rest.trim().to_string();
            }
        }
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Untitled")
        .replace(['-', '_'], " ")
}

/// Removes now-empty directories between the deleted file and the root.
fn prune_empty_dirs(root: &Path, removed_rel: &Path) {
    let mut dir = removed_rel.parent().map(PathBuf::from);
    while let Some(rel) = dir {
        if rel.as_os_str().is_empty() {
            break;
        }
        let abs = root.join(&rel);
        if std::fs::remove_dir(&abs).is_err() {
            break;
        }
        dir = rel.parent().map(PathBuf::from);
    }
}

fn render_dry_run(space: &SpaceConfig, classification: &Classification) {
    if classification.is_noop() {
        println!("Space {}: everything in sync", space.space_key);
        return;
    }
    let pending = classification
        .entries
        .iter()
        .filter(|e| e.class != ChangeClass::Unchanged)
        .count();
    println!(
        "Space {}: {} pending change(s)",
        space.space_key, pending
    );
    for entry in &classification.entries {
        if entry.class == ChangeClass::Unchanged {
            continue;
        }
        let id = entry.page_id.as_deref().unwrap_or("-");
        let path = entry
            .path
            .as_ref()
            .or(entry.new_path.as_ref())
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<14} {:<12} {}", entry.class.to_string(), id, path);
    }
}
