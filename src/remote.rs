use crate::config::SpaceConfig;
use crate::types::{Ancestor, PageId, RemotePage, SyncError};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(30);
pub const SEARCH_PAGE_SIZE: usize = 100;
pub const SEARCH_EXPAND: &[&str] = &["version.when", "ancestors"];

/// How many rate-limit retries a single call gets (sleeps 1s, 2s, 4s).
const RATE_LIMIT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFormat {
    /// XML storage representation, extension elements under `ac:`/`ri:`.
    Storage,
    /// JSON document with stable per-node local ids.
    RichDocument,
}

#[derive(Debug, Clone)]
pub struct PageRef {
    pub id: PageId,
    pub version: u64,
}

#[derive(Debug, Clone)]
pub struct Page {
    pub id: PageId,
    pub title: String,
    /// Body in the requested format.
    pub body: String,
    pub format: PageFormat,
    pub version: u64,
    pub parent_id: Option<PageId>,
    pub labels: Vec<String>,
    pub last_modified: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct PageSummary {
    pub id: PageId,
    pub title: String,
    pub last_modified: chrono::DateTime<chrono::Utc>,
    /// Root first, direct parent last.
    pub ancestors: Vec<Ancestor>,
    pub space_key: String,
}

/// CQL query string builder. Only the clause shapes this tool issues.
#[derive(Debug, Clone, PartialEq)]
pub struct CqlQuery(String);

impl CqlQuery {
    /// All descendants of `parent` in `space_key`; the whole space when the
    /// configured subtree is the space root.
    pub fn subtree(space_key: &str, parent: Option<&PageId>) -> Self {
        match parent {
            Some(id) => CqlQuery(format!("ancestor = {} AND space = \"{}\"", id, space_key)),
            None => CqlQuery(format!("space = \"{}\" AND type = page", space_key)),
        }
    }

    pub fn title_in_space(space_key: &str, title: &str) -> Self {
        CqlQuery(format!(
            "space = \"{}\" AND title = \"{}\"",
            space_key,
            title.replace('"', "\\\"")
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The remote wiki surface this crate consumes. Wire details (HTTP, auth
/// handshake, pagination) live behind the implementation; every method
/// returns a classified error from the taxonomy.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn get_page(&self, id: &PageId, format: PageFormat) -> Result<Page, SyncError>;

    /// Runs a CQL query and yields the full result set; pagination is
    /// handled internally.
    async fn search(
        &self,
        query: &CqlQuery,
        expand: &[&str],
        page_size: usize,
    ) -> Result<Vec<PageSummary>, SyncError>;

    async fn create_page(
        &self,
        space_key: &str,
        title: &str,
        storage_body: &str,
        parent_id: Option<&PageId>,
    ) -> Result<PageRef, SyncError>;

    /// `body` is either storage XML or a serialized rich document; `version`
    /// is the new version number (current + 1), and a stale value yields the
    /// version-conflict classification.
    async fn update_page(
        &self,
        id: &PageId,
        title: &str,
        body: &str,
        version: u64,
    ) -> Result<PageRef, SyncError>;

    async fn update_parent(
        &self,
        id: &PageId,
        new_parent_id: &PageId,
        version: u64,
    ) -> Result<PageRef, SyncError>;

    /// Moves the page to the remote trash.
    async fn delete_page(&self, id: &PageId) -> Result<(), SyncError>;
}

/// Shared "next earliest start" instant. When one worker gets rate limited,
/// everyone else's next call waits too instead of storming the API.
#[derive(Debug, Default)]
pub struct BackoffGate {
    next_start: Mutex<Option<Instant>>,
}

impl BackoffGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn wait_ready(&self) {
        let deadline = *self.next_start.lock().await;
        if let Some(deadline) = deadline {
            tokio::time::sleep_until(deadline).await;
        }
    }

    pub async fn hold_for(&self, delay: Duration) {
        let mut next = self.next_start.lock().await;
        let candidate = Instant::now() + delay;
        if next.map_or(true, |current| candidate > current) {
            *next = Some(candidate);
        }
    }
}

/// Wraps every remote call: operation timeout, rate-limit backoff of
/// 1s/2s/4s (or the remote's retry hint when larger), fail-fast on anything
/// else. Stateless between calls.
#[derive(Clone)]
pub struct RetryShell {
    gate: Arc<BackoffGate>,
    timeout: Duration,
}

impl RetryShell {
    pub fn new(gate: Arc<BackoffGate>) -> Self {
        Self {
            gate,
            timeout: REMOTE_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(gate: Arc<BackoffGate>, timeout: Duration) -> Self {
        Self { gate, timeout }
    }

    pub async fn call<'a, T>(
        &self,
        endpoint: &str,
        op: impl Fn() -> BoxFuture<'a, Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        let mut attempt: u32 = 0;
        loop {
            self.gate.wait_ready().await;

            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(SyncError::Network {
                        endpoint: endpoint.to_string(),
                        cause: format!("timed out after {}s", self.timeout.as_secs()),
                    })
                }
            };

            match result {
                Err(SyncError::RateLimit { retry_hint }) => {
                    if attempt == RATE_LIMIT_RETRIES {
                        return Err(SyncError::rate_limit_exhausted(endpoint));
                    }
                    let backoff = Duration::from_secs(1 << attempt);
                    let delay = retry_hint.map_or(backoff, |hint| hint.max(backoff));
                    tracing::warn!(
                        endpoint,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "rate limited, backing off"
                    );
                    self.gate.hold_for(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Discovers the configured subtree with a single CQL query, applies the
/// exclusion list subtree-wide, and enforces the page limit before the
/// orchestrator writes anything.
pub struct RemoteScanner<'a> {
    api: &'a dyn RemoteApi,
    shell: &'a RetryShell,
}

impl<'a> RemoteScanner<'a> {
    pub fn new(api: &'a dyn RemoteApi, shell: &'a RetryShell) -> Self {
        Self { api, shell }
    }

    pub async fn discover(
        &self,
        space: &SpaceConfig,
        page_limit: usize,
    ) -> Result<Vec<RemotePage>, SyncError> {
        use futures_util::FutureExt;

        let query = CqlQuery::subtree(&space.space_key, space.parent_page_id.as_ref());
        let api = self.api;
        let query_ref = &query;
        let summaries = self
            .shell
            .call("search", move || {
                api.search(query_ref, SEARCH_EXPAND, SEARCH_PAGE_SIZE).boxed()
            })
            .await?;

        let excluded: HashSet<&PageId> = space.exclude_page_ids.iter().collect();
        let pages: Vec<RemotePage> = summaries
            .into_iter()
            .filter(|s| {
                !excluded.contains(&s.id) && !s.ancestors.iter().any(|a| excluded.contains(&a.id))
            })
            .map(|s| RemotePage {
                id: s.id,
                title: s.title,
                last_modified: s.last_modified,
                ancestor_chain: s.ancestors,
                space_key: s.space_key,
            })
            .collect();

        if pages.len() > page_limit {
            return Err(SyncError::Config {
                path: std::path::PathBuf::from("config.yaml"),
                reason: format!(
                    "subtree under space {} has {} pages, exceeding page_limit {}; split the hierarchy or raise page_limit",
                    space.space_key,
                    pages.len(),
                    page_limit
                ),
            });
        }

        tracing::info!(
            space = %space.space_key,
            pages = pages.len(),
            excluded = space.exclude_page_ids.len(),
            "discovered remote subtree"
        );
        Ok(pages)
    }
}

/// Resolves a `/`-separated title path inside a space to a page id, one
/// ancestor-verified title lookup per segment. An empty path (the space
/// root) resolves to None.
pub async fn resolve_title_path(
    api: &dyn RemoteApi,
    shell: &RetryShell,
    space_key: &str,
    title_path: &str,
) -> Result<Option<PageId>, SyncError> {
    use futures_util::FutureExt;

    let mut parent: Option<PageId> = None;
    for title in title_path.split('/').map(str::trim).filter(|s| !s.is_empty()) {
        let query = CqlQuery::title_in_space(space_key, title);
        let query_ref = &query;
        let results = shell
            .call("search", move || {
                api.search(query_ref, SEARCH_EXPAND, SEARCH_PAGE_SIZE).boxed()
            })
            .await?;

        let matched: Vec<&PageSummary> = results
            .iter()
            .filter(|s| match &parent {
                Some(p) => s.ancestors.last().map(|a| &a.id) == Some(p),
                None => true,
            })
            .collect();
        parent = match matched.as_slice() {
            [only] => Some(only.id.clone()),
            [] => {
                return Err(SyncError::Config {
                    path: std::path::PathBuf::from(title_path),
                    reason: format!(
                        "no page titled '{}' found in space {}; check the path given to --init",
                        title, space_key
                    ),
                })
            }
            _ => {
                return Err(SyncError::Config {
                    path: std::path::PathBuf::from(title_path),
                    reason: format!(
                        "title '{}' is ambiguous in space {}; qualify it with its parent titles",
                        title, space_key
                    ),
                })
            }
        };
    }
    Ok(parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rate_limited(hint: Option<Duration>) -> SyncError {
        SyncError::RateLimit { retry_hint: hint }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_with_exponential_backoff() {
        let shell = RetryShell::new(Arc::new(BackoffGate::new()));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<u32, _> = shell
            .call("get_page", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(rate_limited(None))
                    } else {
                        Ok(99)
                    }
                }
                .boxed()
            })
            .await;

        assert_eq!(result.unwrap(), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 1s + 2s + 4s of backoff under the paused clock.
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_rate_limit_becomes_network_error() {
        let shell = RetryShell::new(Arc::new(BackoffGate::new()));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = shell
            .call("update_page", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(rate_limited(None)) }.boxed()
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result.unwrap_err() {
            SyncError::Network { cause, .. } => assert_eq!(cause, "rate_limit_exhausted"),
            other => panic!("expected network error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn larger_retry_hint_wins_over_backoff() {
        let shell = RetryShell::new(Arc::new(BackoffGate::new()));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<u32, _> = shell
            .call("get_page", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(rate_limited(Some(Duration::from_secs(10))))
                    } else {
                        Ok(1)
                    }
                }
                .boxed()
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn non_rate_limit_errors_fail_fast() {
        let shell = RetryShell::new(Arc::new(BackoffGate::new()));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = shell
            .call("get_page", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(SyncError::PageNotFound {
                        page_id: "5".to_string(),
                    })
                }
                .boxed()
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(SyncError::PageNotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_as_network_error() {
        let shell =
            RetryShell::with_timeout(Arc::new(BackoffGate::new()), Duration::from_secs(5));

        let result: Result<(), _> = shell
            .call("search", || {
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
                .boxed()
            })
            .await;

        match result.unwrap_err() {
            SyncError::Network { cause, .. } => assert!(cause.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_gate_delays_other_workers() {
        let gate = Arc::new(BackoffGate::new());
        gate.hold_for(Duration::from_secs(4)).await;

        let started = Instant::now();
        gate.wait_ready().await;
        assert_eq!(started.elapsed(), Duration::from_secs(4));

        // A shorter hold never shrinks the shared deadline.
        gate.hold_for(Duration::from_secs(2)).await;
        gate.hold_for(Duration::from_secs(6)).await;
        let started = Instant::now();
        gate.wait_ready().await;
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[test]
    fn cql_shapes() {
        let q = CqlQuery::subtree("DOCS", Some(&"123".to_string()));
        assert_eq!(q.as_str(), "ancestor = 123 AND space = \"DOCS\"");
        let q = CqlQuery::subtree("DOCS", None);
        assert_eq!(q.as_str(), "space = \"DOCS\" AND type = page");
    }

    struct TitleMock {
        pages: Vec<PageSummary>,
    }

    #[async_trait::async_trait]
    impl RemoteApi for TitleMock {
        async fn get_page(&self, id: &PageId, _format: PageFormat) -> Result<Page, SyncError> {
            Err(SyncError::PageNotFound {
                page_id: id.clone(),
            })
        }

        async fn search(
            &self,
            query: &CqlQuery,
            _expand: &[&str],
            _page_size: usize,
        ) -> Result<Vec<PageSummary>, SyncError> {
            // Title queries filter; subtree queries return everything.
            match query.as_str().split("title = \"").nth(1) {
                Some(rest) => {
                    let title = rest.strip_suffix('"').unwrap_or_default();
                    Ok(self
                        .pages
                        .iter()
                        .filter(|p| p.title == title)
                        .cloned()
                        .collect())
                }
                None => Ok(self.pages.clone()),
            }
        }

        async fn create_page(
            &self,
            _space_key: &str,
            title: &str,
            _storage_body: &str,
            parent_id: Option<&PageId>,
        ) -> Result<PageRef, SyncError> {
            Err(SyncError::PageAlreadyExists {
                title: title.to_string(),
                parent_id: parent_id.cloned().unwrap_or_default(),
            })
        }

        async fn update_page(
            &self,
            id: &PageId,
            _title: &str,
            _body: &str,
            _version: u64,
        ) -> Result<PageRef, SyncError> {
            Err(SyncError::PageNotFound {
                page_id: id.clone(),
            })
        }

        async fn update_parent(
            &self,
            id: &PageId,
            _new_parent_id: &PageId,
            _version: u64,
        ) -> Result<PageRef, SyncError> {
            Err(SyncError::PageNotFound {
                page_id: id.clone(),
            })
        }

        async fn delete_page(&self, id: &PageId) -> Result<(), SyncError> {
            Err(SyncError::PageNotFound {
                page_id: id.clone(),
            })
        }
    }

    fn summary(id: &str, title: &str, ancestors: &[(&str, &str)]) -> PageSummary {
        PageSummary {
            id: id.to_string(),
            title: title.to_string(),
            last_modified: chrono::Utc::now(),
            ancestors: ancestors
                .iter()
                .map(|(aid, atitle)| Ancestor {
                    id: aid.to_string(),
                    title: atitle.to_string(),
                })
                .collect(),
            space_key: "DOCS".to_string(),
        }
    }

    fn scanner_space(excludes: &[&str]) -> crate::config::SpaceConfig {
        crate::config::SpaceConfig {
            space_key: "DOCS".to_string(),
            parent_page_id: Some("1000".to_string()),
            local_path: std::path::PathBuf::from("docs"),
            exclude_page_ids: excludes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn excluding_a_page_drops_its_whole_subtree() {
        let mock = TitleMock {
            pages: vec![
                summary("1", "Kept", &[("1000", "Root")]),
                summary("2", "Excluded", &[("1000", "Root")]),
                summary("3", "Child Of Excluded", &[("1000", "Root"), ("2", "Excluded")]),
            ],
        };
        let shell = RetryShell::new(Arc::new(BackoffGate::new()));
        let scanner = RemoteScanner::new(&mock, &shell);

        let pages = scanner.discover(&scanner_space(&["2"]), 100).await.unwrap();
        let ids: Vec<&str> = pages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["1"]);
    }

    #[tokio::test]
    async fn page_limit_is_inclusive() {
        let mock = TitleMock {
            pages: vec![
                summary("1", "A", &[("1000", "Root")]),
                summary("2", "B", &[("1000", "Root")]),
            ],
        };
        let shell = RetryShell::new(Arc::new(BackoffGate::new()));
        let scanner = RemoteScanner::new(&mock, &shell);

        assert_eq!(
            scanner.discover(&scanner_space(&[]), 2).await.unwrap().len(),
            2
        );
        let err = scanner
            .discover(&scanner_space(&[]), 1)
            .await
            .unwrap_err();
        match err {
            SyncError::Config { reason, .. } => assert!(reason.contains("page_limit")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn title_path_resolves_through_ancestors() {
        let mock = TitleMock {
            pages: vec![
                summary("1", "Guides", &[]),
                summary("2", "Install", &[("1", "Guides")]),
                // Same title elsewhere in the space, different parent.
                summary("3", "Install", &[("9", "Archive")]),
            ],
        };
        let shell = RetryShell::new(Arc::new(BackoffGate::new()));

        let id = resolve_title_path(&mock, &shell, "DOCS", "Guides/Install")
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("2"));

        let root = resolve_title_path(&mock, &shell, "DOCS", "").await.unwrap();
        assert_eq!(root, None);

        let err = resolve_title_path(&mock, &shell, "DOCS", "Missing")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Config { .. }));
    }
}
