use crate::frontmatter;
use crate::types::{LocalPage, SyncError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Walks the configured local root and yields every managed markdown file.
pub struct LocalScanner {
    root: PathBuf,
}

#[derive(Debug, Default)]
pub struct LocalScan {
    pub pages: Vec<LocalPage>,
    /// Per-file problems (bad front-matter, duplicate bindings). The run
    /// continues without these files.
    pub errors: Vec<SyncError>,
}

impl LocalScanner {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn scan(&self) -> Result<LocalScan, SyncError> {
        let mut scan = LocalScan::default();
        let mut seen_ids: HashMap<String, PathBuf> = HashMap::new();

        for entry in WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e.path()))
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_file() || !is_markdown(path) {
                continue;
            }

            let relative = path
                .strip_prefix(&self.root)
                .map_err(|_| SyncError::fs("strip_prefix", path, std::io::Error::other("path outside root")))?
                .to_path_buf();

            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) => {
                    scan.errors.push(SyncError::fs("read", path, e));
                    continue;
                }
            };
            let modified = match entry.metadata() {
                Ok(meta) => meta
                    .modified()
                    .map_err(|e| SyncError::fs("stat", path, e))?,
                Err(e) => return Err(SyncError::fs("stat", path, e.into())),
            };

            let doc = match frontmatter::parse(&relative, &content) {
                Ok(doc) => doc,
                Err(e) => {
                    scan.errors.push(e);
                    continue;
                }
            };

            if let Some(id) = &doc.page_id {
                if let Some(first) = seen_ids.get(id) {
                    scan.errors.push(SyncError::Frontmatter {
                        path: relative.clone(),
                        line: 2,
                        detail: format!("page_id {} is already bound to {}", id, first.display()),
                    });
                    continue;
                }
                seen_ids.insert(id.clone(), relative.clone());
            }

            scan.pages.push(LocalPage {
                path: relative,
                page_id: doc.page_id,
                content,
                modified,
            });
        }

        Ok(scan)
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_lowercase().as_str(), "md" | "markdown"))
        .unwrap_or(false)
}

/// Maps a remote page title to a filesystem-safe path segment. Binding is
/// always by page id; slugs only drive directory layout.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = false;
    for c in title.trim().chars() {
        let mapped = match c {
            c if c.is_alphanumeric() => {
                last_dash = false;
                Some(c.to_ascii_lowercase())
            }
            '-' | '_' | '.' if !last_dash => {
                last_dash = true;
                Some(c)
            }
            c if c.is_whitespace() || c == '/' || c == '\\' => {
                if last_dash {
                    None
                } else {
                    last_dash = true;
                    Some('-')
                }
            }
            _ => None,
        };
        if let Some(m) = mapped {
            slug.push(m);
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}
