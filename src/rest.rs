use crate::config::Credentials;
use crate::remote::{CqlQuery, Page, PageFormat, PageRef, PageSummary, RemoteApi, REMOTE_TIMEOUT};
use crate::types::{Ancestor, PageId, SyncError};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

/// Confluence Cloud REST adapter for [`RemoteApi`]. Everything above this
/// module talks to the trait; everything about URLs, auth and pagination
/// lives here.
pub struct RestRemote {
    http: reqwest::Client,
    base_url: String,
    user: String,
    token: String,
    /// The credential handshake runs once, on the first call.
    handshake: tokio::sync::OnceCell<()>,
}

impl RestRemote {
    pub fn new(creds: &Credentials) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(REMOTE_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Network {
                endpoint: creds.url.clone(),
                cause: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: creds.url.trim_end_matches('/').to_string(),
            user: creds.user.clone(),
            token: creds.api_token.clone(),
            handshake: tokio::sync::OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn ensure_auth(&self) -> Result<(), SyncError> {
        self.handshake
            .get_or_try_init(|| async {
                let response = self
                    .http
                    .get(self.url("/rest/api/user/current"))
                    .basic_auth(&self.user, Some(&self.token))
                    .send()
                    .await
                    .map_err(|e| self.transport_error("user/current", e))?;
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN
                {
                    return Err(SyncError::AuthFailure {
                        user: self.user.clone(),
                        endpoint: self.base_url.clone(),
                    });
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    fn transport_error(&self, endpoint: &str, e: reqwest::Error) -> SyncError {
        SyncError::Network {
            endpoint: endpoint.to_string(),
            cause: e.to_string(),
        }
    }

    /// Maps HTTP status classes onto the error taxonomy. Callers pass the
    /// page id (for 404) and the version they sent (for 409).
    async fn classify(
        &self,
        endpoint: &str,
        page_id: Option<&PageId>,
        sent_version: Option<u64>,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, SyncError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::AuthFailure {
                user: self.user.clone(),
                endpoint: endpoint.to_string(),
            },
            StatusCode::NOT_FOUND => SyncError::PageNotFound {
                page_id: page_id.cloned().unwrap_or_else(|| endpoint.to_string()),
            },
            StatusCode::CONFLICT => SyncError::VersionConflict {
                page_id: page_id.cloned().unwrap_or_default(),
                expected: sent_version.unwrap_or_default(),
                actual: parse_current_version(&body).unwrap_or_default(),
            },
            StatusCode::TOO_MANY_REQUESTS => SyncError::RateLimit {
                retry_hint: parse_retry_after(&body),
            },
            _ => SyncError::Network {
                endpoint: endpoint.to_string(),
                cause: format!("HTTP {}: {}", status, truncate(&body, 200)),
            },
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Confluence reports the winning version in the 409 body.
fn parse_current_version(body: &str) -> Option<u64> {
    let idx = body.find("current version is")?;
    body[idx..]
        .split(|c: char| !c.is_ascii_digit())
        .find(|s| !s.is_empty())?
        .parse()
        .ok()
}

fn parse_retry_after(body: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("retryAfter")
        .and_then(|v| v.as_u64())
        .map(Duration::from_secs)
}

#[derive(Debug, serde::Deserialize)]
struct VersionField {
    number: u64,
    #[serde(default)]
    when: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, serde::Deserialize)]
struct BodyField {
    #[serde(default)]
    storage: Option<BodyValue>,
    #[serde(default)]
    atlas_doc_format: Option<BodyValue>,
}

#[derive(Debug, serde::Deserialize)]
struct BodyValue {
    value: String,
}

#[derive(Debug, serde::Deserialize)]
struct AncestorField {
    id: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, serde::Deserialize)]
struct SpaceField {
    key: String,
}

#[derive(Debug, serde::Deserialize)]
struct LabelField {
    name: String,
}

#[derive(Debug, Default, serde::Deserialize)]
struct LabelsField {
    #[serde(default)]
    results: Vec<LabelField>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct MetadataField {
    #[serde(default)]
    labels: LabelsField,
}

#[derive(Debug, serde::Deserialize)]
struct ContentResponse {
    id: String,
    title: String,
    #[serde(default)]
    version: Option<VersionField>,
    #[serde(default)]
    body: Option<BodyField>,
    #[serde(default)]
    ancestors: Vec<AncestorField>,
    #[serde(default)]
    space: Option<SpaceField>,
    #[serde(default)]
    metadata: MetadataField,
}

#[derive(Debug, serde::Deserialize)]
struct SearchResponse {
    results: Vec<ContentResponse>,
    #[serde(default)]
    size: usize,
    #[serde(default)]
    limit: usize,
}

fn content_to_page(content: ContentResponse, format: PageFormat) -> Result<Page, SyncError> {
    let version = content.version.as_ref();
    let body = content.body.as_ref().and_then(|b| match format {
        PageFormat::Storage => b.storage.as_ref(),
        PageFormat::RichDocument => b.atlas_doc_format.as_ref(),
    });
    let body = body.map(|b| b.value.clone()).ok_or_else(|| SyncError::Conversion {
        reason: format!("page {} response is missing the requested body", content.id),
    })?;
    Ok(Page {
        id: content.id,
        title: content.title,
        body,
        format,
        version: version.map(|v| v.number).unwrap_or(1),
        parent_id: content.ancestors.last().map(|a| a.id.clone()),
        labels: content
            .metadata
            .labels
            .results
            .into_iter()
            .map(|l| l.name)
            .collect(),
        last_modified: version
            .and_then(|v| v.when)
            .unwrap_or_else(chrono::Utc::now),
    })
}

fn content_to_summary(content: ContentResponse) -> PageSummary {
    PageSummary {
        id: content.id,
        title: content.title,
        last_modified: content
            .version
            .and_then(|v| v.when)
            .unwrap_or_else(chrono::Utc::now),
        ancestors: content
            .ancestors
            .into_iter()
            .map(|a| Ancestor {
                id: a.id,
                title: a.title,
            })
            .collect(),
        space_key: content.space.map(|s| s.key).unwrap_or_default(),
    }
}

fn update_body_json(id: &str, title: &str, body: &str, version: u64) -> serde_json::Value {
    // A body that parses as a JSON document is the rich representation;
    // anything else is storage XML.
    let representation = if body.trim_start().starts_with('{') {
        "atlas_doc_format"
    } else {
        "storage"
    };
    let mut body_field = serde_json::Map::new();
    body_field.insert(
        representation.to_string(),
        serde_json::json!({"value": body, "representation": representation}),
    );
    serde_json::json!({
        "id": id,
        "type": "page",
        "title": title,
        "version": {"number": version},
        "body": body_field
    })
}

#[async_trait]
impl RemoteApi for RestRemote {
    async fn get_page(&self, id: &PageId, format: PageFormat) -> Result<Page, SyncError> {
        self.ensure_auth().await?;
        let expand = match format {
            PageFormat::Storage => "body.storage,version,ancestors,space,metadata.labels",
            PageFormat::RichDocument => {
                "body.atlas_doc_format,version,ancestors,space,metadata.labels"
            }
        };
        let response = self
            .http
            .get(self.url(&format!("/rest/api/content/{}", id)))
            .query(&[("expand", expand)])
            .basic_auth(&self.user, Some(&self.token))
            .send()
            .await
            .map_err(|e| self.transport_error("get_page", e))?;
        let response = self.classify("get_page", Some(id), None, response).await?;
        let content: ContentResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error("get_page", e))?;
        content_to_page(content, format)
    }

    async fn search(
        &self,
        query: &CqlQuery,
        expand: &[&str],
        page_size: usize,
    ) -> Result<Vec<PageSummary>, SyncError> {
        self.ensure_auth().await?;
        let expand = expand.join(",");
        let mut start = 0usize;
        let mut out = Vec::new();
        loop {
            let response = self
                .http
                .get(self.url("/rest/api/content/search"))
                .query(&[
                    ("cql", query.as_str()),
                    ("expand", expand.as_str()),
                    ("limit", &page_size.to_string()),
                    ("start", &start.to_string()),
                ])
                .basic_auth(&self.user, Some(&self.token))
                .send()
                .await
                .map_err(|e| self.transport_error("search", e))?;
            let response = self.classify("search", None, None, response).await?;
            let page: SearchResponse = response
                .json()
                .await
                .map_err(|e| self.transport_error("search", e))?;

            let fetched = page.results.len();
            out.extend(page.results.into_iter().map(content_to_summary));
            // The last page comes back smaller than the limit.
            if fetched < page.limit.max(1) || page.size == 0 {
                break;
            }
            start += fetched;
        }
        Ok(out)
    }

    async fn create_page(
        &self,
        space_key: &str,
        title: &str,
        storage_body: &str,
        parent_id: Option<&PageId>,
    ) -> Result<PageRef, SyncError> {
        self.ensure_auth().await?;
        let mut payload = serde_json::json!({
            "type": "page",
            "title": title,
            "space": {"key": space_key},
            "body": {
                "storage": {"value": storage_body, "representation": "storage"}
            }
        });
        if let Some(parent) = parent_id {
            payload["ancestors"] = serde_json::json!([{"id": parent}]);
        }
        let response = self
            .http
            .post(self.url("/rest/api/content"))
            .json(&payload)
            .basic_auth(&self.user, Some(&self.token))
            .send()
            .await
            .map_err(|e| self.transport_error("create_page", e))?;

        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            if body.contains("already exists") {
                return Err(SyncError::PageAlreadyExists {
                    title: title.to_string(),
                    parent_id: parent_id.cloned().unwrap_or_default(),
                });
            }
            return Err(SyncError::Network {
                endpoint: "create_page".to_string(),
                cause: format!("HTTP 400: {}", truncate(&body, 200)),
            });
        }
        let response = self.classify("create_page", None, None, response).await?;
        let content: ContentResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error("create_page", e))?;
        Ok(PageRef {
            version: content.version.map(|v| v.number).unwrap_or(1),
            id: content.id,
        })
    }

    async fn update_page(
        &self,
        id: &PageId,
        title: &str,
        body: &str,
        version: u64,
    ) -> Result<PageRef, SyncError> {
        self.ensure_auth().await?;
        let payload = update_body_json(id, title, body, version);
        let response = self
            .http
            .put(self.url(&format!("/rest/api/content/{}", id)))
            .json(&payload)
            .basic_auth(&self.user, Some(&self.token))
            .send()
            .await
            .map_err(|e| self.transport_error("update_page", e))?;
        let response = self
            .classify("update_page", Some(id), Some(version), response)
            .await?;
        let content: ContentResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error("update_page", e))?;
        Ok(PageRef {
            version: content.version.map(|v| v.number).unwrap_or(version),
            id: content.id,
        })
    }

    async fn update_parent(
        &self,
        id: &PageId,
        new_parent_id: &PageId,
        _version: u64,
    ) -> Result<PageRef, SyncError> {
        self.ensure_auth().await?;
        // The move endpoint has no optimistic-concurrency field.
        let response = self
            .http
            .put(self.url(&format!(
                "/rest/api/content/{}/move/append/{}",
                id, new_parent_id
            )))
            .basic_auth(&self.user, Some(&self.token))
            .send()
            .await
            .map_err(|e| self.transport_error("update_parent", e))?;
        self.classify("update_parent", Some(id), None, response)
            .await?;
        Ok(PageRef {
            id: id.clone(),
            version: 0,
        })
    }

    async fn delete_page(&self, id: &PageId) -> Result<(), SyncError> {
        self.ensure_auth().await?;
        let response = self
            .http
            .delete(self.url(&format!("/rest/api/content/{}", id)))
            .basic_auth(&self.user, Some(&self.token))
            .send()
            .await
            .map_err(|e| self.transport_error("delete_page", e))?;
        self.classify("delete_page", Some(id), None, response)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_json_maps_to_page() {
        let json = r#"{
            "id": "12345",
            "title": "Setup Guide",
            "version": {"number": 7, "when": "2024-05-01T10:00:00Z"},
            "body": {"storage": {"value": "<p>hello</p>"}},
            "ancestors": [
                {"id": "1", "title": "Home"},
                {"id": "99", "title": "Guides"}
            ],
            "space": {"key": "DOCS"},
            "metadata": {"labels": {"results": [{"name": "how-to"}]}}
        }"#;
        let content: ContentResponse = serde_json::from_str(json).unwrap();
        let page = content_to_page(content, PageFormat::Storage).unwrap();
        assert_eq!(page.id, "12345");
        assert_eq!(page.body, "<p>hello</p>");
        assert_eq!(page.version, 7);
        assert_eq!(page.parent_id.as_deref(), Some("99"));
        assert_eq!(page.labels, vec!["how-to".to_string()]);
    }

    #[test]
    fn missing_requested_body_is_an_error() {
        let json = r#"{"id": "1", "title": "T", "body": {"storage": {"value": "<p/>"}}}"#;
        let content: ContentResponse = serde_json::from_str(json).unwrap();
        let err = content_to_page(content, PageFormat::RichDocument).unwrap_err();
        assert!(matches!(err, SyncError::Conversion { .. }));
    }

    #[test]
    fn summary_keeps_ancestor_order() {
        let json = r#"{
            "id": "5",
            "title": "Leaf",
            "version": {"number": 2, "when": "2024-05-01T10:00:00Z"},
            "ancestors": [{"id": "1", "title": "Root"}, {"id": "2", "title": "Mid"}],
            "space": {"key": "DOCS"}
        }"#;
        let content: ContentResponse = serde_json::from_str(json).unwrap();
        let summary = content_to_summary(content);
        let ids: Vec<&str> = summary.ancestors.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn version_conflict_body_is_parsed() {
        assert_eq!(
            parse_current_version("Version must be incremented; current version is 12."),
            Some(12)
        );
        assert_eq!(parse_current_version("something else"), None);
    }

    #[test]
    fn retry_hint_comes_from_the_body() {
        assert_eq!(
            parse_retry_after(r#"{"retryAfter": 30}"#),
            Some(Duration::from_secs(30))
        );
        assert_eq!(parse_retry_after("not json"), None);
    }

    #[test]
    fn update_body_picks_representation() {
        let storage = update_body_json("1", "T", "<p>x</p>", 3);
        assert!(storage["body"]["storage"]["value"].is_string());
        let rich = update_body_json("1", "T", r#"{"type":"doc","content":[]}"#, 3);
        assert!(rich["body"]["atlas_doc_format"]["value"].is_string());
    }
}
