use crate::types::{PageId, SyncError};
use std::path::Path;

const DELIMITER: &str = "---";

/// A markdown file split into its YAML header and body. Only `page_id` is
/// significant; other header keys are accepted and dropped on rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDoc {
    pub page_id: Option<PageId>,
    pub body: String,
}

#[derive(Debug, serde::Deserialize)]
struct Header {
    #[serde(default)]
    page_id: Option<serde_yaml::Value>,
}

pub fn parse(path: &Path, content: &str) -> Result<ParsedDoc, SyncError> {
    let (header, body) = match split(content) {
        Some(parts) => parts,
        None => {
            // No header at all: an unbound file, to be created on push.
            return Ok(ParsedDoc {
                page_id: None,
                body: content.to_string(),
            });
        }
    };

    let parsed: Header =
        serde_yaml::from_str(header).map_err(|e| SyncError::Frontmatter {
            path: path.to_path_buf(),
            line: e.location().map(|l| l.line() + 1).unwrap_or(1),
            detail: e.to_string(),
        })?;

    let page_id = match parsed.page_id {
        None | Some(serde_yaml::Value::Null) => None,
        Some(serde_yaml::Value::String(s)) if s.is_empty() || s == "null" => None,
        Some(serde_yaml::Value::String(s)) => Some(s),
        Some(serde_yaml::Value::Number(n)) => Some(n.to_string()),
        Some(other) => {
            return Err(SyncError::Frontmatter {
                path: path.to_path_buf(),
                line: 2,
                detail: format!("page_id must be a string or null, got {:?}", other),
            })
        }
    };

    Ok(ParsedDoc {
        page_id,
        body: body.to_string(),
    })
}

/// Splits `---\n<yaml>\n---\n<body>`. Returns None when the file does not
/// open with a front-matter delimiter.
fn split(content: &str) -> Option<(&str, &str)> {
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == DELIMITER {
            let header = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((header, body));
        }
        offset += line.len();
    }
    None
}

/// Writer-canonical form: only `page_id` is emitted.
pub fn render(page_id: Option<&str>, body: &str) -> String {
    let id_line = match page_id {
        Some(id) => format!("page_id: \"{}\"", id),
        None => "page_id: null".to_string(),
    };
    format!("{}\n{}\n{}\n{}", DELIMITER, id_line, DELIMITER, body)
}

/// Re-emits `content` bound to `page_id`, preserving the body byte-for-byte.
pub fn rebind(path: &Path, content: &str, page_id: &PageId) -> Result<String, SyncError> {
    let doc = parse(path, content)?;
    Ok(render(Some(page_id), &doc.body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn p() -> PathBuf {
        PathBuf::from("docs/test.md")
    }

    #[test]
    fn parses_bound_page() {
        let doc = parse(&p(), "---\npage_id: \"12345\"\n---\n# Title\n").unwrap();
        assert_eq!(doc.page_id.as_deref(), Some("12345"));
        assert_eq!(doc.body, "# Title\n");
    }

    #[test]
    fn unquoted_numeric_id_is_accepted() {
        let doc = parse(&p(), "---\npage_id: 98765\n---\nbody\n").unwrap();
        assert_eq!(doc.page_id.as_deref(), Some("98765"));
    }

    #[test]
    fn null_and_missing_ids_mean_unbound() {
        let doc = parse(&p(), "---\npage_id: null\n---\nbody\n").unwrap();
        assert_eq!(doc.page_id, None);
        let doc = parse(&p(), "---\ntitle: x\n---\nbody\n").unwrap();
        assert_eq!(doc.page_id, None);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let doc = parse(
            &p(),
            "---\npage_id: \"7\"\nlabels: [a, b]\nauthor: someone\n---\nbody\n",
        )
        .unwrap();
        assert_eq!(doc.page_id.as_deref(), Some("7"));
    }

    #[test]
    fn file_without_header_is_unbound() {
        let doc = parse(&p(), "# Just markdown\n").unwrap();
        assert_eq!(doc.page_id, None);
        assert_eq!(doc.body, "# Just markdown\n");
    }

    #[test]
    fn malformed_yaml_reports_frontmatter_error() {
        let err = parse(&p(), "---\npage_id: [unterminated\n---\nbody\n").unwrap_err();
        assert!(matches!(err, SyncError::Frontmatter { .. }));
    }

    #[test]
    fn render_then_parse_round_trips() {
        let rendered = render(Some("42"), "# Doc\n\ntext\n");
        let doc = parse(&p(), &rendered).unwrap();
        assert_eq!(doc.page_id.as_deref(), Some("42"));
        assert_eq!(doc.body, "# Doc\n\ntext\n");
    }

    #[test]
    fn rebind_preserves_body() {
        let original = "---\npage_id: null\nextra: kept-on-read\n---\n# Doc\n";
        let rebound = rebind(&p(), original, &"31415".to_string()).unwrap();
        assert_eq!(rebound, "---\npage_id: \"31415\"\n---\n# Doc\n");
    }
}
