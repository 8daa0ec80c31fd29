use crate::types::SyncError;
use serde_json::Value;

/// Reserved XML namespace prefixes that mark publisher extension elements in
/// the storage format.
pub const EXTENSION_NS_PREFIXES: &[&str] = &["ac:", "ri:"];

/// JSON node types that mark extension elements in the rich document format.
const EXTENSION_NODE_TYPES: &[&str] = &["extension", "bodiedExtension", "inlineExtension"];

const PLACEHOLDER_OPEN: &str = "<!-- confluence:ext ";
const PLACEHOLDER_CLOSE: &str = " -->";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Heading,
    Paragraph,
    Table,
    List,
    Code,
    Extension,
    Other,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct NodeAttrs {
    #[serde(rename = "localId", default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    /// Attributes this tool does not interpret are carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DocNode {
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "attrs_empty")]
    pub attrs: NodeAttrs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<DocNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn attrs_empty(attrs: &NodeAttrs) -> bool {
    attrs.local_id.is_none() && attrs.level.is_none() && attrs.extra.is_empty()
}

impl DocNode {
    pub fn kind(&self) -> NodeKind {
        match self.node_type.as_str() {
            "heading" => NodeKind::Heading,
            "paragraph" => NodeKind::Paragraph,
            "table" => NodeKind::Table,
            "bulletList" | "orderedList" => NodeKind::List,
            "codeBlock" => NodeKind::Code,
            t if EXTENSION_NODE_TYPES.contains(&t) => NodeKind::Extension,
            _ => NodeKind::Other,
        }
    }

    pub fn is_extension(&self) -> bool {
        self.kind() == NodeKind::Extension
    }

    pub fn local_id(&self) -> Option<&str> {
        self.attrs.local_id.as_deref()
    }

    /// Concatenated text content of this node and its descendants.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        if let Some(text) = &self.text {
            out.push_str(text);
        }
        for child in &self.content {
            child.collect_text(out);
        }
    }

    pub fn has_extension_descendant(&self) -> bool {
        self.is_extension() || self.content.iter().any(DocNode::has_extension_descendant)
    }
}

/// The remote's rich document: an ordered list of block nodes, each carrying
/// a stable `localId` the surgical differ targets.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StructuredDoc {
    #[serde(rename = "type")]
    pub doc_type: String,
    #[serde(default)]
    pub content: Vec<DocNode>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl StructuredDoc {
    pub fn parse(json: &str) -> Result<Self, SyncError> {
        serde_json::from_str(json).map_err(|e| SyncError::Conversion {
            reason: format!("remote document is not valid rich JSON: {}", e),
        })
    }

    pub fn node_by_local_id(&self, local_id: &str) -> Option<&DocNode> {
        fn walk<'a>(nodes: &'a [DocNode], local_id: &str) -> Option<&'a DocNode> {
            for node in nodes {
                if node.local_id() == Some(local_id) {
                    return Some(node);
                }
                if let Some(found) = walk(&node.content, local_id) {
                    return Some(found);
                }
            }
            None
        }
        walk(&self.content, local_id)
    }

    /// True when `local_id` names an extension node or any node inside one.
    pub fn is_extension_scope(&self, local_id: &str) -> bool {
        fn walk(nodes: &[DocNode], local_id: &str, inside_ext: bool) -> bool {
            for node in nodes {
                let here = inside_ext || node.is_extension();
                if node.local_id() == Some(local_id) {
                    return here;
                }
                if walk(&node.content, local_id, here) {
                    return true;
                }
            }
            false
        }
        walk(&self.content, local_id, false)
    }
}

impl StructuredDoc {
    /// Applies an ordered op list in place. Extension nodes are rejected a
    /// second time here; the differ should never have produced such an op.
    pub fn apply_ops(&mut self, ops: &[crate::types::SurgicalOp]) -> Result<(), SyncError> {
        use crate::types::SurgicalOp;

        for op in ops {
            if let Some(id) = op.target_local_id() {
                if self.is_extension_scope(id) {
                    return Err(SyncError::Conversion {
                        reason: format!("refusing to apply op to extension element {}", id),
                    });
                }
            }
            match op {
                SurgicalOp::UpdateText {
                    target_local_id,
                    new_text,
                } => {
                    let node = self.node_mut(target_local_id)?;
                    node.content = vec![text_node(new_text)];
                }
                SurgicalOp::ChangeHeadingLevel {
                    target_local_id,
                    new_level,
                } => {
                    let node = self.node_mut(target_local_id)?;
                    node.attrs.level = Some(*new_level);
                }
                SurgicalOp::DeleteBlock { target_local_id } => {
                    let before = self.content.len();
                    self.content
                        .retain(|n| n.local_id() != Some(target_local_id.as_str()));
                    if self.content.len() == before {
                        return Err(unknown_node(target_local_id));
                    }
                }
                SurgicalOp::InsertBlock {
                    after_local_id,
                    new_content,
                } => {
                    let node = paragraph_node(new_content);
                    match after_local_id {
                        Some(anchor) => {
                            let pos = self
                                .content
                                .iter()
                                .position(|n| n.local_id() == Some(anchor.as_str()))
                                .ok_or_else(|| unknown_node(anchor))?;
                            self.content.insert(pos + 1, node);
                        }
                        None => self.content.insert(0, node),
                    }
                }
                SurgicalOp::TableInsertRow {
                    target_local_id,
                    row_index,
                    cells,
                } => {
                    let table = self.node_mut(target_local_id)?;
                    let row = table_row(cells);
                    let idx = (*row_index).min(table.content.len());
                    table.content.insert(idx, row);
                }
                SurgicalOp::TableDeleteRow {
                    target_local_id,
                    row_index,
                } => {
                    let table = self.node_mut(target_local_id)?;
                    if *row_index >= table.content.len() {
                        return Err(SyncError::Conversion {
                            reason: format!(
                                "table {} has no row {}",
                                target_local_id, row_index
                            ),
                        });
                    }
                    table.content.remove(*row_index);
                }
                SurgicalOp::TableUpdateCell {
                    target_local_id,
                    row_index,
                    col_index,
                    new_content,
                } => {
                    let table = self.node_mut(target_local_id)?;
                    let row = table.content.get_mut(*row_index).ok_or_else(|| {
                        SyncError::Conversion {
                            reason: format!(
                                "table {} has no row {}",
                                target_local_id, row_index
                            ),
                        }
                    })?;
                    while row.content.len() <= *col_index {
                        row.content.push(table_cell(""));
                    }
                    row.content[*col_index] = table_cell(new_content);
                }
            }
        }
        Ok(())
    }

    fn node_mut(&mut self, local_id: &str) -> Result<&mut DocNode, SyncError> {
        fn walk<'a>(nodes: &'a mut [DocNode], local_id: &str) -> Option<&'a mut DocNode> {
            for node in nodes {
                if node.local_id() == Some(local_id) {
                    return Some(node);
                }
                if let Some(found) = walk(&mut node.content, local_id) {
                    return Some(found);
                }
            }
            None
        }
        walk(&mut self.content, local_id).ok_or_else(|| unknown_node(local_id))
    }
}

fn unknown_node(local_id: &str) -> SyncError {
    SyncError::Conversion {
        reason: format!("remote document has no node {}", local_id),
    }
}

fn text_node(text: &str) -> DocNode {
    DocNode {
        node_type: "text".to_string(),
        attrs: NodeAttrs::default(),
        content: Vec::new(),
        text: Some(text.to_string()),
        extra: serde_json::Map::new(),
    }
}

fn paragraph_node(text: &str) -> DocNode {
    DocNode {
        node_type: "paragraph".to_string(),
        attrs: NodeAttrs::default(),
        content: vec![text_node(text)],
        text: None,
        extra: serde_json::Map::new(),
    }
}

fn table_cell(text: &str) -> DocNode {
    DocNode {
        node_type: "tableCell".to_string(),
        attrs: NodeAttrs::default(),
        content: vec![paragraph_node(text)],
        text: None,
        extra: serde_json::Map::new(),
    }
}

fn table_row(cells: &[String]) -> DocNode {
    DocNode {
        node_type: "tableRow".to_string(),
        attrs: NodeAttrs::default(),
        content: cells.iter().map(|c| table_cell(c)).collect(),
        text: None,
        extra: serde_json::Map::new(),
    }
}

/// True when the storage body contains elements under a reserved namespace.
pub fn storage_has_extension_elements(storage: &str) -> bool {
    EXTENSION_NS_PREFIXES
        .iter()
        .any(|prefix| storage.contains(&format!("<{}", prefix)))
}

/// Markdown placeholder for an extension element. HTML comments pass through
/// the converter verbatim, which keeps the round trip byte-stable.
pub fn extension_placeholder(local_id: &str) -> String {
    format!("{}{}{}", PLACEHOLDER_OPEN, local_id, PLACEHOLDER_CLOSE)
}

pub fn parse_extension_placeholder(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix(PLACEHOLDER_OPEN)
        .and_then(|rest| rest.strip_suffix(PLACEHOLDER_CLOSE))
        .filter(|id| !id.is_empty() && !id.contains(char::is_whitespace))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "type": "doc",
        "content": [
            {"type": "heading", "attrs": {"localId": "h1", "level": 2},
             "content": [{"type": "text", "text": "Overview"}]},
            {"type": "paragraph", "attrs": {"localId": "p1"},
             "content": [{"type": "text", "text": "Some prose."}]},
            {"type": "bodiedExtension", "attrs": {"localId": "x1", "extensionKey": "toc"},
             "content": [{"type": "paragraph", "attrs": {"localId": "p-in-ext"},
                          "content": [{"type": "text", "text": "inside"}]}]},
            {"type": "table", "attrs": {"localId": "t1"}, "content": []}
        ]
    }"#;

    #[test]
    fn parses_and_classifies_nodes() {
        let doc = StructuredDoc::parse(SAMPLE).unwrap();
        let kinds: Vec<NodeKind> = doc.content.iter().map(DocNode::kind).collect();
        assert_eq!(
            kinds,
            vec![
                NodeKind::Heading,
                NodeKind::Paragraph,
                NodeKind::Extension,
                NodeKind::Table
            ]
        );
        assert_eq!(doc.content[0].attrs.level, Some(2));
        assert_eq!(doc.content[0].plain_text(), "Overview");
    }

    #[test]
    fn finds_nodes_by_local_id() {
        let doc = StructuredDoc::parse(SAMPLE).unwrap();
        assert_eq!(
            doc.node_by_local_id("p1").unwrap().plain_text(),
            "Some prose."
        );
        assert!(doc.node_by_local_id("missing").is_none());
    }

    #[test]
    fn extension_scope_covers_descendants() {
        let doc = StructuredDoc::parse(SAMPLE).unwrap();
        assert!(doc.is_extension_scope("x1"));
        assert!(doc.is_extension_scope("p-in-ext"));
        assert!(!doc.is_extension_scope("p1"));
        assert!(doc.content[2].has_extension_descendant());
        assert!(!doc.content[1].has_extension_descendant());
    }

    #[test]
    fn unknown_attrs_round_trip() {
        let doc = StructuredDoc::parse(SAMPLE).unwrap();
        let json = serde_json::to_string(&doc).unwrap();
        let again = StructuredDoc::parse(&json).unwrap();
        assert_eq!(
            again.content[2].attrs.extra.get("extensionKey"),
            Some(&serde_json::json!("toc"))
        );
    }

    #[test]
    fn storage_namespace_scan() {
        assert!(storage_has_extension_elements(
            "<p>x</p><ac:structured-macro ac:name=\"toc\"/>"
        ));
        assert!(storage_has_extension_elements("<ri:page ri:content-title=\"T\"/>"));
        assert!(!storage_has_extension_elements("<p>plain</p>"));
    }

    #[test]
    fn apply_ops_mutates_targeted_nodes_only() {
        use crate::types::SurgicalOp;

        let mut doc = StructuredDoc::parse(SAMPLE).unwrap();
        doc.apply_ops(&[
            SurgicalOp::UpdateText {
                target_local_id: "p1".to_string(),
                new_text: "Rewritten prose.".to_string(),
            },
            SurgicalOp::ChangeHeadingLevel {
                target_local_id: "h1".to_string(),
                new_level: 3,
            },
            SurgicalOp::InsertBlock {
                after_local_id: Some("t1".to_string()),
                new_content: "Appendix.".to_string(),
            },
        ])
        .unwrap();

        assert_eq!(doc.node_by_local_id("p1").unwrap().plain_text(), "Rewritten prose.");
        assert_eq!(doc.node_by_local_id("h1").unwrap().attrs.level, Some(3));
        assert_eq!(doc.content.len(), 5);
        assert_eq!(doc.content[4].plain_text(), "Appendix.");
        // The extension node is byte-identical to the parsed original.
        let original = StructuredDoc::parse(SAMPLE).unwrap();
        assert_eq!(
            serde_json::to_string(&doc.content[2]).unwrap(),
            serde_json::to_string(&original.content[2]).unwrap()
        );
    }

    #[test]
    fn apply_ops_refuses_extension_targets() {
        use crate::types::SurgicalOp;

        let mut doc = StructuredDoc::parse(SAMPLE).unwrap();
        let err = doc
            .apply_ops(&[SurgicalOp::DeleteBlock {
                target_local_id: "x1".to_string(),
            }])
            .unwrap_err();
        assert!(matches!(err, SyncError::Conversion { .. }));
    }

    #[test]
    fn table_ops_apply_in_order() {
        use crate::types::SurgicalOp;

        let mut doc = StructuredDoc::parse(
            r#"{"type": "doc", "content": [
                {"type": "table", "attrs": {"localId": "t1"}, "content": [
                    {"type": "tableRow", "content": [
                        {"type": "tableCell", "content": [
                            {"type": "paragraph", "content": [{"type": "text", "text": "a"}]}]},
                        {"type": "tableCell", "content": [
                            {"type": "paragraph", "content": [{"type": "text", "text": "1"}]}]}
                    ]}
                ]}
            ]}"#,
        )
        .unwrap();

        doc.apply_ops(&[
            SurgicalOp::TableUpdateCell {
                target_local_id: "t1".to_string(),
                row_index: 0,
                col_index: 1,
                new_content: "2".to_string(),
            },
            SurgicalOp::TableInsertRow {
                target_local_id: "t1".to_string(),
                row_index: 1,
                cells: vec!["b".to_string(), "3".to_string()],
            },
        ])
        .unwrap();

        let table = doc.node_by_local_id("t1").unwrap();
        assert_eq!(table.content.len(), 2);
        assert_eq!(table.content[0].plain_text(), "a2");
        assert_eq!(table.content[1].plain_text(), "b3");

        let mut doc2 = doc.clone();
        let err = doc2
            .apply_ops(&[SurgicalOp::TableDeleteRow {
                target_local_id: "t1".to_string(),
                row_index: 9,
            }])
            .unwrap_err();
        assert!(matches!(err, SyncError::Conversion { .. }));
    }

    #[test]
    fn placeholder_round_trips() {
        let line = extension_placeholder("abc-123");
        assert_eq!(parse_extension_placeholder(&line), Some("abc-123"));
        assert_eq!(parse_extension_placeholder("<!-- confluence:ext -->"), None);
        assert_eq!(parse_extension_placeholder("regular text"), None);
    }
}
