use crate::document::{parse_extension_placeholder, NodeKind, StructuredDoc};
use crate::merge::{is_table_line, split_cells};
use crate::types::{SurgicalOp, SyncError};

/// Fraction of baseline blocks that may fail to match before the differ
/// gives up and asks for a full-body replace.
pub const DEFAULT_FALLBACK_FRACTION: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: NodeKind,
    /// The block's markdown as written, without surrounding blank lines.
    pub raw: String,
    pub heading_level: Option<u8>,
    /// Rows of trimmed cells; only populated for tables.
    pub rows: Vec<Vec<String>>,
    /// The stable node id from an extension placeholder line.
    pub ext_id: Option<String>,
}

impl Block {
    fn plain(kind: NodeKind, raw: String) -> Self {
        Self {
            kind,
            raw,
            heading_level: None,
            rows: Vec::new(),
            ext_id: None,
        }
    }
}

/// Splits a markdown body into an ordered list of content blocks.
pub fn parse_blocks(markdown: &str) -> Vec<Block> {
    let lines: Vec<&str> = markdown.lines().collect();
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();
        if trimmed.is_empty() {
            i += 1;
            continue;
        }

        if let Some(id) = parse_extension_placeholder(line) {
            let mut block = Block::plain(NodeKind::Extension, line.to_string());
            block.ext_id = Some(id.to_string());
            blocks.push(block);
            i += 1;
            continue;
        }

        if trimmed.starts_with("```") {
            let mut j = i + 1;
            while j < lines.len() && !lines[j].trim().starts_with("```") {
                j += 1;
            }
            let end = (j + 1).min(lines.len());
            blocks.push(Block::plain(NodeKind::Code, lines[i..end].join("\n")));
            i = end;
            continue;
        }

        if let Some((level, text)) = parse_heading(trimmed) {
            let mut block = Block::plain(NodeKind::Heading, text.to_string());
            block.heading_level = Some(level);
            blocks.push(block);
            i += 1;
            continue;
        }

        if is_table_line(line) {
            let mut j = i;
            while j < lines.len() && is_table_line(lines[j]) {
                j += 1;
            }
            let raw = lines[i..j].join("\n");
            let rows = lines[i..j].iter().map(|l| split_cells(l)).collect();
            let mut block = Block::plain(NodeKind::Table, raw);
            block.rows = rows;
            blocks.push(block);
            i = j;
            continue;
        }

        if is_list_line(trimmed) {
            let mut j = i;
            while j < lines.len()
                && !lines[j].trim().is_empty()
                && (is_list_line(lines[j].trim()) || lines[j].starts_with(' '))
            {
                j += 1;
            }
            blocks.push(Block::plain(NodeKind::List, lines[i..j].join("\n")));
            i = j;
            continue;
        }

        // Paragraph: everything up to the next blank line or block opener.
        let mut j = i;
        while j < lines.len() {
            let t = lines[j].trim();
            if t.is_empty()
                || t.starts_with("```")
                || parse_heading(t).is_some()
                || is_table_line(lines[j])
                || is_list_line(t)
                || parse_extension_placeholder(lines[j]).is_some()
            {
                break;
            }
            j += 1;
        }
        blocks.push(Block::plain(NodeKind::Paragraph, lines[i..j].join("\n")));
        i = j;
    }

    blocks
}

fn parse_heading(trimmed: &str) -> Option<(u8, &str)> {
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    if (1..=6).contains(&hashes) {
        if let Some(rest) = trimmed[hashes..].strip_prefix(' ') {
            return Some((hashes as u8, rest.trim()));
        }
    }
    None
}

fn is_list_line(trimmed: &str) -> bool {
    if trimmed.starts_with("- ") || trimmed.starts_with("* ") || trimmed.starts_with("+ ") {
        return true;
    }
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0
        && (trimmed[digits..].starts_with(". ") || trimmed[digits..].starts_with(") "))
}

/// LCS identity for a block: kind, heading level, and a hash of the
/// whitespace-collapsed content.
#[derive(Debug, Clone, PartialEq)]
struct BlockKey {
    kind: NodeKind,
    level: Option<u8>,
    hash: blake3::Hash,
}

fn block_key(block: &Block) -> BlockKey {
    let normalized: String = block.raw.split_whitespace().collect::<Vec<_>>().join(" ");
    BlockKey {
        kind: block.kind,
        level: block.heading_level,
        hash: blake3::hash(normalized.as_bytes()),
    }
}

#[derive(Debug, Default)]
pub struct SurgicalPlan {
    pub ops: Vec<SurgicalOp>,
    /// Set when too few baseline blocks matched the remote document; the
    /// caller should fall back to a full-body replace.
    pub fallback_required: bool,
}

/// Computes the minimal ordered op list turning the remote's structured
/// document from the baseline markdown into the new markdown. Inputs are
/// bodies, front-matter already stripped.
pub fn diff(
    baseline_md: &str,
    new_md: &str,
    doc: &StructuredDoc,
) -> Result<SurgicalPlan, SyncError> {
    diff_with_threshold(baseline_md, new_md, doc, DEFAULT_FALLBACK_FRACTION)
}

pub fn diff_with_threshold(
    baseline_md: &str,
    new_md: &str,
    doc: &StructuredDoc,
    fallback_fraction: f64,
) -> Result<SurgicalPlan, SyncError> {
    let old_blocks = parse_blocks(baseline_md);
    let new_blocks = parse_blocks(new_md);

    let old_ids = associate(&old_blocks, doc);
    let unmatched = old_ids.iter().filter(|id| id.is_none()).count();
    if !old_blocks.is_empty() && (unmatched as f64) > fallback_fraction * old_blocks.len() as f64 {
        tracing::debug!(
            unmatched,
            total = old_blocks.len(),
            "block association too weak, requesting full-body replace"
        );
        return Ok(SurgicalPlan {
            ops: Vec::new(),
            fallback_required: true,
        });
    }

    let old_keys: Vec<BlockKey> = old_blocks.iter().map(block_key).collect();
    let new_keys: Vec<BlockKey> = new_blocks.iter().map(block_key).collect();

    let mut ops = Vec::new();
    let mut removed: Vec<usize> = Vec::new();
    let mut added: Vec<usize> = Vec::new();
    // The id of the last block known to survive in the remote document,
    // used to anchor insertions.
    let mut last_surviving_id: Option<String> = None;
    let mut pairing_failures = 0usize;

    let (mut oi, mut ni) = (0usize, 0usize);
    let mut flush = |removed: &mut Vec<usize>,
                     added: &mut Vec<usize>,
                     last_surviving_id: &mut Option<String>,
                     ops: &mut Vec<SurgicalOp>,
                     pairing_failures: &mut usize|
     -> Result<(), SyncError> {
        emit_divergence(
            &old_blocks,
            &new_blocks,
            &old_ids,
            removed,
            added,
            last_surviving_id,
            ops,
            pairing_failures,
        )?;
        removed.clear();
        added.clear();
        Ok(())
    };

    for d in diff::slice(&old_keys, &new_keys) {
        match d {
            diff::Result::Both(_, _) => {
                flush(
                    &mut removed,
                    &mut added,
                    &mut last_surviving_id,
                    &mut ops,
                    &mut pairing_failures,
                )?;
                if let Some(id) = &old_ids[oi] {
                    last_surviving_id = Some(id.clone());
                }
                oi += 1;
                ni += 1;
            }
            diff::Result::Left(_) => {
                removed.push(oi);
                oi += 1;
            }
            diff::Result::Right(_) => {
                added.push(ni);
                ni += 1;
            }
        }
    }
    flush(
        &mut removed,
        &mut added,
        &mut last_surviving_id,
        &mut ops,
        &mut pairing_failures,
    )?;

    let failed = unmatched + pairing_failures;
    if !old_blocks.is_empty() && (failed as f64) > fallback_fraction * old_blocks.len() as f64 {
        return Ok(SurgicalPlan {
            ops: Vec::new(),
            fallback_required: true,
        });
    }

    // The invariant the whole differ exists for: nothing may touch an
    // extension node.
    for op in &ops {
        if let Some(id) = op.target_local_id() {
            if doc.is_extension_scope(id) {
                return Err(SyncError::Conversion {
                    reason: format!(
                        "surgical edit would touch extension element {}; refusing",
                        id
                    ),
                });
            }
        }
    }

    Ok(SurgicalPlan {
        ops,
        fallback_required: false,
    })
}

/// Pairs removed and added blocks of one divergence into updates, then
/// emits plain deletes and inserts for the remainder.
#[allow(clippy::too_many_arguments)]
fn emit_divergence(
    old_blocks: &[Block],
    new_blocks: &[Block],
    old_ids: &[Option<String>],
    removed: &[usize],
    added: &[usize],
    last_surviving_id: &mut Option<String>,
    ops: &mut Vec<SurgicalOp>,
    pairing_failures: &mut usize,
) -> Result<(), SyncError> {
    let pairs = removed.len().min(added.len());

    for k in 0..pairs {
        let old = &old_blocks[removed[k]];
        let new = &new_blocks[added[k]];
        let target = match (&old_ids[removed[k]], old.kind) {
            // An extension placeholder cannot be rewritten into anything.
            (_, NodeKind::Extension) => {
                return Err(extension_delete_error(old));
            }
            (Some(id), _) => id.clone(),
            (None, _) => {
                *pairing_failures += 1;
                continue;
            }
        };

        if old.kind == new.kind {
            match old.kind {
                NodeKind::Heading => {
                    if old.heading_level != new.heading_level {
                        if let Some(level) = new.heading_level {
                            ops.push(SurgicalOp::ChangeHeadingLevel {
                                target_local_id: target.clone(),
                                new_level: level,
                            });
                        }
                    }
                    if old.raw != new.raw {
                        ops.push(SurgicalOp::UpdateText {
                            target_local_id: target.clone(),
                            new_text: new.raw.clone(),
                        });
                    }
                }
                NodeKind::Table => table_ops(&target, &old.rows, &new.rows, ops),
                _ => ops.push(SurgicalOp::UpdateText {
                    target_local_id: target.clone(),
                    new_text: new.raw.clone(),
                }),
            }
            *last_surviving_id = Some(target);
        } else {
            // Kind changed: replace the node wholesale.
            ops.push(SurgicalOp::DeleteBlock {
                target_local_id: target,
            });
            ops.push(SurgicalOp::InsertBlock {
                after_local_id: last_surviving_id.clone(),
                new_content: new.raw.clone(),
            });
        }
    }

    for &oi in &removed[pairs..] {
        let old = &old_blocks[oi];
        if old.kind == NodeKind::Extension {
            return Err(extension_delete_error(old));
        }
        match &old_ids[oi] {
            Some(id) => ops.push(SurgicalOp::DeleteBlock {
                target_local_id: id.clone(),
            }),
            None => *pairing_failures += 1,
        }
    }

    for &ni in &added[pairs..] {
        ops.push(SurgicalOp::InsertBlock {
            after_local_id: last_surviving_id.clone(),
            new_content: new_blocks[ni].raw.clone(),
        });
    }

    Ok(())
}

fn extension_delete_error(block: &Block) -> SyncError {
    SyncError::Conversion {
        reason: format!(
            "extension element {} was removed locally; extensions cannot be deleted by sync, restore the placeholder",
            block.ext_id.as_deref().unwrap_or("<unknown>")
        ),
    }
}

/// Row-level table diff. Deletes and cell updates address rows by their
/// index in the remote table; inserts by their index in the updated table.
fn table_ops(
    target: &str,
    old_rows: &[Vec<String>],
    new_rows: &[Vec<String>],
    ops: &mut Vec<SurgicalOp>,
) {
    let mut removed: Vec<usize> = Vec::new();
    let mut added: Vec<usize> = Vec::new();
    let (mut oi, mut ni) = (0usize, 0usize);

    let mut flush = |removed: &mut Vec<usize>, added: &mut Vec<usize>, ops: &mut Vec<SurgicalOp>| {
        let pairs = removed.len().min(added.len());
        for k in 0..pairs {
            let (o, n) = (removed[k], added[k]);
            let cols = old_rows[o].len().max(new_rows[n].len());
            for col in 0..cols {
                let old_cell = old_rows[o].get(col);
                let new_cell = new_rows[n].get(col);
                if old_cell != new_cell {
                    ops.push(SurgicalOp::TableUpdateCell {
                        target_local_id: target.to_string(),
                        row_index: o,
                        col_index: col,
                        new_content: new_cell.cloned().unwrap_or_default(),
                    });
                }
            }
        }
        for &o in &removed[pairs..] {
            ops.push(SurgicalOp::TableDeleteRow {
                target_local_id: target.to_string(),
                row_index: o,
            });
        }
        for &n in &added[pairs..] {
            ops.push(SurgicalOp::TableInsertRow {
                target_local_id: target.to_string(),
                row_index: n,
                cells: new_rows[n].clone(),
            });
        }
        removed.clear();
        added.clear();
    };

    for d in diff::slice(old_rows, new_rows) {
        match d {
            diff::Result::Both(_, _) => {
                flush(&mut removed, &mut added, ops);
                oi += 1;
                ni += 1;
            }
            diff::Result::Left(_) => {
                removed.push(oi);
                oi += 1;
            }
            diff::Result::Right(_) => {
                added.push(ni);
                ni += 1;
            }
        }
    }
    flush(&mut removed, &mut added, ops);
}

/// Positionally associates baseline blocks with the remote document's top
/// level nodes via an LCS over node kinds. Extension placeholders carry
/// their id and bind directly.
fn associate(old_blocks: &[Block], doc: &StructuredDoc) -> Vec<Option<String>> {
    let block_kinds: Vec<NodeKind> = old_blocks.iter().map(|b| b.kind).collect();
    let node_kinds: Vec<NodeKind> = doc.content.iter().map(|n| n.kind()).collect();

    let mut ids: Vec<Option<String>> = vec![None; old_blocks.len()];
    let (mut bi, mut ni) = (0usize, 0usize);
    for d in diff::slice(&block_kinds, &node_kinds) {
        match d {
            diff::Result::Both(_, _) => {
                ids[bi] = doc.content[ni].local_id().map(|s| s.to_string());
                bi += 1;
                ni += 1;
            }
            diff::Result::Left(_) => bi += 1,
            diff::Result::Right(_) => ni += 1,
        }
    }

    for (block, id) in old_blocks.iter().zip(ids.iter_mut()) {
        if block.kind == NodeKind::Extension {
            *id = block.ext_id.clone();
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(json: &str) -> StructuredDoc {
        StructuredDoc::parse(json).unwrap()
    }

    fn sample_doc() -> StructuredDoc {
        doc(r#"{
            "type": "doc",
            "content": [
                {"type": "heading", "attrs": {"localId": "h1", "level": 1},
                 "content": [{"type": "text", "text": "Title"}]},
                {"type": "paragraph", "attrs": {"localId": "p1"},
                 "content": [{"type": "text", "text": "First paragraph."}]},
                {"type": "extension", "attrs": {"localId": "x1"}},
                {"type": "table", "attrs": {"localId": "t1"}, "content": []},
                {"type": "paragraph", "attrs": {"localId": "p2"},
                 "content": [{"type": "text", "text": "Last paragraph."}]}
            ]
        }"#)
    }

    const BASELINE: &str = "# Title\n\nFirst paragraph.\n\n<!-- confluence:ext x1 -->\n\n| k | v |\n| --- | --- |\n| a | 1 |\n\nLast paragraph.\n";

    #[test]
    fn block_parser_classifies_mixed_document() {
        let blocks = parse_blocks(BASELINE);
        let kinds: Vec<NodeKind> = blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![
                NodeKind::Heading,
                NodeKind::Paragraph,
                NodeKind::Extension,
                NodeKind::Table,
                NodeKind::Paragraph
            ]
        );
        assert_eq!(blocks[0].heading_level, Some(1));
        assert_eq!(blocks[2].ext_id.as_deref(), Some("x1"));
        assert_eq!(blocks[3].rows.len(), 3);
    }

    #[test]
    fn block_parser_handles_lists_and_code() {
        let md = "- one\n- two\n\n```rust\nfn main() {}\n```\n\n1. first\n2. second\n";
        let blocks = parse_blocks(md);
        let kinds: Vec<NodeKind> = blocks.iter().map(|b| b.kind).collect();
        assert_eq!(kinds, vec![NodeKind::List, NodeKind::Code, NodeKind::List]);
        assert_eq!(blocks[1].raw, "```rust\nfn main() {}\n```");
    }

    #[test]
    fn unchanged_document_yields_no_ops() {
        let plan = diff(BASELINE, BASELINE, &sample_doc()).unwrap();
        assert!(plan.ops.is_empty());
        assert!(!plan.fallback_required);
    }

    #[test]
    fn paragraph_edit_updates_only_that_node() {
        let new = BASELINE.replace("First paragraph.", "First paragraph, reworded.");
        let plan = diff(BASELINE, &new, &sample_doc()).unwrap();
        assert_eq!(
            plan.ops,
            vec![SurgicalOp::UpdateText {
                target_local_id: "p1".to_string(),
                new_text: "First paragraph, reworded.".to_string(),
            }]
        );
    }

    #[test]
    fn heading_level_change_is_surgical() {
        let new = BASELINE.replace("# Title", "## Title");
        let plan = diff(BASELINE, &new, &sample_doc()).unwrap();
        assert_eq!(
            plan.ops,
            vec![SurgicalOp::ChangeHeadingLevel {
                target_local_id: "h1".to_string(),
                new_level: 2,
            }]
        );
    }

    #[test]
    fn removed_paragraph_becomes_delete() {
        let new = BASELINE.replace("\nLast paragraph.\n", "\n");
        let plan = diff(BASELINE, &new, &sample_doc()).unwrap();
        assert_eq!(
            plan.ops,
            vec![SurgicalOp::DeleteBlock {
                target_local_id: "p2".to_string(),
            }]
        );
    }

    #[test]
    fn added_paragraph_inserts_after_its_predecessor() {
        let new = BASELINE.replace(
            "Last paragraph.\n",
            "Last paragraph.\n\nBrand new closing thought.\n",
        );
        let plan = diff(BASELINE, &new, &sample_doc()).unwrap();
        assert_eq!(
            plan.ops,
            vec![SurgicalOp::InsertBlock {
                after_local_id: Some("p2".to_string()),
                new_content: "Brand new closing thought.".to_string(),
            }]
        );
    }

    #[test]
    fn table_cell_edit_targets_cell() {
        let new = BASELINE.replace("| a | 1 |", "| a | 2 |");
        let plan = diff(BASELINE, &new, &sample_doc()).unwrap();
        assert_eq!(
            plan.ops,
            vec![SurgicalOp::TableUpdateCell {
                target_local_id: "t1".to_string(),
                row_index: 2,
                col_index: 1,
                new_content: "2".to_string(),
            }]
        );
    }

    #[test]
    fn table_row_addition_targets_row() {
        let new = BASELINE.replace("| a | 1 |", "| a | 1 |\n| b | 2 |");
        let plan = diff(BASELINE, &new, &sample_doc()).unwrap();
        assert_eq!(
            plan.ops,
            vec![SurgicalOp::TableInsertRow {
                target_local_id: "t1".to_string(),
                row_index: 3,
                cells: vec!["b".to_string(), "2".to_string()],
            }]
        );
    }

    #[test]
    fn deleting_extension_placeholder_is_rejected() {
        let new = BASELINE.replace("<!-- confluence:ext x1 -->\n\n", "");
        let err = diff(BASELINE, &new, &sample_doc()).unwrap_err();
        match err {
            SyncError::Conversion { reason } => assert!(reason.contains("x1")),
            other => panic!("expected conversion error, got {:?}", other),
        }
    }

    #[test]
    fn no_op_ever_targets_an_extension_node() {
        let new = BASELINE
            .replace("First paragraph.", "Changed.")
            .replace("| a | 1 |", "| a | 9 |")
            .replace("Last paragraph.", "Also changed.");
        let plan = diff(BASELINE, &new, &sample_doc()).unwrap();
        assert!(!plan.ops.is_empty());
        let doc = sample_doc();
        for op in &plan.ops {
            if let Some(id) = op.target_local_id() {
                assert!(!doc.is_extension_scope(id), "op touches extension: {:?}", op);
            }
        }
    }

    #[test]
    fn weak_association_requests_fallback() {
        // The remote document shares no block kinds with the baseline.
        let foreign = doc(r#"{
            "type": "doc",
            "content": [
                {"type": "codeBlock", "attrs": {"localId": "c1"}},
                {"type": "codeBlock", "attrs": {"localId": "c2"}}
            ]
        }"#);
        let plan = diff(
            "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.\n",
            "First paragraph, changed.\n",
            &foreign,
        )
        .unwrap();
        assert!(plan.fallback_required);
        assert!(plan.ops.is_empty());
    }
}
