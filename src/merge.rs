use crate::types::MergeResult;

pub const CONFLICT_OURS: &str = "<<<<<<< OURS";
pub const CONFLICT_SEP: &str = "=======";
pub const CONFLICT_THEIRS: &str = ">>>>>>> THEIRS";

/// Reserved token for embedded newlines inside a normalized table cell.
/// A control character never survives in real markdown, so restoring it
/// cannot clobber user content.
const CELL_NEWLINE_TOKEN: char = '\u{0007}';

/// Three-way merge of markdown with the baseline as common ancestor.
/// Non-overlapping edits auto-resolve; overlapping edits produce standard
/// conflict markers. Pipe tables are merged at cell granularity.
pub fn merge(baseline: &str, local: &str, remote: &str) -> MergeResult {
    let crlf = local.contains("\r\n");

    let base_n = normalize(baseline);
    let ours_n = normalize(local);
    let theirs_n = normalize(remote);

    let base_lines: Vec<&str> = base_n.lines().collect();
    let ours_lines: Vec<&str> = ours_n.lines().collect();
    let theirs_lines: Vec<&str> = theirs_n.lines().collect();

    let (merged_lines, conflict_count) = diff3(&base_lines, &ours_lines, &theirs_lines);
    finish(merged_lines, conflict_count, crlf)
}

/// First-sync fallback when no baseline exists: every divergence between the
/// two sides becomes a conflict block.
pub fn merge_two_way(local: &str, remote: &str) -> MergeResult {
    let crlf = local.contains("\r\n");

    let ours_n = normalize(local);
    let theirs_n = normalize(remote);
    let ours_lines: Vec<&str> = ours_n.lines().collect();
    let theirs_lines: Vec<&str> = theirs_n.lines().collect();

    let mut out: Vec<&str> = Vec::new();
    let mut conflict_count = 0;
    let mut ours_run: Vec<&str> = Vec::new();
    let mut theirs_run: Vec<&str> = Vec::new();

    fn flush<'a>(
        out: &mut Vec<&'a str>,
        conflicts: &mut usize,
        ours_run: &mut Vec<&'a str>,
        theirs_run: &mut Vec<&'a str>,
    ) {
        if ours_run.is_empty() && theirs_run.is_empty() {
            return;
        }
        out.push(CONFLICT_OURS);
        out.append(ours_run);
        out.push(CONFLICT_SEP);
        out.append(theirs_run);
        out.push(CONFLICT_THEIRS);
        *conflicts += 1;
    }

    for d in diff::slice(&ours_lines, &theirs_lines) {
        match d {
            diff::Result::Both(line, _) => {
                flush(&mut out, &mut conflict_count, &mut ours_run, &mut theirs_run);
                out.push(line);
            }
            diff::Result::Left(line) => ours_run.push(line),
            diff::Result::Right(line) => theirs_run.push(line),
        }
    }
    flush(&mut out, &mut conflict_count, &mut ours_run, &mut theirs_run);

    finish(out, conflict_count, crlf)
}

fn finish(lines: Vec<&str>, conflict_count: usize, crlf: bool) -> MergeResult {
    let mut merged = denormalize_tables(&lines);
    if crlf {
        merged = merged.replace('\n', "\r\n");
    }
    MergeResult {
        merged,
        conflict_count,
    }
}

/// Line-ending and whitespace canonicalization plus table explosion into
/// one-cell-per-line sentinel form. Fenced code blocks are left alone.
fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n");
    let mut out = String::with_capacity(unified.len());
    let mut row = 0usize;
    let mut in_fence = false;
    for line in unified.lines() {
        let line = line.trim_end();
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence && is_table_line(line) {
            for (col, cell) in split_cells(line).into_iter().enumerate() {
                let escaped = cell.replace('\n', &CELL_NEWLINE_TOKEN.to_string());
                out.push_str(&format!(
                    "<CELL r={} c={}>{}</CELL r={} c={}>\n",
                    row, col, escaped, row, col
                ));
            }
            row += 1;
        } else {
            row = 0;
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

pub(crate) fn is_table_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('|') && trimmed.len() > 1
}

/// Splits a pipe-table row into trimmed cells, honoring `\|` escapes.
pub(crate) fn split_cells(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);

    let mut cells = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '|' {
            cells.push(current.trim().to_string());
            current = String::new();
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    cells.push(current.trim().to_string());
    cells
}

fn parse_cell_line(line: &str) -> Option<(usize, usize, &str)> {
    let rest = line.strip_prefix("<CELL r=")?;
    let (row, rest) = take_number(rest)?;
    let rest = rest.strip_prefix(" c=")?;
    let (col, rest) = take_number(rest)?;
    let rest = rest.strip_prefix('>')?;
    let close = format!("</CELL r={} c={}>", row, col);
    let content = rest.strip_suffix(close.as_str())?;
    Some((row, col, content))
}

fn take_number(s: &str) -> Option<(usize, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit())?;
    if end == 0 {
        return None;
    }
    let n = s[..end].parse().ok()?;
    Some((n, &s[end..]))
}

/// Reassembles cell-sentinel lines into pipe rows. Lines that are not cell
/// sentinels (including conflict markers cutting through a table) pass
/// through and close the current row.
fn denormalize_tables(lines: &[&str]) -> String {
    let mut out = String::new();
    let mut row_cells: Vec<String> = Vec::new();
    let mut current_row: Option<usize> = None;

    fn flush(out: &mut String, cells: &mut Vec<String>) {
        if !cells.is_empty() {
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
            cells.clear();
        }
    }

    for line in lines {
        match parse_cell_line(line) {
            Some((row, _col, content)) => {
                if current_row != Some(row) {
                    flush(&mut out, &mut row_cells);
                    current_row = Some(row);
                }
                row_cells.push(content.replace(CELL_NEWLINE_TOKEN, "\n"));
            }
            None => {
                flush(&mut out, &mut row_cells);
                current_row = None;
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    flush(&mut out, &mut row_cells);
    out
}

/// One contiguous difference between the baseline and one side.
#[derive(Debug, Clone, Copy)]
struct Hunk {
    base_start: usize,
    base_end: usize,
    side_start: usize,
    side_end: usize,
}

impl Hunk {
    /// Doubled coordinates so that a pure insertion occupies the half-point
    /// between two base lines: insertions at the same point collide, while
    /// edits to adjacent lines do not.
    fn interval(&self) -> (usize, usize) {
        if self.base_start == self.base_end {
            (2 * self.base_start, 2 * self.base_start + 1)
        } else {
            (2 * self.base_start + 1, 2 * self.base_end)
        }
    }
}

fn hunks(base: &[&str], side: &[&str]) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    let (mut bi, mut si) = (0usize, 0usize);
    let mut open: Option<(usize, usize)> = None;
    for d in diff::slice(base, side) {
        match d {
            diff::Result::Both(_, _) => {
                if let Some((bs, ss)) = open.take() {
                    hunks.push(Hunk {
                        base_start: bs,
                        base_end: bi,
                        side_start: ss,
                        side_end: si,
                    });
                }
                bi += 1;
                si += 1;
            }
            diff::Result::Left(_) => {
                open.get_or_insert((bi, si));
                bi += 1;
            }
            diff::Result::Right(_) => {
                open.get_or_insert((bi, si));
                si += 1;
            }
        }
    }
    if let Some((bs, ss)) = open {
        hunks.push(Hunk {
            base_start: bs,
            base_end: bi,
            side_start: ss,
            side_end: si,
        });
    }
    hunks
}

#[derive(Debug)]
struct Region {
    interval_end: usize,
    base_start: usize,
    base_end: usize,
    ours: Vec<Hunk>,
    theirs: Vec<Hunk>,
}

/// Groups hunks from both sides into maximal overlapping regions, ordered by
/// baseline position.
fn regions(ours: Vec<Hunk>, theirs: Vec<Hunk>) -> Vec<Region> {
    let mut tagged: Vec<(bool, Hunk)> = ours
        .into_iter()
        .map(|h| (true, h))
        .chain(theirs.into_iter().map(|h| (false, h)))
        .collect();
    tagged.sort_by_key(|(_, h)| h.interval());

    let mut regions: Vec<Region> = Vec::new();
    for (is_ours, hunk) in tagged {
        let (start, end) = hunk.interval();
        match regions.last_mut() {
            Some(region) if start < region.interval_end => {
                region.interval_end = region.interval_end.max(end);
                region.base_start = region.base_start.min(hunk.base_start);
                region.base_end = region.base_end.max(hunk.base_end);
                if is_ours {
                    region.ours.push(hunk);
                } else {
                    region.theirs.push(hunk);
                }
            }
            _ => {
                let mut region = Region {
                    interval_end: end,
                    base_start: hunk.base_start,
                    base_end: hunk.base_end,
                    ours: Vec::new(),
                    theirs: Vec::new(),
                };
                if is_ours {
                    region.ours.push(hunk);
                } else {
                    region.theirs.push(hunk);
                }
                regions.push(region);
            }
        }
    }
    regions
}

/// The side's content for baseline range `[rb1..rb2)`: hunk bodies spliced
/// over the matched lines in between.
fn extract<'a>(
    base: &[&'a str],
    side: &[&'a str],
    side_hunks: &[Hunk],
    rb1: usize,
    rb2: usize,
) -> Vec<&'a str> {
    let mut out = Vec::new();
    let mut pos = rb1;
    for h in side_hunks {
        out.extend_from_slice(&base[pos..h.base_start]);
        out.extend_from_slice(&side[h.side_start..h.side_end]);
        pos = h.base_end;
    }
    out.extend_from_slice(&base[pos..rb2]);
    out
}

fn diff3<'a>(base: &[&'a str], ours: &[&'a str], theirs: &[&'a str]) -> (Vec<&'a str>, usize) {
    let regions = regions(hunks(base, ours), hunks(base, theirs));

    let mut out: Vec<&'a str> = Vec::new();
    let mut conflicts = 0usize;
    let mut base_pos = 0usize;

    for region in &regions {
        out.extend_from_slice(&base[base_pos..region.base_start]);

        let base_slice = &base[region.base_start..region.base_end];
        let ours_slice = extract(base, ours, &region.ours, region.base_start, region.base_end);
        let theirs_slice = extract(
            base,
            theirs,
            &region.theirs,
            region.base_start,
            region.base_end,
        );

        if ours_slice.as_slice() == base_slice {
            out.extend_from_slice(&theirs_slice);
        } else if theirs_slice.as_slice() == base_slice || ours_slice == theirs_slice {
            out.extend_from_slice(&ours_slice);
        } else {
            out.push(CONFLICT_OURS);
            out.extend_from_slice(&ours_slice);
            out.push(CONFLICT_SEP);
            out.extend_from_slice(&theirs_slice);
            out.push(CONFLICT_THEIRS);
            conflicts += 1;
        }
        base_pos = region.base_end;
    }
    out.extend_from_slice(&base[base_pos..]);
    (out, conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_overlapping_edits_auto_resolve() {
        let base = "L1\nL2\nL3\n";
        let ours = "L1'\nL2\nL3\n";
        let theirs = "L1\nL2\nL3'\n";
        let result = merge(base, ours, theirs);
        assert!(!result.has_conflicts());
        assert_eq!(result.merged, "L1'\nL2\nL3'\n");
    }

    #[test]
    fn adjacent_line_edits_auto_resolve() {
        let base = "a\nb\n";
        let ours = "A\nb\n";
        let theirs = "a\nB\n";
        let result = merge(base, ours, theirs);
        assert!(!result.has_conflicts());
        assert_eq!(result.merged, "A\nB\n");
    }

    #[test]
    fn overlapping_edits_produce_standard_markers() {
        let result = merge("X\n", "Y\n", "Z\n");
        assert_eq!(result.conflict_count, 1);
        assert_eq!(
            result.merged,
            "<<<<<<< OURS\nY\n=======\nZ\n>>>>>>> THEIRS\n"
        );
    }

    #[test]
    fn same_point_insertions_conflict() {
        let base = "a\nz\n";
        let ours = "a\nmine\nz\n";
        let theirs = "a\ntheirs\nz\n";
        let result = merge(base, ours, theirs);
        assert_eq!(result.conflict_count, 1);
        assert!(result.merged.contains("mine"));
        assert!(result.merged.contains("theirs"));
    }

    #[test]
    fn merge_laws_hold() {
        let b = "alpha\nbeta\ngamma\n";
        let x = "alpha\nbeta changed\ngamma\n";
        let y = "alpha\nbeta\ngamma\nextra\n";
        assert_eq!(merge(b, b, b).merged, b);
        assert_eq!(merge(b, x, b).merged, x);
        assert_eq!(merge(b, b, y).merged, y);
        assert!(!merge(b, x, b).has_conflicts());
    }

    #[test]
    fn insertions_on_both_sides_in_different_places_merge() {
        let base = "one\ntwo\nthree\n";
        let ours = "zero\none\ntwo\nthree\n";
        let theirs = "one\ntwo\nthree\nfour\n";
        let result = merge(base, ours, theirs);
        assert!(!result.has_conflicts());
        assert_eq!(result.merged, "zero\none\ntwo\nthree\nfour\n");
    }

    #[test]
    fn identical_edits_on_both_sides_collapse() {
        let base = "a\nb\n";
        let same = "a\nb improved\n";
        let result = merge(base, same, same);
        assert!(!result.has_conflicts());
        assert_eq!(result.merged, same);
    }

    #[test]
    fn different_cells_of_the_same_row_auto_merge() {
        let base = "| name | value |\n| --- | --- |\n| port | 80 |\n";
        let ours = "| name | value |\n| --- | --- |\n| host-port | 80 |\n";
        let theirs = "| name | value |\n| --- | --- |\n| port | 8080 |\n";
        let result = merge(base, ours, theirs);
        assert!(!result.has_conflicts());
        assert_eq!(
            result.merged,
            "| name | value |\n| --- | --- |\n| host-port | 8080 |\n"
        );
    }

    #[test]
    fn same_cell_edited_on_both_sides_conflicts() {
        let base = "| k | v |\n| --- | --- |\n| a | 1 |\n";
        let ours = "| k | v |\n| --- | --- |\n| a | 2 |\n";
        let theirs = "| k | v |\n| --- | --- |\n| a | 3 |\n";
        let result = merge(base, ours, theirs);
        assert_eq!(result.conflict_count, 1);
        assert!(result.merged.contains(CONFLICT_OURS));
        assert!(result.merged.contains("| 2 |"));
        assert!(result.merged.contains("| 3 |"));
    }

    #[test]
    fn row_added_on_one_side_auto_merges() {
        let base = "| k | v |\n| --- | --- |\n| a | 1 |\n";
        let ours = "| k | v |\n| --- | --- |\n| a | 1 |\n| b | 2 |\n";
        let result = merge(base, ours, base);
        assert!(!result.has_conflicts());
        assert_eq!(result.merged, ours);
    }

    #[test]
    fn pipe_tables_inside_code_fences_are_untouched() {
        let base = "```\n| not | a table |\n```\n";
        let ours = "```\n| not | a table |\n```\nafter\n";
        let result = merge(base, ours, base);
        assert!(!result.has_conflicts());
        assert_eq!(result.merged, ours);
    }

    #[test]
    fn two_way_merge_marks_all_divergence() {
        let result = merge_two_way("shared\nmine\n", "shared\ntheirs\n");
        assert_eq!(result.conflict_count, 1);
        assert_eq!(
            result.merged,
            "shared\n<<<<<<< OURS\nmine\n=======\ntheirs\n>>>>>>> THEIRS\n"
        );
    }

    #[test]
    fn crlf_convention_of_ours_wins() {
        let base = "a\r\nb\r\n";
        let ours = "a\r\nb changed\r\n";
        let theirs = "a\nb\n";
        let result = merge(base, ours, theirs);
        assert_eq!(result.merged, "a\r\nb changed\r\n");

        let result = merge("a\nb\n", "a\nb changed\n", "a\r\nb\r\n");
        assert_eq!(result.merged, "a\nb changed\n");
    }

    #[test]
    fn escaped_pipes_stay_inside_cells() {
        let cells = split_cells("| a \\| b | c |");
        assert_eq!(cells, vec!["a \\| b".to_string(), "c".to_string()]);
    }

    #[test]
    fn trailing_whitespace_is_normalized() {
        let base = "line\n";
        let ours = "line   \n";
        let theirs = "line\nnew\n";
        let result = merge(base, ours, theirs);
        assert!(!result.has_conflicts());
        assert_eq!(result.merged, "line\nnew\n");
    }
}
