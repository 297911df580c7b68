//! TODO extraction as in-code microstrategy (SPEC_FULL §11.5, ground
//! truth: `section_engine.py::_extract_todos_from_files`). Scans a
//! section's related files for `TODO`/`FIXME`/`HACK`/`XXX` markers and
//! renders `artifacts/todos/section-NN-todos.md`, grouped by file with
//! ±3 lines of surrounding context per hit.

use std::path::Path;

const MARKERS: &[&str] = &["TODO", "FIXME", "HACK", "XXX"];
const CONTEXT_LINES: usize = 3;

pub struct TodoHit {
    pub line_number: usize,
    pub context: String,
}

/// Scans one file's contents for marker lines, case-insensitive. A
/// missing or unreadable file yields no hits rather than an error — a
/// related file reported by an earlier stage that has since been
/// deleted shouldn't block TODO extraction for the rest of the section.
pub fn scan_file(contents: &str) -> Vec<TodoHit> {
    let lines: Vec<&str> = contents.lines().collect();
    let mut hits = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let upper = line.to_uppercase();
        if MARKERS.iter().any(|m| upper.contains(m)) {
            let start = i.saturating_sub(CONTEXT_LINES);
            let end = (i + CONTEXT_LINES + 1).min(lines.len());
            let context = lines[start..end].join("\n");
            hits.push(TodoHit { line_number: i + 1, context });
        }
    }
    hits
}

/// Builds the full markdown body for `section-NN-todos.md`, one
/// grouped block per file that had at least one hit.
pub fn render_todos_markdown(section: &str, codespace: &Path, related_files: &[std::path::PathBuf]) -> String {
    let mut out = format!("# Extracted TODOs for section {section}\n\n");
    let mut any = false;
    for rel in related_files {
        let abs = codespace.join(rel);
        let Ok(contents) = std::fs::read_to_string(&abs) else { continue };
        let hits = scan_file(&contents);
        if hits.is_empty() {
            continue;
        }
        any = true;
        out.push_str(&format!("## {}\n\n", rel.display()));
        for hit in hits {
            out.push_str(&format!("### line {}\n```\n{}\n```\n\n", hit.line_number, hit.context));
        }
    }
    if !any {
        out.push_str("No TODO/FIXME/HACK/XXX markers found in related files.\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_all_marker_kinds_case_insensitively() {
        let src = "fn a() {}\n// todo: fix this\nfn b() {}\n// FIXME broken\nfn c() {}\n// Hack around it\nfn d() {}\n// xXx\n";
        let hits = scan_file(src);
        assert_eq!(hits.len(), 4);
    }

    #[test]
    fn context_window_is_three_lines_either_side() {
        let src = (0..10).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n") + "\n// TODO here\n" + &(0..10).map(|i| format!("after{i}")).collect::<Vec<_>>().join("\n");
        let hits = scan_file(&src);
        assert_eq!(hits.len(), 1);
        let ctx_lines = hits[0].context.lines().count();
        assert_eq!(ctx_lines, 7);
    }

    #[test]
    fn no_hits_yields_empty() {
        assert!(scan_file("fn clean() {}\n").is_empty());
    }
}
