//! Cross-section engine (spec §4.6): snapshotting, contract summaries,
//! semantic impact analysis, and consequence notes. Invoked immediately
//! after a section aligns in Phase 1, and again (for the affected
//! sections only) after each coordinator fix batch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::artifacts;
use crate::dispatch::{AgentKind, DispatchOutcome, DispatchRequest, Dispatcher};
use crate::domain::ConsequenceNote;
use crate::error::PathSafetyError;
use crate::paths;

/// What the impact-analysis dispatch knows about a section other than
/// the one that just completed.
#[derive(Debug, Clone)]
pub struct PeerSection {
    pub number: String,
    pub summary: String,
    pub related_files: Vec<PathBuf>,
}

/// Snapshots every modified file to `artifacts/snapshots/section-NN/<relpath>`,
/// preserving directory structure. Any source or destination path that
/// escapes its declared root is skipped with a warning, never panics
/// (spec §4.6 step 1, §7, §9).
pub fn snapshot_modified_files(codespace: &Path, planspace: &Path, section: &str, modified_files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let snapshot_root = artifacts::snapshots_dir(planspace, section);
    std::fs::create_dir_all(&snapshot_root)?;
    let mut snapshotted = Vec::new();
    for rel in modified_files {
        let source = match paths::resolve_within(codespace, rel) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, file = %rel.display(), "skipping snapshot: source escapes codespace root");
                continue;
            }
        };
        let dest = match paths::resolve_within(&snapshot_root, rel) {
            Ok(p) => p,
            Err(PathSafetyError::Escapes { .. }) => {
                tracing::warn!(file = %rel.display(), "skipping snapshot: destination escapes snapshot root");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if !source.exists() {
            tracing::warn!(file = %rel.display(), "skipping snapshot: source file does not exist");
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, &dest).with_context(|| format!("snapshotting {}", rel.display()))?;
        snapshotted.push(rel.clone());
    }
    Ok(snapshotted)
}

/// Writes `artifacts/contracts/section-NN-contract-summary.md`
/// (SPEC_FULL §11.6): the section summary, any headings in the
/// integration proposal whose text matches the contract/interface
/// vocabulary, and the modified-file list.
pub fn write_contract_summary(planspace: &Path, section: &str, section_summary: &str, integration_proposal: &str, modified_files: &[PathBuf]) -> Result<()> {
    const CONTRACT_HEADING_WORDS: &[&str] = &["contract", "interface", "api", "integration point", "change strategy", "risks"];
    let mut contract_headings = Vec::new();
    let mut current: Option<(String, Vec<String>)> = None;
    for line in integration_proposal.lines() {
        if let Some(heading) = line.strip_prefix("## ").or_else(|| line.strip_prefix("# ")) {
            if let Some((h, body)) = current.take() {
                contract_headings.push((h, body));
            }
            let lower = heading.to_lowercase();
            if CONTRACT_HEADING_WORDS.iter().any(|w| lower.contains(w)) {
                current = Some((heading.to_string(), Vec::new()));
            }
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line.to_string());
        }
    }
    if let Some((h, body)) = current.take() {
        contract_headings.push((h, body));
    }

    let mut out = format!("# Contract summary: section {section}\n\n## Section summary\n\n{section_summary}\n\n");
    if !contract_headings.is_empty() {
        out.push_str("## Contract-relevant sections of the integration proposal\n\n");
        for (heading, body) in contract_headings {
            out.push_str(&format!("### {heading}\n{}\n\n", body.join("\n")));
        }
    }
    out.push_str("## Modified files\n\n");
    for f in modified_files {
        out.push_str(&format!("- `{}`\n", f.display()));
    }

    let path = artifacts::contract_summary_path(planspace, section);
    artifacts::ensure_parent(&path)?;
    std::fs::write(path, out).context("writing contract summary")
}

#[derive(Debug, Deserialize)]
struct ImpactAnalysisReply {
    impacts: Vec<ImpactEntry>,
}

#[derive(Debug, Deserialize)]
struct ImpactEntry {
    to: String,
    impact: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    note_markdown: String,
}

/// Normalizes an LLM-reported section number (e.g. `"4"`) to the
/// canonical zero-padded form, using a map built from the loaded
/// section roster (SPEC_FULL §11.8).
pub fn build_section_number_map(all_sections: &[String]) -> BTreeMap<u64, String> {
    all_sections
        .iter()
        .filter_map(|s| s.parse::<u64>().ok().map(|n| (n, s.clone())))
        .collect()
}

fn normalize_target(raw: &str, map: &BTreeMap<u64, String>) -> Option<String> {
    if map.values().any(|v| v == raw) {
        return Some(raw.to_string());
    }
    raw.parse::<u64>().ok().and_then(|n| map.get(&n).cloned())
}

/// Dispatches the impact-analysis LLM and returns `(target, impact_text,
/// note_markdown)` triples for every `MATERIAL` impact (spec §4.6 step
/// 3). Falls back to the line-oriented regex form only if JSON parsing
/// fails (spec §4.6, §11.8).
pub async fn analyze_impact(
    dispatcher: &Dispatcher<'_>,
    section: &str,
    prompt_file: &Path,
    output_file: &Path,
    model: &str,
    all_sections: &[String],
) -> Result<Vec<(String, String, String)>> {
    let req = DispatchRequest {
        kind: AgentKind::ImpactAnalyzer,
        model: model.to_string(),
        prompt_file: prompt_file.to_path_buf(),
        role_file: None,
        project: None,
        agent_name: None,
        output_file: output_file.to_path_buf(),
    };
    let output = match dispatcher.dispatch(section, req).await? {
        DispatchOutcome::Completed { output } => output,
        DispatchOutcome::AlignmentChangedPending => return Ok(Vec::new()),
    };

    let map = build_section_number_map(all_sections);
    if let Some(json_start) = output.find('{') {
        if let Ok(reply) = serde_json::from_str::<ImpactAnalysisReply>(&output[json_start..]) {
            return Ok(reply
                .impacts
                .into_iter()
                .filter(|i| i.impact.eq_ignore_ascii_case("MATERIAL"))
                .filter_map(|i| normalize_target(&i.to, &map).map(|target| (target, i.reason, i.note_markdown)))
                .collect());
        }
    }

    Ok(parse_regex_fallback(&output, &map))
}

fn parse_regex_fallback(output: &str, map: &BTreeMap<u64, String>) -> Vec<(String, String, String)> {
    let re = regex::Regex::new(r"(?m)^SECTION-(\w+):\s*MATERIAL\s+(.*)$").expect("valid regex literal");
    re.captures_iter(output)
        .filter_map(|c| {
            let target = normalize_target(&c[1], map)?;
            let reason = c[2].to_string();
            Some((target.clone(), reason.clone(), format!("Impact on section {target}: {reason}")))
        })
        .collect()
}

/// Writes the consequence note for one `MATERIAL` impact and returns it
/// (spec §4.6 step 4, §3).
pub fn write_consequence_note(planspace: &Path, source: &str, target: &str, contract_delta: &str, accommodate: &str) -> Result<ConsequenceNote> {
    let note = ConsequenceNote::new(source, target, contract_delta, accommodate);
    let path = artifacts::note_path(planspace, source, target);
    artifacts::ensure_parent(&path)?;
    std::fs::write(path, note.render_markdown()).context("writing consequence note")?;
    Ok(note)
}

pub struct IncomingNote {
    pub from_section: String,
    pub note_id: String,
    pub contract_delta: String,
    pub accommodate: String,
    pub diffs: Vec<(PathBuf, String)>,
}

/// Reads every `from-*-to-NN.md` targeting `section`, and for each
/// source whose snapshot shares a file with `section`'s related files,
/// computes a unified diff between the snapshot and the current on-disk
/// file (spec §4.6, "Incoming-note reader").
pub fn read_incoming_notes(codespace: &Path, planspace: &Path, section: &str, related_files: &[PathBuf]) -> Result<Vec<IncomingNote>> {
    let notes_dir = artifacts::notes_dir(planspace);
    if !notes_dir.exists() {
        return Ok(Vec::new());
    }
    let suffix = format!("-to-{section}.md");
    let mut incoming = Vec::new();
    for entry in std::fs::read_dir(&notes_dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else { continue };
        if !name.starts_with("from-") || !name.ends_with(&suffix) {
            continue;
        }
        let source = name.trim_start_matches("from-").trim_end_matches(&suffix).to_string();
        let markdown = std::fs::read_to_string(entry.path())?;
        let note_id = ConsequenceNote::parse_note_id(&markdown).unwrap_or_default();
        let contract_delta = extract_section(&markdown, "## Contract delta");
        let accommodate = extract_section(&markdown, &format!("## What section {section} must accommodate"));

        let snapshot_dir = artifacts::snapshots_dir(planspace, &source);
        let mut diffs = Vec::new();
        if snapshot_dir.is_dir() {
            for rel in related_files {
                let snapshot_path = snapshot_dir.join(rel);
                if !snapshot_path.exists() {
                    continue;
                }
                let current_path = codespace.join(rel);
                let Ok(current) = std::fs::read_to_string(&current_path) else { continue };
                let Ok(before) = std::fs::read_to_string(&snapshot_path) else { continue };
                if before != current {
                    let patch = diffy::create_patch(&before, &current);
                    diffs.push((rel.clone(), patch.to_string()));
                }
            }
        }

        incoming.push(IncomingNote { from_section: source, note_id, contract_delta, accommodate, diffs });
    }
    incoming.sort_by(|a, b| a.from_section.cmp(&b.from_section));
    Ok(incoming)
}

fn extract_section(markdown: &str, heading: &str) -> String {
    let mut capturing = false;
    let mut out = Vec::new();
    for line in markdown.lines() {
        if line.starts_with("## ") {
            if capturing {
                break;
            }
            capturing = line == heading;
            continue;
        }
        if capturing {
            out.push(line);
        }
    }
    out.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn snapshot_skips_paths_escaping_codespace() {
        let dir = tempdir().unwrap();
        let codespace = dir.path().join("code");
        let planspace = dir.path().join("plan");
        std::fs::create_dir_all(&codespace).unwrap();
        let snapshotted = snapshot_modified_files(&codespace, &planspace, "01", &[PathBuf::from("../outside.txt")]).unwrap();
        assert!(snapshotted.is_empty());
    }

    #[test]
    fn snapshot_copies_existing_files_preserving_structure() {
        let dir = tempdir().unwrap();
        let codespace = dir.path().join("code");
        let planspace = dir.path().join("plan");
        std::fs::create_dir_all(codespace.join("src")).unwrap();
        std::fs::write(codespace.join("src/core.go"), "package main\n").unwrap();

        let snapshotted = snapshot_modified_files(&codespace, &planspace, "01", &[PathBuf::from("src/core.go")]).unwrap();
        assert_eq!(snapshotted.len(), 1);
        let snapshot_path = artifacts::snapshots_dir(&planspace, "01").join("src/core.go");
        assert_eq!(std::fs::read_to_string(snapshot_path).unwrap(), "package main\n");
    }

    #[test]
    fn section_number_normalization_accepts_bare_int() {
        let map = build_section_number_map(&["01".to_string(), "02".to_string(), "10".to_string()]);
        assert_eq!(normalize_target("2", &map), Some("02".to_string()));
        assert_eq!(normalize_target("04", &map), None);
        assert_eq!(normalize_target("10", &map), Some("10".to_string()));
    }

    #[test]
    fn regex_fallback_extracts_material_impacts() {
        let map = build_section_number_map(&["02".to_string()]);
        let output = "Some prose.\nSECTION-2: MATERIAL changed event model\nSECTION-9: NO_IMPACT n/a\n";
        let impacts = parse_regex_fallback(output, &map);
        assert_eq!(impacts.len(), 1);
        assert_eq!(impacts[0].0, "02");
    }

    #[test]
    fn extracts_contract_delta_section_from_rendered_note() {
        let note = ConsequenceNote::new("01", "02", "changed event model", "consumer must handle new shape");
        let markdown = note.render_markdown();
        assert_eq!(extract_section(&markdown, "## Contract delta"), "changed event model");
    }
}
