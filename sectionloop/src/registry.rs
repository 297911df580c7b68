//! Tool-registry disk I/O and the tool-digest artifact (spec §3, §4.5,
//! §9; SPEC_FULL §11.7). A malformed registry file is logged and
//! ignored — never repaired silently (spec §7) — so section entry never
//! fails just because the registry is corrupt.

use std::path::Path;

use crate::artifacts;
use crate::domain::{ToolRegistryEntry, ToolStatus};

/// Loads the registry, tolerating either on-disk shape (spec §9's open
/// question). Returns an empty vec (with a warning logged) if the file
/// is absent or doesn't parse.
pub fn load(planspace: &Path) -> Vec<ToolRegistryEntry> {
    let path = artifacts::tool_registry_path(planspace);
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    match crate::domain::tool_registry::parse_registry(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "malformed tool registry, ignoring");
            Vec::new()
        }
    }
}

/// Always writes the array form (spec §9).
pub fn save(planspace: &Path, entries: &[ToolRegistryEntry]) -> eyre::Result<()> {
    let path = artifacts::tool_registry_path(planspace);
    artifacts::ensure_parent(&path)?;
    let json = crate::domain::tool_registry::render_registry(entries)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Entries visible to `section`, rendered as a short markdown list for
/// prompt surfacing (setup stage's "Tools Available" context).
pub fn surface_for_section(entries: &[ToolRegistryEntry], section: &str) -> Option<String> {
    let visible: Vec<&ToolRegistryEntry> = entries.iter().filter(|e| e.visible_to(section)).collect();
    if visible.is_empty() {
        return None;
    }
    let mut out = String::new();
    for entry in visible {
        out.push_str(&format!("- `{}` ({:?}, {:?}): {}\n", entry.path, entry.scope, entry.status, entry.description));
    }
    Some(out)
}

/// Flattened one-line-per-tool digest grouped by scope (SPEC_FULL
/// §11.7); downstream prompts prefer this over re-parsing the raw
/// registry when present.
pub fn render_digest(entries: &[ToolRegistryEntry]) -> String {
    let mut out = String::from("# Tool digest\n\n");
    for scope in [crate::domain::ToolScope::CrossSection, crate::domain::ToolScope::SectionLocal, crate::domain::ToolScope::TestOnly] {
        let in_scope: Vec<&ToolRegistryEntry> = entries.iter().filter(|e| e.scope == scope).collect();
        if in_scope.is_empty() {
            continue;
        }
        out.push_str(&format!("## {scope:?}\n\n"));
        for entry in in_scope {
            let marker = if entry.status == ToolStatus::Stable { "stable" } else { "experimental" };
            out.push_str(&format!("- `{}` ({marker}, created by section {}): {}\n", entry.path, entry.created_by, entry.description));
        }
        out.push('\n');
    }
    out
}

pub fn write_digest(planspace: &Path, entries: &[ToolRegistryEntry]) -> eyre::Result<()> {
    let path = artifacts::tool_digest_path(planspace);
    artifacts::ensure_parent(&path)?;
    std::fs::write(path, render_digest(entries))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ToolScope;
    use tempfile::tempdir;

    fn entry(id: &str, scope: ToolScope, created_by: &str) -> ToolRegistryEntry {
        ToolRegistryEntry {
            id: id.into(),
            path: format!("tools/{id}.sh"),
            created_by: created_by.into(),
            scope,
            status: ToolStatus::Experimental,
            description: "d".into(),
            registered_at: "t".into(),
        }
    }

    #[test]
    fn missing_registry_loads_empty_without_error() {
        let dir = tempdir().unwrap();
        assert!(load(dir.path()).is_empty());
    }

    #[test]
    fn malformed_registry_loads_empty_with_warning() {
        let dir = tempdir().unwrap();
        let path = artifacts::tool_registry_path(dir.path());
        artifacts::ensure_parent(&path).unwrap();
        std::fs::write(&path, "not json").unwrap();
        assert!(load(dir.path()).is_empty());
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempdir().unwrap();
        let entries = vec![entry("t1", ToolScope::CrossSection, "01")];
        save(dir.path(), &entries).unwrap();
        let loaded = load(dir.path());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "t1");
    }

    #[test]
    fn surfacing_respects_visibility() {
        let entries = vec![entry("t1", ToolScope::SectionLocal, "01"), entry("t2", ToolScope::CrossSection, "02")];
        let surfaced = surface_for_section(&entries, "01").unwrap();
        assert!(surfaced.contains("t1"));
        assert!(surfaced.contains("t2"));

        let surfaced_03 = surface_for_section(&entries, "03");
        assert!(surfaced_03.unwrap().contains("t2"));
    }
}
