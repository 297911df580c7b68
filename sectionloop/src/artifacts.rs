//! Planspace artifact layout (spec §3): the well-known paths every
//! component reads or writes under `planspace/artifacts/`, centralized
//! here so a path convention only needs to change in one place.

use std::path::{Path, PathBuf};

pub fn artifacts_root(planspace: &Path) -> PathBuf {
    planspace.join("artifacts")
}

pub fn sections_dir(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("sections")
}

pub fn section_spec_path(planspace: &Path, section: &str) -> PathBuf {
    sections_dir(planspace).join(format!("section-{section}.md"))
}

pub fn proposal_excerpt_path(planspace: &Path, section: &str) -> PathBuf {
    sections_dir(planspace).join(format!("section-{section}-proposal-excerpt.md"))
}

pub fn alignment_excerpt_path(planspace: &Path, section: &str) -> PathBuf {
    sections_dir(planspace).join(format!("section-{section}-alignment-excerpt.md"))
}

pub fn problem_frame_path(planspace: &Path, section: &str) -> PathBuf {
    sections_dir(planspace).join(format!("section-{section}-problem-frame.md"))
}

pub fn mode_path(planspace: &Path, section: &str) -> PathBuf {
    sections_dir(planspace).join(format!("section-{section}-mode.txt"))
}

pub fn tools_available_path(planspace: &Path, section: &str) -> PathBuf {
    sections_dir(planspace).join(format!("section-{section}-tools-available.md"))
}

pub fn alignment_surface_path(planspace: &Path, section: &str) -> PathBuf {
    sections_dir(planspace).join(format!("section-{section}-alignment-surface.md"))
}

pub fn proposals_dir(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("proposals")
}

pub fn integration_proposal_path(planspace: &Path, section: &str) -> PathBuf {
    proposals_dir(planspace).join(format!("section-{section}-integration-proposal.md"))
}

pub fn microstrategy_path(planspace: &Path, section: &str) -> PathBuf {
    proposals_dir(planspace).join(format!("section-{section}-microstrategy.md"))
}

pub fn proposal_problems_path(planspace: &Path, section: &str, attempt: u32) -> PathBuf {
    artifacts_root(planspace).join(format!("intg-proposal-{section}-problems-{attempt}.md"))
}

pub fn impl_problems_path(planspace: &Path, section: &str, attempt: u32) -> PathBuf {
    artifacts_root(planspace).join(format!("impl-{section}-problems-{attempt}.md"))
}

pub fn todos_dir(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("todos")
}

pub fn todos_path(planspace: &Path, section: &str) -> PathBuf {
    todos_dir(planspace).join(format!("section-{section}-todos.md"))
}

pub fn notes_dir(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("notes")
}

pub fn note_path(planspace: &Path, source: &str, target: &str) -> PathBuf {
    notes_dir(planspace).join(format!("from-{source}-to-{target}.md"))
}

pub fn snapshots_dir(planspace: &Path, section: &str) -> PathBuf {
    artifacts_root(planspace).join("snapshots").join(format!("section-{section}"))
}

pub fn contracts_dir(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("contracts")
}

pub fn contract_summary_path(planspace: &Path, section: &str) -> PathBuf {
    contracts_dir(planspace).join(format!("section-{section}-contract-summary.md"))
}

pub fn signals_dir(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("signals")
}

pub fn decisions_dir(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("decisions")
}

pub fn decision_path(planspace: &Path, section: &str) -> PathBuf {
    decisions_dir(planspace).join(format!("section-{section}.md"))
}

pub fn scope_deltas_dir(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("scope-deltas")
}

pub fn scope_delta_path(planspace: &Path, section: &str) -> PathBuf {
    scope_deltas_dir(planspace).join(format!("section-{section}-scope-delta.json"))
}

pub fn coordination_dir(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("coordination")
}

pub fn coordination_problems_path(planspace: &Path) -> PathBuf {
    coordination_dir(planspace).join("problems.json")
}

pub fn coordination_groups_path(planspace: &Path) -> PathBuf {
    coordination_dir(planspace).join("groups.json")
}

pub fn coordination_plan_path(planspace: &Path) -> PathBuf {
    coordination_dir(planspace).join("coordination-plan.json")
}

pub fn inputs_hashes_dir(planspace: &Path) -> PathBuf {
    coordination_dir(planspace).join("inputs-hashes")
}

pub fn inputs_hash_path(planspace: &Path, section: &str) -> PathBuf {
    inputs_hashes_dir(planspace).join(format!("section-{section}.sha256"))
}

pub fn model_escalation_path(planspace: &Path) -> PathBuf {
    coordination_dir(planspace).join("model-escalation.txt")
}

pub fn codemap_path(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("codemap.md")
}

pub fn project_mode_path(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("project-mode.txt")
}

pub fn tool_registry_path(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("tool-registry.json")
}

pub fn tool_digest_path(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("tool-digest.md")
}

pub fn traceability_path(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("traceability.json")
}

pub fn pending_flag_path(planspace: &Path) -> PathBuf {
    artifacts_root(planspace).join("alignment-changed-pending")
}

pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
