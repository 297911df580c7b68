//! Decision ledger (spec §3, §4.2, §8): an append-only log of
//! parent-provided resolutions at `artifacts/decisions/section-NN.md`.
//! A resume payload is persisted here before the dispatching step
//! retries, so later attempts (and a human reviewing the run) can see
//! exactly what the parent decided and when.

use std::path::Path;

use eyre::{Context, Result};

use crate::artifacts;

pub fn append(planspace: &Path, section: &str, payload: &str) -> Result<()> {
    let path = artifacts::decision_path(planspace, section);
    artifacts::ensure_parent(&path)?;
    let mut block = String::new();
    if path.exists() {
        block.push_str(&std::fs::read_to_string(&path).context("reading existing decision ledger")?);
    } else {
        block.push_str(&format!("# Decisions for section {section}\n\n"));
    }
    block.push_str(&format!("## Decision (from parent)\n\n{payload}\n\n"));
    std::fs::write(path, block).context("writing decision ledger")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_decision_creates_file_with_header_and_block() {
        let dir = tempdir().unwrap();
        append(dir.path(), "01", "choose-LRU").unwrap();
        let contents = std::fs::read_to_string(artifacts::decision_path(dir.path(), "01")).unwrap();
        assert!(contents.contains("# Decisions for section 01"));
        assert!(contents.contains("## Decision (from parent)"));
        assert!(contents.contains("choose-LRU"));
    }

    #[test]
    fn appends_without_clobbering_prior_decisions() {
        let dir = tempdir().unwrap();
        append(dir.path(), "01", "first").unwrap();
        append(dir.path(), "01", "second").unwrap();
        let contents = std::fs::read_to_string(artifacts::decision_path(dir.path(), "01")).unwrap();
        assert!(contents.contains("first"));
        assert!(contents.contains("second"));
        assert_eq!(contents.matches("## Decision (from parent)").count(), 2);
    }
}
