//! Traceability ledger (spec §9): every artifact the core generates
//! appends a row to `artifacts/traceability.json`.

use std::path::Path;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceabilityRow {
    pub section: String,
    pub artifact: String,
    pub source: String,
    pub detail: String,
}

fn ledger_path(planspace: &Path) -> std::path::PathBuf {
    planspace.join("artifacts/traceability.json")
}

/// Appends one row. Reads the existing array (or starts a fresh one if
/// the file is absent or malformed — a corrupt ledger must never block
/// the pipeline) and rewrites it whole; `run.db`-scale concurrency isn't
/// expected here since writes only happen from the single scheduler
/// thread.
pub fn append(planspace: &Path, row: TraceabilityRow) -> Result<()> {
    let path = ledger_path(planspace);
    let mut rows: Vec<TraceabilityRow> = if path.exists() {
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    } else {
        Vec::new()
    };
    rows.push(row);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&rows).context("serializing traceability ledger")?;
    std::fs::write(path, json).context("writing traceability ledger")
}
