//! Alignment-judge verdict parsing (spec §4.5, §8, §9): the canonical
//! verdict is structured JSON `{frame_ok, aligned, problems[]}`; plain
//! text `ALIGNED` / `PROBLEMS:` / `UNDERSPECIFIED:` is the fallback, and
//! both vocabularies are folded into one `Verdict` so callers never
//! branch on which form they got. Per spec §9's open question, the
//! legacy `MISALIGNED` vocabulary is not preserved outside this fallback
//! parse.

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Aligned,
    Problems(String),
    Underspecified(String),
    /// `frame_ok: false` — retry without consuming the timeout/attempt
    /// budget (spec §4.5, §7).
    InvalidFrame,
}

#[derive(Debug, Deserialize)]
struct JsonVerdict {
    #[serde(default = "default_true")]
    frame_ok: bool,
    #[serde(default)]
    aligned: bool,
    #[serde(default)]
    problems: Vec<String>,
    #[serde(default)]
    underspecified: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Parses an alignment judge's raw output. Tries JSON first (the
/// canonical form); falls back to the first non-empty line, checked
/// case-exact, per spec §8's boundary behavior.
pub fn parse_verdict(output: &str) -> Verdict {
    let trimmed = output.trim();
    if let Some(json_start) = trimmed.find('{') {
        if let Ok(v) = serde_json::from_str::<JsonVerdict>(&trimmed[json_start..]) {
            if !v.frame_ok {
                return Verdict::InvalidFrame;
            }
            if let Some(reason) = v.underspecified {
                return Verdict::Underspecified(reason);
            }
            if v.aligned {
                return Verdict::Aligned;
            }
            return Verdict::Problems(v.problems.join("\n"));
        }
    }
    parse_text_verdict(trimmed)
}

fn parse_text_verdict(trimmed: &str) -> Verdict {
    let first_line = trimmed.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if first_line == "ALIGNED" {
        return Verdict::Aligned;
    }
    if let Some(rest) = trimmed.strip_prefix("PROBLEMS:") {
        return Verdict::Problems(rest.trim().to_string());
    }
    if let Some(rest) = trimmed.strip_prefix("UNDERSPECIFIED:") {
        return Verdict::Underspecified(rest.trim().to_string());
    }
    // Anything else, including bare "MISALIGNED", is not a recognized
    // verdict on its own; treat as underspecified so the loop escalates
    // rather than silently treating drift as alignment.
    Verdict::Underspecified(format!("unrecognized alignment judge output: {first_line}"))
}
