//! Signal layer (spec §4.4): typed JSON files under `artifacts/signals/`,
//! plus the state-adjudicator fallback for ambiguous free text.
//!
//! The dispatcher never parses free text with regular expressions for
//! state decisions (spec §9 "Structured signals, not text sniffing");
//! state always comes from a signal file or the adjudicator below.

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dispatch::{AgentKind, DispatchOutcome, DispatchRequest, Dispatcher};
use crate::error::SignalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalState {
    Underspecified,
    NeedDecision,
    Dependency,
    LoopDetected,
    NeedsParent,
    OutOfScope,
}

impl SignalState {
    pub fn mail_prefix(self) -> &'static str {
        match self {
            SignalState::Underspecified => "underspec",
            SignalState::NeedDecision => "need_decision",
            SignalState::Dependency => "dependency",
            SignalState::LoopDetected => "loop_detected",
            SignalState::NeedsParent => "needs_parent",
            SignalState::OutOfScope => "out_of_scope",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub state: SignalState,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumptions_refused: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_escalation_target: Option<String>,
}

impl Signal {
    pub fn new(state: SignalState, detail: impl Into<String>) -> Self {
        Self {
            state,
            detail: detail.into(),
            needs: None,
            assumptions_refused: None,
            suggested_escalation_target: None,
        }
    }

    /// Detail text with enrichment fields appended verbatim, for mail
    /// messages and pause descriptions.
    pub fn full_detail(&self) -> String {
        let mut out = self.detail.clone();
        if let Some(needs) = &self.needs {
            out.push_str(&format!(" | needs: {needs}"));
        }
        if let Some(refused) = &self.assumptions_refused {
            out.push_str(&format!(" | assumptions_refused: {refused}"));
        }
        if let Some(target) = &self.suggested_escalation_target {
            out.push_str(&format!(" | suggested_escalation_target: {target}"));
        }
        out
    }
}

pub fn signal_path(planspace: &Path, name: &str) -> PathBuf {
    planspace.join("artifacts/signals").join(format!("{name}.json"))
}

pub fn write_signal(planspace: &Path, name: &str, signal: &Signal) -> Result<()> {
    let path = signal_path(planspace, name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(signal).context("serializing signal")?;
    std::fs::write(path, json).context("writing signal file")
}

/// Reads and parses a signal file, round-tripping state and detail
/// (enrichment fields included) exactly as written (spec §8 "Signal
/// round-trip").
pub fn read_signal(planspace: &Path, name: &str) -> Result<Option<Signal>> {
    let path = signal_path(planspace, name);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path).context("reading signal file")?;
    let signal: Signal = serde_json::from_str(&raw)
        .map_err(|e| SignalError::Malformed(path.display().to_string(), e))?;
    Ok(Some(signal))
}

/// Classifies free-text agent output with no accompanying signal file by
/// dispatching a cheap state-adjudicator LLM that returns a JSON
/// verdict. Used only when no signal file was written; never as a
/// regex-based substitute for one.
pub async fn classify_via_adjudicator(
    dispatcher: &Dispatcher<'_>,
    section: &str,
    model: &str,
    prompt_file: &Path,
    output_file: &Path,
) -> Result<Signal> {
    let req = DispatchRequest {
        kind: AgentKind::StateAdjudicator,
        model: model.to_string(),
        prompt_file: prompt_file.to_path_buf(),
        role_file: None,
        project: None,
        agent_name: None,
        output_file: output_file.to_path_buf(),
    };
    match dispatcher.dispatch(section, req).await? {
        DispatchOutcome::Completed { output } => {
            serde_json::from_str(&output).map_err(|e| SignalError::Malformed("adjudicator-output".to_string(), e).into())
        }
        DispatchOutcome::AlignmentChangedPending => {
            Err(eyre::eyre!("alignment_changed pending, cannot adjudicate"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn signal_round_trips_state_and_enrichment() {
        let dir = tempdir().unwrap();
        let mut signal = Signal::new(SignalState::NeedDecision, "which cache strategy?");
        signal.needs = Some("decision on eviction policy".to_string());
        write_signal(dir.path(), "section-01-decision", &signal).unwrap();

        let read_back = read_signal(dir.path(), "section-01-decision").unwrap().unwrap();
        assert_eq!(read_back.state, SignalState::NeedDecision);
        assert_eq!(read_back.detail, "which cache strategy?");
        assert_eq!(read_back.needs.as_deref(), Some("decision on eviction policy"));
    }

    #[test]
    fn missing_signal_file_is_none_not_error() {
        let dir = tempdir().unwrap();
        assert!(read_signal(dir.path(), "nope").unwrap().is_none());
    }

    #[test]
    fn mail_prefixes_match_spec_vocabulary() {
        assert_eq!(SignalState::Underspecified.mail_prefix(), "underspec");
        assert_eq!(SignalState::NeedDecision.mail_prefix(), "need_decision");
        assert_eq!(SignalState::Dependency.mail_prefix(), "dependency");
        assert_eq!(SignalState::LoopDetected.mail_prefix(), "loop_detected");
    }
}
