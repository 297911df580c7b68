//! Outer scheduler (spec §4.8): Phase 1 runs every section's straight-
//! line state machine off a FIFO queue; Phase 2 re-checks alignment
//! globally and, if anything slipped, hands off to the coordinator.
//! Restart semantics: `alignment_changed` observed anywhere in either
//! phase restarts Phase 1 from the top.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde_json::json;

use crate::alignment::Verdict;
use crate::artifacts;
use crate::config::Config;
use crate::control::{PipelineControl, Unwind};
use crate::coordinator::{Coordinator, CoordinationOutcome};
use crate::cross_section::PeerSection;
use crate::dispatch::{AgentKind, DispatchOutcome, DispatchRequest, Dispatcher};
use crate::domain::{Section, SectionResult};
use crate::mailbox::Mailbox;
use crate::prompts::PromptRenderer;
use crate::section::SectionEngine;

/// Outcome of one top-level `run` call, for `main` to pick an exit path.
pub enum RunOutcome {
    Complete,
    Aborted,
    /// Every invocation terminates after one restart-free pass through
    /// Phase 1 + Phase 2; a pausing section or an exhausted coordinator
    /// ends the run here without `complete` (spec §4.8, §6).
    Incomplete,
}

pub struct Scheduler<'a> {
    pub planspace: &'a Path,
    pub codespace: &'a Path,
    pub config: &'a Config,
    pub mailbox: Mailbox,
    pub control: &'a PipelineControl,
    pub prompts: &'a PromptRenderer,
    pub global_proposal_path: PathBuf,
    pub global_alignment_path: PathBuf,
}

impl<'a> Scheduler<'a> {
    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.config.agent_runner, self.mailbox.clone(), self.control, self.planspace, self.prompts)
    }

    fn section_engine(&self) -> SectionEngine<'_> {
        SectionEngine {
            planspace: self.planspace,
            codespace: self.codespace,
            config: self.config,
            mailbox: self.mailbox.clone(),
            control: self.control,
            prompts: self.prompts,
        }
    }

    /// Top-level loop: Phase 1 then Phase 2, restarting Phase 1 whenever
    /// `alignment_changed` surfaces in either phase (spec §4.8).
    pub async fn run(&self) -> Result<RunOutcome> {
        loop {
            let sections = self.load_sections()?;
            match self.run_phase1(sections).await? {
                PhaseOutcome::Continue(results) => match self.run_phase2(results).await? {
                    Phase2Outcome::Complete => return Ok(RunOutcome::Complete),
                    Phase2Outcome::Restart => continue,
                    Phase2Outcome::Aborted => return Ok(RunOutcome::Aborted),
                    Phase2Outcome::Incomplete => return Ok(RunOutcome::Incomplete),
                },
                PhaseOutcome::Aborted => return Ok(RunOutcome::Aborted),
            }
        }
    }

    fn load_sections(&self) -> Result<Vec<Section>> {
        Section::load_all(&artifacts::sections_dir(self.planspace), &self.global_proposal_path, &self.global_alignment_path)
            .context("loading sections")
    }

    /// Phase 1 (spec §4.8): drains control messages before each section;
    /// `alignment_changed` requeues every already-completed section and
    /// keeps going (so the currently-queued set always reflects the
    /// latest proposal/alignment state); a pausing section terminates
    /// this scheduler invocation outright.
    async fn run_phase1(&self, sections: Vec<Section>) -> Result<PhaseOutcome> {
        let mut related_files_by_section: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for section in &sections {
            related_files_by_section.insert(section.number.as_str().to_string(), section.related_files.clone());
        }
        let mut by_number: BTreeMap<String, Section> = sections.into_iter().map(|s| (s.number.as_str().to_string(), s)).collect();
        let mut queue: VecDeque<String> = by_number.keys().cloned().collect();
        let mut completed: Vec<String> = Vec::new();
        let mut results: BTreeMap<String, SectionResult> = BTreeMap::new();

        while let Some(number) = queue.pop_front() {
            if let Some(unwind) = self.control.poll_control_messages().await? {
                match unwind {
                    Unwind::Abort => return Ok(PhaseOutcome::Aborted),
                    Unwind::AlignmentChanged => {
                        self.control.clear_alignment_changed_pending()?;
                        queue.extend(completed.drain(..));
                        queue.push_back(number);
                        continue;
                    }
                }
            }

            let Some(mut section) = by_number.remove(&number) else { continue };
            let peers = self.peer_context(&number, &related_files_by_section, &results);

            self.mailbox.log("lifecycle", Some(&format!("section:{number}")), &format!("start:section:{number}"), Some("_scheduler")).await?;
            let outcome = self.section_engine().run(&mut section, &peers).await?;
            self.mailbox.log("lifecycle", Some(&format!("section:{number}")), &format!("end:section:{number}"), Some("_scheduler")).await?;

            match outcome {
                crate::section::SectionOutcome::Done(result) => {
                    related_files_by_section.insert(number.clone(), section.related_files.clone());
                    results.insert(number.clone(), result);
                    completed.push(number.clone());
                    by_number.insert(number, section);
                }
                crate::section::SectionOutcome::Unwind(Unwind::Abort) => return Ok(PhaseOutcome::Aborted),
                crate::section::SectionOutcome::Unwind(Unwind::AlignmentChanged) => {
                    self.control.clear_alignment_changed_pending()?;
                    by_number.insert(number.clone(), section);
                    queue.extend(completed.drain(..));
                    queue.push_back(number);
                    continue;
                }
            }
        }

        // A pausing section blocks inside `pause_for_parent` rather than
        // returning here, so a normal exit from this loop always means
        // every queued section ran to a `Done` outcome at least once.
        Ok(PhaseOutcome::Continue(results.into_values().collect()))
    }

    fn peer_context(&self, excluding: &str, related_files: &BTreeMap<String, Vec<PathBuf>>, results: &BTreeMap<String, SectionResult>) -> Vec<PeerSection> {
        related_files
            .iter()
            .filter(|(n, _)| n.as_str() != excluding)
            .map(|(n, files)| PeerSection {
                number: n.clone(),
                summary: results.get(n).and_then(|r| r.problems.clone()).unwrap_or_else(|| "aligned".to_string()),
                related_files: files.clone(),
            })
            .collect()
    }

    /// Phase 2 (spec §4.8): re-runs the alignment judge on every section
    /// that has related files (sections with none were re-explored to
    /// greenfield or seeded in Phase 1 and have nothing to re-check).
    /// Loops the coordinator until either everything converges or the
    /// coordinator terminates without `complete`.
    async fn run_phase2(&self, phase1_results: Vec<SectionResult>) -> Result<Phase2Outcome> {
        let mut phase1_results = phase1_results;
        loop {
            if let Some(unwind) = self.control.poll_control_messages().await? {
                match unwind {
                    Unwind::Abort => return Ok(Phase2Outcome::Aborted),
                    Unwind::AlignmentChanged => return Ok(Phase2Outcome::Restart),
                }
            }

            let all_sections: Vec<String> = phase1_results.iter().map(|r| r.section.clone()).collect();
            let mut misaligned: BTreeMap<String, String> = BTreeMap::new();
            for result in &phase1_results {
                if !result.aligned {
                    misaligned.insert(result.section.clone(), result.problems.clone().unwrap_or_default());
                    continue;
                }
                match self.realign_section(&result.section).await? {
                    RealignOutcome::Aligned => {}
                    RealignOutcome::Misaligned(text) => {
                        misaligned.insert(result.section.clone(), text);
                    }
                    RealignOutcome::Unwind(Unwind::Abort) => return Ok(Phase2Outcome::Aborted),
                    RealignOutcome::Unwind(Unwind::AlignmentChanged) => return Ok(Phase2Outcome::Restart),
                }
            }

            let notes_outstanding = self.any_note_unacknowledged(&all_sections)?;
            if misaligned.is_empty() && !notes_outstanding {
                if let Some(unwind) = self.control.poll_control_messages().await? {
                    match unwind {
                        Unwind::Abort => return Ok(Phase2Outcome::Aborted),
                        Unwind::AlignmentChanged => return Ok(Phase2Outcome::Restart),
                    }
                }
                self.mailbox.send("_parent", "_scheduler", "complete").await?;
                return Ok(Phase2Outcome::Complete);
            }

            let coordinator = Coordinator {
                planspace: self.planspace,
                codespace: self.codespace,
                config: self.config,
                mailbox: self.mailbox.clone(),
                control: self.control,
                prompts: self.prompts,
            };
            match coordinator.run(&misaligned, &all_sections).await? {
                CoordinationOutcome::Converged => {
                    phase1_results = all_sections.iter().map(|s| SectionResult::aligned(s.clone(), Vec::new())).collect();
                    continue;
                }
                CoordinationOutcome::Unwind(Unwind::Abort) => return Ok(Phase2Outcome::Aborted),
                CoordinationOutcome::Unwind(Unwind::AlignmentChanged) => return Ok(Phase2Outcome::Restart),
                CoordinationOutcome::Exhausted => return Ok(Phase2Outcome::Incomplete),
            }
        }
    }

    fn any_note_unacknowledged(&self, all_sections: &[String]) -> Result<bool> {
        let notes_dir = artifacts::notes_dir(self.planspace);
        if !notes_dir.is_dir() {
            return Ok(false);
        }
        for entry in std::fs::read_dir(&notes_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            let Some(target) = all_sections.iter().find(|s| name.ends_with(&format!("-to-{s}.md"))) else { continue };
            let markdown = std::fs::read_to_string(entry.path())?;
            let Some(note_id) = crate::domain::ConsequenceNote::parse_note_id(&markdown) else { continue };
            let ack_path = artifacts::signals_dir(self.planspace).join(format!("note-ack-{target}.json"));
            let acknowledged = std::fs::read_to_string(&ack_path)
                .ok()
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
                .and_then(|v| v.get("acknowledged").cloned())
                .map(|entries| entries.as_array().map(|a| a.iter().any(|e| e.get("note_id").and_then(|v| v.as_str()) == Some(note_id.as_str()))).unwrap_or(false))
                .unwrap_or(false);
            if !acknowledged {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Phase 2's per-section alignment re-check (spec §4.8): TIMEOUT and
    /// invalid-frame both retry, up to two retries, without consuming a
    /// section-engine attempt (this runs outside the section engine
    /// entirely — the section already completed Phase 1).
    async fn realign_section(&self, section: &str) -> Result<RealignOutcome> {
        if let Some(unwind) = self.control.poll_control_messages().await? {
            return Ok(RealignOutcome::Unwind(unwind));
        }
        let mut retries = 0u32;
        loop {
            let prompt_file = artifacts::sections_dir(self.planspace).join(format!("phase2-realign-{section}-{retries}.md"));
            self.prompts.render_to_file(
                "impl-align",
                &json!({
                    "stage": "phase2",
                    "section": section,
                    "alignment_excerpt": std::fs::read_to_string(artifacts::alignment_excerpt_path(self.planspace, section)).unwrap_or_default(),
                    "proposal_excerpt": std::fs::read_to_string(artifacts::proposal_excerpt_path(self.planspace, section)).unwrap_or_default(),
                    "candidate_document": std::fs::read_to_string(artifacts::integration_proposal_path(self.planspace, section)).unwrap_or_default(),
                }),
                &prompt_file,
            )?;
            let output_file = artifacts::sections_dir(self.planspace).join(format!("phase2-realign-{section}-{retries}-output.md"));
            let req = DispatchRequest {
                kind: AgentKind::AlignmentJudge,
                model: self.config.agent_runner.alignment_judge_model.clone(),
                prompt_file,
                role_file: None,
                project: Some(self.codespace.to_path_buf()),
                agent_name: None,
                output_file,
            };
            let output = match self.dispatcher().dispatch(section, req).await? {
                DispatchOutcome::Completed { output } => output,
                DispatchOutcome::AlignmentChangedPending => return Ok(RealignOutcome::Unwind(Unwind::AlignmentChanged)),
            };
            match crate::alignment::parse_verdict(&output) {
                Verdict::Aligned => return Ok(RealignOutcome::Aligned),
                Verdict::Problems(text) => return Ok(RealignOutcome::Misaligned(text)),
                Verdict::Underspecified(reason) => return Ok(RealignOutcome::Misaligned(reason)),
                Verdict::InvalidFrame => {
                    retries += 1;
                    if retries > 2 {
                        return Ok(RealignOutcome::Misaligned("alignment judge repeatedly returned an invalid frame".to_string()));
                    }
                    continue;
                }
            }
        }
    }
}

enum PhaseOutcome {
    Continue(Vec<SectionResult>),
    Aborted,
}

enum Phase2Outcome {
    Complete,
    Restart,
    Aborted,
    Incomplete,
}

enum RealignOutcome {
    Aligned,
    Misaligned(String),
    Unwind(Unwind),
}
