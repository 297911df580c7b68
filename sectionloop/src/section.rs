//! Section engine (spec §4.5): runs one section through its state
//! machine, `S0` (entry) through `S7` (post-completion).
//!
//! ```text
//! S0 entry -> [incoming notes, tool surfacing, TODO extraction]
//!   -> S1 setup -> S2 proposal <-> S3 proposal-align -> S4 microstrategy?
//!   -> S5 impl <-> S6 impl-align -> S7 post-completion
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde_json::json;

use crate::alignment::Verdict;
use crate::artifacts;
use crate::config::Config;
use crate::control::{PauseOutcome, PipelineControl, Unwind};
use crate::cross_section::{self, PeerSection};
use crate::decisions;
use crate::dispatch::{AgentKind, DispatchOutcome, DispatchRequest, Dispatcher};
use crate::domain::{Section, SectionResult};
use crate::mailbox::Mailbox;
use crate::prompts::PromptRenderer;
use crate::registry;
use crate::signals::{self, Signal, SignalState};
use crate::todos;
use crate::traceability::{self, TraceabilityRow};

pub enum SectionOutcome {
    Done(SectionResult),
    Unwind(Unwind),
}

pub struct SectionEngine<'a> {
    pub planspace: &'a Path,
    pub codespace: &'a Path,
    pub config: &'a Config,
    pub mailbox: Mailbox,
    pub control: &'a PipelineControl,
    pub prompts: &'a PromptRenderer,
}

/// Signal state that the alignment loop (proposal or implementation)
/// should pause on, versus feed back into another attempt of the same
/// stage.
enum LoopStep {
    Retry,
    Aligned,
    Pause(SignalState, String),
}

impl<'a> SectionEngine<'a> {
    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.config.agent_runner, self.mailbox.clone(), self.control, self.planspace, self.prompts)
    }

    /// Runs `section` from its current state to either a terminal
    /// `SectionResult` or an `Unwind` observed at a suspension point.
    /// `peers` describes every other loaded section, for tool surfacing
    /// context and (at S7) impact analysis.
    pub async fn run(&self, section: &mut Section, peers: &[PeerSection]) -> Result<SectionOutcome> {
        section.enter();

        if let Some(unwind) = self.control.poll_control_messages().await? {
            return Ok(SectionOutcome::Unwind(unwind));
        }

        if section.is_recurring() {
            self.write_recurrence_signal(section).await?;
        }

        if section.related_files.is_empty() {
            match self.reexplore(section).await? {
                ReexploreResult::Greenfield => {
                    return Ok(SectionOutcome::Done(SectionResult::aligned(
                        section.number.as_str(),
                        Vec::new(),
                    )));
                }
                ReexploreResult::SeededFiles => {}
            }
        }

        let incoming_notes =
            cross_section::read_incoming_notes(self.codespace, self.planspace, section.number.as_str(), &section.related_files)?;
        let tool_entries = registry::load(self.planspace);
        let tools_surfaced = registry::surface_for_section(&tool_entries, section.number.as_str());
        if let Some(surfaced) = &tools_surfaced {
            let path = artifacts::tools_available_path(self.planspace, section.number.as_str());
            artifacts::ensure_parent(&path)?;
            std::fs::write(&path, surfaced)?;
        }
        let todos_markdown = todos::render_todos_markdown(section.number.as_str(), self.codespace, &section.related_files);
        let todos_path = artifacts::todos_path(self.planspace, section.number.as_str());
        artifacts::ensure_parent(&todos_path)?;
        std::fs::write(&todos_path, &todos_markdown)?;
        self.trace(section.number.as_str(), "todos", "related files", "TODO extraction")?;

        // S1 setup
        if let Some(unwind) = self.run_setup(section, &incoming_notes, tools_surfaced.as_deref(), &todos_markdown).await? {
            return Ok(SectionOutcome::Unwind(unwind));
        }
        self.write_alignment_surface(section)?;

        // S2/S3 proposal <-> proposal-align loop
        let proposal_verdict = self.run_proposal_loop(section, &incoming_notes).await?;
        let needs_microstrategy = match proposal_verdict {
            LoopOutcome::Unwind(u) => return Ok(SectionOutcome::Unwind(u)),
            LoopOutcome::Aligned(needs) => needs,
        };
        self.write_alignment_surface(section)?;

        // S4 microstrategy (optional)
        if needs_microstrategy {
            if let Some(unwind) = self.run_microstrategy(section).await? {
                return Ok(SectionOutcome::Unwind(unwind));
            }
        }

        // S5/S6 impl <-> impl-align loop
        let impl_outcome = self.run_impl_loop(section).await?;
        let modified_files = match impl_outcome {
            LoopOutcome::Unwind(u) => return Ok(SectionOutcome::Unwind(u)),
            LoopOutcome::Aligned(files) => files,
        };

        // S7 post-completion
        self.post_completion(section, peers, modified_files).await
    }

    async fn write_recurrence_signal(&self, section: &Section) -> Result<()> {
        let name = format!("section-{}-recurrence", section.number);
        signals::write_signal(
            self.planspace,
            &name,
            &Signal::new(
                SignalState::Dependency,
                format!("section {} re-entering at attempt {}", section.number, section.attempt),
            ),
        )?;
        // SPEC_FULL §11.1: the recurrence signal is its own artifact
        // (not just a mail message) feeding the coordinator's problem
        // collection before per-stage escalation counters individually
        // cross threshold.
        let path = artifacts::signals_dir(self.planspace).join(format!("{name}.json"));
        let body = serde_json::to_string_pretty(&json!({
            "section": section.number.as_str(),
            "attempt": section.attempt,
            "recurring": true,
            "escalate_to_coordinator": true,
        }))?;
        artifacts::ensure_parent(&path)?;
        std::fs::write(path, body)?;
        Ok(())
    }

    async fn reexplore(&self, section: &mut Section) -> Result<ReexploreResult> {
        let prompt_file = artifacts::artifacts_root(self.planspace).join(format!("reexplore-{}.md", section.number));
        self.prompts
            .render_to_file(
                "reexplore",
                &json!({
                    "section": section.number.as_str(),
                    "section_title": "re-exploration",
                    "global_proposal": section.global_proposal_path.display().to_string(),
                    "global_alignment": section.global_alignment_path.display().to_string(),
                }),
                &prompt_file,
            )
            .context("rendering re-explorer prompt")?;
        let output_file = artifacts::artifacts_root(self.planspace).join(format!("reexplore-{}-output.md", section.number));
        let req = DispatchRequest {
            kind: AgentKind::ReExplorer,
            model: self.config.agent_runner.re_explorer_model.clone(),
            prompt_file,
            role_file: None,
            project: Some(self.codespace.to_path_buf()),
            agent_name: Some(format!("section-{}-reexplorer", section.number)),
            output_file: output_file.clone(),
        };
        let output = match self.dispatcher().dispatch(section.number.as_str(), req).await? {
            DispatchOutcome::Completed { output } => output,
            DispatchOutcome::AlignmentChangedPending => return Ok(ReexploreResult::SeededFiles),
        };

        let mode = classify_mode(&output);
        std::fs::write(artifacts::mode_path(self.planspace, section.number.as_str()), mode.as_str())?;
        let mode_signal_name = format!("section-{}-mode", section.number);
        signals::write_signal(self.planspace, &mode_signal_name, &Signal::new(SignalState::Dependency, mode.as_str()))?;

        if mode == ProjectMode::Greenfield {
            return Ok(ReexploreResult::Greenfield);
        }

        section.related_files = parse_related_files(&output);
        Ok(ReexploreResult::SeededFiles)
    }

    async fn run_setup(
        &self,
        section: &Section,
        incoming_notes: &[cross_section::IncomingNote],
        tools_surfaced: Option<&str>,
        todos_markdown: &str,
    ) -> Result<Option<Unwind>> {
        if let Some(unwind) = self.control.poll_control_messages().await? {
            return Ok(Some(unwind));
        }
        let prompt_file = artifacts::artifacts_root(self.planspace).join(format!("setup-{}.md", section.number));
        self.prompts.render_to_file(
            "setup",
            &json!({
                "section": section.number.as_str(),
                "section_title": format!("section {}", section.number),
                "global_proposal": section.global_proposal_path.display().to_string(),
                "global_alignment": section.global_alignment_path.display().to_string(),
                "related_files": section.related_files.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                "todos": todos_markdown.lines().map(str::to_string).collect::<Vec<_>>(),
                "tool_registry": tools_surfaced,
                "incoming_notes": render_incoming_notes_context(incoming_notes),
            }),
            &prompt_file,
        )?;
        let output_file = artifacts::artifacts_root(self.planspace).join(format!("setup-{}-output.md", section.number));
        let req = DispatchRequest {
            kind: AgentKind::Setup,
            model: self.config.agent_runner.re_explorer_model.clone(),
            prompt_file,
            role_file: None,
            project: Some(self.codespace.to_path_buf()),
            agent_name: Some(format!("section-{}-setup", section.number)),
            output_file,
        };
        self.dispatcher().dispatch(section.number.as_str(), req).await?;
        self.mailbox
            .send(
                "_parent",
                "_scheduler",
                &format!("summary:setup:{}:excerpts and problem frame written", section.number),
            )
            .await?;
        self.trace(section.number.as_str(), "proposal-excerpt,alignment-excerpt", "global proposal/alignment", "setup extraction")?;
        Ok(None)
    }

    /// Alignment surface file (SPEC_FULL §11.4): an index of every
    /// authoritative input the alignment judge should read, written
    /// after excerpts exist and again after the proposal aligns.
    fn write_alignment_surface(&self, section: &Section) -> Result<()> {
        let n = section.number.as_str();
        let mut out = format!("# Alignment surface for section {n}\n\n");
        for (label, path) in [
            ("Proposal excerpt", artifacts::proposal_excerpt_path(self.planspace, n)),
            ("Alignment excerpt", artifacts::alignment_excerpt_path(self.planspace, n)),
            ("TODO extraction", artifacts::todos_path(self.planspace, n)),
            ("Integration proposal", artifacts::integration_proposal_path(self.planspace, n)),
            ("Microstrategy", artifacts::microstrategy_path(self.planspace, n)),
        ] {
            if path.exists() {
                out.push_str(&format!("- {label}: `{}`\n", path.display()));
            }
        }
        let decisions = artifacts::decision_path(self.planspace, n);
        if decisions.exists() {
            out.push_str(&format!("- Decisions: `{}`\n", decisions.display()));
        }
        std::fs::write(artifacts::alignment_surface_path(self.planspace, n), out)?;
        Ok(())
    }

    async fn run_proposal_loop(&self, section: &mut Section, incoming_notes: &[cross_section::IncomingNote]) -> Result<LoopOutcome<bool>> {
        let n = section.number.as_str().to_string();
        let mut attempt: u32 = 1;
        let mut problems: Option<String> = None;

        loop {
            if let Some(unwind) = self.control.poll_control_messages().await? {
                return Ok(LoopOutcome::Unwind(unwind));
            }

            let escalated = attempt >= 3 || incoming_notes.len() >= 3;
            let model = if escalated {
                self.record_escalation(&n, "proposal", &self.config.agent_runner.proposer_model)?;
                self.config.agent_runner.proposer_escalated_model.clone()
            } else {
                self.config.agent_runner.proposer_model.clone()
            };

            let prompt_file = artifacts::artifacts_root(self.planspace).join(format!("proposal-{n}-attempt-{attempt}.md"));
            self.prompts.render_to_file(
                "proposal",
                &json!({
                    "section": n,
                    "proposal_excerpt": read_or_empty(&artifacts::proposal_excerpt_path(self.planspace, &n)),
                    "alignment_excerpt": read_or_empty(&artifacts::alignment_excerpt_path(self.planspace, &n)),
                    "problem_frame": read_or_empty(&artifacts::problem_frame_path(self.planspace, &n)),
                    "incoming_notes": render_incoming_notes_context(incoming_notes),
                    "problems_from_prior_attempt": problems,
                    "attempt": attempt,
                }),
                &prompt_file,
            )?;
            let output_file = artifacts::integration_proposal_path(self.planspace, &n);
            let req = DispatchRequest {
                kind: AgentKind::Proposer,
                model,
                prompt_file,
                role_file: None,
                project: Some(self.codespace.to_path_buf()),
                agent_name: Some(format!("section-{n}-proposer")),
                output_file: output_file.clone(),
            };
            let output = match self.dispatcher().dispatch(&n, req).await? {
                DispatchOutcome::Completed { output } => output,
                DispatchOutcome::AlignmentChangedPending => return Ok(LoopOutcome::Unwind(Unwind::AlignmentChanged)),
            };
            let needs_microstrategy = output.contains("needs_microstrategy: true");
            self.mailbox
                .send("_parent", "_scheduler", &format!("summary:proposal:{n}:attempt {attempt} written"))
                .await?;
            self.trace(&n, "integration-proposal", "proposal excerpt", "integration proposer")?;

            match self.run_alignment_check(&n, "proposal", &output_file, attempt).await? {
                LoopStep::Aligned => {
                    self.mailbox.send("_parent", "_scheduler", &format!("summary:proposal-align:{n}:ALIGNED")).await?;
                    return Ok(LoopOutcome::Aligned(needs_microstrategy));
                }
                LoopStep::Retry => {
                    problems = Some(read_or_empty(&artifacts::proposal_problems_path(self.planspace, &n, attempt)));
                    attempt += 1;
                    continue;
                }
                LoopStep::Pause(state, detail) => match self.pause_and_persist(&n, state, &detail).await? {
                    Some(unwind) => return Ok(LoopOutcome::Unwind(unwind)),
                    None => continue,
                },
            }
        }
    }

    /// Runs the alignment judge against `candidate_path` and folds its
    /// verdict into a `LoopStep`: `PROBLEMS` feeds back into another
    /// attempt of the same stage (writing the problems artifact, tagged
    /// with the caller's attempt number, first), `UNDERSPECIFIED` pauses,
    /// `InvalidFrame` retries the judge call itself without writing a
    /// problems artifact or counting against the attempt budget.
    async fn run_alignment_check(&self, section: &str, stage: &str, candidate_path: &Path, attempt: u32) -> Result<LoopStep> {
        let mut retries = 0u32;
        loop {
            let prompt_file = artifacts::artifacts_root(self.planspace).join(format!("{stage}-align-{section}-{attempt}-{retries}.md"));
            self.prompts.render_to_file(
                &format!("{stage}-align"),
                &json!({
                    "stage": stage,
                    "section": section,
                    "alignment_excerpt": read_or_empty(&artifacts::alignment_excerpt_path(self.planspace, section)),
                    "proposal_excerpt": read_or_empty(&artifacts::proposal_excerpt_path(self.planspace, section)),
                    "candidate_document": read_or_empty(candidate_path),
                }),
                &prompt_file,
            )?;
            let output_file = artifacts::artifacts_root(self.planspace).join(format!("{stage}-align-{section}-{attempt}-{retries}-output.md"));
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
                DispatchOutcome::AlignmentChangedPending => return Ok(LoopStep::Pause(SignalState::Dependency, "alignment_changed pending".to_string())),
            };

            match crate::alignment::parse_verdict(&output) {
                Verdict::Aligned => return Ok(LoopStep::Aligned),
                Verdict::InvalidFrame => {
                    retries += 1;
                    if retries > 2 {
                        return Ok(LoopStep::Pause(SignalState::Underspecified, "alignment judge repeatedly returned an invalid frame".to_string()));
                    }
                    continue;
                }
                Verdict::Problems(text) => {
                    let path = if stage == "proposal" {
                        artifacts::proposal_problems_path(self.planspace, section, attempt)
                    } else {
                        artifacts::impl_problems_path(self.planspace, section, attempt)
                    };
                    artifacts::ensure_parent(&path)?;
                    std::fs::write(&path, &text)?;
                    self.mailbox
                        .send("_parent", "_scheduler", &format!("summary:{stage}-align:{section}:PROBLEMS-attempt-{attempt}:{text}"))
                        .await?;
                    return Ok(LoopStep::Retry);
                }
                Verdict::Underspecified(reason) => return Ok(LoopStep::Pause(SignalState::Underspecified, reason)),
            }
        }
    }

    /// Pauses up to the parent for a blocker, persists the resume
    /// payload as a decision, and returns `Ok(None)` so the caller
    /// retries the current stage; returns `Ok(Some(unwind))` on abort.
    async fn pause_and_persist(&self, section: &str, state: SignalState, detail: &str) -> Result<Option<Unwind>> {
        self.mailbox
            .send("_parent", "_scheduler", &format!("open-problem:{section}:{}:{detail}", state.mail_prefix()))
            .await?;
        if matches!(state, SignalState::NeedsParent | SignalState::OutOfScope) {
            append_open_problem(self.planspace, section, state, detail)?;
        }
        if let SignalState::OutOfScope = state {
            write_scope_delta(self.planspace, section, detail)?;
        }
        match self.control.pause_for_parent(state.mail_prefix(), detail).await? {
            PauseOutcome::Aborted => Ok(Some(Unwind::Abort)),
            PauseOutcome::Resumed(payload) => {
                decisions::append(self.planspace, section, &payload)?;
                Ok(None)
            }
        }
    }

    fn record_escalation(&self, section: &str, stage: &str, previous_model: &str) -> Result<()> {
        let name = format!("tool-choice-{section}-{stage}");
        signals::write_signal(
            self.planspace,
            &name,
            &Signal::new(SignalState::Dependency, format!("escalated {stage} model, downgraded_from: {previous_model}")),
        )
    }

    async fn run_microstrategy(&self, section: &Section) -> Result<Option<Unwind>> {
        if let Some(unwind) = self.control.poll_control_messages().await? {
            return Ok(Some(unwind));
        }
        let n = section.number.as_str();
        let prompt_file = artifacts::artifacts_root(self.planspace).join(format!("microstrategy-{n}.md"));
        self.prompts.render_to_file(
            "microstrategy",
            &json!({
                "section": n,
                "proposal": read_or_empty(&artifacts::integration_proposal_path(self.planspace, n)),
                "todos": read_or_empty(&artifacts::todos_path(self.planspace, n)).lines().map(str::to_string).collect::<Vec<_>>(),
            }),
            &prompt_file,
        )?;
        let output_file = artifacts::microstrategy_path(self.planspace, n);
        let req = DispatchRequest {
            kind: AgentKind::Proposer,
            model: self.config.agent_runner.proposer_model.clone(),
            prompt_file,
            role_file: None,
            project: Some(self.codespace.to_path_buf()),
            agent_name: Some(format!("section-{n}-microstrategy")),
            output_file,
        };
        self.dispatcher().dispatch(n, req).await?;
        self.trace(n, "microstrategy", "integration proposal", "microstrategy generation")?;
        Ok(None)
    }

    async fn run_impl_loop(&self, section: &mut Section) -> Result<LoopOutcome<Vec<PathBuf>>> {
        let n = section.number.as_str().to_string();
        let mut attempt: u32 = 1;
        let mut problems: Option<String> = None;

        loop {
            if let Some(unwind) = self.control.poll_control_messages().await? {
                return Ok(LoopOutcome::Unwind(unwind));
            }

            let pre_hashes = hash_related_files(self.codespace, &section.related_files);
            let registry_pre_count = registry::load(self.planspace).len();
            let microstrategy_path = artifacts::microstrategy_path(self.planspace, &n);
            let prompt_file = artifacts::artifacts_root(self.planspace).join(format!("impl-{n}-attempt-{attempt}.md"));
            self.prompts.render_to_file(
                "impl",
                &json!({
                    "section": n,
                    "proposal": read_or_empty(&artifacts::integration_proposal_path(self.planspace, &n)),
                    "microstrategy": microstrategy_path.exists().then(|| read_or_empty(&microstrategy_path)),
                    "related_files": section.related_files.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                    "problems_from_prior_attempt": problems,
                }),
                &prompt_file,
            )?;
            let output_file = artifacts::artifacts_root(self.planspace).join(format!("impl-{n}-attempt-{attempt}-output.md"));
            let req = DispatchRequest {
                kind: AgentKind::ImplementationStrategist,
                model: self.config.agent_runner.implementation_model.clone(),
                prompt_file,
                role_file: None,
                project: Some(self.codespace.to_path_buf()),
                agent_name: Some(format!("section-{n}-implementer")),
                output_file: output_file.clone(),
            };
            let output = match self.dispatcher().dispatch(&n, req).await? {
                DispatchOutcome::Completed { output } => output,
                DispatchOutcome::AlignmentChangedPending => return Ok(LoopOutcome::Unwind(Unwind::AlignmentChanged)),
            };
            self.mailbox
                .send("_parent", "_scheduler", &format!("summary:impl:{n}:attempt {attempt} written"))
                .await?;
            self.run_tool_registrar_if_grown(&n, registry_pre_count).await?;

            let reported = parse_modified_files(&output);
            let verified = verify_modified_files(self.codespace, &reported, &pre_hashes);

            match self.run_alignment_check(&n, "impl", &output_file, attempt).await? {
                LoopStep::Aligned => {
                    self.mailbox.send("_parent", "_scheduler", &format!("summary:impl-align:{n}:ALIGNED")).await?;
                    self.mailbox
                        .send("_parent", "_scheduler", &format!("done:{n}:{} files modified", verified.len()))
                        .await?;
                    return Ok(LoopOutcome::Aligned(verified));
                }
                LoopStep::Retry => {
                    attempt += 1;
                    problems = Some(read_or_empty(&artifacts::impl_problems_path(self.planspace, &n, attempt - 1)));
                    continue;
                }
                LoopStep::Pause(state, detail) => match self.pause_and_persist(&n, state, &detail).await? {
                    Some(unwind) => return Ok(LoopOutcome::Unwind(unwind)),
                    None => continue,
                },
            }
        }
    }

    async fn post_completion(&self, section: &Section, peers: &[PeerSection], modified_files: Vec<PathBuf>) -> Result<SectionOutcome> {
        let n = section.number.as_str();
        cross_section::snapshot_modified_files(self.codespace, self.planspace, n, &modified_files)?;
        self.trace(n, "snapshot", "modified files", "post-completion snapshot")?;

        let summary = format!("Section {n} aligned; modified {} files.", modified_files.len());
        let proposal_text = read_or_empty(&artifacts::integration_proposal_path(self.planspace, n));
        cross_section::write_contract_summary(self.planspace, n, &summary, &proposal_text, &modified_files)?;
        self.trace(n, "contract-summary", "integration proposal", "post-completion contract summary")?;

        let prompt_file = artifacts::artifacts_root(self.planspace).join(format!("impact-{n}.md"));
        let peer_context: Vec<_> = peers
            .iter()
            .map(|p| json!({"section": p.number, "summary": p.summary, "related_files": p.related_files.iter().map(|f| f.display().to_string()).collect::<Vec<_>>()}))
            .collect();
        self.prompts.render_to_file(
            "impact",
            &json!({
                "section": n,
                "section_summary": summary.clone(),
                "modified_files": modified_files.iter().map(|f| f.display().to_string()).collect::<Vec<_>>(),
                "other_sections": peer_context,
            }),
            &prompt_file,
        )?;
        let output_file = artifacts::artifacts_root(self.planspace).join(format!("impact-{n}-output.md"));
        let all_section_numbers: Vec<String> = peers.iter().map(|p| p.number.clone()).chain(std::iter::once(n.to_string())).collect();
        let impacts = cross_section::analyze_impact(
            &self.dispatcher(),
            n,
            &prompt_file,
            &output_file,
            &self.config.agent_runner.impact_analysis_model,
            &all_section_numbers,
        )
        .await?;

        for (target, reason, note_markdown) in impacts {
            if target == n {
                continue;
            }
            let note = cross_section::write_consequence_note(self.planspace, n, &target, &reason, &note_markdown)?;
            self.trace(n, &format!("note:{}", note.note_id), "impact analysis", "consequence note")?;
        }

        Ok(SectionOutcome::Done(SectionResult::aligned(n, modified_files)))
    }

    /// Tool-registrar validation pass (SPEC_FULL §11.7): when an
    /// implementation attempt grows the registry, dispatch a
    /// tool-registrar agent to re-validate every entry and refresh the
    /// digest that downstream prompts prefer over the raw registry.
    async fn run_tool_registrar_if_grown(&self, section: &str, pre_count: usize) -> Result<()> {
        let after = registry::load(self.planspace);
        if after.len() <= pre_count {
            return Ok(());
        }
        let prompt_file = artifacts::artifacts_root(self.planspace).join(format!("tool-registrar-{section}.md"));
        let body = format!(
            "# Tool registry validation\n\n\
             Section {section}'s implementation grew the tool registry from {pre_count} to {} entries.\n\n\
             Re-validate every entry: confirm the path exists, the scope is correct, required \
             fields are present, promote experimental tools to stable where warranted, and prune \
             stale entries no implementation references.\n\n\
             Rewrite `artifacts/tool-registry.json` as a JSON array of the validated entries.\n",
            after.len()
        );
        artifacts::ensure_parent(&prompt_file)?;
        std::fs::write(&prompt_file, body)?;
        let output_file = artifacts::artifacts_root(self.planspace).join(format!("tool-registrar-{section}-output.md"));
        let req = DispatchRequest {
            kind: AgentKind::ToolRegistrar,
            model: self.config.agent_runner.state_adjudicator_model.clone(),
            prompt_file,
            role_file: None,
            project: Some(self.codespace.to_path_buf()),
            agent_name: None,
            output_file,
        };
        self.dispatcher().dispatch(section, req).await?;
        let validated = registry::load(self.planspace);
        registry::write_digest(self.planspace, &validated)?;
        self.trace(section, "tool-digest", "tool registry", "tool-registrar validation pass")
    }

    fn trace(&self, section: &str, artifact: &str, source: &str, detail: &str) -> Result<()> {
        traceability::append(
            self.planspace,
            TraceabilityRow { section: section.to_string(), artifact: artifact.to_string(), source: source.to_string(), detail: detail.to_string() },
        )
    }
}

enum LoopOutcome<T> {
    Aligned(T),
    Unwind(Unwind),
}

enum ReexploreResult {
    Greenfield,
    SeededFiles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProjectMode {
    Brownfield,
    Greenfield,
    Hybrid,
}

impl ProjectMode {
    fn as_str(self) -> &'static str {
        match self {
            ProjectMode::Brownfield => "brownfield",
            ProjectMode::Greenfield => "greenfield",
            ProjectMode::Hybrid => "hybrid",
        }
    }
}

fn classify_mode(output: &str) -> ProjectMode {
    let lower = output.to_lowercase();
    if lower.contains("greenfield") {
        ProjectMode::Greenfield
    } else if lower.contains("hybrid") {
        ProjectMode::Hybrid
    } else {
        ProjectMode::Brownfield
    }
}

/// Parses `### (.+)$` lines under a `## Related Files` header, with
/// code fences stripped first (spec §4.5 "Re-exploration").
fn parse_related_files(output: &str) -> Vec<PathBuf> {
    let stripped: String = output.lines().filter(|l| !l.trim_start().starts_with("```")).collect::<Vec<_>>().join("\n");
    let mut files = Vec::new();
    let mut in_section = false;
    for line in stripped.lines() {
        if line.trim_start().starts_with("## ") {
            in_section = line.trim() == "## Related Files";
            continue;
        }
        if in_section {
            if let Some(rest) = line.trim_start().strip_prefix("### ") {
                files.push(PathBuf::from(rest.trim().trim_matches('`')));
            }
        }
    }
    files
}

fn render_incoming_notes_context(notes: &[cross_section::IncomingNote]) -> Vec<serde_json::Value> {
    notes
        .iter()
        .map(|n| {
            json!({
                "from_section": n.from_section,
                "note_id": n.note_id,
                "contract_delta": n.contract_delta,
                "accommodate": n.accommodate,
                "diffs": n.diffs.iter().map(|(path, diff)| json!({"path": path.display().to_string(), "unified_diff": diff})).collect::<Vec<_>>(),
            })
        })
        .collect()
}

fn read_or_empty(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

fn hash_related_files(codespace: &Path, related_files: &[PathBuf]) -> Vec<(PathBuf, u64)> {
    related_files
        .iter()
        .map(|rel| {
            let mut hasher = DefaultHasher::new();
            if let Ok(contents) = std::fs::read(codespace.join(rel)) {
                contents.hash(&mut hasher);
            }
            (rel.clone(), hasher.finish())
        })
        .collect()
}

/// Splits reported-modified files into pre-existing files (trusted only
/// if their hash changed) and new files (trusted only if they exist),
/// per spec §4.5's "Modified-file verification".
fn verify_modified_files(codespace: &Path, reported: &[PathBuf], pre_hashes: &[(PathBuf, u64)]) -> Vec<PathBuf> {
    reported
        .iter()
        .filter(|rel| {
            if let Some((_, before)) = pre_hashes.iter().find(|(p, _)| p == *rel) {
                let mut hasher = DefaultHasher::new();
                if let Ok(contents) = std::fs::read(codespace.join(rel)) {
                    contents.hash(&mut hasher);
                }
                hasher.finish() != *before
            } else {
                codespace.join(rel).exists()
            }
        })
        .cloned()
        .collect()
}

/// Parses a `## Modified Files` section of one-path-per-line entries
/// from an implementation strategist's report.
fn parse_modified_files(output: &str) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut in_section = false;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("## ") {
            in_section = trimmed.eq_ignore_ascii_case("## Modified Files");
            continue;
        }
        if in_section {
            let candidate = trimmed.trim_start_matches('-').trim().trim_matches('`');
            if !candidate.is_empty() {
                files.push(PathBuf::from(candidate));
            }
        }
    }
    files
}

/// Open-problem routing (SPEC_FULL §11.2): appends a bullet to a `##
/// Open Problems` section in the section's spec file, in addition to
/// the mail message already sent.
fn append_open_problem(planspace: &Path, section: &str, state: SignalState, detail: &str) -> Result<()> {
    let path = artifacts::section_spec_path(planspace, section);
    let mut contents = std::fs::read_to_string(&path).unwrap_or_default();
    if !contents.contains("## Open Problems") {
        contents.push_str("\n## Open Problems\n");
    }
    contents.push_str(&format!("- [{}] {}\n", state.mail_prefix(), detail));
    std::fs::write(path, contents).context("appending open problem to section spec")
}

/// Scope-delta artifact (SPEC_FULL §11.3): the durable record the
/// Phase-1 reframing step reads on resume.
fn write_scope_delta(planspace: &Path, section: &str, detail: &str) -> Result<()> {
    let path = artifacts::scope_delta_path(planspace, section);
    artifacts::ensure_parent(&path)?;
    let body = serde_json::to_string_pretty(&json!({
        "section": section,
        "signal": "out_of_scope",
        "detail": detail,
        "requires_root_reframing": true,
    }))?;
    std::fs::write(path, body).context("writing scope-delta artifact")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_related_files_from_fenced_section() {
        let output = "## Related Files\n```\n### core.go\n### handlers/http.go\n```\n";
        let files = parse_related_files(output);
        assert_eq!(files, vec![PathBuf::from("core.go"), PathBuf::from("handlers/http.go")]);
    }

    #[test]
    fn classifies_greenfield_from_prose() {
        assert_eq!(classify_mode("This is a greenfield section with no existing code."), ProjectMode::Greenfield);
        assert_eq!(classify_mode("Hybrid: mostly new but touches config.go"), ProjectMode::Hybrid);
        assert_eq!(classify_mode("Existing brownfield module."), ProjectMode::Brownfield);
    }

    #[test]
    fn parses_modified_files_section() {
        let output = "Implementation complete.\n\n## Modified Files\n- src/core.go\n- `src/handlers.go`\n";
        let files = parse_modified_files(output);
        assert_eq!(files, vec![PathBuf::from("src/core.go"), PathBuf::from("src/handlers.go")]);
    }

    #[test]
    fn verify_modified_files_trusts_only_changed_pre_existing_and_new_that_exist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("unchanged.go"), "same").unwrap();
        std::fs::write(dir.path().join("changed.go"), "before").unwrap();
        let pre = hash_related_files(dir.path(), &[PathBuf::from("unchanged.go"), PathBuf::from("changed.go")]);
        std::fs::write(dir.path().join("changed.go"), "after").unwrap();
        std::fs::write(dir.path().join("new.go"), "new content").unwrap();

        let verified = verify_modified_files(
            dir.path(),
            &[PathBuf::from("unchanged.go"), PathBuf::from("changed.go"), PathBuf::from("new.go"), PathBuf::from("phantom.go")],
            &pre,
        );
        assert_eq!(verified, vec![PathBuf::from("changed.go"), PathBuf::from("new.go")]);
    }
}
