//! Global coordinator (spec §4.7): runs bounded rounds of problem
//! collection, planning, batching, and re-alignment once Phase 2 finds a
//! section misaligned or a consequence note unacknowledged.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::alignment::Verdict;
use crate::artifacts;
use crate::config::Config;
use crate::control::{PipelineControl, Unwind};
use crate::dispatch::{AgentKind, DispatchOutcome, DispatchRequest, Dispatcher};
use crate::domain::{self, CoordinationGroup, CoordinationProblem, ProblemKind, Strategy};
use crate::mailbox::Mailbox;
use crate::prompts::PromptRenderer;

pub enum CoordinationOutcome {
    /// Every problem resolved, at or after the minimum round count.
    Converged,
    Unwind(Unwind),
    /// Stall budget exhausted past the minimum rounds; `fail:` was sent
    /// for every section still unresolved.
    Exhausted,
}

pub struct Coordinator<'a> {
    pub planspace: &'a Path,
    pub codespace: &'a Path,
    pub config: &'a Config,
    pub mailbox: Mailbox,
    pub control: &'a PipelineControl,
    pub prompts: &'a PromptRenderer,
}

impl<'a> Coordinator<'a> {
    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.config.agent_runner, self.mailbox.clone(), self.control, self.planspace, self.prompts)
    }

    /// Runs rounds until every problem clears, the round budget is spent,
    /// or the stall budget is spent past the minimum rounds (spec §4.7
    /// step 6). `misaligned` seeds the first round's problem set with any
    /// sections Phase 2's alignment sweep already found misaligned, keyed
    /// by section number to its judge's problem text.
    pub async fn run(&self, misaligned: &BTreeMap<String, String>, all_sections: &[String]) -> Result<CoordinationOutcome> {
        let cfg = &self.config.coordination;
        let mut round = 0u32;
        let mut stall = 0u32;
        // Seed with round 1's expected unresolved count so a first round
        // that fails to reduce it already counts as a stall (spec §4.7
        // step 6 / scenario 6: four constant-unresolved rounds must
        // escalate after round 2 and terminate after round 3).
        let mut previous_unresolved = misaligned.len();
        let mut current_misaligned = misaligned.clone();

        loop {
            round += 1;
            if let Some(unwind) = self.control.poll_control_messages().await? {
                return Ok(CoordinationOutcome::Unwind(unwind));
            }

            let problems = self.collect_problems(&current_misaligned, all_sections)?;
            self.persist_problems(&problems)?;

            if problems.is_empty() {
                if round > cfg.min_rounds {
                    return Ok(CoordinationOutcome::Converged);
                }
            }

            let unresolved = problems.len();
            if unresolved >= previous_unresolved {
                stall += 1;
            } else {
                stall = 0;
            }
            previous_unresolved = unresolved;

            if stall >= cfg.stall_escalate_at {
                self.escalate_model()?;
            }
            if stall >= cfg.stall_terminate_at && round > cfg.min_rounds {
                self.terminate_exhausted(&current_misaligned).await?;
                return Ok(CoordinationOutcome::Exhausted);
            }
            if round > cfg.max_rounds {
                self.terminate_exhausted(&current_misaligned).await?;
                return Ok(CoordinationOutcome::Exhausted);
            }
            if problems.is_empty() {
                // Below the minimum round count with nothing outstanding;
                // run another round anyway (spec §4.7's MIN_ROUNDS floor).
                continue;
            }

            let groups = self.plan_groups(&problems).await?;
            self.persist_groups(&groups)?;
            let batches = domain::batch_groups(groups);

            let coordinator_modified = self.execute_batches(&problems, batches).await?;
            current_misaligned = self.realign_affected(&problems, &coordinator_modified, all_sections).await?;
        }
    }

    fn persist_problems(&self, problems: &[CoordinationProblem]) -> Result<()> {
        let path = artifacts::coordination_problems_path(self.planspace);
        artifacts::ensure_parent(&path)?;
        std::fs::write(path, serde_json::to_string_pretty(problems)?).context("writing coordination problems")
    }

    fn persist_groups(&self, groups: &[CoordinationGroup]) -> Result<()> {
        let path = artifacts::coordination_groups_path(self.planspace);
        artifacts::ensure_parent(&path)?;
        std::fs::write(path, serde_json::to_string_pretty(groups)?).context("writing coordination groups")
    }

    fn escalate_model(&self) -> Result<()> {
        let path = artifacts::model_escalation_path(self.planspace);
        artifacts::ensure_parent(&path)?;
        std::fs::write(path, &self.config.agent_runner.fix_escalated_model).context("writing model escalation marker")
    }

    fn fix_model(&self) -> String {
        let path = artifacts::model_escalation_path(self.planspace);
        std::fs::read_to_string(path).unwrap_or_else(|_| self.config.agent_runner.fix_model.clone())
    }

    /// Problem collection (spec §4.7 step 1): one entry per misaligned
    /// section, plus one per consequence note whose target has not
    /// written a matching `note-ack-NN.json` acknowledging that note's
    /// stable id. Never infers acknowledgment from section-number order.
    fn collect_problems(&self, misaligned: &BTreeMap<String, String>, all_sections: &[String]) -> Result<Vec<CoordinationProblem>> {
        let mut problems = Vec::new();
        for (section, description) in misaligned {
            problems.push(CoordinationProblem {
                index: problems.len(),
                section: section.clone(),
                kind: ProblemKind::Misaligned,
                description: description.clone(),
                files: Vec::new(),
            });
        }

        let notes_dir = artifacts::notes_dir(self.planspace);
        if notes_dir.is_dir() {
            for entry in std::fs::read_dir(&notes_dir)? {
                let entry = entry?;
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else { continue };
                let Some(target) = target_section_of_note(name, all_sections) else { continue };
                let markdown = std::fs::read_to_string(entry.path())?;
                let Some(note_id) = crate::domain::ConsequenceNote::parse_note_id(&markdown) else { continue };
                if self.note_acknowledged(&target, &note_id)? {
                    continue;
                }
                problems.push(CoordinationProblem {
                    index: problems.len(),
                    section: target.clone(),
                    kind: ProblemKind::UnaddressedNote,
                    description: format!("unacknowledged consequence note {note_id} targeting section {target}"),
                    files: Vec::new(),
                });
            }
        }
        Ok(problems)
    }

    fn note_acknowledged(&self, target: &str, note_id: &str) -> Result<bool> {
        let path = artifacts::signals_dir(self.planspace).join(format!("note-ack-{target}.json"));
        let Ok(raw) = std::fs::read_to_string(&path) else { return Ok(false) };
        let ack: NoteAck = serde_json::from_str(&raw).unwrap_or_default();
        Ok(ack.acknowledged.iter().any(|a| a.note_id == note_id))
    }

    /// Planning (spec §4.7 step 2): dispatch the coordination planner and
    /// validate the resulting partition, falling back to one problem per
    /// group on any structural error.
    async fn plan_groups(&self, problems: &[CoordinationProblem]) -> Result<Vec<CoordinationGroup>> {
        let prompt_file = artifacts::coordination_dir(self.planspace).join("planner-prompt.md");
        let body = format!(
            "# Coordination planning\n\nGroup the following problems into batches. Respond with JSON \
             `{{\"groups\": [{{\"problems\": [int], \"reason\": string, \"strategy\": \"sequential\"|\"parallel\"}}]}}` \
             whose `problems` indices partition `[0, {})` exactly.\n\n## Problems\n\n{}\n",
            problems.len(),
            serde_json::to_string_pretty(problems).unwrap_or_default(),
        );
        artifacts::ensure_parent(&prompt_file)?;
        std::fs::write(&prompt_file, body)?;
        let output_file = artifacts::coordination_dir(self.planspace).join("planner-output.md");
        let req = DispatchRequest {
            kind: AgentKind::CoordinationPlanner,
            model: self.config.agent_runner.coordination_planner_model.clone(),
            prompt_file,
            role_file: None,
            project: Some(self.codespace.to_path_buf()),
            agent_name: None,
            output_file,
        };
        let output = match self.dispatcher().dispatch("_coordinator", req).await? {
            DispatchOutcome::Completed { output } => output,
            DispatchOutcome::AlignmentChangedPending => return Ok(domain::one_problem_per_group(problems)),
        };

        let parsed = output.find('{').and_then(|start| serde_json::from_str::<PlannerReply>(&output[start..]).ok());
        let Some(reply) = parsed else {
            return Ok(domain::one_problem_per_group(problems));
        };
        let mut groups: Vec<CoordinationGroup> = reply
            .groups
            .into_iter()
            .map(|g| CoordinationGroup {
                problems: g.problems,
                strategy: g.strategy,
                reason: g.reason,
                files: BTreeSet::new(),
            })
            .collect();
        if domain::validate_partition(&groups, problems.len()).is_err() {
            return Ok(domain::one_problem_per_group(problems));
        }
        for group in &mut groups {
            group.derive_files(problems);
        }
        Ok(groups)
    }

    /// Batch execution (spec §4.7 steps 3-4): batches with a single group
    /// run sequentially; batches with multiple groups run their fixes
    /// concurrently, capped at `concurrency.coordinator_fix_workers`.
    /// Returns every file any fix or bridge agent reported modifying,
    /// for the inputs-hash cache.
    async fn execute_batches(&self, problems: &[CoordinationProblem], batches: Vec<Vec<CoordinationGroup>>) -> Result<Vec<PathBuf>> {
        let width = self.config.concurrency.coordinator_fix_workers.max(1) as usize;
        let mut modified = Vec::new();
        for batch in batches {
            if batch.len() == 1 {
                modified.extend(self.execute_group(problems, &batch[0]).await?);
                continue;
            }
            for chunk in batch.chunks(width) {
                let futures: Vec<_> = chunk.iter().map(|group| self.execute_group(problems, group)).collect();
                let results = futures::future::join_all(futures).await;
                for result in results {
                    modified.extend(result?);
                }
            }
        }
        Ok(modified)
    }

    /// Runs one coordination group: a bridge agent first when the group
    /// spans at least two sections and at least one file (spec §4.7 step
    /// 4), then the fix agent. Returns the files the fix agent reported
    /// touching.
    async fn execute_group(&self, problems: &[CoordinationProblem], group: &CoordinationGroup) -> Result<Vec<PathBuf>> {
        let sections: BTreeSet<&str> = group.problems.iter().filter_map(|&i| problems.get(i)).map(|p| p.section.as_str()).collect();
        let descriptions: Vec<String> = group
            .problems
            .iter()
            .filter_map(|&i| problems.get(i))
            .map(|p| format!("- section {}: {}", p.section, p.description))
            .collect();
        let group_tag = group.problems.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("-");

        if sections.len() >= 2 && !group.files.is_empty() {
            self.dispatch_bridge(&group_tag, &sections, &descriptions).await?;
        }

        let model = self.fix_model();
        let prompt_file = artifacts::coordination_dir(self.planspace).join(format!("fix-{group_tag}.md"));
        let body = format!(
            "# Coordinator fix\n\nStrategy: {:?}\nReason: {}\n\n## Problems\n\n{}\n\n## Files\n\n{}\n",
            group.strategy,
            group.reason,
            descriptions.join("\n"),
            group.files.iter().map(|f| format!("- `{}`", f.display())).collect::<Vec<_>>().join("\n"),
        );
        artifacts::ensure_parent(&prompt_file)?;
        std::fs::write(&prompt_file, body)?;
        let output_file = artifacts::coordination_dir(self.planspace).join(format!("fix-{group_tag}-output.md"));
        let req = DispatchRequest {
            kind: AgentKind::FixAgent,
            model,
            prompt_file,
            role_file: None,
            project: Some(self.codespace.to_path_buf()),
            agent_name: Some(format!("coordination-fix-{group_tag}")),
            output_file,
        };
        let output = match self.dispatcher().dispatch("_coordinator", req).await? {
            DispatchOutcome::Completed { output } => output,
            DispatchOutcome::AlignmentChangedPending => return Ok(Vec::new()),
        };
        self.mailbox
            .send("_parent", "_scheduler", &format!("summary:coordination-fix:{group_tag}:{} sections", sections.len()))
            .await?;
        Ok(parse_fixed_files(&output, &group.files))
    }

    async fn dispatch_bridge(&self, group_tag: &str, sections: &BTreeSet<&str>, descriptions: &[String]) -> Result<()> {
        let prompt_file = artifacts::coordination_dir(self.planspace).join(format!("bridge-{group_tag}.md"));
        let body = format!(
            "# Bridge agent\n\nSections {} are jointly affected. Write a contract patch reconciling \
             their interfaces and a consequence note for each section below describing what it must \
             accommodate.\n\n## Problems\n\n{}\n",
            sections.iter().copied().collect::<Vec<_>>().join(", "),
            descriptions.join("\n"),
        );
        artifacts::ensure_parent(&prompt_file)?;
        std::fs::write(&prompt_file, body)?;
        let output_file = artifacts::coordination_dir(self.planspace).join(format!("bridge-{group_tag}-output.md"));
        let req = DispatchRequest {
            kind: AgentKind::BridgeAgent,
            model: self.config.agent_runner.bridge_model.clone(),
            prompt_file,
            role_file: None,
            project: Some(self.codespace.to_path_buf()),
            agent_name: Some(format!("coordination-bridge-{group_tag}")),
            output_file,
        };
        self.dispatcher().dispatch("_coordinator", req).await?;
        Ok(())
    }

    /// Re-alignment (spec §4.7 step 5): for every section touched by this
    /// round's problems, hash the alignment excerpt, integration
    /// proposal, incoming notes, and the coordinator-modified files;
    /// skip re-running the judge if the hash is unchanged from last
    /// round's cache. Returns the sections still misaligned, keyed to
    /// the judge's problem text, for the next round's seed.
    async fn realign_affected(&self, problems: &[CoordinationProblem], coordinator_modified: &[PathBuf], _all_sections: &[String]) -> Result<BTreeMap<String, String>> {
        let affected: BTreeSet<&str> = problems.iter().map(|p| p.section.as_str()).collect();
        let mut still_misaligned = BTreeMap::new();

        for section in affected {
            let hash = self.compute_inputs_hash(section, coordinator_modified)?;
            let cache_path = artifacts::inputs_hash_path(self.planspace, section);
            let cached = std::fs::read_to_string(&cache_path).ok();
            if cached.as_deref() == Some(hash.as_str()) {
                continue;
            }
            artifacts::ensure_parent(&cache_path)?;
            std::fs::write(&cache_path, &hash)?;

            match self.run_alignment_judge(section).await? {
                Verdict::Aligned => {}
                Verdict::Problems(text) => {
                    still_misaligned.insert(section.to_string(), text);
                }
                Verdict::Underspecified(reason) => {
                    still_misaligned.insert(section.to_string(), reason);
                }
                Verdict::InvalidFrame => {
                    still_misaligned.insert(section.to_string(), "alignment judge returned an invalid frame twice".to_string());
                }
            }
        }
        Ok(still_misaligned)
    }

    fn compute_inputs_hash(&self, section: &str, coordinator_modified: &[PathBuf]) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(std::fs::read_to_string(artifacts::alignment_excerpt_path(self.planspace, section)).unwrap_or_default());
        hasher.update(std::fs::read_to_string(artifacts::integration_proposal_path(self.planspace, section)).unwrap_or_default());
        for entry in std::fs::read_dir(artifacts::notes_dir(self.planspace)).into_iter().flatten().flatten() {
            if entry.file_name().to_string_lossy().ends_with(&format!("-to-{section}.md")) {
                hasher.update(std::fs::read_to_string(entry.path()).unwrap_or_default());
            }
        }
        for file in coordinator_modified {
            hasher.update(std::fs::read(self.codespace.join(file)).unwrap_or_default());
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Single alignment-judge dispatch with up to two TIMEOUT-retries on
    /// an invalid frame (spec §4.7 step 5), independent of the section
    /// engine's proposal/implementation loop since coordination re-checks
    /// alignment without re-running either stage.
    async fn run_alignment_judge(&self, section: &str) -> Result<Verdict> {
        let mut retries = 0u32;
        loop {
            let prompt_file = artifacts::coordination_dir(self.planspace).join(format!("realign-{section}-{retries}.md"));
            self.prompts.render_to_file(
                "impl-align",
                &json!({
                    "stage": "coordination",
                    "section": section,
                    "alignment_excerpt": std::fs::read_to_string(artifacts::alignment_excerpt_path(self.planspace, section)).unwrap_or_default(),
                    "proposal_excerpt": std::fs::read_to_string(artifacts::proposal_excerpt_path(self.planspace, section)).unwrap_or_default(),
                    "candidate_document": std::fs::read_to_string(artifacts::integration_proposal_path(self.planspace, section)).unwrap_or_default(),
                }),
                &prompt_file,
            )?;
            let output_file = artifacts::coordination_dir(self.planspace).join(format!("realign-{section}-{retries}-output.md"));
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
                DispatchOutcome::AlignmentChangedPending => return Ok(Verdict::Underspecified("alignment_changed pending".to_string())),
            };
            match crate::alignment::parse_verdict(&output) {
                Verdict::InvalidFrame if retries < 2 => {
                    retries += 1;
                    continue;
                }
                other => return Ok(other),
            }
        }
    }

    /// Termination without `complete` (spec §4.7 step 6): emits
    /// `fail:<section>:coordination_exhausted:<summary>` for every
    /// section still unresolved.
    async fn terminate_exhausted(&self, still_misaligned: &BTreeMap<String, String>) -> Result<()> {
        for (section, summary) in still_misaligned {
            self.mailbox
                .send("_parent", "_scheduler", &format!("fail:{section}:coordination_exhausted:{summary}"))
                .await?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PlannerReply {
    groups: Vec<PlannerGroup>,
}

#[derive(Debug, Deserialize)]
struct PlannerGroup {
    problems: Vec<usize>,
    #[serde(default)]
    reason: String,
    #[serde(default = "default_strategy")]
    strategy: Strategy,
}

fn default_strategy() -> Strategy {
    Strategy::Parallel
}

#[derive(Debug, Default, Deserialize)]
struct NoteAck {
    #[serde(default)]
    acknowledged: Vec<NoteAckEntry>,
}

#[derive(Debug, Deserialize)]
struct NoteAckEntry {
    note_id: String,
}

fn target_section_of_note(file_name: &str, all_sections: &[String]) -> Option<String> {
    let stem = file_name.strip_prefix("from-")?.strip_suffix(".md")?;
    all_sections.iter().find(|s| stem.ends_with(&format!("-to-{s}"))).cloned()
}

/// Parses a `## Modified Files` section the fix agent reports, falling
/// back to the group's known file set if the agent's reply omits one.
fn parse_fixed_files(output: &str, group_files: &BTreeSet<PathBuf>) -> Vec<PathBuf> {
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
    if files.is_empty() {
        files.extend(group_files.iter().cloned());
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_section_matches_longest_suffix() {
        let sections = vec!["01".to_string(), "02".to_string()];
        assert_eq!(target_section_of_note("from-01-to-02.md", &sections), Some("02".to_string()));
        assert_eq!(target_section_of_note("from-01-to-99.md", &sections), None);
    }

    #[test]
    fn parses_fixed_files_falls_back_to_group_files() {
        let group_files: BTreeSet<PathBuf> = [PathBuf::from("a.go")].into_iter().collect();
        assert_eq!(parse_fixed_files("no structured section here", &group_files), vec![PathBuf::from("a.go")]);
        assert_eq!(
            parse_fixed_files("## Modified Files\n- b.go\n", &group_files),
            vec![PathBuf::from("b.go")]
        );
    }

    /// Inputs-hash determinism (spec §8): recomputing over unchanged
    /// alignment excerpt, integration proposal, notes, and coordinator-
    /// modified files yields the same digest.
    #[test]
    fn inputs_hash_is_deterministic_over_unchanged_inputs() {
        let planspace = tempfile::tempdir().unwrap();
        let codespace = tempfile::tempdir().unwrap();
        let plan = planspace.path();
        let code = codespace.path();

        std::fs::create_dir_all(artifacts::sections_dir(plan)).unwrap();
        std::fs::write(artifacts::alignment_excerpt_path(plan, "01"), "alignment excerpt body").unwrap();
        artifacts::ensure_parent(&artifacts::integration_proposal_path(plan, "01")).unwrap();
        std::fs::write(artifacts::integration_proposal_path(plan, "01"), "integration proposal body").unwrap();
        std::fs::create_dir_all(artifacts::notes_dir(plan)).unwrap();
        std::fs::write(code.join("core.go"), "package core").unwrap();

        let db_path = plan.join("run.db");
        let store = std::sync::Arc::new(eventlog::Store::open(&db_path).unwrap());
        let mailbox = Mailbox::new(store);
        let control = PipelineControl::new(mailbox.clone(), plan.to_path_buf());
        let prompts = PromptRenderer::new(plan);
        let config = Config::default();

        let coordinator = Coordinator {
            planspace: plan,
            codespace: code,
            config: &config,
            mailbox: mailbox.clone(),
            control: &control,
            prompts: &prompts,
        };

        let modified = vec![PathBuf::from("core.go")];
        let first = coordinator.compute_inputs_hash("01", &modified).unwrap();
        let second = coordinator.compute_inputs_hash("01", &modified).unwrap();
        assert_eq!(first, second);

        std::fs::write(code.join("core.go"), "package core changed").unwrap();
        let third = coordinator.compute_inputs_hash("01", &modified).unwrap();
        assert_ne!(first, third);
    }
}
