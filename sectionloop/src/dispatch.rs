//! Agent dispatcher (spec §4.3, §9): spawns an `agents` subprocess with
//! a prompt file and optional role file, enforces the wall-clock
//! timeout, and when the agent kind calls for one, manages a per-agent
//! monitor subprocess watching the agent's narration mailbox.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use eyre::{Context, Result};
use serde_json::json;
use tokio::process::{Child, Command};

use crate::artifacts;
use crate::config::AgentRunnerConfig;
use crate::control::PipelineControl;
use crate::mailbox::Mailbox;
use crate::prompts::PromptRenderer;

/// Polymorphism over agent kinds (spec §9 "Polymorphism over agent
/// kinds"): kinds differ only in whether a monitor is attached. The
/// alignment-judge variant always carries `attach_monitor = false` — its
/// prompts intentionally omit narration instructions, so there is
/// nothing for a monitor to watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Setup,
    Proposer,
    AlignmentJudge,
    ImplementationStrategist,
    ImpactAnalyzer,
    CoordinationPlanner,
    FixAgent,
    BridgeAgent,
    ReExplorer,
    ToolRegistrar,
    StateAdjudicator,
}

impl AgentKind {
    pub fn attach_monitor(self) -> bool {
        matches!(
            self,
            AgentKind::Setup
                | AgentKind::Proposer
                | AgentKind::ImplementationStrategist
                | AgentKind::FixAgent
                | AgentKind::BridgeAgent
                | AgentKind::ReExplorer
        )
    }
}

pub struct DispatchRequest {
    pub kind: AgentKind,
    pub model: String,
    pub prompt_file: PathBuf,
    pub role_file: Option<PathBuf>,
    pub project: Option<PathBuf>,
    /// Named agent context; when set, a narration mailbox is registered
    /// and (if `kind.attach_monitor()`) a monitor is spawned to watch it.
    pub agent_name: Option<String>,
    pub output_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Normal completion; `output` is stdout+stderr (plus any appended
    /// `LOOP_DETECTED:` lines from the monitor).
    Completed { output: String },
    /// `alignment_changed` was pending; the agent was never spawned.
    AlignmentChangedPending,
}

pub struct Dispatcher<'a> {
    config: &'a AgentRunnerConfig,
    mailbox: Mailbox,
    control: &'a PipelineControl,
    planspace: &'a Path,
    prompts: &'a PromptRenderer,
}

impl<'a> Dispatcher<'a> {
    pub fn new(config: &'a AgentRunnerConfig, mailbox: Mailbox, control: &'a PipelineControl, planspace: &'a Path, prompts: &'a PromptRenderer) -> Self {
        Self { config, mailbox, control, planspace, prompts }
    }

    pub async fn dispatch(&self, section: &str, req: DispatchRequest) -> Result<DispatchOutcome> {
        if self.control.alignment_changed_pending() {
            return Ok(DispatchOutcome::AlignmentChangedPending);
        }

        let dispatch_start_id = self.last_event_id().await?;

        if let Some(name) = &req.agent_name {
            self.mailbox.register(name).await?;
            self.mailbox.log("lifecycle", Some(&format!("dispatch:{name}")), "start", Some(name)).await?;
        }
        self.mailbox
            .send(&format!("dispatch:{section}"), "_scheduler", &format!("dispatch:{section}"))
            .await?;

        let monitor = if req.kind.attach_monitor() {
            match &req.agent_name {
                Some(name) => Some(self.spawn_monitor(name)?),
                None => None,
            }
        } else {
            None
        };

        let mut output = self.run_agent(&req).await.unwrap_or_else(|e| format!("TIMEOUT: {e}"));

        if let Some(name) = &req.agent_name {
            if req.kind.attach_monitor() {
                self.mailbox.send(name, "_scheduler", "agent-finished").await?;
                if let Some(mut monitor) = monitor {
                    let budget = Duration::from_secs(self.config.monitor_timeout_secs);
                    if tokio::time::timeout(budget, monitor.wait()).await.is_err() {
                        tracing::warn!(agent = %name, "monitor subprocess did not exit within budget, terminating");
                        let _ = monitor.kill().await;
                    }
                }
                let monitor_signals = self
                    .mailbox
                    .query(Some("signal"), Some(name), Some(dispatch_start_id), None)
                    .await?;
                for event in monitor_signals {
                    output.push_str(&format!("\nLOOP_DETECTED: {}", event.body));
                    self.mailbox.log("signal", Some(name), &event.body, Some("_scheduler")).await?;
                }
            }
            self.mailbox.unregister(name).await?;
        }

        std::fs::write(&req.output_file, &output).context("writing agent output file")?;
        Ok(DispatchOutcome::Completed { output })
    }

    async fn last_event_id(&self) -> Result<i64> {
        let events = self.mailbox.query(None, None, None, None).await?;
        Ok(events.last().map(|e| e.id).unwrap_or(0))
    }

    async fn run_agent(&self, req: &DispatchRequest) -> Result<String> {
        let mut command = Command::new(&self.config.binary);
        command.arg("--model").arg(&req.model);
        if let Some(role_file) = &req.role_file {
            command.arg("--agent-file").arg(role_file);
        }
        if let Some(project) = &req.project {
            command.arg("--project").arg(project);
        }
        command.arg("--file").arg(&req.prompt_file);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = command.spawn().context("spawning agent subprocess")?;
        let timeout = Duration::from_secs(self.config.dispatch_timeout_secs);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| eyre::eyre!("dispatch timed out after {}s", self.config.dispatch_timeout_secs))?
            .context("waiting for agent subprocess")?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(combined)
    }

    /// Spawns the per-agent monitor as a genuine second subprocess (spec
    /// §4.3 step 2, §5: "exactly two subprocesses per monitored
    /// dispatch"): a cheaper model instance given enough context (the
    /// event log database, the narration mailbox name, the stall
    /// threshold) to watch `agent_name`'s narration via the `eventlog`
    /// CLI and report loops/stalls as signal events. The caller awaits
    /// the returned child up to `monitor_timeout_secs` after the agent
    /// finishes, killing it if it hasn't exited by then.
    fn spawn_monitor(&self, agent_name: &str) -> Result<Child> {
        let prompt_file = artifacts::artifacts_root(self.planspace).join(format!("monitor-{agent_name}.md"));
        self.prompts
            .render_to_file(
                "monitor",
                &json!({
                    "agent_name": agent_name,
                    "db_path": self.mailbox.store().path().display().to_string(),
                    "eventlog_binary": "eventlog",
                    "stall_secs": self.config.monitor_stall_secs,
                }),
                &prompt_file,
            )
            .context("rendering monitor prompt")?;

        let mut command = Command::new(&self.config.binary);
        command.arg("--model").arg(&self.config.monitor_model);
        command.arg("--file").arg(&prompt_file);
        command.stdout(Stdio::null()).stderr(Stdio::null());
        command.spawn().context("spawning monitor subprocess")
    }
}

/// Wraps an agent file path with a role-file convention: `<role>.role.md`
/// alongside the prompt, when present.
pub fn role_file_for(prompts_dir: &Path, role: &str) -> Option<PathBuf> {
    let candidate = prompts_dir.join(format!("{role}.role.md"));
    candidate.exists().then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_judge_never_attaches_a_monitor() {
        assert!(!AgentKind::AlignmentJudge.attach_monitor());
    }

    #[test]
    fn proposer_and_implementation_attach_monitors() {
        assert!(AgentKind::Proposer.attach_monitor());
        assert!(AgentKind::ImplementationStrategist.attach_monitor());
        assert!(AgentKind::FixAgent.attach_monitor());
        assert!(AgentKind::BridgeAgent.attach_monitor());
    }

    #[test]
    fn analytic_kinds_never_attach_monitors() {
        assert!(!AgentKind::ImpactAnalyzer.attach_monitor());
        assert!(!AgentKind::CoordinationPlanner.attach_monitor());
        assert!(!AgentKind::StateAdjudicator.attach_monitor());
        assert!(!AgentKind::ToolRegistrar.attach_monitor());
    }
}
