//! Pipeline-control plane (spec §4.2): `abort`/`alignment_changed`
//! control messages, pause/resume lifecycle, and the re-enqueue
//! discipline that keeps a state machine from losing a message it
//! can't yet handle.

use std::path::{Path, PathBuf};

use eyre::Result;
use glob::glob;

use crate::artifacts;
use crate::mailbox::Mailbox;

pub const SCHEDULER_BOX: &str = "_scheduler";

/// A control message recognized by the pipeline (spec §4.2). Anything
/// else read off the scheduler's mailbox is a non-control message and is
/// re-delivered, never acted on here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Abort,
    AlignmentChanged,
}

impl ControlMessage {
    fn parse(body: &str) -> Option<Self> {
        match body {
            "abort" => Some(Self::Abort),
            "alignment_changed" => Some(Self::AlignmentChanged),
            _ => None,
        }
    }
}

/// Sentinel returned by a dispatch that observed `alignment_changed`
/// pending instead of spawning an agent (spec §4.3 step 1).
pub const ALIGNMENT_CHANGED_PENDING: &str = "ALIGNMENT_CHANGED_PENDING";

/// Unwind signal threaded up through every suspension point once
/// `alignment_changed` or `abort` is observed. The caller must unwind to
/// the outermost loop (spec §4.2 point 4) before doing new work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unwind {
    Abort,
    AlignmentChanged,
}

pub struct PipelineControl {
    mailbox: Mailbox,
    planspace: PathBuf,
}

impl PipelineControl {
    pub fn new(mailbox: Mailbox, planspace: PathBuf) -> Self {
        Self { mailbox, planspace }
    }

    fn pending_flag_path(&self) -> PathBuf {
        artifacts::pending_flag_path(&self.planspace)
    }

    pub fn alignment_changed_pending(&self) -> bool {
        self.pending_flag_path().exists()
    }

    /// Checked (and cleared) at every loop boundary (spec §4.2).
    pub fn clear_alignment_changed_pending(&self) -> Result<()> {
        let path = self.pending_flag_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Non-blocking drain of the scheduler's own mailbox. Control
    /// messages are handled inline (`alignment_changed` runs its
    /// on-receipt steps); everything else is re-enqueued so a state
    /// machine that can't yet consume it doesn't lose it.
    pub async fn poll_control_messages(&self) -> Result<Option<Unwind>> {
        let pending = self.mailbox.drain(SCHEDULER_BOX).await?;
        let mut unwind = None;
        for body in pending {
            match ControlMessage::parse(&body) {
                Some(ControlMessage::Abort) => unwind = Some(Unwind::Abort),
                Some(ControlMessage::AlignmentChanged) => {
                    self.on_alignment_changed().await?;
                    if unwind.is_none() {
                        unwind = Some(Unwind::AlignmentChanged);
                    }
                }
                None => {
                    self.mailbox.send(SCHEDULER_BOX, "_pipeline_control", &body).await?;
                }
            }
            if unwind == Some(Unwind::Abort) {
                break;
            }
        }
        Ok(unwind)
    }

    /// On `alignment_changed` (spec §4.2): delete every excerpt, touch
    /// the pending flag, log the lifecycle transition.
    async fn on_alignment_changed(&self) -> Result<()> {
        delete_excerpts(&self.planspace)?;
        let flag = self.pending_flag_path();
        if let Some(parent) = flag.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&flag, "")?;
        self.mailbox
            .log("lifecycle", Some("alignment-changed"), "pending", None)
            .await?;
        Ok(())
    }

    /// Blocking pause: sends `pause:...`, then blocks indefinitely on
    /// recv, honoring `abort` (returns) and `alignment_changed` (sets the
    /// flag and keeps waiting). Returns the resume payload.
    pub async fn pause_for_parent(&self, reason_prefix: &str, description: &str) -> Result<PauseOutcome> {
        self.mailbox
            .send("_parent", SCHEDULER_BOX, &format!("pause:{reason_prefix}:{description}"))
            .await?;
        self.mailbox
            .log("lifecycle", Some("pipeline-state"), "paused", Some(SCHEDULER_BOX))
            .await?;

        loop {
            let Some(body) = self.mailbox.recv(SCHEDULER_BOX, 0).await? else {
                continue;
            };
            match ControlMessage::parse(&body) {
                Some(ControlMessage::Abort) => return Ok(PauseOutcome::Aborted),
                Some(ControlMessage::AlignmentChanged) => {
                    self.on_alignment_changed().await?;
                    continue;
                }
                None => {
                    if let Some(payload) = body.strip_prefix("resume:") {
                        self.mailbox
                            .log("lifecycle", Some("pipeline-state"), "running", Some(SCHEDULER_BOX))
                            .await?;
                        return Ok(PauseOutcome::Resumed(payload.to_string()));
                    }
                    // Not a resume and not a control message: buffer it.
                    self.mailbox.send(SCHEDULER_BOX, "_pipeline_control", &body).await?;
                }
            }
        }
    }

    /// Reads the latest `pipeline-state` lifecycle event (spec §11.10),
    /// defaulting to `running` when absent.
    pub async fn check_pipeline_state(&self) -> Result<PipelineState> {
        let events = self.mailbox.query(Some("lifecycle"), Some("pipeline-state"), None, None).await?;
        Ok(match events.last().map(|e| e.body.as_str()) {
            Some("paused") => PipelineState::Paused,
            _ => PipelineState::Running,
        })
    }

    /// Buffers non-abort, non-alignment-changed messages while the
    /// pipeline-state lifecycle is `paused`, replaying them on resume by
    /// re-sending to the scheduler's own mailbox (spec §4.2).
    pub async fn wait_if_paused(&self) -> Result<Option<Unwind>> {
        if self.check_pipeline_state().await? != PipelineState::Paused {
            return Ok(None);
        }
        let mut buffered = Vec::new();
        loop {
            let Some(body) = self.mailbox.recv(SCHEDULER_BOX, 0).await? else {
                continue;
            };
            match ControlMessage::parse(&body) {
                Some(ControlMessage::Abort) => return Ok(Some(Unwind::Abort)),
                Some(ControlMessage::AlignmentChanged) => {
                    self.on_alignment_changed().await?;
                    return Ok(Some(Unwind::AlignmentChanged));
                }
                None if body.starts_with("resume:") => break,
                None => buffered.push(body),
            }
        }
        for body in buffered {
            self.mailbox.send(SCHEDULER_BOX, "_pipeline_control", &body).await?;
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseOutcome {
    Resumed(String),
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Paused,
}

fn delete_excerpts(planspace: &Path) -> Result<()> {
    let pattern = planspace.join("artifacts/sections/section-*-proposal-excerpt.md");
    delete_glob(&pattern)?;
    let pattern = planspace.join("artifacts/sections/section-*-alignment-excerpt.md");
    delete_glob(&pattern)?;
    Ok(())
}

fn delete_glob(pattern: &Path) -> Result<()> {
    for entry in glob(&pattern.to_string_lossy())? {
        let path = entry?;
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_parses_only_recognized_bodies() {
        assert_eq!(ControlMessage::parse("abort"), Some(ControlMessage::Abort));
        assert_eq!(ControlMessage::parse("alignment_changed"), Some(ControlMessage::AlignmentChanged));
        assert_eq!(ControlMessage::parse("resume:choose-LRU"), None);
        assert_eq!(ControlMessage::parse("summary:setup:01:hi"), None);
    }
}
