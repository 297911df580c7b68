//! section-loop — a hierarchical, pausable, two-phase scheduler that
//! drives a multi-agent LLM workforce through the implementation of a
//! software change described by a global proposal and alignment
//! document.
//!
//! # Modules
//!
//! - [`scheduler`] - outer Phase 1 / Phase 2 loop
//! - [`section`] - per-section state machine (`S0`-`S7`)
//! - [`coordinator`] - global cross-section coordination loop
//! - [`cross_section`] - snapshotting, contract summaries, impact analysis, notes
//! - [`dispatch`] - agent subprocess dispatch and monitor lifecycle
//! - [`control`] - pause/resume and abort/alignment_changed control plane
//! - [`mailbox`] - durable mailbox adapter over the event log
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod alignment;
pub mod artifacts;
pub mod cli;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod cross_section;
pub mod decisions;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod mailbox;
pub mod paths;
pub mod prompts;
pub mod registry;
pub mod scheduler;
pub mod section;
pub mod signals;
pub mod todos;
pub mod traceability;

pub use config::Config;
pub use control::{PauseOutcome, PipelineControl, PipelineState, Unwind};
pub use coordinator::{CoordinationOutcome, Coordinator};
pub use dispatch::{AgentKind, DispatchOutcome, DispatchRequest, Dispatcher};
pub use domain::{Section, SectionResult};
pub use mailbox::Mailbox;
pub use prompts::PromptRenderer;
pub use scheduler::{RunOutcome, Scheduler};
pub use section::{SectionEngine, SectionOutcome};
