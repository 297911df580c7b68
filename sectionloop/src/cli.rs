//! CLI command definitions (spec §6).
//!
//! Invoking `section-loop <planspace> <codespace> --global-proposal <path>
//! --global-alignment <path>` with no subcommand runs the scheduler, mirroring
//! the teacher's `command: Option<Command>` pattern where `None` selects the
//! tool's primary action rather than an auxiliary one. `event-log` and
//! `status` are the auxiliary subcommands (SPEC_FULL §10).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// section-loop: hierarchical, pausable, two-phase multi-agent scheduler.
#[derive(Parser, Debug)]
#[command(name = "section-loop", about = "Section-loop scheduler", version)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(flatten)]
    pub run: RunArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Arguments for the primary (no-subcommand) invocation (spec §6).
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Root directory holding section specs, artifacts, and signals.
    pub planspace: Option<PathBuf>,

    /// Root directory of the codebase being changed.
    pub codespace: Option<PathBuf>,

    /// Path to the global proposal document.
    #[arg(long = "global-proposal")]
    pub global_proposal: Option<PathBuf>,

    /// Path to the global alignment document.
    #[arg(long = "global-alignment")]
    pub global_alignment: Option<PathBuf>,

    /// Name of the parent mailbox this run reports to, if any.
    #[arg(long)]
    pub parent: Option<String>,
}

impl RunArgs {
    pub fn into_invocation(self) -> Option<RunInvocation> {
        Some(RunInvocation {
            planspace: self.planspace?,
            codespace: self.codespace?,
            global_proposal: self.global_proposal?,
            global_alignment: self.global_alignment?,
            parent: self.parent,
        })
    }
}

/// A fully-resolved set of arguments for one scheduler run.
pub struct RunInvocation {
    pub planspace: PathBuf,
    pub codespace: PathBuf,
    pub global_proposal: PathBuf,
    pub global_alignment: PathBuf,
    pub parent: Option<String>,
}

/// Auxiliary subcommands (SPEC_FULL §10): event-log inspection and run status.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect or drive the durable event log directly.
    EventLog {
        /// Path to the run.db file.
        #[arg(long, default_value = "run.db")]
        db: PathBuf,

        #[command(subcommand)]
        command: EventLogCommand,
    },

    /// Print the latest pipeline-state lifecycle event and the per-section
    /// result table (ground truth: `td/src/cli.rs`'s `Status` subcommand).
    Status {
        /// Path to the run.db file.
        #[arg(long, default_value = "run.db")]
        db: PathBuf,
    },
}

/// Mirrors `eventlog::cli::Command` (spec §6: `init|register|unregister|
/// send|recv|drain|log|query|cleanup`); forwarded directly in `main`.
#[derive(Subcommand, Debug)]
pub enum EventLogCommand {
    Init,
    Register {
        r#box: String,
    },
    Unregister {
        r#box: String,
    },
    Send {
        r#box: String,
        #[arg(long)]
        from: Option<String>,
        body: String,
    },
    Recv {
        r#box: String,
        #[arg(long, default_value_t = 0)]
        timeout: u64,
    },
    Drain {
        r#box: String,
    },
    Log {
        kind: String,
        #[arg(long)]
        tag: Option<String>,
        body: String,
        #[arg(long)]
        agent: Option<String>,
    },
    Query {
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        since: Option<i64>,
        #[arg(long)]
        limit: Option<i64>,
    },
    Cleanup {
        #[arg(long)]
        r#box: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_primary_run_invocation() {
        let cli = Cli::parse_from([
            "section-loop",
            "/plan",
            "/code",
            "--global-proposal",
            "/plan/proposal.md",
            "--global-alignment",
            "/plan/alignment.md",
        ]);
        assert!(cli.command.is_none());
        let invocation = cli.run.into_invocation().expect("complete run args");
        assert_eq!(invocation.planspace, PathBuf::from("/plan"));
        assert_eq!(invocation.codespace, PathBuf::from("/code"));
        assert!(invocation.parent.is_none());
    }

    #[test]
    fn parses_parent_flag() {
        let cli = Cli::parse_from([
            "section-loop",
            "/plan",
            "/code",
            "--global-proposal",
            "/p.md",
            "--global-alignment",
            "/a.md",
            "--parent",
            "root-loop",
        ]);
        let invocation = cli.run.into_invocation().expect("complete run args");
        assert_eq!(invocation.parent.as_deref(), Some("root-loop"));
    }

    #[test]
    fn missing_run_args_has_no_invocation() {
        let cli = Cli::parse_from(["section-loop"]);
        assert!(cli.run.into_invocation().is_none());
    }

    #[test]
    fn parses_status_subcommand() {
        let cli = Cli::parse_from(["section-loop", "status", "--db", "/tmp/run.db"]);
        assert!(matches!(cli.command, Some(Command::Status { db }) if db == PathBuf::from("/tmp/run.db")));
    }

    #[test]
    fn parses_event_log_send() {
        let cli = Cli::parse_from(["section-loop", "event-log", "send", "_scheduler", "abort"]);
        assert!(matches!(
            cli.command,
            Some(Command::EventLog {
                command: EventLogCommand::Send { .. },
                ..
            })
        ));
    }
}
