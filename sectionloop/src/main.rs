//! section-loop CLI entry point.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, FromArgMatches};
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use sectionloop::cli::{Cli, Command, EventLogCommand};
use sectionloop::config::Config;
use sectionloop::control::PipelineControl;
use sectionloop::mailbox::Mailbox;
use sectionloop::prompts::PromptRenderer;
use sectionloop::scheduler::{RunOutcome, Scheduler};

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("section-loop")
        .join("logs");

    fs::create_dir_all(&log_dir).context("failed to create log directory")?;

    let level = match cli_log_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some("INFO") => tracing::Level::INFO,
        Some(other) => {
            eprintln!("Warning: unknown log level '{other}', defaulting to INFO");
            tracing::Level::INFO
        }
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("section-loop.log")).context("failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command();
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    setup_logging(cli.log_level.as_deref()).context("failed to set up logging")?;

    let config = Config::load(cli.config.as_ref()).context("failed to load configuration")?;
    debug!(binary = %config.agent_runner.binary, "loaded config");

    match cli.command {
        Some(Command::EventLog { db, command }) => cmd_event_log(&db, command),
        Some(Command::Status { db }) => cmd_status(&db).await,
        None => match cli.run.into_invocation() {
            Some(invocation) => cmd_run(&config, invocation).await,
            None => {
                eprintln!(
                    "error: the following required arguments were not provided: <PLANSPACE> <CODESPACE> --global-proposal <PATH> --global-alignment <PATH>"
                );
                std::process::exit(1);
            }
        },
    }
}

/// Wires CLI parsing into the outer scheduler (spec §6) and returns the
/// process exit path: 0 on a clean `complete`, otherwise a normal exit
/// after the scheduler has already emitted its own `fail:*`/`pause:*` mail.
async fn cmd_run(config: &Config, invocation: sectionloop::cli::RunInvocation) -> Result<()> {
    let sectionloop::cli::RunInvocation {
        planspace,
        codespace,
        global_proposal,
        global_alignment,
        parent,
    } = invocation;

    if !planspace.is_dir() {
        eprintln!("error: planspace {} is not a directory", planspace.display());
        std::process::exit(1);
    }
    if !codespace.is_dir() {
        eprintln!("error: codespace {} is not a directory", codespace.display());
        std::process::exit(1);
    }
    if !global_proposal.is_file() {
        eprintln!("error: global proposal {} does not exist", global_proposal.display());
        std::process::exit(1);
    }
    if !global_alignment.is_file() {
        eprintln!("error: global alignment {} does not exist", global_alignment.display());
        std::process::exit(1);
    }

    info!(planspace = %planspace.display(), codespace = %codespace.display(), parent = ?parent, "starting section-loop run");

    let db_path = planspace.join(&config.storage.event_log_filename);
    let store = eventlog::Store::open(&db_path).context("opening event log")?;
    let store = Arc::new(store);
    let mailbox = Mailbox::new(store);

    mailbox.register(sectionloop::control::SCHEDULER_BOX).await?;
    if let Some(parent_box) = &parent {
        mailbox.register(parent_box).await.context("registering parent mailbox")?;
    }

    let control = PipelineControl::new(mailbox.clone(), planspace.clone());
    let prompts = PromptRenderer::new(&planspace);

    let scheduler = Scheduler {
        planspace: &planspace,
        codespace: &codespace,
        config,
        mailbox: mailbox.clone(),
        control: &control,
        prompts: &prompts,
        global_proposal_path: global_proposal,
        global_alignment_path: global_alignment,
    };

    let outcome = scheduler.run().await.context("scheduler run failed")?;

    match outcome {
        RunOutcome::Complete => {
            info!("run complete");
            std::process::exit(0);
        }
        RunOutcome::Aborted => {
            warn!("run aborted");
            std::process::exit(0);
        }
        RunOutcome::Incomplete => {
            info!("run ended incomplete (paused or coordination exhausted)");
            std::process::exit(0);
        }
    }
}

/// Forwards to the same operations the `eventlog` binary exposes
/// directly, so a run's database can be inspected without a second
/// binary on `PATH` (spec §6).
fn cmd_event_log(db: &std::path::Path, command: EventLogCommand) -> Result<()> {
    let store = eventlog::Store::open(db).context("opening event log")?;
    match command {
        EventLogCommand::Init => println!("initialized {}", db.display()),
        EventLogCommand::Register { r#box } => {
            store.register(&r#box)?;
            println!("registered {box}");
        }
        EventLogCommand::Unregister { r#box } => {
            store.unregister(&r#box)?;
            println!("unregistered {box}");
        }
        EventLogCommand::Send { r#box, from, body } => {
            store.send(&r#box, from.as_deref(), &body)?;
        }
        EventLogCommand::Recv { r#box, timeout } => match store.recv(&r#box, timeout)? {
            eventlog::RecvResult::Message(body) => println!("{body}"),
            eventlog::RecvResult::Timeout => {
                println!("TIMEOUT");
                std::process::exit(1);
            }
        },
        EventLogCommand::Drain { r#box } => {
            for body in store.drain(&r#box)? {
                println!("{body}");
            }
        }
        EventLogCommand::Log { kind, tag, body, agent } => {
            let id = store.log(&kind, tag.as_deref(), &body, agent.as_deref())?;
            println!("{id}");
        }
        EventLogCommand::Query { kind, tag, since, limit } => {
            for e in store.query(kind.as_deref(), tag.as_deref(), since, limit)? {
                println!(
                    "{}|{}|{}|{}|{}|{}",
                    e.id,
                    e.ts,
                    e.kind,
                    e.tag.unwrap_or_default(),
                    e.body,
                    e.agent.unwrap_or_default()
                );
            }
        }
        EventLogCommand::Cleanup { r#box } => {
            let n = store.cleanup(r#box.as_deref())?;
            println!("removed {n} rows");
        }
    }
    Ok(())
}

/// Prints the latest pipeline-state lifecycle event and every mirrored
/// summary event (spec §6's pipeline-state lifecycle events; SPEC_FULL
/// §10's status subcommand).
async fn cmd_status(db: &std::path::Path) -> Result<()> {
    let store = Arc::new(eventlog::Store::open(db).context("opening event log")?);
    let mailbox = Mailbox::new(store);

    let state = mailbox
        .query(Some("lifecycle"), Some("pipeline-state"), None, None)
        .await?
        .pop()
        .map(|e| e.body)
        .unwrap_or_else(|| "running".to_string());
    println!("Pipeline state: {state}");
    println!();

    let summaries = mailbox.query(Some("summary"), None, None, None).await?;
    if summaries.is_empty() {
        println!("No section activity recorded yet.");
        return Ok(());
    }

    println!("{:<6} {:<24} {}", "ID", "TAG", "BODY");
    println!("{}", "-".repeat(80));
    for e in summaries {
        println!("{:<6} {:<24} {}", e.id, e.tag.unwrap_or_default(), e.body);
    }
    Ok(())
}
