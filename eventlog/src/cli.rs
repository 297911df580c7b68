//! `eventlog` CLI — the operational surface the scheduler (and a human
//! inspecting a run) uses to init/register/unregister/send/recv/drain/
//! log/query/cleanup against a `run.db` file.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::{Context, Result};

use crate::store::{RecvResult, Store};

#[derive(Parser)]
#[command(name = "eventlog", about = "Durable event log and mailbox store", version)]
pub struct Cli {
    /// Path to the run.db file
    #[arg(long, global = true, default_value = "run.db")]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the database file and schema if absent
    Init,
    /// Register a mailbox name
    Register { r#box: String },
    /// Remove a mailbox from the registry (pending mail is untouched)
    Unregister { r#box: String },
    /// Append a message to a mailbox
    Send {
        r#box: String,
        #[arg(long)]
        from: Option<String>,
        body: String,
    },
    /// Block for up to `timeout` seconds (0 = forever) for one message
    Recv {
        r#box: String,
        #[arg(long, default_value_t = 0)]
        timeout: u64,
    },
    /// Non-blocking: take and print every pending message
    Drain { r#box: String },
    /// Append a typed event to the durable log
    Log {
        kind: String,
        #[arg(long)]
        tag: Option<String>,
        body: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Query events, oldest first
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
    /// Reclaim consumed mail rows
    Cleanup {
        #[arg(long)]
        r#box: Option<String>,
    },
}

pub fn run(cli: Cli) -> Result<()> {
    let store = Store::open(&cli.db).context("opening event log")?;
    match cli.command {
        Command::Init => {
            println!("{}", format!("initialized {}", cli.db.display()).green());
        }
        Command::Register { r#box } => {
            store.register(&r#box)?;
            println!("registered {box}");
        }
        Command::Unregister { r#box } => {
            store.unregister(&r#box)?;
            println!("unregistered {box}");
        }
        Command::Send { r#box, from, body } => {
            store.send(&r#box, from.as_deref(), &body)?;
        }
        Command::Recv { r#box, timeout } => match store.recv(&r#box, timeout)? {
            RecvResult::Message(body) => println!("{body}"),
            RecvResult::Timeout => {
                println!("{}", "TIMEOUT".red());
                std::process::exit(1);
            }
        },
        Command::Drain { r#box } => {
            for body in store.drain(&r#box)? {
                println!("{body}");
            }
        }
        Command::Log { kind, tag, body, agent } => {
            let id = store.log(&kind, tag.as_deref(), &body, agent.as_deref())?;
            println!("{id}");
        }
        Command::Query {
            kind,
            tag,
            since,
            limit,
        } => {
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
        Command::Cleanup { r#box } => {
            let n = store.cleanup(r#box.as_deref())?;
            println!("removed {n} rows");
        }
    }
    Ok(())
}
