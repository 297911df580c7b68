//! Durable append-only event log and multi-consumer mailbox store.
//!
//! This crate is the concrete implementation behind what the
//! section-loop scheduler treats as an external, black-box "event log":
//! `init|register|unregister|send|recv|drain|log|query|cleanup` against
//! a single SQLite file (`run.db`). `sectionloop` links this crate
//! directly rather than shelling out to the `eventlog` binary, but the
//! binary exists too, for operational parity and manual inspection of a
//! run.

pub mod cli;
pub mod error;
pub mod store;

pub use error::{EventLogError, Result};
pub use store::{Event, RecvResult, Store};
