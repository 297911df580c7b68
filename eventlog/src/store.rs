//! SQLite-backed event log and mailbox store.
//!
//! Two tables share one file (the `run.db` the scheduler points at):
//! `events` is the durable, append-only log of `lifecycle`/`summary`/
//! `signal`/`mail` events queried by tag; `mail` is the per-box message
//! queue `send`/`recv`/`drain` operate on. `mailboxes` only tracks which
//! box names are currently registered; sending to an unregistered box is
//! still a durable write, per contract.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::Result;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A single row from the `events` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: i64,
    pub ts: i64,
    pub kind: String,
    pub tag: Option<String>,
    pub body: String,
    pub agent: Option<String>,
}

/// Outcome of a `recv` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvResult {
    Message(String),
    Timeout,
}

/// A handle onto one `run.db` file. Cheap to clone callers should instead
/// share via `&Store`; internally a single connection is serialized behind
/// a mutex, matching how a single SQLite writer is used in practice here.
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open (creating if absent) the database at `path` and ensure the
    /// schema exists. Takes an advisory file lock for the duration of the
    /// schema migration so concurrent `init` calls from independent
    /// processes don't race on table creation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = path.with_extension("lock");
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        lock_file.lock_exclusive()?;

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                ts      INTEGER NOT NULL,
                kind    TEXT NOT NULL,
                tag     TEXT,
                body    TEXT NOT NULL,
                agent   TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_events_kind_tag ON events(kind, tag);

            CREATE TABLE IF NOT EXISTS mailboxes (
                name            TEXT PRIMARY KEY,
                registered_at   INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS mail (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                box_name    TEXT NOT NULL,
                ts          INTEGER NOT NULL,
                from_agent  TEXT,
                body        TEXT NOT NULL,
                consumed    INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_mail_box_consumed ON mail(box_name, consumed, id);",
        )?;

        FileExt::unlock(&lock_file)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn register(&self, box_name: &str) -> Result<()> {
        let conn = self.conn.lock().expect("eventlog connection poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO mailboxes (name, registered_at) VALUES (?1, ?2)",
            params![box_name, now_ms()],
        )?;
        Ok(())
    }

    /// Removes the box from the registry. Pending mail is left in place;
    /// `cleanup` is the explicit operation that reclaims it.
    pub fn unregister(&self, box_name: &str) -> Result<()> {
        let conn = self.conn.lock().expect("eventlog connection poisoned");
        conn.execute("DELETE FROM mailboxes WHERE name = ?1", params![box_name])?;
        Ok(())
    }

    /// Durable write regardless of whether `box_name` is currently
    /// registered.
    pub fn send(&self, box_name: &str, from: Option<&str>, body: &str) -> Result<()> {
        let conn = self.conn.lock().expect("eventlog connection poisoned");
        conn.execute(
            "INSERT INTO mail (box_name, ts, from_agent, body, consumed) VALUES (?1, ?2, ?3, ?4, 0)",
            params![box_name, now_ms(), from, body],
        )?;
        Ok(())
    }

    /// Blocks until a message is available or `timeout_secs` elapses.
    /// `timeout_secs == 0` blocks indefinitely. Call from a blocking
    /// context (`tokio::task::spawn_blocking`) when used from async code.
    pub fn recv(&self, box_name: &str, timeout_secs: u64) -> Result<RecvResult> {
        let deadline = (timeout_secs > 0).then(|| Instant::now() + Duration::from_secs(timeout_secs));
        loop {
            if let Some(body) = self.try_take_one(box_name)? {
                return Ok(RecvResult::Message(body));
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(RecvResult::Timeout);
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn try_take_one(&self, box_name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("eventlog connection poisoned");
        let tx = conn.unchecked_transaction()?;
        let row: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, body FROM mail WHERE box_name = ?1 AND consumed = 0 ORDER BY id ASC LIMIT 1",
                params![box_name],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((id, body)) = row else {
            return Ok(None);
        };
        tx.execute("UPDATE mail SET consumed = 1 WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(Some(body))
    }

    /// Non-blocking; removes and returns every pending message for `box_name`
    /// atomically from the caller's perspective.
    pub fn drain(&self, box_name: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("eventlog connection poisoned");
        let tx = conn.unchecked_transaction()?;
        let bodies: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT body FROM mail WHERE box_name = ?1 AND consumed = 0 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![box_name], |r| r.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        tx.execute(
            "UPDATE mail SET consumed = 1 WHERE box_name = ?1 AND consumed = 0",
            params![box_name],
        )?;
        tx.commit()?;
        Ok(bodies)
    }

    pub fn log(&self, kind: &str, tag: Option<&str>, body: &str, agent: Option<&str>) -> Result<i64> {
        let conn = self.conn.lock().expect("eventlog connection poisoned");
        conn.execute(
            "INSERT INTO events (ts, kind, tag, body, agent) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![now_ms(), kind, tag, body, agent],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Returns matching events ordered by id ascending. `since_id` is
    /// exclusive; `limit` caps the row count (unbounded when `None`).
    pub fn query(
        &self,
        kind: Option<&str>,
        tag: Option<&str>,
        since_id: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<Event>> {
        let conn = self.conn.lock().expect("eventlog connection poisoned");
        let mut sql = String::from("SELECT id, ts, kind, tag, body, agent FROM events WHERE 1=1");
        if kind.is_some() {
            sql.push_str(" AND kind = ?1");
        }
        if tag.is_some() {
            sql.push_str(" AND tag = ?2");
        }
        if since_id.is_some() {
            sql.push_str(" AND id > ?3");
        }
        sql.push_str(" ORDER BY id ASC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![kind, tag, since_id],
            |r| {
                Ok(Event {
                    id: r.get(0)?,
                    ts: r.get(1)?,
                    kind: r.get(2)?,
                    tag: r.get(3)?,
                    body: r.get(4)?,
                    agent: r.get(5)?,
                })
            },
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Reclaims consumed mail rows, scoped to `box_name` when given,
    /// otherwise across every box. Returns the number of rows removed.
    pub fn cleanup(&self, box_name: Option<&str>) -> Result<usize> {
        let conn = self.conn.lock().expect("eventlog connection poisoned");
        let n = match box_name {
            Some(b) => conn.execute("DELETE FROM mail WHERE box_name = ?1 AND consumed = 1", params![b])?,
            None => conn.execute("DELETE FROM mail WHERE consumed = 1", params![])?,
        };
        Ok(n)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_tmp() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("run.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn send_then_recv_returns_message() {
        let (_dir, store) = open_tmp();
        store.register("section-01").unwrap();
        store.send("section-01", Some("parent"), "resume:choose-LRU").unwrap();
        match store.recv("section-01", 1).unwrap() {
            RecvResult::Message(body) => assert_eq!(body, "resume:choose-LRU"),
            RecvResult::Timeout => panic!("expected a message"),
        }
    }

    #[test]
    fn recv_times_out_when_empty() {
        let (_dir, store) = open_tmp();
        store.register("section-01").unwrap();
        assert_eq!(store.recv("section-01", 1).unwrap(), RecvResult::Timeout);
    }

    #[test]
    fn send_to_unregistered_box_still_succeeds() {
        let (_dir, store) = open_tmp();
        store.send("never-registered", None, "hello").unwrap();
        let drained = store.drain("never-registered").unwrap();
        assert_eq!(drained, vec!["hello".to_string()]);
    }

    #[test]
    fn drain_is_atomic_and_non_blocking() {
        let (_dir, store) = open_tmp();
        store.send("box", None, "a").unwrap();
        store.send("box", None, "b").unwrap();
        let drained = store.drain("box").unwrap();
        assert_eq!(drained, vec!["a".to_string(), "b".to_string()]);
        assert!(store.drain("box").unwrap().is_empty());
    }

    #[test]
    fn query_orders_by_id_ascending() {
        let (_dir, store) = open_tmp();
        store.log("summary", Some("proposal:01"), "first", Some("scheduler")).unwrap();
        store.log("summary", Some("proposal:01"), "second", Some("scheduler")).unwrap();
        let events = store.query(Some("summary"), Some("proposal:01"), None, None).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].id < events[1].id);
        assert_eq!(events[0].body, "first");
    }

    #[test]
    fn cleanup_removes_only_consumed_rows() {
        let (_dir, store) = open_tmp();
        store.send("box", None, "keep").unwrap();
        store.send("box", None, "take").unwrap();
        store.recv("box", 1).unwrap();
        let removed = store.cleanup(Some("box")).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.drain("box").unwrap(), vec!["keep".to_string()]);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        /// `drain` always returns exactly the bodies `send` put in, in the
        /// order they were sent, for any sequence of message bodies.
        #[test]
        fn drain_preserves_send_order(bodies in proptest::collection::vec("[a-zA-Z0-9 :_-]{0,24}", 0..16)) {
            let (_dir, store) = open_tmp();
            for body in &bodies {
                store.send("box", None, body).unwrap();
            }
            let drained = store.drain("box").unwrap();
            proptest::prop_assert_eq!(&drained, &bodies);
            proptest::prop_assert!(store.drain("box").unwrap().is_empty());
        }

        /// `query` always returns ascending ids regardless of how many
        /// events were logged or in what order their bodies vary.
        #[test]
        fn query_ids_are_always_ascending(bodies in proptest::collection::vec("[a-zA-Z0-9 :_-]{0,24}", 1..16)) {
            let (_dir, store) = open_tmp();
            for body in &bodies {
                store.log("summary", Some("t"), body, None).unwrap();
            }
            let events = store.query(Some("summary"), Some("t"), None, None).unwrap();
            proptest::prop_assert_eq!(events.len(), bodies.len());
            for pair in events.windows(2) {
                proptest::prop_assert!(pair[0].id < pair[1].id);
            }
        }
    }
}
