//! Disk-backed durable FIFO queue
//!
//! The durable queue is the hand-off point between the logger task (which
//! appends) and the delivery worker (which reads and removes the head). It is
//! backed by a single SQLite table so that every record accepted by
//! [`DurableQueue::add`] survives process death until the worker confirms a
//! terminal delivery outcome with [`DurableQueue::take`].
//!
//! The autoincrement row id doubles as the read cursor: the oldest unconsumed
//! record is always the row with the smallest id, so no separate cursor
//! metadata has to be kept consistent with the payload rows.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Notify;

use crate::config::CorruptionPolicy;
use crate::error::Result;
use crate::event::EventRecord;

/// A FIFO queue of event records whose contents survive process restart.
///
/// Concurrency: any number of tasks may `add` while a single consumer peeks
/// and takes. The connection mutex serializes appends against reads, so a
/// reader never observes a partially written record and the oldest record is
/// well-defined at all times.
pub struct DurableQueue {
    conn: Mutex<Connection>,
    table: String,
    policy: CorruptionPolicy,
    notify: Notify,
}

impl DurableQueue {
    /// Open or create the queue at the given path.
    ///
    /// `namespace` names the queue within the store and must be a valid SQL
    /// identifier (enforced by `TrackerConfig::validate`).
    pub fn open(path: &Path, namespace: &str, policy: CorruptionPolicy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL for concurrent readers; FULL sync because `add` returning is a
        // durability promise, not a hint.
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        Self::with_connection(conn, namespace, policy)
    }

    /// Open an in-memory queue (for testing; nothing survives drop).
    pub fn open_in_memory(namespace: &str, policy: CorruptionPolicy) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, namespace, policy)
    }

    fn with_connection(conn: Connection, namespace: &str, policy: CorruptionPolicy) -> Result<Self> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    payload TEXT NOT NULL
                )",
                namespace
            ),
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            table: namespace.to_string(),
            policy,
            notify: Notify::new(),
        })
    }

    /// Durably append a record.
    ///
    /// When this returns `Ok`, the record is retrievable by a subsequent
    /// `peek`/`take`, including after a crash and restart.
    pub fn add(&self, record: &EventRecord) -> Result<()> {
        let payload = record.to_json()?;
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                &format!("INSERT INTO {} (payload) VALUES (?1)", self.table),
                params![payload],
            )?;
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Return the oldest record without removing it, waiting while the queue
    /// is empty. Repeated calls before a `take` return the same record.
    pub async fn peek(&self) -> Result<EventRecord> {
        loop {
            if let Some(record) = self.try_peek()? {
                return Ok(record);
            }
            self.notify.notified().await;
        }
    }

    /// Return the oldest record without removing it, or `None` if empty.
    pub fn try_peek(&self) -> Result<Option<EventRecord>> {
        let conn = self.conn.lock().unwrap();
        loop {
            let head: Option<(i64, String)> = conn
                .query_row(
                    &format!(
                        "SELECT id, payload FROM {} ORDER BY id LIMIT 1",
                        self.table
                    ),
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (id, payload) = match head {
                Some(row) => row,
                None => return Ok(None),
            };

            match EventRecord::from_json(&payload) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => match self.policy {
                    CorruptionPolicy::Skip => {
                        tracing::warn!(id, error = %e, "Skipping unreadable queue entry");
                        conn.execute(
                            &format!("DELETE FROM {} WHERE id = ?1", self.table),
                            params![id],
                        )?;
                        // Fall through to the next-oldest row
                    }
                    CorruptionPolicy::Fail => return Err(e),
                },
            }
        }
    }

    /// Remove and discard the oldest record, waiting while the queue is
    /// empty. Call only after the head has been durably delivered or
    /// discarded.
    pub async fn take(&self) -> Result<()> {
        loop {
            if self.remove_head()? {
                return Ok(());
            }
            self.notify.notified().await;
        }
    }

    fn remove_head(&self) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            &format!(
                "DELETE FROM {t} WHERE id = (SELECT MIN(id) FROM {t})",
                t = self.table
            ),
            [],
        )?;
        Ok(removed > 0)
    }

    /// Number of records currently queued.
    pub fn len(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// True if no records are queued.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    #[cfg(test)]
    fn insert_raw(&self, payload: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("INSERT INTO {} (payload) VALUES (?1)", self.table),
            params![payload],
        )?;
        drop(conn);
        self.notify.notify_one();
        Ok(())
    }
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue")
            .field("table", &self.table)
            .field("policy", &self.policy)
            .finish()
    }
}
