//! SQLite backend for the KV-tree abstraction.
//!
//! One write connection guarded by a `parking_lot::Mutex`; rusqlite is not
//! `Sync`, and the session core serializes store access anyway. Each tree
//! is one two-column table, keys compared bytewise by SQLite's BLOB
//! ordering, which matches the big-endian key layout used by callers.

use std::{
    path::Path,
    sync::Arc,
};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::{u64_from_bytes, KeyValueEngine, KvTree};
use crate::Result;

const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = OFF;
";

pub struct SqliteEngine {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEngine {
    /// Opens or creates the store file. Failure here is fatal to session
    /// construction: there is no degraded mode without durable history.
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(PRAGMAS)?;
        info!(path = %path.display(), "event store opened");
        Ok(Arc::new(Self {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory()?;
        Ok(Arc::new(Self {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

impl KeyValueEngine for SqliteEngine {
    fn open_tree(&self, name: &'static str) -> Result<Arc<dyn KvTree>> {
        self.conn.lock().execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {name} ( key BLOB PRIMARY KEY, value BLOB );"
        ))?;
        debug!(tree = name, "tree opened");
        Ok(Arc::new(SqliteTree {
            conn: Arc::clone(&self.conn),
            name,
        }))
    }

    fn flush(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch("PRAGMA wal_checkpoint(FULL);")?;
        Ok(())
    }
}

struct SqliteTree {
    conn: Arc<Mutex<Connection>>,
    name: &'static str,
}

impl KvTree for SqliteTree {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", self.name),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                self.name
            ),
            params![key, value],
        )?;
        Ok(())
    }

    fn insert_batch(&self, iter: &mut dyn Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                self.name
            ))?;
            for (key, value) in iter {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!("DELETE FROM {} WHERE key = ?1", self.name),
            params![key],
        )?;
        Ok(())
    }

    fn iter_from(&self, from: &[u8], backwards: bool, limit: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        let conn = self.conn.lock();
        let sql = if backwards {
            format!(
                "SELECT key, value FROM {} WHERE key <= ?1 ORDER BY key DESC LIMIT ?2",
                self.name
            )
        } else {
            format!(
                "SELECT key, value FROM {} WHERE key >= ?1 ORDER BY key ASC LIMIT ?2",
                self.name
            )
        };
        // SQLite treats a negative LIMIT as unbounded.
        let limit = i64::try_from(limit).unwrap_or(-1);
        let mut stmt = match conn.prepare(&sql) {
            Ok(stmt) => stmt,
            Err(_) => return Vec::new(),
        };
        stmt.query_map(params![from, limit], |row| Ok((row.get(0)?, row.get(1)?)))
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        if prefix.is_empty() {
            return self.iter_from(&[], false, usize::MAX);
        }
        // Smallest key strictly greater than every key with this prefix.
        let mut upper = prefix.to_vec();
        while let Some(&last) = upper.last() {
            if last == 0xff {
                upper.pop();
            } else {
                *upper.last_mut().expect("nonempty") += 1;
                break;
            }
        }

        let conn = self.conn.lock();
        let (sql, bind_upper) = if upper.is_empty() {
            (
                format!(
                    "SELECT key, value FROM {} WHERE key >= ?1 ORDER BY key ASC",
                    self.name
                ),
                false,
            )
        } else {
            (
                format!(
                    "SELECT key, value FROM {} WHERE key >= ?1 AND key < ?2 ORDER BY key ASC",
                    self.name
                ),
                true,
            )
        };
        let mut stmt = match conn.prepare(&sql) {
            Ok(stmt) => stmt,
            Err(_) => return Vec::new(),
        };
        let map_row = |row: &rusqlite::Row<'_>| Ok((row.get(0)?, row.get(1)?));
        let mapped = if bind_upper {
            stmt.query_map(params![prefix, upper], map_row)
        } else {
            stmt.query_map(params![prefix], map_row)
        };
        mapped
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    fn increment(&self, key: &[u8]) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let old: Option<Vec<u8>> = tx
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", self.name),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        let new = match old {
            Some(bytes) => u64_from_bytes(&bytes)? + 1,
            None => 1,
        };
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                self.name
            ),
            params![key, new.to_be_bytes().to_vec()],
        )?;
        tx.commit()?;
        Ok(new)
    }
}
