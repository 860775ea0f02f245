//! SQL-based durable store for contacts and call history

use super::{CallHistoryRecord, CallHistoryStore, ContactDirectory, StoredCall};
use crate::clock::millis_to_datetime;
use crate::error::{StoreError, StoreResult};
use crate::types::UserId;
use async_trait::async_trait;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::debug;

/// SQLite-backed [`ContactDirectory`] and [`CallHistoryStore`]
#[derive(Clone)]
pub struct SqlDurableStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqlDurableStore {
    /// Wrap an existing pool and run pending migrations
    pub fn new(pool: Pool<SqliteConnectionManager>) -> StoreResult<Self> {
        super::migrations::migrate(&pool)?;

        Ok(Self { pool })
    }

    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>, pool_size: u32) -> StoreResult<Self> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        Self::new(pool)
    }

    /// Private in-memory database.
    ///
    /// Every SQLite in-memory connection is its own database, so the pool
    /// holds exactly one connection.
    pub fn memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(1).build(manager)?;

        Self::new(pool)
    }

    /// Run `op` on a pooled connection off the async runtime
    async fn with_conn<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            op(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn load_participants(conn: &Connection, call_id: i64) -> StoreResult<Vec<UserId>> {
    let mut stmt = conn
        .prepare("SELECT user_id FROM call_participants WHERE call_id = ? ORDER BY user_id")?;
    let ids = stmt
        .query_map(params![call_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids.into_iter().map(UserId::from).collect())
}

#[async_trait]
impl ContactDirectory for SqlDurableStore {
    async fn friend_ids(&self, user: &UserId) -> StoreResult<Vec<UserId>> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT contact_id FROM contacts WHERE user_id = ? ORDER BY contact_id",
            )?;
            let ids = stmt
                .query_map(params![user.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(UserId::from).collect())
        })
        .await
    }

    async fn add_contact(&self, a: &UserId, b: &UserId) -> StoreResult<bool> {
        let (a, b) = (a.clone(), b.clone());
        self.with_conn(move |conn| {
            let now = Utc::now().timestamp_millis();
            let tx = conn.unchecked_transaction()?;

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO contacts (user_id, contact_id, created_at) VALUES (?, ?, ?)",
                params![a.as_str(), b.as_str(), now],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO contacts (user_id, contact_id, created_at) VALUES (?, ?, ?)",
                params![b.as_str(), a.as_str(), now],
            )?;

            tx.commit()?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn remove_contact(&self, a: &UserId, b: &UserId) -> StoreResult<bool> {
        let (a, b) = (a.clone(), b.clone());
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM contacts
                 WHERE (user_id = ?1 AND contact_id = ?2) OR (user_id = ?2 AND contact_id = ?1)",
                params![a.as_str(), b.as_str()],
            )?;
            Ok(removed > 0)
        })
        .await
    }
}

#[async_trait]
impl CallHistoryStore for SqlDurableStore {
    async fn create_record(&self, record: &CallHistoryRecord) -> StoreResult<i64> {
        let record = record.clone();
        let id = self
            .with_conn(move |conn| {
                let tx = conn.unchecked_transaction()?;

                tx.execute(
                    "INSERT INTO calls (start_time, end_time, duration) VALUES (?, ?, ?)",
                    params![
                        record.start_time.timestamp_millis(),
                        record.end_time.timestamp_millis(),
                        record.duration_seconds as i64,
                    ],
                )?;
                let call_id = tx.last_insert_rowid();

                for user in &record.participant_ids {
                    tx.execute(
                        "INSERT OR IGNORE INTO call_participants (call_id, user_id) VALUES (?, ?)",
                        params![call_id, user.as_str()],
                    )?;
                }

                tx.commit()?;
                Ok(call_id)
            })
            .await?;

        debug!(record_id = id, "Call history record written");
        Ok(id)
    }

    async fn history_for(&self, user: &UserId, limit: usize) -> StoreResult<Vec<StoredCall>> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.start_time, c.end_time, c.duration
                 FROM calls c
                 JOIN call_participants p ON p.call_id = c.id
                 WHERE p.user_id = ?
                 ORDER BY c.start_time DESC, c.id DESC
                 LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![user.as_str(), limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut calls = Vec::with_capacity(rows.len());
            for (id, start, end, duration) in rows {
                calls.push(StoredCall {
                    id,
                    record: CallHistoryRecord {
                        participant_ids: load_participants(conn, id)?,
                        start_time: millis_to_datetime(start.max(0) as u64),
                        end_time: millis_to_datetime(end.max(0) as u64),
                        duration_seconds: duration.max(0) as u64,
                    },
                });
            }
            Ok(calls)
        })
        .await
    }
}
