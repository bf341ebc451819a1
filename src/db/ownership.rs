use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{cutoff_before, from_unix, to_unix, Database, OpContext, StoreResult};

/// Which user a bot-created thread belongs to. Later messages in an owned
/// thread are treated as addressed to the bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadOwnership {
    pub thread_id: String,
    pub original_user_id: String,
    pub created_by_id: String,
    pub creation_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ThreadOwnership {
    pub fn new(
        thread_id: impl Into<String>,
        original_user_id: impl Into<String>,
        created_by_id: impl Into<String>,
        creation_time: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            original_user_id: original_user_id.into(),
            created_by_id: created_by_id.into(),
            creation_time,
            created_at: now,
            updated_at: now,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            thread_id: row.get(0)?,
            original_user_id: row.get(1)?,
            created_by_id: row.get(2)?,
            creation_time: from_unix(row.get(3)?)?,
            created_at: from_unix(row.get(4)?)?,
            updated_at: from_unix(row.get(5)?)?,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT thread_id, original_user_id, created_by, creation_time, \
                              created_at, updated_at FROM thread_ownerships";

impl Database {
    pub async fn get_thread_ownership(
        &self,
        ctx: &OpContext,
        thread_id: &str,
    ) -> StoreResult<Option<ThreadOwnership>> {
        let key = thread_id.to_string();
        self.execute(ctx, "get thread ownership", {
            let thread_id = key.clone();
            move |conn| {
                let ownership = conn
                    .query_row(
                        &format!("{SELECT_COLUMNS} WHERE thread_id = ?1"),
                        [&thread_id],
                        ThreadOwnership::from_row,
                    )
                    .optional()?;
                Ok(ownership)
            }
        })
        .await
        .map_err(|e| e.context("get thread ownership", key))
    }

    pub async fn upsert_thread_ownership(
        &self,
        ctx: &OpContext,
        ownership: &ThreadOwnership,
    ) -> StoreResult<()> {
        let key = ownership.thread_id.clone();
        let ownership = ownership.clone();
        self.execute(ctx, "upsert thread ownership", move |conn| {
            upsert_ownership_row(conn, &ownership, Utc::now())
        })
        .await
        .map_err(|e| e.context("upsert thread ownership", key))
    }

    /// All ownership records, newest thread first.
    pub async fn list_thread_ownerships(
        &self,
        ctx: &OpContext,
    ) -> StoreResult<Vec<ThreadOwnership>> {
        self.execute(ctx, "list thread ownerships", |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{SELECT_COLUMNS} ORDER BY creation_time DESC, id DESC"
            ))?;
            let rows = stmt
                .query_map([], ThreadOwnership::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| e.context("list thread ownerships", "*"))
    }

    /// Purges records whose thread was created more than `max_age` ago.
    /// Deleting nothing is not an error.
    pub async fn cleanup_thread_ownerships(
        &self,
        ctx: &OpContext,
        max_age: Duration,
    ) -> StoreResult<usize> {
        self.delete_thread_ownerships_before(ctx, cutoff_before(max_age))
            .await
    }

    /// Deletes records with `creation_time < cutoff`; a record created exactly
    /// at `cutoff` is kept.
    pub async fn delete_thread_ownerships_before(
        &self,
        ctx: &OpContext,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let cutoff_secs = to_unix(cutoff);
        let deleted = self
            .execute(ctx, "cleanup thread ownerships", move |conn| {
                Ok(conn.execute(
                    "DELETE FROM thread_ownerships WHERE creation_time < ?1",
                    [cutoff_secs],
                )?)
            })
            .await
            .map_err(|e| e.context("cleanup thread ownerships", cutoff.to_rfc3339()))?;
        if deleted > 0 {
            info!(
                "Database: Purged {} thread ownerships created before {}",
                deleted, cutoff
            );
        }
        Ok(deleted)
    }
}

fn upsert_ownership_row(
    conn: &mut Connection,
    ownership: &ThreadOwnership,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM thread_ownerships WHERE thread_id = ?1",
            [&ownership.thread_id],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(id) => {
            tx.execute(
                "UPDATE thread_ownerships
                 SET original_user_id = ?1, created_by = ?2, creation_time = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    ownership.original_user_id,
                    ownership.created_by_id,
                    to_unix(ownership.creation_time),
                    to_unix(now),
                    id
                ],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO thread_ownerships
                 (thread_id, original_user_id, created_by, creation_time, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    ownership.thread_id,
                    ownership.original_user_id,
                    ownership.created_by_id,
                    to_unix(ownership.creation_time),
                    to_unix(ownership.created_at),
                    to_unix(now)
                ],
            )?;
        }
    }

    tx.commit()?;
    Ok(())
}
