//! Message checkpoints: the last message the bot processed in each
//! conversation context (a channel, or a thread inside a channel).
//!
//! `(channel_id, thread_id)` is the natural key; a `None` thread means the
//! channel itself. Rows are never removed by normal operation; they are what
//! restart recovery reads back.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{cutoff_before, from_unix, to_unix, Database, OpContext, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCheckpoint {
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub last_message_id: String,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageCheckpoint {
    pub fn new(
        channel_id: impl Into<String>,
        thread_id: Option<String>,
        last_message_id: impl Into<String>,
        last_seen_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            channel_id: channel_id.into(),
            thread_id,
            last_message_id: last_message_id.into(),
            last_seen_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// Human-readable natural key, used in logs and error context.
    pub fn context_key(&self) -> String {
        context_key(&self.channel_id, self.thread_id.as_deref())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            channel_id: row.get(0)?,
            thread_id: row.get(1)?,
            last_message_id: row.get(2)?,
            last_seen_at: from_unix(row.get(3)?)?,
            created_at: from_unix(row.get(4)?)?,
            updated_at: from_unix(row.get(5)?)?,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT channel_id, thread_id, last_message_id, last_seen_at, \
                              created_at, updated_at FROM message_checkpoints";

fn context_key(channel_id: &str, thread_id: Option<&str>) -> String {
    match thread_id {
        Some(thread_id) => format!("{}/{}", channel_id, thread_id),
        None => channel_id.to_string(),
    }
}

impl Database {
    /// Returns `None` when the context has never been checkpointed.
    pub async fn get_checkpoint(
        &self,
        ctx: &OpContext,
        channel_id: &str,
        thread_id: Option<&str>,
    ) -> StoreResult<Option<MessageCheckpoint>> {
        let key = context_key(channel_id, thread_id);
        let channel_id = channel_id.to_string();
        let thread_id = thread_id.map(str::to_string);
        self.execute(ctx, "get checkpoint", move |conn| {
            let checkpoint = conn
                .query_row(
                    &format!("{SELECT_COLUMNS} WHERE channel_id = ?1 AND thread_id IS ?2"),
                    params![channel_id, thread_id],
                    MessageCheckpoint::from_row,
                )
                .optional()?;
            Ok(checkpoint)
        })
        .await
        .map_err(|e| e.context("get checkpoint", key))
    }

    /// Inserts the checkpoint, or moves an existing one forward. On update the
    /// stored `created_at` is kept and `updated_at` is set to now.
    pub async fn upsert_checkpoint(
        &self,
        ctx: &OpContext,
        checkpoint: &MessageCheckpoint,
    ) -> StoreResult<()> {
        let key = checkpoint.context_key();
        let checkpoint = checkpoint.clone();
        self.execute(ctx, "upsert checkpoint", move |conn| {
            upsert_checkpoint_row(conn, &checkpoint, Utc::now())
        })
        .await
        .map_err(|e| e.context("upsert checkpoint", key))
    }

    /// Every checkpoint, most recently seen first. Recovery/migration only.
    pub async fn list_checkpoints(&self, ctx: &OpContext) -> StoreResult<Vec<MessageCheckpoint>> {
        self.execute(ctx, "list checkpoints", |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{SELECT_COLUMNS} ORDER BY last_seen_at DESC, id DESC"
            ))?;
            let rows = stmt
                .query_map([], MessageCheckpoint::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| e.context("list checkpoints", "*"))
    }

    /// Checkpoints seen within the last `window`, newest first.
    pub async fn get_checkpoints_within_window(
        &self,
        ctx: &OpContext,
        window: Duration,
    ) -> StoreResult<Vec<MessageCheckpoint>> {
        self.get_checkpoints_since(ctx, cutoff_before(window)).await
    }

    /// Checkpoints with `last_seen_at >= cutoff`, newest first.
    pub async fn get_checkpoints_since(
        &self,
        ctx: &OpContext,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<MessageCheckpoint>> {
        let cutoff_secs = to_unix(cutoff);
        let checkpoints = self
            .execute(ctx, "get checkpoints since", move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "{SELECT_COLUMNS} WHERE last_seen_at >= ?1 ORDER BY last_seen_at DESC, id DESC"
                ))?;
                let rows = stmt
                    .query_map([cutoff_secs], MessageCheckpoint::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| e.context("get checkpoints since", cutoff.to_rfc3339()))?;
        debug!(
            "Database: {} checkpoints seen since {}",
            checkpoints.len(),
            cutoff
        );
        Ok(checkpoints)
    }

    /// Retention hook: removes checkpoints last seen before `cutoff`.
    pub async fn delete_checkpoints_seen_before(
        &self,
        ctx: &OpContext,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let cutoff_secs = to_unix(cutoff);
        self.execute(ctx, "delete stale checkpoints", move |conn| {
            Ok(conn.execute(
                "DELETE FROM message_checkpoints WHERE last_seen_at < ?1",
                [cutoff_secs],
            )?)
        })
        .await
        .map_err(|e| e.context("delete stale checkpoints", cutoff.to_rfc3339()))
    }
}

fn upsert_checkpoint_row(
    conn: &mut Connection,
    checkpoint: &MessageCheckpoint,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    // IMMEDIATE takes the write lock up front, so the existence check and the
    // write below cannot interleave with another writer.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM message_checkpoints WHERE channel_id = ?1 AND thread_id IS ?2",
            params![checkpoint.channel_id, checkpoint.thread_id],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(id) => {
            tx.execute(
                "UPDATE message_checkpoints
                 SET last_message_id = ?1, last_seen_at = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![
                    checkpoint.last_message_id,
                    to_unix(checkpoint.last_seen_at),
                    to_unix(now),
                    id
                ],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO message_checkpoints
                 (channel_id, thread_id, last_message_id, last_seen_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    checkpoint.channel_id,
                    checkpoint.thread_id,
                    checkpoint.last_message_id,
                    to_unix(checkpoint.last_seen_at),
                    to_unix(checkpoint.created_at),
                    to_unix(now)
                ],
            )?;
        }
    }

    tx.commit()?;
    Ok(())
}
