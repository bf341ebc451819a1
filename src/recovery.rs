//! Restart recovery: find conversation contexts that were active within the
//! recovery window, replay whatever was posted after their checkpoint, and
//! move the checkpoint forward.
//!
//! The window bounds how much history a long-stopped process will try to
//! catch up on. Checkpoints older than the window are left stale.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::db::{Database, MessageCheckpoint, OpContext, StoreError};

/// Discord caps a single history request at 100 messages.
pub const MAX_BATCH_SIZE: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredMessage {
    pub id: String,
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub author_id: String,
    pub author_is_bot: bool,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Reads message history from the chat platform.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Up to `limit` messages posted after `after_id` in the checkpoint's
    /// context. Order is not guaranteed.
    async fn messages_after(
        &self,
        checkpoint: &MessageCheckpoint,
        after_id: &str,
        limit: u8,
    ) -> anyhow::Result<Vec<RecoveredMessage>>;
}

/// Processes one replayed message.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn handle(&self, message: &RecoveredMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub contexts_found: usize,
    pub contexts_recovered: usize,
    pub contexts_failed: usize,
    pub messages_replayed: usize,
}

pub struct RecoveryEngine<S> {
    db: Database,
    source: S,
    batch_size: u8,
    max_messages_per_context: usize,
}

impl<S: MessageSource> RecoveryEngine<S> {
    pub fn new(db: Database, source: S, max_messages_per_context: usize) -> Self {
        Self {
            db,
            source,
            batch_size: MAX_BATCH_SIZE,
            max_messages_per_context,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u8) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    /// Replays missed messages for every context seen within `window`.
    ///
    /// A context that fails is logged and skipped; the others still recover.
    /// Only a failure to read the checkpoints, or cancellation, aborts the run.
    pub async fn recover(
        &self,
        ctx: &OpContext,
        window: Duration,
        handler: &dyn RecoveryHandler,
    ) -> Result<RecoveryReport, StoreError> {
        let checkpoints = self.db.get_checkpoints_within_window(ctx, window).await?;
        let mut report = RecoveryReport {
            contexts_found: checkpoints.len(),
            ..RecoveryReport::default()
        };
        info!(
            "Recovery: {} contexts active within the last {}",
            checkpoints.len(),
            humantime::format_duration(window)
        );

        for checkpoint in checkpoints {
            ctx.check()?;
            match self.recover_context(ctx, &checkpoint, handler).await {
                Ok(replayed) => {
                    report.contexts_recovered += 1;
                    report.messages_replayed += replayed;
                    if replayed > 0 {
                        info!(
                            "Recovery: replayed {} messages in {}",
                            replayed,
                            checkpoint.context_key()
                        );
                    }
                }
                Err(e) => {
                    if let Some(store_err) = e.downcast_ref::<StoreError>() {
                        if store_err.is_cancellation() {
                            return Err(ctx.check().err().unwrap_or(StoreError::Cancelled));
                        }
                    }
                    report.contexts_failed += 1;
                    warn!(
                        "Recovery: skipping {} after error: {:#}",
                        checkpoint.context_key(),
                        e
                    );
                }
            }
        }

        info!(
            "Recovery: finished ({} recovered, {} failed, {} messages)",
            report.contexts_recovered, report.contexts_failed, report.messages_replayed
        );
        Ok(report)
    }

    async fn recover_context(
        &self,
        ctx: &OpContext,
        checkpoint: &MessageCheckpoint,
        handler: &dyn RecoveryHandler,
    ) -> anyhow::Result<usize> {
        let mut cursor = checkpoint.clone();
        let mut replayed = 0usize;

        while replayed < self.max_messages_per_context {
            let remaining = self.max_messages_per_context - replayed;
            let limit = u8::try_from(remaining)
                .unwrap_or(u8::MAX)
                .min(self.batch_size);

            let mut batch = tokio::select! {
                biased;
                err = ctx.done() => return Err(err.into()),
                res = self.source.messages_after(&cursor, &cursor.last_message_id, limit) => res?,
            };
            let fetched = batch.len();
            batch.retain(|m| is_newer(&m.id, &cursor.last_message_id));
            sort_chronologically(&mut batch);
            debug!(
                "Recovery: fetched {} messages after {} in {}",
                fetched,
                cursor.last_message_id,
                cursor.context_key()
            );

            let mut outcome = Ok(());
            let mut progressed = false;
            for message in &batch {
                if let Err(e) = handler.handle(message).await {
                    outcome = Err(e);
                    break;
                }
                cursor.last_message_id = message.id.clone();
                cursor.last_seen_at = message.timestamp;
                replayed += 1;
                progressed = true;
            }

            // Persist whatever was handled before surfacing a handler failure
            if progressed {
                self.db.upsert_checkpoint(ctx, &cursor).await?;
            }
            outcome?;

            if fetched < usize::from(limit) || batch.is_empty() {
                break;
            }
        }

        Ok(replayed)
    }
}

/// Snowflake ids grow monotonically; comparing length first keeps numeric
/// order for decimal strings of different widths.
fn id_order(id: &str) -> (usize, &str) {
    (id.len(), id)
}

fn is_newer(id: &str, than: &str) -> bool {
    id_order(id) > id_order(than)
}

fn sort_chronologically(messages: &mut [RecoveredMessage]) {
    messages.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| id_order(&a.id).cmp(&id_order(&b.id)))
    });
}
