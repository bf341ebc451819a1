use std::sync::Arc;

use anyhow::Context as AnyhowContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{ChannelId, GetMessages, Message, MessageId};
use serenity::http::Http;

use crate::db::MessageCheckpoint;
use crate::recovery::{MessageSource, RecoveredMessage};

/// Reads channel and thread history over the Discord REST API.
pub struct DiscordMessageSource {
    http: Arc<Http>,
}

impl DiscordMessageSource {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl MessageSource for DiscordMessageSource {
    async fn messages_after(
        &self,
        checkpoint: &MessageCheckpoint,
        after_id: &str,
        limit: u8,
    ) -> anyhow::Result<Vec<RecoveredMessage>> {
        // Threads are channels of their own on Discord
        let channel = parse_snowflake(
            checkpoint
                .thread_id
                .as_deref()
                .unwrap_or(&checkpoint.channel_id),
        )?;
        let after = parse_snowflake(after_id)?;

        let builder = GetMessages::new()
            .after(MessageId::new(after))
            .limit(limit);
        let messages = ChannelId::new(channel)
            .messages(&self.http, builder)
            .await
            .with_context(|| format!("Failed to fetch history for {}", checkpoint.context_key()))?;

        Ok(messages
            .iter()
            .map(|m| to_recovered(m, checkpoint))
            .collect())
    }
}

fn parse_snowflake(id: &str) -> anyhow::Result<u64> {
    let value: u64 = id
        .parse()
        .with_context(|| format!("Invalid Discord id '{}'", id))?;
    if value == 0 {
        anyhow::bail!("Invalid Discord id '0'");
    }
    Ok(value)
}

fn to_recovered(message: &Message, checkpoint: &MessageCheckpoint) -> RecoveredMessage {
    let timestamp = DateTime::<Utc>::from_timestamp(message.timestamp.unix_timestamp(), 0)
        .unwrap_or_else(Utc::now);
    RecoveredMessage {
        id: message.id.to_string(),
        channel_id: checkpoint.channel_id.clone(),
        thread_id: checkpoint.thread_id.clone(),
        author_id: message.author.id.to_string(),
        author_is_bot: message.author.bot,
        content: message.content.clone(),
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serenity::model::id::UserId;
    use serenity::model::timestamp::Timestamp;
    use serenity::model::user::User;

    #[test]
    fn test_parse_snowflake() {
        assert_eq!(parse_snowflake("1234567890").unwrap(), 1234567890);
        assert!(parse_snowflake("0").is_err());
        assert!(parse_snowflake("abc").is_err());
    }

    #[test]
    fn test_to_recovered_keeps_context() {
        let mut msg = Message::default();
        msg.id = MessageId::new(55);
        msg.author = User::default();
        msg.author.id = UserId::new(9);
        msg.content = "hello".to_string();
        msg.timestamp = Timestamp::from_unix_timestamp(1_700_000_000).unwrap();

        let checkpoint = MessageCheckpoint::new("42", Some("7".to_string()), "50", Utc::now());
        let recovered = to_recovered(&msg, &checkpoint);

        assert_eq!(recovered.id, "55");
        assert_eq!(recovered.channel_id, "42");
        assert_eq!(recovered.thread_id.as_deref(), Some("7"));
        assert_eq!(recovered.author_id, "9");
        assert_eq!(recovered.timestamp.timestamp(), 1_700_000_000);
    }
}
