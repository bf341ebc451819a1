//! Categorised key/value settings.
//!
//! Values are always stored as text. The declared [`ValueType`] is metadata
//! for callers; the store does not validate it.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql, TransactionBehavior};
use serde::{Deserialize, Serialize};

use super::{from_unix, to_unix, Database, OpContext, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Int,
    Bool,
    Duration,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Int => "int",
            ValueType::Bool => "bool",
            ValueType::Duration => "duration",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "string" => Ok(ValueType::String),
            "int" => Ok(ValueType::Int),
            "bool" => Ok(ValueType::Bool),
            "duration" => Ok(ValueType::Duration),
            other => Err(StoreError::Invalid(format!("unknown value type '{}'", other))),
        }
    }
}

impl ToSql for ValueType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ValueType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: StoreError| FromSqlError::Other(Box::new(e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub category: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Configuration {
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
        value_type: ValueType,
        category: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            value: value.into(),
            value_type,
            category: category.into(),
            description: description.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn as_int(&self) -> StoreResult<i64> {
        self.value.trim().parse().map_err(|_| self.invalid("an integer"))
    }

    pub fn as_bool(&self) -> StoreResult<bool> {
        match self.value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(self.invalid("a boolean")),
        }
    }

    /// Parses values like `30s`, `5m` or `1h 30m`.
    pub fn as_duration(&self) -> StoreResult<Duration> {
        humantime::parse_duration(self.value.trim()).map_err(|_| self.invalid("a duration"))
    }

    fn invalid(&self, expected: &str) -> StoreError {
        StoreError::Invalid(format!(
            "configuration '{}' value '{}' is not {}",
            self.key, self.value, expected
        ))
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            value: row.get(1)?,
            value_type: row.get(2)?,
            category: row.get(3)?,
            description: row.get(4)?,
            created_at: from_unix(row.get(5)?)?,
            updated_at: from_unix(row.get(6)?)?,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT \"key\", value, \"type\", category, description, \
                              created_at, updated_at FROM configurations";

impl Database {
    pub async fn get_configuration(
        &self,
        ctx: &OpContext,
        key: &str,
    ) -> StoreResult<Option<Configuration>> {
        let owned = key.to_string();
        self.execute(ctx, "get configuration", move |conn| {
            let config = conn
                .query_row(
                    &format!("{SELECT_COLUMNS} WHERE \"key\" = ?1"),
                    [&owned],
                    Configuration::from_row,
                )
                .optional()?;
            Ok(config)
        })
        .await
        .map_err(|e| e.context("get configuration", key))
    }

    pub async fn upsert_configuration(
        &self,
        ctx: &OpContext,
        config: &Configuration,
    ) -> StoreResult<()> {
        let key = config.key.clone();
        let config = config.clone();
        self.execute(ctx, "upsert configuration", move |conn| {
            upsert_configuration_row(conn, &config, Utc::now())
        })
        .await
        .map_err(|e| e.context("upsert configuration", key))
    }

    /// Every setting, grouped by category then ordered by key.
    pub async fn list_configurations(&self, ctx: &OpContext) -> StoreResult<Vec<Configuration>> {
        self.execute(ctx, "list configurations", |conn| {
            let mut stmt =
                conn.prepare_cached(&format!("{SELECT_COLUMNS} ORDER BY category, \"key\""))?;
            let rows = stmt
                .query_map([], Configuration::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| e.context("list configurations", "*"))
    }

    pub async fn get_configurations_by_category(
        &self,
        ctx: &OpContext,
        category: &str,
    ) -> StoreResult<Vec<Configuration>> {
        let owned = category.to_string();
        self.execute(ctx, "get configurations by category", move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{SELECT_COLUMNS} WHERE category = ?1 ORDER BY \"key\""
            ))?;
            let rows = stmt
                .query_map([&owned], Configuration::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| e.context("get configurations by category", category))
    }

    /// Unlike reads, deleting a key that does not exist is an error.
    pub async fn delete_configuration(&self, ctx: &OpContext, key: &str) -> StoreResult<()> {
        let owned = key.to_string();
        let deleted = self
            .execute(ctx, "delete configuration", move |conn| {
                Ok(conn.execute("DELETE FROM configurations WHERE \"key\" = ?1", [&owned])?)
            })
            .await
            .map_err(|e| e.context("delete configuration", key))?;

        if deleted == 0 {
            return Err(StoreError::NotFound {
                entity: "configuration",
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

fn upsert_configuration_row(
    conn: &mut Connection,
    config: &Configuration,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM configurations WHERE \"key\" = ?1",
            [&config.key],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(id) => {
            tx.execute(
                "UPDATE configurations
                 SET value = ?1, \"type\" = ?2, category = ?3, description = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    config.value,
                    config.value_type,
                    config.category,
                    config.description,
                    to_unix(now),
                    id
                ],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO configurations
                 (\"key\", value, \"type\", category, description, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    config.key,
                    config.value,
                    config.value_type,
                    config.category,
                    config.description,
                    to_unix(config.created_at),
                    to_unix(now)
                ],
            )?;
        }
    }

    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::open_test_db;
    use crate::db::test_support::truncate_to_secs;

    fn setting(key: &str, category: &str) -> Configuration {
        Configuration::new(key, "v", ValueType::String, category, "")
    }

    #[tokio::test]
    async fn test_configuration_upsert_keeps_single_row() {
        let test = open_test_db().await;
        let ctx = OpContext::background();

        assert!(test.db.get_configuration(&ctx, "bot.status").await.unwrap().is_none());

        let mut first = Configuration::new("bot.status", "Ready", ValueType::String, "bot", "status");
        first.created_at = Utc::now() - chrono::Duration::days(1);
        test.db.upsert_configuration(&ctx, &first).await.unwrap();

        let second = Configuration::new("bot.status", "Busy", ValueType::String, "bot", "status text");
        test.db.upsert_configuration(&ctx, &second).await.unwrap();

        let stored = test.db.get_configuration(&ctx, "bot.status").await.unwrap().unwrap();
        assert_eq!(stored.value, "Busy");
        assert_eq!(stored.description, "status text");
        assert_eq!(stored.created_at, truncate_to_secs(first.created_at));
        assert!(stored.updated_at > stored.created_at);
        assert_eq!(test.db.list_configurations(&ctx).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_category_grouping() {
        let test = open_test_db().await;
        let ctx = OpContext::background();

        for (key, category) in [("k2", "catA"), ("k3", "catB"), ("k1", "catA")] {
            test.db
                .upsert_configuration(&ctx, &setting(key, category))
                .await
                .unwrap();
        }

        let keys: Vec<_> = test
            .db
            .get_configurations_by_category(&ctx, "catA")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.key)
            .collect();
        assert_eq!(keys, vec!["k1".to_string(), "k2".to_string()]);

        assert!(test
            .db
            .get_configurations_by_category(&ctx, "missing")
            .await
            .unwrap()
            .is_empty());

        let all: Vec<_> = test
            .db
            .list_configurations(&ctx)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.key)
            .collect();
        assert_eq!(all, vec!["k1", "k2", "k3"]);
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_not_found() {
        let test = open_test_db().await;
        let ctx = OpContext::background();

        test.db.upsert_configuration(&ctx, &setting("k1", "catA")).await.unwrap();
        test.db.delete_configuration(&ctx, "k1").await.unwrap();
        assert!(test.db.get_configuration(&ctx, "k1").await.unwrap().is_none());

        let err = test.db.delete_configuration(&ctx, "k1").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(
            err,
            StoreError::NotFound { entity: "configuration", ref key } if key == "k1"
        ));
    }

    #[test]
    fn test_typed_values() {
        let int = Configuration::new("limit", " 50 ", ValueType::Int, "context", "");
        assert_eq!(int.as_int().unwrap(), 50);
        assert!(int.as_bool().is_err());

        let flag = Configuration::new("enabled", "Yes", ValueType::Bool, "features", "");
        assert!(flag.as_bool().unwrap());

        let window = Configuration::new("recovery", "5m", ValueType::Duration, "recovery", "");
        assert_eq!(window.as_duration().unwrap(), Duration::from_secs(300));

        let bad = Configuration::new("recovery", "soon", ValueType::Duration, "recovery", "");
        assert!(matches!(bad.as_duration(), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn test_value_type_names() {
        assert_eq!("Duration".parse::<ValueType>().unwrap(), ValueType::Duration);
        assert!("float".parse::<ValueType>().is_err());
        assert_eq!(
            serde_json::to_string(&ValueType::Bool).unwrap(),
            "\"bool\""
        );

        let config = Configuration::new("k", "1", ValueType::Int, "c", "");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["type"], "int");
    }
}
