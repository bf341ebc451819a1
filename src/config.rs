use crate::db::{DatabaseConfig, RetryPolicy};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub database: DatabaseConfig,
    // Restart recovery
    pub recovery_window: Duration,
    pub recovery_max_messages: usize,
    // Maintenance
    pub maintenance_interval: Duration,
    pub maintenance_op_timeout: Duration,
    pub thread_ownership_max_age: Duration,
    pub checkpoint_retention: Option<Duration>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        let defaults = DatabaseConfig::default();
        let maintenance_interval =
            duration_or("MAINTENANCE_INTERVAL", Duration::from_secs(3600))?;
        if maintenance_interval.is_zero() {
            anyhow::bail!("MAINTENANCE_INTERVAL must be greater than zero");
        }
        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            database: DatabaseConfig {
                path: env::var("DATABASE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.path),
                max_connections: parse_or("DATABASE_MAX_CONNECTIONS", defaults.max_connections)?,
                min_idle: parse_or("DATABASE_MIN_IDLE", defaults.min_idle)?,
                max_lifetime: duration_or("DATABASE_MAX_LIFETIME", defaults.max_lifetime)?,
                idle_timeout: duration_or("DATABASE_IDLE_TIMEOUT", defaults.idle_timeout)?,
                connect_timeout: duration_or("DATABASE_CONNECT_TIMEOUT", defaults.connect_timeout)?,
                busy_timeout: duration_or("DATABASE_BUSY_TIMEOUT", defaults.busy_timeout)?,
                connect_retry: RetryPolicy {
                    max_attempts: parse_or(
                        "DATABASE_CONNECT_ATTEMPTS",
                        RetryPolicy::CONNECT.max_attempts,
                    )?,
                    base_delay: duration_or(
                        "DATABASE_CONNECT_BACKOFF",
                        RetryPolicy::CONNECT.base_delay,
                    )?,
                    ..RetryPolicy::CONNECT
                },
                execute_retry: RetryPolicy {
                    max_attempts: parse_or(
                        "DATABASE_EXECUTE_ATTEMPTS",
                        RetryPolicy::EXECUTE.max_attempts,
                    )?,
                    base_delay: duration_or(
                        "DATABASE_EXECUTE_BACKOFF",
                        RetryPolicy::EXECUTE.base_delay,
                    )?,
                    ..RetryPolicy::EXECUTE
                },
            },
            recovery_window: duration_or("RECOVERY_WINDOW", Duration::from_secs(5 * 60))?,
            recovery_max_messages: parse_or("RECOVERY_MAX_MESSAGES", 200)?,
            maintenance_interval,
            maintenance_op_timeout: duration_or("MAINTENANCE_OP_TIMEOUT", Duration::from_secs(30))?,
            thread_ownership_max_age: duration_or(
                "THREAD_OWNERSHIP_MAX_AGE",
                Duration::from_secs(7 * 24 * 3600),
            )?,
            checkpoint_retention: match env::var("CHECKPOINT_RETENTION") {
                Ok(raw) if !raw.trim().is_empty() => Some(parse_duration("CHECKPOINT_RETENTION", &raw)?),
                _ => None,
            },
        })
    }
}

fn parse_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}' ({})", name, raw, e)),
        Err(_) => Ok(default),
    }
}

/// Durations are written the humantime way: `30s`, `5m`, `1h 30m`.
fn duration_or(name: &str, default: Duration) -> anyhow::Result<Duration> {
    match env::var(name) {
        Ok(raw) => parse_duration(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_duration(name: &str, raw: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| anyhow::anyhow!("{} must be a duration like '5m' ({})", name, e))
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("database", &self.database)
            .field("recovery_window", &self.recovery_window)
            .field("recovery_max_messages", &self.recovery_max_messages)
            .field("maintenance_interval", &self.maintenance_interval)
            .field("maintenance_op_timeout", &self.maintenance_op_timeout)
            .field("thread_ownership_max_age", &self.thread_ownership_max_age)
            .field("checkpoint_retention", &self.checkpoint_retention)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_logic() {
        // 1. Test missing vars
        env::remove_var("DISCORD_TOKEN");
        let result = Config::build();
        assert!(result.is_err(), "Should fail when required vars are missing");

        // 2. Test defaults
        env::set_var("DISCORD_TOKEN", "test_token");
        let config = Config::build().unwrap();
        assert_eq!(config.discord_token, "test_token");
        assert_eq!(config.recovery_window, Duration::from_secs(300));
        assert_eq!(config.database.max_lifetime, Duration::from_secs(3600));
        assert_eq!(config.database.connect_retry.max_attempts, 5);
        assert_eq!(config.database.execute_retry.max_attempts, 3);
        assert!(config.checkpoint_retention.is_none());

        // 3. Test overrides
        env::set_var("RECOVERY_WINDOW", "15m");
        env::set_var("DATABASE_PATH", "/var/lib/lorebot/state.db");
        env::set_var("CHECKPOINT_RETENTION", "30days");
        let config = Config::build().unwrap();
        assert_eq!(config.recovery_window, Duration::from_secs(900));
        assert_eq!(config.database.path, PathBuf::from("/var/lib/lorebot/state.db"));
        assert_eq!(
            config.checkpoint_retention,
            Some(Duration::from_secs(30 * 24 * 3600))
        );

        // 4. Test bad duration
        env::set_var("RECOVERY_WINDOW", "whenever");
        assert!(Config::build().is_err());
        env::remove_var("RECOVERY_WINDOW");

        // 5. Test malformed integer and zero interval
        env::set_var("DATABASE_MAX_CONNECTIONS", "abc");
        assert!(Config::build().is_err());
        env::set_var("DATABASE_MAX_CONNECTIONS", "4");
        assert_eq!(Config::build().unwrap().database.max_connections, 4);
        env::remove_var("DATABASE_MAX_CONNECTIONS");

        env::set_var("MAINTENANCE_INTERVAL", "0s");
        assert!(Config::build().is_err());
        env::remove_var("MAINTENANCE_INTERVAL");

        // 6. Test debug redaction
        let debug_output = format!("{:?}", Config::build().unwrap());
        assert!(!debug_output.contains("test_token"));
        assert!(debug_output.contains("[REDACTED]"));

        // Cleanup
        env::remove_var("DISCORD_TOKEN");
        env::remove_var("DATABASE_PATH");
        env::remove_var("CHECKPOINT_RETENTION");
    }
}
