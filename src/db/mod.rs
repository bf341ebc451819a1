pub mod cancel;
pub mod checkpoints;
pub mod configurations;
pub mod error;
pub mod ownership;
pub mod retry;
pub mod schema;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info};

pub use cancel::{CancelHandle, OpContext};
pub use checkpoints::MessageCheckpoint;
pub use configurations::{Configuration, ValueType};
pub use error::{StoreError, StoreResult};
pub use ownership::ThreadOwnership;
pub use retry::RetryPolicy;

/// Resolved settings for the storage layer. Built by the process bootstrap;
/// the store never reads the environment itself.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    pub min_idle: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub busy_timeout: Duration,
    pub connect_retry: RetryPolicy,
    pub execute_retry: RetryPolicy,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/lorebot.db"),
            max_connections: 8,
            min_idle: 1,
            max_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(5),
            connect_retry: RetryPolicy::CONNECT,
            execute_retry: RetryPolicy::EXECUTE,
        }
    }
}

/// Pooled SQLite handle shared by every store operation.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    execute_retry: RetryPolicy,
    closed: Arc<AtomicBool>,
}

impl Database {
    /// Opens the database, retrying transient failures with exponential backoff.
    pub async fn connect(ctx: &OpContext, config: &DatabaseConfig) -> StoreResult<Self> {
        info!("Database: Connecting to {}", config.path.display());
        let database = retry::with_retry(ctx, config.connect_retry, "connect", || {
            let config = config.clone();
            async move { tokio::task::spawn_blocking(move || Self::open(&config)).await? }
        })
        .await?;
        info!("Database: Connected to {}", config.path.display());
        Ok(database)
    }

    fn open(config: &DatabaseConfig) -> StoreResult<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;

        // Probe with a plain connection first so failures keep their SQLite
        // result code; pool build errors only carry a message.
        let probe = Connection::open_with_flags(&config.path, flags)?;
        configure_connection(&probe, config.busy_timeout)?;
        ping(&probe)?;
        drop(probe);

        let busy_timeout = config.busy_timeout;
        let manager = SqliteConnectionManager::file(&config.path)
            .with_flags(flags)
            .with_init(move |conn| configure_connection(conn, busy_timeout));

        let pool = Pool::builder()
            .max_size(config.max_connections.max(1))
            .min_idle(Some(config.min_idle.min(config.max_connections)))
            .max_lifetime(Some(config.max_lifetime))
            .idle_timeout(Some(config.idle_timeout))
            .connection_timeout(config.connect_timeout)
            .build(manager)?;

        Ok(Self {
            pool,
            execute_retry: config.execute_retry,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Runs `f` on a pooled connection off the async runtime, retrying
    /// transient failures. `f` may run more than once.
    pub async fn execute<T, F>(&self, ctx: &OpContext, op: &'static str, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> StoreResult<T> + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let f = Arc::new(f);
        retry::with_retry(ctx, self.execute_retry, op, || {
            let pool = self.pool.clone();
            let f = Arc::clone(&f);
            async move {
                tokio::task::spawn_blocking(move || {
                    let mut conn = pool.get()?;
                    f(&mut *conn)
                })
                .await?
            }
        })
        .await
    }

    pub async fn health_check(&self, ctx: &OpContext) -> StoreResult<()> {
        self.execute(ctx, "health check", |conn| ping(conn)).await?;
        debug!("Database: Health check ok");
        Ok(())
    }

    /// Marks the store closed. Pooled connections are released once the last
    /// clone of this handle is dropped.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Database: Closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

fn configure_connection(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
}

/// Touches the schema page so a file that is not a database fails here.
fn ping(conn: &Connection) -> StoreResult<()> {
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })?;
    Ok(())
}

pub(crate) fn to_unix(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

pub(crate) fn from_unix(secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        rusqlite::Error::IntegralValueOutOfRange(0, secs)
    })
}

/// The instant `age` before now. Ages reaching past the representable range
/// clamp to the earliest timestamp instead of overflowing.
pub(crate) fn cutoff_before(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_connect_and_health_check() {
        let test = open_test_db().await;
        test.db
            .health_check(&OpContext::background())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_gives_up_on_unreachable_path() {
        let dir = TempDir::new().unwrap();
        let config = fast_config(dir.path().join("missing").join("nested").join("db.sqlite"));

        let started = std::time::Instant::now();
        let result = Database::connect(&OpContext::background(), &config).await;

        match result {
            Err(StoreError::RetriesExhausted { op, attempts, .. }) => {
                assert_eq!(op, "connect");
                assert_eq!(attempts, 5);
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connect should fail"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connect_fails_fast_on_non_database_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();
        let mut config = fast_config(path);
        config.connect_retry.base_delay = Duration::from_secs(10);
        config.connect_retry.max_delay = Duration::from_secs(10);

        let started = std::time::Instant::now();
        let err = match Database::connect(&OpContext::background(), &config).await {
            Err(err) => err,
            Ok(_) => panic!("connect should fail"),
        };

        assert!(!err.is_transient());
        assert!(!matches!(err, StoreError::RetriesExhausted { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connect_honors_deadline_during_backoff() {
        let dir = TempDir::new().unwrap();
        let mut config = fast_config(dir.path().join("missing").join("db.sqlite"));
        config.connect_retry.base_delay = Duration::from_secs(30);
        config.connect_retry.max_delay = Duration::from_secs(30);

        let ctx = OpContext::background().with_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let result = Database::connect(&ctx, &config).await;

        assert!(matches!(result, Err(StoreError::DeadlineExceeded)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let test = open_test_db().await;
        test.db.close();
        assert!(test.db.is_closed());

        let result = test.db.health_check(&OpContext::background()).await;
        assert!(matches!(result, Err(StoreError::Closed)));
    }

    #[test]
    fn test_unix_round_trip_truncates() {
        let now = Utc::now();
        let back = from_unix(to_unix(now)).unwrap();
        assert_eq!(back, truncate_to_secs(now));
    }
}
