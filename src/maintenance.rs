use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::db::{cutoff_before, Database, OpContext, StoreResult};

const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Periodic upkeep: health checks, thread ownership purge and optional
/// checkpoint retention.
pub struct MaintenanceTask {
    db: Database,
    interval: Duration,
    op_timeout: Duration,
    ownership_max_age: Duration,
    checkpoint_retention: Option<Duration>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub ownerships_purged: usize,
    pub checkpoints_purged: usize,
}

impl MaintenanceTask {
    pub fn new(
        db: Database,
        interval: Duration,
        op_timeout: Duration,
        ownership_max_age: Duration,
        checkpoint_retention: Option<Duration>,
    ) -> Self {
        if interval < MIN_INTERVAL {
            warn!(
                "Maintenance: interval {:?} too short, using {:?}",
                interval, MIN_INTERVAL
            );
        }
        Self {
            db,
            interval: interval.max(MIN_INTERVAL),
            op_timeout,
            ownership_max_age,
            checkpoint_retention,
        }
    }

    /// Runs until `ctx` is cancelled.
    pub async fn run(self, ctx: OpContext) {
        info!(
            "Maintenance: running every {}",
            humantime::format_duration(self.interval)
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ctx.done() => break,
                _ = ticker.tick() => {}
            }

            match self.run_once(&ctx).await {
                Ok(report) if report == MaintenanceReport::default() => {
                    debug!("Maintenance: nothing to purge")
                }
                Ok(report) => info!(
                    "Maintenance: purged {} thread ownerships, {} checkpoints",
                    report.ownerships_purged, report.checkpoints_purged
                ),
                Err(e) if e.is_cancellation() && ctx.check().is_err() => break,
                Err(e) => error!("Maintenance cycle failed: {}", e),
            }
        }
        info!("Maintenance: stopped");
    }

    pub async fn run_once(&self, ctx: &OpContext) -> StoreResult<MaintenanceReport> {
        let op_ctx = ctx.with_timeout(self.op_timeout);
        if let Err(e) = self.db.health_check(&op_ctx).await {
            // Purges below would fail the same way
            warn!("Maintenance: database health check failed: {}", e);
            return Err(e);
        }

        let mut report = MaintenanceReport {
            ownerships_purged: self
                .db
                .cleanup_thread_ownerships(&op_ctx, self.ownership_max_age)
                .await?,
            ..MaintenanceReport::default()
        };

        if let Some(retention) = self.checkpoint_retention {
            report.checkpoints_purged = self
                .db
                .delete_checkpoints_seen_before(&op_ctx, cutoff_before(retention))
                .await?;
        }

        Ok(report)
    }
}
