//! Scheduling trigger
//!
//! Polls for posts whose scheduled time has arrived and hands their targets
//! to the dispatch queue. The `Scheduled -> Queued` post claim is atomic, so
//! overlapping ticks (or a concurrent cancellation) never double-dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::db::Database;
use crate::error::Result;
use crate::queue::{WorkKind, WorkQueue};
use crate::status::recompute_post_status;
use crate::types::TargetStatus;

pub struct SchedulerTrigger {
    db: Database,
    queue: Arc<dyn WorkQueue>,
    config: SchedulerConfig,
    aggregation: crate::config::AggregationPolicy,
}

impl SchedulerTrigger {
    pub fn new(
        db: Database,
        queue: Arc<dyn WorkQueue>,
        config: SchedulerConfig,
        aggregation: crate::config::AggregationPolicy,
    ) -> Self {
        Self {
            db,
            queue,
            config,
            aggregation,
        }
    }

    /// One scheduler pass. Returns the number of posts claimed for dispatch.
    pub async fn tick(&self, now: i64) -> Result<usize> {
        let due = self.db.due_scheduled_posts(now).await?;
        let mut claimed = 0;

        for post in due {
            if !self.db.claim_post_for_dispatch(&post.id).await? {
                // Lost to a concurrent tick or a cancellation.
                continue;
            }
            claimed += 1;

            let targets = self.db.targets_for_post(&post.id).await?;
            let mut queued = 0;

            for target in &targets {
                if target.status != TargetStatus::Scheduled {
                    continue;
                }

                let account_ok = match self.db.get_account(&target.account_id).await? {
                    Some(account) => account.active,
                    None => false,
                };

                if !account_ok {
                    tracing::info!(
                        target_id = %target.id,
                        account_id = %target.account_id,
                        "skipping target, account inactive"
                    );
                    self.db
                        .fail_target(&target.id, "account deactivated")
                        .await?;
                    continue;
                }

                if self.db.queue_target(&target.id).await? {
                    self.queue
                        .enqueue(WorkKind::Dispatch, &target.id, 0, now)
                        .await?;
                    queued += 1;
                }
            }

            if queued == 0 {
                tracing::warn!(post_id = %post.id, "no active destinations for due post");
                self.db.fail_post(&post.id, "no active destinations").await?;
            } else {
                tracing::info!(post_id = %post.id, targets = queued, "post dispatched");
                recompute_post_status(&self.db, &post.id, self.aggregation).await?;
            }
        }

        Ok(claimed)
    }

    /// Poll until the shutdown flag is raised.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            let now = chrono::Utc::now().timestamp();
            match self.tick(now).await {
                Ok(0) => {}
                Ok(claimed) => tracing::debug!(claimed, "scheduler tick"),
                Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
            }
        }

        tracing::info!("scheduler stopped");
    }
}
