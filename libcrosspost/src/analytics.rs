//! Analytics re-sampling
//!
//! The periodic tick enqueues one analytics unit per target posted inside the
//! trailing window; workers consume the units through
//! [`sample_target`](AnalyticsRefresher::sample_target). Every capture is
//! appended as an immutable snapshot; a per-target latest projection keeps
//! status reads cheap. Failures are logged and skipped, the next pass
//! re-samples the same target anyway.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::platforms::bounded;
use crate::platforms::registry::AdapterRegistry;
use crate::queue::{WorkKind, WorkQueue};
use crate::types::{AnalyticsSnapshot, TargetStatus};

pub struct AnalyticsRefresher {
    db: Database,
    registry: Arc<AdapterRegistry>,
    queue: Arc<dyn WorkQueue>,
    config: Config,
}

impl AnalyticsRefresher {
    pub fn new(
        db: Database,
        registry: Arc<AdapterRegistry>,
        queue: Arc<dyn WorkQueue>,
        config: Config,
    ) -> Self {
        Self {
            db,
            registry,
            queue,
            config,
        }
    }

    /// One pass over targets posted inside the trailing window: each gets an
    /// analytics unit on the work queue. Returns the number of units
    /// enqueued.
    pub async fn tick(&self, now: i64) -> Result<usize> {
        let since = now - self.config.analytics.window_days * 86_400;
        let targets = self.db.posted_targets_since(since).await?;
        let mut enqueued = 0;

        for target in &targets {
            if target.platform_post_id.is_none() {
                continue;
            }
            self.queue
                .enqueue(WorkKind::Analytics, &target.id, 0, now)
                .await?;
            enqueued += 1;
        }

        Ok(enqueued)
    }

    /// Sample one target's metrics, appending a snapshot stamped `now`.
    /// Returns false when the target is not in a sampleable state or the
    /// fetch failed; either way the next pass tries again.
    pub async fn sample_target(&self, target_id: &str, now: i64) -> Result<bool> {
        let Some(target) = self.db.get_target(target_id).await? else {
            tracing::debug!(target_id, "skipping analytics, target gone");
            return Ok(false);
        };
        if target.status != TargetStatus::Posted {
            return Ok(false);
        }
        let Some(external_id) = target.platform_post_id.as_deref() else {
            return Ok(false);
        };

        let account = match self.db.get_account(&target.account_id).await? {
            Some(account) if account.active => account,
            _ => {
                tracing::debug!(
                    target_id = %target.id,
                    "skipping analytics, account inactive or missing"
                );
                return Ok(false);
            }
        };

        let adapter = match self.registry.resolve(&account, &self.config) {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::warn!(target_id = %target.id, error = %e, "cannot sample analytics");
                return Ok(false);
            }
        };

        let timeout = self.config.dispatch.adapter_timeout_secs;
        match bounded(timeout, "fetch analytics", adapter.fetch_analytics(external_id)).await {
            Ok(metrics) => {
                let snapshot = AnalyticsSnapshot {
                    id: None,
                    target_id: target.id.clone(),
                    captured_at: now,
                    metrics: metrics.clone(),
                };
                self.db.insert_snapshot(&snapshot).await?;
                self.db
                    .upsert_latest_metrics(&target.id, &metrics, now)
                    .await?;
                Ok(true)
            }
            Err(e) => {
                // Transient by assumption; the next pass retries.
                tracing::warn!(
                    target_id = %target.id,
                    platform = %target.platform,
                    error = %e,
                    "analytics fetch failed"
                );
                Ok(false)
            }
        }
    }

    /// Poll until the shutdown flag is raised.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.analytics.interval_secs));

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            let now = chrono::Utc::now().timestamp();
            match self.tick(now).await {
                Ok(enqueued) => tracing::debug!(enqueued, "analytics units enqueued"),
                Err(e) => tracing::error!(error = %e, "analytics pass failed"),
            }
        }

        tracing::info!("analytics refresher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;
    use crate::platforms::mock::MockAdapter;
    use crate::platforms::Adapter;
    use crate::queue::SqliteQueue;
    use crate::types::{Account, Metrics, Post, Target};

    struct Harness {
        db: Database,
        queue: Arc<SqliteQueue>,
        refresher: AnalyticsRefresher,
        adapter: Arc<MockAdapter>,
    }

    async fn harness(adapter: MockAdapter) -> Harness {
        let db = Database::new(":memory:").await.unwrap();
        let queue = Arc::new(SqliteQueue::new(db.clone()));

        let adapter = Arc::new(adapter);
        let mut registry = AdapterRegistry::new();
        let handle = adapter.clone();
        registry.register("mock", move |_, _| {
            Ok(handle.clone() as Arc<dyn Adapter>)
        });

        let refresher = AnalyticsRefresher::new(
            db.clone(),
            Arc::new(registry),
            queue.clone(),
            Config::default(),
        );

        Harness {
            db,
            queue,
            refresher,
            adapter,
        }
    }

    /// Consume enqueued analytics units the way a worker does.
    async fn sample_due(h: &Harness, now: i64) -> usize {
        let units = h.queue.lease_due(now, 64, 60).await.unwrap();
        let mut sampled = 0;
        for unit in units {
            assert_eq!(unit.kind, WorkKind::Analytics);
            if h.refresher.sample_target(&unit.subject_id, now).await.unwrap() {
                sampled += 1;
            }
            h.queue.ack(unit.id).await.unwrap();
        }
        sampled
    }

    async fn seed_posted_target(db: &Database, posted_at: i64) -> Target {
        let post = Post::new("posted".to_string());
        db.create_post(&post).await.unwrap();

        let account = Account::new(
            "owner".to_string(),
            "mock".to_string(),
            "ext".to_string(),
            "token".to_string(),
        );
        db.create_account(&account).await.unwrap();

        let mut target = Target::new(post.id.clone(), account.id.clone(), "mock".to_string());
        target.status = TargetStatus::Queued;
        db.create_target(&target).await.unwrap();
        db.claim_target_for_posting(&target.id, posted_at).await.unwrap();
        db.mark_target_posted(&target.id, "ext-1", None, posted_at)
            .await
            .unwrap();

        target
    }

    #[tokio::test]
    async fn test_recent_target_sampled_through_queue() {
        let h = harness(MockAdapter::success("mock")).await;
        let now = chrono::Utc::now().timestamp();
        let target = seed_posted_target(&h.db, now - 3600).await;

        h.adapter.set_metrics(Metrics {
            likes: 12,
            shares: 4,
            replies: 2,
            impressions: 500,
            extra: Default::default(),
        });

        assert_eq!(h.refresher.tick(now).await.unwrap(), 1);
        assert_eq!(sample_due(&h, now).await, 1);

        let history = h.db.snapshots_for_target(&target.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].metrics.likes, 12);

        let (captured_at, latest) = h.db.latest_metrics(&target.id).await.unwrap().unwrap();
        assert_eq!(captured_at, now);
        assert_eq!(latest.impressions, 500);
    }

    #[tokio::test]
    async fn test_old_target_outside_window_not_enqueued() {
        let h = harness(MockAdapter::success("mock")).await;
        let now = chrono::Utc::now().timestamp();
        // Posted 30 days ago, window is 7.
        let target = seed_posted_target(&h.db, now - 30 * 86_400).await;

        assert_eq!(h.refresher.tick(now).await.unwrap(), 0);
        assert!(h.queue.lease_due(now, 64, 60).await.unwrap().is_empty());
        assert!(h.db.snapshots_for_target(&target.id).await.unwrap().is_empty());
        assert_eq!(h.adapter.analytics_calls(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_skipped_not_fatal() {
        let h = harness(MockAdapter::failing_with(
            "mock",
            vec![AdapterError::Transient("relay timeout".to_string())],
        ))
        .await;
        let now = chrono::Utc::now().timestamp();
        let target = seed_posted_target(&h.db, now - 60).await;

        assert_eq!(h.refresher.tick(now).await.unwrap(), 1);
        assert_eq!(sample_due(&h, now).await, 0);
        assert!(h.db.snapshots_for_target(&target.id).await.unwrap().is_empty());

        // Next pass succeeds once the failure is drained.
        assert_eq!(h.refresher.tick(now + 1).await.unwrap(), 1);
        assert_eq!(sample_due(&h, now + 1).await, 1);
    }

    #[tokio::test]
    async fn test_stale_unit_for_unposted_target_dropped() {
        let h = harness(MockAdapter::success("mock")).await;
        let now = chrono::Utc::now().timestamp();

        let post = Post::new("pending".to_string());
        h.db.create_post(&post).await.unwrap();
        let mut target = Target::new(post.id.clone(), "acct".to_string(), "mock".to_string());
        target.status = TargetStatus::Queued;
        h.db.create_target(&target).await.unwrap();

        assert!(!h.refresher.sample_target(&target.id, now).await.unwrap());
        assert_eq!(h.adapter.analytics_calls(), 0);
    }

    #[tokio::test]
    async fn test_successive_passes_accumulate_history() {
        let h = harness(MockAdapter::success("mock")).await;
        let now = chrono::Utc::now().timestamp();
        let target = seed_posted_target(&h.db, now - 60).await;

        h.refresher.tick(now).await.unwrap();
        assert_eq!(sample_due(&h, now).await, 1);

        h.adapter.set_metrics(Metrics {
            likes: 50,
            ..Metrics::default()
        });
        h.refresher.tick(now + 600).await.unwrap();
        assert_eq!(sample_due(&h, now + 600).await, 1);

        let history = h.db.snapshots_for_target(&target.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].captured_at < history[1].captured_at);
        assert_eq!(history[1].metrics.likes, 50);

        let (captured_at, latest) = h.db.latest_metrics(&target.id).await.unwrap().unwrap();
        assert_eq!(captured_at, now + 600);
        assert_eq!(latest.likes, 50);
    }
}
