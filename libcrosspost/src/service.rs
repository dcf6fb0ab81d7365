//! User-facing engine operations
//!
//! The service owns the operations a client calls directly: drafting,
//! scheduling, cancellation, status reads, analytics reads, and remote
//! deletion. Everything background (dispatch, refresh, sampling) lives in the
//! periodic components.

use std::sync::Arc;

use crate::config::Config;
use crate::db::Database;
use crate::error::{CrosspostError, Result};
use crate::platforms::registry::AdapterRegistry;
use crate::platforms::{bounded, DeleteOutcome};
use crate::types::{
    AnalyticsSnapshot, Metrics, Post, Target, TargetOptions, TargetStatus,
};

/// A destination for a new draft.
#[derive(Debug, Clone)]
pub struct NewTarget {
    pub account_id: String,
    pub content_override: Option<String>,
    pub options: TargetOptions,
}

/// A post together with its fan-out, as returned by status reads.
#[derive(Debug, Clone)]
pub struct PostView {
    pub post: Post,
    pub targets: Vec<Target>,
}

/// Analytics for one target: the latest projection plus full history.
#[derive(Debug, Clone)]
pub struct TargetAnalytics {
    pub target_id: String,
    pub platform: String,
    pub latest: Option<(i64, Metrics)>,
    pub history: Vec<AnalyticsSnapshot>,
}

pub struct EngineService {
    db: Database,
    registry: Arc<AdapterRegistry>,
    config: Config,
}

impl EngineService {
    pub fn new(db: Database, registry: Arc<AdapterRegistry>, config: Config) -> Self {
        Self {
            db,
            registry,
            config,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Create a draft post fanned out to the given destinations.
    ///
    /// Destinations must reference existing, active accounts; the target's
    /// platform is recorded from the account at creation time.
    pub async fn create_draft(
        &self,
        body: String,
        media: Vec<String>,
        destinations: Vec<NewTarget>,
    ) -> Result<Post> {
        if body.trim().is_empty() {
            return Err(CrosspostError::InvalidInput(
                "Post body cannot be empty".to_string(),
            ));
        }
        if destinations.is_empty() {
            return Err(CrosspostError::InvalidInput(
                "A post needs at least one destination".to_string(),
            ));
        }

        let mut targets = Vec::with_capacity(destinations.len());
        for destination in &destinations {
            let account = self
                .db
                .get_account(&destination.account_id)
                .await?
                .ok_or_else(|| {
                    CrosspostError::NotFound(format!("account {}", destination.account_id))
                })?;

            if !account.active {
                return Err(CrosspostError::InvalidInput(format!(
                    "account {} is deactivated",
                    account.id
                )));
            }

            targets.push((account, destination));
        }

        let mut post = Post::new(body);
        post.media = media;
        self.db.create_post(&post).await?;

        for (account, destination) in targets {
            let mut target = Target::new(post.id.clone(), account.id.clone(), account.platform);
            target.content_override = destination.content_override.clone();
            target.options = destination.options.clone();
            self.db.create_target(&target).await?;
        }

        tracing::info!(post_id = %post.id, "draft created");
        Ok(post)
    }

    /// Schedule a post for a strictly future time.
    pub async fn schedule_post(&self, post_id: &str, when: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        if when <= now {
            return Err(CrosspostError::InvalidInput(
                "Scheduled time must be in the future".to_string(),
            ));
        }

        let post = self
            .db
            .get_post(post_id)
            .await?
            .ok_or_else(|| CrosspostError::NotFound(format!("post {}", post_id)))?;

        if !self.db.schedule_post(post_id, when).await? {
            return Err(CrosspostError::Conflict(format!(
                "post {} cannot be scheduled from status '{}'",
                post_id,
                post.status.as_str()
            )));
        }

        tracing::info!(post_id, scheduled_at = when, "post scheduled");
        Ok(())
    }

    /// Cancel a scheduled post. Fails with `Conflict` if dispatch has already
    /// claimed it.
    pub async fn cancel_post(&self, post_id: &str) -> Result<()> {
        self.db
            .get_post(post_id)
            .await?
            .ok_or_else(|| CrosspostError::NotFound(format!("post {}", post_id)))?;

        if !self.db.cancel_post(post_id).await? {
            return Err(CrosspostError::Conflict(format!(
                "post {} is no longer cancellable",
                post_id
            )));
        }

        tracing::info!(post_id, "post cancelled");
        Ok(())
    }

    /// Post status together with its per-target breakdown.
    pub async fn get_post_status(&self, post_id: &str) -> Result<PostView> {
        let post = self
            .db
            .get_post(post_id)
            .await?
            .ok_or_else(|| CrosspostError::NotFound(format!("post {}", post_id)))?;

        let targets = self.db.targets_for_post(post_id).await?;
        Ok(PostView { post, targets })
    }

    /// Latest metrics and snapshot history for every target of a post.
    pub async fn get_analytics(&self, post_id: &str) -> Result<Vec<TargetAnalytics>> {
        self.db
            .get_post(post_id)
            .await?
            .ok_or_else(|| CrosspostError::NotFound(format!("post {}", post_id)))?;

        let targets = self.db.targets_for_post(post_id).await?;
        let mut results = Vec::with_capacity(targets.len());

        for target in targets {
            let latest = self.db.latest_metrics(&target.id).await?;
            let history = self.db.snapshots_for_target(&target.id).await?;
            results.push(TargetAnalytics {
                target_id: target.id,
                platform: target.platform,
                latest,
                history,
            });
        }

        Ok(results)
    }

    /// Delete the external post behind a target. A post already gone on the
    /// platform counts as deleted.
    pub async fn delete_remote(&self, target_id: &str) -> Result<DeleteOutcome> {
        let target = self
            .db
            .get_target(target_id)
            .await?
            .ok_or_else(|| CrosspostError::NotFound(format!("target {}", target_id)))?;

        if target.status != TargetStatus::Posted {
            return Err(CrosspostError::InvalidInput(format!(
                "target {} is not posted (status '{}')",
                target_id,
                target.status.as_str()
            )));
        }

        let external_id = target.platform_post_id.as_deref().ok_or_else(|| {
            CrosspostError::InvalidInput(format!("target {} has no external post id", target_id))
        })?;

        let account = self
            .db
            .get_account(&target.account_id)
            .await?
            .ok_or_else(|| CrosspostError::NotFound(format!("account {}", target.account_id)))?;

        let adapter = self.registry.resolve(&account, &self.config)?;
        let timeout = self.config.dispatch.adapter_timeout_secs;
        let outcome = bounded(timeout, "delete post", adapter.delete_post(external_id)).await?;

        tracing::info!(
            target_id,
            platform = %target.platform,
            ?outcome,
            "remote post deleted"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockAdapter;
    use crate::platforms::Adapter;
    use crate::types::{Account, PostStatus};

    struct Harness {
        db: Database,
        service: EngineService,
        account: Account,
    }

    async fn harness() -> Harness {
        let db = Database::new(":memory:").await.unwrap();

        let mut registry = AdapterRegistry::new();
        let adapter = Arc::new(MockAdapter::success("mock"));
        registry.register("mock", move |_, _| {
            Ok(adapter.clone() as Arc<dyn Adapter>)
        });

        let account = Account::new(
            "owner".to_string(),
            "mock".to_string(),
            "ext".to_string(),
            "token".to_string(),
        );
        db.create_account(&account).await.unwrap();

        let service = EngineService::new(db.clone(), Arc::new(registry), Config::default());

        Harness {
            db,
            service,
            account,
        }
    }

    fn destination(account_id: &str) -> NewTarget {
        NewTarget {
            account_id: account_id.to_string(),
            content_override: None,
            options: TargetOptions::new(),
        }
    }

    #[tokio::test]
    async fn test_create_draft_with_targets() {
        let h = harness().await;

        let post = h
            .service
            .create_draft(
                "Hello".to_string(),
                Vec::new(),
                vec![destination(&h.account.id)],
            )
            .await
            .unwrap();

        let view = h.service.get_post_status(&post.id).await.unwrap();
        assert_eq!(view.post.status, PostStatus::Draft);
        assert_eq!(view.targets.len(), 1);
        assert_eq!(view.targets[0].platform, "mock");
        assert_eq!(view.targets[0].status, TargetStatus::Draft);
    }

    #[tokio::test]
    async fn test_create_draft_rejects_empty_body() {
        let h = harness().await;
        let result = h
            .service
            .create_draft("   ".to_string(), Vec::new(), vec![destination(&h.account.id)])
            .await;
        assert!(matches!(result, Err(CrosspostError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_create_draft_rejects_unknown_account() {
        let h = harness().await;
        let result = h
            .service
            .create_draft("Hi".to_string(), Vec::new(), vec![destination("nope")])
            .await;
        assert!(matches!(result, Err(CrosspostError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_draft_rejects_inactive_account() {
        let h = harness().await;
        h.db.deactivate_account(&h.account.id).await.unwrap();

        let result = h
            .service
            .create_draft("Hi".to_string(), Vec::new(), vec![destination(&h.account.id)])
            .await;
        assert!(matches!(result, Err(CrosspostError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_schedule_requires_future_time() {
        let h = harness().await;
        let post = h
            .service
            .create_draft("Hi".to_string(), Vec::new(), vec![destination(&h.account.id)])
            .await
            .unwrap();

        let past = chrono::Utc::now().timestamp() - 10;
        let result = h.service.schedule_post(&post.id, past).await;
        assert!(matches!(result, Err(CrosspostError::InvalidInput(_))));

        let future = chrono::Utc::now().timestamp() + 3600;
        h.service.schedule_post(&post.id, future).await.unwrap();

        let view = h.service.get_post_status(&post.id).await.unwrap();
        assert_eq!(view.post.status, PostStatus::Scheduled);
        assert_eq!(view.post.scheduled_at, Some(future));
        assert_eq!(view.targets[0].status, TargetStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_reschedule_while_scheduled() {
        let h = harness().await;
        let post = h
            .service
            .create_draft("Hi".to_string(), Vec::new(), vec![destination(&h.account.id)])
            .await
            .unwrap();

        let first = chrono::Utc::now().timestamp() + 3600;
        h.service.schedule_post(&post.id, first).await.unwrap();
        let second = first + 3600;
        h.service.schedule_post(&post.id, second).await.unwrap();

        let view = h.service.get_post_status(&post.id).await.unwrap();
        assert_eq!(view.post.scheduled_at, Some(second));
    }

    #[tokio::test]
    async fn test_cancel_scheduled_post() {
        let h = harness().await;
        let post = h
            .service
            .create_draft("Hi".to_string(), Vec::new(), vec![destination(&h.account.id)])
            .await
            .unwrap();
        let future = chrono::Utc::now().timestamp() + 3600;
        h.service.schedule_post(&post.id, future).await.unwrap();

        h.service.cancel_post(&post.id).await.unwrap();

        let view = h.service.get_post_status(&post.id).await.unwrap();
        assert_eq!(view.post.status, PostStatus::Cancelled);
        assert_eq!(view.targets[0].status, TargetStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_after_claim_is_conflict() {
        let h = harness().await;
        let post = h
            .service
            .create_draft("Hi".to_string(), Vec::new(), vec![destination(&h.account.id)])
            .await
            .unwrap();
        let future = chrono::Utc::now().timestamp() + 3600;
        h.service.schedule_post(&post.id, future).await.unwrap();

        // Dispatch wins the race.
        h.db.claim_post_for_dispatch(&post.id).await.unwrap();

        let result = h.service.cancel_post(&post.id).await;
        assert!(matches!(result, Err(CrosspostError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_cancel_draft_is_conflict() {
        let h = harness().await;
        let post = h
            .service
            .create_draft("Hi".to_string(), Vec::new(), vec![destination(&h.account.id)])
            .await
            .unwrap();

        // Only scheduled posts can be cancelled.
        let result = h.service.cancel_post(&post.id).await;
        assert!(matches!(result, Err(CrosspostError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_get_status_unknown_post() {
        let h = harness().await;
        let result = h.service.get_post_status("missing").await;
        assert!(matches!(result, Err(CrosspostError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_remote_requires_posted_target() {
        let h = harness().await;
        let post = h
            .service
            .create_draft("Hi".to_string(), Vec::new(), vec![destination(&h.account.id)])
            .await
            .unwrap();
        let view = h.service.get_post_status(&post.id).await.unwrap();
        let target_id = view.targets[0].id.clone();

        let result = h.service.delete_remote(&target_id).await;
        assert!(matches!(result, Err(CrosspostError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_delete_remote_posted_target() {
        let h = harness().await;
        let post = h
            .service
            .create_draft("Hi".to_string(), Vec::new(), vec![destination(&h.account.id)])
            .await
            .unwrap();
        let view = h.service.get_post_status(&post.id).await.unwrap();
        let target_id = view.targets[0].id.clone();

        // Drive the target to posted by hand.
        sqlx::query("UPDATE targets SET status = 'queued' WHERE id = ?")
            .bind(&target_id)
            .execute(h.db.pool())
            .await
            .unwrap();
        let now = chrono::Utc::now().timestamp();
        h.db.claim_target_for_posting(&target_id, now).await.unwrap();
        h.db.mark_target_posted(&target_id, "ext-9", None, now)
            .await
            .unwrap();

        let outcome = h.service.delete_remote(&target_id).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_analytics_view_includes_history() {
        let h = harness().await;
        let post = h
            .service
            .create_draft("Hi".to_string(), Vec::new(), vec![destination(&h.account.id)])
            .await
            .unwrap();
        let view = h.service.get_post_status(&post.id).await.unwrap();
        let target_id = view.targets[0].id.clone();

        let metrics = Metrics {
            likes: 5,
            ..Metrics::default()
        };
        h.db.insert_snapshot(&AnalyticsSnapshot {
            id: None,
            target_id: target_id.clone(),
            captured_at: 100,
            metrics: metrics.clone(),
        })
        .await
        .unwrap();
        h.db.upsert_latest_metrics(&target_id, &metrics, 100)
            .await
            .unwrap();

        let analytics = h.service.get_analytics(&post.id).await.unwrap();
        assert_eq!(analytics.len(), 1);
        assert_eq!(analytics[0].history.len(), 1);
        assert_eq!(analytics[0].latest.as_ref().unwrap().1.likes, 5);
    }
}
