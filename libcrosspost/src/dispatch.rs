//! Dispatch coordination
//!
//! Consumes dispatch work units, claims targets, drives the adapter call, and
//! applies the retry policy. Every path out of a claim either marks the target
//! terminal or re-enqueues it with a delay, so no target is ever stranded in
//! `Posting`.

use std::sync::Arc;

use rand::Rng;

use crate::config::Config;
use crate::db::Database;
use crate::error::{AdapterError, Result};
use crate::platforms::registry::AdapterRegistry;
use crate::platforms::{bounded, Adapter};
use crate::queue::{WorkKind, WorkQueue, WorkUnit};
use crate::status::recompute_post_status;
use crate::types::{Target, TargetStatus};

pub struct DispatchCoordinator {
    db: Database,
    registry: Arc<AdapterRegistry>,
    queue: Arc<dyn WorkQueue>,
    config: Config,
}

impl DispatchCoordinator {
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

    /// Process one dispatch unit. Always returns Ok for per-target failures;
    /// an Err here means infrastructure trouble (database unavailable) and the
    /// unit should be redelivered via lease expiry.
    pub async fn handle(&self, unit: &WorkUnit) -> Result<()> {
        let target_id = &unit.subject_id;

        let Some(target) = self.db.get_target(target_id).await? else {
            tracing::warn!(target_id, "dispatch unit for unknown target, dropping");
            return Ok(());
        };

        // Reload check: cancellation or a duplicate delivery may have moved
        // the target on since the unit was enqueued.
        if target.status != TargetStatus::Queued {
            tracing::debug!(
                target_id,
                status = target.status.as_str(),
                "target no longer queued, dropping unit"
            );
            return Ok(());
        }

        let Some(post) = self.db.get_post(&target.post_id).await? else {
            self.fail_and_aggregate(&target, "owning post no longer exists")
                .await?;
            return Ok(());
        };

        let account = match self.db.get_account(&target.account_id).await? {
            Some(account) if account.active => account,
            Some(_) => {
                self.fail_and_aggregate(&target, "account deactivated").await?;
                return Ok(());
            }
            None => {
                self.fail_and_aggregate(&target, "account no longer exists")
                    .await?;
                return Ok(());
            }
        };

        let adapter = match self.registry.resolve(&account, &self.config) {
            Ok(adapter) => adapter,
            Err(e) => {
                // Construction failures (unknown platform, bad credentials on
                // file) are terminal for this target.
                self.fail_and_aggregate(&target, &e.to_string()).await?;
                return Ok(());
            }
        };

        let content = target.content_override.as_deref().unwrap_or(&post.body);

        let report = adapter.validate_content(content, post.media.len());
        if !report.is_valid() {
            let message = report.errors.join("; ");
            tracing::info!(target_id, error = %message, "content failed validation");
            self.fail_and_aggregate(&target, &message).await?;
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        if !self.db.claim_target_for_posting(target_id, now).await? {
            tracing::debug!(target_id, "lost dispatch claim, dropping unit");
            return Ok(());
        }

        let timeout = self.config.dispatch.adapter_timeout_secs;
        let outcome = if post.media.is_empty() {
            bounded(timeout, "post", adapter.post_text(content, &target.options)).await
        } else {
            bounded(
                timeout,
                "post",
                adapter.post_with_media(content, &post.media, &target.options),
            )
            .await
        };

        match outcome {
            Ok(published) => {
                self.db
                    .mark_target_posted(
                        target_id,
                        &published.external_id,
                        published.external_url.as_deref(),
                        published.posted_at,
                    )
                    .await?;
                tracing::info!(
                    target_id,
                    platform = adapter.name(),
                    external_id = %published.external_id,
                    "target posted"
                );
                recompute_post_status(&self.db, &target.post_id, self.config.dispatch.aggregation)
                    .await?;
            }
            Err(error) => {
                self.handle_failure(&target, adapter.as_ref(), error).await?;
            }
        }

        Ok(())
    }

    async fn handle_failure(
        &self,
        target: &Target,
        adapter: &dyn Adapter,
        error: AdapterError,
    ) -> Result<()> {
        let attempt = target.retry_count + 1;

        if !error.is_retryable() {
            tracing::info!(
                target_id = %target.id,
                platform = adapter.name(),
                error = %error,
                "permanent failure"
            );
            self.fail_and_aggregate(target, &error.to_string()).await?;
            return Ok(());
        }

        if attempt > self.config.dispatch.max_retries {
            tracing::warn!(
                target_id = %target.id,
                platform = adapter.name(),
                attempt,
                error = %error,
                "retry budget exhausted"
            );
            self.fail_and_aggregate(target, &error.to_string()).await?;
            return Ok(());
        }

        self.db.requeue_target(&target.id, &error.to_string()).await?;

        let delay = compute_backoff(attempt, &error, &self.config.dispatch);
        let not_before = chrono::Utc::now().timestamp() + delay as i64;
        self.queue
            .enqueue(WorkKind::Dispatch, &target.id, attempt, not_before)
            .await?;

        tracing::info!(
            target_id = %target.id,
            platform = adapter.name(),
            attempt,
            delay_secs = delay,
            error = %error,
            "target requeued for retry"
        );

        Ok(())
    }

    async fn fail_and_aggregate(&self, target: &Target, error: &str) -> Result<()> {
        if !self.db.fail_target(&target.id, error).await? {
            // Another delivery already settled this target.
            tracing::debug!(target_id = %target.id, "target already terminal, dropping failure");
            return Ok(());
        }
        recompute_post_status(&self.db, &target.post_id, self.config.dispatch.aggregation).await?;
        Ok(())
    }
}

/// Delay in seconds before retry number `attempt` (1-based).
///
/// A server-provided retry-after hint wins, then authentication failures get
/// the longer fixed delay so the refresh monitor can run first, and everything
/// else doubles from the base delay. A small random jitter spreads out
/// retries that failed together.
pub fn compute_backoff(attempt: i64, error: &AdapterError, config: &crate::config::DispatchConfig) -> u64 {
    if let Some(hint) = error.retry_after_hint() {
        return hint.min(config.max_delay_secs);
    }

    if matches!(error, AdapterError::Authentication(_)) {
        return config.auth_retry_delay_secs.min(config.max_delay_secs);
    }

    let exponent = attempt.saturating_sub(1).min(32) as u32;
    let delay = config
        .base_delay_secs
        .saturating_mul(1u64 << exponent)
        .min(config.max_delay_secs);

    let jitter_bound = delay / 10;
    if jitter_bound == 0 {
        delay
    } else {
        delay + rand::thread_rng().gen_range(0..=jitter_bound)
    }
}
