//! Database operations for Crosspost
//!
//! All state transitions that act as claims are status-conditional UPDATEs;
//! callers branch on `rows_affected` to detect a lost race.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::types::{
    Account, AnalyticsSnapshot, Capabilities, Metrics, Post, PostStatus, Target, TargetOptions,
    TargetStatus,
};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection and run migrations.
    pub async fn new(db_path: &str) -> Result<Self> {
        let pool = if db_path == ":memory:" {
            // A pooled in-memory database must stay on one connection or
            // every checkout sees a fresh empty schema.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await
                .map_err(DbError::SqlxError)?
        } else {
            let expanded_path = shellexpand::tilde(db_path).to_string();
            let path = Path::new(&expanded_path);

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }

            let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));
            SqlitePool::connect(&db_url)
                .await
                .map_err(DbError::SqlxError)?
        };

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Posts
    // ------------------------------------------------------------------

    pub async fn create_post(&self, post: &Post) -> Result<()> {
        let media = serde_json::to_string(&post.media).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            r#"
            INSERT INTO posts (id, body, status, scheduled_at, posted_at, media, last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.body)
        .bind(post.status.as_str())
        .bind(post.scheduled_at)
        .bind(post.posted_at)
        .bind(media)
        .bind(&post.last_error)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(
            r#"
            SELECT id, body, status, scheduled_at, posted_at, media, last_error, created_at, updated_at
            FROM posts WHERE id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(row_to_post))
    }

    /// Move a draft or already-scheduled post to `Scheduled` at `when`, and
    /// its non-terminal targets along with it. Returns false if the post is
    /// in a state that cannot be scheduled.
    pub async fn schedule_post(&self, post_id: &str, when: i64) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'scheduled', scheduled_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('draft', 'scheduled')
            "#,
        )
        .bind(when)
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE targets SET status = 'scheduled'
            WHERE post_id = ? AND status IN ('draft', 'scheduled')
            "#,
        )
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(true)
    }

    /// Cancel a post, allowed only while `Scheduled`. The status check is the
    /// tie-breaker against a concurrent scheduler claim: false means the
    /// claim already flipped the status.
    pub async fn cancel_post(&self, post_id: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'cancelled', updated_at = ?
            WHERE id = ? AND status = 'scheduled'
            "#,
        )
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE targets SET status = 'cancelled'
            WHERE post_id = ? AND status IN ('draft', 'scheduled')
            "#,
        )
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(true)
    }

    /// Posts due for dispatch: `Scheduled` with `scheduled_at <= now`.
    pub async fn due_scheduled_posts(&self, now: i64) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            r#"
            SELECT id, body, status, scheduled_at, posted_at, media, last_error, created_at, updated_at
            FROM posts
            WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(row_to_post).collect())
    }

    pub async fn scheduled_posts(&self) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            r#"
            SELECT id, body, status, scheduled_at, posted_at, media, last_error, created_at, updated_at
            FROM posts WHERE status = 'scheduled'
            ORDER BY scheduled_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(row_to_post).collect())
    }

    /// Atomic scheduler claim: `Scheduled -> Queued`. False when another tick
    /// (or a cancellation) got there first.
    pub async fn claim_post_for_dispatch(&self, post_id: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'queued', updated_at = ?
            WHERE id = ? AND status = 'scheduled'
            "#,
        )
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_post_status(&self, post_id: &str, status: PostStatus) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE posts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn fail_post(&self, post_id: &str, error: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE posts SET status = 'failed', last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Targets
    // ------------------------------------------------------------------

    pub async fn create_target(&self, target: &Target) -> Result<()> {
        let options = serde_json::to_string(&target.options).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            r#"
            INSERT INTO targets (id, post_id, account_id, platform, status, content_override,
                                 options, platform_post_id, platform_post_url, last_error,
                                 retry_count, last_attempt_at, posted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&target.id)
        .bind(&target.post_id)
        .bind(&target.account_id)
        .bind(&target.platform)
        .bind(target.status.as_str())
        .bind(&target.content_override)
        .bind(options)
        .bind(&target.platform_post_id)
        .bind(&target.platform_post_url)
        .bind(&target.last_error)
        .bind(target.retry_count)
        .bind(target.last_attempt_at)
        .bind(target.posted_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_target(&self, target_id: &str) -> Result<Option<Target>> {
        let row = sqlx::query(
            r#"
            SELECT id, post_id, account_id, platform, status, content_override, options,
                   platform_post_id, platform_post_url, last_error, retry_count,
                   last_attempt_at, posted_at
            FROM targets WHERE id = ?
            "#,
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(row_to_target))
    }

    pub async fn targets_for_post(&self, post_id: &str) -> Result<Vec<Target>> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, account_id, platform, status, content_override, options,
                   platform_post_id, platform_post_url, last_error, retry_count,
                   last_attempt_at, posted_at
            FROM targets WHERE post_id = ?
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(row_to_target).collect())
    }

    /// Scheduler hand-off: `Scheduled -> Queued` for one target.
    pub async fn queue_target(&self, target_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE targets SET status = 'queued' WHERE id = ? AND status = 'scheduled'",
        )
        .bind(target_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// The dispatch claim: `Queued -> Posting`, stamping the attempt time.
    /// False means the unit was already handled or cancelled and the caller
    /// must abort silently.
    pub async fn claim_target_for_posting(&self, target_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE targets SET status = 'posting', last_attempt_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(now)
        .bind(target_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_target_posted(
        &self,
        target_id: &str,
        external_id: &str,
        external_url: Option<&str>,
        posted_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE targets
            SET status = 'posted', platform_post_id = ?, platform_post_url = ?,
                posted_at = ?, last_error = NULL
            WHERE id = ? AND status = 'posting'
            "#,
        )
        .bind(external_id)
        .bind(external_url)
        .bind(posted_at)
        .bind(target_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Terminal failure, conditional on a live status so a late failure path
    /// (a stalled redelivery, for instance) can never overwrite a sibling
    /// delivery's `Posted`. False means the target already reached a terminal
    /// status and the failure is not recorded.
    pub async fn fail_target(&self, target_id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE targets SET status = 'failed', last_error = ?
            WHERE id = ? AND status IN ('scheduled', 'queued', 'posting')
            "#,
        )
        .bind(error)
        .bind(target_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Send a target back to `Queued` for another attempt, bumping the
    /// monotonically non-decreasing retry counter.
    pub async fn requeue_target(&self, target_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE targets
            SET status = 'queued', retry_count = retry_count + 1, last_error = ?
            WHERE id = ? AND status = 'posting'
            "#,
        )
        .bind(error)
        .bind(target_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Targets posted within the trailing analytics window.
    pub async fn posted_targets_since(&self, since: i64) -> Result<Vec<Target>> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, account_id, platform, status, content_override, options,
                   platform_post_id, platform_post_url, last_error, retry_count,
                   last_attempt_at, posted_at
            FROM targets
            WHERE status = 'posted' AND posted_at IS NOT NULL AND posted_at >= ?
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(row_to_target).collect())
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    pub async fn create_account(&self, account: &Account) -> Result<()> {
        let capabilities =
            serde_json::to_string(&account.capabilities).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            r#"
            INSERT INTO accounts (id, owner, platform, external_id, handle, access_token,
                                  refresh_token, expires_at, capabilities, active,
                                  refresh_failures, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.owner)
        .bind(&account.platform)
        .bind(&account.external_id)
        .bind(&account.handle)
        .bind(&account.access_token)
        .bind(&account.refresh_token)
        .bind(account.expires_at)
        .bind(capabilities)
        .bind(account.active)
        .bind(account.refresh_failures)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner, platform, external_id, handle, access_token, refresh_token,
                   expires_at, capabilities, active, refresh_failures, updated_at
            FROM accounts WHERE id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(row_to_account))
    }

    /// Active accounts whose credential expires before `before`.
    pub async fn accounts_expiring_before(&self, before: i64) -> Result<Vec<Account>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner, platform, external_id, handle, access_token, refresh_token,
                   expires_at, capabilities, active, refresh_failures, updated_at
            FROM accounts
            WHERE active = 1 AND expires_at IS NOT NULL AND expires_at <= ?
            "#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(row_to_account).collect())
    }

    /// Store a refreshed credential with optimistic concurrency on
    /// `updated_at`. False means the row changed underneath us and the
    /// refresh result is discarded.
    pub async fn update_account_credential(
        &self,
        account_id: &str,
        expected_updated_at: i64,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<i64>,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET access_token = ?, refresh_token = ?, expires_at = ?,
                refresh_failures = 0, updated_at = ?
            WHERE id = ? AND updated_at = ?
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(now)
        .bind(account_id)
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Bump the consecutive-failure counter, deactivating the account once
    /// the budget is reached. Returns the account's new active flag.
    pub async fn record_refresh_failure(&self, account_id: &str, budget: i64) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE accounts
            SET refresh_failures = refresh_failures + 1,
                active = CASE WHEN refresh_failures + 1 >= ? THEN 0 ELSE active END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(budget)
        .bind(now)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let row = sqlx::query("SELECT active FROM accounts WHERE id = ?")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.get::<bool, _>("active"))
    }

    pub async fn deactivate_account(&self, account_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE accounts SET active = 0, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Analytics
    // ------------------------------------------------------------------

    /// Append one immutable snapshot. Never updated or deleted.
    pub async fn insert_snapshot(&self, snapshot: &AnalyticsSnapshot) -> Result<()> {
        let extra =
            serde_json::to_string(&snapshot.metrics.extra).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            r#"
            INSERT INTO analytics_snapshots (target_id, captured_at, likes, shares, replies, impressions, extra)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.target_id)
        .bind(snapshot.captured_at)
        .bind(snapshot.metrics.likes)
        .bind(snapshot.metrics.shares)
        .bind(snapshot.metrics.replies)
        .bind(snapshot.metrics.impressions)
        .bind(extra)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn upsert_latest_metrics(
        &self,
        target_id: &str,
        metrics: &Metrics,
        captured_at: i64,
    ) -> Result<()> {
        let extra = serde_json::to_string(&metrics.extra).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            r#"
            INSERT INTO target_metrics (target_id, captured_at, likes, shares, replies, impressions, extra)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (target_id) DO UPDATE SET
                captured_at = excluded.captured_at,
                likes = excluded.likes,
                shares = excluded.shares,
                replies = excluded.replies,
                impressions = excluded.impressions,
                extra = excluded.extra
            "#,
        )
        .bind(target_id)
        .bind(captured_at)
        .bind(metrics.likes)
        .bind(metrics.shares)
        .bind(metrics.replies)
        .bind(metrics.impressions)
        .bind(extra)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn latest_metrics(&self, target_id: &str) -> Result<Option<(i64, Metrics)>> {
        let row = sqlx::query(
            r#"
            SELECT captured_at, likes, shares, replies, impressions, extra
            FROM target_metrics WHERE target_id = ?
            "#,
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| (r.get("captured_at"), row_to_metrics(&r))))
    }

    pub async fn snapshots_for_target(&self, target_id: &str) -> Result<Vec<AnalyticsSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT id, target_id, captured_at, likes, shares, replies, impressions, extra
            FROM analytics_snapshots
            WHERE target_id = ?
            ORDER BY captured_at ASC, id ASC
            "#,
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .into_iter()
            .map(|r| AnalyticsSnapshot {
                id: Some(r.get("id")),
                target_id: r.get("target_id"),
                captured_at: r.get("captured_at"),
                metrics: row_to_metrics(&r),
            })
            .collect())
    }
}

fn row_to_post(r: SqliteRow) -> Post {
    let media: Vec<String> =
        serde_json::from_str(&r.get::<String, _>("media")).unwrap_or_default();

    Post {
        id: r.get("id"),
        body: r.get("body"),
        status: PostStatus::parse(&r.get::<String, _>("status")).unwrap_or(PostStatus::Draft),
        scheduled_at: r.get("scheduled_at"),
        posted_at: r.get("posted_at"),
        media,
        last_error: r.get("last_error"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn row_to_target(r: SqliteRow) -> Target {
    let options: TargetOptions = r
        .get::<Option<String>, _>("options")
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Target {
        id: r.get("id"),
        post_id: r.get("post_id"),
        account_id: r.get("account_id"),
        platform: r.get("platform"),
        status: TargetStatus::parse(&r.get::<String, _>("status")).unwrap_or(TargetStatus::Draft),
        content_override: r.get("content_override"),
        options,
        platform_post_id: r.get("platform_post_id"),
        platform_post_url: r.get("platform_post_url"),
        last_error: r.get("last_error"),
        retry_count: r.get("retry_count"),
        last_attempt_at: r.get("last_attempt_at"),
        posted_at: r.get("posted_at"),
    }
}

fn row_to_account(r: SqliteRow) -> Account {
    let capabilities: Capabilities =
        serde_json::from_str(&r.get::<String, _>("capabilities")).unwrap_or_default();

    Account {
        id: r.get("id"),
        owner: r.get("owner"),
        platform: r.get("platform"),
        external_id: r.get("external_id"),
        handle: r.get("handle"),
        access_token: r.get("access_token"),
        refresh_token: r.get("refresh_token"),
        expires_at: r.get("expires_at"),
        capabilities,
        active: r.get("active"),
        refresh_failures: r.get("refresh_failures"),
        updated_at: r.get("updated_at"),
    }
}

fn row_to_metrics(r: &SqliteRow) -> Metrics {
    let extra = r
        .get::<Option<String>, _>("extra")
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Metrics {
        likes: r.get("likes"),
        shares: r.get("shares"),
        replies: r.get("replies"),
        impressions: r.get("impressions"),
        extra,
    }
}
