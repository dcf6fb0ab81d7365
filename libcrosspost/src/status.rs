//! Post status aggregation
//!
//! A post's status (apart from `Draft` and `Cancelled`) is a pure function of
//! its target statuses. The aggregation runs after every target transition so
//! the post row always reflects the state of its fan-out.

use sqlx::Row;

use crate::config::AggregationPolicy;
use crate::db::Database;
use crate::error::{DbError, Result};
use crate::types::{PostStatus, TargetStatus};

/// Compute the post status implied by its target statuses.
///
/// Cancelled targets are excluded: a post whose remaining targets all posted
/// is `Posted` even if one destination was cancelled along the way. Returns
/// `None` when there is nothing to conclude (no live targets).
pub fn aggregate(statuses: &[TargetStatus], policy: AggregationPolicy) -> Option<PostStatus> {
    let live: Vec<TargetStatus> = statuses
        .iter()
        .copied()
        .filter(|s| *s != TargetStatus::Cancelled)
        .collect();

    if live.is_empty() {
        return None;
    }

    let any_failed = live.iter().any(|s| *s == TargetStatus::Failed);
    if policy == AggregationPolicy::FailFast && any_failed {
        return Some(PostStatus::Failed);
    }

    if live.iter().all(|s| s.is_terminal()) {
        return Some(if any_failed {
            PostStatus::Failed
        } else {
            PostStatus::Posted
        });
    }

    // Interim: report the most advanced in-flight stage.
    if live.iter().any(|s| *s == TargetStatus::Posting) {
        Some(PostStatus::Posting)
    } else if live.iter().any(|s| *s == TargetStatus::Queued) {
        Some(PostStatus::Queued)
    } else if live.iter().any(|s| *s == TargetStatus::Scheduled) {
        Some(PostStatus::Scheduled)
    } else {
        None
    }
}

/// Recompute and persist a post's aggregate status from its current targets.
///
/// Draft and cancelled posts are left alone; those statuses are owned by the
/// user-facing operations, not the aggregator.
///
/// The target read and the post write run in one immediate transaction. Two
/// targets finishing concurrently each recompute against a stable snapshot,
/// so whichever runs last sees both terminal rows and concludes the post.
pub async fn recompute_post_status(
    db: &Database,
    post_id: &str,
    policy: AggregationPolicy,
) -> Result<Option<PostStatus>> {
    let mut conn = db.pool().acquire().await.map_err(DbError::SqlxError)?;

    // BEGIN IMMEDIATE takes the write lock before the read, serializing
    // concurrent recomputes instead of letting them interleave.
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *conn)
        .await
        .map_err(DbError::SqlxError)?;

    let result = recompute_in_txn(&mut conn, post_id, policy).await;

    match &result {
        Ok(_) => {
            sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .map_err(DbError::SqlxError)?;
        }
        Err(_) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
        }
    }

    result
}

async fn recompute_in_txn(
    conn: &mut sqlx::SqliteConnection,
    post_id: &str,
    policy: AggregationPolicy,
) -> Result<Option<PostStatus>> {
    let Some(row) = sqlx::query("SELECT status FROM posts WHERE id = ?")
        .bind(post_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DbError::SqlxError)?
    else {
        return Ok(None);
    };

    let current =
        PostStatus::parse(&row.get::<String, _>("status")).unwrap_or(PostStatus::Draft);
    if matches!(current, PostStatus::Draft | PostStatus::Cancelled) {
        return Ok(None);
    }

    let rows = sqlx::query("SELECT status, posted_at FROM targets WHERE post_id = ?")
        .bind(post_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(DbError::SqlxError)?;

    let statuses: Vec<TargetStatus> = rows
        .iter()
        .map(|r| {
            TargetStatus::parse(&r.get::<String, _>("status")).unwrap_or(TargetStatus::Draft)
        })
        .collect();

    let Some(next) = aggregate(&statuses, policy) else {
        return Ok(None);
    };

    if next != current {
        let now = chrono::Utc::now().timestamp();
        let posted_at: Option<i64> = if next == PostStatus::Posted {
            rows.iter()
                .filter_map(|r| r.get::<Option<i64>, _>("posted_at"))
                .max()
        } else {
            None
        };

        sqlx::query(
            "UPDATE posts SET status = ?, posted_at = COALESCE(?, posted_at), updated_at = ? WHERE id = ?",
        )
        .bind(next.as_str())
        .bind(posted_at)
        .bind(now)
        .bind(post_id)
        .execute(&mut *conn)
        .await
        .map_err(DbError::SqlxError)?;

        tracing::debug!(post_id, status = next.as_str(), "post status aggregated");
    }

    Ok(Some(next))
}
