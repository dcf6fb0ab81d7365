//! Durable work queue
//!
//! Transports dispatch, credential-refresh, and analytics units between the
//! periodic triggers and the workers. Delivery is at-least-once: a leased
//! unit that is never acked becomes visible again when its lease expires, and
//! the status-guarded claims downstream make redelivery harmless.

use async_trait::async_trait;
use sqlx::Row;

use crate::db::Database;
use crate::error::{DbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    /// One target to deliver.
    Dispatch,
    /// One account to refresh.
    Refresh,
    /// One target to re-sample metrics for.
    Analytics,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Refresh => "refresh",
            Self::Analytics => "analytics",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dispatch" => Some(Self::Dispatch),
            "refresh" => Some(Self::Refresh),
            "analytics" => Some(Self::Analytics),
            _ => None,
        }
    }
}

/// One unit of background work.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub id: i64,
    pub kind: WorkKind,
    /// Target id for dispatch/analytics units, account id for refresh units.
    pub subject_id: String,
    pub attempt: i64,
    pub not_before: i64,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(
        &self,
        kind: WorkKind,
        subject_id: &str,
        attempt: i64,
        not_before: i64,
    ) -> Result<()>;

    /// Lease up to `limit` due units for `lease_secs`. A leased unit is
    /// invisible to other consumers until acked or lease expiry.
    async fn lease_due(&self, now: i64, limit: i64, lease_secs: i64) -> Result<Vec<WorkUnit>>;

    /// Remove a completed unit.
    async fn ack(&self, unit_id: i64) -> Result<()>;
}

/// SQLite-backed queue sharing the engine's connection pool.
#[derive(Clone)]
pub struct SqliteQueue {
    db: Database,
}

impl SqliteQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    async fn enqueue(
        &self,
        kind: WorkKind,
        subject_id: &str,
        attempt: i64,
        not_before: i64,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO work_units (kind, subject_id, attempt, not_before, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(kind.as_str())
        .bind(subject_id)
        .bind(attempt)
        .bind(not_before)
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn lease_due(&self, now: i64, limit: i64, lease_secs: i64) -> Result<Vec<WorkUnit>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, subject_id, attempt, not_before
            FROM work_units
            WHERE not_before <= ? AND (leased_until IS NULL OR leased_until <= ?)
            ORDER BY not_before ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let mut leased = Vec::new();
        for row in rows {
            let id: i64 = row.get("id");
            // Conditional lease so two pollers never hand out the same unit.
            let result = sqlx::query(
                r#"
                UPDATE work_units SET leased_until = ?
                WHERE id = ? AND (leased_until IS NULL OR leased_until <= ?)
                "#,
            )
            .bind(now + lease_secs)
            .bind(id)
            .bind(now)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

            if result.rows_affected() == 0 {
                continue;
            }

            let kind = match WorkKind::parse(&row.get::<String, _>("kind")) {
                Some(kind) => kind,
                None => continue,
            };

            leased.push(WorkUnit {
                id,
                kind,
                subject_id: row.get("subject_id"),
                attempt: row.get("attempt"),
                not_before: row.get("not_before"),
            });
        }

        Ok(leased)
    }

    async fn ack(&self, unit_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM work_units WHERE id = ?")
            .bind(unit_id)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn mem_queue() -> SqliteQueue {
        SqliteQueue::new(Database::new(":memory:").await.unwrap())
    }

    #[tokio::test]
    async fn test_enqueue_and_lease() {
        let queue = mem_queue().await;
        let now = chrono::Utc::now().timestamp();

        queue
            .enqueue(WorkKind::Dispatch, "target-1", 0, now - 1)
            .await
            .unwrap();
        queue
            .enqueue(WorkKind::Refresh, "account-1", 0, now + 3600)
            .await
            .unwrap();

        let due = queue.lease_due(now, 10, 300).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, WorkKind::Dispatch);
        assert_eq!(due[0].subject_id, "target-1");
    }

    #[tokio::test]
    async fn test_leased_unit_not_handed_out_twice() {
        let queue = mem_queue().await;
        let now = chrono::Utc::now().timestamp();

        queue
            .enqueue(WorkKind::Dispatch, "target-1", 0, now)
            .await
            .unwrap();

        let first = queue.lease_due(now, 10, 300).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = queue.lease_due(now, 10, 300).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_lease_expiry_redelivers() {
        let queue = mem_queue().await;
        let now = chrono::Utc::now().timestamp();

        queue
            .enqueue(WorkKind::Analytics, "target-2", 1, now)
            .await
            .unwrap();

        let first = queue.lease_due(now, 10, 60).await.unwrap();
        assert_eq!(first.len(), 1);

        // After the lease window the unit is visible again.
        let later = now + 61;
        let redelivered = queue.lease_due(later, 10, 60).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].subject_id, "target-2");
        assert_eq!(redelivered[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_ack_removes_unit() {
        let queue = mem_queue().await;
        let now = chrono::Utc::now().timestamp();

        queue
            .enqueue(WorkKind::Dispatch, "target-3", 0, now)
            .await
            .unwrap();

        let units = queue.lease_due(now, 10, 60).await.unwrap();
        queue.ack(units[0].id).await.unwrap();

        let later = now + 120;
        assert!(queue.lease_due(later, 10, 60).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ordering_by_due_time() {
        let queue = mem_queue().await;
        let now = chrono::Utc::now().timestamp();

        queue
            .enqueue(WorkKind::Dispatch, "late", 0, now - 10)
            .await
            .unwrap();
        queue
            .enqueue(WorkKind::Dispatch, "early", 0, now - 60)
            .await
            .unwrap();

        let due = queue.lease_due(now, 10, 60).await.unwrap();
        assert_eq!(due[0].subject_id, "early");
        assert_eq!(due[1].subject_id, "late");
    }
}
