//! Credential refresh monitor
//!
//! The periodic tick enqueues one refresh unit per account whose credential
//! expires inside the lookahead window; workers consume the units through
//! [`refresh_account`](CredentialRefreshMonitor::refresh_account). Refreshes
//! are serialized per account with an in-process lock, and the stored update
//! is optimistic on `updated_at` so a credential changed by another path is
//! never clobbered with a stale refresh result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::platforms::bounded;
use crate::platforms::registry::AdapterRegistry;
use crate::queue::{WorkKind, WorkQueue};

pub struct CredentialRefreshMonitor {
    db: Database,
    registry: Arc<AdapterRegistry>,
    queue: Arc<dyn WorkQueue>,
    config: Config,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialRefreshMonitor {
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
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once no task holds or waits on it, so the map
    /// does not accumulate entries for deleted or deactivated accounts.
    async fn release_lock(&self, account_id: &str) {
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(account_id) {
            if Arc::strong_count(entry) == 1 {
                locks.remove(account_id);
            }
        }
    }

    #[cfg(test)]
    async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// One pass over accounts expiring within the lookahead window: each gets
    /// a refresh unit on the work queue. Returns the number of units
    /// enqueued.
    pub async fn tick(&self, now: i64) -> Result<usize> {
        let horizon = now + self.config.refresh.lookahead_days * 86_400;
        let expiring = self.db.accounts_expiring_before(horizon).await?;
        let mut enqueued = 0;

        for account in &expiring {
            self.queue
                .enqueue(WorkKind::Refresh, &account.id, 0, now)
                .await?;
            enqueued += 1;
        }

        Ok(enqueued)
    }

    /// Refresh one account's credential. Returns true if a new credential was
    /// stored.
    pub async fn refresh_account(&self, account_id: &str) -> Result<bool> {
        let lock = self.lock_for(account_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(account_id).await
        };
        drop(lock);
        self.release_lock(account_id).await;
        result
    }

    async fn refresh_locked(&self, account_id: &str) -> Result<bool> {
        // Reload under the lock; the row may have changed while we waited.
        let Some(account) = self.db.get_account(account_id).await? else {
            return Ok(false);
        };
        if !account.active {
            return Ok(false);
        }

        let adapter = match self.registry.resolve(&account, &self.config) {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::warn!(account_id, error = %e, "cannot refresh, adapter unavailable");
                self.record_failure(account_id).await?;
                return Ok(false);
            }
        };

        let timeout = self.config.dispatch.adapter_timeout_secs;
        match bounded(timeout, "refresh credential", adapter.refresh_credential(&account)).await {
            Ok(credential) => {
                let stored = self
                    .db
                    .update_account_credential(
                        account_id,
                        account.updated_at,
                        &credential.access_token,
                        credential.refresh_token.as_deref(),
                        credential.expires_at,
                    )
                    .await?;

                if stored {
                    tracing::info!(account_id, "credential refreshed");
                } else {
                    // The account changed underneath us; the fresh row wins.
                    tracing::warn!(account_id, "credential changed concurrently, refresh discarded");
                }
                Ok(stored)
            }
            Err(e) => {
                tracing::warn!(account_id, error = %e, "credential refresh failed");
                self.record_failure(account_id).await?;
                Ok(false)
            }
        }
    }

    async fn record_failure(&self, account_id: &str) -> Result<()> {
        let still_active = self
            .db
            .record_refresh_failure(account_id, self.config.refresh.max_consecutive_failures)
            .await?;

        if !still_active {
            tracing::warn!(
                account_id,
                budget = self.config.refresh.max_consecutive_failures,
                "account deactivated after consecutive refresh failures"
            );
        }

        Ok(())
    }

    /// Poll until the shutdown flag is raised.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.refresh.interval_secs));

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            let now = chrono::Utc::now().timestamp();
            match self.tick(now).await {
                Ok(0) => {}
                Ok(enqueued) => tracing::info!(enqueued, "refresh units enqueued"),
                Err(e) => tracing::error!(error = %e, "refresh pass failed"),
            }
        }

        tracing::info!("credential refresh monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;
    use crate::platforms::mock::MockAdapter;
    use crate::platforms::Adapter;
    use crate::queue::SqliteQueue;
    use crate::types::{Account, Credential};

    struct Harness {
        db: Database,
        queue: Arc<SqliteQueue>,
        monitor: CredentialRefreshMonitor,
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

        let monitor = CredentialRefreshMonitor::new(
            db.clone(),
            Arc::new(registry),
            queue.clone(),
            Config::default(),
        );

        Harness {
            db,
            queue,
            monitor,
            adapter,
        }
    }

    /// Consume enqueued refresh units the way a worker does.
    async fn run_due_units(h: &Harness) -> usize {
        let now = chrono::Utc::now().timestamp();
        let units = h.queue.lease_due(now, 64, 60).await.unwrap();
        let mut refreshed = 0;
        for unit in units {
            assert_eq!(unit.kind, WorkKind::Refresh);
            if h.monitor.refresh_account(&unit.subject_id).await.unwrap() {
                refreshed += 1;
            }
            h.queue.ack(unit.id).await.unwrap();
        }
        refreshed
    }

    async fn seed_expiring_account(db: &Database, expires_in_secs: i64) -> Account {
        let mut account = Account::new(
            "owner".to_string(),
            "mock".to_string(),
            "ext".to_string(),
            "old-token".to_string(),
        );
        account.expires_at = Some(chrono::Utc::now().timestamp() + expires_in_secs);
        db.create_account(&account).await.unwrap();
        account
    }

    #[tokio::test]
    async fn test_expiring_credential_refreshed_through_queue() {
        let h = harness(MockAdapter::success("mock")).await;
        let account = seed_expiring_account(&h.db, 3600).await;
        h.adapter.set_credential(Credential {
            access_token: "fresh-token".to_string(),
            refresh_token: Some("fresh-refresh".to_string()),
            expires_at: Some(chrono::Utc::now().timestamp() + 100_000),
        });

        let now = chrono::Utc::now().timestamp();
        assert_eq!(h.monitor.tick(now).await.unwrap(), 1);
        assert_eq!(run_due_units(&h).await, 1);

        let loaded = h.db.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "fresh-token");
        assert_eq!(loaded.refresh_token, Some("fresh-refresh".to_string()));
        assert_eq!(loaded.refresh_failures, 0);
        assert_eq!(h.adapter.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_account_outside_lookahead_not_enqueued() {
        let h = harness(MockAdapter::success("mock")).await;
        // Expires well past the 7-day lookahead.
        let account = seed_expiring_account(&h.db, 30 * 86_400).await;

        let now = chrono::Utc::now().timestamp();
        assert_eq!(h.monitor.tick(now).await.unwrap(), 0);
        assert!(h.queue.lease_due(now, 64, 60).await.unwrap().is_empty());

        let loaded = h.db.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "old-token");
        assert_eq!(h.adapter.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_failure_increments_counter() {
        let h = harness(MockAdapter::failing_with(
            "mock",
            vec![AdapterError::Transient("provider down".to_string())],
        ))
        .await;
        let account = seed_expiring_account(&h.db, 3600).await;

        let now = chrono::Utc::now().timestamp();
        assert_eq!(h.monitor.tick(now).await.unwrap(), 1);
        assert_eq!(run_due_units(&h).await, 0);

        let loaded = h.db.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(loaded.refresh_failures, 1);
        assert!(loaded.active);
        // Token unchanged on failure.
        assert_eq!(loaded.access_token, "old-token");
    }

    #[tokio::test]
    async fn test_consecutive_failures_deactivate() {
        let h = harness(MockAdapter::failing_with(
            "mock",
            vec![
                AdapterError::Authentication("revoked".to_string()),
                AdapterError::Authentication("revoked".to_string()),
                AdapterError::Authentication("revoked".to_string()),
            ],
        ))
        .await;
        let account = seed_expiring_account(&h.db, 3600).await;

        for _ in 0..3 {
            h.monitor.refresh_account(&account.id).await.unwrap();
        }

        let loaded = h.db.get_account(&account.id).await.unwrap().unwrap();
        assert!(!loaded.active);
        assert_eq!(loaded.refresh_failures, 3);

        // Deactivated accounts are skipped entirely.
        assert!(!h.monitor.refresh_account(&account.id).await.unwrap());
        assert_eq!(h.adapter.refresh_calls(), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter() {
        let h = harness(MockAdapter::failing_with(
            "mock",
            vec![AdapterError::Transient("blip".to_string())],
        ))
        .await;
        let account = seed_expiring_account(&h.db, 3600).await;

        assert!(!h.monitor.refresh_account(&account.id).await.unwrap());
        assert_eq!(
            h.db.get_account(&account.id)
                .await
                .unwrap()
                .unwrap()
                .refresh_failures,
            1
        );

        // Scripted failure drained; next attempt succeeds and resets.
        assert!(h.monitor.refresh_account(&account.id).await.unwrap());
        let loaded = h.db.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(loaded.refresh_failures, 0);
    }

    #[tokio::test]
    async fn test_account_lock_released_after_refresh() {
        let h = harness(MockAdapter::success("mock")).await;
        let account = seed_expiring_account(&h.db, 3600).await;

        h.monitor.refresh_account(&account.id).await.unwrap();
        assert_eq!(h.monitor.lock_count().await, 0);

        // An account that disappears does not leave an entry behind either.
        h.monitor.refresh_account("gone").await.unwrap();
        assert_eq!(h.monitor.lock_count().await, 0);
    }
}
