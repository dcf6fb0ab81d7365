//! Platform adapter contract and implementations
//!
//! One adapter per target platform normalizes posting, validation, deletion,
//! analytics, and credential refresh into a uniform contract. Adapters own
//! their protocol details; the dispatch coordinator only ever sees the
//! operations below and the error taxonomy in `crate::error`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{AdapterError, AdapterResult};
use crate::types::{Account, Capabilities, Credential, Metrics, PublishedPost, TargetOptions, ValidationReport};

pub mod mastodon;
pub mod nostr;
pub mod registry;

// Mock adapter is available for all builds (not just tests) to support
// integration tests.
pub mod mock;

/// Outcome of deleting an external post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The external post no longer exists; treated as success by callers.
    NotFound,
}

/// Uniform contract implemented once per platform.
///
/// Adapters hold no long-lived mutable state beyond what their underlying
/// client needs; the registry constructs a fresh instance per resolution.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Lowercase platform identifier (e.g. "mastodon", "nostr").
    fn name(&self) -> &str;

    /// Static limits used for local validation before any network call.
    fn capabilities(&self) -> Capabilities;

    /// Pure content check against the capability descriptor. Failures are
    /// deterministic and never retried.
    fn validate_content(&self, text: &str, media_count: usize) -> ValidationReport {
        let caps = self.capabilities();
        let mut errors = Vec::new();

        if text.trim().is_empty() {
            errors.push("Content cannot be empty".to_string());
        }

        if let Some(limit) = caps.char_limit {
            let chars = text.chars().count();
            if chars > limit {
                errors.push(format!(
                    "Content exceeds {} character limit (current: {} characters)",
                    limit, chars
                ));
            }
        }

        if media_count > caps.max_media {
            errors.push(format!(
                "Too many media attachments: {} (maximum: {})",
                media_count, caps.max_media
            ));
        }

        ValidationReport { errors }
    }

    /// Publish plain text.
    async fn post_text(&self, text: &str, options: &TargetOptions) -> AdapterResult<PublishedPost>;

    /// Publish text with already-uploaded media, referenced opaquely.
    async fn post_with_media(
        &self,
        text: &str,
        media: &[String],
        options: &TargetOptions,
    ) -> AdapterResult<PublishedPost>;

    /// Delete an external post.
    async fn delete_post(&self, external_id: &str) -> AdapterResult<DeleteOutcome>;

    /// Fetch current engagement metrics for an external post.
    async fn fetch_analytics(&self, external_id: &str) -> AdapterResult<Metrics>;

    /// Obtain a fresh credential for the account.
    ///
    /// Invoked only by the credential refresh monitor, never inline during a
    /// dispatch, so concurrent dispatches to one account cannot race a
    /// refresh.
    async fn refresh_credential(&self, account: &Account) -> AdapterResult<Credential>;
}

/// Bound an adapter network call. No adapter may block indefinitely: on
/// expiry the call fails as a transient error and enters the normal retry
/// path.
pub async fn bounded<T, F>(timeout_secs: u64, operation: &str, fut: F) -> AdapterResult<T>
where
    F: Future<Output = AdapterResult<T>>,
{
    match tokio::time::timeout(Duration::from_secs(timeout_secs), fut).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Transient(format!(
            "{} timed out after {}s",
            operation, timeout_secs
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockAdapter;
    use super::*;

    #[test]
    fn test_default_validation_char_limit() {
        let adapter = MockAdapter::with_limit("mock", 280);

        assert!(adapter.validate_content("Hello world", 0).is_valid());

        let long = "x".repeat(300);
        let report = adapter.validate_content(&long, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("280"));
    }

    #[test]
    fn test_default_validation_media_count() {
        let adapter = MockAdapter::success("mock");
        let report = adapter.validate_content("ok", 9);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("media"));
    }

    #[test]
    fn test_default_validation_empty_content() {
        let adapter = MockAdapter::success("mock");
        assert!(!adapter.validate_content("   ", 0).is_valid());
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: AdapterResult<()> = bounded(0, "slow call", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(AdapterError::Transient(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected transient timeout, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_bounded_passes_through() {
        let result = bounded(5, "fast call", async { Ok::<_, AdapterError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
