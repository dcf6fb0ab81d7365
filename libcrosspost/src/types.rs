//! Core types for Crosspost

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate status of a post. Apart from `Draft` and `Cancelled`, this is a
/// pure function of the post's target statuses and is only written by the
/// status aggregator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PostStatus {
    Draft,
    Scheduled,
    Queued,
    Posting,
    Posted,
    Failed,
    Cancelled,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Posting => "posting",
            Self::Posted => "posted",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "scheduled" => Some(Self::Scheduled),
            "queued" => Some(Self::Queued),
            "posting" => Some(Self::Posting),
            "posted" => Some(Self::Posted),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Per-target delivery status.
///
/// `Queued -> Posting` is the atomic claim point: the coordinator performs a
/// status-conditional update and treats a lost race as "already handled".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TargetStatus {
    Draft,
    Scheduled,
    Queued,
    Posting,
    Posted,
    Failed,
    Cancelled,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Posting => "posting",
            Self::Posted => "posted",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "scheduled" => Some(Self::Scheduled),
            "queued" => Some(Self::Queued),
            "posting" => Some(Self::Posting),
            "posted" => Some(Self::Posted),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never leave the state machine again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Posted | Self::Failed | Self::Cancelled)
    }
}

/// Owning content unit. Targets cascade with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub body: String,
    pub status: PostStatus,
    pub scheduled_at: Option<i64>,
    pub posted_at: Option<i64>,
    /// Opaque references to already-uploaded media, resolved by the external
    /// media collaborator.
    pub media: Vec<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Post {
    pub fn new(body: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            body,
            status: PostStatus::Draft,
            scheduled_at: None,
            posted_at: None,
            media: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Platform-specific posting options: hashtags, mentions, visibility and
/// whatever else a platform understands. Open string-keyed map so adapters can
/// pick out what they know.
pub type TargetOptions = HashMap<String, serde_json::Value>;

/// One (post, account) delivery unit with independent status and failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub post_id: String,
    /// Account identity recorded at creation time; not a live lock on the
    /// account row.
    pub account_id: String,
    pub platform: String,
    pub status: TargetStatus,
    pub content_override: Option<String>,
    pub options: TargetOptions,
    pub platform_post_id: Option<String>,
    pub platform_post_url: Option<String>,
    pub last_error: Option<String>,
    pub retry_count: i64,
    pub last_attempt_at: Option<i64>,
    pub posted_at: Option<i64>,
}

impl Target {
    pub fn new(post_id: String, account_id: String, platform: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            post_id,
            account_id,
            platform,
            status: TargetStatus::Draft,
            content_override: None,
            options: TargetOptions::new(),
            platform_post_id: None,
            platform_post_url: None,
            last_error: None,
            retry_count: 0,
            last_attempt_at: None,
            posted_at: None,
        }
    }
}

/// Static per-platform limits used for local validation before any network
/// call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    /// Maximum characters per post, `None` if the platform has no hard limit.
    pub char_limit: Option<usize>,
    pub max_media: usize,
    pub media_types: Vec<String>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            char_limit: None,
            max_media: 4,
            media_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/gif".to_string(),
                "image/webp".to_string(),
            ],
        }
    }
}

/// A user's credential binding to one platform.
///
/// Mutated only by the credential refresh monitor and the connect/disconnect
/// flow; deactivated rather than deleted when revoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub owner: String,
    pub platform: String,
    pub external_id: String,
    pub handle: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub capabilities: Capabilities,
    pub active: bool,
    /// Consecutive refresh failures; reset on success, deactivates the
    /// account once the configured budget is exceeded.
    pub refresh_failures: i64,
    pub updated_at: i64,
}

impl Account {
    pub fn new(owner: String, platform: String, external_id: String, access_token: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner,
            platform,
            external_id,
            handle: None,
            access_token,
            refresh_token: None,
            expires_at: None,
            capabilities: Capabilities::default(),
            active: true,
            refresh_failures: 0,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Refreshed credential returned by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}

/// Result of posting through an adapter.
#[derive(Debug, Clone)]
pub struct PublishedPost {
    pub external_id: String,
    pub external_url: Option<String>,
    pub posted_at: i64,
}

/// Engagement metrics returned by `fetch_analytics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub likes: i64,
    pub shares: i64,
    pub replies: i64,
    pub impressions: i64,
    /// Platform-specific overflow the common fields do not cover.
    pub extra: HashMap<String, serde_json::Value>,
}

/// Immutable, timestamped metric capture for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub id: Option<i64>,
    pub target_id: String,
    pub captured_at: i64,
    pub metrics: Metrics,
}

/// Outcome of local content validation. Pure; no network call.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn valid() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_new_defaults() {
        let post = Post::new("Hello world".to_string());
        assert!(Uuid::parse_str(&post.id).is_ok());
        assert_eq!(post.status, PostStatus::Draft);
        assert_eq!(post.scheduled_at, None);
        assert!(post.media.is_empty());
        assert_eq!(post.created_at, post.updated_at);
    }

    #[test]
    fn test_post_new_unique_ids() {
        let a = Post::new("a".to_string());
        let b = Post::new("b".to_string());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_target_new_defaults() {
        let target = Target::new("p1".to_string(), "a1".to_string(), "mastodon".to_string());
        assert_eq!(target.status, TargetStatus::Draft);
        assert_eq!(target.retry_count, 0);
        assert!(target.platform_post_id.is_none());
        assert!(target.options.is_empty());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            PostStatus::Draft,
            PostStatus::Scheduled,
            PostStatus::Queued,
            PostStatus::Posting,
            PostStatus::Posted,
            PostStatus::Failed,
            PostStatus::Cancelled,
        ] {
            assert_eq!(PostStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PostStatus::parse("bogus"), None);
    }

    #[test]
    fn test_target_status_terminal() {
        assert!(TargetStatus::Posted.is_terminal());
        assert!(TargetStatus::Failed.is_terminal());
        assert!(TargetStatus::Cancelled.is_terminal());
        assert!(!TargetStatus::Queued.is_terminal());
        assert!(!TargetStatus::Posting.is_terminal());
        assert!(!TargetStatus::Scheduled.is_terminal());
    }

    #[test]
    fn test_capabilities_default() {
        let caps = Capabilities::default();
        assert_eq!(caps.char_limit, None);
        assert_eq!(caps.max_media, 4);
        assert!(caps.media_types.contains(&"image/png".to_string()));
    }

    #[test]
    fn test_validation_report() {
        assert!(ValidationReport::valid().is_valid());
        let report = ValidationReport {
            errors: vec!["too long".to_string()],
        };
        assert!(!report.is_valid());
    }

    #[test]
    fn test_account_new_active() {
        let account = Account::new(
            "user-1".to_string(),
            "mastodon".to_string(),
            "42".to_string(),
            "token".to_string(),
        );
        assert!(account.active);
        assert_eq!(account.refresh_failures, 0);
        assert_eq!(account.capabilities, Capabilities::default());
    }

    #[test]
    fn test_metrics_serialization() {
        let mut metrics = Metrics {
            likes: 3,
            shares: 1,
            replies: 0,
            impressions: 120,
            extra: HashMap::new(),
        };
        metrics
            .extra
            .insert("bookmarks".to_string(), serde_json::json!(2));

        let json = serde_json::to_string(&metrics).unwrap();
        let back: Metrics = serde_json::from_str(&json).unwrap();
        assert_eq!(back.likes, 3);
        assert_eq!(back.impressions, 120);
        assert_eq!(back.extra["bookmarks"], serde_json::json!(2));
    }
}
