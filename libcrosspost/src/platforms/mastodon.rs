//! Mastodon platform adapter
//!
//! Integration with Mastodon and other Fediverse platforms that implement the
//! Mastodon API, using the megalodon library. The account's handle
//! (`user@instance.tld`) determines the instance URL; the access token comes
//! from the account record.

use async_trait::async_trait;
use megalodon::{Megalodon, SNS};

use crate::error::{AdapterError, AdapterResult};
use crate::types::{
    Account, Capabilities, Credential, Metrics, PublishedPost, TargetOptions,
};

use super::{Adapter, DeleteOutcome};

/// Default character limit, used until the account record carries an
/// instance-specific one.
const DEFAULT_CHAR_LIMIT: usize = 500;

pub struct MastodonAdapter {
    client: Box<dyn Megalodon + Send + Sync>,
    capabilities: Capabilities,
    refresh_token: Option<String>,
}

impl MastodonAdapter {
    /// Build an adapter for one Mastodon account.
    ///
    /// The instance URL is derived from the account handle, which must be in
    /// `user@instance.tld` form.
    pub fn new(account: &Account) -> AdapterResult<Self> {
        let instance_url = instance_url_from_handle(account)?;

        let client = megalodon::generator(
            SNS::Mastodon,
            instance_url,
            Some(account.access_token.clone()),
            None,
        )
        .map_err(|e| {
            AdapterError::Authentication(format!("Failed to create Mastodon client: {:?}", e))
        })?;

        let mut capabilities = account.capabilities.clone();
        if capabilities.char_limit.is_none() {
            capabilities.char_limit = Some(DEFAULT_CHAR_LIMIT);
        }

        Ok(Self {
            client,
            capabilities,
            refresh_token: account.refresh_token.clone(),
        })
    }

    /// Query the instance for its actual status character limit.
    pub async fn fetch_instance_limit(&mut self) -> AdapterResult<usize> {
        let response = self
            .client
            .get_instance()
            .await
            .map_err(|e| map_megalodon_error(e, "fetch instance info"))?;

        let limit = response.json.configuration.statuses.max_characters as usize;
        self.capabilities.char_limit = Some(limit);
        Ok(limit)
    }

    fn status_options(
        &self,
        media_ids: Option<Vec<String>>,
        options: &TargetOptions,
    ) -> megalodon::megalodon::PostStatusInputOptions {
        let mut input = megalodon::megalodon::PostStatusInputOptions {
            media_ids,
            ..Default::default()
        };

        if let Some(spoiler) = options.get("spoiler_text").and_then(|v| v.as_str()) {
            input.spoiler_text = Some(spoiler.to_string());
        }

        if let Some(visibility) = options.get("visibility").and_then(|v| v.as_str()) {
            use megalodon::entities::StatusVisibility;
            input.visibility = match visibility {
                "public" => Some(StatusVisibility::Public),
                "unlisted" => Some(StatusVisibility::Unlisted),
                "private" => Some(StatusVisibility::Private),
                "direct" => Some(StatusVisibility::Direct),
                _ => None,
            };
        }

        input
    }

    async fn publish(
        &self,
        text: &str,
        input: megalodon::megalodon::PostStatusInputOptions,
    ) -> AdapterResult<PublishedPost> {
        let response = self
            .client
            .post_status(text.to_string(), Some(&input))
            .await
            .map_err(|e| map_megalodon_error(e, "post status"))?;

        let (external_id, external_url) = match response.json {
            megalodon::megalodon::PostStatusOutput::Status(status) => (status.id, status.url),
            megalodon::megalodon::PostStatusOutput::ScheduledStatus(scheduled) => {
                (scheduled.id, None)
            }
        };

        Ok(PublishedPost {
            external_id,
            external_url,
            posted_at: chrono::Utc::now().timestamp(),
        })
    }
}

#[async_trait]
impl Adapter for MastodonAdapter {
    fn name(&self) -> &str {
        "mastodon"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn post_text(&self, text: &str, options: &TargetOptions) -> AdapterResult<PublishedPost> {
        self.publish(text, self.status_options(None, options)).await
    }

    async fn post_with_media(
        &self,
        text: &str,
        media: &[String],
        options: &TargetOptions,
    ) -> AdapterResult<PublishedPost> {
        let input = self.status_options(Some(media.to_vec()), options);
        self.publish(text, input).await
    }

    async fn delete_post(&self, external_id: &str) -> AdapterResult<DeleteOutcome> {
        match self.client.delete_status(external_id.to_string()).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(e) => {
                // A status that is already gone counts as deleted.
                if extract_http_status(&e.to_string()) == Some(404) {
                    Ok(DeleteOutcome::NotFound)
                } else {
                    Err(map_megalodon_error(e, "delete status"))
                }
            }
        }
    }

    async fn fetch_analytics(&self, external_id: &str) -> AdapterResult<Metrics> {
        let response = self
            .client
            .get_status(external_id.to_string())
            .await
            .map_err(|e| map_megalodon_error(e, "fetch status"))?;

        let status = response.json;
        Ok(Metrics {
            likes: status.favourites_count as i64,
            shares: status.reblogs_count as i64,
            replies: status.replies_count as i64,
            // The Mastodon API exposes no impression count.
            impressions: 0,
            extra: Default::default(),
        })
    }

    async fn refresh_credential(&self, account: &Account) -> AdapterResult<Credential> {
        // Mastodon OAuth tokens do not expire; a refresh is a verification
        // that the stored token still works.
        self.client
            .verify_account_credentials()
            .await
            .map_err(|e| map_megalodon_error(e, "verify credentials"))?;

        Ok(Credential {
            access_token: account.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: None,
        })
    }
}

/// Derive the instance base URL from the account handle.
fn instance_url_from_handle(account: &Account) -> AdapterResult<String> {
    let handle = account.handle.as_deref().ok_or_else(|| {
        AdapterError::Authentication(format!(
            "Mastodon account {} has no handle; expected user@instance.tld",
            account.id
        ))
    })?;

    let instance = handle.rsplit('@').next().filter(|s| s.contains('.'));
    match instance {
        Some(host) if !handle.starts_with(host) => Ok(format!("https://{}", host)),
        _ => Err(AdapterError::Authentication(format!(
            "Invalid Mastodon handle '{}'; expected user@instance.tld",
            handle
        ))),
    }
}

/// Map megalodon errors into the adapter failure taxonomy.
///
/// HTTP 401/403 are authentication failures, 422 is a validation failure,
/// 429 is a rate limit, 5xx and everything unclassifiable are transient.
fn map_megalodon_error(error: megalodon::error::Error, context: &str) -> AdapterError {
    let error_str = error.to_string();
    let error_lower = error_str.to_lowercase();

    match extract_http_status(&error_str) {
        Some(401) | Some(403) => AdapterError::Authentication(format!(
            "Mastodon authentication failed ({}): {}",
            context, error_str
        )),
        Some(422) => AdapterError::Validation(format!(
            "Mastodon rejected the content ({}): {}",
            context, error_str
        )),
        Some(429) => AdapterError::RateLimit {
            message: format!("Mastodon rate limit exceeded ({}): {}", context, error_str),
            // megalodon does not surface the Retry-After header in its error.
            retry_after: None,
        },
        Some(500..=599) => AdapterError::Unavailable(format!(
            "Mastodon server error ({}): {}",
            context, error_str
        )),
        Some(_) => AdapterError::Transient(format!(
            "Mastodon HTTP error ({}): {}",
            context, error_str
        )),
        None => {
            if error_lower.contains("unauthorized")
                || error_lower.contains("forbidden")
                || error_lower.contains("authentication")
                || error_lower.contains("token")
            {
                AdapterError::Authentication(format!(
                    "Mastodon authentication failed ({}): {}",
                    context, error_str
                ))
            } else if error_lower.contains("rate limit")
                || error_lower.contains("too many requests")
            {
                AdapterError::RateLimit {
                    message: format!("Mastodon rate limit exceeded ({}): {}", context, error_str),
                    retry_after: None,
                }
            } else if error_lower.contains("validation") || error_lower.contains("unprocessable") {
                AdapterError::Validation(format!(
                    "Mastodon rejected the content ({}): {}",
                    context, error_str
                ))
            } else {
                AdapterError::Transient(format!("Mastodon error ({}): {}", context, error_str))
            }
        }
    }
}

/// Extract an HTTP status code from an error message string.
///
/// Looks for patterns like "HTTP 401", "status 403", "401:".
fn extract_http_status(error_str: &str) -> Option<u16> {
    let prefixes = ["HTTP ", "status ", "code: ", "status_code: "];

    for prefix in &prefixes {
        if let Some(pos) = error_str.find(prefix) {
            let after_prefix = &error_str[pos + prefix.len()..];
            if let Some(code_str) = after_prefix.get(0..3) {
                if let Ok(code) = code_str.parse::<u16>() {
                    if (100..=599).contains(&code) {
                        return Some(code);
                    }
                }
            }
        }
    }

    // Standalone 3-digit codes followed by ':' or ' '.
    for (i, window) in error_str.as_bytes().windows(4).enumerate() {
        if window[0].is_ascii_digit()
            && window[1].is_ascii_digit()
            && window[2].is_ascii_digit()
            && (window[3] == b':' || window[3] == b' ')
        {
            if let Ok(code_str) = std::str::from_utf8(&window[0..3]) {
                if let Ok(code) = code_str.parse::<u16>() {
                    if (100..=599).contains(&code)
                        && (i == 0 || !error_str.as_bytes()[i - 1].is_ascii_digit())
                    {
                        return Some(code);
                    }
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mastodon_account(handle: Option<&str>) -> Account {
        let mut account = Account::new(
            "user-1".to_string(),
            "mastodon".to_string(),
            "42".to_string(),
            "test-token".to_string(),
        );
        account.handle = handle.map(|h| h.to_string());
        account
    }

    #[test]
    fn test_adapter_creation_from_handle() {
        let account = mastodon_account(Some("alice@mastodon.social"));
        let adapter = MastodonAdapter::new(&account).expect("Failed to create adapter");

        assert_eq!(adapter.name(), "mastodon");
        assert_eq!(adapter.capabilities().char_limit, Some(500));
    }

    #[test]
    fn test_adapter_creation_missing_handle() {
        let account = mastodon_account(None);
        match MastodonAdapter::new(&account) {
            Err(AdapterError::Authentication(msg)) => assert!(msg.contains("no handle")),
            other => panic!("expected authentication error, got ok={}", other.is_ok()),
        }
    }

    #[test]
    fn test_adapter_creation_bad_handle() {
        let account = mastodon_account(Some("no-at-sign"));
        assert!(MastodonAdapter::new(&account).is_err());
    }

    #[test]
    fn test_instance_url_derivation() {
        let account = mastodon_account(Some("alice@fosstodon.org"));
        assert_eq!(
            instance_url_from_handle(&account).unwrap(),
            "https://fosstodon.org"
        );
    }

    #[test]
    fn test_account_char_limit_overrides_default() {
        let mut account = mastodon_account(Some("bob@glitch.social"));
        account.capabilities.char_limit = Some(5000);

        let adapter = MastodonAdapter::new(&account).unwrap();
        assert_eq!(adapter.capabilities().char_limit, Some(5000));
    }

    #[test]
    fn test_validation_uses_instance_limit() {
        let account = mastodon_account(Some("alice@mastodon.social"));
        let adapter = MastodonAdapter::new(&account).unwrap();

        let at_limit = "a".repeat(500);
        assert!(adapter.validate_content(&at_limit, 0).is_valid());

        let over_limit = "a".repeat(501);
        let report = adapter.validate_content(&over_limit, 0);
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("500"));
    }

    #[test]
    fn test_unicode_counts_as_single_characters() {
        let account = mastodon_account(Some("alice@mastodon.social"));
        let adapter = MastodonAdapter::new(&account).unwrap();

        let crabs = "🦀".repeat(500);
        assert!(adapter.validate_content(&crabs, 0).is_valid());

        let too_many = "🦀".repeat(501);
        assert!(!adapter.validate_content(&too_many, 0).is_valid());
    }

    #[test]
    fn test_extract_http_status_with_http_prefix() {
        assert_eq!(extract_http_status("HTTP 401 Unauthorized"), Some(401));
        assert_eq!(extract_http_status("HTTP 403 Forbidden"), Some(403));
        assert_eq!(
            extract_http_status("HTTP 422 Unprocessable Entity"),
            Some(422)
        );
        assert_eq!(extract_http_status("HTTP 429 Too Many Requests"), Some(429));
        assert_eq!(
            extract_http_status("HTTP 500 Internal Server Error"),
            Some(500)
        );
    }

    #[test]
    fn test_extract_http_status_with_status_prefix() {
        assert_eq!(extract_http_status("status 401"), Some(401));
        assert_eq!(extract_http_status("status 404 not found"), Some(404));
    }

    #[test]
    fn test_extract_http_status_with_colon() {
        assert_eq!(extract_http_status("Error: 401: Unauthorized"), Some(401));
        assert_eq!(
            extract_http_status("Failed with 422: validation error"),
            Some(422)
        );
    }

    #[test]
    fn test_extract_http_status_no_code() {
        assert_eq!(extract_http_status("Network error"), None);
        assert_eq!(extract_http_status("Something went wrong"), None);
    }

    #[test]
    fn test_extract_http_status_invalid_code() {
        assert_eq!(extract_http_status("HTTP 999"), None);
        assert_eq!(extract_http_status("HTTP 99"), None);
        assert_eq!(extract_http_status("1234"), None);
    }

    #[test]
    fn test_extract_http_status_embedded_in_text() {
        assert_eq!(
            extract_http_status("The request failed with HTTP 401 due to invalid token"),
            Some(401)
        );
        assert_eq!(
            extract_http_status("Received status 429 from server"),
            Some(429)
        );
    }
}
