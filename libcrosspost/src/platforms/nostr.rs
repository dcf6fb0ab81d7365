//! Nostr platform adapter
//!
//! Publishes text notes to the configured relays. The account's access token
//! holds the signing key (64-character hex or bech32 nsec); analytics are
//! approximated by counting reaction, repost, and reply events referencing
//! the note.

use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::{Client, EventBuilder, EventId, EventSource, Filter, Keys, Kind, ToBech32};
use tokio::sync::OnceCell;

use crate::error::{AdapterError, AdapterResult};
use crate::types::{
    Account, Capabilities, Credential, Metrics, PublishedPost, TargetOptions,
};

use super::{Adapter, DeleteOutcome};

const RELAY_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct NostrAdapter {
    client: Client,
    relays: Vec<String>,
    capabilities: Capabilities,
    /// Relay connections are established once, on first use.
    connected: OnceCell<()>,
}

impl NostrAdapter {
    /// Build an adapter for one Nostr account.
    ///
    /// The signing key comes from the account's access token and must be
    /// 64-character hex or bech32 nsec format.
    pub fn new(account: &Account, relays: Vec<String>) -> AdapterResult<Self> {
        if relays.is_empty() {
            return Err(AdapterError::Unavailable(
                "No Nostr relays configured".to_string(),
            ));
        }

        let keys = parse_keys(&account.access_token)?;

        Ok(Self {
            client: Client::new(keys),
            relays,
            capabilities: account.capabilities.clone(),
            connected: OnceCell::new(),
        })
    }

    async fn ensure_connected(&self) -> AdapterResult<()> {
        self.connected
            .get_or_try_init(|| async {
                for relay in &self.relays {
                    self.client.add_relay(relay.as_str()).await.map_err(|e| {
                        AdapterError::Transient(format!("Failed to add relay {}: {}", relay, e))
                    })?;
                }
                self.client.connect().await;
                Ok(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Adapter for NostrAdapter {
    fn name(&self) -> &str {
        "nostr"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn post_text(&self, text: &str, _options: &TargetOptions) -> AdapterResult<PublishedPost> {
        self.ensure_connected().await?;

        let output = self
            .client
            .publish_text_note(text, [])
            .await
            .map_err(|e| AdapterError::Transient(format!("Failed to publish note: {}", e)))?;

        let external_id = output
            .id()
            .to_bech32()
            .unwrap_or_else(|_| output.id().to_hex());

        Ok(PublishedPost {
            external_id,
            external_url: None,
            posted_at: chrono::Utc::now().timestamp(),
        })
    }

    async fn post_with_media(
        &self,
        text: &str,
        media: &[String],
        options: &TargetOptions,
    ) -> AdapterResult<PublishedPost> {
        // Nostr has no attachment concept; media references go into the note
        // body, which is the convention clients render.
        let mut body = text.to_string();
        for reference in media {
            body.push('\n');
            body.push_str(reference);
        }
        self.post_text(&body, options).await
    }

    async fn delete_post(&self, external_id: &str) -> AdapterResult<DeleteOutcome> {
        self.ensure_connected().await?;

        let event_id = parse_event_id(external_id)?;
        self.client
            .send_event_builder(EventBuilder::delete([event_id]))
            .await
            .map_err(|e| AdapterError::Transient(format!("Failed to send deletion: {}", e)))?;

        // Deletion on Nostr is a request to relays; success means the request
        // was accepted, not that every relay honored it.
        Ok(DeleteOutcome::Deleted)
    }

    async fn fetch_analytics(&self, external_id: &str) -> AdapterResult<Metrics> {
        self.ensure_connected().await?;

        let event_id = parse_event_id(external_id)?;
        let filter = Filter::new()
            .event(event_id)
            .kinds([Kind::Reaction, Kind::Repost, Kind::TextNote]);

        let events = self
            .client
            .get_events_of(
                vec![filter],
                EventSource::relays(Some(RELAY_QUERY_TIMEOUT)),
            )
            .await
            .map_err(|e| AdapterError::Transient(format!("Failed to query relays: {}", e)))?;

        let mut metrics = Metrics::default();
        for event in events {
            match event.kind() {
                Kind::Reaction => metrics.likes += 1,
                Kind::Repost => metrics.shares += 1,
                Kind::TextNote => metrics.replies += 1,
                _ => {}
            }
        }

        Ok(metrics)
    }

    async fn refresh_credential(&self, account: &Account) -> AdapterResult<Credential> {
        // Nostr keys are long-lived; refresh verifies the stored key still
        // parses and hands the same credential back.
        parse_keys(&account.access_token)?;

        Ok(Credential {
            access_token: account.access_token.clone(),
            refresh_token: account.refresh_token.clone(),
            expires_at: None,
        })
    }
}

fn parse_keys(key_str: &str) -> AdapterResult<Keys> {
    let key_str = key_str.trim();

    if key_str.len() == 64 || key_str.starts_with("nsec") {
        Keys::parse(key_str)
            .map_err(|e| AdapterError::Authentication(format!("Invalid Nostr key: {}", e)))
    } else {
        Err(AdapterError::Authentication(
            "Key must be 64-character hex or bech32 nsec format".to_string(),
        ))
    }
}

fn parse_event_id(external_id: &str) -> AdapterResult<EventId> {
    EventId::parse(external_id).map_err(|e| {
        AdapterError::Validation(format!("Invalid Nostr event id '{}': {}", external_id, e))
    })
}
