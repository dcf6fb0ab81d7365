//! Configurable in-memory adapter for tests
//!
//! Records every call and can be scripted to fail with a queue of errors, so
//! dispatch, refresh, and analytics behavior can be exercised without any
//! network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{AdapterError, AdapterResult};
use crate::types::{
    Account, Capabilities, Credential, Metrics, PublishedPost, TargetOptions,
};

use super::{Adapter, DeleteOutcome};

#[derive(Debug, Default)]
struct MockState {
    /// Errors returned by the next calls, front first. Once drained, calls
    /// succeed.
    scripted_failures: Vec<AdapterError>,
    posted: Vec<String>,
    deleted: Vec<String>,
    post_calls: usize,
    analytics_calls: usize,
    refresh_calls: usize,
    metrics: Option<Metrics>,
    credential: Option<Credential>,
    next_id: usize,
}

/// Test double implementing the full adapter contract.
#[derive(Clone)]
pub struct MockAdapter {
    name: String,
    capabilities: Capabilities,
    /// Artificial latency per network call, for timeout tests.
    delay: Option<Duration>,
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    /// An adapter that succeeds on every call.
    pub fn success(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capabilities: Capabilities::default(),
            delay: None,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// An adapter with a character limit for validation tests.
    pub fn with_limit(name: &str, char_limit: usize) -> Self {
        let mut adapter = Self::success(name);
        adapter.capabilities.char_limit = Some(char_limit);
        adapter
    }

    /// Script the next calls to fail in order with the given errors.
    pub fn failing_with(name: &str, errors: Vec<AdapterError>) -> Self {
        let adapter = Self::success(name);
        adapter.state.lock().unwrap().scripted_failures = errors;
        adapter
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_metrics(&self, metrics: Metrics) {
        self.state.lock().unwrap().metrics = Some(metrics);
    }

    pub fn set_credential(&self, credential: Credential) {
        self.state.lock().unwrap().credential = Some(credential);
    }

    /// Push more scripted failures onto the queue.
    pub fn push_failure(&self, error: AdapterError) {
        self.state.lock().unwrap().scripted_failures.push(error);
    }

    pub fn posted_contents(&self) -> Vec<String> {
        self.state.lock().unwrap().posted.clone()
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn post_calls(&self) -> usize {
        self.state.lock().unwrap().post_calls
    }

    pub fn analytics_calls(&self) -> usize {
        self.state.lock().unwrap().analytics_calls
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.lock().unwrap().refresh_calls
    }

    async fn maybe_delay(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn take_scripted_failure(&self) -> Option<AdapterError> {
        let mut state = self.state.lock().unwrap();
        if state.scripted_failures.is_empty() {
            None
        } else {
            Some(state.scripted_failures.remove(0))
        }
    }

    fn record_post(&self, text: &str) -> PublishedPost {
        let mut state = self.state.lock().unwrap();
        state.posted.push(text.to_string());
        state.next_id += 1;
        let id = state.next_id;
        PublishedPost {
            external_id: format!("{}-post-{}", self.name, id),
            external_url: Some(format!("https://{}.example/posts/{}", self.name, id)),
            posted_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn post_text(&self, text: &str, _options: &TargetOptions) -> AdapterResult<PublishedPost> {
        self.maybe_delay().await;
        self.state.lock().unwrap().post_calls += 1;
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }
        Ok(self.record_post(text))
    }

    async fn post_with_media(
        &self,
        text: &str,
        media: &[String],
        _options: &TargetOptions,
    ) -> AdapterResult<PublishedPost> {
        self.maybe_delay().await;
        self.state.lock().unwrap().post_calls += 1;
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }
        Ok(self.record_post(&format!("{} [media: {}]", text, media.len())))
    }

    async fn delete_post(&self, external_id: &str) -> AdapterResult<DeleteOutcome> {
        self.maybe_delay().await;
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }
        self.state
            .lock()
            .unwrap()
            .deleted
            .push(external_id.to_string());
        Ok(DeleteOutcome::Deleted)
    }

    async fn fetch_analytics(&self, _external_id: &str) -> AdapterResult<Metrics> {
        self.maybe_delay().await;
        self.state.lock().unwrap().analytics_calls += 1;
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }
        let state = self.state.lock().unwrap();
        Ok(state.metrics.clone().unwrap_or_else(|| Metrics {
            likes: 1,
            shares: 0,
            replies: 0,
            impressions: 10,
            extra: HashMap::new(),
        }))
    }

    async fn refresh_credential(&self, account: &Account) -> AdapterResult<Credential> {
        self.maybe_delay().await;
        self.state.lock().unwrap().refresh_calls += 1;
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }
        let state = self.state.lock().unwrap();
        Ok(state.credential.clone().unwrap_or_else(|| Credential {
            access_token: format!("{}-refreshed", account.access_token),
            refresh_token: account.refresh_token.clone(),
            expires_at: Some(chrono::Utc::now().timestamp() + 86_400),
        }))
    }
}
