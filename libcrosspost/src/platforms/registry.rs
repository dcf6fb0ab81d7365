//! Adapter registry
//!
//! Maps platform identifiers to adapter factories. Resolution fails closed:
//! an unknown platform is a fatal `UnsupportedPlatform` error, never a silent
//! skip.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{AdapterError, AdapterResult};
use crate::types::Account;

use super::mastodon::MastodonAdapter;
use super::mock::MockAdapter;
use super::nostr::NostrAdapter;
use super::Adapter;

type AdapterFactory =
    Box<dyn Fn(&Account, &Config) -> AdapterResult<Arc<dyn Adapter>> + Send + Sync>;

/// Registry of platform adapters, consulted at dispatch time.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in platforms wired up.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register("mastodon", |account, _config| {
            Ok(Arc::new(MastodonAdapter::new(account)?) as Arc<dyn Adapter>)
        });

        registry.register("nostr", |account, config| {
            let relays = config
                .nostr
                .as_ref()
                .map(|n| n.relays.clone())
                .unwrap_or_default();
            Ok(Arc::new(NostrAdapter::new(account, relays)?) as Arc<dyn Adapter>)
        });

        registry.register("mock", |_account, _config| {
            Ok(Arc::new(MockAdapter::success("mock")) as Arc<dyn Adapter>)
        });

        registry
    }

    /// Register a factory for `platform`, replacing any existing one.
    pub fn register<F>(&mut self, platform: &str, factory: F)
    where
        F: Fn(&Account, &Config) -> AdapterResult<Arc<dyn Adapter>> + Send + Sync + 'static,
    {
        self.factories
            .insert(platform.to_string(), Box::new(factory));
    }

    /// Construct an adapter for the account's platform.
    pub fn resolve(&self, account: &Account, config: &Config) -> AdapterResult<Arc<dyn Adapter>> {
        match self.factories.get(&account.platform) {
            Some(factory) => factory(account, config),
            None => Err(AdapterError::UnsupportedPlatform(account.platform.clone())),
        }
    }

    pub fn supported_platforms(&self) -> Vec<String> {
        let mut platforms: Vec<String> = self.factories.keys().cloned().collect();
        platforms.sort();
        platforms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_for(platform: &str) -> Account {
        Account::new(
            "user".to_string(),
            platform.to_string(),
            "1".to_string(),
            "token".to_string(),
        )
    }

    #[test]
    fn test_unknown_platform_fails_closed() {
        let registry = AdapterRegistry::with_defaults();
        let account = account_for("friendster");

        match registry.resolve(&account, &Config::default()) {
            Err(AdapterError::UnsupportedPlatform(name)) => assert_eq!(name, "friendster"),
            other => panic!("expected UnsupportedPlatform, got ok={}", other.is_ok()),
        }
    }

    #[test]
    fn test_resolve_mock() {
        let registry = AdapterRegistry::with_defaults();
        let account = account_for("mock");

        let adapter = registry.resolve(&account, &Config::default()).unwrap();
        assert_eq!(adapter.name(), "mock");
    }

    #[test]
    fn test_register_custom_instance() {
        let mut registry = AdapterRegistry::new();
        let shared = Arc::new(MockAdapter::with_limit("custom", 100));
        let handle = shared.clone();
        registry.register("custom", move |_, _| Ok(handle.clone() as Arc<dyn Adapter>));

        let adapter = registry
            .resolve(&account_for("custom"), &Config::default())
            .unwrap();
        assert_eq!(adapter.capabilities().char_limit, Some(100));
        // Same underlying instance, so call counters are observable.
        assert_eq!(shared.post_calls(), 0);
    }

    #[test]
    fn test_supported_platforms_sorted() {
        let registry = AdapterRegistry::with_defaults();
        let platforms = registry.supported_platforms();
        assert_eq!(platforms, vec!["mastodon", "mock", "nostr"]);
    }
}
