//! Provider registry built once from config.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use switchyard_core::config::{Config, ProviderConfig, ProviderKind};

use crate::ConverseProvider;
use crate::anthropic::AnthropicProvider;
use crate::converse::ConverseHttpProvider;
use crate::mock::MockProvider;

/// Maps provider ids to backends.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ConverseProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own id, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn ConverseProvider>) {
        let id = provider.id().to_string();
        if self.providers.insert(id.clone(), provider).is_some() {
            warn!(provider = %id, "Provider registered twice; keeping the latest");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ConverseProvider>> {
        self.providers.get(id).cloned()
    }

    /// Registered provider ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Build every configured provider.
    ///
    /// A provider that fails to build is an error: the process should not
    /// start with a catalog pointing at a missing backend.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for provider_config in config.providers() {
            let provider = build_provider(provider_config)?;
            info!(provider = %provider_config.id, kind = ?provider_config.kind, "Provider registered");
            registry.register(provider);
        }
        Ok(registry)
    }
}

/// Construct one backend from its config entry.
pub fn build_provider(config: &ProviderConfig) -> anyhow::Result<Arc<dyn ConverseProvider>> {
    let provider: Arc<dyn ConverseProvider> = match config.kind {
        ProviderKind::Converse => Arc::new(ConverseHttpProvider::from_config(config)?),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::from_config(config)?),
        ProviderKind::Mock => Arc::new(MockProvider::new(config.id.clone())),
    };
    Ok(provider)
}
