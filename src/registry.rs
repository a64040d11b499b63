use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::content::{ContentRef, parse_cache_file_name};
use crate::providers::{NiconicoProvider, Provider, YoutubeProvider};

/// The set of known providers, in matching order
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    /// YouTube first, then niconico
    pub fn from_config(config: &Config, cache_dir: &Path) -> Self {
        Self::new(vec![
            Arc::new(YoutubeProvider::new(&config.youtube, cache_dir)),
            Arc::new(NiconicoProvider::new(&config.niconico, cache_dir)),
        ])
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    /// First provider (in registration order) that recognizes `text`
    pub fn matches(&self, text: &str) -> Option<ContentRef> {
        self.providers.iter().find_map(|provider| {
            provider
                .test(text)
                .map(|id| ContentRef::new(Arc::clone(provider), id))
        })
    }

    pub fn find_by_key(&self, key: &str) -> Option<Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.key() == key).cloned()
    }

    /// Parse a `provider:id` cache key
    pub fn resolve_key(&self, key: &str) -> Option<ContentRef> {
        let (provider_key, id) = key.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        let provider = self.find_by_key(provider_key)?;
        Some(ContentRef::new(provider, id))
    }

    /// Parse a `<provider>:<id>.<ext>` cache filename
    pub fn resolve_cache_file_name(&self, name: &str) -> Option<ContentRef> {
        let (provider_key, id) = parse_cache_file_name(name)?;
        let provider = self.find_by_key(provider_key)?;
        Some(ContentRef::new(provider, id))
    }
}
