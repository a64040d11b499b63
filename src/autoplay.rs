use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::cache::DownloadCache;
use crate::config::AutoplayConfig;
use crate::content::parse_cache_file_name;
use crate::error::Result;
use crate::queue::{Origin, QueueEntry};
use crate::registry::ProviderRegistry;

/// Recently autoplayed cache filenames, oldest first
#[derive(Debug, Clone)]
pub struct AutoplayHistory {
    entries: VecDeque<String>,
    capacity: usize,
}

impl AutoplayHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e == name)
    }

    pub fn push(&mut self, name: impl Into<String>) {
        self.entries.push_back(name.into());
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

/// Picks something already in the cache to play when a queue runs dry
pub struct AutoplaySelector {
    registry: Arc<ProviderRegistry>,
    cache: DownloadCache,
    history: Mutex<AutoplayHistory>,
    max_attempts: usize,
}

impl AutoplaySelector {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        cache: DownloadCache,
        config: &AutoplayConfig,
    ) -> Self {
        Self::with_history(
            registry,
            cache,
            AutoplayHistory::new(config.history),
            config.attempts,
        )
    }

    pub fn with_history(
        registry: Arc<ProviderRegistry>,
        cache: DownloadCache,
        history: AutoplayHistory,
        max_attempts: usize,
    ) -> Self {
        Self {
            registry,
            cache,
            history: Mutex::new(history),
            max_attempts,
        }
    }

    pub fn history(&self) -> AutoplayHistory {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A random cached item that was not picked recently.
    ///
    /// Every rejected candidate counts as an attempt; gives up with `None`
    /// once the attempts run out.
    pub async fn pick(&self) -> Option<QueueEntry> {
        for attempt in 1..=self.max_attempts {
            let files = match self.cached_files().await {
                Ok(files) => files,
                Err(e) => {
                    warn!(error = %e, "failed to list cache directory");
                    return None;
                }
            };
            let Some(name) = choose(&files) else {
                debug!("cache is empty, nothing to autoplay");
                return None;
            };
            debug!(attempt, %name, "autoplay candidate");

            if self.recently_played(&name) {
                debug!(attempt, %name, "played recently, retrying");
                continue;
            }

            let Some(content) = self.registry.resolve_cache_file_name(&name) else {
                debug!(attempt, %name, "unknown provider, retrying");
                continue;
            };

            match self.cache.materialize(&content).await {
                Ok(path) => {
                    self.history
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(name);
                    info!(key = %content, "autoplay selected");
                    return Some(QueueEntry {
                        content,
                        path,
                        origin: Origin::Autoplay,
                    });
                }
                Err(e) => {
                    debug!(attempt, key = %content, error = %e, "candidate unavailable, retrying");
                }
            }
        }

        warn!(attempts = self.max_attempts, "failed to select an autoplay candidate");
        None
    }

    fn recently_played(&self, name: &str) -> bool {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Filenames in the cache directory that follow the cache naming scheme
    async fn cached_files(&self) -> Result<Vec<String>> {
        let mut dir = tokio::fs::read_dir(self.cache.dir()).await?;
        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if let Ok(name) = entry.file_name().into_string()
                && parse_cache_file_name(&name).is_some()
            {
                files.push(name);
            }
        }
        Ok(files)
    }
}

fn choose(files: &[String]) -> Option<String> {
    files.choose(&mut rand::thread_rng()).cloned()
}
