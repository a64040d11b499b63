use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, info, warn};

use crate::content::ContentRef;
use crate::error::{Error, Result};
use crate::providers::discard;

type InFlight = Shared<BoxFuture<'static, Result<PathBuf>>>;
type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

/// Removes a key from the in-flight map when the fetch task finishes,
/// including when it panics.
struct InFlightGuard {
    map: InFlightMap,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        debug!(key = %self.key, "in-flight download cleared");
    }
}

/// Materializes content into the on-disk cache.
///
/// At most one fetch per cache key runs at a time; concurrent callers for the
/// same key share its outcome.
#[derive(Clone)]
pub struct DownloadCache {
    dir: PathBuf,
    in_flight: InFlightMap,
}

impl DownloadCache {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Local path for `content`, downloading it first if needed
    pub async fn materialize(&self, content: &ContentRef) -> Result<PathBuf> {
        let key = content.cache_key();

        if let Some(pending) = self.pending(&key) {
            debug!(%key, "joining in-flight download");
            return pending.await;
        }

        let path = content.cache_path();
        if tokio::fs::try_exists(&path).await? {
            debug!(%key, "cache hit");
            return Ok(path);
        }

        let provider = Arc::clone(content.provider());
        let id = content.id().to_string();
        let fetch_key = key.clone();
        let fetch = self.join_or_start(key, async move {
            info!(key = %fetch_key, "download started");
            let result = provider.download(&id).await;
            match &result {
                Ok(path) => info!(key = %fetch_key, path = %path.display(), "download finished"),
                Err(e) => warn!(key = %fetch_key, error = %e, "download failed"),
            }
            result
        });
        fetch.await
    }

    /// Delete the cached file and fetch it again.
    ///
    /// Same as [`DownloadCache::recache_guarded`] with no usage check.
    pub async fn recache(&self, content: &ContentRef) -> Result<PathBuf> {
        self.recache_guarded(content, |_| Ok(())).await
    }

    /// Delete the cached file and fetch it again, if `guard` allows it.
    ///
    /// `guard` sees the keys currently in flight and runs under the in-flight
    /// lock, together with the file check and the registration of the new
    /// fetch. A failed re-fetch leaves no file behind.
    pub async fn recache_guarded<G>(&self, content: &ContentRef, guard: G) -> Result<PathBuf>
    where
        G: FnOnce(&[String]) -> Result<()>,
    {
        let key = content.cache_key();
        let path = content.cache_path();

        let provider = Arc::clone(content.provider());
        let id = content.id().to_string();
        let fetch_key = key.clone();
        let fetch = {
            let mut in_flight = self.lock();
            let keys: Vec<String> = in_flight.keys().cloned().collect();
            guard(&keys)?;
            if in_flight.contains_key(&key) {
                return Err(Error::AlreadyDownloading);
            }
            if !path.exists() {
                return Err(Error::NotCached);
            }

            let fetch = self.spawn_fetch(key.clone(), async move {
                info!(key = %fetch_key, "recache started");
                tokio::fs::remove_file(&path).await?;
                match provider.download(&id).await {
                    Ok(path) => {
                        info!(key = %fetch_key, "recache finished");
                        Ok(path)
                    }
                    Err(e) => {
                        warn!(key = %fetch_key, error = %e, "recache failed");
                        discard(&path).await;
                        Err(e)
                    }
                }
            });
            in_flight.insert(key, fetch.clone());
            fetch
        };
        fetch.await
    }

    /// Materialize `content`, then run `admit` with its path while no fetch
    /// for it is in flight. A recache that starts in between is waited out
    /// first, so `admit` never records a path that is about to be replaced.
    pub async fn admit<T, F>(&self, content: &ContentRef, mut admit: F) -> Result<T>
    where
        F: FnMut(&Path) -> T,
    {
        let key = content.cache_key();
        loop {
            let path = self.materialize(content).await?;
            let pending = {
                let in_flight = self.lock();
                match in_flight.get(&key) {
                    None if path.exists() => return Ok(admit(&path)),
                    None => None,
                    Some(pending) => Some(pending.clone()),
                }
            };
            debug!(%key, "cache file changed before admission, retrying");
            if let Some(pending) = pending {
                // its outcome is picked up by the next materialize
                let _ = pending.await;
            }
        }
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn in_flight_keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self, key: &str) -> Option<InFlight> {
        self.lock().get(key).cloned()
    }

    /// Attach to the fetch already running for `key`, or register `fetch`
    /// as the one.
    fn join_or_start<F>(&self, key: String, fetch: F) -> InFlight
    where
        F: Future<Output = Result<PathBuf>> + Send + 'static,
    {
        let mut in_flight = self.lock();
        if let Some(pending) = in_flight.get(&key) {
            debug!(%key, "joining in-flight download");
            return pending.clone();
        }
        let shared = self.spawn_fetch(key.clone(), fetch);
        in_flight.insert(key, shared.clone());
        shared
    }

    /// Run `fetch` on its own task so it completes even if every waiter goes
    /// away. Must be called with the map locked; the task's guard takes the
    /// lock to remove the entry.
    fn spawn_fetch<F>(&self, key: String, fetch: F) -> InFlight
    where
        F: Future<Output = Result<PathBuf>> + Send + 'static,
    {
        let guard = InFlightGuard {
            map: Arc::clone(&self.in_flight),
            key,
        };
        let task = tokio::spawn(async move {
            let _guard = guard;
            fetch.await
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(Error::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared()
    }
}
