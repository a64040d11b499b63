use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::info;

use crate::autoplay::AutoplaySelector;
use crate::cache::DownloadCache;
use crate::config::{AutoplayConfig, Config};
use crate::content::ContentRef;
use crate::error::{Error, Result};
use crate::events::{EventBus, PlaybackEvent};
use crate::guard;
use crate::player::AudioOutput;
use crate::queue::{PlaybackQueue, QueueEntry, QueueStatus, Requester};
use crate::registry::ProviderRegistry;

/// Everything the chat transport talks to: one queue per joined session on
/// top of a shared cache.
pub struct Jukebox {
    registry: Arc<ProviderRegistry>,
    cache: DownloadCache,
    autoplay: Arc<AutoplaySelector>,
    autoplay_default: bool,
    events: EventBus,
    sessions: Mutex<HashMap<String, PlaybackQueue>>,
}

impl Jukebox {
    pub async fn from_config(config: &Config) -> Result<Self> {
        let dir = config.cache.dir();
        let cache = DownloadCache::open(&dir).await?;
        let registry = Arc::new(ProviderRegistry::from_config(config, &dir));
        info!(cache_dir = %dir.display(), "jukebox ready");
        Ok(Self::new(registry, cache, &config.autoplay))
    }

    pub fn new(
        registry: Arc<ProviderRegistry>,
        cache: DownloadCache,
        config: &AutoplayConfig,
    ) -> Self {
        let autoplay = Arc::new(AutoplaySelector::new(
            Arc::clone(&registry),
            cache.clone(),
            config,
        ));
        Self {
            registry,
            cache,
            autoplay,
            autoplay_default: config.enabled,
            events: EventBus::default(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &DownloadCache {
        &self.cache
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    pub fn resolve(&self, text: &str) -> Result<ContentRef> {
        self.registry.matches(text).ok_or(Error::NoMatch)
    }

    /// Start a session, or restart it with an empty queue when it already
    /// exists. Autoplay stays as it was.
    pub fn join(&self, session: &str, output: Arc<dyn AudioOutput>) -> PlaybackQueue {
        let mut sessions = self.sessions();
        let autoplay = match sessions.remove(session) {
            Some(previous) => {
                info!(session, "rejoined, clearing queue");
                let enabled = previous.autoplay_enabled();
                previous.close();
                enabled
            }
            None => {
                info!(session, "joined");
                self.autoplay_default
            }
        };

        let queue = PlaybackQueue::spawn(
            session,
            output,
            Arc::clone(&self.autoplay),
            autoplay,
            self.events.clone(),
        );
        sessions.insert(session.to_string(), queue.clone());
        queue
    }

    pub fn leave(&self, session: &str) -> Result<()> {
        let queue = self
            .sessions()
            .remove(session)
            .ok_or_else(|| Error::NoSession(session.to_string()))?;
        queue.close();
        info!(session, "left");
        Ok(())
    }

    pub fn queue(&self, session: &str) -> Result<PlaybackQueue> {
        self.sessions()
            .get(session)
            .cloned()
            .ok_or_else(|| Error::NoSession(session.to_string()))
    }

    pub fn sessions_joined(&self) -> Vec<String> {
        self.sessions().keys().cloned().collect()
    }

    /// Resolve `text`, download it if needed, then queue it. Nothing is
    /// queued when the download fails or the session is gone by then.
    pub async fn request(
        &self,
        session: &str,
        text: &str,
        requester: Requester,
        priority: bool,
    ) -> Result<QueueEntry> {
        self.queue(session)?;
        let content = self.resolve(text)?;

        // queued under the cache lock so a recache cannot slip in between
        self.cache
            .admit(&content, |path| {
                let queue = self.queue(session)?;
                let entry =
                    QueueEntry::requested(content.clone(), path.to_path_buf(), requester.clone());
                queue.enqueue(entry.clone(), priority);
                Ok(entry)
            })
            .await?
    }

    pub fn skip(&self, session: &str) -> Result<()> {
        self.queue(session)?.skip()
    }

    pub fn status(&self, session: &str) -> Result<QueueStatus> {
        Ok(self.queue(session)?.status())
    }

    pub fn now_playing(&self, session: &str) -> Result<QueueEntry> {
        self.queue(session)?.now_playing().ok_or(Error::NothingPlaying)
    }

    pub fn set_autoplay(&self, session: &str, enabled: bool) -> Result<()> {
        self.queue(session)?.set_autoplay(enabled);
        Ok(())
    }

    pub fn autoplay_enabled(&self, session: &str) -> Result<bool> {
        Ok(self.queue(session)?.autoplay_enabled())
    }

    /// Fetch a cached item again, refusing while any session still uses it
    pub async fn recache(&self, text: &str) -> Result<PathBuf> {
        let content = self.resolve(text)?;
        self.cache
            .recache_guarded(&content, |in_flight| {
                let statuses: Vec<QueueStatus> =
                    self.sessions().values().map(|q| q.status()).collect();
                guard::check(&content, &statuses, in_flight)
            })
            .await
    }

    /// Stop every session
    pub fn shutdown(&self) {
        for (session, queue) in self.sessions().drain() {
            queue.close();
            info!(%session, "session closed");
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, PlaybackQueue>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Provider;
    use crate::queue::Origin;
    use crate::testing::{FakeOutput, FakeProvider, eventually, write_cached};

    struct Harness {
        dir: tempfile::TempDir,
        provider: Arc<FakeProvider>,
        output: Arc<FakeOutput>,
        jukebox: Jukebox,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeProvider::new(dir.path()));
        let registry = Arc::new(ProviderRegistry::new(vec![
            provider.clone() as Arc<dyn Provider>
        ]));
        let cache = DownloadCache::open(dir.path()).await.unwrap();
        let config = AutoplayConfig {
            attempts: 200,
            ..Default::default()
        };
        let jukebox = Jukebox::new(registry, cache, &config);
        let output = Arc::new(FakeOutput::default());
        jukebox.join("voice", output.clone());
        Harness {
            dir,
            provider,
            output,
            jukebox,
        }
    }

    #[tokio::test]
    async fn test_request_downloads_and_plays() {
        let h = harness().await;

        let entry = h
            .jukebox
            .request("voice", "x", Requester::new("alice"), false)
            .await
            .unwrap();
        assert_eq!(h.provider.calls(), 1);
        assert!(entry.path.exists());

        eventually(|| h.jukebox.now_playing("voice").is_ok()).await;
        assert_eq!(
            h.jukebox.now_playing("voice").unwrap().content.cache_key(),
            "fake:x"
        );

        h.output.finish_current();
        eventually(|| h.jukebox.now_playing("voice").is_err()).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(matches!(
            h.jukebox.now_playing("voice"),
            Err(Error::NothingPlaying)
        ));
    }

    #[tokio::test]
    async fn test_request_then_autoplay_avoids_history() {
        let h = harness().await;
        write_cached(h.dir.path(), "fake:old.m4a");

        h.jukebox
            .request("voice", "x", Requester::new("alice"), false)
            .await
            .unwrap();
        eventually(|| h.jukebox.now_playing("voice").is_ok()).await;
        h.jukebox.set_autoplay("voice", true).unwrap();

        h.output.finish_current();
        eventually(|| {
            h.jukebox
                .now_playing("voice")
                .is_ok_and(|e| e.origin == Origin::Autoplay)
        })
        .await;

        h.output.finish_current();
        eventually(|| h.output.play_count() == 3).await;
        let played = h.output.played();
        // two different autoplay picks in a row
        assert_ne!(played[1], played[2]);
    }

    #[tokio::test]
    async fn test_request_failures_leave_queue_alone() {
        let h = harness().await;

        assert!(matches!(
            h.jukebox
                .request("voice", "two words", Requester::new("alice"), false)
                .await,
            Err(Error::NoMatch)
        ));

        h.provider.set_fail(true);
        let err = h
            .jukebox
            .request("voice", "x", Requester::new("alice"), false)
            .await
            .unwrap_err();
        assert!(err.is_user_facing());

        let status = h.jukebox.status("voice").unwrap();
        assert!(status.pending.is_empty());
        assert!(status.now_playing.is_none());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let h = harness().await;

        let err = h
            .jukebox
            .request("elsewhere", "x", Requester::new("alice"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoSession(_)));
        assert_eq!(h.provider.calls(), 0);
        assert!(matches!(h.jukebox.skip("elsewhere"), Err(Error::NoSession(_))));
        assert!(matches!(h.jukebox.leave("elsewhere"), Err(Error::NoSession(_))));
    }

    #[tokio::test]
    async fn test_recache_refused_while_queued() {
        let h = harness().await;
        h.jukebox
            .request("voice", "a", Requester::new("alice"), false)
            .await
            .unwrap();
        h.jukebox
            .request("voice", "b", Requester::new("alice"), false)
            .await
            .unwrap();
        let cached_b = h.dir.path().join("fake:b.m4a");
        let before = std::fs::metadata(&cached_b).unwrap().modified().unwrap();

        assert!(matches!(
            h.jukebox.recache("b").await,
            Err(Error::StillQueued)
        ));
        assert!(matches!(
            h.jukebox.recache("a").await,
            Err(Error::StillQueued)
        ));

        assert_eq!(std::fs::read_to_string(&cached_b).unwrap(), "fetch #2");
        assert_eq!(
            std::fs::metadata(&cached_b).unwrap().modified().unwrap(),
            before
        );
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_recache_when_free() {
        let h = harness().await;
        assert!(matches!(h.jukebox.recache("a").await, Err(Error::NotCached)));

        write_cached(h.dir.path(), "fake:a.m4a");
        let path = h.jukebox.recache("a").await.unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "fetch #1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_request_and_recache_keep_queued_file() {
        for round in 0..20 {
            let h = harness().await;
            write_cached(h.dir.path(), "fake:a.m4a");
            let jukebox = Arc::new(h.jukebox);

            let request = {
                let jukebox = Arc::clone(&jukebox);
                tokio::spawn(async move {
                    jukebox
                        .request("voice", "a", Requester::new("alice"), false)
                        .await
                })
            };
            let recache = {
                let jukebox = Arc::clone(&jukebox);
                tokio::spawn(async move { jukebox.recache("a").await })
            };

            let entry = request.await.unwrap().unwrap();
            match recache.await.unwrap() {
                // the request waited for the fresh copy
                Ok(path) => assert_eq!(path, entry.path),
                Err(e) => assert!(matches!(e, Error::StillQueued), "round {}: {:?}", round, e),
            }
            assert!(entry.path.exists(), "round {}: queued file was removed", round);
            assert!(h.provider.calls() <= 1);
        }
    }

    #[tokio::test]
    async fn test_rejoin_clears_but_keeps_autoplay() {
        let h = harness().await;
        h.jukebox
            .request("voice", "a", Requester::new("alice"), false)
            .await
            .unwrap();
        eventually(|| h.output.play_count() == 1).await;
        h.jukebox.set_autoplay("voice", true).unwrap();

        let output = Arc::new(FakeOutput::default());
        h.jukebox.join("voice", output.clone());
        assert!(h.jukebox.autoplay_enabled("voice").unwrap());

        // the cached item is fair game for the fresh session's autoplay
        eventually(|| output.play_count() == 1).await;
        let status = h.jukebox.status("voice").unwrap();
        assert!(status.pending.is_empty());
        assert_eq!(
            status.now_playing.map(|e| e.origin),
            Some(Origin::Autoplay)
        );
    }

    #[tokio::test]
    async fn test_leave_drops_session() {
        let h = harness().await;
        h.jukebox
            .request("voice", "a", Requester::new("alice"), false)
            .await
            .unwrap();

        h.jukebox.leave("voice").unwrap();
        assert!(h.jukebox.sessions_joined().is_empty());
        assert!(matches!(h.jukebox.status("voice"), Err(Error::NoSession(_))));
    }
}
