//! Fakes shared by unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::player::{AudioOutput, PlaybackDone};
use crate::providers::{self, Description, Provider};

/// Accepts any single word as an id and "downloads" by writing `fetch #n`
pub struct FakeProvider {
    key: String,
    dir: PathBuf,
    calls: AtomicUsize,
    fail: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeProvider {
    pub fn new(dir: &Path) -> Self {
        Self::with_key(dir, "fake")
    }

    pub fn with_key(dir: &Path, key: &str) -> Self {
        Self {
            key: key.to_string(),
            dir: dir.to_path_buf(),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gate: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Hold every later download until a permit is added
    pub fn gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn key(&self) -> &str {
        &self.key
    }

    fn test(&self, text: &str) -> Option<String> {
        let text = text.trim();
        if text.is_empty() || text.contains(char::is_whitespace) {
            return None;
        }
        Some(text.to_string())
    }

    fn cache_path(&self, id: &str) -> PathBuf {
        providers::cache_file_path(&self.dir, &self.key, id, "m4a")
    }

    fn url_from_id(&self, id: &str) -> String {
        format!("https://{}.example/{}", self.key, id)
    }

    async fn download(&self, id: &str) -> Result<PathBuf> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| Error::Aborted(e.to_string()))?
                .forget();
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Provider("fake provider failure".to_string()));
        }

        let path = self.cache_path(id);
        let staging = providers::staging_path(&path);
        tokio::fs::write(&staging, format!("fetch #{}", n)).await?;
        providers::publish(&staging, &path).await?;
        Ok(path)
    }

    async fn describe(&self, id: &str) -> Result<Description> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Provider("fake provider failure".to_string()));
        }
        let lines: Vec<String> = (1..=15).map(|i| format!("line {}", i)).collect();
        Ok(Description {
            title: id.to_string(),
            description: Some(lines.join("\n")),
            url: Some(self.url_from_id(id)),
            footer: "Fake".to_string(),
            ..Default::default()
        })
    }
}

/// Records what it was asked to play; tracks end when told to
#[derive(Default)]
pub struct FakeOutput {
    plays: Mutex<Vec<PathBuf>>,
    endings: Mutex<Vec<CancellationToken>>,
    fail: AtomicBool,
}

impl FakeOutput {
    pub fn played(&self) -> Vec<PathBuf> {
        self.plays.lock().unwrap().clone()
    }

    pub fn play_count(&self) -> usize {
        self.plays.lock().unwrap().len()
    }

    /// End the most recent track as if it reached the end of the file
    pub fn finish_current(&self) {
        if let Some(ending) = self.endings.lock().unwrap().last() {
            ending.cancel();
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioOutput for FakeOutput {
    async fn play(&self, path: &Path, stop: CancellationToken) -> Result<PlaybackDone> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Output("fake output failure".to_string()));
        }
        self.plays.lock().unwrap().push(path.to_path_buf());
        let ending = CancellationToken::new();
        self.endings.lock().unwrap().push(ending.clone());

        Ok(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = ending.cancelled() => {}
            }
        }
        .boxed())
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds
pub async fn eventually(condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

/// Drop a finished cache file into `dir`
pub fn write_cached(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, "cached").unwrap();
    path
}
