use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

use super::{Description, Provider, cache_file_path, discard, publish, staging_path};
use crate::config::YoutubeConfig;
use crate::error::{Error, Result};

pub const KEY: &str = "youtube";

static VIDEO_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:youtu\.be/|[a-z]+?\.youtube\.com/watch\?v=)([A-Za-z0-9_-]{11})")
        .expect("valid regex")
});

/// The extension the downloader picked, from its `[download]` progress lines
static DOWNLOADED_EXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[download\][^\n]+\.([a-z4]+)").expect("valid regex"));

#[derive(Debug, Deserialize)]
struct OembedResponse {
    title: String,
    author_name: Option<String>,
}

/// YouTube videos, fetched as audio with an external downloader and remuxed
/// into mp4 by ffmpeg
pub struct YoutubeProvider {
    cache_dir: PathBuf,
    downloader: String,
    ffmpeg: String,
    oembed_url: String,
    client: Client,
}

impl YoutubeProvider {
    pub fn new(config: &YoutubeConfig, cache_dir: &Path) -> Self {
        Self {
            cache_dir: cache_dir.to_path_buf(),
            downloader: config.downloader.clone(),
            ffmpeg: config.ffmpeg.clone(),
            oembed_url: config.oembed_url.clone(),
            client: Client::new(),
        }
    }

    fn watch_url(id: &str) -> String {
        format!("https://www.youtube.com/watch?v={}", id)
    }

    /// Download the best audio stream next to the cache file, returning its path.
    /// Whatever the downloader left behind is removed on failure.
    async fn fetch_audio(&self, id: &str, final_path: &Path) -> Result<PathBuf> {
        // `<key>:<id>.source.<ext>` has two dots, so the cache scan never sees it
        let base = final_path.with_extension("source");
        let result = self.run_downloader(id, &base).await;
        if result.is_err() {
            discard_sources(&base).await;
        }
        result
    }

    async fn run_downloader(&self, id: &str, base: &Path) -> Result<PathBuf> {
        let template = format!("{}.%(ext)s", base.display());

        let stdout = run_tool(
            &self.downloader,
            &[
                "-f",
                "bestaudio",
                "-o",
                &template,
                &Self::watch_url(id),
            ],
        )
        .await?;

        let ext = DOWNLOADED_EXT
            .captures(&stdout)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| Error::Tool {
                tool: self.downloader.clone(),
                message: "could not find the downloaded format in its output".to_string(),
            })?;

        Ok(base.with_extension(format!("source.{}", ext)))
    }
}

#[async_trait]
impl Provider for YoutubeProvider {
    fn key(&self) -> &str {
        KEY
    }

    fn test(&self, text: &str) -> Option<String> {
        VIDEO_URL
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    fn cache_path(&self, id: &str) -> PathBuf {
        cache_file_path(&self.cache_dir, KEY, id, "mp4")
    }

    fn url_from_id(&self, id: &str) -> String {
        format!("https://youtu.be/{}", id)
    }

    async fn download(&self, id: &str) -> Result<PathBuf> {
        let path = self.cache_path(id);
        if tokio::fs::try_exists(&path).await? {
            return Ok(path);
        }

        info!(id, "downloading from youtube");
        let source = self.fetch_audio(id, &path).await?;
        debug!(id, source = %source.display(), "audio downloaded, remuxing");

        let staging = staging_path(&path);
        let remux = run_tool(
            &self.ffmpeg,
            &[
                "-y",
                "-i",
                &source.to_string_lossy(),
                "-codec",
                "copy",
                "-strict",
                "-2",
                &staging.to_string_lossy(),
            ],
        )
        .await;
        discard(&source).await;

        if let Err(e) = remux {
            discard(&staging).await;
            return Err(e);
        }
        publish(&staging, &path).await?;

        info!(id, "youtube download complete");
        Ok(path)
    }

    async fn describe(&self, id: &str) -> Result<Description> {
        let watch_url = Self::watch_url(id);
        let url = Url::parse_with_params(
            &self.oembed_url,
            [("url", watch_url.as_str()), ("format", "json")],
        )
        .map_err(|e| Error::InvalidResponse(format!("bad oembed url: {}", e)))?;

        debug!(id, "fetching youtube oembed");
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Provider(format!(
                "youtube.oembed: video unavailable (status: {})",
                response.status().as_u16()
            )));
        }
        let info: OembedResponse = response.json().await?;

        Ok(Description {
            title: info.title,
            description: info.author_name,
            url: Some(self.url_from_id(id)),
            thumbnail_url: Some(format!("https://i.ytimg.com/vi/{}/maxresdefault.jpg", id)),
            fields: Vec::new(),
            footer: "YouTube".to_string(),
            is_error: false,
        })
    }
}

/// Remove `<base>.*`, including the downloader's own partial files
async fn discard_sources(base: &Path) {
    let (Some(dir), Some(name)) = (base.parent(), base.file_name()) else {
        return;
    };
    let prefix = format!("{}.", name.to_string_lossy());
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "failed to list download leftovers");
            return;
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            discard(&entry.path()).await;
        }
    }
}

/// Run an external tool to completion and return its stdout
async fn run_tool(program: &str, args: &[&str]) -> Result<String> {
    debug!(program, ?args, "running tool");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::Tool {
            tool: program.to_string(),
            message: e.to_string(),
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(Error::Tool {
            tool: program.to_string(),
            message: format!("{}: {}", output.status, stderr.trim()),
        });
    }
    if !stderr.trim().is_empty() {
        warn!(program, stderr = %stderr.trim(), "tool wrote to stderr");
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
