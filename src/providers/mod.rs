pub mod niconico;
pub mod youtube;

pub use niconico::NiconicoProvider;
pub use youtube::YoutubeProvider;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

/// Display card for a piece of content
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Description {
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub thumbnail_url: Option<String>,
    /// Extra (name, value) rows
    pub fields: Vec<(String, String)>,
    pub footer: String,
    pub is_error: bool,
}

/// A source of media that can be requested by URL or id.
///
/// Implementations must leave the cache file either fully written or absent
/// when `download` returns: write to [`staging_path`] and [`publish`] on
/// success.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier used in cache filenames and lookups
    fn key(&self) -> &str;

    /// Extract a content id from free text
    fn test(&self, text: &str) -> Option<String>;

    fn cache_path(&self, id: &str) -> PathBuf;

    fn url_from_id(&self, id: &str) -> String;

    /// Fetch the content into its cache path and return that path
    async fn download(&self, id: &str) -> Result<PathBuf>;

    async fn describe(&self, id: &str) -> Result<Description>;
}

/// `<cache_dir>/<key>:<id>.<ext>`
pub fn cache_file_path(cache_dir: &Path, key: &str, id: &str, ext: &str) -> PathBuf {
    cache_dir.join(format!("{}:{}.{}", key, id, ext))
}

/// Where a download is written before it counts as cached.
///
/// `youtube:abc.mp4` stages as `youtube:abc.partial.mp4`; the extra dot keeps
/// it out of the cache scan and the extension keeps muxers happy.
pub fn staging_path(final_path: &Path) -> PathBuf {
    let stem = final_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match final_path.extension() {
        Some(ext) => format!("{}.partial.{}", stem, ext.to_string_lossy()),
        None => format!("{}.partial", stem),
    };
    final_path.with_file_name(name)
}

/// Move a finished staging file to its final cache name
pub async fn publish(staging: &Path, final_path: &Path) -> Result<()> {
    tokio::fs::rename(staging, final_path).await?;
    debug!(path = %final_path.display(), "published cache file");
    Ok(())
}

/// Best-effort removal of a file that may not exist
pub async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "discarded file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "failed to discard file"),
    }
}

/// Keep at most `n` lines, marking the cut with `...`
pub fn up_to_n_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    if lines.len() <= n {
        return text.to_string();
    }
    let mut kept = lines[..n].to_vec();
    kept.push("...");
    kept.join("\n")
}
