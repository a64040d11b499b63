use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::warn;

use crate::providers::{Description, Provider, up_to_n_lines};

/// `<providerKey>:<contentId>.<ext>`. Staging files carry a second dot and
/// never match.
static CACHE_FILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z]+):([^.]+)\.[^.]+$").expect("valid cache file pattern"));

/// Split a cache filename into `(provider_key, content_id)`
pub fn parse_cache_file_name(name: &str) -> Option<(&str, &str)> {
    let caps = CACHE_FILE_NAME.captures(name)?;
    Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}

/// A provider plus one of its content ids.
///
/// Equality, hashing and display all go through [`ContentRef::cache_key`].
#[derive(Clone)]
pub struct ContentRef {
    provider: Arc<dyn Provider>,
    id: String,
}

impl ContentRef {
    pub fn new(provider: Arc<dyn Provider>, id: impl Into<String>) -> Self {
        Self {
            provider,
            id: id.into(),
        }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn provider_key(&self) -> &str {
        self.provider.key()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `provider:id`
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.provider.key(), self.id)
    }

    pub fn url(&self) -> String {
        self.provider.url_from_id(&self.id)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.provider.cache_path(&self.id)
    }

    /// Display card; provider failures turn into an error card.
    pub async fn describe(&self) -> Description {
        match self.provider.describe(&self.id).await {
            Ok(mut card) => {
                card.description = card.description.map(|d| up_to_n_lines(&d, 10));
                card
            }
            Err(e) => {
                warn!(key = %self.cache_key(), error = %e, "failed to fetch description");
                let description = if e.is_user_facing() {
                    e.to_string()
                } else {
                    "unexpected error".to_string()
                };
                Description {
                    title: "Could not load details".to_string(),
                    description: Some(description),
                    url: Some(self.url()),
                    footer: "jukebot".to_string(),
                    is_error: true,
                    ..Default::default()
                }
            }
        }
    }
}

impl PartialEq for ContentRef {
    fn eq(&self, other: &Self) -> bool {
        self.provider.key() == other.provider.key() && self.id == other.id
    }
}

impl Eq for ContentRef {}

impl Hash for ContentRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cache_key().hash(state);
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider.key(), self.id)
    }
}

impl fmt::Debug for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentRef").field(&self.cache_key()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProvider;

    #[test]
    fn test_parse_cache_file_name() {
        assert_eq!(
            parse_cache_file_name("niconico:sm9.m4a"),
            Some(("niconico", "sm9"))
        );
        assert_eq!(
            parse_cache_file_name("youtube:dQw4w9WgXcQ.mp4"),
            Some(("youtube", "dQw4w9WgXcQ"))
        );
        assert_eq!(
            parse_cache_file_name("youtube:a-b_c:d.webm"),
            Some(("youtube", "a-b_c:d"))
        );
    }

    #[test]
    fn test_parse_cache_file_name_rejects_others() {
        assert_eq!(parse_cache_file_name("youtube:abc.partial.mp4"), None);
        assert_eq!(parse_cache_file_name("YouTube:abc.mp4"), None);
        assert_eq!(parse_cache_file_name("abc.mp4"), None);
        assert_eq!(parse_cache_file_name("youtube:abc"), None);
        assert_eq!(parse_cache_file_name(".DS_Store"), None);
    }

    #[test]
    fn test_cache_key_and_equality() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn Provider> = Arc::new(FakeProvider::new(dir.path()));
        let a = ContentRef::new(provider.clone(), "one");
        let b = ContentRef::new(provider.clone(), "one");
        let c = ContentRef::new(provider, "two");

        assert_eq!(a.cache_key(), "fake:one");
        assert_eq!(a.to_string(), "fake:one");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.cache_path(), dir.path().join("fake:one.m4a"));
        assert_eq!(a.url(), "https://fake.example/one");
    }

    #[tokio::test]
    async fn test_describe_failure_becomes_error_card() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeProvider::new(dir.path()));
        provider.set_fail(true);
        let content = ContentRef::new(provider, "one");

        let card = content.describe().await;
        assert!(card.is_error);
        assert_eq!(card.description.as_deref(), Some("fake provider failure"));
        assert_eq!(card.url.as_deref(), Some("https://fake.example/one"));
    }

    #[tokio::test]
    async fn test_describe_truncates_long_text() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeProvider::new(dir.path()));
        let content = ContentRef::new(provider, "one");

        let card = content.describe().await;
        assert!(!card.is_error);
        let text = card.description.unwrap();
        assert_eq!(text.lines().count(), 11);
        assert!(text.ends_with("..."));
    }
}
