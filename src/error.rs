use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the playback core.
///
/// Cloneable because a single in-flight download hands the same outcome to
/// every caller waiting on it.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("nothing matched - paste a YouTube URL or a niconico id/URL")]
    NoMatch,
    #[error("cannot recache while it is still downloading")]
    AlreadyDownloading,
    #[error("cannot recache while it is queued somewhere")]
    StillQueued,
    #[error("that is not cached")]
    NotCached,
    #[error("nothing is playing")]
    NothingPlaying,
    #[error("not connected to session '{0}' - join first")]
    NoSession(String),
    /// A provider's own explanation, safe to show to users.
    #[error("{0}")]
    Provider(String),

    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("request failed: {0}")]
    Http(Arc<reqwest::Error>),
    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("download task aborted: {0}")]
    Aborted(String),
    #[error("audio output failed: {0}")]
    Output(String),
}

impl Error {
    /// Whether the message can be shown verbatim to whoever made the request.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::NoMatch
                | Error::AlreadyDownloading
                | Error::StillQueued
                | Error::NotCached
                | Error::NothingPlaying
                | Error::NoSession(_)
                | Error::Provider(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing_classification() {
        assert!(Error::NoMatch.is_user_facing());
        assert!(Error::StillQueued.is_user_facing());
        assert!(Error::Provider("niconico.trialPlay: gone (code: 404)".into()).is_user_facing());

        let io = Error::from(std::io::Error::other("disk full"));
        assert!(!io.is_user_facing());
        assert!(
            !Error::Tool {
                tool: "ffmpeg".into(),
                message: "exit status 1".into()
            }
            .is_user_facing()
        );
    }

    #[test]
    fn test_clone_keeps_message() {
        let e = Error::from(std::io::Error::other("boom"));
        assert_eq!(e.clone().to_string(), e.to_string());
    }
}
