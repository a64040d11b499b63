//! Checks that keep a recache from pulling a file out from under a session.

use crate::content::ContentRef;
use crate::error::{Error, Result};
use crate::queue::QueueStatus;

/// True when nothing queued, playing, or downloading refers to `content`
pub fn is_free<'a>(
    content: &ContentRef,
    queues: impl IntoIterator<Item = &'a QueueStatus>,
    in_flight_keys: &[String],
) -> bool {
    check(content, queues, in_flight_keys).is_ok()
}

/// Like [`is_free`], naming the reason when it is not
pub fn check<'a>(
    content: &ContentRef,
    queues: impl IntoIterator<Item = &'a QueueStatus>,
    in_flight_keys: &[String],
) -> Result<()> {
    let key = content.cache_key();
    if queues.into_iter().any(|q| q.references(&key)) {
        return Err(Error::StillQueued);
    }
    if in_flight_keys.contains(&key) {
        return Err(Error::AlreadyDownloading);
    }
    Ok(())
}
