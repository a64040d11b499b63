use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::autoplay::AutoplaySelector;
use crate::content::ContentRef;
use crate::error::{Error, Result};
use crate::events::{EventBus, PlaybackEvent};
use crate::player::AudioOutput;

/// Who asked for an entry, so they can be told when it plays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub user: String,
    /// Transport handle of the request message, if any
    pub message: Option<String>,
}

impl Requester {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Request(Requester),
    Autoplay,
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub content: ContentRef,
    pub path: PathBuf,
    pub origin: Origin,
}

impl QueueEntry {
    pub fn requested(content: ContentRef, path: PathBuf, requester: Requester) -> Self {
        Self {
            content,
            path,
            origin: Origin::Request(requester),
        }
    }

    pub fn requester(&self) -> Option<&Requester> {
        match &self.origin {
            Origin::Request(r) => Some(r),
            Origin::Autoplay => None,
        }
    }
}

/// Snapshot of a session's queue for display
#[derive(Debug, Clone, Default)]
pub struct QueueStatus {
    pub now_playing: Option<QueueEntry>,
    pub pending: Vec<QueueEntry>,
    pub autoplay: bool,
}

impl QueueStatus {
    /// Whether `cache_key` is playing or waiting in this queue
    pub fn references(&self, cache_key: &str) -> bool {
        self.now_playing
            .iter()
            .chain(self.pending.iter())
            .any(|e| e.content.cache_key() == cache_key)
    }
}

struct NowPlaying {
    entry: QueueEntry,
    play_id: u64,
    stop: CancellationToken,
}

struct State {
    pending: VecDeque<QueueEntry>,
    now_playing: Option<NowPlaying>,
    autoplay: bool,
    next_play_id: u64,
    /// Set by `close`; nothing is claimed afterwards
    closed: bool,
}

impl State {
    /// Publish `entry` as now playing before the output is even asked, so
    /// nothing else starts in the meantime.
    fn claim(&mut self, entry: QueueEntry) -> (u64, CancellationToken) {
        let play_id = self.next_play_id;
        self.next_play_id += 1;
        let stop = CancellationToken::new();
        self.now_playing = Some(NowPlaying {
            entry,
            play_id,
            stop: stop.clone(),
        });
        (play_id, stop)
    }
}

enum Signal {
    /// Start the next entry if idle
    Advance,
    /// A playback ended, naturally or stopped
    Settled(u64),
}

struct Shared {
    session: String,
    state: Mutex<State>,
    signals: mpsc::UnboundedSender<Signal>,
    shutdown: CancellationToken,
    events: EventBus,
}

/// One session's pending list and now-playing slot.
///
/// Stopping the current track happens immediately on the caller's side.
/// Choosing and starting the next one happens on a per-session driver task,
/// one transition at a time, so overlapping advance requests collapse into
/// a single start.
#[derive(Clone)]
pub struct PlaybackQueue {
    shared: Arc<Shared>,
}

impl PlaybackQueue {
    /// Create the queue and start its driver task
    pub fn spawn(
        session: impl Into<String>,
        output: Arc<dyn AudioOutput>,
        autoplay: Arc<AutoplaySelector>,
        autoplay_enabled: bool,
        events: EventBus,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            shared: Arc::new(Shared {
                session: session.into(),
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    now_playing: None,
                    autoplay: autoplay_enabled,
                    next_play_id: 0,
                    closed: false,
                }),
                signals: tx,
                shutdown: CancellationToken::new(),
                events,
            }),
        };

        let driver = Driver {
            queue: queue.clone(),
            output,
            autoplay,
            signals: rx,
        };
        tokio::spawn(driver.run());

        if autoplay_enabled {
            queue.signal(Signal::Advance);
        }
        queue
    }

    pub fn session(&self) -> &str {
        &self.shared.session
    }

    /// Add an entry; priority entries jump to the front and cut the current
    /// track short. Returns the 1-based position in the pending list.
    pub fn enqueue(&self, entry: QueueEntry, priority: bool) -> usize {
        let (position, should_advance) = {
            let mut state = self.lock();
            let position = if priority {
                state.pending.push_front(entry.clone());
                1
            } else {
                state.pending.push_back(entry.clone());
                state.pending.len()
            };
            let idle_and_alone = state.pending.len() == 1 && state.now_playing.is_none();
            (position, priority || idle_and_alone)
        };

        info!(
            session = %self.shared.session,
            key = %entry.content,
            position,
            priority,
            "queued"
        );
        self.shared.events.broadcast(PlaybackEvent::Queued {
            session: self.shared.session.clone(),
            entry,
            position,
        });

        if should_advance {
            self.advance();
        }
        position
    }

    /// Stop whatever is playing, or start the next entry if idle.
    ///
    /// Stopping is idempotent; the stop's completion starts the next entry.
    pub fn advance(&self) {
        {
            let state = self.lock();
            if let Some(current) = &state.now_playing {
                debug!(session = %self.shared.session, key = %current.entry.content, "stopping current track");
                current.stop.cancel();
                return;
            }
        }
        self.signal(Signal::Advance);
    }

    /// End the current track early
    pub fn skip(&self) -> Result<()> {
        let state = self.lock();
        match &state.now_playing {
            Some(current) => {
                info!(session = %self.shared.session, key = %current.entry.content, "skipping");
                current.stop.cancel();
                Ok(())
            }
            None => Err(Error::NothingPlaying),
        }
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.lock();
        QueueStatus {
            now_playing: state.now_playing.as_ref().map(|np| np.entry.clone()),
            pending: state.pending.iter().cloned().collect(),
            autoplay: state.autoplay,
        }
    }

    pub fn now_playing(&self) -> Option<QueueEntry> {
        self.lock().now_playing.as_ref().map(|np| np.entry.clone())
    }

    pub fn is_playing(&self) -> bool {
        self.lock().now_playing.is_some()
    }

    pub fn autoplay_enabled(&self) -> bool {
        self.lock().autoplay
    }

    /// Turning autoplay on while idle starts playback right away
    pub fn set_autoplay(&self, enabled: bool) {
        let idle = {
            let mut state = self.lock();
            state.autoplay = enabled;
            state.now_playing.is_none()
        };
        info!(session = %self.shared.session, enabled, "autoplay toggled");
        if enabled && idle {
            self.signal(Signal::Advance);
        }
    }

    /// Drop everything pending and stop the current track
    pub fn clear(&self) {
        let mut state = self.lock();
        state.pending.clear();
        if let Some(current) = state.now_playing.take() {
            current.stop.cancel();
        }
        debug!(session = %self.shared.session, "queue cleared");
    }

    /// Clear and stop the driver. A pick or start already under way is
    /// dropped instead of played.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.autoplay = false;
        }
        self.clear();
        self.shared.shutdown.cancel();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self, signal: Signal) {
        // Only fails once the driver is gone, i.e. the session closed
        let _ = self.shared.signals.send(signal);
    }
}

/// Serializes every "what plays next" decision for one session
struct Driver {
    queue: PlaybackQueue,
    output: Arc<dyn AudioOutput>,
    autoplay: Arc<AutoplaySelector>,
    signals: mpsc::UnboundedReceiver<Signal>,
}

impl Driver {
    async fn run(mut self) {
        let shutdown = self.queue.shared.shutdown.clone();
        loop {
            let signal = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                signal = self.signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };

            match signal {
                Signal::Advance => self.start_next().await,
                Signal::Settled(play_id) => self.on_playback_settled(play_id).await,
            }
        }
        debug!(session = %self.queue.session(), "queue driver stopped");
    }

    /// Single entry point for natural end and skip alike
    async fn on_playback_settled(&mut self, play_id: u64) {
        let finished = {
            let mut state = self.queue.lock();
            let current = state
                .now_playing
                .as_ref()
                .is_some_and(|np| np.play_id == play_id);
            // otherwise it was cleared while still playing
            if current {
                state.now_playing.take()
            } else {
                None
            }
        };

        if let Some(finished) = finished {
            debug!(session = %self.queue.session(), key = %finished.entry.content, "playback settled");
            self.queue.shared.events.broadcast(PlaybackEvent::Finished {
                session: self.queue.session().to_string(),
                entry: finished.entry,
            });
        }

        self.start_next().await;
    }

    async fn start_next(&mut self) {
        loop {
            let claimed = {
                let mut state = self.queue.lock();
                if state.closed || state.now_playing.is_some() {
                    // closed, or already playing and this request is redundant
                    return;
                }
                match state.pending.pop_front() {
                    Some(entry) => Some((entry.clone(), state.claim(entry))),
                    None if state.autoplay => None,
                    None => return,
                }
            };

            let (entry, (play_id, stop)) = match claimed {
                Some(claimed) => claimed,
                None => match self.claim_autoplay().await {
                    Some(claimed) => claimed,
                    None => return,
                },
            };

            let from_autoplay = entry.origin == Origin::Autoplay;
            match self.output.play(&entry.path, stop).await {
                Ok(done) => {
                    info!(session = %self.queue.session(), key = %entry.content, from_autoplay, "now playing");
                    self.queue.shared.events.broadcast(PlaybackEvent::Started {
                        session: self.queue.session().to_string(),
                        entry,
                    });
                    let queue = self.queue.clone();
                    tokio::spawn(async move {
                        done.await;
                        queue.signal(Signal::Settled(play_id));
                    });
                    return;
                }
                Err(e) => {
                    warn!(session = %self.queue.session(), key = %entry.content, error = %e, "failed to start playback");
                    {
                        let mut state = self.queue.lock();
                        if state.now_playing.as_ref().map(|np| np.play_id) == Some(play_id) {
                            state.now_playing = None;
                        }
                    }
                    self.queue.shared.events.broadcast(PlaybackEvent::Failed {
                        session: self.queue.session().to_string(),
                        entry,
                        error: e,
                    });
                    // a broken output would make autoplay spin forever
                    if from_autoplay {
                        return;
                    }
                }
            }
        }
    }

    /// Ask the selector for something to play. Requests queued while it was
    /// looking win over its pick.
    async fn claim_autoplay(&mut self) -> Option<(QueueEntry, (u64, CancellationToken))> {
        let pick = self.autoplay.pick().await;

        let mut state = self.queue.lock();
        if state.closed {
            debug!(session = %self.queue.session(), "closed during autoplay pick");
            return None;
        }
        if state.now_playing.is_some() {
            return None;
        }
        let entry = match state.pending.pop_front() {
            Some(entry) => entry,
            None if state.autoplay => pick?,
            None => return None,
        };
        Some((entry.clone(), state.claim(entry)))
    }
}
