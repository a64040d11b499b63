//! Line-oriented transport on stdin/stdout for a single local session.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::error::Error;
use crate::events::PlaybackEvent;
use crate::jukebox::Jukebox;
use crate::player::AudioOutput;
use crate::providers::Description;
use crate::queue::{QueueEntry, QueueStatus, Requester};

/// Session name the console plays into
pub const SESSION: &str = "console";

const HELP: &str = "\
commands:
  play <url|id>       queue something
  warikomi <url|id>   queue something to play next
  queue               show the queue
  np                  describe what is playing
  skip                skip the current track
  autoqueue [on|off]  toggle playing cached items when the queue is empty
  recache <url|id>    download a cached item again
  join / leave        start or stop the session
  help                this text
  quit                exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Play(String),
    Warikomi(String),
    Queue,
    NowPlaying,
    Skip,
    Autoqueue(Option<bool>),
    Recache(String),
    Join,
    Leave,
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        let needs_arg = |build: fn(String) -> Command| {
            if rest.is_empty() {
                Err(format!("usage: {} <url or id>", name))
            } else {
                Ok(build(rest.to_string()))
            }
        };

        match name.to_lowercase().as_str() {
            "play" | "p" => needs_arg(Command::Play),
            "warikomi" | "w" => needs_arg(Command::Warikomi),
            "recache" => needs_arg(Command::Recache),
            "queue" | "q" => Ok(Command::Queue),
            "np" => Ok(Command::NowPlaying),
            "skip" | "s" => Ok(Command::Skip),
            "autoqueue" | "autoplay" => match rest {
                "" => Ok(Command::Autoqueue(None)),
                "on" => Ok(Command::Autoqueue(Some(true))),
                "off" => Ok(Command::Autoqueue(Some(false))),
                _ => Err("usage: autoqueue [on|off]".to_string()),
            },
            "join" => Ok(Command::Join),
            "leave" => Ok(Command::Leave),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!("unknown command '{}', try help", other)),
        }
    }
}

pub struct Console {
    jukebox: Arc<Jukebox>,
    output: Arc<dyn AudioOutput>,
    user: String,
}

impl Console {
    pub fn new(
        jukebox: Arc<Jukebox>,
        output: Arc<dyn AudioOutput>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            jukebox,
            output,
            user: user.into(),
        }
    }

    /// Join the console session and serve stdin until EOF or `quit`
    pub async fn run(self) -> std::io::Result<()> {
        let console = Arc::new(self);
        console.jukebox.join(SESSION, Arc::clone(&console.output));
        let printer = tokio::spawn(print_events(console.jukebox.subscribe()));

        println!("jukebot ready, type help for commands");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let command = match Command::parse(&line) {
                Ok(Command::Quit) => break,
                Ok(command) => command,
                Err(usage) => {
                    println!("{}", usage);
                    continue;
                }
            };
            debug!(?command, "console command");

            // downloads can take a while, keep reading input meanwhile
            let console = Arc::clone(&console);
            tokio::spawn(async move {
                if let Some(reply) = console.execute(command).await {
                    println!("{}", reply);
                }
            });
        }

        info!("console closed");
        console.jukebox.shutdown();
        printer.abort();
        Ok(())
    }

    /// Carry out one command; `None` when the event stream will report the outcome
    pub async fn execute(&self, command: Command) -> Option<String> {
        let jukebox = &self.jukebox;
        let result = match command {
            Command::Play(text) => jukebox
                .request(SESSION, &text, Requester::new(&self.user), false)
                .await
                .map(|_| None),
            Command::Warikomi(text) => jukebox
                .request(SESSION, &text, Requester::new(&self.user), true)
                .await
                .map(|_| None),
            Command::Queue => jukebox.status(SESSION).map(|s| Some(format_status(&s))),
            Command::NowPlaying => match jukebox.now_playing(SESSION) {
                Ok(entry) => {
                    let card = entry.content.describe().await;
                    Ok(Some(format_card(&card, &entry)))
                }
                Err(e) => Err(e),
            },
            Command::Skip => jukebox.skip(SESSION).map(|_| Some("Skipped".to_string())),
            Command::Autoqueue(wanted) => jukebox.autoplay_enabled(SESSION).and_then(|current| {
                let enabled = wanted.unwrap_or(!current);
                jukebox.set_autoplay(SESSION, enabled)?;
                Ok(Some(format!("Autoplay is {}", on_off(enabled))))
            }),
            Command::Recache(text) => jukebox
                .recache(&text)
                .await
                .map(|_| Some(format!("Recached {}", text))),
            Command::Join => {
                jukebox.join(SESSION, Arc::clone(&self.output));
                Ok(Some("Joined".to_string()))
            }
            Command::Leave => jukebox.leave(SESSION).map(|_| Some("Left".to_string())),
            Command::Help => Ok(Some(HELP.to_string())),
            Command::Quit => Ok(None),
        };

        result.unwrap_or_else(|e| Some(error_reply(&e)))
    }
}

/// What to tell the user about a failed command
pub fn error_reply(e: &Error) -> String {
    if e.is_user_facing() {
        e.to_string()
    } else {
        error!(error = %e, "command failed");
        "Something went wrong, see the log for details".to_string()
    }
}

async fn print_events(mut events: broadcast::Receiver<PlaybackEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if event.session() == SESSION
                    && let Some(line) = format_event(&event)
                {
                    println!("{}", line);
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "console fell behind on events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

pub fn format_event(event: &PlaybackEvent) -> Option<String> {
    match event {
        PlaybackEvent::Queued {
            entry, position, ..
        } => Some(format!("#{} in queue: {}", position, entry.content.url())),
        PlaybackEvent::Started { entry, .. } => Some(format!(
            "Now playing: {} ({})",
            entry.content.url(),
            who(entry)
        )),
        PlaybackEvent::Finished { .. } => None,
        PlaybackEvent::Failed { entry, error, .. } => Some(format!(
            "Could not play {}: {}",
            entry.content.url(),
            error_reply(error)
        )),
    }
}

fn format_status(status: &QueueStatus) -> String {
    let mut lines = Vec::new();
    match &status.now_playing {
        Some(entry) => lines.push(format!(
            "Now playing: {} ({})",
            entry.content.url(),
            who(entry)
        )),
        None => lines.push("Nothing playing".to_string()),
    }
    for (i, entry) in status.pending.iter().enumerate() {
        lines.push(format!("{}. {} ({})", i + 1, entry.content.url(), who(entry)));
    }
    lines.push(format!("Autoplay: {}", on_off(status.autoplay)));
    lines.join("\n")
}

fn format_card(card: &Description, entry: &QueueEntry) -> String {
    let mut lines = vec![card.title.clone()];
    if let Some(url) = &card.url {
        lines.push(url.clone());
    }
    if let Some(description) = &card.description {
        lines.push(String::new());
        lines.push(description.clone());
        lines.push(String::new());
    }
    for (name, value) in &card.fields {
        lines.push(format!("{}: {}", name, value));
    }
    lines.push(format!("-- {} | {}", card.footer, who(entry)));
    lines.join("\n")
}

fn who(entry: &QueueEntry) -> String {
    match entry.requester() {
        Some(r) => format!("requested by {}", r.user),
        None => "autoplay".to_string(),
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}
