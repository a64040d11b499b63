use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PlayerConfig;
use crate::error::{Error, Result};

/// Resolves once playback has ended, naturally or by being stopped
pub type PlaybackDone = BoxFuture<'static, ()>;

/// Where a session's audio goes.
///
/// The chat transport provides its own implementation; [`ProcessOutput`]
/// plays on the local machine.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Start playing `path`. Cancelling `stop` must end playback early and
    /// resolve the returned future.
    async fn play(&self, path: &Path, stop: CancellationToken) -> Result<PlaybackDone>;
}

/// Plays files with an external player process
pub struct ProcessOutput {
    command: String,
    args: Vec<String>,
    volume: u8,
}

impl ProcessOutput {
    pub fn new(config: &PlayerConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            volume: config.volume,
        }
    }
}

#[async_trait]
impl AudioOutput for ProcessOutput {
    async fn play(&self, path: &Path, stop: CancellationToken) -> Result<PlaybackDone> {
        let mut child = launch_player(&self.command, &self.args, self.volume, path)?;
        let file = path.display().to_string();

        Ok(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => debug!(%file, %status, "player exited"),
                    Err(e) => warn!(%file, error = %e, "failed to wait for player"),
                },
                _ = stop.cancelled() => {
                    debug!(%file, "stopping player");
                    if let Err(e) = child.kill().await {
                        warn!(%file, error = %e, "failed to kill player");
                    }
                }
            }
        }
        .boxed())
    }
}

pub fn launch_player(command: &str, args: &[String], volume: u8, file: &Path) -> Result<Child> {
    let mut cmd = Command::new(command);

    // Only add player-specific args for players we know
    if command.contains("mpv") {
        cmd.args(["--no-video", "--really-quiet"]);
        cmd.arg(format!("--volume={}", volume));
    } else if command.contains("ffplay") {
        cmd.args(["-nodisp", "-autoexit", "-loglevel", "quiet"]);
        cmd.args(["-volume", &volume.to_string()]);
    } else if command.contains("vlc") {
        cmd.args(["--intf", "dummy", "--play-and-exit", "--no-video"]);
        cmd.arg(format!("--gain={:.2}", f32::from(volume) / 100.0));
    }

    cmd.args(args);
    cmd.arg(file);

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    cmd.spawn().map_err(|e| {
        Error::Output(format!(
            "failed to launch player '{}': {}. Is the player installed and in your PATH?",
            command, e
        ))
    })
}
