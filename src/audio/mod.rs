//! Audio output: WAV encoding and external player processes.
//!
//! Playback shells out to a platform player (`afplay`, `paplay`, PowerShell,
//! ...) and tries each candidate until one exits with status zero. The
//! running player is tracked so `stop()` can kill it mid-utterance.

pub mod players;
pub mod wav;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub use players::{default_players, player_candidates, PlayerCommand};
pub use wav::{pcm_s16le_to_f32, write_wav};

/// Errors from writing or playing audio files.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// Every candidate player failed to run or exited non-zero.
    #[error("No audio player could play the file (tried: {tried}). Install one of them or set \"player\" in the config.")]
    NoPlayer { tried: String },

    /// WAV encoding failed.
    #[error("Failed to write WAV file: {0}")]
    Wav(String),
}

/// Something that can play an audio file and be interrupted.
pub trait Playback: Send + Sync {
    /// Play the file to completion. A `stop()` during playback ends the
    /// call with `Ok(())`.
    fn play<'a>(
        &'a self,
        path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), AudioError>> + Send + 'a>>;

    /// Kill the active player, if any.
    fn stop(&self);
}

/// The player process currently tracked by the sink.
struct ActivePlayer {
    id: u64,
    kill: oneshot::Sender<()>,
}

/// Plays files through external player processes, one at a time.
pub struct AudioSink {
    players: Vec<PlayerCommand>,
    current: Mutex<Option<ActivePlayer>>,
    /// Serializes plays so only one player process exists at a time.
    play_lock: tokio::sync::Mutex<()>,
    /// Bumped by `stop()`; a play that sees it change stops trying candidates.
    stops: AtomicU64,
    next_id: AtomicU64,
}

impl AudioSink {
    pub fn new(players: Vec<PlayerCommand>) -> Self {
        Self {
            players,
            current: Mutex::new(None),
            play_lock: tokio::sync::Mutex::new(()),
            stops: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// Sink with the platform player list plus an optional preferred player.
    pub fn with_preferred(preferred: Option<&[String]>) -> Self {
        Self::new(player_candidates(preferred))
    }

    /// Whether a player process is currently tracked.
    pub fn is_playing(&self) -> bool {
        self.current.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn track(&self, player: ActivePlayer) {
        if let Ok(mut guard) = self.current.lock() {
            *guard = Some(player);
        }
    }

    fn untrack(&self, id: u64) {
        if let Ok(mut guard) = self.current.lock() {
            if guard.as_ref().map(|p| p.id) == Some(id) {
                *guard = None;
            }
        }
    }

    async fn play_file(&self, path: &Path) -> Result<(), AudioError> {
        // Read before queueing on the lock: a stop() issued while this play
        // waits for the previous one applies to it too.
        let stops_at_start = self.stops.load(Ordering::SeqCst);
        let _serial = self.play_lock.lock().await;
        let mut failures: Vec<String> = Vec::new();

        for player in &self.players {
            if self.stops.load(Ordering::SeqCst) != stops_at_start {
                debug!("Playback stopped before trying {}", player);
                return Ok(());
            }

            let mut child = match Command::new(&player.program)
                .args(player.args_for(path))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    debug!(player = %player, error = %e, "Player unavailable");
                    failures.push(format!("{} ({})", player, e));
                    continue;
                }
            };

            let (kill_tx, kill_rx) = oneshot::channel();
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.track(ActivePlayer { id, kill: kill_tx });
            if self.stops.load(Ordering::SeqCst) != stops_at_start {
                // stop() ran between spawn and track and found nothing to kill.
                self.untrack(id);
                if let Err(e) = child.kill().await {
                    warn!(player = %player, error = %e, "Failed to kill player");
                }
                debug!(player = %player, "Playback stopped before it started");
                return Ok(());
            }

            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            self.untrack(id);

            match status {
                None => {
                    if let Err(e) = child.kill().await {
                        warn!(player = %player, error = %e, "Failed to kill player");
                    }
                    info!(player = %player, "Playback stopped");
                    return Ok(());
                }
                Some(Ok(status)) if status.success() => {
                    debug!(player = %player, path = %path.display(), "Playback finished");
                    return Ok(());
                }
                Some(Ok(status)) => {
                    debug!(player = %player, %status, "Player failed");
                    failures.push(format!("{} ({})", player, status));
                }
                Some(Err(e)) => {
                    failures.push(format!("{} ({})", player, e));
                }
            }
        }

        let tried = if failures.is_empty() {
            "no players configured".to_string()
        } else {
            failures.join(", ")
        };
        Err(AudioError::NoPlayer { tried })
    }
}

impl Playback for AudioSink {
    fn play<'a>(
        &'a self,
        path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), AudioError>> + Send + 'a>> {
        Box::pin(self.play_file(path))
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let active = self.current.lock().ok().and_then(|mut g| g.take());
        if let Some(active) = active {
            debug!(id = active.id, "Killing active player");
            let _ = active.kill.send(());
        }
    }
}
