//! Speech synthesis backends and the playback pipeline.
//!
//! Every backend implements [`SpeechBackend`]:
//! - `local`: a direct engine or a pool of long-lived worker processes
//! - `http` / `kokoro` / `openedai`: OpenAI-compatible speech servers
//!
//! [`router::BackendRouter`] picks one per profile and owns the shared
//! [`PlaybackControl`] used to cancel in-flight utterances.

pub mod chunk;
pub mod clean;
pub mod engine;
pub mod http;
pub mod local;
pub mod pool;
pub mod router;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::audio::AudioError;
use crate::config::Profile;
use pool::PoolError;

pub use chunk::split_into_chunks;
pub use clean::clean_for_speech;
pub use router::BackendRouter;

/// Errors surfaced by a backend.
#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("TTS initialization failed: {0}")]
    Init(String),

    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("TTS server unreachable: {0}")]
    Network(String),

    #[error("TTS server returned {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for TtsError {
    fn from(e: reqwest::Error) -> Self {
        TtsError::Network(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Epoch counter plus the global enabled switch.
///
/// An utterance captures [`epoch`](Self::epoch) when it starts and checks
/// [`is_current`](Self::is_current) before every step; advancing the epoch
/// or disabling TTS makes it stop quietly at the next check.
#[derive(Debug)]
pub struct PlaybackControl {
    epoch: AtomicU64,
    enabled: AtomicBool,
}

impl PlaybackControl {
    pub fn new(enabled: bool) -> Self {
        Self {
            epoch: AtomicU64::new(0),
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Invalidate everything started before now. Returns the new epoch.
    pub fn advance(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether work started at `epoch` may continue.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.is_enabled() && self.epoch() == epoch
    }
}

impl Default for PlaybackControl {
    fn default() -> Self {
        Self::new(true)
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Common interface of every synthesis backend (dyn-compatible).
pub trait SpeechBackend: Send + Sync {
    /// Prepare the backend for `profile` (load models, probe servers).
    fn initialize<'a>(&'a self, profile: &'a Profile) -> BoxFuture<'a, Result<(), TtsError>>;

    /// Synthesize and play `text`. Returns once playback finished or was
    /// abandoned; abandonment is not an error.
    fn speak<'a>(&'a self, text: &'a str, profile: &'a Profile)
        -> BoxFuture<'a, Result<(), TtsError>>;

    fn is_ready<'a>(&'a self, profile: &'a Profile) -> BoxFuture<'a, bool>;

    /// Interrupt and release resources so the next use starts fresh.
    fn cancel(&self) -> BoxFuture<'_, ()>;

    /// Stop the current utterance.
    fn interrupt(&self);

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Temp files
// ---------------------------------------------------------------------------

/// Fresh temp path for chunk `index`: `<prefix>-<ms>-<index>-<rand>.<ext>`.
pub fn temp_audio_path(prefix: &str, index: usize, extension: &str) -> PathBuf {
    let tag = uuid::Uuid::new_v4().simple().to_string();
    std::env::temp_dir().join(format!(
        "{}-{}-{}-{}.{}",
        prefix,
        chrono::Utc::now().timestamp_millis(),
        index,
        &tag[..8],
        extension
    ))
}

/// Audio files owned by one utterance. Whatever is still tracked when the
/// guard drops gets deleted.
#[derive(Debug, Default)]
pub struct TempFiles {
    paths: Vec<PathBuf>,
}

impl TempFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    /// Delete `path` now and stop tracking it.
    pub fn discard(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
        remove_quietly(path);
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            remove_quietly(&path);
        }
    }
}

/// Best-effort delete; failures only show up in debug logs.
pub fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "Failed to delete temp audio");
        }
    }
}
