//! Local synthesis: a direct engine or a pool of worker processes.
//!
//! Pooled mode queues every chunk up front and plays results strictly in
//! chunk order while later chunks are still generating. Both modes check
//! the shared [`PlaybackControl`] before each step and delete every audio
//! file they produced, whether the utterance finished, failed or was
//! abandoned.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::engine::{CommandEngine, LocalEngine};
use super::pool::{pool_size, PendingResult, PoolStatus, WorkerPool};
use super::worker::{ProcessLauncher, WorkerLauncher};
use super::{
    remove_quietly, split_into_chunks, temp_audio_path, PlaybackControl, SpeechBackend, TempFiles,
    TtsError,
};
use crate::audio::{write_wav, Playback};
use crate::config::{LocalSettings, Profile};

#[derive(Clone)]
enum LocalRuntime {
    Direct(Arc<dyn LocalEngine>),
    Pooled(Arc<WorkerPool>),
}

impl LocalRuntime {
    fn serves(&self, profile: &Profile) -> bool {
        match self {
            LocalRuntime::Direct(_) => profile.workers == 0,
            LocalRuntime::Pooled(_) => profile.workers > 0,
        }
    }

    fn shutdown(&self) {
        if let LocalRuntime::Pooled(pool) = self {
            pool.shutdown();
        }
    }
}

/// Local backend. Owns at most one runtime at a time.
pub struct LocalBackend {
    settings: LocalSettings,
    control: Arc<PlaybackControl>,
    player: Arc<dyn Playback>,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    engine: Option<Arc<dyn LocalEngine>>,
    runtime: Mutex<Option<LocalRuntime>>,
}

impl LocalBackend {
    pub fn new(
        settings: LocalSettings,
        control: Arc<PlaybackControl>,
        player: Arc<dyn Playback>,
    ) -> Self {
        let launcher = ProcessLauncher::from_argv(&settings.worker_command)
            .map(|l| Arc::new(l) as Arc<dyn WorkerLauncher>);
        Self {
            settings,
            control,
            player,
            launcher,
            engine: None,
            runtime: Mutex::new(None),
        }
    }

    /// Use `launcher` instead of the configured worker command.
    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Use `engine` instead of the configured engine command.
    pub fn with_engine(mut self, engine: Arc<dyn LocalEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Pool occupancy, if the pooled runtime is up.
    pub async fn pool_status(&self) -> Option<PoolStatus> {
        match self.runtime.lock().await.as_ref() {
            Some(LocalRuntime::Pooled(pool)) => Some(pool.status()),
            _ => None,
        }
    }

    fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.ready_timeout_secs.max(1))
    }

    async fn build(&self, profile: &Profile) -> Result<LocalRuntime, TtsError> {
        if profile.workers == 0 {
            let engine: Arc<dyn LocalEngine> = match &self.engine {
                Some(engine) => Arc::clone(engine),
                None => Arc::new(CommandEngine::from_settings(&self.settings)?),
            };
            engine.load().await?;
            info!(profile = %profile.name, "Local engine loaded (direct mode)");
            return Ok(LocalRuntime::Direct(engine));
        }

        let launcher = self
            .launcher
            .as_ref()
            .ok_or_else(|| TtsError::Init("No local worker command configured".into()))?;
        let size = pool_size(profile.workers);
        info!(profile = %profile.name, workers = size, "Starting local worker pool");
        Ok(LocalRuntime::Pooled(Arc::new(WorkerPool::spawn(size, launcher.as_ref()))))
    }

    /// Current runtime for `profile`, building it on first use.
    ///
    /// Concurrent callers share one build. A pool is published before its
    /// workers are ready so `cancel()` can shut it down while they load.
    async fn ensure_runtime(&self, profile: &Profile) -> Result<LocalRuntime, TtsError> {
        let runtime = {
            let mut guard = self.runtime.lock().await;
            match guard.as_ref() {
                Some(runtime) if runtime.serves(profile) => runtime.clone(),
                _ => {
                    if let Some(old) = guard.take() {
                        debug!("Worker count changed, rebuilding local runtime");
                        old.shutdown();
                    }
                    let runtime = self.build(profile).await?;
                    *guard = Some(runtime.clone());
                    runtime
                }
            }
        };

        if let LocalRuntime::Pooled(pool) = &runtime {
            let failure = match tokio::time::timeout(self.ready_timeout(), pool.ready()).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!(
                    "workers not ready after {}s",
                    self.ready_timeout().as_secs()
                )),
            };
            if let Some(reason) = failure {
                self.discard_pool(pool).await;
                return Err(TtsError::Init(reason));
            }
        }
        Ok(runtime)
    }

    /// Drop `pool` if it is still the current runtime, so the next use retries.
    async fn discard_pool(&self, pool: &Arc<WorkerPool>) {
        let mut guard = self.runtime.lock().await;
        if let Some(LocalRuntime::Pooled(current)) = guard.as_ref() {
            if Arc::ptr_eq(current, pool) {
                *guard = None;
            }
        }
        drop(guard);
        pool.shutdown();
    }

    // ── Direct mode ──────────────────────────────────────────────────

    async fn speak_direct(
        &self,
        engine: &dyn LocalEngine,
        chunks: &[String],
        voice: &str,
        speed: f32,
        epoch: u64,
    ) -> Result<(), TtsError> {
        let mut files = TempFiles::new();

        for (index, chunk) in chunks.iter().enumerate() {
            if !self.control.is_current(epoch) {
                debug!(chunk = index, "Utterance abandoned before generation");
                return Ok(());
            }
            let samples = match engine.generate(chunk, voice, speed).await {
                Ok(samples) => samples,
                Err(_) if !self.control.is_current(epoch) => {
                    debug!(chunk = index, "Utterance cancelled during generation");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let path = temp_audio_path("voice-speak-local", index, "wav");
            files.track(path.clone());
            write_wav(&path, &samples, engine.sample_rate())?;

            if !self.control.is_current(epoch) {
                debug!(chunk = index, "Utterance abandoned before playback");
                return Ok(());
            }
            self.player.play(&path).await?;
            files.discard(&path);
        }
        Ok(())
    }

    // ── Pooled mode ──────────────────────────────────────────────────

    async fn speak_pooled(
        &self,
        pool: &WorkerPool,
        chunks: &[String],
        voice: &str,
        speed: f32,
        epoch: u64,
    ) -> Result<(), TtsError> {
        if !self.control.is_current(epoch) {
            return Ok(());
        }
        let mut outstanding = Outstanding(
            chunks
                .iter()
                .map(|chunk| pool.enqueue(chunk, voice, speed))
                .collect(),
        );
        let mut files = TempFiles::new();
        let mut index = 0;

        while let Some(pending) = outstanding.0.pop_front() {
            if !self.control.is_current(epoch) {
                outstanding.0.push_front(pending);
                debug!(chunk = index, "Utterance abandoned while waiting");
                return Ok(());
            }

            let path = match pending.await {
                Ok(path) => path,
                // Cancel shuts the pool down under us; that is not a failure.
                Err(_) if !self.control.is_current(epoch) => {
                    debug!(chunk = index, "Utterance cancelled during generation");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            files.track(path.clone());

            if !self.control.is_current(epoch) {
                debug!(chunk = index, "Utterance abandoned before playback");
                return Ok(());
            }
            debug!(chunk = index, path = %path.display(), "Playing chunk");
            self.player.play(&path).await?;
            files.discard(&path);
            index += 1;
        }
        Ok(())
    }
}

/// Results of chunks still being generated. Whatever is left when the
/// utterance ends is awaited in the background and its files deleted.
struct Outstanding(VecDeque<PendingResult>);

impl Drop for Outstanding {
    fn drop(&mut self) {
        if self.0.is_empty() {
            return;
        }
        let pending: Vec<PendingResult> = self.0.drain(..).collect();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        debug!(count = pending.len(), "Draining abandoned chunk results");
        handle.spawn(async move {
            for result in pending {
                if let Ok(path) = result.await {
                    remove_quietly(Path::new(&path));
                }
            }
        });
    }
}

impl SpeechBackend for LocalBackend {
    fn initialize<'a>(&'a self, profile: &'a Profile) -> BoxFuture<'a, Result<(), TtsError>> {
        Box::pin(async move {
            self.ensure_runtime(profile).await?;
            info!(profile = %profile.name, "Local TTS ready");
            Ok(())
        })
    }

    fn speak<'a>(
        &'a self,
        text: &'a str,
        profile: &'a Profile,
    ) -> BoxFuture<'a, Result<(), TtsError>> {
        Box::pin(async move {
            let epoch = self.control.epoch();

            let runtime = match self.ensure_runtime(profile).await {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(error = %e, "Local TTS unavailable, skipping utterance");
                    return Ok(());
                }
            };
            if !self.control.is_current(epoch) {
                return Ok(());
            }

            let chunks = split_into_chunks(text, profile.chunk_length);
            if chunks.is_empty() {
                return Ok(());
            }
            let voice = profile
                .voice
                .clone()
                .unwrap_or_else(|| self.settings.default_voice.clone());
            debug!(chunks = chunks.len(), voice = %voice, "Speaking locally");

            match runtime {
                LocalRuntime::Direct(engine) => {
                    self.speak_direct(engine.as_ref(), &chunks, &voice, profile.speed, epoch)
                        .await
                }
                LocalRuntime::Pooled(pool) => {
                    self.speak_pooled(&pool, &chunks, &voice, profile.speed, epoch)
                        .await
                }
            }
        })
    }

    fn is_ready<'a>(&'a self, _profile: &'a Profile) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match self.runtime.lock().await.as_ref() {
                Some(LocalRuntime::Direct(_)) => true,
                Some(LocalRuntime::Pooled(pool)) => pool.is_ready(),
                None => false,
            }
        })
    }

    fn cancel(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.interrupt();
            if let Some(runtime) = self.runtime.lock().await.take() {
                runtime.shutdown();
                info!("Local TTS runtime released");
            }
        })
    }

    fn interrupt(&self) {
        self.control.advance();
        self.player.stop();
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
