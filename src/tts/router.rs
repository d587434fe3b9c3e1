//! Picks a backend per profile and applies the fallback-to-local policy.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use super::http::{HttpBackend, HttpFlavor};
use super::local::LocalBackend;
use super::pool::PoolStatus;
use super::{PlaybackControl, SpeechBackend, TtsError};
use crate::audio::{AudioSink, Playback};
use crate::config::{Profile, SpeakConfig};

/// Backend selected by a profile's `backend` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote(HttpFlavor),
}

impl Route {
    pub fn for_profile(profile: &Profile) -> Self {
        match HttpFlavor::from_kind(profile.backend) {
            Some(flavor) => Route::Remote(flavor),
            None => Route::Local,
        }
    }
}

/// Owns the playback control, the audio sink, the local backend and the
/// current remote backend.
pub struct BackendRouter {
    control: Arc<PlaybackControl>,
    player: Arc<dyn Playback>,
    local: Arc<LocalBackend>,
    remote: Mutex<Option<Arc<HttpBackend>>>,
    /// Profile used when a remote profile falls back to local.
    fallback: Mutex<Profile>,
}

impl BackendRouter {
    pub fn new(config: &SpeakConfig) -> Self {
        let control = Arc::new(PlaybackControl::new(config.enabled));
        let player: Arc<dyn Playback> = Arc::new(AudioSink::with_preferred(config.player.as_deref()));
        let local = LocalBackend::new(config.local.clone(), Arc::clone(&control), Arc::clone(&player));
        Self::from_parts(control, player, local, config.local_fallback())
    }

    pub fn from_parts(
        control: Arc<PlaybackControl>,
        player: Arc<dyn Playback>,
        local: LocalBackend,
        fallback: Profile,
    ) -> Self {
        Self {
            control,
            player,
            local: Arc::new(local),
            remote: Mutex::new(None),
            fallback: Mutex::new(fallback),
        }
    }

    pub fn control(&self) -> &Arc<PlaybackControl> {
        &self.control
    }

    pub fn set_fallback_profile(&self, profile: Profile) {
        if let Ok(mut fallback) = self.fallback.lock() {
            *fallback = profile;
        }
    }

    fn fallback_profile(&self) -> Profile {
        self.fallback
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Remote backend for `flavor`, replacing one of another flavor.
    fn remote(&self, flavor: HttpFlavor) -> Arc<HttpBackend> {
        let mut current = self.remote.lock().unwrap_or_else(|p| p.into_inner());
        match current.as_ref() {
            Some(remote) if remote.flavor() == flavor => Arc::clone(remote),
            _ => {
                let remote = Arc::new(HttpBackend::new(
                    flavor,
                    Arc::clone(&self.control),
                    Arc::clone(&self.player),
                ));
                *current = Some(Arc::clone(&remote));
                remote
            }
        }
    }

    fn current_remote(&self) -> Option<Arc<HttpBackend>> {
        self.remote.lock().ok().and_then(|r| r.clone())
    }

    /// Prepare the backend for `profile`.
    ///
    /// A remote profile with `fallbackToLocal` also loads local, and counts
    /// as initialized when only the local side came up.
    pub async fn try_initialize(&self, profile: &Profile) -> Result<(), TtsError> {
        match Route::for_profile(profile) {
            Route::Local => self.local.initialize(profile).await,
            Route::Remote(flavor) => {
                let remote = self.remote(flavor);
                let local_ok = if profile.fallback_to_local {
                    let fallback = self.fallback_profile();
                    match self.local.initialize(&fallback).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(error = %e, "Local fallback failed to initialize");
                            false
                        }
                    }
                } else {
                    false
                };

                match remote.initialize(profile).await {
                    Ok(()) => Ok(()),
                    Err(e) if local_ok => {
                        warn!(error = %e, "Remote TTS unavailable, local fallback ready");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    pub async fn initialize(&self, profile: &Profile) -> bool {
        match self.try_initialize(profile).await {
            Ok(()) => true,
            Err(e) => {
                warn!(profile = %profile.name, error = %e, "TTS initialization failed");
                false
            }
        }
    }

    /// Speak `text` through the profile's backend.
    ///
    /// A failed remote utterance is retried through local when the profile
    /// allows it and local is already up.
    pub async fn speak(&self, text: &str, profile: &Profile) -> Result<(), TtsError> {
        let epoch = self.control.epoch();
        match Route::for_profile(profile) {
            Route::Local => self.local.speak(text, profile).await,
            Route::Remote(flavor) => {
                let error = match self.remote(flavor).speak(text, profile).await {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                };
                if !profile.fallback_to_local || !self.control.is_current(epoch) {
                    return Err(error);
                }
                let fallback = self.fallback_profile();
                if !self.local.is_ready(&fallback).await {
                    return Err(error);
                }
                info!(error = %error, backend = flavor.name(), "Remote TTS failed, falling back to local");
                self.local.speak(text, &fallback).await
            }
        }
    }

    pub async fn is_ready(&self, profile: &Profile) -> bool {
        match Route::for_profile(profile) {
            Route::Local => self.local.is_ready(profile).await,
            Route::Remote(flavor) => {
                if self.remote(flavor).is_ready(profile).await {
                    return true;
                }
                profile.fallback_to_local && self.local.is_ready(&self.fallback_profile()).await
            }
        }
    }

    /// Stop the current utterance on every backend.
    pub fn interrupt(&self) {
        self.control.advance();
        self.player.stop();
    }

    /// Interrupt, release the local runtime and forget remote availability.
    pub async fn cancel(&self) {
        self.interrupt();
        self.local.cancel().await;
        if let Some(remote) = self.current_remote() {
            remote.reset();
        }
    }

    pub async fn pool_status(&self) -> Option<PoolStatus> {
        self.local.pool_status().await
    }
}
