//! Configuration reading, profiles, and data directory paths.
//!
//! The config file is a camelCase JSON document:
//! ```json
//! {
//!   "enabled": true,
//!   "speakOn": "message",
//!   "activeProfile": "kokoro",
//!   "profiles": {
//!     "local":  { "backend": "local", "voice": "af_heart", "workers": 2 },
//!     "kokoro": { "backend": "kokoro", "url": "http://localhost:8880", "fallbackToLocal": true }
//!   }
//! }
//! ```

pub mod paths;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use paths::{get_config_path, get_data_dir, get_log_dir};

/// Default maximum characters per synthesis chunk.
pub const DEFAULT_CHUNK_LENGTH: usize = 240;

/// Name of the profile created when the config has none.
pub const DEFAULT_PROFILE: &str = "local";

// ---------------------------------------------------------------------------
// JSON schema
// ---------------------------------------------------------------------------

/// Which synthesis provider a profile talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local CPU model: one direct engine or a pool of worker processes.
    #[default]
    Local,
    /// Any OpenAI-compatible `/v1/audio/speech` server.
    Http,
    /// Kokoro FastAPI server.
    Kokoro,
    /// openedai-speech server.
    #[serde(rename = "openedai")]
    OpenedAi,
}

impl BackendKind {
    pub fn is_remote(self) -> bool {
        !matches!(self, Self::Local)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Http => write!(f, "http"),
            Self::Kokoro => write!(f, "kokoro"),
            Self::OpenedAi => write!(f, "openedai"),
        }
    }
}

/// When an assistant message gets spoken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakTrigger {
    /// As soon as a message is marked completed.
    #[default]
    Message,
    /// When the session goes idle, speak its latest message.
    Idle,
}

impl std::fmt::Display for SpeakTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message => write!(f, "message"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// A named bundle of backend settings. Exactly one profile is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Profile name (the key in `profiles`; filled in after loading).
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub backend: BackendKind,
    /// Base URL for HTTP backends.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_speed")]
    pub speed: f32,
    /// Audio format requested from HTTP backends (mp3, wav, opus, flac...).
    #[serde(default)]
    pub response_format: Option<String>,
    /// Extra request headers (e.g. `Authorization`).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Provider-specific fields merged into the request body.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
    /// Maximum local worker processes. 0 selects the direct engine.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Retry through the local backend when a remote backend fails.
    #[serde(default)]
    pub fallback_to_local: bool,
    #[serde(default = "default_chunk_length")]
    pub chunk_length: usize,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROFILE.to_string(),
            backend: BackendKind::Local,
            url: None,
            model: None,
            voice: None,
            speed: default_speed(),
            response_format: None,
            headers: BTreeMap::new(),
            options: serde_json::Map::new(),
            workers: default_workers(),
            fallback_to_local: false,
            chunk_length: default_chunk_length(),
        }
    }
}

/// Settings for the local CPU backend, shared by all local profiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSettings {
    /// Program and arguments of a long-lived generation worker.
    #[serde(default = "default_worker_command")]
    pub worker_command: Vec<String>,
    /// Program and arguments of the direct engine. `{voice}` and `{speed}`
    /// are substituted; text goes to stdin, raw s16le PCM comes back.
    #[serde(default = "default_engine_command")]
    pub engine_command: Vec<String>,
    /// Sample rate of the direct engine's raw output.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_local_voice")]
    pub default_voice: String,
    /// How long to wait for the first worker to report ready.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            worker_command: default_worker_command(),
            engine_command: default_engine_command(),
            sample_rate: default_sample_rate(),
            default_voice: default_local_voice(),
            ready_timeout_secs: default_ready_timeout(),
        }
    }
}

/// Top-level speak.json shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub speak_on: SpeakTrigger,
    #[serde(default = "default_active_profile")]
    pub active_profile: String,
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
    /// Profile used when a remote backend falls back to local.
    #[serde(default)]
    pub fallback_profile: Option<String>,
    #[serde(default)]
    pub local: LocalSettings,
    /// Preferred audio player (program and arguments; the file path is appended).
    #[serde(default)]
    pub player: Option<Vec<String>>,
    /// Text injected into the assistant's system prompt while TTS is on.
    #[serde(default)]
    pub prompt_notice: Option<String>,
}

impl Default for SpeakConfig {
    fn default() -> Self {
        let mut config = Self {
            enabled: true,
            speak_on: SpeakTrigger::default(),
            active_profile: default_active_profile(),
            profiles: BTreeMap::new(),
            fallback_profile: None,
            local: LocalSettings::default(),
            player: None,
            prompt_notice: None,
        };
        config.normalize();
        config
    }
}

impl SpeakConfig {
    /// Fill in profile names and make sure the active profile exists.
    pub fn normalize(&mut self) {
        if self.profiles.is_empty() {
            self.profiles
                .insert(DEFAULT_PROFILE.to_string(), Profile::default());
        }
        for (name, profile) in self.profiles.iter_mut() {
            profile.name = name.clone();
        }
        if !self.profiles.contains_key(&self.active_profile) {
            let first = self.profiles.keys().next().cloned().unwrap_or_default();
            warn!(
                missing = %self.active_profile,
                using = %first,
                "Active profile not found, switching to first profile"
            );
            self.active_profile = first;
        }
    }

    /// Snapshot of the active profile.
    pub fn active(&self) -> Profile {
        self.profiles
            .get(&self.active_profile)
            .cloned()
            .unwrap_or_default()
    }

    pub fn profile(&self, name: &str) -> Option<Profile> {
        self.profiles.get(name).cloned()
    }

    /// Profile the router uses when a remote backend falls back to local.
    ///
    /// Uses `fallbackProfile` when it names a local profile, otherwise the
    /// built-in local defaults.
    pub fn local_fallback(&self) -> Profile {
        self.fallback_profile
            .as_deref()
            .and_then(|name| self.profiles.get(name))
            .filter(|p| p.backend == BackendKind::Local)
            .cloned()
            .unwrap_or_default()
    }

    /// Notice text for the system prompt.
    pub fn prompt_notice_text(&self) -> String {
        self.prompt_notice.clone().unwrap_or_else(|| {
            "Your replies are read aloud by a text-to-speech engine. Prefer plain \
             sentences; avoid tables, long code blocks, and heavy markdown."
                .to_string()
        })
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_speed() -> f32 {
    1.0
}

fn default_workers() -> usize {
    2
}

fn default_chunk_length() -> usize {
    DEFAULT_CHUNK_LENGTH
}

fn default_active_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

fn default_worker_command() -> Vec<String> {
    vec!["kokoro-worker".to_string()]
}

fn default_engine_command() -> Vec<String> {
    ["piper", "--model", "{voice}", "--length_scale", "{speed}", "--output-raw"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_sample_rate() -> u32 {
    22_050
}

fn default_local_voice() -> String {
    "af_heart".to_string()
}

fn default_ready_timeout() -> u64 {
    120
}

// ---------------------------------------------------------------------------
// Reading / writing
// ---------------------------------------------------------------------------

/// Read the config file, falling back to defaults when missing or invalid.
pub fn read_config() -> SpeakConfig {
    read_config_from(&get_config_path())
}

pub fn read_config_from(path: &Path) -> SpeakConfig {
    let mut config: SpeakConfig = read_json_file(path).unwrap_or_default();
    config.normalize();
    info!(
        path = %path.display(),
        profiles = config.profiles.len(),
        active = %config.active_profile,
        "Configuration loaded"
    );
    config
}

/// Persist the config (used after profile switches and toggles).
pub fn write_config(config: &SpeakConfig) -> std::io::Result<()> {
    write_config_to(&get_config_path(), config)
}

pub fn write_config_to(path: &Path, config: &SpeakConfig) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)
}

/// Generic helper: read a JSON file and deserialize it.
fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}
