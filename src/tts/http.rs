//! OpenAI-compatible HTTP speech servers.
//!
//! POST `{url}/v1/audio/speech` with `{"model", "voice", "input", "speed",
//! "response_format", ...options}` and play the returned audio body.
//! Three flavors differ only in their defaults:
//!
//! | flavor     | url                     | model    | voice      |
//! |------------|-------------------------|----------|------------|
//! | `http`     | (required)              | `tts-1`  | `alloy`    |
//! | `kokoro`   | `http://localhost:8880` | `kokoro` | `af_heart` |
//! | `openedai` | `http://localhost:8000` | `tts-1`  | `alloy`    |

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{split_into_chunks, temp_audio_path, PlaybackControl, SpeechBackend, TempFiles, TtsError};
use crate::audio::Playback;
use crate::config::{BackendKind, Profile};

const SPEECH_PATH: &str = "/v1/audio/speech";
const MODELS_PATH: &str = "/v1/models";
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_FORMAT: &str = "mp3";

/// Which kind of speech server a profile points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpFlavor {
    Generic,
    Kokoro,
    OpenedAi,
}

impl HttpFlavor {
    /// Remote flavor for a backend kind; `None` for `local`.
    pub fn from_kind(kind: BackendKind) -> Option<Self> {
        match kind {
            BackendKind::Local => None,
            BackendKind::Http => Some(HttpFlavor::Generic),
            BackendKind::Kokoro => Some(HttpFlavor::Kokoro),
            BackendKind::OpenedAi => Some(HttpFlavor::OpenedAi),
        }
    }

    fn default_url(self) -> Option<&'static str> {
        match self {
            HttpFlavor::Generic => None,
            HttpFlavor::Kokoro => Some("http://localhost:8880"),
            HttpFlavor::OpenedAi => Some("http://localhost:8000"),
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            HttpFlavor::Kokoro => "kokoro",
            HttpFlavor::Generic | HttpFlavor::OpenedAi => "tts-1",
        }
    }

    fn default_voice(self) -> &'static str {
        match self {
            HttpFlavor::Kokoro => "af_heart",
            HttpFlavor::Generic | HttpFlavor::OpenedAi => "alloy",
        }
    }

    /// Temp file prefix.
    fn prefix(self) -> &'static str {
        match self {
            HttpFlavor::Generic => "voice-speak-http",
            HttpFlavor::Kokoro => "voice-speak-kokoro",
            HttpFlavor::OpenedAi => "voice-speak-openedai",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HttpFlavor::Generic => "http",
            HttpFlavor::Kokoro => "kokoro",
            HttpFlavor::OpenedAi => "openedai",
        }
    }
}

/// Everything needed to request one chunk, resolved from a profile.
#[derive(Debug, Clone)]
struct SpeechRequest {
    base_url: String,
    format: String,
    headers: Vec<(String, String)>,
    body: serde_json::Map<String, serde_json::Value>,
}

impl SpeechRequest {
    fn resolve(flavor: HttpFlavor, profile: &Profile) -> Result<Self, TtsError> {
        let url = profile
            .url
            .as_deref()
            .or(flavor.default_url())
            .ok_or_else(|| {
                TtsError::Init(format!("Profile '{}' needs a \"url\" for the http backend", profile.name))
            })?;
        let base_url = url.trim_end_matches('/').trim_end_matches("/v1").to_string();
        let format = profile
            .response_format
            .clone()
            .unwrap_or_else(|| DEFAULT_FORMAT.to_string());

        let mut body = serde_json::Map::new();
        body.insert(
            "model".into(),
            profile.model.as_deref().unwrap_or(flavor.default_model()).into(),
        );
        body.insert(
            "voice".into(),
            profile.voice.as_deref().unwrap_or(flavor.default_voice()).into(),
        );
        body.insert("speed".into(), serde_json::json!(profile.speed));
        body.insert("response_format".into(), format.clone().into());
        for (key, value) in &profile.options {
            body.insert(key.clone(), value.clone());
        }

        Ok(Self {
            base_url,
            format,
            headers: profile.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            body,
        })
    }

    fn speech_url(&self) -> String {
        format!("{}{}", self.base_url, SPEECH_PATH)
    }

    fn models_url(&self) -> String {
        format!("{}{}", self.base_url, MODELS_PATH)
    }
}

/// Fetch the audio for one chunk.
async fn fetch_chunk(
    client: reqwest::Client,
    request: SpeechRequest,
    text: String,
) -> Result<Vec<u8>, TtsError> {
    let mut body = request.body.clone();
    body.insert("input".into(), text.into());

    let mut builder = client.post(request.speech_url()).json(&body);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }

    let resp = builder.send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(TtsError::HttpStatus {
            status: status.as_u16(),
            body: body.trim().to_string(),
        });
    }
    Ok(resp.bytes().await?.to_vec())
}

/// In-flight chunk requests; whatever is left is aborted on drop.
struct Fetches(VecDeque<JoinHandle<Result<Vec<u8>, TtsError>>>);

impl Drop for Fetches {
    fn drop(&mut self) {
        for handle in self.0.drain(..) {
            handle.abort();
        }
    }
}

/// Client for one flavor of OpenAI-compatible speech server.
pub struct HttpBackend {
    flavor: HttpFlavor,
    client: reqwest::Client,
    control: Arc<PlaybackControl>,
    player: Arc<dyn Playback>,
    /// URL last seen reachable. Cleared by `reset()`.
    reachable: Mutex<Option<String>>,
}

impl HttpBackend {
    pub fn new(flavor: HttpFlavor, control: Arc<PlaybackControl>, player: Arc<dyn Playback>) -> Self {
        Self {
            flavor,
            client: reqwest::Client::new(),
            control,
            player,
            reachable: Mutex::new(None),
        }
    }

    pub fn flavor(&self) -> HttpFlavor {
        self.flavor
    }

    /// Forget the cached availability result.
    pub fn reset(&self) {
        if let Ok(mut cached) = self.reachable.lock() {
            *cached = None;
        }
    }

    fn cached(&self, base_url: &str) -> bool {
        self.reachable
            .lock()
            .map(|c| c.as_deref() == Some(base_url))
            .unwrap_or(false)
    }

    /// Whether the server answers at all. Positive results are cached.
    pub async fn check_available(&self, profile: &Profile) -> bool {
        let Ok(request) = SpeechRequest::resolve(self.flavor, profile) else {
            return false;
        };
        if self.cached(&request.base_url) {
            return true;
        }

        let reachable = match self
            .client
            .get(request.models_url())
            .timeout(AVAILABILITY_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => {
                debug!(status = %resp.status(), url = %request.models_url(), "Models endpoint answered");
                true
            }
            Err(e) => {
                debug!(error = %e, "Models endpoint unreachable, trying HEAD");
                self.client
                    .head(&request.base_url)
                    .timeout(AVAILABILITY_TIMEOUT)
                    .send()
                    .await
                    .is_ok()
            }
        };

        if reachable {
            if let Ok(mut cached) = self.reachable.lock() {
                *cached = Some(request.base_url.clone());
            }
        }
        reachable
    }
}

impl SpeechBackend for HttpBackend {
    fn initialize<'a>(&'a self, profile: &'a Profile) -> BoxFuture<'a, Result<(), TtsError>> {
        Box::pin(async move {
            let request = SpeechRequest::resolve(self.flavor, profile)?;
            if !self.check_available(profile).await {
                return Err(TtsError::Network(format!(
                    "{} server not reachable at {}",
                    self.flavor.name(),
                    request.base_url
                )));
            }
            info!(flavor = self.flavor.name(), url = %request.base_url, "Speech server reachable");
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
            let request = SpeechRequest::resolve(self.flavor, profile)?;

            let chunks = split_into_chunks(text, profile.chunk_length);
            if chunks.is_empty() {
                return Ok(());
            }
            debug!(
                flavor = self.flavor.name(),
                chunks = chunks.len(),
                url = %request.base_url,
                "Requesting speech"
            );

            // All requests go out at once; playback follows chunk order.
            let mut fetches = Fetches(
                chunks
                    .into_iter()
                    .map(|chunk| {
                        tokio::spawn(fetch_chunk(self.client.clone(), request.clone(), chunk))
                    })
                    .collect(),
            );
            let mut files = TempFiles::new();
            let mut index = 0;

            while let Some(handle) = fetches.0.pop_front() {
                if !self.control.is_current(epoch) {
                    handle.abort();
                    return Ok(());
                }
                let fetched = handle
                    .await
                    .map_err(|e| TtsError::Synthesis(format!("speech request task failed: {}", e)))
                    .and_then(|result| result);
                if !self.control.is_current(epoch) {
                    debug!(chunk = index, "Utterance cancelled during request");
                    return Ok(());
                }
                let audio = fetched?;

                let path = temp_audio_path(self.flavor.prefix(), index, &request.format);
                files.track(path.clone());
                tokio::fs::write(&path, &audio).await?;

                if !self.control.is_current(epoch) {
                    debug!(chunk = index, "Utterance abandoned before playback");
                    return Ok(());
                }
                self.player.play(&path).await?;
                files.discard(&path);
                index += 1;
            }
            Ok(())
        })
    }

    fn is_ready<'a>(&'a self, profile: &'a Profile) -> BoxFuture<'a, bool> {
        Box::pin(self.check_available(profile))
    }

    fn cancel(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.interrupt();
            self.reset();
        })
    }

    fn interrupt(&self) {
        self.control.advance();
        self.player.stop();
    }

    fn name(&self) -> &'static str {
        self.flavor.name()
    }
}
