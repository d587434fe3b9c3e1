//! Direct-mode synthesis engine.
//!
//! Used when a local profile asks for zero workers: each chunk is rendered
//! by running a command-line engine (Piper-style) that reads text on stdin
//! and writes raw signed 16-bit little-endian PCM on stdout.

use std::path::PathBuf;
use std::process::Stdio;

use futures_util::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::TtsError;
use crate::audio::pcm_s16le_to_f32;
use crate::config::LocalSettings;

/// A synthesis engine that renders one chunk at a time in-process order.
pub trait LocalEngine: Send + Sync {
    /// Verify the engine can run. Called once per runtime.
    fn load(&self) -> BoxFuture<'_, Result<(), TtsError>>;

    /// Render `text` to mono f32 samples at [`sample_rate`](Self::sample_rate).
    fn generate<'a>(
        &'a self,
        text: &'a str,
        voice: &'a str,
        speed: f32,
    ) -> BoxFuture<'a, Result<Vec<f32>, TtsError>>;

    fn sample_rate(&self) -> u32;
}

/// Runs `engine_command` once per chunk.
///
/// `{voice}` and `{speed}` in the arguments are substituted per call.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    sample_rate: u32,
}

impl CommandEngine {
    pub fn from_settings(settings: &LocalSettings) -> Result<Self, TtsError> {
        let (program, args) = settings
            .engine_command
            .split_first()
            .ok_or_else(|| TtsError::Init("No local engine command configured".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            sample_rate: settings.sample_rate,
        })
    }

    fn args_for(&self, voice: &str, speed: f32) -> Vec<String> {
        let speed = format!("{}", speed);
        self.args
            .iter()
            .map(|a| a.replace("{voice}", voice).replace("{speed}", &speed))
            .collect()
    }

    fn resolve(&self) -> Result<PathBuf, TtsError> {
        which::which(&self.program).map_err(|e| {
            TtsError::Init(format!(
                "Local engine '{}' not found ({}). Install it or set local.engineCommand in the config.",
                self.program, e
            ))
        })
    }
}

impl LocalEngine for CommandEngine {
    fn load(&self) -> BoxFuture<'_, Result<(), TtsError>> {
        Box::pin(async move {
            let path = self.resolve()?;
            info!(engine = %path.display(), sample_rate = self.sample_rate, "Local engine found");
            Ok(())
        })
    }

    fn generate<'a>(
        &'a self,
        text: &'a str,
        voice: &'a str,
        speed: f32,
    ) -> BoxFuture<'a, Result<Vec<f32>, TtsError>> {
        Box::pin(async move {
            let mut child = Command::new(&self.program)
                .args(self.args_for(voice, speed))
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| TtsError::Synthesis(format!("{} failed to start: {}", self.program, e)))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(text.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                // Dropping stdin signals end of input.
            }

            let output = child.wait_with_output().await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(TtsError::Synthesis(format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    stderr.trim()
                )));
            }

            let samples = pcm_s16le_to_f32(&output.stdout);
            if samples.is_empty() {
                return Err(TtsError::Synthesis(format!("{} produced no audio", self.program)));
            }
            debug!(
                samples = samples.len(),
                chars = text.chars().count(),
                "Chunk rendered"
            );
            Ok(samples)
        })
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
