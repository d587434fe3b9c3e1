//! voice-speak: text-to-speech companion process for chat assistant hosts.
//!
//! The host streams assistant messages over JSON-line IPC; the plugin turns
//! completed messages into speech through a local worker pool, a direct
//! engine, or an OpenAI-compatible HTTP server, and plays the audio through
//! an external player.

pub mod audio;
pub mod config;
pub mod ipc;
pub mod logger;
pub mod plugin;
pub mod tts;
