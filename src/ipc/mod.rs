//! IPC protocol types for communication with the chat host.
//!
//! Both directions are JSON lines tagged by `"event"`:
//! host -> plugin `{"event": "<name>", ...fields}` and
//! plugin -> host `{"event": "<name>", "data": {...}}`.

pub mod bridge;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Host -> plugin (stdin)
// ---------------------------------------------------------------------------

/// Records received from the host via stdin.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event")]
#[serde(rename_all = "snake_case")]
pub enum HostEvent {
    /// A streamed message changed. `text` is the full text so far.
    MessageUpdated {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        completed: bool,
        #[serde(default)]
        text: String,
    },
    SessionIdle {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// A slash command addressed to the plugin, e.g. `/tts profile kokoro`.
    Command {
        name: String,
        #[serde(default)]
        arguments: String,
    },
    /// The host is assembling a system prompt for `session_id`.
    SystemPrompt {
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
    },
    Ping {},
    Shutdown {},
}

// ---------------------------------------------------------------------------
// Plugin -> host (stdout)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastVariant {
    Info,
    Success,
    Warning,
    Error,
}

/// Records emitted to the host via stdout.
///
/// Serialized as `{"event": "<variant>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum PluginEvent {
    Ready {},
    Toast {
        message: String,
        variant: ToastVariant,
    },
    /// Text the host should add to the system prompt.
    PromptNotice {
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        text: String,
    },
    CommandResult { name: String, message: String },
    SpeakingStart {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    SpeakingEnd {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Pong {},
    Stopping {},
}

impl PluginEvent {
    pub fn toast(message: impl Into<String>, variant: ToastVariant) -> Self {
        PluginEvent::Toast {
            message: message.into(),
            variant,
        }
    }
}
