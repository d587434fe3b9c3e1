//! IPC bridge: stdin reader and stdout event emitter.
//!
//! A blocking stdin reader thread forwards decoded host events through an
//! mpsc channel; events for the host are written as JSON lines on stdout,
//! which carries nothing else.

use std::io::{self, BufRead, Write};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{HostEvent, PluginEvent};

/// Emit a `PluginEvent` as a JSON line on stdout and flush.
pub fn emit_event(event: &PluginEvent) {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            error!("Failed to serialize event: {}", e);
            return;
        }
    };
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    // Pipe may be closed while the host shuts down.
    let _ = writeln!(handle, "{}", json);
    let _ = handle.flush();
}

/// Accept `{"type": ...}` from hosts that tag records that way.
fn normalize_event_json(input: &str) -> String {
    if let Ok(mut obj) = serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(input)
    {
        if !obj.contains_key("event") {
            if let Some(type_val) = obj.remove("type") {
                obj.insert("event".to_string(), type_val);
                if let Ok(json) = serde_json::to_string(&obj) {
                    return json;
                }
            }
        }
    }
    input.to_string()
}

/// Decode one stdin line. Blank lines yield `None` without a warning.
pub fn parse_host_line(line: &str) -> Option<HostEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<HostEvent>(&normalize_event_json(trimmed)) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Ignoring invalid host record: {} (input: {})", e, trimmed);
            None
        }
    }
}

/// Spawn a blocking thread that reads JSON lines from stdin and forwards
/// decoded events through the returned channel.
///
/// The channel closes when stdin does (host gone).
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<HostEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        let reader = stdin.lock();
        for line in reader.lines() {
            match line {
                Ok(text) => {
                    if let Some(event) = parse_host_line(&text) {
                        debug!(?event, "Received event from host");
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!("stdin read error: {}", e);
                    break;
                }
            }
        }
        debug!("stdin reader thread exiting");
    });

    rx
}

/// Forward queued plugin events to stdout until every sender is dropped.
pub fn spawn_stdout_writer(mut events: mpsc::UnboundedReceiver<PluginEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            emit_event(&event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tag_is_accepted() {
        assert_eq!(
            parse_host_line(r#"{"type":"session_idle","sessionId":"s"}"#),
            Some(HostEvent::SessionIdle {
                session_id: "s".into()
            })
        );
    }

    #[test]
    fn test_event_tag_wins_over_type() {
        assert_eq!(
            parse_host_line(r#"{"event":"ping","type":"shutdown"}"#),
            Some(HostEvent::Ping {})
        );
    }

    #[test]
    fn test_blank_and_invalid_lines_skipped() {
        assert_eq!(parse_host_line("   "), None);
        assert_eq!(parse_host_line("not json"), None);
        assert_eq!(parse_host_line(r#"{"event":"unknown"}"#), None);
    }
}
