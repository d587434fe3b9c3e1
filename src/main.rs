//! voice-speak entry point.
//!
//! Reads host events from stdin, writes plugin events to stdout, logs to
//! stderr and a rolling file.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use voice_speak::config::{get_config_path, read_config_from};
use voice_speak::ipc::bridge::{spawn_stdin_reader, spawn_stdout_writer};
use voice_speak::logger;
use voice_speak::plugin::SpeakPlugin;
use voice_speak::tts::BackendRouter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init()?;
    info!(version = env!("CARGO_PKG_VERSION"), "voice-speak starting");

    let config_path = get_config_path();
    let config = read_config_from(&config_path);
    info!(
        enabled = config.enabled,
        speak_on = %config.speak_on,
        profile = %config.active_profile,
        "Configuration ready"
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let writer = spawn_stdout_writer(event_rx);

    let router = Arc::new(BackendRouter::new(&config));
    let plugin = SpeakPlugin::new(config, config_path, router, event_tx);
    plugin.start();

    let mut host_rx = spawn_stdin_reader();
    loop {
        match host_rx.recv().await {
            Some(event) => {
                if !plugin.handle(event).await {
                    break;
                }
            }
            None => {
                info!("stdin closed, shutting down");
                plugin.handle(voice_speak::ipc::HostEvent::Shutdown {}).await;
                break;
            }
        }
    }

    // Let queued events reach the host before exiting.
    drop(plugin);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;

    info!("voice-speak stopped");
    Ok(())
}
