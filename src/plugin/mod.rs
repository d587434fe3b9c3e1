//! Host-facing plugin logic: speak triggers, `/tts` commands, notices.
//!
//! Events arrive one at a time from the main loop. Speech runs in spawned
//! tasks so the loop keeps answering the host while audio plays; a new
//! utterance interrupts the previous one.

pub mod commands;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{read_config_from, write_config_to, Profile, SpeakConfig, SpeakTrigger};
use crate::ipc::{HostEvent, PluginEvent, ToastVariant};
use crate::tts::{clean_for_speech, BackendRouter};
use commands::{parse_command, TtsCommand, COMMAND_NAME, USAGE};

/// How many spoken message ids are remembered.
const SPOKEN_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
struct LatestMessage {
    message_id: String,
    text: String,
    completed: bool,
}

/// Bounded set of message ids that were already spoken.
#[derive(Debug, Default)]
struct SpokenIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl SpokenIds {
    /// Record `id`. Returns `false` if it was already spoken.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= SPOKEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

#[derive(Debug, Default)]
struct Sessions {
    latest: HashMap<String, LatestMessage>,
    spoken: SpokenIds,
}

pub struct SpeakPlugin {
    config: Mutex<SpeakConfig>,
    config_path: PathBuf,
    router: Arc<BackendRouter>,
    events: mpsc::UnboundedSender<PluginEvent>,
    sessions: Mutex<Sessions>,
}

impl SpeakPlugin {
    pub fn new(
        config: SpeakConfig,
        config_path: PathBuf,
        router: Arc<BackendRouter>,
        events: mpsc::UnboundedSender<PluginEvent>,
    ) -> Arc<Self> {
        router.control().set_enabled(config.enabled);
        Arc::new(Self {
            config: Mutex::new(config),
            config_path,
            router,
            events,
            sessions: Mutex::new(Sessions::default()),
        })
    }

    fn config(&self) -> MutexGuard<'_, SpeakConfig> {
        self.config.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, event: PluginEvent) {
        if self.events.send(event).is_err() {
            debug!("Event channel closed, dropping event");
        }
    }

    fn active_profile(&self) -> Profile {
        self.config().active()
    }

    fn persist(&self) {
        let snapshot = self.config().clone();
        if let Err(e) = write_config_to(&self.config_path, &snapshot) {
            warn!(path = %self.config_path.display(), error = %e, "Failed to save config");
        }
    }

    /// Announce readiness and warm up the active profile.
    pub fn start(self: &Arc<Self>) {
        self.emit(PluginEvent::Ready {});
        if self.router.control().is_enabled() {
            self.initialize_in_background();
        }
    }

    fn initialize_in_background(self: &Arc<Self>) {
        let plugin = Arc::clone(self);
        let profile = self.active_profile();
        tokio::spawn(async move {
            match plugin.router.try_initialize(&profile).await {
                Ok(()) => info!(profile = %profile.name, backend = %profile.backend, "TTS ready"),
                Err(e) => {
                    warn!(profile = %profile.name, error = %e, "TTS initialization failed");
                    plugin.emit(PluginEvent::toast(
                        format!("TTS profile '{}' is not available: {}", profile.name, e),
                        ToastVariant::Error,
                    ));
                }
            }
        });
    }

    /// Handle one host event. Returns `false` when the plugin should exit.
    pub async fn handle(self: &Arc<Self>, event: HostEvent) -> bool {
        match event {
            HostEvent::MessageUpdated {
                session_id,
                message_id,
                role,
                completed,
                text,
            } => {
                if role.as_deref() == Some("user") {
                    return true;
                }
                let speak_now = {
                    let trigger = self.config().speak_on;
                    self.sessions().latest.insert(
                        session_id,
                        LatestMessage {
                            message_id: message_id.clone(),
                            text: text.clone(),
                            completed,
                        },
                    );
                    completed && trigger == SpeakTrigger::Message
                };
                if speak_now {
                    self.speak_message(message_id, &text);
                }
            }

            HostEvent::SessionIdle { session_id } => {
                if self.config().speak_on != SpeakTrigger::Idle {
                    return true;
                }
                let latest = self
                    .sessions()
                    .latest
                    .get(&session_id)
                    .filter(|m| m.completed)
                    .cloned();
                if let Some(message) = latest {
                    self.speak_message(message.message_id, &message.text);
                }
            }

            HostEvent::Command { name, arguments } => {
                if name.trim_start_matches('/') != COMMAND_NAME {
                    debug!(command = %name, "Ignoring command for another plugin");
                    return true;
                }
                let message = self.run_command(parse_command(&arguments)).await;
                self.emit(PluginEvent::CommandResult {
                    name: COMMAND_NAME.to_string(),
                    message,
                });
            }

            HostEvent::SystemPrompt { session_id } => {
                if self.router.control().is_enabled() {
                    let text = self.config().prompt_notice_text();
                    self.emit(PluginEvent::PromptNotice { session_id, text });
                }
            }

            HostEvent::Ping {} => self.emit(PluginEvent::Pong {}),

            HostEvent::Shutdown {} => {
                self.emit(PluginEvent::Stopping {});
                self.router.cancel().await;
                return false;
            }
        }
        true
    }

    /// Speak a message once, interrupting whatever is playing.
    fn speak_message(self: &Arc<Self>, message_id: String, text: &str) {
        if !self.router.control().is_enabled() {
            return;
        }
        if !self.sessions().spoken.insert(&message_id) {
            debug!(message = %message_id, "Already spoken");
            return;
        }
        let speech = clean_for_speech(text);
        if speech.is_empty() {
            debug!(message = %message_id, "Nothing speakable in message");
            return;
        }

        let profile = self.active_profile();
        self.router.interrupt();

        let plugin = Arc::clone(self);
        tokio::spawn(async move {
            info!(message = %message_id, chars = speech.chars().count(), profile = %profile.name, "Speaking");
            plugin.emit(PluginEvent::SpeakingStart {
                message_id: message_id.clone(),
            });
            let result = plugin.router.speak(&speech, &profile).await;
            plugin.emit(PluginEvent::SpeakingEnd { message_id });

            if let Err(e) = result {
                warn!(error = %e, "Speech failed");
                plugin.emit(PluginEvent::toast(format!("TTS failed: {}", e), ToastVariant::Error));
            }
        });
    }

    // ── Commands ─────────────────────────────────────────────────────

    async fn run_command(self: &Arc<Self>, command: TtsCommand) -> String {
        debug!(?command, "Running /tts command");
        match command {
            TtsCommand::Toggle => {
                let enabled = !self.router.control().is_enabled();
                self.set_enabled(enabled).await
            }
            TtsCommand::On => self.set_enabled(true).await,
            TtsCommand::Off => self.set_enabled(false).await,
            TtsCommand::Stop => {
                self.router.interrupt();
                "Stopped speaking".to_string()
            }
            TtsCommand::Status => self.status().await,
            TtsCommand::Profiles => {
                let config = self.config();
                let lines: Vec<String> = config
                    .profiles
                    .values()
                    .map(|p| {
                        let marker = if p.name == config.active_profile { "*" } else { " " };
                        format!("{} {} ({})", marker, p.name, p.backend)
                    })
                    .collect();
                lines.join("\n")
            }
            TtsCommand::Profile(name) => self.switch_profile(&name).await,
            TtsCommand::Mode(trigger) => {
                self.config().speak_on = trigger;
                self.persist();
                format!("Speaking on {}", trigger)
            }
            TtsCommand::Reload => self.reload().await,
            TtsCommand::Invalid(hint) => format!("{}. {}", hint, USAGE),
        }
    }

    async fn set_enabled(self: &Arc<Self>, enabled: bool) -> String {
        self.config().enabled = enabled;
        self.router.control().set_enabled(enabled);
        self.persist();

        if enabled {
            self.initialize_in_background();
            format!("TTS enabled (profile {})", self.active_profile().name)
        } else {
            self.router.cancel().await;
            "TTS disabled".to_string()
        }
    }

    async fn status(&self) -> String {
        let (enabled, trigger, profile) = {
            let config = self.config();
            (config.enabled, config.speak_on, config.active())
        };
        let ready = self.router.is_ready(&profile).await;

        let mut status = format!(
            "TTS {}, profile {} ({}), speaks on {}, {}",
            if enabled { "on" } else { "off" },
            profile.name,
            profile.backend,
            trigger,
            if ready { "ready" } else { "not ready" }
        );
        if let Some(pool) = self.router.pool_status().await {
            status.push_str(&format!(
                ", workers {}/{} ready ({} busy, {} failed, {} queued)",
                pool.ready, pool.workers, pool.busy, pool.failed, pool.queued
            ));
        }
        status
    }

    async fn switch_profile(self: &Arc<Self>, name: &str) -> String {
        let (target, available) = {
            let config = self.config();
            (
                config.profile(name),
                config.profiles.keys().cloned().collect::<Vec<_>>(),
            )
        };
        let Some(target) = target else {
            return format!("Unknown profile '{}'. Available: {}", name, available.join(", "));
        };

        self.router.cancel().await;
        let fallback = {
            let mut config = self.config();
            config.active_profile = target.name.clone();
            config.local_fallback()
        };
        self.router.set_fallback_profile(fallback);
        self.persist();
        info!(profile = %target.name, backend = %target.backend, "Switched profile");

        if self.router.control().is_enabled() {
            self.initialize_in_background();
        }
        format!("Switched to profile {} ({})", target.name, target.backend)
    }

    async fn reload(self: &Arc<Self>) -> String {
        let fresh = read_config_from(&self.config_path);
        let restart_needed = {
            let config = self.config();
            config.local != fresh.local || config.player != fresh.player
        };

        self.router.cancel().await;
        self.router.control().set_enabled(fresh.enabled);
        self.router.set_fallback_profile(fresh.local_fallback());
        let (enabled, active) = (fresh.enabled, fresh.active_profile.clone());
        *self.config() = fresh;

        if enabled {
            self.initialize_in_background();
        }
        let mut message = format!("Configuration reloaded (profile {})", active);
        if restart_needed {
            message.push_str("; local engine and player changes apply after restart");
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocalSettings, Profile};
    use crate::tts::local::LocalBackend;
    use crate::tts::testing::{FakeLauncher, FakePlayer};
    use crate::tts::PlaybackControl;
    use std::time::Duration;

    struct Harness {
        plugin: Arc<SpeakPlugin>,
        events: mpsc::UnboundedReceiver<PluginEvent>,
        player: Arc<FakePlayer>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(config: SpeakConfig, player: Arc<FakePlayer>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let audio = dir.path().join("audio");
            std::fs::create_dir_all(&audio).unwrap();

            let control = Arc::new(PlaybackControl::new(config.enabled));
            let local = LocalBackend::new(config.local.clone(), Arc::clone(&control), player.clone())
                .with_launcher(Arc::new(FakeLauncher::new().writing_files(&audio)));
            let router = Arc::new(BackendRouter::from_parts(
                control,
                player.clone(),
                local,
                config.local_fallback(),
            ));
            let (tx, events) = mpsc::unbounded_channel();
            let plugin = SpeakPlugin::new(config, dir.path().join("speak.json"), router, tx);
            Self {
                plugin,
                events,
                player,
                dir,
            }
        }

        fn config_path(&self) -> PathBuf {
            self.dir.path().join("speak.json")
        }

        async fn send(&self, event: HostEvent) -> bool {
            self.plugin.handle(event).await
        }

        async fn command(&mut self, arguments: &str) -> String {
            self.send(HostEvent::Command {
                name: "tts".into(),
                arguments: arguments.into(),
            })
            .await;
            match self.next().await {
                PluginEvent::CommandResult { message, .. } => message,
                other => panic!("expected command result, got {:?}", other),
            }
        }

        async fn next(&mut self) -> PluginEvent {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("no event")
                .expect("event channel closed")
        }

        /// Skip events until one matches.
        async fn wait_for(&mut self, wanted: impl Fn(&PluginEvent) -> bool) -> PluginEvent {
            loop {
                let event = self.next().await;
                if wanted(&event) {
                    return event;
                }
            }
        }

        async fn assert_quiet(&mut self) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(event) = self.events.try_recv() {
                panic!("unexpected event: {:?}", event);
            }
        }
    }

    fn config() -> SpeakConfig {
        let mut config = SpeakConfig::default();
        for name in ["local", "other"] {
            config.profiles.insert(
                name.to_string(),
                Profile {
                    workers: 1,
                    ..Profile::default()
                },
            );
        }
        config.local = LocalSettings {
            ready_timeout_secs: 5,
            ..LocalSettings::default()
        };
        config.normalize();
        config
    }

    fn message(id: &str, text: &str, completed: bool) -> HostEvent {
        HostEvent::MessageUpdated {
            session_id: "s1".into(),
            message_id: id.into(),
            role: Some("assistant".into()),
            completed,
            text: text.into(),
        }
    }

    fn is_speaking_end(event: &PluginEvent) -> bool {
        matches!(event, PluginEvent::SpeakingEnd { .. })
    }

    #[test]
    fn test_spoken_ids_are_bounded() {
        let mut spoken = SpokenIds::default();
        assert!(spoken.insert("m0"));
        assert!(!spoken.insert("m0"));
        for i in 1..=SPOKEN_CAPACITY {
            assert!(spoken.insert(&format!("m{}", i)));
        }
        assert_eq!(spoken.order.len(), SPOKEN_CAPACITY);
        // The oldest id was forgotten.
        assert!(spoken.insert("m0"));
    }

    #[tokio::test]
    async fn test_completed_message_spoken_once() {
        let mut h = Harness::new(config(), FakePlayer::new(Duration::ZERO));

        h.send(message("m1", "Hello", false)).await;
        h.send(message("m1", "Hello there.", true)).await;

        assert_eq!(
            h.next().await,
            PluginEvent::SpeakingStart {
                message_id: "m1".into()
            }
        );
        h.wait_for(is_speaking_end).await;
        assert_eq!(h.player.played(), vec!["Hello there."]);

        h.send(message("m1", "Hello there.", true)).await;
        h.assert_quiet().await;
        assert_eq!(h.player.played().len(), 1);
    }

    #[tokio::test]
    async fn test_user_messages_ignored() {
        let mut h = Harness::new(config(), FakePlayer::new(Duration::ZERO));
        h.send(HostEvent::MessageUpdated {
            session_id: "s1".into(),
            message_id: "u1".into(),
            role: Some("user".into()),
            completed: true,
            text: "Read this back to me.".into(),
        })
        .await;
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_markdown_is_cleaned_before_speaking() {
        let mut h = Harness::new(config(), FakePlayer::new(Duration::ZERO));
        h.send(message("m1", "**Bold** and `code`.", true)).await;
        h.wait_for(is_speaking_end).await;
        assert_eq!(h.player.played(), vec!["Bold and code."]);
    }

    #[tokio::test]
    async fn test_idle_mode_speaks_latest_completed_message() {
        let mut cfg = config();
        cfg.speak_on = SpeakTrigger::Idle;
        let mut h = Harness::new(cfg, FakePlayer::new(Duration::ZERO));

        h.send(message("m1", "First answer.", true)).await;
        h.send(message("m2", "Second answer.", true)).await;
        h.assert_quiet().await;

        h.send(HostEvent::SessionIdle {
            session_id: "s1".into(),
        })
        .await;
        h.wait_for(is_speaking_end).await;
        assert_eq!(h.player.played(), vec!["Second answer."]);

        h.send(HostEvent::SessionIdle {
            session_id: "s1".into(),
        })
        .await;
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_speech_failure_becomes_error_toast() {
        let mut h = Harness::new(config(), FakePlayer::broken());
        h.send(message("m1", "Hello.", true)).await;

        match h.wait_for(|e| matches!(e, PluginEvent::Toast { .. })).await {
            PluginEvent::Toast { message, variant } => {
                assert_eq!(variant, ToastVariant::Error);
                assert!(message.starts_with("TTS failed"), "{}", message);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_prompt_notice_only_when_enabled() {
        let mut cfg = config();
        cfg.prompt_notice = Some("Replies are spoken.".into());
        let mut h = Harness::new(cfg, FakePlayer::new(Duration::ZERO));

        h.send(HostEvent::SystemPrompt {
            session_id: Some("s1".into()),
        })
        .await;
        assert_eq!(
            h.next().await,
            PluginEvent::PromptNotice {
                session_id: Some("s1".into()),
                text: "Replies are spoken.".into()
            }
        );

        assert_eq!(h.command("off").await, "TTS disabled");
        h.send(HostEvent::SystemPrompt { session_id: None }).await;
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_off_persists_and_silences() {
        let mut h = Harness::new(config(), FakePlayer::new(Duration::ZERO));

        assert_eq!(h.command("off").await, "TTS disabled");
        assert!(!read_config_from(&h.config_path()).enabled);

        h.send(message("m1", "Hello.", true)).await;
        h.assert_quiet().await;

        assert!(h.command("").await.starts_with("TTS enabled"));
        assert!(read_config_from(&h.config_path()).enabled);
    }

    #[tokio::test]
    async fn test_off_while_generating_raises_no_toast() {
        let mut h = Harness::new(config(), FakePlayer::new(Duration::ZERO));
        h.send(message("m1", "slow@500.", true)).await;
        assert!(matches!(h.next().await, PluginEvent::SpeakingStart { .. }));
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.send(HostEvent::Command {
            name: "tts".into(),
            arguments: "off".into(),
        })
        .await;

        let (mut replied, mut ended) = (false, false);
        while !(replied && ended) {
            match h.next().await {
                PluginEvent::CommandResult { .. } => replied = true,
                PluginEvent::SpeakingEnd { .. } => ended = true,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        h.assert_quiet().await;
        assert!(h.player.played().is_empty());
    }

    #[tokio::test]
    async fn test_profile_switch() {
        let mut h = Harness::new(config(), FakePlayer::new(Duration::ZERO));

        let reply = h.command("profile missing").await;
        assert!(reply.contains("Unknown profile 'missing'"), "{}", reply);
        assert!(reply.contains("local, other"), "{}", reply);

        assert_eq!(h.command("profile other").await, "Switched to profile other (local)");
        assert_eq!(read_config_from(&h.config_path()).active_profile, "other");

        let profiles = h.command("profiles").await;
        assert!(profiles.contains("* other (local)"), "{}", profiles);
        assert!(profiles.contains("  local (local)"), "{}", profiles);
    }

    #[tokio::test]
    async fn test_mode_and_usage() {
        let mut h = Harness::new(config(), FakePlayer::new(Duration::ZERO));

        assert_eq!(h.command("mode idle").await, "Speaking on idle");
        assert_eq!(read_config_from(&h.config_path()).speak_on, SpeakTrigger::Idle);

        let reply = h.command("volume 11").await;
        assert!(reply.contains(USAGE), "{}", reply);
    }

    #[tokio::test]
    async fn test_status_reports_pool() {
        let mut h = Harness::new(config(), FakePlayer::new(Duration::ZERO));
        h.send(message("m1", "Warm up.", true)).await;
        h.wait_for(is_speaking_end).await;

        let status = h.command("status").await;
        assert!(status.starts_with("TTS on, profile local (local)"), "{}", status);
        assert!(status.contains("ready"), "{}", status);
        assert!(status.contains("workers 1/1"), "{}", status);
    }

    #[tokio::test]
    async fn test_reload_picks_up_file_changes() {
        let mut h = Harness::new(config(), FakePlayer::new(Duration::ZERO));

        let mut on_disk = config();
        on_disk.speak_on = SpeakTrigger::Idle;
        on_disk.active_profile = "other".into();
        write_config_to(&h.config_path(), &on_disk).unwrap();

        let reply = h.command("reload").await;
        assert_eq!(reply, "Configuration reloaded (profile other)");
        assert_eq!(h.plugin.config().speak_on, SpeakTrigger::Idle);
    }

    #[tokio::test]
    async fn test_other_commands_ignored() {
        let mut h = Harness::new(config(), FakePlayer::new(Duration::ZERO));
        h.send(HostEvent::Command {
            name: "compact".into(),
            arguments: String::new(),
        })
        .await;
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_ping_and_shutdown() {
        let mut h = Harness::new(config(), FakePlayer::new(Duration::ZERO));
        assert!(h.send(HostEvent::Ping {}).await);
        assert_eq!(h.next().await, PluginEvent::Pong {});
        assert!(!h.send(HostEvent::Shutdown {}).await);
        assert_eq!(h.next().await, PluginEvent::Stopping {});
    }
}
