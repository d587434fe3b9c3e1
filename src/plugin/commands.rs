//! `/tts` sub-command parsing.

use crate::config::SpeakTrigger;

/// Host command name this plugin answers to.
pub const COMMAND_NAME: &str = "tts";

pub const USAGE: &str = "Usage: /tts [on|off|stop|status|profiles|profile <name>|mode message|idle|reload]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtsCommand {
    Toggle,
    On,
    Off,
    Stop,
    Status,
    Profiles,
    Profile(String),
    Mode(SpeakTrigger),
    Reload,
    /// Unrecognized input; carries a hint to show above the usage line.
    Invalid(String),
}

pub fn parse_command(arguments: &str) -> TtsCommand {
    let mut words = arguments.split_whitespace();
    let Some(sub) = words.next() else {
        return TtsCommand::Toggle;
    };
    let rest: Vec<&str> = words.collect();

    match (sub.to_ascii_lowercase().as_str(), rest.as_slice()) {
        ("on", []) => TtsCommand::On,
        ("off", []) => TtsCommand::Off,
        ("stop", []) => TtsCommand::Stop,
        ("status", []) => TtsCommand::Status,
        ("profiles", []) => TtsCommand::Profiles,
        ("reload", []) => TtsCommand::Reload,
        ("profile", [name]) => TtsCommand::Profile(name.to_string()),
        ("profile", _) => TtsCommand::Invalid("profile needs exactly one name".into()),
        ("mode", ["message"]) => TtsCommand::Mode(SpeakTrigger::Message),
        ("mode", ["idle"]) => TtsCommand::Mode(SpeakTrigger::Idle),
        ("mode", _) => TtsCommand::Invalid("mode must be 'message' or 'idle'".into()),
        (other, _) => TtsCommand::Invalid(format!("unknown option '{}'", other)),
    }
}
