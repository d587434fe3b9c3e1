//! External audio player commands, in platform preference order.

use std::path::Path;

/// Placeholder replaced with the audio file path.
const PATH_PLACEHOLDER: &str = "{path}";

/// One candidate player invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl PlayerCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Build from a config entry (`["mpv", "--no-video"]`). Empty → `None`.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// Arguments for playing `path`: `{path}` is substituted, otherwise the
    /// path is appended.
    pub fn args_for(&self, path: &Path) -> Vec<String> {
        let path = path.to_string_lossy();
        if self.args.iter().any(|a| a.contains(PATH_PLACEHOLDER)) {
            self.args
                .iter()
                .map(|a| a.replace(PATH_PLACEHOLDER, &path))
                .collect()
        } else {
            let mut args = self.args.clone();
            args.push(path.into_owned());
            args
        }
    }
}

impl std::fmt::Display for PlayerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)
    }
}

/// Player candidates for the current platform.
pub fn default_players() -> Vec<PlayerCommand> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PlayerCommand::new("afplay", &[]),
            PlayerCommand::new("ffplay", &["-nodisp", "-autoexit", "-loglevel", "quiet"]),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        vec![
            PlayerCommand::new(
                "powershell",
                &[
                    "-NoProfile",
                    "-NonInteractive",
                    "-Command",
                    "(New-Object Media.SoundPlayer '{path}').PlaySync()",
                ],
            ),
            PlayerCommand::new("ffplay", &["-nodisp", "-autoexit", "-loglevel", "quiet"]),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        vec![
            PlayerCommand::new("paplay", &[]),
            PlayerCommand::new("aplay", &["-q"]),
            PlayerCommand::new("pw-play", &[]),
            PlayerCommand::new("ffplay", &["-nodisp", "-autoexit", "-loglevel", "quiet"]),
            PlayerCommand::new("mpv", &["--no-video", "--really-quiet"]),
        ]
    }
}

/// Config override first, then the platform list.
pub fn player_candidates(preferred: Option<&[String]>) -> Vec<PlayerCommand> {
    let mut players: Vec<PlayerCommand> = preferred
        .and_then(PlayerCommand::from_argv)
        .into_iter()
        .collect();
    for player in default_players() {
        if !players.contains(&player) {
            players.push(player);
        }
    }
    players
}
