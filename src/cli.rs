use crate::mission::Mission;
use clap::{Parser, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "qingwang-chat")]
#[command(version)]
#[command(about = "Terminal client for the QingWang legal assistant")]
pub struct Args {
    /// Conversation (room) id to open
    pub room: Option<String>,

    /// Mission for submitted prompts
    #[arg(long, short, value_enum, default_value = "consultation")]
    pub mission: Mission,

    /// Send one prompt, print the answer and exit
    #[arg(long, short)]
    pub prompt: Option<String>,

    /// Let the backend refine retrieval queries with the model
    #[arg(long)]
    pub model_enhanced: bool,

    /// Print streamed answers as they grow instead of only the final text
    #[arg(long, short)]
    pub follow: bool,

    /// List the rooms of the signed-in user and exit
    #[arg(long)]
    pub list_rooms: bool,

    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print shell completions and exit
    #[arg(long, value_enum)]
    pub completions: Option<Shell>,
}

/// One line typed at the interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Submit(String),
    SwitchMission(Mission),
    Refresh,
    Quit,
    Empty,
    /// Unknown slash command or mission name; carries the message to show.
    Invalid(String),
}

/// Interpret one interactive line. Anything not starting with `/` is a prompt.
pub fn parse_repl_line(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ReplCommand::Submit(line.to_string());
    };

    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("quit" | "exit"), None) => ReplCommand::Quit,
        (Some("refresh"), None) => ReplCommand::Refresh,
        (Some("mission"), Some(name)) => match Mission::from_str(name, true) {
            Ok(mission) => ReplCommand::SwitchMission(mission),
            Err(_) => match Mission::from_wire(name) {
                Some(mission) => ReplCommand::SwitchMission(mission),
                None => ReplCommand::Invalid(format!("unknown mission: {}", name)),
            },
        },
        (Some("mission"), None) => ReplCommand::Invalid("usage: /mission <name>".to_string()),
        _ => ReplCommand::Invalid(format!("unknown command: /{}", command)),
    }
}
