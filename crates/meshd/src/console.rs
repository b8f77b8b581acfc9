//! Console commands read from stdin.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `msg <text>`
    Message(String),
    /// `file <path>`
    File(PathBuf),
    /// `peers`
    Peers,
    /// `exit`
    Exit,
    /// Anything unrecognised.
    Help,
}

pub const USAGE: &str = "commands: msg <text> | file <path> | peers | exit";

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Option<ConsoleCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    Some(match (verb, rest) {
        ("msg", text) if !text.is_empty() => ConsoleCommand::Message(text.to_string()),
        ("file", path) if !path.is_empty() => ConsoleCommand::File(PathBuf::from(path)),
        ("peers", "") => ConsoleCommand::Peers,
        ("exit" | "quit", "") => ConsoleCommand::Exit,
        _ => ConsoleCommand::Help,
    })
}
