//! # Console
//!
//! Parses lines from standard input into user commands. No I/O lives here;
//! the node orchestrator owns the actual `stdin` read loop so the parser can
//! be unit tested without a terminal.

use hopmesh_wire::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Whisper { destination: NodeId, text: String },
    Broadcast { text: String },
    Online,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCommand(pub String);

pub fn parse(line: &str) -> Result<Command, InvalidCommand> {
    let line = line.trim_end_matches(['\r', '\n']);

    if line == "ONLINE" {
        return Ok(Command::Online);
    }

    if let Some(rest) = line.strip_prefix("B:") {
        return Ok(Command::Broadcast { text: rest.to_string() });
    }

    if let Some(rest) = line.strip_prefix("W ") {
        if let Some((id_str, text)) = rest.split_once(':') {
            if let Ok(raw) = id_str.parse::<u8>() {
                if let Some(destination) = NodeId::new(raw) {
                    return Ok(Command::Whisper { destination, text: text.to_string() });
                }
            }
        }
    }

    Err(InvalidCommand(line.to_string()))
}
