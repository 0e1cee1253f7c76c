//! Turns published session views into terminal output.

use client_core::{ChatView, Direction, RenderedMessage};
use shared::domain::{Identity, MessageId};

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Peer(Identity),
    Leave,
    Quit,
    Send(String),
}

/// `None` for blank input and for commands missing their argument.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Send(line.to_string()));
    };
    let (name, arg) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    match name {
        "peer" => Identity::normalize(arg).map(Command::Peer),
        "leave" => Some(Command::Leave),
        "quit" | "exit" => Some(Command::Quit),
        _ => Some(Command::Send(line.to_string())),
    }
}

pub fn format_message(rendered: &RenderedMessage) -> String {
    let message = &rendered.message;
    match rendered.direction {
        Direction::Sent => format!("> you: {}", message.content),
        Direction::Received => {
            let who = message
                .sender
                .display_name()
                .map(str::to_string)
                .or_else(|| message.sender_identity().map(|id| id.to_string()))
                .unwrap_or_else(|| "?".to_string());
            format!("< {who}: {}", message.content)
        }
    }
}

/// Tracks what has been printed so each view update prints only what is new.
#[derive(Debug, Default)]
pub struct Transcript {
    peer: Option<Identity>,
    shown: Vec<MessageId>,
    announced_empty: bool,
}

impl Transcript {
    pub fn update(&mut self, view: &ChatView) -> Vec<String> {
        let mut lines = Vec::new();
        if view.peer != self.peer {
            self.peer = view.peer.clone();
            self.shown.clear();
            self.announced_empty = false;
            if let Some(peer) = &self.peer {
                lines.push(format!("--- conversation with {peer} ---"));
            }
        }
        if view.loading {
            return lines;
        }
        if view.messages.is_empty() {
            self.shown.clear();
            if view.peer.is_some() && !self.announced_empty {
                self.announced_empty = true;
                lines.push("--- no messages yet ---".to_string());
            }
            return lines;
        }
        self.announced_empty = false;

        let ids: Vec<&MessageId> = view.messages.iter().map(|m| &m.message.id).collect();
        let is_extension =
            ids.len() >= self.shown.len() && self.shown.iter().zip(&ids).all(|(a, b)| a == *b);
        let start = if is_extension {
            self.shown.len()
        } else {
            lines.push("--- (redrawn) ---".to_string());
            0
        };
        lines.extend(view.messages[start..].iter().map(format_message));
        self.shown = ids.into_iter().cloned().collect();
        lines
    }
}
