use std::collections::HashSet;

use shared::{
    domain::{ConversationKey, Identity, MessageId},
    protocol::MessagePayload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub message: MessagePayload,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    NoConversation,
    OutOfScope,
    Duplicate,
    Appended,
}

/// Merges history and live pushes for the active conversation into one
/// ordered, id-unique sequence.
#[derive(Debug, Default)]
pub struct Reconciler {
    key: Option<ConversationKey>,
    messages: Vec<MessagePayload>,
    ids: HashSet<MessageId>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(&self) -> Option<&ConversationKey> {
        self.key.as_ref()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drops every message and scopes the set to `key`.
    pub fn reset(&mut self, key: Option<ConversationKey>) {
        self.key = key;
        self.messages.clear();
        self.ids.clear();
    }

    /// Applies history loaded for `key`. Returns false, leaving the set
    /// untouched, when `key` is no longer active. Pushes that arrived before
    /// the history are kept.
    pub fn apply_history(&mut self, key: &ConversationKey, history: Vec<MessagePayload>) -> bool {
        let Some(active) = self.key.as_ref() else {
            return false;
        };
        if active != key {
            return false;
        }

        let live = std::mem::take(&mut self.messages);
        self.ids.clear();
        for message in history {
            if message.belongs_to(key) && self.ids.insert(message.id.clone()) {
                self.messages.push(message);
            }
        }
        for message in live {
            if self.ids.insert(message.id.clone()) {
                self.insert_ordered(message);
            }
        }
        true
    }

    /// Membership is checked against the key active now, not the one that
    /// was active when the push was subscribed.
    pub fn accept_push(&mut self, message: MessagePayload) -> PushOutcome {
        let Some(key) = self.key.as_ref() else {
            return PushOutcome::NoConversation;
        };
        if !message.belongs_to(key) {
            return PushOutcome::OutOfScope;
        }
        if !self.ids.insert(message.id.clone()) {
            return PushOutcome::Duplicate;
        }
        self.insert_ordered(message);
        PushOutcome::Appended
    }

    pub fn messages(&self) -> &[MessagePayload] {
        &self.messages
    }

    pub fn rendered(&self) -> Vec<RenderedMessage> {
        let Some(key) = self.key.as_ref() else {
            return Vec::new();
        };
        self.messages
            .iter()
            .filter(|message| message.belongs_to(key))
            .map(|message| render(message, key.self_identity()))
            .collect()
    }

    pub fn render_one(&self, id: &MessageId) -> Option<RenderedMessage> {
        let key = self.key.as_ref()?;
        self.messages
            .iter()
            .find(|message| &message.id == id)
            .map(|message| render(message, key.self_identity()))
    }

    // Scans from the tail: in-order delivery is a plain append, a late
    // message slides back past newer entries. Untimed messages never move.
    fn insert_ordered(&mut self, message: MessagePayload) {
        let index = match message.created_at {
            Some(created_at) => self
                .messages
                .iter()
                .rposition(|existing| existing.created_at.map_or(true, |at| at <= created_at))
                .map_or(0, |position| position + 1),
            None => self.messages.len(),
        };
        self.messages.insert(index, message);
    }
}

fn render(message: &MessagePayload, self_identity: &Identity) -> RenderedMessage {
    let direction = if message.sender_identity().as_ref() == Some(self_identity) {
        Direction::Sent
    } else {
        Direction::Received
    };
    RenderedMessage {
        message: message.clone(),
        direction,
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
