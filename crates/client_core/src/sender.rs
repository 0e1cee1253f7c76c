use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::Identity,
    protocol::{MessagePayload, SendMessageRequest},
};
use tracing::{debug, error};

#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn post_message(&self, request: &SendMessageRequest) -> Result<MessagePayload>;
}

/// Compose buffer plus the in-flight flag. The posted message is not added to
/// the conversation here; it comes back through the realtime push path.
#[derive(Debug, Default)]
pub struct OutboundSender {
    compose: String,
    sending: bool,
    last_error: Option<String>,
}

impl OutboundSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compose(&self) -> &str {
        &self.compose
    }

    pub fn set_compose(&mut self, text: impl Into<String>) {
        self.compose = text.into();
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Builds the request and marks a send as pending. `None` is the no-op
    /// case: blank content, no peer, or a send already pending.
    pub fn prepare(&mut self, peer: Option<&Identity>) -> Option<SendMessageRequest> {
        if self.sending {
            debug!("send ignored: previous send still pending");
            return None;
        }
        let content = self.compose.trim();
        if content.is_empty() {
            return None;
        }
        let peer = peer?;

        self.sending = true;
        self.last_error = None;
        Some(SendMessageRequest {
            recipient: peer.clone(),
            content: content.to_string(),
        })
    }

    /// Clears the buffer on success unless it was edited while the send was
    /// pending; keeps it on failure so the user can retry.
    pub fn finish(&mut self, submitted: &str, result: std::result::Result<(), String>) {
        self.sending = false;
        match result {
            Ok(()) => {
                if self.compose.trim() == submitted {
                    self.compose.clear();
                }
            }
            Err(reason) => {
                error!(%reason, "send message failed");
                self.last_error = Some(reason);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/sender_tests.rs"]
mod tests;
