use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ConversationKey, Identity},
    protocol::MessagePayload,
};
use tracing::{debug, warn};

use crate::error::ChatError;

#[async_trait]
pub trait HistoryApi: Send + Sync {
    /// Primary path: messages exchanged between the two identities.
    async fn fetch_conversation(
        &self,
        self_identity: &Identity,
        peer: &Identity,
    ) -> Result<Vec<MessagePayload>>;

    /// Fallback path keyed only by the peer.
    async fn fetch_with_peer(&self, peer: &Identity) -> Result<Vec<MessagePayload>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySource {
    Conversation,
    PeerFallback,
    Unavailable,
}

/// History for one conversation, tagged with the key it was requested for so
/// late results can be recognised as stale.
#[derive(Debug, Clone)]
pub struct LoadedHistory {
    pub key: ConversationKey,
    pub messages: Vec<MessagePayload>,
    pub source: HistorySource,
}

#[derive(Clone)]
pub struct HistoryLoader {
    api: Arc<dyn HistoryApi>,
}

impl HistoryLoader {
    pub fn new(api: Arc<dyn HistoryApi>) -> Self {
        Self { api }
    }

    /// Never fails: both retrieval paths failing resolves to an empty set.
    pub async fn load(&self, key: ConversationKey) -> LoadedHistory {
        match self.fetch_with_fallback(&key).await {
            Ok((messages, source)) => {
                debug!(
                    conversation = %key,
                    count = messages.len(),
                    ?source,
                    "history loaded"
                );
                LoadedHistory {
                    key,
                    messages: sort_history(messages),
                    source,
                }
            }
            Err(err) => {
                warn!(conversation = %key, error = %err, "history unavailable; showing empty conversation");
                LoadedHistory {
                    key,
                    messages: Vec::new(),
                    source: HistorySource::Unavailable,
                }
            }
        }
    }

    async fn fetch_with_fallback(
        &self,
        key: &ConversationKey,
    ) -> std::result::Result<(Vec<MessagePayload>, HistorySource), ChatError> {
        let primary_err = match self
            .api
            .fetch_conversation(key.self_identity(), key.peer())
            .await
        {
            Ok(messages) => return Ok((messages, HistorySource::Conversation)),
            Err(err) => err,
        };
        warn!(
            conversation = %key,
            error = %format!("{primary_err:#}"),
            "conversation history fetch failed; trying peer fallback"
        );

        self.api
            .fetch_with_peer(key.peer())
            .await
            .map(|messages| (messages, HistorySource::PeerFallback))
            .map_err(|fallback_err| ChatError::HistoryFetch {
                self_identity: key.self_identity().to_string(),
                peer: key.peer().to_string(),
                reason: format!("{primary_err:#}; fallback: {fallback_err:#}"),
            })
    }
}

/// Stable ascending sort by `createdAt`; the first occurrence of an id wins.
pub fn sort_history(messages: Vec<MessagePayload>) -> Vec<MessagePayload> {
    let mut seen = HashSet::new();
    let mut unique: Vec<MessagePayload> = messages
        .into_iter()
        .filter(|message| seen.insert(message.id.clone()))
        .collect();
    unique.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    unique
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
