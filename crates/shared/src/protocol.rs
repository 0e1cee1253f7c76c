use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationKey, Identity, MessageId},
    error::ApiError,
};

/// Identifier as the backend sends it: a string or any JSON number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Text(String),
    Number(serde_json::Number),
}

impl RawId {
    pub fn identity(&self) -> Option<Identity> {
        Identity::normalize(self.to_string())
    }
}

impl fmt::Display for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Number(number) => write!(f, "{number}"),
        }
    }
}

/// Records may carry `_id`, its `id` virtual, or both; `_id` wins.
fn merge_ids(underscore_id: Option<RawId>, id: Option<RawId>) -> Option<RawId> {
    underscore_id.or(id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireParticipant")]
pub struct EmbeddedParticipant {
    #[serde(rename = "_id")]
    pub id: RawId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Deserialize)]
struct WireParticipant {
    #[serde(rename = "_id", default)]
    underscore_id: Option<RawId>,
    #[serde(default)]
    id: Option<RawId>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl TryFrom<WireParticipant> for EmbeddedParticipant {
    type Error = String;

    fn try_from(wire: WireParticipant) -> Result<Self, Self::Error> {
        let id = merge_ids(wire.underscore_id, wire.id)
            .ok_or_else(|| "participant has neither `_id` nor `id`".to_string())?;
        Ok(Self {
            id,
            username: wire.username,
            name: wire.name,
        })
    }
}

/// Sender or recipient of a message. Populated endpoints embed the user
/// object, others send only its id; consumers must go through
/// [`ParticipantRef::identity`] before comparing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParticipantRef {
    Embedded(EmbeddedParticipant),
    Raw(RawId),
}

impl ParticipantRef {
    pub fn raw(id: impl Into<String>) -> Self {
        Self::Raw(RawId::Text(id.into()))
    }

    pub fn identity(&self) -> Option<Identity> {
        match self {
            Self::Embedded(participant) => participant.id.identity(),
            Self::Raw(id) => id.identity(),
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        match self {
            Self::Embedded(participant) => participant
                .name
                .as_deref()
                .or(participant.username.as_deref()),
            Self::Raw(_) => None,
        }
    }
}

impl From<&Identity> for ParticipantRef {
    fn from(value: &Identity) -> Self {
        Self::raw(value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "WireMessage")]
pub struct MessagePayload {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub sender: ParticipantRef,
    pub recipient: ParticipantRef,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "_id", default)]
    underscore_id: Option<RawId>,
    #[serde(default)]
    id: Option<RawId>,
    sender: ParticipantRef,
    recipient: ParticipantRef,
    #[serde(default)]
    content: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl TryFrom<WireMessage> for MessagePayload {
    type Error = String;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let id = merge_ids(wire.underscore_id, wire.id)
            .ok_or_else(|| "message has neither `_id` nor `id`".to_string())?;
        Ok(Self {
            id: MessageId(id.to_string()),
            sender: wire.sender,
            recipient: wire.recipient,
            content: wire.content,
            created_at: wire.created_at,
        })
    }
}

impl MessagePayload {
    pub fn sender_identity(&self) -> Option<Identity> {
        self.sender.identity()
    }

    pub fn recipient_identity(&self) -> Option<Identity> {
        self.recipient.identity()
    }

    /// True iff `{sender, recipient}` equals `key` as an unordered pair.
    pub fn belongs_to(&self, key: &ConversationKey) -> bool {
        match (self.sender_identity(), self.recipient_identity()) {
            (Some(sender), Some(recipient)) => key.contains_pair(&sender, &recipient),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub recipient: Identity,
    pub content: String,
}

/// Signals emitted by the client on the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientSignal {
    JoinUserRoom(Identity),
    LeaveUserRoom(Identity),
}

/// Events pushed by the server on the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage(MessagePayload),
    Error(ApiError),
}
