use std::{
    fmt,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

/// Normalized participant identifier: trimmed, never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn normalize(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::normalize(&value).ok_or_else(|| "identity must not be empty".to_string())
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unordered `{self, peer}` pair scoping the visible messages.
///
/// Equality and hashing ignore which side is which, so `(a, b)` and `(b, a)`
/// name the same conversation.
#[derive(Debug, Clone)]
pub struct ConversationKey {
    self_identity: Identity,
    peer: Identity,
}

impl ConversationKey {
    pub fn new(self_identity: Identity, peer: Identity) -> Self {
        Self {
            self_identity,
            peer,
        }
    }

    pub fn self_identity(&self) -> &Identity {
        &self.self_identity
    }

    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    /// Membership test: `{a, b}` equals this key as an unordered pair.
    pub fn contains_pair(&self, a: &Identity, b: &Identity) -> bool {
        (a == &self.self_identity && b == &self.peer)
            || (a == &self.peer && b == &self.self_identity)
    }

    fn ordered(&self) -> (&Identity, &Identity) {
        if self.self_identity <= self.peer {
            (&self.self_identity, &self.peer)
        } else {
            (&self.peer, &self.self_identity)
        }
    }
}

impl PartialEq for ConversationKey {
    fn eq(&self, other: &Self) -> bool {
        self.ordered() == other.ordered()
    }
}

impl Eq for ConversationKey {}

impl Hash for ConversationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ordered().hash(state);
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.self_identity, self.peer)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn id(raw: &str) -> Identity {
        Identity::normalize(raw).expect("identity")
    }

    #[test]
    fn normalize_trims_and_rejects_blank() {
        assert_eq!(id("  U1 ").as_str(), "U1");
        assert!(Identity::normalize("   ").is_none());
        assert!(Identity::normalize("").is_none());
    }

    #[test]
    fn conversation_key_is_unordered() {
        let forward = ConversationKey::new(id("U1"), id("U2"));
        let backward = ConversationKey::new(id("U2"), id("U1"));
        assert_eq!(forward, backward);

        let mut keys = HashSet::new();
        keys.insert(forward.clone());
        assert!(keys.contains(&backward));

        assert!(forward.contains_pair(&id("U2"), &id("U1")));
        assert!(!forward.contains_pair(&id("U1"), &id("U3")));
        assert!(!forward.contains_pair(&id("U1"), &id("U1")));
    }

    #[test]
    fn identity_deserialization_normalizes() {
        let parsed: Identity = serde_json::from_str("\" U7 \"").expect("parse");
        assert_eq!(parsed.as_str(), "U7");
        assert!(serde_json::from_str::<Identity>("\"  \"").is_err());
    }
}
