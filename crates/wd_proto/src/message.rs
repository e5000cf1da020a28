use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wd_crypto::SealedMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    Direct { receiver_id: String },
    /// Group messages are fanned out as one copy per member.
    Group { group_id: String, member_id: String },
}

impl Destination {
    /// The user whose key the primary branch is sealed to.
    pub fn addressee(&self) -> &str {
        match self {
            Destination::Direct { receiver_id } => receiver_id,
            Destination::Group { member_id, .. } => member_id,
        }
    }
}

/// Immutable ciphertext record. Only its removal (expiry, destruction)
/// mutates the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    pub message_id: String,
    pub sender_id: String,
    pub destination: Destination,
    #[serde(flatten)]
    pub sealed: SealedMessage,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl EncryptedMessage {
    pub fn conversation_id(&self) -> String {
        conversation_id(&self.sender_id, &self.destination)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// True when `user_id` sent the message or is its addressee.
    pub fn involves(&self, user_id: &str) -> bool {
        self.sender_id == user_id || self.destination.addressee() == user_id
    }
}

/// Direct conversations are keyed by the sorted participant pair so both
/// sides land in the same bucket.
pub fn conversation_id(sender_id: &str, destination: &Destination) -> String {
    match destination {
        Destination::Direct { receiver_id } => {
            let (a, b) = if sender_id <= receiver_id.as_str() {
                (sender_id, receiver_id.as_str())
            } else {
                (receiver_id.as_str(), sender_id)
            };
            format!("dm:{a}:{b}")
        }
        Destination::Group { group_id, .. } => format!("group:{group_id}"),
    }
}
