use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wd_crypto::{CryptoError, MessageCipher, PrivateKey, PublicKey};
use wd_proto::{paths, Destination, EncryptedMessage};
use wd_store::RecordStore;
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::error::{Result, TrustError};
use crate::profiles::Profiles;
use crate::roles::RoleTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadableReason {
    /// No private key on this device.
    KeyMissing,
    /// No branch is sealed to the reader's key.
    NotAddressed,
    /// Tampered, truncated or otherwise undecryptable.
    DecryptionFailed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Readable(Zeroizing<String>),
    Unreadable(UnreadableReason),
}

impl MessageBody {
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageBody::Readable(s) => Some(s.as_str()),
            MessageBody::Unreadable(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub message_id: String,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    pub body: MessageBody,
}

/// Open one message. Never fails; every problem degrades to `Unreadable`.
pub fn open_message(msg: &EncryptedMessage, key: Option<&PrivateKey>, now: DateTime<Utc>) -> MessageBody {
    if msg.is_expired(now) {
        return MessageBody::Unreadable(UnreadableReason::Expired);
    }
    let Some(key) = key else {
        return MessageBody::Unreadable(UnreadableReason::KeyMissing);
    };
    match MessageCipher.open(&msg.sealed, key) {
        Ok(text) => MessageBody::Readable(text),
        Err(CryptoError::NoBranchForKey(_)) => MessageBody::Unreadable(UnreadableReason::NotAddressed),
        Err(err) => {
            debug!(message_id = %msg.message_id, error = %err, "message failed to decrypt");
            MessageBody::Unreadable(UnreadableReason::DecryptionFailed)
        }
    }
}

#[derive(Clone)]
pub struct MessageService {
    profiles: Profiles,
    roles: RoleTable,
    clock: Arc<dyn Clock>,
}

impl MessageService {
    pub fn new(profiles: Profiles, roles: RoleTable, clock: Arc<dyn Clock>) -> Self {
        Self { profiles, roles, clock }
    }

    fn store(&self) -> &Arc<dyn RecordStore> {
        self.profiles.store()
    }

    async fn public_key_of(&self, user_id: &str) -> Result<PublicKey> {
        let profile = self.profiles.get(user_id).await?;
        profile.public_key.ok_or(TrustError::AccountDestroyed)
    }

    async fn persist(&self, msg: &EncryptedMessage) -> Result<()> {
        let path = paths::message(&msg.conversation_id(), &msg.message_id);
        if !self
            .store()
            .compare_and_swap(&path, None, Some(serde_json::to_value(msg)?))
            .await?
        {
            return Err(TrustError::Conflict(path));
        }
        Ok(())
    }

    fn build(
        &self,
        sender_id: &str,
        destination: Destination,
        plaintext: &str,
        recipient: &PublicKey,
        oversight: &[PublicKey],
        ttl: Option<Duration>,
    ) -> Result<EncryptedMessage> {
        let now = self.clock.now();
        Ok(EncryptedMessage {
            message_id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_owned(),
            destination,
            sealed: MessageCipher.seal(plaintext, recipient, oversight)?,
            timestamp: now,
            expires_at: ttl.map(|t| now + t),
        })
    }

    /// Seal to the receiver plus every oversight reader and persist.
    pub async fn send_direct(
        &self,
        sender_id: &str,
        receiver_id: &str,
        plaintext: &str,
        ttl: Option<Duration>,
    ) -> Result<EncryptedMessage> {
        paths::check_id(sender_id)?;
        let recipient = self.public_key_of(receiver_id).await?;
        let oversight = self.roles.oversight_keys().await?;
        let msg = self.build(
            sender_id,
            Destination::Direct {
                receiver_id: receiver_id.to_owned(),
            },
            plaintext,
            &recipient,
            &oversight,
            ttl,
        )?;
        self.persist(&msg).await?;
        debug!(message_id = %msg.message_id, branches = 1 + msg.sealed.oversight.len(), "direct message stored");
        Ok(msg)
    }

    /// One copy per member, the sender's included. Oversight branches ride
    /// on the sender's copy only so readers see each message once. Members
    /// without a live key are skipped.
    pub async fn send_group(
        &self,
        sender_id: &str,
        group_id: &str,
        member_ids: &[String],
        plaintext: &str,
        ttl: Option<Duration>,
    ) -> Result<Vec<EncryptedMessage>> {
        paths::check_id(sender_id)?;
        paths::check_id(group_id)?;
        let oversight = self.roles.oversight_keys().await?;
        let mut members: Vec<&str> = vec![sender_id];
        let mut seen: HashSet<&str> = HashSet::from([sender_id]);
        for m in member_ids {
            if seen.insert(m.as_str()) {
                members.push(m.as_str());
            }
        }

        let mut sent = Vec::with_capacity(members.len());
        for member in members {
            let recipient = match self.public_key_of(member).await {
                Ok(pk) => pk,
                Err(TrustError::AccountDestroyed) | Err(TrustError::ProfileNotFound(_)) => {
                    warn!(group_id = %group_id, member = %member, "group member has no key; skipped");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let extra: &[PublicKey] = if member == sender_id { oversight.as_slice() } else { &[] };
            let msg = self.build(
                sender_id,
                Destination::Group {
                    group_id: group_id.to_owned(),
                    member_id: member.to_owned(),
                },
                plaintext,
                &recipient,
                extra,
                ttl,
            )?;
            self.persist(&msg).await?;
            sent.push(msg);
        }
        debug!(group_id = %group_id, copies = sent.len(), "group message stored");
        Ok(sent)
    }

    /// Decrypt every message of a conversation visible to `reader_id`: those
    /// it sent or is addressed to, plus any carrying a branch for its key.
    /// Results are in timestamp order; one bad message never fails the batch.
    pub async fn decrypt_conversation(
        &self,
        reader_id: &str,
        key: Option<&PrivateKey>,
        conversation_id: &str,
    ) -> Result<Vec<DecryptedMessage>> {
        let profile = self.profiles.get(reader_id).await?;
        if profile.is_destroyed() {
            return Err(TrustError::AccountDestroyed);
        }
        let now = self.clock.now();
        let key_id = key.map(|k| k.public_key().key_id());
        let mut out = Vec::new();
        for (path, raw) in self.store().list(&paths::conversation_prefix(conversation_id)).await? {
            let msg: EncryptedMessage = match serde_json::from_value(raw) {
                Ok(m) => m,
                Err(err) => {
                    warn!(path = %path, error = %err, "skipping malformed message");
                    continue;
                }
            };
            let addressed = key_id
                .as_deref()
                .is_some_and(|id| msg.sealed.branch_for(id).is_some());
            let visible = match &msg.destination {
                Destination::Direct { .. } => msg.involves(reader_id) || addressed,
                Destination::Group { member_id, .. } => member_id == reader_id || addressed,
            };
            if !visible {
                continue;
            }
            out.push(DecryptedMessage {
                body: open_message(&msg, key, now),
                message_id: msg.message_id,
                sender_id: msg.sender_id,
                timestamp: msg.timestamp,
            });
        }
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(out)
    }

    /// Remove messages whose `expiresAt` has passed, and anything involving
    /// a destroyed account that erasure did not reach.
    pub async fn sweep(&self, destroyed: &HashSet<String>) -> Result<usize> {
        let now = self.clock.now();
        let mut removed = 0;
        for (path, raw) in self.store().list(paths::MESSAGES).await? {
            let Ok(msg) = serde_json::from_value::<EncryptedMessage>(raw) else {
                continue;
            };
            let orphaned = destroyed.contains(&msg.sender_id)
                || destroyed.contains(msg.destination.addressee());
            if (msg.is_expired(now) || orphaned) && self.store().remove(&path).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "messages swept");
        }
        Ok(removed)
    }
}
