//! Record-store layout.
//!
//! ```text
//! users/{user_id}/security              UserSecurityProfile
//! users/{user_id}/chats/{chat_id}       chat metadata (owned by the app)
//! users/{user_id}/pending/{device_id}   id of the open request from that device
//! device_requests/{request_id}          DeviceRequest
//! messages/{conversation_id}/{msg_id}   EncryptedMessage
//! roles/{user_id}                       RoleGrant
//! ```

use crate::ProtoError;

pub const USERS: &str = "users/";
pub const DEVICE_REQUESTS: &str = "device_requests/";
pub const MESSAGES: &str = "messages/";
pub const ROLES: &str = "roles/";

pub fn check_id(id: &str) -> Result<&str, ProtoError> {
    if id.is_empty() || id.contains('/') {
        return Err(ProtoError::InvalidId(id.to_owned()));
    }
    Ok(id)
}

pub fn profile(user_id: &str) -> String {
    format!("{USERS}{user_id}/security")
}

pub fn chats_prefix(user_id: &str) -> String {
    format!("{USERS}{user_id}/chats/")
}

pub fn pending_device(user_id: &str, device_id: &str) -> String {
    format!("{USERS}{user_id}/pending/{device_id}")
}

pub fn device_request(request_id: &str) -> String {
    format!("{DEVICE_REQUESTS}{request_id}")
}

pub fn conversation_prefix(conversation_id: &str) -> String {
    format!("{MESSAGES}{conversation_id}/")
}

pub fn message(conversation_id: &str, message_id: &str) -> String {
    format!("{MESSAGES}{conversation_id}/{message_id}")
}

pub fn role(user_id: &str) -> String {
    format!("{ROLES}{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_with_separators_are_rejected() {
        assert!(check_id("alice").is_ok());
        assert!(check_id("").is_err());
        assert_eq!(
            check_id("../admin"),
            Err(ProtoError::InvalidId("../admin".into()))
        );
    }

    #[test]
    fn chats_live_under_the_user() {
        assert!(chats_prefix("u1").starts_with(USERS));
        assert!(profile("u1").starts_with("users/u1/"));
        assert!(!profile("u1").starts_with(&chats_prefix("u1")));
    }
}
