mod common;

use chrono::Duration;
use common::{Harness, PASSCODE};
use serde_json::json;
use wd_proto::{paths, Role};
use wd_store::RecordStore;
use wd_trust::{MessageBody, Session, TrustError, UnreadableReason};

async fn session(h: &Harness, user_id: &str) -> Session {
    h.core.login(user_id, "A").await.unwrap();
    h.core.unlock(user_id, "A", None).await.unwrap()
}

async fn with_users(h: &Harness, users: &[&str]) {
    for u in users {
        h.core.register_account(u, u).await.unwrap();
    }
}

#[tokio::test]
async fn oversight_reader_opens_direct_messages_independently() {
    let h = Harness::new();
    with_users(&h, &["alice", "bob", "carol", "auditor"]).await;
    h.core.grant_role("auditor", Role::Oversight, None).await.unwrap();

    let alice = session(&h, "alice").await;
    let msg = h.core.send_direct(&alice, "bob", "quarterly numbers", None).await.unwrap();
    assert_eq!(msg.sealed.oversight.len(), 1);
    let conversation = msg.conversation_id();

    let bob = session(&h, "bob").await;
    let read = h.core.read_conversation(&bob, &conversation).await.unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].body.text(), Some("quarterly numbers"));

    let auditor = session(&h, "auditor").await;
    let read = h.core.read_conversation(&auditor, &conversation).await.unwrap();
    assert_eq!(read[0].body.text(), Some("quarterly numbers"));

    let carol = session(&h, "carol").await;
    assert!(h.core.read_conversation(&carol, &conversation).await.unwrap().is_empty());

    // Sealed to the receiver only; the sender keeps no branch.
    let read = h.core.read_conversation(&alice, &conversation).await.unwrap();
    assert_eq!(read[0].body, MessageBody::Unreadable(UnreadableReason::NotAddressed));
}

#[tokio::test]
async fn batch_decrypt_degrades_per_message() {
    let h = Harness::new();
    with_users(&h, &["alice", "bob"]).await;
    let alice = session(&h, "alice").await;
    let bob = session(&h, "bob").await;

    let first = h.core.send_direct(&alice, "bob", "one", None).await.unwrap();
    let tampered = h.core.send_direct(&alice, "bob", "two", None).await.unwrap();
    let fleeting = h
        .core
        .send_direct(&alice, "bob", "three", Some(Duration::minutes(5)))
        .await
        .unwrap();
    h.core.send_direct(&alice, "bob", "four", None).await.unwrap();

    let path = paths::message(&tampered.conversation_id(), &tampered.message_id);
    let mut fields = serde_json::Map::new();
    fields.insert("encryptedText".into(), json!("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"));
    h.store.update(&path, fields).await.unwrap();
    h.clock.advance(Duration::minutes(5));

    let read = h.core.read_conversation(&bob, &first.conversation_id()).await.unwrap();
    assert_eq!(read.len(), 4);
    let body_of = |id: &str| read.iter().find(|m| m.message_id == id).unwrap().body.clone();
    assert_eq!(body_of(&first.message_id).text(), Some("one"));
    assert_eq!(
        body_of(&tampered.message_id),
        MessageBody::Unreadable(UnreadableReason::DecryptionFailed)
    );
    assert_eq!(
        body_of(&fleeting.message_id),
        MessageBody::Unreadable(UnreadableReason::Expired)
    );
    let readable: Vec<_> = read.iter().filter_map(|m| m.body.text()).collect();
    assert_eq!(readable.len(), 2);
    assert!(readable.contains(&"four"));

    let report = h.core.sweep().await.unwrap();
    assert_eq!(report.messages_removed, 1);
    assert_eq!(h.core.read_conversation(&bob, &first.conversation_id()).await.unwrap().len(), 3);
}

#[tokio::test]
async fn reading_without_a_local_key() {
    let h = Harness::new();
    with_users(&h, &["alice", "bob"]).await;
    let alice = session(&h, "alice").await;
    let msg = h.core.send_direct(&alice, "bob", "hi", None).await.unwrap();

    let read = h
        .core
        .messages()
        .decrypt_conversation("bob", None, &msg.conversation_id())
        .await
        .unwrap();
    assert_eq!(read[0].body, MessageBody::Unreadable(UnreadableReason::KeyMissing));
}

#[tokio::test]
async fn group_message_fans_out_per_member() {
    let h = Harness::new();
    with_users(&h, &["alice", "bob", "carol", "dave", "auditor"]).await;
    h.core.grant_role("auditor", Role::Oversight, None).await.unwrap();
    let alice = session(&h, "alice").await;

    let members = vec!["bob".to_owned(), "carol".to_owned(), "bob".to_owned()];
    let copies = h
        .core
        .send_group(&alice, "team", &members, "standup in 5", None)
        .await
        .unwrap();
    assert_eq!(copies.len(), 3);
    assert_eq!(copies.iter().filter(|m| !m.sealed.oversight.is_empty()).count(), 1);
    let conversation = copies[0].conversation_id();
    assert_eq!(conversation, "group:team");

    for user in ["alice", "bob", "carol", "auditor"] {
        let s = session(&h, user).await;
        let read = h.core.read_conversation(&s, &conversation).await.unwrap();
        assert_eq!(read.len(), 1, "{user} should see exactly one copy");
        assert_eq!(read[0].body.text(), Some("standup in 5"));
    }
    let dave = session(&h, "dave").await;
    assert!(h.core.read_conversation(&dave, &conversation).await.unwrap().is_empty());
}

#[tokio::test]
async fn session_from_a_replaced_device_cannot_send() {
    let h = Harness::new();
    h.admin("root").await;
    h.onboarded("alice").await;
    h.core.register_account("bob", "bob").await.unwrap();
    let stale = h.core.unlock("alice", "A", Some(PASSCODE)).await.unwrap();

    let phone = h.second_device();
    let wd_trust::DeviceAccess::Blocked { request } = phone.login("alice", "B").await.unwrap() else {
        panic!("expected B to be blocked");
    };
    h.core.approve_device(&request.request_id, "root").await.unwrap();

    assert!(matches!(
        h.core.send_direct(&stale, "bob", "hello", None).await,
        Err(TrustError::DeviceUnauthorized { request_id: None })
    ));
}

#[tokio::test]
async fn facade_cipher_round_trip_with_admin_branch() {
    let h = Harness::new();
    let bob = wd_trust::KeyVault::generate_key_pair();
    let admin = wd_trust::KeyVault::generate_key_pair();
    let outsider = wd_trust::KeyVault::generate_key_pair();

    let sealed = h
        .core
        .encrypt_message("for bob and admin", &bob.public, Some(&admin.public))
        .unwrap();
    assert_eq!(
        h.core.decrypt_message(&sealed, &bob.private).unwrap().as_str(),
        "for bob and admin"
    );
    assert_eq!(
        h.core.decrypt_message(&sealed, &admin.private).unwrap().as_str(),
        "for bob and admin"
    );
    assert!(matches!(
        h.core.decrypt_message(&sealed, &outsider.private),
        Err(TrustError::DecryptionFailed(_))
    ));
}

#[tokio::test]
async fn messages_to_unknown_users_are_refused() {
    let h = Harness::new();
    with_users(&h, &["alice"]).await;
    let alice = session(&h, "alice").await;
    assert!(matches!(
        h.core.send_direct(&alice, "nobody", "hello?", None).await,
        Err(TrustError::ProfileNotFound(_))
    ));
}
