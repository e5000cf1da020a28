mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{Harness, PASSCODE, WRONG};
use wd_proto::{DeviceClaim, IdentityCheck, RequestStatus};
use wd_trust::{AdminAlert, DeviceAccess, TrustError};

fn blocked(access: DeviceAccess) -> wd_proto::DeviceRequest {
    match access {
        DeviceAccess::Blocked { request } => request,
        other => panic!("expected Blocked, got {other:?}"),
    }
}

#[tokio::test]
async fn first_login_claims_then_same_device_is_granted() {
    let h = Harness::new();
    h.core.register_account("alice", "alice").await.unwrap();
    assert_eq!(
        h.core.login("alice", "A").await.unwrap(),
        DeviceAccess::Granted { claimed: true }
    );
    assert_eq!(
        h.core.login("alice", "A").await.unwrap(),
        DeviceAccess::Granted { claimed: false }
    );
    assert_eq!(h.core.profile("alice").await.unwrap().authorized_device(), Some("A"));
}

#[tokio::test]
async fn device_switch_scenario() {
    let mut h = Harness::new();
    h.admin("root").await;
    h.onboarded("alice").await;

    let request = blocked(h.core.login("alice", "B").await.unwrap());
    assert_eq!(request.new_device_id, "B");
    assert!(request.is_pending());
    let pending = h.core.pending_device_requests().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(h.drain_alerts().iter().any(
        |a| matches!(a, AdminAlert::DeviceAccessRequested { new_device_id, .. } if new_device_id == "B")
    ));

    let approved = h.core.approve_device(&request.request_id, "root").await.unwrap();
    assert!(matches!(approved.status, RequestStatus::Approved { ref decided_by, .. } if decided_by == "root"));
    assert_eq!(h.core.profile("alice").await.unwrap().authorized_device(), Some("B"));

    assert_eq!(
        h.core.login("alice", "B").await.unwrap(),
        DeviceAccess::Granted { claimed: false }
    );
    let back_on_a = blocked(h.core.login("alice", "A").await.unwrap());
    assert_eq!(back_on_a.new_device_id, "A");
    assert!(h.core.pending_device_requests().await.unwrap().iter().all(|r| r.new_device_id == "A"));
}

#[tokio::test]
async fn resolved_request_stays_terminal() {
    let h = Harness::new();
    h.admin("root").await;
    h.onboarded("alice").await;
    let request = blocked(h.core.login("alice", "B").await.unwrap());

    h.core
        .deny_device(&request.request_id, "root", Some("unrecognised".into()))
        .await
        .unwrap();
    assert!(matches!(
        h.core.approve_device(&request.request_id, "root").await,
        Err(TrustError::RequestAlreadyResolved("denied"))
    ));
    assert_eq!(h.core.profile("alice").await.unwrap().authorized_device(), Some("A"));

    // A later attempt files a fresh request.
    let again = blocked(h.core.login("alice", "B").await.unwrap());
    assert_ne!(again.request_id, request.request_id);
}

#[tokio::test]
async fn repeated_logins_from_one_device_share_a_request() {
    let h = Harness::new();
    h.onboarded("alice").await;
    let first = blocked(h.core.login("alice", "B").await.unwrap());
    let second = blocked(h.core.login("alice", "B").await.unwrap());
    assert_eq!(first.request_id, second.request_id);
    assert_eq!(h.core.pending_device_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn two_new_devices_get_independent_requests() {
    let h = Harness::new();
    h.admin("root").await;
    h.onboarded("alice").await;
    let from_b = blocked(h.core.login("alice", "B").await.unwrap());
    let from_c = blocked(h.core.login("alice", "C").await.unwrap());
    assert_ne!(from_b.request_id, from_c.request_id);

    h.core.approve_device(&from_c.request_id, "root").await.unwrap();
    assert!(h.core.devices().get_request(&from_b.request_id).await.unwrap().is_pending());
    h.core.deny_device(&from_b.request_id, "root", None).await.unwrap();

    assert_eq!(h.core.profile("alice").await.unwrap().authorized_device(), Some("C"));
}

#[tokio::test]
async fn only_admins_resolve_requests() {
    let h = Harness::new();
    h.onboarded("alice").await;
    h.core.register_account("mallory", "mallory").await.unwrap();
    let request = blocked(h.core.login("alice", "B").await.unwrap());
    assert!(matches!(
        h.core.approve_device(&request.request_id, "mallory").await,
        Err(TrustError::NotAuthorized(_))
    ));
    assert!(matches!(
        h.core.deny_device(&request.request_id, "alice", None).await,
        Err(TrustError::NotAuthorized(_))
    ));
    assert!(h.core.devices().get_request(&request.request_id).await.unwrap().is_pending());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_devices_cannot_both_claim() {
    let h = Harness::new();
    h.core.register_account("alice", "alice").await.unwrap();
    let core = Arc::new(h.core);

    let mut handles = Vec::new();
    for device in ["P", "Q", "R", "S"] {
        let core = core.clone();
        handles.push(tokio::spawn(async move { (device, core.login("alice", device).await.unwrap()) }));
    }
    let mut winners = Vec::new();
    for handle in handles {
        let (device, access) = handle.await.unwrap();
        if access == (DeviceAccess::Granted { claimed: true }) {
            winners.push(device);
        }
    }
    assert_eq!(winners.len(), 1);
    let profile = core.profile("alice").await.unwrap();
    assert!(matches!(profile.device, DeviceClaim::Claimed { ref device_id, .. } if device_id == winners[0]));
    assert_eq!(core.pending_device_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn stale_requests_expire() {
    let h = Harness::new();
    h.admin("root").await;
    h.onboarded("alice").await;
    let request = blocked(h.core.login("alice", "B").await.unwrap());

    h.clock.advance(Duration::hours(72));
    assert!(h.core.pending_device_requests().await.unwrap().is_empty());
    assert!(matches!(
        h.core.approve_device(&request.request_id, "root").await,
        Err(TrustError::RequestAlreadyResolved("expired"))
    ));
    assert_eq!(h.core.profile("alice").await.unwrap().authorized_device(), Some("A"));

    let fresh = blocked(h.core.login("alice", "B").await.unwrap());
    assert_ne!(fresh.request_id, request.request_id);
    h.clock.advance(Duration::hours(73));
    assert_eq!(h.core.sweep().await.unwrap().requests_expired, 1);
    assert!(matches!(
        h.core.devices().get_request(&fresh.request_id).await.unwrap().status,
        RequestStatus::Expired { .. }
    ));
}

#[tokio::test]
async fn blocked_device_is_told_of_the_decision() {
    let h = Harness::new();
    h.admin("root").await;
    h.onboarded("alice").await;
    let request = blocked(h.core.login("alice", "B").await.unwrap());
    let core = Arc::new(h.core);

    let waiter = {
        let core = core.clone();
        let id = request.request_id.clone();
        tokio::spawn(async move { core.await_device_decision(&id).await })
    };
    tokio::task::yield_now().await;
    core.approve_device(&request.request_id, "root").await.unwrap();

    let decided = waiter.await.unwrap().unwrap();
    assert_eq!(decided.status.label(), "approved");
}

#[tokio::test]
async fn identity_attestation_records_only_the_verdict() {
    let h = Harness::new();
    h.onboarded("alice").await;
    let request = blocked(h.core.login("alice", "B").await.unwrap());

    let check = h.core.attest_identity(&request.request_id, WRONG).await.unwrap();
    assert!(matches!(check, IdentityCheck::Rejected { .. }));
    assert_eq!(h.core.passcode_status("alice").await.unwrap().total_failed_attempts, 1);

    let check = h.core.attest_identity(&request.request_id, PASSCODE).await.unwrap();
    assert!(matches!(check, IdentityCheck::Verified { .. }));

    let raw = h
        .store
        .as_ref()
        .snapshot()
        .get(&wd_proto::paths::device_request(&request.request_id))
        .cloned()
        .unwrap();
    let text = raw.to_string();
    assert!(!text.contains(PASSCODE));
    assert!(!text.contains(WRONG));
    assert_eq!(raw["identityCheck"]["result"], "verified");
}

#[tokio::test]
async fn unlock_from_unauthorized_device_points_at_the_request() {
    let h = Harness::new();
    h.onboarded("alice").await;
    let err = h.core.unlock("alice", "B", Some(PASSCODE)).await.unwrap_err();
    let TrustError::DeviceUnauthorized { request_id: Some(id) } = err else {
        panic!("expected DeviceUnauthorized, got {err:?}");
    };
    assert!(h.core.devices().get_request(&id).await.unwrap().is_pending());
}

#[tokio::test]
async fn approval_interrupted_before_the_move_completes_on_retry() {
    let h = Harness::new();
    h.admin("root").await;
    h.onboarded("alice").await;
    let request = blocked(h.core.login("alice", "B").await.unwrap());
    h.clock.advance(Duration::minutes(1));

    h.backend.fail_field_swaps(1);
    assert!(matches!(
        h.core.approve_device(&request.request_id, "root").await,
        Err(TrustError::Store(_))
    ));
    // Decided but not yet moved.
    assert_eq!(h.core.devices().get_request(&request.request_id).await.unwrap().status.label(), "approved");
    assert_eq!(h.core.profile("alice").await.unwrap().authorized_device(), Some("A"));

    let finished = h.core.approve_device(&request.request_id, "root").await.unwrap();
    assert_eq!(finished.request_id, request.request_id);
    assert_eq!(h.core.profile("alice").await.unwrap().authorized_device(), Some("B"));
    assert_eq!(
        h.core.login("alice", "B").await.unwrap(),
        DeviceAccess::Granted { claimed: false }
    );

    // Approving again is a no-op.
    h.core.approve_device(&request.request_id, "root").await.unwrap();
    assert_eq!(h.core.profile("alice").await.unwrap().authorized_device(), Some("B"));
}

#[tokio::test]
async fn stale_approval_does_not_undo_a_later_one() {
    let h = Harness::new();
    h.admin("root").await;
    h.onboarded("alice").await;
    let from_b = blocked(h.core.login("alice", "B").await.unwrap());
    let from_c = blocked(h.core.login("alice", "C").await.unwrap());

    h.core.approve_device(&from_b.request_id, "root").await.unwrap();
    h.clock.advance(Duration::minutes(1));
    h.core.approve_device(&from_c.request_id, "root").await.unwrap();

    assert!(matches!(
        h.core.approve_device(&from_b.request_id, "root").await,
        Err(TrustError::RequestAlreadyResolved("approved"))
    ));
    assert_eq!(h.core.profile("alice").await.unwrap().authorized_device(), Some("C"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_logins_from_one_device_file_one_request() {
    let h = Harness::with_slow_reads(std::time::Duration::from_millis(10));
    h.onboarded("alice").await;
    let core = Arc::new(h.core);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let core = core.clone();
        handles.push(tokio::spawn(async move { core.login("alice", "B").await.unwrap() }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(blocked(handle.await.unwrap()).request_id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let pending = core.pending_device_requests().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request_id, ids[0]);
}

#[tokio::test]
async fn role_edits_give_up_under_endless_contention() {
    let h = Harness::new();
    h.core.register_account("root", "root").await.unwrap();
    h.backend.contend(wd_proto::paths::ROLES);
    assert!(matches!(
        h.core.grant_role("root", wd_proto::Role::Admin, None).await,
        Err(TrustError::Conflict(_))
    ));
    assert!(h.core.roles().roles_of("root").await.unwrap().is_empty());
}
