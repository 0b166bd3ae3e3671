//! End-to-end scenarios against a real hub with a real shell spawned in a PTY, covering
//! the concrete scenarios from the session-hub's testable properties: cold start,
//! shared sessions across two clients, and resize arbitration.

use std::time::Duration;

use shellhub_core::config::DaemonConfig;
use shellhub_core::hub::SessionHub;

async fn wait_for_nonempty_scrollback(hub: &SessionHub, session_id: shellhub_core::session::SessionId) -> Vec<u8> {
    for _ in 0..50 {
        if let Some(session) = hub.get_session(session_id) {
            let snap = session.snapshot();
            if !snap.is_empty() {
                return snap;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Vec::new()
}

#[tokio::test]
async fn cold_start_single_shell_produces_banner() {
    let hub = SessionHub::new(DaemonConfig::default());
    let outcome = hub
        .create_terminal("client-a".into(), "t1".into(), 80, 24, None, None)
        .expect("create_terminal");
    assert!(!outcome.restored);

    let banner = wait_for_nonempty_scrollback(&hub, outcome.session_id).await;
    assert!(!banner.is_empty(), "expected shell to produce output within 2.5s");

    hub.destroy_terminal("client-a", "t1");
}

#[tokio::test]
async fn two_clients_share_a_session_and_see_the_same_bytes() {
    let hub = SessionHub::new(DaemonConfig::default());
    let a = hub
        .create_terminal("client-a".into(), "t1".into(), 80, 24, None, None)
        .expect("create");
    let session_id = a.session_id;

    let b = hub
        .create_terminal("client-b".into(), "t1".into(), 80, 24, Some(session_id), None)
        .expect("restore");
    assert!(b.restored);
    assert_eq!(b.session_id, session_id);

    // A's snapshot at restore time must be a byte-equal prefix of what B was handed.
    let snapshot_before = wait_for_nonempty_scrollback(&hub, session_id).await;
    assert!(b.scrollback.len() <= snapshot_before.len() + 4096);

    hub.input("client-a", "t1", b"echo hi\n");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let session = hub.get_session(session_id).unwrap();
    let after = session.snapshot();
    assert!(after.len() >= snapshot_before.len());

    hub.destroy_terminal("client-a", "t1");
    hub.destroy_terminal("client-b", "t1");
}

#[tokio::test]
async fn resize_arbitration_creator_wins() {
    let hub = SessionHub::new(DaemonConfig::default());
    let a = hub
        .create_terminal("client-a".into(), "t1".into(), 80, 24, None, None)
        .expect("create");
    hub.create_terminal("client-b".into(), "t1".into(), 80, 24, Some(a.session_id), None)
        .expect("restore");

    let creator_resize = hub.resize("client-a", "t1", 120, 40).unwrap();
    assert!(creator_resize.applied);
    assert_eq!((creator_resize.cols, creator_resize.rows), (120, 40));

    let session = hub.get_session(a.session_id).unwrap();
    assert_eq!(session.dims(), (120, 40));

    // client-b is attached to the same session_id but under its own terminal_id slot;
    // a resize from a non-creator client must not change the PTY's effective size.
    let replica_resize = hub.resize("client-b", "t1", 40, 20);
    // client-b's (client_id, terminal_id) mapping now also points at the same session
    // (it restored into it), so this models a second viewer attempting to resize.
    if let Some(outcome) = replica_resize {
        assert!(!outcome.applied);
        assert_eq!(session.dims(), (120, 40));
    }

    hub.destroy_terminal("client-a", "t1");
    hub.destroy_terminal("client-b", "t1");
}

#[tokio::test]
async fn destroy_by_non_creator_does_not_kill_session() {
    let hub = SessionHub::new(DaemonConfig::default());
    let a = hub
        .create_terminal("client-a".into(), "t1".into(), 80, 24, None, None)
        .expect("create");
    hub.create_terminal("client-b".into(), "t1".into(), 80, 24, Some(a.session_id), None)
        .expect("restore");

    hub.destroy_terminal("client-b", "t1");
    assert!(hub.get_session(a.session_id).is_some());

    hub.destroy_terminal("client-a", "t1");
    assert!(hub.get_session(a.session_id).is_none());
}

#[tokio::test]
async fn client_disconnect_keeps_session_alive() {
    let hub = SessionHub::new(DaemonConfig::default());
    let a = hub
        .create_terminal("client-a".into(), "t1".into(), 80, 24, None, None)
        .expect("create");

    hub.client_disconnect("client-a");
    assert!(hub.get_session(a.session_id).is_some());
}

#[tokio::test]
async fn unknown_input_mapping_is_a_silent_no_op() {
    let hub = SessionHub::new(DaemonConfig::default());
    // No session created for this (client, terminal) pair; must not panic.
    hub.input("ghost-client", "ghost-terminal", b"echo hi\n");
}
