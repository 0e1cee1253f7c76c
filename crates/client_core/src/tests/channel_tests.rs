use std::time::Duration;

use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};

use super::*;
use crate::{
    test_support::{eventually, id, msg, FakeConnector},
    transport::TransportEvent,
};

async fn next_event(inbox: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(2), inbox.recv())
        .await
        .expect("event in time")
        .expect("inbox open")
}

async fn connected_manager(
    connector: &Arc<FakeConnector>,
) -> (ChannelManager, UnboundedReceiver<SessionEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut manager = ChannelManager::new(connector.clone(), tx);
    manager.ensure_connected(&id("me"), Some("token".to_string()));
    assert_eq!(manager.state(), ChannelState::Connecting);

    match next_event(&mut rx).await {
        SessionEvent::Connected { identity, result } => {
            assert!(manager.install(&identity, result));
        }
        _ => panic!("expected connect result"),
    }
    (manager, rx)
}

#[test]
fn room_interest_counts_peers_per_room() {
    let mut interest = RoomInterest::default();
    let room = id("me");

    assert!(interest.acquire(&room, &id("bob")));
    assert!(!interest.acquire(&room, &id("carol")));
    assert!(!interest.acquire(&room, &id("bob")));
    assert_eq!(interest.count(&room), 2);

    assert!(!interest.release(&room, &id("bob")));
    assert!(!interest.release(&room, &id("bob")));
    assert!(interest.release(&room, &id("carol")));
    assert_eq!(interest.count(&room), 0);
    assert!(!interest.release(&room, &id("carol")));
}

#[tokio::test]
async fn connects_once_per_identity() {
    let connector = FakeConnector::new();
    let (mut manager, _rx) = connected_manager(&connector).await;

    assert!(manager.is_ready_for(&id("me")));
    assert_eq!(manager.state(), ChannelState::Unconnected);

    manager.ensure_connected(&id("me"), None);
    assert_eq!(manager.state(), ChannelState::Unconnected);
    assert_eq!(connector.connect_count(), 1);
    assert_eq!(connector.credentials(), vec![Some("token".to_string())]);
}

#[tokio::test]
async fn join_emits_signal_once_and_switch_keeps_room() {
    let connector = FakeConnector::new();
    let (mut manager, _rx) = connected_manager(&connector).await;
    let connection = connector.last();

    manager.join(&id("bob"));
    assert_eq!(manager.state(), ChannelState::Joined);
    assert!(manager.has_listener());

    manager.switch(&id("bob"), &id("carol"));
    assert_eq!(manager.state(), ChannelState::Joined);
    assert_eq!(
        connection.signals(),
        vec![ClientSignal::JoinUserRoom(id("me"))]
    );

    manager.leave(&id("carol"));
    assert_eq!(manager.state(), ChannelState::Unconnected);
    assert!(!manager.has_listener());
    assert_eq!(
        connection.signals(),
        vec![
            ClientSignal::JoinUserRoom(id("me")),
            ClientSignal::LeaveUserRoom(id("me")),
        ]
    );
    assert!(connection.is_connected());
}

#[tokio::test]
async fn replacing_listener_keeps_a_single_subscriber() {
    let connector = FakeConnector::new();
    let (mut manager, mut rx) = connected_manager(&connector).await;
    let connection = connector.last();

    manager.join(&id("bob"));
    manager.switch(&id("bob"), &id("carol"));
    manager.switch(&id("carol"), &id("bob"));
    eventually(|| connection.listeners() == 1).await;

    connection.push(TransportEvent::Message(msg("m1", "bob", "me", "hi", 1)));
    match next_event(&mut rx).await {
        SessionEvent::Inbound { epoch, event } => {
            assert!(manager.is_current(epoch));
            assert!(matches!(event, TransportEvent::Message(_)));
        }
        _ => panic!("expected inbound event"),
    }
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn teardown_leaves_room_or_closes_connection() {
    let connector = FakeConnector::new();
    let (mut manager, _rx) = connected_manager(&connector).await;
    let connection = connector.last();

    manager.join(&id("bob"));
    manager.teardown(Some(&id("bob")));
    assert!(manager.has_connection());
    assert!(connection.is_connected());

    manager.teardown(None);
    assert!(!manager.has_connection());
    assert!(!connection.is_connected());
    assert_eq!(manager.state(), ChannelState::Unconnected);
}

#[tokio::test]
async fn connect_failure_sets_error_flag() {
    let connector = FakeConnector::new();
    connector.fail_with("connection refused");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut manager = ChannelManager::new(connector.clone(), tx);

    manager.ensure_connected(&id("me"), None);
    match next_event(&mut rx).await {
        SessionEvent::Connected { identity, result } => {
            assert!(!manager.install(&identity, result));
        }
        _ => panic!("expected connect result"),
    }

    assert_eq!(manager.state(), ChannelState::Error);
    assert_eq!(manager.connection_error(), Some("connection refused"));
    assert!(!manager.has_connection());
}

#[tokio::test]
async fn late_connect_for_replaced_identity_is_disconnected() {
    let connector = FakeConnector::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut manager = ChannelManager::new(connector.clone(), tx);

    manager.ensure_connected(&id("me"), None);
    manager.close();
    let SessionEvent::Connected { identity, result } = next_event(&mut rx).await else {
        panic!("expected connect result");
    };

    assert!(!manager.install(&identity, result));
    assert!(!manager.has_connection());
    assert!(!connector.last().is_connected());
}

#[tokio::test]
async fn dead_connection_is_not_reused() {
    let connector = FakeConnector::new();
    let (mut manager, _rx) = connected_manager(&connector).await;
    let first = connector.last();

    first.drop_link();
    assert!(!manager.is_ready_for(&id("me")));

    manager.ensure_connected(&id("me"), None);
    assert_eq!(manager.state(), ChannelState::Connecting);
    eventually(|| connector.connect_count() == 2).await;
}

#[tokio::test]
async fn identity_change_closes_previous_connection() {
    let connector = FakeConnector::new();
    let (mut manager, _rx) = connected_manager(&connector).await;
    let first = connector.last();

    manager.ensure_connected(&id("someone-else"), None);

    assert!(!first.is_connected());
    assert!(!manager.is_ready_for(&id("me")));
    assert_eq!(manager.state(), ChannelState::Connecting);
}
