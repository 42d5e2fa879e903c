//! Relay reconnection schedule tests
//!
//! Time is paused, so every backoff delay is observed exactly.

mod harness;

use harness::{next_event, wait_for_connection, wait_for_event, Harness, MockCallOptions};
use peer_session::relay::RelayErrorKind;
use peer_session::{ConnectionStatus, SessionEvent};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_until_exhausted() {
    let h = Harness::new();
    let mut events = h.events.subscribe();

    h.session.initialize("room-1").await.unwrap();
    assert_eq!(h.session.connection_status(), ConnectionStatus::Connected);
    assert_eq!(h.relay.connect_count(), 1);

    h.relay.fail_all_connects();
    let started = tokio::time::Instant::now();
    h.relay.last_connection().drop_connection();

    let mut delays = Vec::new();
    let failure = loop {
        match next_event(&mut events).await {
            SessionEvent::Reconnecting { attempt, delay } => {
                assert_eq!(attempt as usize, delays.len() + 1);
                delays.push(delay.as_millis() as u64);
            }
            SessionEvent::ConnectivityError(message) => break message,
            _ => {}
        }
    };

    assert_eq!(delays, vec![2000, 4000, 8000, 10000, 10000]);
    assert!(failure.contains("5 reconnect attempts"));
    assert!(started.elapsed() >= Duration::from_millis(34_000));
    assert_eq!(h.session.connection_status(), ConnectionStatus::Failed);
    assert_eq!(h.session.reconnect_attempts(), 5);
    assert_eq!(h.relay.connect_count(), 6);
    assert!(!h.session.has_pending_reconnect());

    // Nothing else is scheduled once the schedule is exhausted
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.relay.connect_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_successful_reconnect_resets_attempts() {
    let h = Harness::new();
    let mut events = h.events.subscribe();
    h.session.initialize("room-1").await.unwrap();

    h.relay.fail_next_connects(2);
    h.relay.last_connection().drop_connection();

    wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::Reconnecting { attempt: 3, .. })
    })
    .await;
    wait_for_connection(&h.session, ConnectionStatus::Connected).await;

    assert_eq!(h.session.reconnect_attempts(), 0);
    assert_eq!(h.relay.connect_count(), 4);
    assert!(!h.session.has_pending_reconnect());

    // A later loss starts again from the first delay
    let mut events = h.events.subscribe();
    h.relay.last_connection().drop_connection();
    let event = wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::Reconnecting { .. })
    })
    .await;
    assert!(matches!(
        event,
        SessionEvent::Reconnecting { attempt: 1, delay } if delay == Duration::from_millis(2000)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let h = Harness::new();
    let mut events = h.events.subscribe();
    h.session.initialize("room-1").await.unwrap();

    h.relay.last_connection().drop_connection();
    wait_for_event(&mut events, |e| matches!(e, SessionEvent::Reconnecting { .. })).await;
    assert!(h.session.has_pending_reconnect());
    assert_eq!(h.session.connection_status(), ConnectionStatus::Reconnecting);

    h.session.disconnect().await;
    assert!(!h.session.has_pending_reconnect());
    assert_eq!(h.session.reconnect_attempts(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.relay.connect_count(), 1);
    assert_eq!(h.session.connection_status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_fails_without_retry() {
    let h = Harness::new();
    let mut events = h.events.subscribe();
    h.session.initialize("room-1").await.unwrap();

    let connection = h.relay.last_connection();
    connection.error(RelayErrorKind::UnavailableId, "ID \"room-1\" is taken");

    let event = wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::ConnectivityError(_))
    })
    .await;
    assert!(matches!(event, SessionEvent::ConnectivityError(m) if m.contains("is taken")));
    assert_eq!(h.session.connection_status(), ConnectionStatus::Failed);
    assert!(connection.is_closed());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.relay.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_server_error_is_retried() {
    let h = Harness::new();
    let mut events = h.events.subscribe();
    h.session.initialize("room-1").await.unwrap();

    h.relay
        .last_connection()
        .error(RelayErrorKind::ServerError, "Could not get an ID from the server");

    let event = wait_for_event(&mut events, |e| matches!(e, SessionEvent::Reconnecting { .. })).await;
    assert!(matches!(event, SessionEvent::Reconnecting { attempt: 1, .. }));

    wait_for_connection(&h.session, ConnectionStatus::Connected).await;
    assert_eq!(h.relay.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_peer_unavailable_is_a_call_error() {
    let h = Harness::new();
    let mut events = h.events.subscribe();
    h.session.initialize("guest-1").await.unwrap();

    h.relay
        .last_connection()
        .error(RelayErrorKind::PeerUnavailable, "Could not connect to peer room-9");

    let event = wait_for_event(&mut events, |e| matches!(e, SessionEvent::CallError(_))).await;
    assert!(matches!(event, SessionEvent::CallError(m) if m.contains("room-9")));
    assert_eq!(h.session.connection_status(), ConnectionStatus::Connected);
    assert!(!h.session.has_pending_reconnect());
}

#[tokio::test(start_paused = true)]
async fn test_other_relay_errors_are_republished() {
    let h = Harness::new();
    let mut events = h.events.subscribe();
    h.session.initialize("room-1").await.unwrap();

    h.relay
        .last_connection()
        .error(RelayErrorKind::SocketError, "Error from socket");

    let event = wait_for_event(&mut events, |e| matches!(e, SessionEvent::RelayError(_))).await;
    assert!(matches!(event, SessionEvent::RelayError(m) if m.contains("socket-error")));
    assert_eq!(h.session.connection_status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_events_from_replaced_link_are_ignored() {
    let h = Harness::new();
    let mut events = h.events.subscribe();
    h.session.initialize("room-1").await.unwrap();

    let stale = h.relay.last_connection();
    stale.drop_connection();
    wait_for_connection(&h.session, ConnectionStatus::Reconnecting).await;
    wait_for_connection(&h.session, ConnectionStatus::Connected).await;
    assert_eq!(h.relay.connect_count(), 2);

    let _ = harness::drain_events(&mut events);
    stale.error(RelayErrorKind::InvalidKey, "API KEY is invalid");
    harness::settle().await;

    assert_eq!(h.session.connection_status(), ConnectionStatus::Connected);
    assert!(harness::drain_events(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_initialize_while_reconnecting_closes_call() {
    let h = Harness::new();
    let mut events = h.events.subscribe();
    h.session.initialize("room-1").await.unwrap();

    let call = h
        .relay
        .last_connection()
        .incoming_call("guest-1", MockCallOptions::default());
    wait_for_event(&mut events, |e| matches!(e, SessionEvent::RemoteStreamAvailable(_))).await;

    h.relay.last_connection().drop_connection();
    wait_for_connection(&h.session, ConnectionStatus::Reconnecting).await;
    assert!(h.session.has_active_call());
    assert!(!call.is_closed());

    h.session.initialize("room-1").await.unwrap();
    assert!(call.is_closed());
    assert!(!h.session.has_active_call());
    assert!(!h.session.has_pending_reconnect());
    assert_eq!(h.session.connection_status(), ConnectionStatus::Connected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.relay.connect_count(), 2);
}
