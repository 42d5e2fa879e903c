//! WebSocket relay client against a local relay server

use futures::{SinkExt, StreamExt};
use peer_session::media::MediaConstraints;
use peer_session::relay::{RelayErrorKind, RelayEvent, RelayLink, RelayTransport};
use peer_session::{Error, MediaBackend, SessionConfig, SyntheticBackend, WebSocketRelay};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const WAIT: Duration = Duration::from_secs(10);

/// Accepted relay socket plus the request URI the client used
struct ServerSide {
    uri: String,
    ws: WebSocketStream<TcpStream>,
}

async fn start_relay() -> (SessionConfig, oneshot::Receiver<ServerSide>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (uri_tx, uri_rx) = oneshot::channel();
        let record_uri = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let _ = uri_tx.send(req.uri().to_string());
            Ok(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, record_uri)
            .await
            .unwrap();
        let uri = uri_rx.await.unwrap();
        let _ = tx.send(ServerSide { uri, ws });
    });

    let mut config = SessionConfig::default().with_relay("127.0.0.1", port, false);
    config.ping_interval_ms = 100;
    (config, rx)
}

async fn connect(peer_id: &str) -> (RelayLink, oneshot::Receiver<ServerSide>) {
    let (config, server) = start_relay().await;
    let link = WebSocketRelay::new(config).connect(peer_id).await.unwrap();
    (link, server)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<RelayEvent>) -> RelayEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for relay event")
        .expect("relay event channel closed")
}

async fn send(ws: &mut WebSocketStream<TcpStream>, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next client frame of `kind`, skipping everything else
async fn next_frame(ws: &mut WebSocketStream<TcpStream>, kind: &str) -> Value {
    tokio::time::timeout(WAIT, async {
        while let Some(msg) = ws.next().await {
            if let Ok(Message::Text(text)) = msg {
                let frame: Value = serde_json::from_str(&text).unwrap();
                if frame["type"] == kind {
                    return frame;
                }
            }
        }
        panic!("relay socket closed before a {} frame", kind);
    })
    .await
    .expect("timed out waiting for client frame")
}

#[tokio::test]
async fn test_open_confirms_registration() {
    let (mut link, server) = connect("room-1").await;
    let mut server = server.await.unwrap();

    assert!(server.uri.starts_with("/peerjs?"));
    assert!(server.uri.contains("key=peerjs"));
    assert!(server.uri.contains("id=room-1"));
    assert!(server.uri.contains("token="));

    send(&mut server.ws, json!({"type": "OPEN"})).await;
    assert!(matches!(next_event(&mut link.events).await, RelayEvent::Open(id) if id == "room-1"));
}

#[tokio::test]
async fn test_id_taken_is_unavailable_id() {
    let (mut link, server) = connect("room-1").await;
    let mut server = server.await.unwrap();

    send(
        &mut server.ws,
        json!({"type": "ID-TAKEN", "payload": {"msg": "ID is taken"}}),
    )
    .await;

    match next_event(&mut link.events).await {
        RelayEvent::Error(e) => {
            assert_eq!(e.kind, RelayErrorKind::UnavailableId);
            assert_eq!(e.message, "ID is taken");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_expire_is_peer_unavailable() {
    let (mut link, server) = connect("guest-1").await;
    let mut server = server.await.unwrap();

    send(&mut server.ws, json!({"type": "OPEN"})).await;
    send(&mut server.ws, json!({"type": "EXPIRE", "src": "room-1"})).await;

    assert!(matches!(next_event(&mut link.events).await, RelayEvent::Open(_)));
    match next_event(&mut link.events).await {
        RelayEvent::Error(e) => {
            assert_eq!(e.kind, RelayErrorKind::PeerUnavailable);
            assert!(e.message.contains("room-1"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_heartbeat_is_sent() {
    let (_link, server) = connect("room-1").await;
    let mut server = server.await.unwrap();

    let frame = next_frame(&mut server.ws, "HEARTBEAT").await;
    assert!(frame.get("dst").is_none());
}

#[tokio::test]
async fn test_server_close_reports_disconnect() {
    let (mut link, server) = connect("room-1").await;
    let mut server = server.await.unwrap();

    send(&mut server.ws, json!({"type": "OPEN"})).await;
    assert!(matches!(next_event(&mut link.events).await, RelayEvent::Open(_)));

    server.ws.close(None).await.unwrap();
    assert!(matches!(next_event(&mut link.events).await, RelayEvent::Disconnected));

    let stream = SyntheticBackend::default()
        .get_user_media(&MediaConstraints::default_devices())
        .await
        .unwrap();
    let err = link.connection.call("room-2", &stream).await.err().unwrap();
    assert!(matches!(err, Error::NotConnected));
}

#[tokio::test]
async fn test_outbound_call_sends_offer() {
    let (mut link, server) = connect("guest-1").await;
    let mut server = server.await.unwrap();

    send(&mut server.ws, json!({"type": "OPEN"})).await;
    assert!(matches!(next_event(&mut link.events).await, RelayEvent::Open(_)));

    let stream = SyntheticBackend::default()
        .get_user_media(&MediaConstraints::default_devices())
        .await
        .unwrap();
    let call = link.connection.call("room-1", &stream).await.unwrap();
    assert_eq!(call.call.remote_id(), "room-1");
    assert_eq!(
        call.call.outbound_video_track_id().as_deref(),
        stream.video_track().map(|t| t.id())
    );

    let offer = next_frame(&mut server.ws, "OFFER").await;
    assert_eq!(offer["dst"], "room-1");
    assert_eq!(offer["payload"]["type"], "media");
    assert_eq!(offer["payload"]["connectionId"], call.call.id());
    assert!(call.call.id().starts_with("mc_"));
    assert_eq!(offer["payload"]["sdp"]["type"], "offer");

    let sdp = offer["payload"]["sdp"]["sdp"].as_str().unwrap();
    assert!(sdp.contains("m=audio"));
    assert!(sdp.contains("m=video"));

    link.connection.close().await;
}
