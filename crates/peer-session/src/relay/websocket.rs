//! WebSocket relay client
//!
//! Registers with a PeerJS-compatible signaling server and routes OFFER,
//! ANSWER and CANDIDATE frames to the media calls of the connection. Frames
//! are handled by a single receiver task, so relay events keep server order.

use super::protocol::{CandidatePayload, MessageType, RelayMessage, SdpPayload, MEDIA_CONNECTION_TYPE};
use super::rtc::RtcCall;
use super::{
    CallLink, MediaCall, RelayConnection, RelayError, RelayErrorKind, RelayEvent, RelayLink,
    RelayTransport,
};
use crate::config::SessionConfig;
use crate::media::MediaStream;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

enum Outbound {
    Frame(RelayMessage),
    Close,
}

/// Outgoing frame queue of a relay connection
#[derive(Clone)]
pub(crate) struct RelaySink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl RelaySink {
    /// Queue a frame for the relay
    pub(crate) fn send(&self, msg: RelayMessage) -> Result<()> {
        self.tx
            .send(Outbound::Frame(msg))
            .map_err(|_| Error::WebSocketError("Relay connection closed".to_string()))
    }

    fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Relay transport over WebSocket
pub struct WebSocketRelay {
    config: Arc<SessionConfig>,
}

impl WebSocketRelay {
    /// Create a relay transport for `config`
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl RelayTransport for WebSocketRelay {
    async fn connect(&self, local_id: &str) -> Result<RelayLink> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let url = self.config.relay_url(local_id, &token)?;

        info!(peer_id = local_id, host = %self.config.relay_host, "Connecting to relay");

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        debug!(peer_id = local_id, "Relay socket established");

        let (write, read) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            local_id: local_id.to_string(),
            config: Arc::clone(&self.config),
            sink: RelaySink { tx: out_tx },
            events: events_tx,
            calls: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(sender_task(write, out_rx));
        let receiver = tokio::spawn(receiver_task(read, Arc::clone(&shared)));
        let heartbeat = tokio::spawn(heartbeat_task(
            shared.sink.clone(),
            Duration::from_millis(self.config.ping_interval_ms),
        ));

        Ok(RelayLink {
            connection: Arc::new(WebSocketConnection {
                shared,
                tasks: Mutex::new(vec![receiver, heartbeat]),
            }),
            events: events_rx,
        })
    }
}

struct Shared {
    local_id: String,
    config: Arc<SessionConfig>,
    sink: RelaySink,
    events: mpsc::UnboundedSender<RelayEvent>,
    calls: Mutex<HashMap<String, Arc<RtcCall>>>,
    closed: AtomicBool,
}

impl Shared {
    fn emit(&self, event: RelayEvent) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }

    fn emit_error(&self, kind: RelayErrorKind, msg: &RelayMessage, fallback: &str) {
        let message = msg.error_message().unwrap_or_else(|| fallback.to_string());
        self.emit(RelayEvent::Error(RelayError::new(kind, message)));
    }

    fn register(&self, call: Arc<RtcCall>) {
        let mut calls = self.calls.lock();
        calls.retain(|_, c| !c.is_closed());
        calls.insert(call.id().to_string(), call);
    }

    fn find(&self, connection_id: &str) -> Option<Arc<RtcCall>> {
        self.calls.lock().get(connection_id).cloned()
    }

    fn take_calls_from(&self, peer_id: &str) -> Vec<Arc<RtcCall>> {
        let mut calls = self.calls.lock();
        let ids: Vec<String> = calls
            .iter()
            .filter(|(_, c)| c.remote_id() == peer_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter_map(|id| calls.remove(id)).collect()
    }

    async fn handle_frame(&self, text: &str) -> Result<()> {
        let msg = RelayMessage::from_json(text)?;

        match &msg.kind {
            MessageType::Open => {
                info!(peer_id = %self.local_id, "Relay connection open");
                self.emit(RelayEvent::Open(self.local_id.clone()));
            }
            MessageType::Error => {
                self.emit_error(RelayErrorKind::ServerError, &msg, "Relay server error")
            }
            MessageType::IdTaken => self.emit_error(
                RelayErrorKind::UnavailableId,
                &msg,
                &format!("ID \"{}\" is taken", self.local_id),
            ),
            MessageType::InvalidKey => self.emit_error(
                RelayErrorKind::InvalidKey,
                &msg,
                &format!("API KEY \"{}\" is invalid", self.config.relay_key),
            ),
            MessageType::Offer => {
                let src = msg.src.clone().unwrap_or_default();
                let payload: SdpPayload = msg.payload_as()?;
                if payload.connection_type != MEDIA_CONNECTION_TYPE {
                    debug!(src = %src, kind = %payload.connection_type, "Ignoring non-media offer");
                    return Ok(());
                }
                let (call, link) = RtcCall::inbound(
                    &self.config,
                    self.sink.clone(),
                    &src,
                    &payload.connection_id,
                    payload.sdp.sdp,
                )
                .await?;
                self.register(call);
                self.emit(RelayEvent::Call(link));
            }
            MessageType::Answer => {
                let payload: SdpPayload = msg.payload_as()?;
                match self.find(&payload.connection_id) {
                    Some(call) => call.apply_answer(payload.sdp.sdp).await?,
                    None => warn!(connection_id = %payload.connection_id, "Answer for unknown call"),
                }
            }
            MessageType::Candidate => {
                let payload: CandidatePayload = msg.payload_as()?;
                match self.find(&payload.connection_id) {
                    Some(call) => call.add_remote_candidate(payload.candidate).await?,
                    None => debug!(connection_id = %payload.connection_id, "Candidate for unknown call"),
                }
            }
            MessageType::Leave => {
                let src = msg.src.clone().unwrap_or_default();
                info!(src = %src, "Remote peer left the relay");
                for call in self.take_calls_from(&src) {
                    call.close().await;
                }
            }
            MessageType::Expire => {
                let src = msg.src.clone().unwrap_or_default();
                self.emit(RelayEvent::Error(RelayError::new(
                    RelayErrorKind::PeerUnavailable,
                    format!("Could not connect to peer {}", src),
                )));
            }
            MessageType::Heartbeat => {}
            MessageType::Unknown(kind) => warn!(kind = %kind, "Unknown relay frame"),
        }
        Ok(())
    }
}

/// Sender task: writes queued frames to the socket
async fn sender_task(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        let msg = match outbound {
            Outbound::Frame(frame) => match frame.to_json() {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    warn!("Failed to encode relay frame: {}", e);
                    continue;
                }
            },
            Outbound::Close => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        };

        if let Err(e) = write.send(msg).await {
            error!("Failed to send relay frame: {}", e);
            break;
        }
    }

    debug!("Relay sender task terminated");
}

/// Receiver task: handles relay frames in order; reports a lost socket
async fn receiver_task(mut read: SplitStream<WsStream>, shared: Arc<Shared>) {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Err(e) = shared.handle_frame(&text).await {
                    warn!("Failed to handle relay frame: {}", e);
                }
            }
            Ok(Message::Close(_)) => {
                info!("Relay socket closed by server");
                break;
            }
            Err(e) => {
                warn!("Relay socket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Mark closed first so `call` fails once Disconnected is observed
    if !shared.closed.swap(true, Ordering::SeqCst) {
        let _ = shared.events.send(RelayEvent::Disconnected);
    }
    debug!("Relay receiver task terminated");
}

async fn heartbeat_task(sink: RelaySink, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if sink.send(RelayMessage::heartbeat()).is_err() {
            break;
        }
    }
}

/// Open relay connection
pub struct WebSocketConnection {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl RelayConnection for WebSocketConnection {
    async fn call(&self, remote_id: &str, stream: &MediaStream) -> Result<CallLink> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let (call, link) = RtcCall::outbound(
            &self.shared.config,
            self.shared.sink.clone(),
            remote_id,
            stream,
        )
        .await?;
        self.shared.register(call);
        Ok(link)
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let calls: Vec<_> = self.shared.calls.lock().drain().map(|(_, c)| c).collect();
        for call in calls {
            call.close().await;
        }
        self.shared.sink.close();
        info!(peer_id = %self.shared.local_id, "Relay connection closed");
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.shared.sink.close();
    }
}
