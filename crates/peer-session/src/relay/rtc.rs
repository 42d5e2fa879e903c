//! Media calls over WebRTC
//!
//! One `RTCPeerConnection` per call. Local tracks are fed into
//! `TrackLocalStaticSample`s by pump tasks; a device switch swaps the video
//! track on the existing `RTCRtpSender` without renegotiating.

use super::protocol::{CandidatePayload, IceCandidate, MessageType, RelayMessage, SdpPayload};
use super::protocol::{MEDIA_CONNECTION_PREFIX, MEDIA_CONNECTION_TYPE};
use super::websocket::RelaySink;
use super::{CallEvent, CallLink, MediaCall};
use crate::config::SessionConfig;
use crate::media::{LocalTrack, MediaStream, RemoteStream, RemoteTrack, TrackKind};
use crate::media::MediaSample;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP8".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Build a peer connection from the session ICE settings
async fn build_peer_connection(config: &SessionConfig) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| Error::PeerConnectionError(format!("Failed to register codecs: {}", e)))?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine).map_err(
        |e| Error::PeerConnectionError(format!("Failed to register interceptors: {}", e)),
    )?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let ice_servers = config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect();

    let rtc_config = RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        ..Default::default()
    };

    let pc = api
        .new_peer_connection(rtc_config)
        .await
        .map_err(|e| Error::PeerConnectionError(format!("Failed to create peer connection: {}", e)))?;
    Ok(Arc::new(pc))
}

/// Forward samples of a local track into an RTP track
fn spawn_pump(source: &LocalTrack, sink: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
    let mut rx = source.subscribe();
    let track_id = source.id().to_string();

    tokio::spawn(async move {
        loop {
            let sample: MediaSample = match rx.recv().await {
                Ok(sample) => sample,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(track_id = %track_id, skipped, "Sample pump lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let sample = Sample {
                data: sample.data,
                duration: sample.duration,
                ..Default::default()
            };
            if let Err(e) = sink.write_sample(&sample).await {
                debug!(track_id = %track_id, "Failed to write sample: {}", e);
                break;
            }
        }
        debug!(track_id = %track_id, "Sample pump ended");
    })
}

struct OutboundVideo {
    sender: Arc<RTCRtpSender>,
    local_track_id: String,
    pump: JoinHandle<()>,
}

/// WebRTC media call
pub struct RtcCall {
    id: String,
    remote_id: String,
    pc: Arc<RTCPeerConnection>,
    sink: RelaySink,
    events: mpsc::UnboundedSender<CallEvent>,
    pending_offer: Mutex<Option<String>>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote_described: AtomicBool,
    remote_stream: Mutex<Option<RemoteStream>>,
    audio_pump: Mutex<Option<JoinHandle<()>>>,
    video: Mutex<Option<OutboundVideo>>,
    closed: AtomicBool,
}

impl RtcCall {
    async fn create(
        config: &SessionConfig,
        sink: RelaySink,
        id: String,
        remote_id: &str,
    ) -> Result<(Arc<Self>, CallLink)> {
        let pc = build_peer_connection(config).await?;
        let (events, events_rx) = mpsc::unbounded_channel();

        let call = Arc::new(Self {
            id,
            remote_id: remote_id.to_string(),
            pc,
            sink,
            events,
            pending_offer: Mutex::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            remote_described: AtomicBool::new(false),
            remote_stream: Mutex::new(None),
            audio_pump: Mutex::new(None),
            video: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        call.install_handlers();

        let link = CallLink {
            call: Arc::clone(&call) as Arc<dyn MediaCall>,
            events: events_rx,
        };
        Ok((call, link))
    }

    /// Place a call to `remote_id` and send the offer through the relay
    pub(crate) async fn outbound(
        config: &SessionConfig,
        sink: RelaySink,
        remote_id: &str,
        stream: &MediaStream,
    ) -> Result<(Arc<Self>, CallLink)> {
        let id = format!("{}{}", MEDIA_CONNECTION_PREFIX, uuid::Uuid::new_v4().simple());
        let (call, link) = Self::create(config, sink, id, remote_id).await?;

        if let Err(e) = call.send_offer(stream).await {
            call.shutdown(false).await;
            return Err(e);
        }
        info!(call_id = %call.id, remote_id, "Placed call");
        Ok((call, link))
    }

    /// Inbound call waiting for [`MediaCall::answer`]
    pub(crate) async fn inbound(
        config: &SessionConfig,
        sink: RelaySink,
        remote_id: &str,
        connection_id: &str,
        offer_sdp: String,
    ) -> Result<(Arc<Self>, CallLink)> {
        let (call, link) = Self::create(config, sink, connection_id.to_string(), remote_id).await?;
        *call.pending_offer.lock() = Some(offer_sdp);
        info!(call_id = %call.id, remote_id, "Incoming call");
        Ok((call, link))
    }

    /// Whether the call has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn install_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let weak = weak.clone();
                Box::pin(async move {
                    let (Some(call), Some(candidate)) = (weak.upgrade(), candidate) else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => call.send_candidate(init),
                        Err(e) => warn!(call_id = %call.id, "Failed to encode ICE candidate: {}", e),
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(call) = weak.upgrade() {
                    call.handle_remote_track(track);
                }
            })
        }));

        let weak = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(call) = weak.upgrade() else {
                        return;
                    };
                    debug!(call_id = %call.id, ?state, "Peer connection state changed");
                    match state {
                        RTCPeerConnectionState::Failed => {
                            if !call.is_closed() {
                                let _ = call
                                    .events
                                    .send(CallEvent::Error("peer connection failed".to_string()));
                            }
                        }
                        RTCPeerConnectionState::Closed => call.shutdown(true).await,
                        _ => {}
                    }
                })
            }));
    }

    fn handle_remote_track(&self, track: Arc<TrackRemote>) {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            _ => return,
        };
        let remote_track = RemoteTrack::new(track.id(), kind);
        let media = remote_track.media.clone();

        let announce = {
            let mut slot = self.remote_stream.lock();
            let first = slot.is_none();
            let stream = slot.get_or_insert_with(|| {
                RemoteStream::new(track.stream_id(), self.remote_id.clone())
            });
            stream.add_track(remote_track);
            first.then(|| stream.clone())
        };
        if let Some(stream) = announce {
            let _ = self.events.send(CallEvent::Stream(stream));
        }

        let call_id = self.id.clone();
        tokio::spawn(async move {
            while let Ok((packet, _)) = track.read_rtp().await {
                let _ = media.send(MediaSample {
                    data: packet.payload,
                    duration: Duration::ZERO,
                });
            }
            debug!(call_id = %call_id, %kind, "Remote track ended");
        });
    }

    async fn attach_stream(&self, stream: &MediaStream) -> Result<()> {
        if let Some(audio) = stream.audio_track() {
            let rtp_track = Arc::new(TrackLocalStaticSample::new(
                opus_capability(),
                audio.id().to_string(),
                stream.id().to_string(),
            ));
            self.pc
                .add_track(Arc::clone(&rtp_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::MediaTrackError(format!("Failed to add audio track: {}", e)))?;
            *self.audio_pump.lock() = Some(spawn_pump(audio, rtp_track));
        }

        if let Some(video) = stream.video_track() {
            let rtp_track = Arc::new(TrackLocalStaticSample::new(
                vp8_capability(),
                video.id().to_string(),
                stream.id().to_string(),
            ));
            let sender = self
                .pc
                .add_track(Arc::clone(&rtp_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::MediaTrackError(format!("Failed to add video track: {}", e)))?;
            *self.video.lock() = Some(OutboundVideo {
                sender,
                local_track_id: video.id().to_string(),
                pump: spawn_pump(video, rtp_track),
            });
        }
        Ok(())
    }

    async fn send_offer(&self, stream: &MediaStream) -> Result<()> {
        self.attach_stream(stream).await?;

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after offer".to_string()))?;

        let msg = RelayMessage::routed(
            MessageType::Offer,
            &self.remote_id,
            SdpPayload::offer(&self.id, local.sdp),
        )?;
        self.sink.send(msg)
    }

    /// Apply the remote answer to an outbound call
    pub(crate) async fn apply_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;
        self.remote_described.store(true, Ordering::SeqCst);
        self.flush_candidates().await;
        Ok(())
    }

    /// Add a trickled remote candidate, buffering until the remote description is set
    pub(crate) async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        if !self.remote_described.load(Ordering::SeqCst) {
            self.pending_candidates.lock().push(init);
            return Ok(());
        }
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn flush_candidates(&self) {
        let pending: Vec<_> = std::mem::take(&mut *self.pending_candidates.lock());
        for init in pending {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!(call_id = %self.id, "Failed to add buffered ICE candidate: {}", e);
            }
        }
    }

    fn send_candidate(&self, init: RTCIceCandidateInit) {
        let payload = CandidatePayload {
            candidate: IceCandidate {
                candidate: init.candidate,
                sdp_mid: init.sdp_mid,
                sdp_mline_index: init.sdp_mline_index,
                username_fragment: init.username_fragment,
            },
            connection_type: MEDIA_CONNECTION_TYPE.to_string(),
            connection_id: self.id.clone(),
        };
        let sent = RelayMessage::routed(MessageType::Candidate, &self.remote_id, payload)
            .map_err(Error::from)
            .and_then(|msg| self.sink.send(msg));
        if let Err(e) = sent {
            debug!(call_id = %self.id, "Dropping local ICE candidate: {}", e);
        }
    }

    async fn shutdown(&self, notify: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.audio_pump.lock().take() {
            pump.abort();
        }
        if let Some(video) = self.video.lock().take() {
            video.pump.abort();
        }
        if let Err(e) = self.pc.close().await {
            debug!(call_id = %self.id, "Error closing peer connection: {}", e);
        }
        if notify {
            let _ = self.events.send(CallEvent::Close);
        }
        info!(call_id = %self.id, remote_id = %self.remote_id, "Call closed");
    }
}

#[async_trait]
impl MediaCall for RtcCall {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    async fn answer(&self, stream: &MediaStream) -> Result<()> {
        let offer_sdp = self
            .pending_offer
            .lock()
            .take()
            .ok_or_else(|| Error::SdpError("Call has no pending offer".to_string()))?;

        self.attach_stream(stream).await?;

        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;
        self.remote_described.store(true, Ordering::SeqCst);

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after answer".to_string()))?;

        self.flush_candidates().await;

        let msg = RelayMessage::routed(
            MessageType::Answer,
            &self.remote_id,
            SdpPayload::answer(&self.id, local.sdp),
        )?;
        self.sink.send(msg)?;
        info!(call_id = %self.id, remote_id = %self.remote_id, "Answered call");
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = match self.video.lock().as_ref() {
            Some(video) => Arc::clone(&video.sender),
            None => return Err(Error::NoActiveCallTrack),
        };

        let rtp_track = Arc::new(TrackLocalStaticSample::new(
            vp8_capability(),
            track.id().to_string(),
            format!("stream-{}", self.id),
        ));
        sender
            .replace_track(Some(Arc::clone(&rtp_track) as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to replace video track: {}", e)))?;

        let pump = spawn_pump(track, rtp_track);
        let mut video = self.video.lock();
        match video.as_mut() {
            Some(current) => {
                current.pump.abort();
                current.pump = pump;
                current.local_track_id = track.id().to_string();
            }
            None => pump.abort(),
        }
        debug!(call_id = %self.id, track_id = track.id(), "Replaced outbound video track");
        Ok(())
    }

    fn outbound_video_track_id(&self) -> Option<String> {
        self.video.lock().as_ref().map(|v| v.local_track_id.clone())
    }

    async fn close(&self) {
        self.shutdown(true).await;
    }
}
