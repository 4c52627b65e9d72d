//! Session registry: negotiates new peers, routes trickled candidates,
//! and owns the handles used to shut everything down.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use visage_common::protocol::{
    IceCandidatePayload, SessionDescriptionPayload, DATA_CHANNEL_LABEL,
};
use visage_common::{Error, Result};
use visage_detect::FaceDetector;

use crate::gate::CaptureGate;
use crate::media::FrameDecoder;
use crate::session::{self, SessionActor, SessionEvent};

/// Hard cap on posted SDP size.
pub const MAX_SDP_BYTES: usize = 32 * 1024;

const H264_PAYLOAD_TYPE: u8 = 102;
const H264_FMTP_LINE: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f";

/// Builds one detector per session; detectors keep per-stream state.
pub trait DetectorFactory: Send + Sync {
    fn create(&self) -> Box<dyn FaceDetector>;
}

/// Builds one frame decoder per session.
pub trait DecoderFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn FrameDecoder>>;
}

struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// Shared handle to every live session.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, SessionHandle>>>,
    stun_url: String,
    detectors: Arc<dyn DetectorFactory>,
    decoders: Arc<dyn DecoderFactory>,
}

impl SessionRegistry {
    /// An empty `stun_url` disables STUN and gathers host candidates only.
    pub fn new(
        stun_url: impl Into<String>,
        detectors: Arc<dyn DetectorFactory>,
        decoders: Arc<dyn DecoderFactory>,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            stun_url: stun_url.into(),
            detectors,
            decoders,
        }
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Negotiate a new session from a posted offer. Returns the answer
    /// with ICE candidates already gathered, so the peer needs no
    /// trickle round-trip to reach us.
    pub async fn handle_offer(
        &self,
        offer: SessionDescriptionPayload,
    ) -> Result<SessionDescriptionPayload> {
        if offer.kind != "offer" {
            return Err(Error::protocol(format!(
                "expected an offer, got {:?}",
                offer.kind
            )));
        }
        if offer.sdp.is_empty() || offer.sdp.len() > MAX_SDP_BYTES {
            return Err(Error::protocol("offer SDP size out of bounds"));
        }
        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| Error::protocol(format!("unparseable offer: {e}")))?;

        let id = Uuid::new_v4();
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: if self.stun_url.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: vec![self.stun_url.clone()],
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| Error::internal(format!("peer connection failed: {e}")))?,
        );

        // The echo track the inbound stream is forwarded onto.
        let local_video = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                sdp_fmtp_line: H264_FMTP_LINE.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            format!("relay-{id}"),
        ));
        pc.add_track(Arc::clone(&local_video) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::internal(format!("add track failed: {e}")))?;

        let (events, inbox) = mpsc::unbounded_channel();
        wire_callbacks(&pc, id, events.clone());

        let mut actor = SessionActor::new(
            id,
            Arc::clone(&pc),
            local_video,
            CaptureGate::new(self.detectors.create()),
            Arc::clone(&self.decoders),
            events.clone(),
        );

        pc.set_remote_description(remote)
            .await
            .map_err(|e| Error::protocol(format!("offer rejected: {e}")))?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| Error::internal(format!("answer failed: {e}")))?;
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(|e| Error::internal(format!("set local description failed: {e}")))?;
        // Non-trickle on our side: wait for gathering so the answer is
        // complete.
        let _ = gathered.recv().await;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| Error::internal("local description missing after gathering"))?;
        actor.mark_negotiating();

        self.sessions
            .write()
            .await
            .insert(id, SessionHandle { events });
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            session::run(actor, inbox).await;
            sessions.write().await.remove(&id);
            debug!(session = %id, "session removed from registry");
        });

        info!(session = %id, "session negotiated");
        // The peer echoes this id on trickled candidates so they can be
        // routed without the legacy broadcast.
        Ok(SessionDescriptionPayload {
            sdp: local.sdp,
            kind: local.sdp_type.to_string(),
            session_id: Some(id),
        })
    }

    /// Route a trickled candidate. Candidates carrying a session id go to
    /// that session; unknown ids are dropped quietly since the session
    /// may have just closed.
    pub async fn handle_candidate(&self, payload: IceCandidatePayload) -> Result<()> {
        let candidate = payload.to_candidate_string()?;
        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid: payload.sdp_mid.clone(),
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: None,
        };

        let sessions = self.sessions.read().await;
        match payload.session_id {
            Some(id) => match sessions.get(&id) {
                Some(handle) => {
                    let _ = handle.events.send(SessionEvent::RemoteCandidate(init));
                }
                None => debug!(session = %id, "candidate for unknown session dropped"),
            },
            None => {
                // Legacy clients omit the session id; deliver to every
                // live session. Non-matching sessions ignore it.
                warn!(
                    count = sessions.len(),
                    "candidate without session id, broadcasting"
                );
                for handle in sessions.values() {
                    let _ = handle.events.send(SessionEvent::RemoteCandidate(init.clone()));
                }
            }
        }
        Ok(())
    }

    /// Ask every live session to close and forget about them. Session
    /// tasks release their own resources on the way out.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.sessions.write().await.drain().collect();
        info!(count = handles.len(), "shutting down sessions");
        for (_, handle) in handles {
            let _ = handle.events.send(SessionEvent::Shutdown);
        }
    }
}

/// API with H.264 as the only video codec, so the peer has no choice but
/// to send a stream we can decode.
fn build_api() -> Result<API> {
    let mut media = MediaEngine::default();
    media
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: H264_FMTP_LINE.to_owned(),
                    rtcp_feedback: Vec::new(),
                },
                payload_type: H264_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| Error::internal(format!("codec registration failed: {e}")))?;

    let interceptors = register_default_interceptors(Registry::new(), &mut media)
        .map_err(|e| Error::internal(format!("interceptor registration failed: {e}")))?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(interceptors)
        .build())
}

/// Every callback forwards into the session inbox and returns; no state
/// is touched from WebRTC's threads.
fn wire_callbacks(
    pc: &Arc<RTCPeerConnection>,
    id: Uuid,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let _ = tx.send(SessionEvent::TransportState(state));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let _ = tx.send(SessionEvent::TrackReceived(track));
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        wire_data_channel(dc, id, tx.clone());
        Box::pin(async {})
    }));

    pc.on_ice_connection_state_change(Box::new(move |state| {
        debug!(session = %id, %state, "ice connection state");
        Box::pin(async {})
    }));
}

fn wire_data_channel(
    dc: Arc<RTCDataChannel>,
    id: Uuid,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    debug!(session = %id, label = %dc.label(), "data channel announced");
    if dc.label() != DATA_CHANNEL_LABEL {
        debug!(session = %id, label = %dc.label(), "unexpected data channel label, accepting anyway");
    }

    let tx = events.clone();
    let opened = Arc::clone(&dc);
    dc.on_open(Box::new(move || {
        let _ = tx.send(SessionEvent::DataChannelOpened(opened));
        Box::pin(async {})
    }));

    let tx = events;
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        if message.is_string {
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(SessionEvent::PeerMessage(text));
                }
                Err(_) => warn!(session = %id, "dropping non-utf8 text frame"),
            }
        }
        Box::pin(async {})
    }));
}
