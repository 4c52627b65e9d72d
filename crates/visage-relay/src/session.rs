//! Per-peer session lifecycle.
//!
//! All WebRTC callbacks do exactly one thing: enqueue a [`SessionEvent`]
//! into the session's inbox. A single owning task drains the inbox and is
//! the only place session state is read or written, so there is no shared
//! mutable state between callbacks and no lock ordering to reason about.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use visage_common::protocol::SignalingMessage;
use visage_detect::Frame;

use crate::gate::{CaptureGate, GateCommand, GateOutcome};
use crate::media::MediaPipeline;
use crate::registry::DecoderFactory;
use crate::signaling::DataChannelSender;

/// Everything that can happen to a session, in arrival order.
pub enum SessionEvent {
    /// The peer's data channel reached the open state.
    DataChannelOpened(Arc<RTCDataChannel>),
    /// A text message arrived on the data channel.
    PeerMessage(String),
    /// A remote media track was announced.
    TrackReceived(Arc<TrackRemote>),
    /// A decoded frame from the media loop, in presentation order.
    Frame(Frame),
    /// A trickled ICE candidate routed from the HTTP endpoint.
    RemoteCandidate(RTCIceCandidateInit),
    /// The peer connection transport changed state.
    TransportState(RTCPeerConnectionState),
    /// Server shutdown or administrative close.
    Shutdown,
}

/// Session lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    New,
    Negotiating,
    Connected,
    Closing,
    Failed,
    Closed,
}

/// Map a transport state change onto the session lifecycle. Transient
/// disconnects keep the current state; only terminal transport states
/// move the session toward teardown.
fn on_transport(state: SessionState, transport: RTCPeerConnectionState) -> SessionState {
    if state == SessionState::Closed {
        return state;
    }
    match transport {
        RTCPeerConnectionState::Connected => SessionState::Connected,
        RTCPeerConnectionState::Failed => SessionState::Failed,
        RTCPeerConnectionState::Closed => SessionState::Closing,
        _ => state,
    }
}

/// The single owner of one session's state and resources.
pub(crate) struct SessionActor {
    id: Uuid,
    state: SessionState,
    pc: Arc<RTCPeerConnection>,
    local_video: Arc<TrackLocalStaticRTP>,
    remote_video: Option<Arc<TrackRemote>>,
    data_channel: Option<Arc<RTCDataChannel>>,
    gate: CaptureGate,
    /// Shared with the media loop; gates the decode cost so disarmed
    /// sessions pay for forwarding only.
    inspect: Arc<AtomicBool>,
    media_task: Option<JoinHandle<()>>,
    decoders: Arc<dyn DecoderFactory>,
    events: mpsc::UnboundedSender<SessionEvent>,
    released: bool,
}

impl SessionActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: Uuid,
        pc: Arc<RTCPeerConnection>,
        local_video: Arc<TrackLocalStaticRTP>,
        gate: CaptureGate,
        decoders: Arc<dyn DecoderFactory>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            id,
            state: SessionState::New,
            pc,
            local_video,
            remote_video: None,
            data_channel: None,
            gate,
            inspect: Arc::new(AtomicBool::new(false)),
            media_task: None,
            decoders,
            events,
            released: false,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// The local description is set and the answer is on its way to the
    /// peer.
    pub(crate) fn mark_negotiating(&mut self) {
        if self.state == SessionState::New {
            self.state = SessionState::Negotiating;
        }
    }

    fn sync_inspect(&self) {
        self.inspect
            .store(self.gate.wants_frames(), Ordering::Relaxed);
    }

    fn maybe_start_media(&mut self) {
        if self.media_task.is_some() || self.state != SessionState::Connected {
            return;
        }
        let Some(remote) = self.remote_video.clone() else {
            return;
        };
        let pipeline = match self.decoders.create() {
            Ok(decoder) => Some(MediaPipeline::h264(decoder)),
            Err(err) => {
                warn!(session = %self.id, "media decode unavailable, relaying only: {err}");
                None
            }
        };
        self.media_task = Some(tokio::spawn(run_media_loop(
            self.id,
            remote,
            Arc::clone(&self.local_video),
            pipeline,
            Arc::clone(&self.inspect),
            self.events.clone(),
        )));
    }

    /// Close transports and stop the media loop. Idempotent; every exit
    /// path funnels through here exactly once.
    pub(crate) async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.inspect.store(false, Ordering::Relaxed);
        if let Some(task) = self.media_task.take() {
            task.abort();
        }
        if let Some(dc) = self.data_channel.take() {
            if let Err(err) = dc.close().await {
                debug!(session = %self.id, "data channel close: {err}");
            }
        }
        if let Err(err) = self.pc.close().await {
            debug!(session = %self.id, "peer connection close: {err}");
        }
        info!(session = %self.id, "session resources released");
    }

    /// Process one event. Returns false when the session is finished and
    /// the inbox loop should stop.
    pub(crate) async fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::DataChannelOpened(dc) => {
                info!(session = %self.id, label = %dc.label(), "data channel open");
                self.gate.attach_channel(DataChannelSender::spawn(Arc::clone(&dc)));
                self.data_channel = Some(dc);
                true
            }
            SessionEvent::PeerMessage(text) => {
                match SignalingMessage::from_wire(&text) {
                    SignalingMessage::Start => self.gate.handle_command(GateCommand::Start),
                    SignalingMessage::Stop => self.gate.handle_command(GateCommand::Stop),
                    other => debug!(session = %self.id, ?other, "ignoring peer message"),
                }
                self.sync_inspect();
                true
            }
            SessionEvent::TrackReceived(track) => {
                if track.kind() == RTPCodecType::Video && self.remote_video.is_none() {
                    info!(session = %self.id, ssrc = track.ssrc(), "video track received");
                    self.remote_video = Some(track);
                    self.maybe_start_media();
                } else {
                    debug!(session = %self.id, kind = %track.kind(), "ignoring extra track");
                }
                true
            }
            SessionEvent::Frame(frame) => {
                if self.gate.on_frame(&frame) == GateOutcome::Captured {
                    self.sync_inspect();
                }
                true
            }
            SessionEvent::RemoteCandidate(init) => {
                if let Err(err) = self.pc.add_ice_candidate(init).await {
                    warn!(session = %self.id, "failed to apply remote candidate: {err}");
                }
                true
            }
            SessionEvent::TransportState(transport) => {
                let next = on_transport(self.state, transport);
                if next != self.state {
                    info!(session = %self.id, from = ?self.state, to = ?next, "session state change");
                    self.state = next;
                }
                match self.state {
                    SessionState::Connected => {
                        self.maybe_start_media();
                        true
                    }
                    SessionState::Failed => {
                        warn!(session = %self.id, "transport failed");
                        self.release().await;
                        self.state = SessionState::Closed;
                        false
                    }
                    SessionState::Closing => {
                        self.release().await;
                        self.state = SessionState::Closed;
                        false
                    }
                    _ => true,
                }
            }
            SessionEvent::Shutdown => {
                self.state = SessionState::Closing;
                self.release().await;
                self.state = SessionState::Closed;
                false
            }
        }
    }
}

/// Drain the inbox until the session finishes, then release whatever is
/// still held. Dropping the inbox sender also ends the session.
pub(crate) async fn run(mut actor: SessionActor, mut inbox: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = inbox.recv().await {
        if !actor.handle_event(event).await {
            break;
        }
    }
    actor.release().await;
    actor.state = SessionState::Closed;
    info!(session = %actor.id, "session closed");
}

/// Forward every inbound RTP packet back out, and feed the inspection
/// pipeline while the gate is armed. Forwarding is unconditional and
/// happens before any decode work.
async fn run_media_loop(
    session: Uuid,
    remote: Arc<TrackRemote>,
    local: Arc<TrackLocalStaticRTP>,
    mut pipeline: Option<MediaPipeline<H264Packet>>,
    inspect: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    loop {
        let (packet, _) = match remote.read_rtp().await {
            Ok(read) => read,
            Err(err) => {
                debug!(%session, "remote track ended: {err}");
                return;
            }
        };

        if let Err(err) = local.write_rtp(&packet).await {
            if webrtc::Error::ErrClosedPipe == err {
                debug!(%session, "local track closed");
                return;
            }
            debug!(%session, "forwarding error: {err}");
        }

        if inspect.load(Ordering::Relaxed) {
            if let Some(pipeline) = pipeline.as_mut() {
                for frame in pipeline.push(packet) {
                    if events.send(SessionEvent::Frame(frame)).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    use visage_common::Error;
    use visage_detect::{DetectError, DetectionResult, FaceDetector};

    use super::*;
    use crate::media::FrameDecoder;

    #[test]
    fn test_transport_transitions() {
        use RTCPeerConnectionState as T;
        use SessionState as S;

        assert_eq!(on_transport(S::New, T::New), S::New);
        assert_eq!(on_transport(S::New, T::Connected), S::Connected);
        assert_eq!(on_transport(S::Negotiating, T::Connecting), S::Negotiating);
        assert_eq!(on_transport(S::Negotiating, T::Connected), S::Connected);
        assert_eq!(on_transport(S::Connected, T::Disconnected), S::Connected);
        assert_eq!(on_transport(S::Connected, T::Failed), S::Failed);
        assert_eq!(on_transport(S::Connected, T::Closed), S::Closing);
        assert_eq!(on_transport(S::Closed, T::Connected), S::Closed);
    }

    struct AlwaysReject;

    impl FaceDetector for AlwaysReject {
        fn detect(&mut self, _frame: &Frame) -> Result<DetectionResult, DetectError> {
            Ok(DetectionResult {
                face_found: false,
                face_count: 0,
                eyes_found: false,
                mouth_found: false,
            })
        }
    }

    struct NoDecoders;

    impl DecoderFactory for NoDecoders {
        fn create(&self) -> visage_common::Result<Box<dyn FrameDecoder>> {
            Err(Error::media("decoding disabled in tests"))
        }
    }

    async fn actor() -> (SessionActor, mpsc::UnboundedReceiver<SessionEvent>) {
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        let local_video = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "video/H264".to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_owned(),
            "relay".to_owned(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = SessionActor::new(
            Uuid::new_v4(),
            pc,
            local_video,
            CaptureGate::new(Box::new(AlwaysReject)),
            Arc::new(NoDecoders),
            tx,
        );
        (actor, rx)
    }

    #[tokio::test]
    async fn test_connect_then_shutdown_releases_once() {
        let (mut actor, _rx) = actor().await;
        assert_eq!(actor.state(), SessionState::New);
        actor.mark_negotiating();
        assert_eq!(actor.state(), SessionState::Negotiating);
        // Repeating is a no-op once past New.
        actor.mark_negotiating();
        assert_eq!(actor.state(), SessionState::Negotiating);

        assert!(
            actor
                .handle_event(SessionEvent::TransportState(
                    RTCPeerConnectionState::Connected
                ))
                .await
        );
        assert_eq!(actor.state(), SessionState::Connected);

        assert!(!actor.handle_event(SessionEvent::Shutdown).await);
        assert_eq!(actor.state(), SessionState::Closed);
        assert!(actor.released);

        // The run loop releases again after the inbox ends; must be a no-op.
        actor.release().await;
        assert!(actor.released);
    }

    #[tokio::test]
    async fn test_transport_failure_tears_down_and_stops_inspection() {
        let (mut actor, _rx) = actor().await;

        actor
            .handle_event(SessionEvent::PeerMessage("start".to_owned()))
            .await;
        assert!(actor.inspect.load(Ordering::Relaxed));

        let keep_going = actor
            .handle_event(SessionEvent::TransportState(RTCPeerConnectionState::Failed))
            .await;
        assert!(!keep_going);
        assert_eq!(actor.state(), SessionState::Closed);
        assert!(actor.released);
        assert!(!actor.inspect.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_start_stop_toggle_inspection_flag() {
        let (mut actor, _rx) = actor().await;

        actor
            .handle_event(SessionEvent::PeerMessage("start".to_owned()))
            .await;
        assert!(actor.inspect.load(Ordering::Relaxed));

        actor
            .handle_event(SessionEvent::PeerMessage("stop".to_owned()))
            .await;
        assert!(!actor.inspect.load(Ordering::Relaxed));

        // Unknown payloads are ignored without disturbing the gate.
        actor
            .handle_event(SessionEvent::PeerMessage("START".to_owned()))
            .await;
        assert!(!actor.inspect.load(Ordering::Relaxed));
    }
}
