//! The capture gate: arms on peer request, inspects frames until one
//! passes the full-face check, then pushes the captured still back and
//! finishes.
//!
//! The gate never touches the media path itself. Frames are borrowed for
//! inspection only; forwarding happens upstream regardless of what the
//! gate decides.

use tracing::{debug, info, warn};

use visage_common::protocol::SignalingMessage;
use visage_detect::{encode_jpeg, FaceDetector, Frame};

use crate::signaling::SignalSender;

/// Lifecycle of one capture attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    /// Not inspecting; frames pass through untouched.
    Idle,
    /// Inspecting every decoded frame.
    Armed,
    /// A still was captured and delivered. Terminal.
    Done,
}

/// Peer commands that drive the gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateCommand {
    Start,
    Stop,
}

/// What the gate did with one inspected frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    /// Gate not armed; frame was not inspected.
    Pass,
    /// Inspected but the full-face check did not pass.
    Rejected,
    /// Check passed and the still was handed to the signaling channel.
    Captured,
    /// Check passed but the channel was not open; the gate stays armed
    /// and will retry on the next accepted frame.
    ChannelNotOpen,
}

pub struct CaptureGate {
    state: GateState,
    frames_inspected: u64,
    detector: Box<dyn FaceDetector>,
    channel: Option<std::sync::Arc<dyn SignalSender>>,
}

impl CaptureGate {
    pub fn new(detector: Box<dyn FaceDetector>) -> Self {
        Self {
            state: GateState::Idle,
            frames_inspected: 0,
            detector,
            channel: None,
        }
    }

    /// Attach the channel used to deliver the captured still.
    pub fn attach_channel(&mut self, channel: std::sync::Arc<dyn SignalSender>) {
        self.channel = Some(channel);
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Number of frames inspected while armed, monotonically increasing
    /// across re-arms.
    pub fn frames_inspected(&self) -> u64 {
        self.frames_inspected
    }

    /// Whether the media path should bother decoding frames for us.
    pub fn wants_frames(&self) -> bool {
        self.state == GateState::Armed
    }

    /// Apply a peer command. Commands are idempotent and `Done` is
    /// terminal: once a still has been delivered, further commands are
    /// acknowledged but change nothing.
    pub fn handle_command(&mut self, command: GateCommand) {
        match (self.state, command) {
            (GateState::Idle, GateCommand::Start) => {
                info!("received start signal, beginning face detection");
                self.state = GateState::Armed;
            }
            (GateState::Armed, GateCommand::Stop) => {
                info!("received stop signal, face detection paused");
                self.state = GateState::Idle;
            }
            (GateState::Done, _) => {
                debug!(?command, "capture already complete, ignoring command");
            }
            _ => {
                debug!(?command, state = ?self.state, "redundant command ignored");
            }
        }
    }

    /// Inspect one decoded frame. Only called with a borrowed frame; the
    /// caller keeps forwarding it whatever the outcome.
    pub fn on_frame(&mut self, frame: &Frame) -> GateOutcome {
        if self.state != GateState::Armed {
            return GateOutcome::Pass;
        }
        self.frames_inspected += 1;

        let result = match self.detector.detect(frame) {
            Ok(result) => result,
            Err(err) => {
                warn!("detector failed on frame {}: {err}", self.frames_inspected);
                return GateOutcome::Rejected;
            }
        };
        if !result.accepted() {
            if let Some(failure) = result.failure() {
                debug!(frame = self.frames_inspected, ?failure, "frame rejected");
            }
            return GateOutcome::Rejected;
        }

        let jpeg = match encode_jpeg(frame) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                warn!("failed to encode captured still: {err}");
                return GateOutcome::Rejected;
            }
        };

        match &self.channel {
            Some(channel) if channel.is_open() => {
                info!(
                    frame = self.frames_inspected,
                    bytes = jpeg.len(),
                    "full face detected, sending still to peer"
                );
                channel.send(SignalingMessage::FaceDetected(jpeg));
                self.state = GateState::Done;
                GateOutcome::Captured
            }
            _ => {
                warn!("face detected but signaling channel not open, staying armed");
                GateOutcome::ChannelNotOpen
            }
        }
    }
}
