//! Portrait capture relay.
//!
//! Accepts WebRTC offers from browser peers, relays the inbound video
//! stream back unchanged, and, while armed over the paired data channel,
//! inspects decoded frames for a single fully visible face. On a positive
//! detection the captured still is pushed back to the peer over the data
//! channel and the capture attempt completes.

#![forbid(unsafe_code)]

pub mod config;
pub mod gate;
pub mod http;
pub mod media;
pub mod registry;
pub mod session;
pub mod signaling;

pub use config::RelayConfig;
pub use gate::{CaptureGate, GateCommand, GateOutcome, GateState};
pub use registry::{DecoderFactory, DetectorFactory, SessionRegistry};
pub use session::{SessionEvent, SessionState};
pub use signaling::SignalSender;
