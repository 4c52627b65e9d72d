//! Outbound signaling over the peer's data channel.
//!
//! Sends are funneled through a per-channel queue drained by a single
//! task, so multi-part messages (the detection marker followed by the
//! still payload) arrive in order and callers never block on the SCTP
//! transport.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use visage_common::protocol::SignalingMessage;

/// Sink for peer-bound signaling messages.
///
/// Synchronous by contract; implementations queue rather than await.
pub trait SignalSender: Send + Sync {
    /// Whether the underlying transport is currently open.
    fn is_open(&self) -> bool;

    /// Enqueue a message for delivery. Messages sent from one thread are
    /// delivered in the order they were enqueued.
    fn send(&self, message: SignalingMessage);
}

/// [`SignalSender`] backed by a WebRTC data channel.
pub struct DataChannelSender {
    channel: Arc<RTCDataChannel>,
    queue: mpsc::UnboundedSender<String>,
}

impl DataChannelSender {
    /// Wrap a data channel, spawning the drain task that performs the
    /// actual async sends.
    pub fn spawn(channel: Arc<RTCDataChannel>) -> Arc<Self> {
        let (queue, mut rx) = mpsc::unbounded_channel::<String>();
        let drain = Arc::clone(&channel);
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(err) = drain.send_text(text).await {
                    warn!("data channel send failed: {err}");
                }
            }
            debug!("data channel sender drained");
        });
        Arc::new(Self { channel, queue })
    }
}

impl SignalSender for DataChannelSender {
    fn is_open(&self) -> bool {
        self.channel.ready_state() == RTCDataChannelState::Open
    }

    fn send(&self, message: SignalingMessage) {
        for text in message.to_wire() {
            if self.queue.send(text).is_err() {
                warn!("data channel sender task is gone, dropping message");
                break;
            }
        }
    }
}
