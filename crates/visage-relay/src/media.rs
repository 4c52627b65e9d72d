//! Inbound media inspection: reassemble access units from RTP and decode
//! them into RGB frames for the capture gate.
//!
//! This path is read-only. Forwarding back to the peer happens packet by
//! packet in the session's media loop and never waits on decoding.

use tracing::debug;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;

use visage_common::Result;
use visage_detect::Frame;

/// RTP clock rate for video, and the denominator of frame timestamps.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// How many packets the sampler may hold back for reordering.
const MAX_LATE_PACKETS: u16 = 128;

/// Decodes one reassembled access unit into zero or more frames.
///
/// Decoders may buffer internally while they accumulate reference data,
/// so any call can legitimately return an empty vec.
pub trait FrameDecoder: Send {
    fn decode(&mut self, data: &[u8], pts: i64) -> Result<Vec<Frame>>;
}

/// Depacketizer plus decoder, fed raw RTP packets.
pub struct MediaPipeline<D: Depacketizer> {
    sampler: SampleBuilder<D>,
    decoder: Box<dyn FrameDecoder>,
}

impl MediaPipeline<H264Packet> {
    pub fn h264(decoder: Box<dyn FrameDecoder>) -> Self {
        Self::with_depacketizer(H264Packet::default(), decoder)
    }
}

impl<D: Depacketizer> MediaPipeline<D> {
    pub fn with_depacketizer(depacketizer: D, decoder: Box<dyn FrameDecoder>) -> Self {
        Self {
            sampler: SampleBuilder::new(MAX_LATE_PACKETS, depacketizer, VIDEO_CLOCK_RATE),
            decoder,
        }
    }

    /// Feed one RTP packet and collect any frames that became decodable,
    /// in presentation order.
    pub fn push(&mut self, packet: Packet) -> Vec<Frame> {
        self.sampler.push(packet);

        let mut frames = Vec::new();
        while let Some(sample) = self.sampler.pop() {
            let pts = i64::from(sample.packet_timestamp);
            match self.decoder.decode(&sample.data, pts) {
                Ok(mut decoded) => frames.append(&mut decoded),
                // A corrupt access unit only costs us inspection of that
                // frame; the forwarding path is unaffected.
                Err(err) => debug!("frame decode failed: {err}"),
            }
        }
        frames
    }
}

#[cfg(feature = "h264")]
pub use self::h264::{OpenH264Decoder, OpenH264DecoderFactory};

#[cfg(feature = "h264")]
mod h264 {
    use openh264::decoder::Decoder;
    use openh264::formats::YUVSource;

    use visage_common::{Error, Result};
    use visage_detect::Frame;

    use super::{FrameDecoder, VIDEO_CLOCK_RATE};
    use crate::registry::DecoderFactory;

    /// Software H.264 decoder.
    pub struct OpenH264Decoder {
        inner: Decoder,
    }

    impl OpenH264Decoder {
        pub fn new() -> Result<Self> {
            let inner =
                Decoder::new().map_err(|e| Error::media(format!("decoder init failed: {e}")))?;
            Ok(Self { inner })
        }
    }

    impl FrameDecoder for OpenH264Decoder {
        fn decode(&mut self, data: &[u8], pts: i64) -> Result<Vec<Frame>> {
            match self.inner.decode(data) {
                Ok(Some(yuv)) => {
                    let (width, height) = yuv.dimensions();
                    let mut rgb = vec![0u8; width * height * 3];
                    yuv.write_rgb8(&mut rgb);
                    let frame = Frame::new(
                        rgb,
                        width as u32,
                        height as u32,
                        pts,
                        (1, VIDEO_CLOCK_RATE),
                    )
                    .map_err(|e| Error::media(e.to_string()))?;
                    Ok(vec![frame])
                }
                Ok(None) => Ok(Vec::new()),
                Err(err) => Err(Error::media(format!("h264 decode failed: {err}"))),
            }
        }
    }

    /// Builds one decoder per session.
    pub struct OpenH264DecoderFactory;

    impl DecoderFactory for OpenH264DecoderFactory {
        fn create(&self) -> Result<Box<dyn FrameDecoder>> {
            Ok(Box::new(OpenH264Decoder::new()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use webrtc::rtp::header::Header;

    use super::*;

    /// One packet per access unit, payload passed through untouched.
    struct PassThrough;

    impl Depacketizer for PassThrough {
        fn depacketize(&mut self, b: &Bytes) -> std::result::Result<Bytes, webrtc::rtp::Error> {
            Ok(b.clone())
        }

        fn is_partition_head(&self, _payload: &Bytes) -> bool {
            true
        }

        fn is_partition_tail(&self, marker: bool, _payload: &Bytes) -> bool {
            marker
        }
    }

    /// Records every access unit it is handed and emits one tiny frame.
    struct Recording {
        seen: Arc<Mutex<Vec<(Vec<u8>, i64)>>>,
    }

    impl FrameDecoder for Recording {
        fn decode(&mut self, data: &[u8], pts: i64) -> Result<Vec<Frame>> {
            self.seen.lock().unwrap().push((data.to_vec(), pts));
            Ok(vec![
                Frame::new(vec![0u8; 4 * 4 * 3], 4, 4, pts, (1, VIDEO_CLOCK_RATE)).unwrap(),
            ])
        }
    }

    fn packet(seq: u16, timestamp: u32, payload: &[u8]) -> Packet {
        Packet {
            header: Header {
                version: 2,
                marker: true,
                payload_type: 102,
                sequence_number: seq,
                timestamp,
                ..Default::default()
            },
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_access_units_reach_decoder_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = MediaPipeline::with_depacketizer(
            PassThrough,
            Box::new(Recording {
                seen: Arc::clone(&seen),
            }),
        );

        let mut frames = Vec::new();
        for (i, payload) in [&b"au-1"[..], b"au-2", b"au-3", b"au-4"].iter().enumerate() {
            let ts = 1000 + i as u32 * 3000;
            frames.extend(pipeline.push(packet(i as u16, ts, payload)));
        }

        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 2, "sampler emitted too few access units");
        for (i, (data, pts)) in seen.iter().enumerate() {
            assert_eq!(data.as_slice(), format!("au-{}", i + 1).as_bytes());
            assert_eq!(*pts, 1000 + i as i64 * 3000);
        }

        // Frames come out in the same order the decoder produced them.
        let ptss: Vec<i64> = frames.iter().map(|f| f.pts()).collect();
        let expected: Vec<i64> = seen.iter().map(|(_, pts)| *pts).collect();
        assert_eq!(ptss, expected);
    }

    #[test]
    fn test_decoder_error_drops_only_that_frame() {
        struct Failing {
            calls: Arc<Mutex<usize>>,
        }

        impl FrameDecoder for Failing {
            fn decode(&mut self, _data: &[u8], _pts: i64) -> Result<Vec<Frame>> {
                *self.calls.lock().unwrap() += 1;
                Err(visage_common::Error::media("corrupt access unit"))
            }
        }

        let calls = Arc::new(Mutex::new(0));
        let mut pipeline = MediaPipeline::with_depacketizer(
            PassThrough,
            Box::new(Failing {
                calls: Arc::clone(&calls),
            }),
        );

        for i in 0..4u16 {
            let frames = pipeline.push(packet(i, 1000 + u32::from(i) * 3000, b"au"));
            assert!(frames.is_empty());
        }
        assert!(*calls.lock().unwrap() >= 2);
    }
}
