//! Wire protocol for broadcasting one stripe.
//!
//! Every message is a two-part multipart message: a short topic frame followed by a
//! payload frame. For a stripe with letter `L` (`A`, `B` or `C`) the sequence is:
//!
//! ```text
//! [L 'i'] [FrameInfo, 24 bytes]          metadata, exactly once
//! [L]     [samples 0 .. chunk)           data, ceil(length / chunk) messages
//! [L]     [samples chunk .. 2*chunk)
//! ...
//! [L]     ["END"]                        trailer, exactly once
//! ```
//!
//! Sample payloads are packed as little-endian `u32`. The metadata record layout is
//! fixed little-endian as well:
//!
//! | offset | field   | type |
//! |--------|---------|------|
//! | 0      | height  | u32  |
//! | 4      | width   | u32  |
//! | 8      | cluster | u32  |
//! | 12     | address | u32  |
//! | 16     | tag     | u64  |

use crate::error::{AppResult, RebError};
use crate::store::StoreState;
use crate::stripe::{FrameTags, Stripe, StripeId};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Samples per data message unless configured otherwise.
pub const CHUNK_SAMPLES: usize = 250_000;

/// Payload of the per-stripe trailer message.
pub const TRAILER: &[u8] = b"END";

/// Size of the encoded [`FrameInfo`] record.
pub const FRAME_INFO_LEN: usize = 24;

/// Suffix appended to the stripe letter to form the metadata topic.
pub const INFO_SUFFIX: u8 = b'i';

/// Metadata sent ahead of a stripe's samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo {
    /// Rows per channel image
    pub height: u32,
    /// Columns per channel image
    pub width: u32,
    /// Cluster id
    pub cluster: u32,
    /// Board address
    pub address: u32,
    /// Acquisition tag
    pub tag: u64,
}

impl FrameInfo {
    /// Metadata describing the current frame of `stripe`.
    pub fn from_stripe(stripe: &Stripe) -> Self {
        let geometry = stripe.geometry();
        let tags = stripe.tags();
        Self {
            height: geometry.height,
            width: geometry.width,
            cluster: tags.cluster,
            address: tags.address,
            tag: tags.tag,
        }
    }

    /// Correlation identifiers carried by this record.
    pub fn tags(&self) -> FrameTags {
        FrameTags {
            tag: self.tag,
            cluster: self.cluster,
            address: self.address,
        }
    }

    /// Encode into the fixed 24-byte layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_INFO_LEN);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.cluster);
        buf.put_u32_le(self.address);
        buf.put_u64_le(self.tag);
        buf.freeze()
    }

    /// Decode a record, rejecting anything that is not exactly 24 bytes.
    pub fn decode(mut payload: &[u8]) -> AppResult<Self> {
        if payload.len() != FRAME_INFO_LEN {
            return Err(RebError::Protocol(format!(
                "Frame info must be {} bytes, got {}",
                FRAME_INFO_LEN,
                payload.len()
            )));
        }
        Ok(Self {
            height: payload.get_u32_le(),
            width: payload.get_u32_le(),
            cluster: payload.get_u32_le(),
            address: payload.get_u32_le(),
            tag: payload.get_u64_le(),
        })
    }
}

/// Topic of the metadata message for `stripe`.
pub fn info_topic(stripe: StripeId) -> [u8; 2] {
    [stripe.letter(), INFO_SUFFIX]
}

/// Topic of data and trailer messages for `stripe`.
pub fn data_topic(stripe: StripeId) -> [u8; 1] {
    [stripe.letter()]
}

/// Number of data messages needed for `length` samples.
pub fn chunk_count(length: usize, chunk_samples: usize) -> usize {
    if chunk_samples == 0 {
        return 0;
    }
    length.div_ceil(chunk_samples)
}

/// Pack samples as little-endian `u32`.
pub fn encode_samples(samples: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 4);
    for sample in samples {
        buf.put_u32_le(*sample);
    }
    buf.freeze()
}

/// Unpack a little-endian `u32` payload.
pub fn decode_samples(payload: &[u8]) -> AppResult<Vec<u32>> {
    if payload.len() % 4 != 0 {
        return Err(RebError::Protocol(format!(
            "Sample payload of {} bytes is not a whole number of samples",
            payload.len()
        )));
    }
    let mut buf = payload;
    let mut samples = Vec::with_capacity(payload.len() / 4);
    while buf.has_remaining() {
        samples.push(buf.get_u32_le());
    }
    Ok(samples)
}

/// Destination of topic-tagged multipart messages.
///
/// Implemented for a ZMQ socket; tests record messages in memory instead.
pub trait MessageSink {
    /// Send one `[topic][payload]` message.
    fn send_message(&mut self, topic: &[u8], payload: &[u8]) -> AppResult<()>;
}

impl MessageSink for zmq::Socket {
    fn send_message(&mut self, topic: &[u8], payload: &[u8]) -> AppResult<()> {
        self.send(topic, zmq::SNDMORE)?;
        self.send(payload, 0)?;
        Ok(())
    }
}

/// Sink that keeps every message in order.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    /// Recorded `(topic, payload)` pairs
    pub messages: Vec<(Vec<u8>, Vec<u8>)>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages whose topic starts with `letter`.
    pub fn for_stripe(&self, stripe: StripeId) -> impl Iterator<Item = &(Vec<u8>, Vec<u8>)> {
        let letter = stripe.letter();
        self.messages
            .iter()
            .filter(move |(topic, _)| topic.first() == Some(&letter))
    }
}

impl MessageSink for MemorySink {
    fn send_message(&mut self, topic: &[u8], payload: &[u8]) -> AppResult<()> {
        self.messages.push((topic.to_vec(), payload.to_vec()));
        Ok(())
    }
}

/// Counts for one emitted stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmitStats {
    /// Data messages sent
    pub chunks: usize,
    /// Samples sent
    pub samples: usize,
}

/// Emit one stripe: metadata, data chunks, trailer.
pub fn emit_stripe(
    sink: &mut dyn MessageSink,
    stripe: &Stripe,
    chunk_samples: usize,
) -> AppResult<EmitStats> {
    if chunk_samples == 0 {
        return Err(RebError::Configuration(
            "Broadcast chunk size must be positive".to_string(),
        ));
    }

    let id = stripe.id();
    sink.send_message(&info_topic(id), &FrameInfo::from_stripe(stripe).encode())?;

    let topic = data_topic(id);
    let mut stats = EmitStats::default();
    for chunk in stripe.samples().chunks(chunk_samples) {
        sink.send_message(&topic, &encode_samples(chunk))?;
        stats.chunks += 1;
        stats.samples += chunk.len();
    }

    sink.send_message(&topic, TRAILER)?;
    Ok(stats)
}

/// Emit every enabled stripe of the current frame in increasing index order.
pub fn emit_frame(
    sink: &mut dyn MessageSink,
    state: &StoreState,
    chunk_samples: usize,
) -> AppResult<Vec<(StripeId, EmitStats)>> {
    state
        .enabled()
        .map(|stripe| Ok((stripe.id(), emit_stripe(sink, stripe, chunk_samples)?)))
        .collect()
}
