//! Receiving side of the broadcast protocol.
//!
//! [`StripeAssembler`] is a pure state machine that turns the message sequence of
//! [`crate::broadcast::protocol`] back into whole stripes. [`Subscriber`] wraps a SUB
//! socket around it for consumers and for the `listen` command.

use crate::broadcast::protocol::{decode_samples, FrameInfo, INFO_SUFFIX, TRAILER};
use crate::error::{AppResult, RebError};
use crate::stripe::{StripeId, TOTAL_STRIPES};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One stripe reassembled from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedStripe {
    /// Stripe the messages were tagged with
    pub id: StripeId,
    /// Metadata record
    pub info: FrameInfo,
    /// Samples in capture order
    pub samples: Vec<u32>,
    /// Data messages the samples arrived in
    pub chunks: usize,
}

#[derive(Debug)]
struct Partial {
    info: FrameInfo,
    samples: Vec<u32>,
    chunks: usize,
}

/// Reassembles stripes from `[topic][payload]` messages.
///
/// Stripes are tracked independently, so interleaved sequences for different letters
/// are accepted. A metadata message while a stripe is still open discards the open
/// one.
#[derive(Debug, Default)]
pub struct StripeAssembler {
    partial: [Option<Partial>; TOTAL_STRIPES],
}

impl StripeAssembler {
    /// Create an assembler with no open stripes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one message. Returns the stripe when its trailer arrives.
    pub fn feed(&mut self, topic: &[u8], payload: &[u8]) -> AppResult<Option<ReceivedStripe>> {
        let id = topic
            .first()
            .and_then(|letter| letter.checked_sub(b'A'))
            .and_then(|index| StripeId::from_index(index as usize))
            .ok_or_else(|| RebError::Protocol(format!("Unknown topic {:?}", topic)))?;
        let slot = &mut self.partial[id.index()];

        match topic.len() {
            2 if topic[1] == INFO_SUFFIX => {
                let info = FrameInfo::decode(payload)?;
                if slot.is_some() {
                    warn!(stripe = %id, "Metadata before trailer, discarding partial stripe");
                }
                *slot = Some(Partial {
                    info,
                    samples: Vec::new(),
                    chunks: 0,
                });
                Ok(None)
            }
            1 if payload == TRAILER => {
                let partial = slot.take().ok_or_else(|| out_of_order(id))?;
                debug!(stripe = %id, samples = partial.samples.len(), "Stripe assembled");
                Ok(Some(ReceivedStripe {
                    id,
                    info: partial.info,
                    samples: partial.samples,
                    chunks: partial.chunks,
                }))
            }
            1 => {
                let partial = slot.as_mut().ok_or_else(|| out_of_order(id))?;
                partial.samples.extend(decode_samples(payload)?);
                partial.chunks += 1;
                Ok(None)
            }
            _ => Err(RebError::Protocol(format!("Unknown topic {:?}", topic))),
        }
    }

    /// Whether any stripe is waiting for its trailer.
    pub fn has_open_stripe(&self) -> bool {
        self.partial.iter().any(Option::is_some)
    }
}

/// SUB socket connected to one board's publisher.
pub struct Subscriber {
    context: zmq::Context,
    socket: zmq::Socket,
    assembler: StripeAssembler,
}

impl Subscriber {
    /// Connect to `endpoint` and subscribe to `stripes`.
    pub fn connect(endpoint: &str, stripes: &[StripeId]) -> AppResult<Self> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::SUB)?;
        socket.set_rcvhwm(0)?;
        socket.set_linger(0)?;
        socket.connect(endpoint)?;
        // A one-letter prefix matches both the metadata and data topics
        for stripe in stripes {
            socket.set_subscribe(&[stripe.letter()])?;
        }
        debug!(endpoint, ?stripes, "Subscriber connected");
        Ok(Self {
            context,
            socket,
            assembler: StripeAssembler::new(),
        })
    }

    /// Send one rendezvous request to `endpoint` and wait for the reply.
    pub fn sync(&self, endpoint: &str, timeout: Duration) -> AppResult<()> {
        let request = self.context.socket(zmq::REQ)?;
        request.set_linger(0)?;
        request.connect(endpoint)?;
        request.send("", 0)?;
        if request.poll(zmq::POLLIN, duration_ms(timeout))? == 0 {
            return Err(RebError::Protocol(format!(
                "No rendezvous reply from {} within {:?}",
                endpoint, timeout
            )));
        }
        request.recv_bytes(0)?;
        Ok(())
    }

    /// Wait up to `timeout` for the next complete stripe.
    ///
    /// Messages that do not fit the sequence, such as data for a stripe whose
    /// metadata was sent before this subscriber joined, are skipped.
    pub fn recv_stripe(&mut self, timeout: Duration) -> AppResult<Option<ReceivedStripe>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if self.socket.poll(zmq::POLLIN, duration_ms(remaining))? == 0 {
                return Ok(None);
            }

            let parts = self.socket.recv_multipart(0)?;
            let [topic, payload] = parts.as_slice() else {
                return Err(RebError::Protocol(format!(
                    "Expected 2 message parts, got {}",
                    parts.len()
                )));
            };
            match self.assembler.feed(topic, payload) {
                Ok(Some(stripe)) => return Ok(Some(stripe)),
                Ok(None) => {}
                // Joining mid-stripe is normal for a late subscriber
                Err(RebError::Protocol(reason)) => debug!(%reason, "Skipping message"),
                Err(e) => return Err(e),
            }
        }
    }
}

fn out_of_order(id: StripeId) -> RebError {
    RebError::Protocol(format!("Stripe {} data before metadata", id))
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX).max(1)
}
