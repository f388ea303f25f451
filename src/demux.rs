//! Channel demultiplexer: raw ADC words in, per-stripe sample sequences out.
//!
//! The board sends one image as a flat run of 16-bit words. Every `channels`
//! consecutive words belong to one stripe; the next `channels` words belong to the
//! next *enabled* stripe, wrapping over the enabled set only:
//!
//! ```text
//! mask = left|right, channels = 2
//! words:   w0 w1 | w2 w3 | w4 w5 | w6 w7 ...
//! stripe:  A  A  | C  C  | A  A  | C  C  ...
//! ```
//!
//! Each word is converted from network byte order and mapped through a
//! [`SignTransform`] before it is appended to its stripe.
//!
//! The whole pass (configure, blocking receive, transform, ready flag) runs with the
//! store lock held. Publisher and writers wait for the full pass; this keeps the
//! frame they see consistent at the cost of latency.

use crate::error::{AppResult, RebError};
use crate::hardware::PixelTransport;
use crate::store::{StoreState, StripeStore};
use crate::stripe::{FrameTags, Geometry, StripeId, StripeMask, TOTAL_STRIPES};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Mid-scale mask of the 18-bit sample space.
pub const MID_SCALE_MASK: u32 = 0x1_FFFF;

/// Bias subtracted by [`SignTransform::BiasSubtract`] (2^17).
pub const SAMPLE_BIAS: u32 = 131_072;

/// Mapping from a raw 16-bit ADC code to a stored 32-bit sample.
///
/// The board firmware has shipped with two encodings and the two conversions below
/// do not agree; pick the one matching the firmware in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignTransform {
    /// `(code << 2) ^ 0x1FFFF`: the code is placed in the 18-bit space and
    /// complemented against the mid-scale mask.
    #[default]
    MidScaleComplement,
    /// Sign-extend the code to 32 bits, then `131072 - value` (wrapping).
    BiasSubtract,
}

impl SignTransform {
    /// Convert one host-order code.
    #[inline]
    pub fn apply(self, code: u16) -> u32 {
        match self {
            SignTransform::MidScaleComplement => (u32::from(code) << 2) ^ MID_SCALE_MASK,
            SignTransform::BiasSubtract => {
                let extended = code as i16 as i32 as u32;
                SAMPLE_BIAS.wrapping_sub(extended)
            }
        }
    }
}

/// What one acquisition pass produced.
#[derive(Debug)]
pub struct AcquisitionOutcome {
    /// Words the stripes were sized for
    pub expected: usize,
    /// Words the transport says it delivered (non-positive on failure)
    pub received: isize,
    /// Words the board announced for this image
    pub announced: usize,
    /// Samples written per stripe, indexed by stripe position
    pub written: [usize; TOTAL_STRIPES],
    /// Transport problem seen during the pass; the frame was published anyway
    pub transport_error: Option<RebError>,
    /// Time spent in the pass
    pub elapsed: Duration,
}

impl AcquisitionOutcome {
    /// Total samples written across stripes.
    pub fn total_written(&self) -> usize {
        self.written.iter().sum()
    }

    /// Whether the image arrived complete and as announced.
    pub fn is_complete(&self) -> bool {
        self.transport_error.is_none()
    }
}

/// Round-robin distributor with a reusable receive buffer.
#[derive(Debug, Default)]
pub struct Demultiplexer {
    transform: SignTransform,
    scratch: Vec<u16>,
}

impl Demultiplexer {
    /// Create a demultiplexer applying `transform` to every word.
    pub fn new(transform: SignTransform) -> Self {
        Self {
            transform,
            scratch: Vec::new(),
        }
    }

    /// Transform in use.
    pub fn transform(&self) -> SignTransform {
        self.transform
    }

    /// Run one acquisition pass into `store`.
    ///
    /// Geometry and mask are validated before the lock is taken. Transport failures
    /// and count mismatches are logged, recorded in the outcome, and the frame is
    /// still marked ready with whatever arrived.
    pub fn acquire(
        &mut self,
        store: &StripeStore,
        transport: &mut dyn PixelTransport,
        geometry: Geometry,
        mask: StripeMask,
        tags: FrameTags,
    ) -> AppResult<AcquisitionOutcome> {
        if mask.is_empty() {
            return Err(RebError::Configuration(
                "Stripe mask enables no stripes".to_string(),
            ));
        }
        let expected = geometry.samples_per_stripe() * mask.count();
        let transform = self.transform;
        let scratch = &mut self.scratch;

        let outcome = store.with_lock(|state| {
            let start = Instant::now();
            state.configure(geometry, mask);

            scratch.clear();
            scratch.resize(expected, 0);

            let (received, transport_error) = match transport.receive(scratch) {
                Ok(n) if n <= 0 => (n, Some(RebError::Transport(format!(
                    "receive returned {} words",
                    n
                )))),
                Ok(n) => (n, None),
                Err(e) => (0, Some(RebError::Transport(format!("{:#}", e)))),
            };
            let announced = transport.expected_sample_count();

            let usable = usize::try_from(received).unwrap_or(0).min(expected);
            let transport_error = transport_error.or_else(|| {
                (announced != expected || usable != expected).then_some(
                    RebError::TransportMismatch {
                        expected,
                        received: announced.max(usable),
                    },
                )
            });

            let written = distribute(state, &scratch[..usable], geometry.channels, transform);
            state.complete_frame(tags);

            AcquisitionOutcome {
                expected,
                received,
                announced,
                written,
                transport_error,
                elapsed: start.elapsed(),
            }
        });
        store.notify_all();

        if let Some(err) = &outcome.transport_error {
            warn!(
                expected = outcome.expected,
                received = outcome.received,
                announced = outcome.announced,
                error = %err,
                "Unexpected image length, publishing frame as received"
            );
        }

        let secs = outcome.elapsed.as_secs_f64();
        let mbytes = (outcome.total_written() * std::mem::size_of::<u16>()) as f64 / 1.0e6;
        debug!(
            samples = outcome.total_written(),
            stripes = mask.count(),
            elapsed_ms = secs * 1e3,
            rate_mb_s = if secs > 0.0 { mbytes / secs } else { 0.0 },
            "Acquisition pass complete"
        );

        Ok(outcome)
    }
}

/// Distribute host-converted `words` round-robin over the enabled stripes.
///
/// The stripes must already be configured. Returns the number of samples written to
/// each stripe; words that would overflow a stripe are dropped.
pub fn distribute(
    state: &mut StoreState,
    words: &[u16],
    channels: u32,
    transform: SignTransform,
) -> [usize; TOTAL_STRIPES] {
    let mut written = [0usize; TOTAL_STRIPES];
    let order: Vec<StripeId> = state.mask().iter().collect();
    if order.is_empty() || channels == 0 {
        return written;
    }

    for (group, chunk) in words.chunks(channels as usize).enumerate() {
        let id = order[group % order.len()];
        let stripe = state.stripe_mut(id);
        for word in chunk {
            if stripe.push(transform.apply(u16::from_be(*word))) {
                written[id.index()] += 1;
            }
        }
    }

    written
}
