//! Stripe model shared by the acquisition, broadcast and persistence paths.
//!
//! A REB reads out up to three stripes (left, middle, right) of one sensor. Each
//! stripe is digitised by [`CHANNELS`] amplifiers whose samples arrive interleaved.
//!
//! # Memory Layout
//!
//! A stripe buffer holds `height * width * channels` samples in capture order:
//!
//! ```text
//! [c0 c1 .. c15][c0 c1 .. c15] ...   one group of `channels` samples per pixel position
//! ```
//!
//! The buffer is allocated once and reused; `length` says how much of it the last
//! acquisition pass filled.

use crate::error::{AppResult, RebError};

/// Number of stripes one board can read out.
pub const TOTAL_STRIPES: usize = 3;

/// Default ADC channels per stripe.
pub const CHANNELS: u32 = 16;

/// Position of a stripe on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StripeId {
    /// Stripe A
    Left,
    /// Stripe B
    Middle,
    /// Stripe C
    Right,
}

impl StripeId {
    /// All stripes in increasing index order.
    pub const ALL: [StripeId; TOTAL_STRIPES] = [StripeId::Left, StripeId::Middle, StripeId::Right];

    /// Stripe for a zero-based index.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Zero-based index (0..=2).
    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit in the stripe enable mask.
    pub fn mask_bit(self) -> u32 {
        1 << self.index()
    }

    /// Upper-case letter used as broadcast topic (`'A' + index`).
    pub fn letter(self) -> u8 {
        b'A' + self.index() as u8
    }

    /// Lower-case letter used in output file names.
    pub fn file_letter(self) -> char {
        char::from(b'a' + self.index() as u8)
    }
}

impl std::fmt::Display for StripeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", char::from(self.letter()))
    }
}

/// Set of enabled stripes, as read from the board's stripe register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StripeMask(u32);

impl StripeMask {
    /// Left stripe bit
    pub const LEFT: u32 = 0x1;
    /// Middle stripe bit
    pub const MIDDLE: u32 = 0x2;
    /// Right stripe bit
    pub const RIGHT: u32 = 0x4;
    /// All valid bits
    pub const ALL_BITS: u32 = Self::LEFT | Self::MIDDLE | Self::RIGHT;

    /// Build a mask, rejecting empty masks and unknown bits.
    pub fn new(bits: u32) -> AppResult<Self> {
        if bits & !Self::ALL_BITS != 0 {
            return Err(RebError::Configuration(format!(
                "Stripe mask 0x{:x} has bits outside 0x{:x}",
                bits,
                Self::ALL_BITS
            )));
        }
        if bits == 0 {
            return Err(RebError::Configuration(
                "Stripe mask enables no stripes".to_string(),
            ));
        }
        Ok(Self(bits))
    }

    /// Build a mask from register contents, ignoring bits above the stripe field.
    pub fn from_register(value: u32) -> Self {
        Self(value & Self::ALL_BITS)
    }

    /// Raw bits
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether `stripe` is enabled.
    pub fn contains(self, stripe: StripeId) -> bool {
        self.0 & stripe.mask_bit() != 0
    }

    /// Enabled stripes in increasing index order.
    pub fn iter(self) -> impl Iterator<Item = StripeId> {
        StripeId::ALL.into_iter().filter(move |s| self.contains(*s))
    }

    /// Number of enabled stripes.
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether no stripe is enabled.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Per-frame readout geometry of one stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Rows per channel image
    pub height: u32,
    /// Columns per channel image
    pub width: u32,
    /// Interleaved amplifier channels
    pub channels: u32,
}

impl Geometry {
    /// Validate and build a geometry.
    pub fn new(height: u32, width: u32, channels: u32) -> AppResult<Self> {
        if height == 0 || width == 0 {
            return Err(RebError::Configuration(format!(
                "Invalid geometry {}x{}: both dimensions must be non-zero",
                height, width
            )));
        }
        if channels == 0 || channels % 2 != 0 {
            return Err(RebError::Configuration(format!(
                "Invalid channel count {}: must be a positive even number",
                channels
            )));
        }
        (height as usize)
            .checked_mul(width as usize)
            .and_then(|n| n.checked_mul(channels as usize))
            .ok_or_else(|| {
                RebError::Configuration(format!(
                    "Geometry {}x{}x{} overflows the address space",
                    height, width, channels
                ))
            })?;
        Ok(Self {
            height,
            width,
            channels,
        })
    }

    /// Pixels in one channel image.
    pub fn pixels_per_channel(&self) -> usize {
        self.height as usize * self.width as usize
    }

    /// Samples in one full stripe (all channels).
    pub fn samples_per_stripe(&self) -> usize {
        self.pixels_per_channel() * self.channels as usize
    }
}

/// Opaque correlation identifiers attached to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameTags {
    /// Acquisition tag
    pub tag: u64,
    /// Cluster id
    pub cluster: u32,
    /// Board address
    pub address: u32,
}

/// One spatial region of the sensor and its sample buffer.
#[derive(Debug)]
pub struct Stripe {
    id: StripeId,
    pub(crate) enabled: bool,
    /// Position among enabled stripes, in round-robin write order
    pub(crate) order: usize,
    pub(crate) buffer: Vec<u32>,
    pub(crate) length: usize,
    pub(crate) height: u32,
    pub(crate) width: u32,
    pub(crate) channels: u32,
    pub(crate) tags: FrameTags,
}

impl Stripe {
    pub(crate) fn new(id: StripeId) -> Self {
        Self {
            id,
            enabled: false,
            order: 0,
            buffer: Vec::new(),
            length: 0,
            height: 0,
            width: 0,
            channels: CHANNELS,
            tags: FrameTags::default(),
        }
    }

    /// Board position of this stripe.
    pub fn id(&self) -> StripeId {
        self.id
    }

    /// Whether the stripe takes part in the current acquisition.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Position among enabled stripes.
    pub fn order(&self) -> usize {
        self.order
    }

    /// Valid samples, in capture order.
    pub fn samples(&self) -> &[u32] {
        &self.buffer[..self.length]
    }

    /// Number of valid samples.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether no samples have been written since the last configure.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Allocated capacity in samples.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Geometry of the current frame.
    pub fn geometry(&self) -> Geometry {
        Geometry {
            height: self.height,
            width: self.width,
            channels: self.channels,
        }
    }

    /// Correlation identifiers of the current frame.
    pub fn tags(&self) -> FrameTags {
        self.tags
    }

    /// Append one sample at the current write offset.
    ///
    /// Returns `false` without writing when the buffer is full or the stripe is
    /// disabled.
    #[inline]
    pub(crate) fn push(&mut self, sample: u32) -> bool {
        if !self.enabled || self.length >= self.buffer.len() {
            return false;
        }
        self.buffer[self.length] = sample;
        self.length += 1;
        true
    }
}
