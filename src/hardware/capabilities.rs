//! Board Capabilities
//!
//! The readout pipeline talks to hardware through two small capability traits
//! instead of a monolithic board driver:
//!
//! - [`RegisterLink`]: register read/write used for configuration
//! - [`PixelTransport`]: the raw ADC word stream of one acquisition
//!
//! Both are implemented elsewhere for real boards. Keeping them this small means
//! every pipeline component can be exercised against the deterministic doubles in
//! [`crate::hardware::mock`].
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is blocking (acquisition runs on the caller's thread, not a runtime)
//! - Is thread-safe (requires Send)
//! - Uses anyhow::Result for errors; the device wraps them in `RebError`
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! fn enabled_stripes(link: &dyn RegisterLink) -> Result<StripeMask> {
//!     let value = link.read(STRIPE_ADDR)?;
//!     Ok(StripeMask::from_register(value))
//! }
//! ```

use anyhow::Result;

/// Register holding the stripe enable bits (left=0x1, middle=0x2, right=0x4).
pub const STRIPE_ADDR: u32 = 0x40_0007;

/// Capability: Register Access
///
/// The configuration link to the board's register server.
///
/// # Contract
/// - `read` returns the 32-bit register contents
/// - `write` returns once the board acknowledged the write
/// - Errors carry a human readable reason from the link
pub trait RegisterLink: Send {
    /// Read one register.
    fn read(&self, address: u32) -> Result<u32>;

    /// Write one register.
    fn write(&self, address: u32, value: u32) -> Result<()>;
}

/// Capability: Raw Pixel Stream
///
/// Delivers the 16-bit ADC words of one acquisition, channel-interleaved and in
/// network byte order, exactly as they came off the wire.
///
/// # Contract
/// - Opening is done by each implementation's constructor `(device_id, interface)`
/// - `receive` blocks until one image has arrived and returns the number of words
///   written into `out`; a non-positive value means nothing usable arrived
/// - `expected_sample_count` is the word count the board announced for the last
///   image, which may disagree with what `receive` returned
pub trait PixelTransport: Send {
    /// Block until one image is received.
    fn receive(&mut self, out: &mut [u16]) -> Result<isize>;

    /// Word count announced by the board for the last image.
    fn expected_sample_count(&self) -> usize;
}

impl<T: RegisterLink + Sync> RegisterLink for std::sync::Arc<T> {
    fn read(&self, address: u32) -> Result<u32> {
        (**self).read(address)
    }

    fn write(&self, address: u32, value: u32) -> Result<()> {
        (**self).write(address, value)
    }
}
