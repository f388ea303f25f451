//! Mock Hardware Implementations
//!
//! Provides simulated board links for testing without a REB on the network.
//! Both mocks are cheap to clone: clones share state, so a test can keep one
//! handle while the device owns the other and still script or inspect it.
//!
//! # Available Mocks
//!
//! - `MockRegisterLink` - In-memory register map with per-address fault injection
//! - `MockTransport` - Scripted pixel stream (ramp or fixed codes, short reads, failures)

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::hardware::capabilities::{PixelTransport, RegisterLink, STRIPE_ADDR};

// =============================================================================
// MockRegisterLink - Simulated Register Server
// =============================================================================

/// Mock register link backed by a map
///
/// Unwritten registers read as zero. Addresses marked with
/// [`fail_address`](Self::fail_address) fail both reads and writes.
///
/// # Example
///
/// ```rust,ignore
/// let link = MockRegisterLink::with_stripes(0x5);
/// assert_eq!(link.read(STRIPE_ADDR)?, 0x5);
/// ```
#[derive(Clone, Default)]
pub struct MockRegisterLink {
    registers: Arc<Mutex<HashMap<u32, u32>>>,
    failing: Arc<Mutex<HashSet<u32>>>,
}

impl MockRegisterLink {
    /// Create an empty register map
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a register map whose stripe register enables `mask`
    pub fn with_stripes(mask: u32) -> Self {
        let link = Self::new();
        link.registers.lock().insert(STRIPE_ADDR, mask);
        link
    }

    /// Make every access to `address` fail
    pub fn fail_address(&self, address: u32) {
        self.failing.lock().insert(address);
    }

    /// Current value of a register without going through the link
    pub fn peek(&self, address: u32) -> Option<u32> {
        self.registers.lock().get(&address).copied()
    }
}

impl RegisterLink for MockRegisterLink {
    fn read(&self, address: u32) -> Result<u32> {
        if self.failing.lock().contains(&address) {
            return Err(anyhow!("MockRegisterLink: read timeout at 0x{:06x}", address));
        }
        let value = self.peek(address).unwrap_or(0);
        trace!(address, value, "MockRegisterLink read");
        Ok(value)
    }

    fn write(&self, address: u32, value: u32) -> Result<()> {
        if self.failing.lock().contains(&address) {
            return Err(anyhow!("MockRegisterLink: write rejected at 0x{:06x}", address));
        }
        trace!(address, value, "MockRegisterLink write");
        self.registers.lock().insert(address, value);
        Ok(())
    }
}

// =============================================================================
// MockTransport - Simulated Pixel Stream
// =============================================================================

#[derive(Debug, Default)]
struct TransportScript {
    /// Fixed host-order codes returned by every receive; ramp pattern when None
    codes: Option<Vec<u16>>,
    /// Words dropped from the end of every image
    short_by: usize,
    /// Overrides the announced word count
    announce: Option<usize>,
    /// Pending non-positive returns
    failures: usize,
    /// Pending hard errors
    errors: usize,
    readout_delay: Duration,
    announced: usize,
    receives: u64,
}

/// Mock pixel transport
///
/// Fills the caller's buffer with a ramp (`word i of image n = (n + i) mod 65536`)
/// unless fixed codes were loaded. Words are stored in network byte order like the
/// real transport delivers them.
///
/// # Example
///
/// ```rust,ignore
/// let transport = MockTransport::open(0, "eth0");
/// transport.load_codes(vec![1, 2, 3, 4]);
/// transport.shorten_by(1); // next images lose one word
/// ```
#[derive(Clone)]
pub struct MockTransport {
    device_id: u32,
    interface: String,
    script: Arc<Mutex<TransportScript>>,
}

impl MockTransport {
    /// Open a simulated stream for `device_id` on `interface`
    pub fn open(device_id: u32, interface: &str) -> Self {
        Self {
            device_id,
            interface: interface.to_string(),
            script: Arc::new(Mutex::new(TransportScript::default())),
        }
    }

    /// Board id this stream was opened for
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Interface this stream was opened on
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Return these host-order codes from every subsequent receive
    pub fn load_codes(&self, codes: Vec<u16>) {
        self.script.lock().codes = Some(codes);
    }

    /// Drop `words` from the end of every subsequent image
    pub fn shorten_by(&self, words: usize) {
        self.script.lock().short_by = words;
    }

    /// Announce `count` words regardless of what is delivered
    pub fn announce(&self, count: Option<usize>) {
        self.script.lock().announce = count;
    }

    /// Make the next `count` receives return zero words
    pub fn fail_next(&self, count: usize) {
        self.script.lock().failures = count;
    }

    /// Make the next `count` receives return an error
    pub fn error_next(&self, count: usize) {
        self.script.lock().errors = count;
    }

    /// Simulated time between start of receive and the image arriving
    pub fn set_readout_delay(&self, delay: Duration) {
        self.script.lock().readout_delay = delay;
    }

    /// Number of receive calls so far
    pub fn receives(&self) -> u64 {
        self.script.lock().receives
    }
}

impl PixelTransport for MockTransport {
    fn receive(&mut self, out: &mut [u16]) -> Result<isize> {
        let delay = {
            let mut script = self.script.lock();
            script.receives += 1;
            script.readout_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut script = self.script.lock();
        let image = script.receives - 1;

        if script.errors > 0 {
            script.errors -= 1;
            script.announced = 0;
            return Err(anyhow!("MockTransport: link down on {}", self.interface));
        }

        if script.failures > 0 {
            script.failures -= 1;
            script.announced = 0;
            return Ok(0);
        }

        let available = match &script.codes {
            Some(codes) => codes.len().min(out.len()),
            None => out.len(),
        };
        let count = available.saturating_sub(script.short_by);

        match &script.codes {
            Some(codes) => {
                for (dst, code) in out.iter_mut().zip(codes.iter()).take(count) {
                    *dst = code.to_be();
                }
            }
            None => {
                for (i, dst) in out.iter_mut().enumerate().take(count) {
                    *dst = (image.wrapping_add(i as u64) % 65_536) as u16;
                    *dst = dst.to_be();
                }
            }
        }

        script.announced = script.announce.unwrap_or(count);
        Ok(count as isize)
    }

    fn expected_sample_count(&self) -> usize {
        self.script.lock().announced
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_roundtrip() {
        let link = MockRegisterLink::new();
        assert_eq!(link.read(0x10).unwrap(), 0);
        link.write(0x10, 0xABCD).unwrap();
        assert_eq!(link.read(0x10).unwrap(), 0xABCD);
    }

    #[test]
    fn test_register_fault_injection() {
        let link = MockRegisterLink::with_stripes(0x3);
        assert_eq!(link.read(STRIPE_ADDR).unwrap(), 0x3);

        link.fail_address(STRIPE_ADDR);
        assert!(link.read(STRIPE_ADDR).is_err());
        assert!(link.write(STRIPE_ADDR, 1).is_err());
        // Value untouched by the failed write
        assert_eq!(link.peek(STRIPE_ADDR), Some(0x3));
    }

    #[test]
    fn test_clones_share_registers() {
        let link = MockRegisterLink::new();
        let handle = link.clone();
        link.write(1, 2).unwrap();
        assert_eq!(handle.peek(1), Some(2));
    }

    #[test]
    fn test_transport_ramp_is_network_order() {
        let mut transport = MockTransport::open(1, "eth1");
        let mut out = vec![0u16; 4];
        assert_eq!(transport.receive(&mut out).unwrap(), 4);
        let host: Vec<u16> = out.iter().map(|w| u16::from_be(*w)).collect();
        assert_eq!(host, vec![0, 1, 2, 3]);
        assert_eq!(transport.expected_sample_count(), 4);

        transport.receive(&mut out).unwrap();
        assert_eq!(u16::from_be(out[0]), 1, "second image starts one higher");
    }

    #[test]
    fn test_transport_short_read_and_announce() {
        let mut transport = MockTransport::open(0, "eth0");
        transport.load_codes(vec![10, 11, 12, 13]);
        transport.shorten_by(1);
        transport.announce(Some(4));

        let mut out = vec![0u16; 4];
        assert_eq!(transport.receive(&mut out).unwrap(), 3);
        assert_eq!(transport.expected_sample_count(), 4);
        assert_eq!(u16::from_be(out[2]), 12);
        assert_eq!(out[3], 0);
    }

    #[test]
    fn test_transport_failures() {
        let mut transport = MockTransport::open(0, "eth0");
        let handle = transport.clone();
        handle.fail_next(1);
        handle.error_next(1);

        let mut out = vec![0u16; 2];
        assert!(transport.receive(&mut out).is_err());
        assert_eq!(transport.receive(&mut out).unwrap(), 0);
        assert_eq!(transport.receive(&mut out).unwrap(), 2);
        assert_eq!(handle.receives(), 3);
    }
}
