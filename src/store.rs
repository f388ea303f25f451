//! Stripe Buffer Store: the single piece of state shared between threads.
//!
//! The store owns the three [`Stripe`]s and the frame-ready flag behind one
//! `parking_lot::Mutex`. There is no other synchronisation primitive in the
//! pipeline:
//!
//! - The acquisition pass holds the lock for the whole receive-and-transform pass.
//! - The broadcast publisher holds it while it emits every enabled stripe.
//! - Each FITS writer holds it while it copies its stripe out of the buffer.
//!
//! All access goes through closures or guards, so the lock is released on every exit
//! path, including early returns and panics inside the closure.
//!
//! A `Condvar` paired with the mutex wakes the publisher on the ready transition
//! instead of having it poll.

use crate::error::AppResult;
use crate::stripe::{FrameTags, Geometry, Stripe, StripeId, StripeMask, TOTAL_STRIPES};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Contents guarded by the store mutex.
#[derive(Debug)]
pub struct StoreState {
    stripes: [Stripe; TOTAL_STRIPES],
    frame_ready: bool,
    mask: StripeMask,
    frames_completed: u64,
}

impl StoreState {
    fn new() -> Self {
        Self {
            stripes: StripeId::ALL.map(Stripe::new),
            frame_ready: false,
            mask: StripeMask::default(),
            frames_completed: 0,
        }
    }

    /// All stripes in index order, enabled or not.
    pub fn stripes(&self) -> &[Stripe; TOTAL_STRIPES] {
        &self.stripes
    }

    /// One stripe by position.
    pub fn stripe(&self, id: StripeId) -> &Stripe {
        &self.stripes[id.index()]
    }

    /// Enabled stripes in increasing index order.
    pub fn enabled(&self) -> impl Iterator<Item = &Stripe> {
        self.stripes.iter().filter(|s| s.is_enabled())
    }

    /// Mask applied by the last `configure`.
    pub fn mask(&self) -> StripeMask {
        self.mask
    }

    /// Whether a complete, unconsumed frame is waiting for broadcast.
    pub fn frame_ready(&self) -> bool {
        self.frame_ready
    }

    /// Acquisition passes completed since the store was created.
    pub fn frames_completed(&self) -> u64 {
        self.frames_completed
    }

    pub(crate) fn stripe_mut(&mut self, id: StripeId) -> &mut Stripe {
        &mut self.stripes[id.index()]
    }

    /// Reset every stripe for a new frame of `geometry` with `mask` enabled.
    ///
    /// Buffers are allocated on first use and reallocated only when the required
    /// capacity changes. Disabled stripes keep their allocation but lose their data.
    pub(crate) fn configure(&mut self, geometry: Geometry, mask: StripeMask) {
        let required = geometry.samples_per_stripe();
        let mut order = 0;

        for stripe in self.stripes.iter_mut() {
            stripe.enabled = mask.contains(stripe.id());
            stripe.length = 0;

            if !stripe.enabled {
                continue;
            }

            if stripe.buffer.len() != required {
                debug!(
                    stripe = %stripe.id(),
                    old_capacity = stripe.buffer.len(),
                    new_capacity = required,
                    "Allocating stripe buffer"
                );
                stripe.buffer = vec![0; required];
            }

            stripe.order = order;
            stripe.height = geometry.height;
            stripe.width = geometry.width;
            stripe.channels = geometry.channels;
            order += 1;
        }

        self.mask = mask;
    }

    /// Stamp the correlation ids on every enabled stripe and raise the ready flag.
    pub(crate) fn complete_frame(&mut self, tags: FrameTags) {
        for stripe in self.stripes.iter_mut().filter(|s| s.enabled) {
            stripe.tags = tags;
        }
        self.frame_ready = true;
        self.frames_completed += 1;
    }

    /// Clear the ready flag, returning its previous value.
    pub(crate) fn take_ready(&mut self) -> bool {
        std::mem::replace(&mut self.frame_ready, false)
    }
}

/// Owner of the stripe buffers and the frame-ready flag.
#[derive(Debug)]
pub struct StripeStore {
    state: Mutex<StoreState>,
    ready: Condvar,
}

impl Default for StripeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StripeStore {
    /// Create an empty store. No buffer is allocated until the first `configure`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::new()),
            ready: Condvar::new(),
        }
    }

    /// Prepare all stripes for a frame.
    ///
    /// Geometry and mask are validated by their constructors, so nothing here can
    /// fail after the lock is taken.
    pub fn configure(&self, height: u32, width: u32, channels: u32, mask: u32) -> AppResult<()> {
        let geometry = Geometry::new(height, width, channels)?;
        let mask = StripeMask::new(mask)?;
        self.with_lock(|state| state.configure(geometry, mask));
        Ok(())
    }

    /// Run `f` with the store locked.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut guard = self.state.lock();
        f(&mut guard)
    }

    /// Atomically read and clear the ready flag.
    pub fn snapshot_and_clear(&self) -> bool {
        self.state.lock().take_ready()
    }

    /// Wake threads blocked in [`wait_ready`](Self::wait_ready).
    ///
    /// Called after a frame completes and when the publisher is asked to stop.
    pub fn notify_all(&self) {
        self.ready.notify_all();
    }

    /// Block until a frame is ready or `timeout` elapses.
    ///
    /// Returns the locked state either way; the caller checks
    /// [`StoreState::frame_ready`] and keeps the lock for as long as it reads stripes.
    pub fn wait_ready(&self, timeout: Duration) -> MutexGuard<'_, StoreState> {
        let mut guard = self.state.lock();
        if !guard.frame_ready {
            // Spurious wakeups are fine: the caller re-checks the flag
            let _ = self.ready.wait_for(&mut guard, timeout);
        }
        guard
    }
}
