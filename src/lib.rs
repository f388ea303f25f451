//! # REB GigE Readout Library
//!
//! This crate reads out a REB (readout electronics board) over GigE: raw ADC words
//! come in, are split per stripe, broadcast to subscribers over ZeroMQ and, on
//! request, written to FITS files.
//!
//! ## Data Flow
//!
//! ```text
//! PixelTransport ──► demux ──► StripeStore ──┬──► broadcast::Publisher ──► PUB (tcp + ipc)
//!                     (lock held)            │       (condvar wakeup)
//!                                            └──► storage::FitsWriter ──► <base>.<id><a|b|c>.fits
//!                                                    (one thread per stripe)
//! ```
//!
//! ## Crate Structure
//!
//! - **`config`**: Strongly typed `RebConfig`, loaded with figment from TOML and `REB_`
//!   environment variables.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: The crate-wide `RebError` enum and `AppResult` alias.
//! - **`hardware`**: Capability traits for the register link and pixel transport, plus
//!   mock implementations.
//! - **`stripe`**: Stripe ids, enable masks, geometry and the per-stripe buffer.
//! - **`store`**: The mutex-guarded stripe buffer store shared by all threads.
//! - **`demux`**: Round-robin channel demultiplexer and sample transforms.
//! - **`broadcast`**: Wire protocol, publisher thread and subscriber-side reassembly.
//! - **`storage`**: FITS encoding and the concurrent per-stripe writer.
//! - **`device`**: `RebDevice`, the facade a caller drives.

pub mod broadcast;
pub mod config;
pub mod demux;
pub mod device;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod storage;
pub mod store;
pub mod stripe;

pub use device::RebDevice;
pub use error::{AppResult, RebError};
