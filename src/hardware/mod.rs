//! Board hardware seams.
//!
//! The register link and the pixel transport live outside this crate. This module
//! defines the capability traits the pipeline needs from them and ships
//! deterministic doubles for tests and simulation.

pub mod capabilities;
pub mod mock;

pub use capabilities::{PixelTransport, RegisterLink, STRIPE_ADDR};
pub use mock::{MockRegisterLink, MockTransport};
