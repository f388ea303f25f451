//! Stripe broadcast over ZeroMQ publish/subscribe.
//!
//! - [`protocol`]: message sequence, metadata record and sample packing
//! - [`publisher`]: background thread publishing every ready frame
//! - [`subscriber`]: reassembly of stripes on the receiving side

pub mod protocol;
pub mod publisher;
pub mod subscriber;

pub use protocol::{emit_frame, emit_stripe, FrameInfo, MemorySink, MessageSink, CHUNK_SAMPLES};
pub use publisher::{Publisher, PublisherSettings, PublisherStats, RendezvousSettings};
pub use subscriber::{ReceivedStripe, StripeAssembler, Subscriber};
