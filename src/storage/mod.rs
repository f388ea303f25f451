//! Stripe persistence.
//!
//! [`fits`] holds the file format, [`writer`] the concurrent per-stripe save.

pub mod fits;
pub mod writer;

pub use writer::{
    check_extra_keyword, AmplifierSection, FitsWriter, SaveReport, StripeImage, StripeSaveResult,
    RESERVED_KEYWORDS,
};
