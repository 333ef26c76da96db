//! Various driver internals which need to be exported for benchmarking.
//!
//! Included if using the `"internals"` feature flag.
//! You should not and/or cannot use these as part of a normal application.

pub use super::{
    crypto::{CryptoState, SecretKey},
    packet::{open, seal},
    tasks::combine::SpeakerQueues,
};
