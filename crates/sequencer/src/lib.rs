//! Reorders LCEVC enhancement buffers into presentation order.
//!
//! Enhancement data arrives in decode order, keyed only by presentation
//! timestamp; there is no decode-timestamp side channel. The container keeps
//! buffers sorted by timestamp and uses a [`TimestampPredictor`] that learns
//! the inter-frame timestamp delta on the fly to decide when the head of the
//! queue really is the next frame to present.
#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(unsafe_code)]

mod container;
mod predictor;

pub use self::container::{LcevcContainer, StampedBuffer};
pub use self::predictor::TimestampPredictor;

/// Presentation timestamp. Opaque to this crate beyond equality and unsigned
/// ordering.
pub type Timestamp = u64;

/// Sentinel for "no timestamp known".
pub const INVALID_TIMESTAMP: Timestamp = u64::MAX;
