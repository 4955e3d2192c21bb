//! Length-aware batch scheduling.
//!
//! Rows are grouped by a coarse length key ([`binned_length`]) so that each
//! batch draws sequences of similar size, and [`DynamicTrimmer`] then cuts the
//! shared padding off the right edge of every batch before it reaches the
//! model.

pub mod error;
pub mod length;
pub mod sampler;
pub mod trim;

pub use error::{BucketError, Result};
pub use length::{binned_length, LengthIndex, DEFAULT_GRANULARITY};
pub use sampler::{shuffled_batches, EpochBatches, LengthBucketSampler, SamplerConfig};
pub use trim::DynamicTrimmer;
