pub mod client;
pub mod continuity;
pub mod normalize;
pub mod provider;

pub use client::{FeedClient, RetryPolicy};
pub use continuity::{ContinuityEngine, FetchMode, FetchOutcome};
pub use normalize::Normalizer;
pub use provider::{FeedError, SpinFeed};
