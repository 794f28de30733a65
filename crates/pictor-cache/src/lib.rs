//! Pictor Generation Cache
//!
//! Content-addressed store from request [`Fingerprint`](pictor_artifact::Fingerprint)
//! to validated image, bounded by total image size with least-recently-used
//! eviction. The total size never exceeds the budget after a store returns.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod cache;
mod error;

pub use cache::{CacheConfig, CacheEntry, CacheStats, CachedImage, GenerationCache, StoreOutcome};
pub use error::CacheError;
