//! Speculative pre-cache.
//!
//! Requests carrying a `pre-cache: <priority>` header are acknowledged at once
//! and run later on a [`PriorityTaskQueue`](crate::queue::PriorityTaskQueue).
//! Their responses are keyed by the SHA-256 of the request body. The first
//! ordinary request with the same body is served the primed response, which is
//! then evicted.
//!
//! ```toml
//! [precache]
//! enabled = true
//! store = "memory"   # or "disk"
//! directory = "precache-store"
//! max_entries = 1024
//! ```

mod config;
mod keys;
mod layer;
mod store;

pub use self::config::{PreCacheConfig, StoreKind};
pub use keys::{PrimeMarker, content_hash, prime_marker};
pub use layer::{PreCache, PreCacheStats, PrimeError};
pub use store::{DiskStore, MemoryStore, ResponseStore, StoreError};

pub(crate) const METRIC_HIT: &str = "precache_hit_total";
pub(crate) const METRIC_MISS: &str = "precache_miss_total";
pub(crate) const METRIC_PRIME_ACCEPTED: &str = "precache_prime_accepted_total";
pub(crate) const METRIC_PRIME_DUPLICATE: &str = "precache_prime_duplicate_total";
pub(crate) const METRIC_PRIME_FAILED: &str = "precache_prime_failed_total";
pub(crate) const METRIC_STORE_ERROR: &str = "precache_store_error_total";
