//! # Relay Resilience
//!
//! Resilience patterns for the inference relay:
//! - Sliding-window rate limiting shared by every call site
//! - Exponential backoff with jitter
//! - Per-attempt timeout management
//! - The request engine tying admission, timeouts, retries and cancellation together
//! - Read-through caching with debounced invalidation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod cache;
pub mod debounce;
pub mod engine;
pub mod rate_limiter;
pub mod timeout;

// Re-export main types
pub use backoff::{sleep_or_cancel, BackoffPolicy};
pub use cache::{
    CacheConfig, CacheEvent, CacheLookupResult, CacheStats, ReadThroughCache, WeakReadThroughCache,
};
pub use debounce::Debouncer;
pub use engine::{CallOptions, CallOutcome, EngineConfig, RequestEngine};
pub use rate_limiter::{RateLimitStats, RateLimiter, RateLimiterConfig};
pub use timeout::{TimeoutConfig, TimeoutManager};
