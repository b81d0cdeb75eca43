//! Reliability policies shared by the workers and the stream client.
//!
//! ```text
//! enrichment call → [RateLimiter] → [Transport]
//! block fetch     → [RetryPolicy (fixed)] → [Transport]
//! reconnect       → [RetryPolicy (exponential, unbounded)] → connect
//! ```

pub mod rate_limiter;
pub mod retry;

pub use rate_limiter::{RateLimiter, RateLimiterConfig, TokenBucket};
pub use retry::{RetryConfig, RetryPolicy};
