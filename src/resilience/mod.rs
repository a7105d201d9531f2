//! Network resilience: retry-with-backoff and per-host circuit breaking
//!
//! The unit of protection is one network call (manifest fetch, blob
//! fetch/put, existence check, tag-list page). The breaker registry is
//! shared across all operations a client runs against a host; it is owned
//! by the client instance, not a process-wide global.

pub mod breaker;
pub mod retry;

pub use breaker::BreakerRegistry;
pub use retry::retry_with_backoff;
