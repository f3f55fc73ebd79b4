//! `remitsync-remote`: everything that stands between the pipeline and the
//! remote ledger service.
//!
//! ## Components
//!
//! - `LedgerApi`: the operations the pipeline needs from the remote side
//! - `RateLimiter`: process-wide sliding-window cap on outbound calls
//! - `CircuitBreaker`: process-wide failure-cascade protection
//! - `ThrottleRetry`: jittered backoff on "too many requests"
//! - `FlowControl`: the guarded call composing the three above
//! - `IdentityResolver`: batched identifier -> party resolution
//!
//! `RateLimiter` and `CircuitBreaker` are built once per process and shared
//! (via `Arc<FlowControl>`) by every batch, since they protect a single
//! physical endpoint.

pub mod circuit_breaker;
pub mod error;
pub mod flow;
pub mod identity;
pub mod ledger;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use error::{GuardedError, RemoteError};
pub use flow::FlowControl;
pub use identity::{IdentityResolver, Lookup, Resolution};
pub use ledger::{LedgerApi, MatchMode, PartyRecord, ReceiptDraft, ReceiptRef, ScopeContext};
pub use rate_limiter::{RateLimiter, SlidingWindow};
pub use retry::{RetryConfig, ThrottleRetry};
