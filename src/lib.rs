//! A per-host HTTP/1.x connection pool with a lock-free metrics block.
//!
//! This crate multiplexes concurrent callers over a bounded set of
//! long-lived connections to a single origin. It does not speak HTTP
//! itself — the wire codec, TLS, and name resolution are external
//! collaborators behind the [`Connection`](connection::Connection) trait.
//!
//! - [`pool::Pool`] owns the bounded worker set and checkout/checkin
//!   scheduling.
//! - [`driver::request`]/[`driver::async_request`] drive one exchange
//!   (synchronously, or streamed to a channel with cancellation).
//! - [`metrics`] is the lock-free counter block plus its process-wide
//!   registry and deadline-bounded reset.

pub mod connection;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod origin;
pub mod pool;
mod telemetry;
mod worker;

#[cfg(test)]
mod test_support;

pub use connection::{Connection, ConnOpts, DiscardOutcome, Mode, Part};
pub use driver::{async_request, request, AsyncRequestToken, StreamEvent};
pub use error::PoolError;
pub use metrics::{get_pool_status, reset_metrics, MetricsStatus, ResetTimeout};
pub use origin::{Origin, Scheme};
pub use pool::{IdleLimit, Pool, PoolConfig, RequestOptions};
pub use worker::CheckoutKind;
