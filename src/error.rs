use std::time::Duration;

/// Errors surfaced to a caller of [`crate::driver::request`] or
/// [`crate::Pool`]'s metrics accessors.
///
/// `IdleExpired` and `Cancelled` from the design's error taxonomy are
/// deliberately absent here: both are absorbed internally (idle expiry
/// drives an evict-and-retry loop inside checkout; cancellation is observed
/// by the async driver and never reported back to anyone).
#[derive(Debug, thiserror::Error)]
pub enum PoolError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Checkout did not find or dial a usable connection before
    /// `pool_timeout` elapsed.
    #[error(
        "timed out after {0:?} waiting for an available connection; \
         consider raising pool_size or pool_timeout"
    )]
    PoolTimeout(Duration),

    /// The codec reported a failure mid-exchange.
    #[error(transparent)]
    Transport(#[from] E),

    /// `get_pool_status`/`reset_metrics` addressed an origin with no
    /// registered metrics block.
    #[error("no metrics registered for this name/origin")]
    MetricsNotFound,

    /// `reset` could not quiesce the timing-set writers before its deadline.
    #[error("metrics reset timed out waiting for in-flight writers to quiesce")]
    ResetTimeout,
}
