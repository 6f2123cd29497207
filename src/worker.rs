//! Per-worker lifecycle: dial-on-demand, the reuse/evict decision at
//! checkout, checkin bookkeeping, and unsolicited-message dispatch
//! (spec.md §4.C).

use std::time::{Duration, Instant};

use crate::connection::{Connection, DiscardOutcome, Mode};
use crate::origin::Origin;
use crate::telemetry;

/// Whether a checked-out connection was newly dialed or drawn from the
/// idle set — used for `Pooled`-style reporting and telemetry, not for any
/// ownership transfer (see DESIGN.md).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckoutKind {
    Fresh,
    Reuse,
}

/// A connection sitting idle in a pool's idle deque.
pub(crate) struct IdleWorker<C> {
    pub(crate) conn: C,
    pub(crate) idle_since: Instant,
}

impl<C: Connection> IdleWorker<C> {
    pub(crate) fn new(conn: C) -> Self {
        IdleWorker {
            conn,
            idle_since: Instant::now(),
        }
    }

    /// Decide whether this idle worker can be reused right now. On success
    /// the connection is switched to passive mode and handed back together
    /// with its own staleness (time since last checkin) — distinct from the
    /// caller's queue-wait latency, and what gets passed to
    /// [`Connection::request`](crate::connection::Connection::request) as
    /// its `idle_time` argument. On rejection the idle-expiry telemetry is
    /// emitted and the caller is expected to close and drop the connection.
    pub(crate) fn try_checkout(mut self, origin: &Origin) -> Result<(C, Duration), C> {
        let idle_time = self.idle_since.elapsed();
        if self.conn.is_open() && self.conn.reusable(idle_time) {
            self.conn.set_mode(Mode::Passive);
            Ok((self.conn, idle_time))
        } else {
            telemetry::emit_conn_max_idle_time_exceeded(origin, idle_time);
            Err(self.conn)
        }
    }
}

/// Dial a fresh connection in the caller's context, per spec.md §4.C's
/// "Checkout (Uninitialized)" transition.
pub(crate) async fn dial<C: Connection>(
    origin: &Origin,
    opts: &crate::connection::ConnOpts,
) -> Result<C, C::Error> {
    C::connect(origin, opts).await
}

/// Checkin (`InUse -> Idle`): the caller is done with the connection. If it
/// is still open, it becomes a fresh idle worker; otherwise it is evicted.
pub(crate) fn checkin<C: Connection>(mut conn: C) -> Option<IdleWorker<C>> {
    if !conn.is_open() {
        return None;
    }
    conn.set_mode(Mode::Active);
    Some(IdleWorker::new(conn))
}

/// Idempotent, tolerant-to-already-closed eviction.
pub(crate) fn evict<C: Connection>(mut conn: C) {
    conn.close();
}

/// Dispatch an unsolicited signal observed on an idle connection.
pub(crate) fn on_unsolicited<C: Connection>(conn: &mut C, signal: &str) -> DiscardOutcome {
    conn.discard(signal)
}
