//! Thin orchestration over checkout: synchronous and asynchronous
//! (streaming) request modes (spec.md §4.E).

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::connection::{Connection, Part};
use crate::error::PoolError;
use crate::pool::{Pool, RequestOptions};
use crate::telemetry;

/// Checkout a worker, drive one request/response exchange, and return the
/// connection to the pool.
///
/// `fold` is invoked for each response part in protocol order and returns
/// the next accumulator, matching the codec's streaming contract
/// (spec.md §4.A, §GLOSSARY "Fold"). Returning [`ControlFlow::Break`] halts
/// the exchange early; the connection still checks back in normally.
pub async fn request<C, Acc, F>(
    pool: &Pool<C>,
    req: C::Request,
    acc: Acc,
    fold: F,
    opts: RequestOptions,
) -> Result<Acc, PoolError<C::Error>>
where
    C: Connection,
    Acc: Send + 'static,
    F: FnMut(Part<C::Data>, Acc) -> ControlFlow<Acc, Acc> + Send + 'static,
{
    telemetry::emit_queue_start(pool.origin());

    let checkout_start = Instant::now();
    let (kind, maybe_conn, worker_idle_time) = pool.checkout(opts.pool_timeout).await?;
    // Queue-wait latency: how long this caller waited for a slot. Recorded
    // in the metrics block and telemetry as "checkout" time. Distinct from
    // `worker_idle_time`, the connection's own staleness since its last
    // checkin (zero for a fresh dial), which is what gets passed into
    // `Conn.request` below (spec.md §4.C).
    let checkout_wait = checkout_start.elapsed();
    let reused = matches!(kind, crate::worker::CheckoutKind::Reuse);
    telemetry::emit_queue_stop(pool.origin(), checkout_wait, reused);

    let mut conn = match maybe_conn {
        Some(conn) => conn,
        None => match crate::worker::dial(pool.origin(), pool.conn_opts()).await {
            Ok(conn) => conn,
            Err(e) => {
                pool.release_failed_fresh().await;
                pool.record_timing(checkout_wait, None);
                telemetry::emit_queue_exception(pool.origin(), "connect_error", &e.to_string());
                return Err(PoolError::Transport(e));
            }
        },
    };

    let usage_start = Instant::now();
    let result = conn
        .request(req, acc, fold, opts.receive_timeout, worker_idle_time)
        .await;
    let usage_time = usage_start.elapsed();
    pool.record_timing(checkout_wait, Some(usage_time));

    match result {
        Ok(acc) => {
            pool.checkin(conn).await;
            Ok(acc)
        }
        Err(e) => {
            telemetry::emit_queue_exception(pool.origin(), "transport_error", &e.to_string());
            pool.checkin(conn).await;
            Err(PoolError::Transport(e))
        }
    }
}

/// Delivered to the caller of [`async_request`] as parts stream in.
#[derive(Debug)]
pub enum StreamEvent<D> {
    Part(Part<D>),
    Done,
    Error(String),
}

/// Handle used to cancel an in-flight [`async_request`].
///
/// Cancellation is cooperative, per spec.md §4.E/§9: setting the flag is
/// observed by the driver's fold at its next part delivery (the
/// suspension point named in spec.md §5), which halts the exchange via
/// [`std::ops::ControlFlow::Break`] and lets `request` check the connection
/// back in through the normal checkin path — never by aborting the task
/// that owns the connection, which would drop it mid-exchange and leak the
/// slot out of `in_use` forever.
pub struct AsyncRequestToken {
    cancelled: Arc<AtomicBool>,
}

impl AsyncRequestToken {
    pub fn cancel_async_request(self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Spawn a driver task that streams one request's response parts to the
/// returned channel, without buffering the whole response in memory
/// (spec.md §4.E).
pub fn async_request<C>(
    pool: Pool<C>,
    req: C::Request,
    opts: RequestOptions,
) -> (AsyncRequestToken, mpsc::UnboundedReceiver<StreamEvent<C::Data>>)
where
    C: Connection,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let cancelled = Arc::new(AtomicBool::new(false));
    let cancelled_for_task = cancelled.clone();

    tokio::spawn(async move {
        let tx_for_fold = tx.clone();
        let cancelled_for_fold = cancelled_for_task.clone();

        // Checked at every part delivery, the suspension point spec.md §5
        // requires cancellation to be observable at. Breaking here lets
        // `request` unwind through its normal checkin path instead of the
        // task being torn down mid-exchange.
        let fold = move |part: Part<C::Data>, _acc: ()| {
            if cancelled_for_fold.load(Ordering::Acquire) {
                return ControlFlow::Break(());
            }
            let _ = tx_for_fold.send(StreamEvent::Part(part));
            ControlFlow::Continue(())
        };

        if cancelled_for_task.load(Ordering::Acquire) {
            return;
        }

        match request(&pool, req, (), fold, opts).await {
            Ok(()) => {
                if !cancelled_for_task.load(Ordering::Acquire) {
                    let _ = tx.send(StreamEvent::Done);
                }
            }
            Err(e) => {
                let _ = tx.send(StreamEvent::Error(e.to_string()));
            }
        }
    });

    (AsyncRequestToken { cancelled }, rx)
}
