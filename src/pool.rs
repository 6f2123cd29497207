//! The bounded worker set: checkout/checkin scheduling, idle and max-idle
//! policies (spec.md §4.D).

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_channel::oneshot;

use crate::connection::{Connection, ConnOpts};
use crate::error::PoolError;
use crate::metrics::{self, MetricsBlock};
use crate::origin::Origin;
use crate::telemetry;
use crate::worker::{self, CheckoutKind, IdleWorker};

/// `pool_max_idle_time`: either a fixed duration after which an
/// inactive pool may self-terminate (transient), or `Infinity` (permanent,
/// never self-terminates).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleLimit {
    Finite(Duration),
    Infinite,
}

/// Per-pool configuration (spec.md §6).
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub conn_opts: ConnOpts,
    pub pool_max_idle_time: IdleLimit,
    pub start_pool_metrics: bool,
    pub pool_idx: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            pool_size: 10,
            conn_opts: ConnOpts::default(),
            pool_max_idle_time: IdleLimit::Infinite,
            start_pool_metrics: true,
            pool_idx: 0,
        }
    }
}

/// Per-request options (spec.md §6).
#[derive(Clone, Copy, Debug)]
pub struct RequestOptions {
    pub pool_timeout: Duration,
    pub receive_timeout: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            pool_timeout: Duration::from_millis(5000),
            receive_timeout: Duration::from_millis(15000),
        }
    }
}

/// What a waiting checkout is handed once a slot becomes available.
enum Handoff<C> {
    /// A reused connection, already switched to passive mode, plus its own
    /// staleness (time since it was last checked in).
    Idle(C, Duration),
    /// A freed slot; the waiter must dial itself.
    Fresh,
}

/// Invariant: `idle.len() + in_use + uninitialized == config.pool_size`
/// whenever no checkout/checkin is mid-flight. Evicting an idle worker
/// (stale, or a fatal unsolicited signal) must increment `uninitialized` in
/// the same step, or the slot is lost for the life of the pool.
struct PoolInner<C> {
    idle: VecDeque<IdleWorker<C>>,
    waiters: VecDeque<oneshot::Sender<Handoff<C>>>,
    in_use: usize,
    uninitialized: usize,
    last_activity: Instant,
}

struct PoolShared<C> {
    name: String,
    origin: Origin,
    config: PoolConfig,
    metrics: Option<Arc<MetricsBlock>>,
    inner: tokio::sync::Mutex<PoolInner<C>>,
    reaper_drop: std::sync::Mutex<Option<oneshot::Sender<Infallible>>>,
    stopped: AtomicBool,
}

/// A bounded set of workers serving a single origin.
pub struct Pool<C> {
    shared: Arc<PoolShared<C>>,
}

impl<C> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Pool {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connection> Pool<C> {
    /// Build a new pool for `origin`, registered under `name` in the
    /// cross-host metrics registry (unless `start_pool_metrics` is false).
    /// The pool starts empty; workers are created lazily up to `pool_size`
    /// (spec.md §4.D).
    pub fn new(name: impl Into<String>, origin: Origin, config: PoolConfig) -> Self {
        let name = name.into();
        let metrics = if config.start_pool_metrics {
            Some(metrics::init(
                &name,
                &origin,
                config.pool_idx,
                config.pool_size as u64,
            ))
        } else {
            None
        };

        let inner = PoolInner {
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            in_use: 0,
            uninitialized: config.pool_size,
            last_activity: Instant::now(),
        };

        let shared = Arc::new(PoolShared {
            name,
            origin,
            config,
            metrics,
            inner: tokio::sync::Mutex::new(inner),
            reaper_drop: std::sync::Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        let pool = Pool { shared };
        pool.spawn_reaper();
        pool
    }

    pub fn origin(&self) -> &Origin {
        &self.shared.origin
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn conn_opts(&self) -> &ConnOpts {
        &self.shared.config.conn_opts
    }

    /// Current metrics readout for *this* pool instance, or `None` if
    /// metrics were disabled at construction.
    pub fn status(&self) -> Option<crate::metrics::MetricsStatus> {
        self.shared.metrics.as_ref().map(|m| m.status())
    }

    /// Whether the pool-level idle reaper has already self-terminated this
    /// pool (spec.md §4.D). A subsequent checkout still works — it simply
    /// dials everything fresh, since the reaper never restarts itself.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    fn spawn_reaper(&self) {
        let limit = match self.shared.config.pool_max_idle_time {
            IdleLimit::Finite(d) if d > Duration::ZERO => d,
            _ => return,
        };

        // No need to wake up and check more often than the limit itself.
        const MIN_CHECK: Duration = Duration::from_millis(50);
        let check_every = limit.max(MIN_CHECK);

        let (tx, mut drop_rx) = oneshot::channel::<Infallible>();
        *self.shared.reaper_drop.lock().expect("reaper_drop lock") = Some(tx);

        let weak: Weak<PoolShared<C>> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut drop_rx => return,
                    _ = tokio::time::sleep(check_every) => {}
                }

                let Some(shared) = weak.upgrade() else { return };
                let mut inner = shared.inner.lock().await;
                if inner.in_use == 0 && inner.last_activity.elapsed() >= limit {
                    while let Some(idle) = inner.idle.pop_front() {
                        worker::evict(idle.conn);
                    }
                    inner.uninitialized = shared.config.pool_size;
                    shared.stopped.store(true, Ordering::Release);
                    drop(inner);
                    telemetry::emit_pool_max_idle_time_exceeded(&shared.origin);
                    return;
                }
            }
        });
    }

    /// Reserve a slot: an idle worker (preferred), an uninitialized slot,
    /// or enqueue as a FIFO waiter. Evicted-but-expired idle workers are
    /// skipped and retried within the same call (spec.md §7, `IdleExpired`).
    ///
    /// Returns, alongside the connection (if reused), its own staleness —
    /// `Duration::ZERO` for a fresh dial, or the time since its last checkin
    /// for a reused worker. This is the `idle_time` spec.md §4.C passes into
    /// `Conn.request`, and is distinct from the caller's queue-wait latency
    /// that the driver measures around this call for metrics/telemetry.
    pub(crate) async fn checkout(
        &self,
        pool_timeout: Duration,
    ) -> Result<(CheckoutKind, Option<C>, Duration), PoolError<C::Error>> {
        self.shared.stopped.store(false, Ordering::Release);
        let deadline = Instant::now() + pool_timeout;

        loop {
            enum Step<C> {
                Reuse(C, Duration),
                Fresh,
                Wait(oneshot::Receiver<Handoff<C>>),
                Retry,
            }

            let step = {
                let mut inner = self.shared.inner.lock().await;
                inner.last_activity = Instant::now();

                if let Some(idle) = inner.idle.pop_front() {
                    match idle.try_checkout(&self.shared.origin) {
                        Ok((conn, worker_idle_time)) => {
                            inner.in_use += 1;
                            if let Some(m) = &self.shared.metrics {
                                m.add_in_use(1);
                            }
                            Step::Reuse(conn, worker_idle_time)
                        }
                        Err(conn) => {
                            worker::evict(conn);
                            // The idle worker is gone; its slot isn't lost,
                            // just no longer backed by a live connection.
                            inner.uninitialized += 1;
                            Step::Retry
                        }
                    }
                } else if inner.uninitialized > 0 {
                    inner.uninitialized -= 1;
                    inner.in_use += 1;
                    if let Some(m) = &self.shared.metrics {
                        m.add_in_use(1);
                    }
                    Step::Fresh
                } else {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push_back(tx);
                    Step::Wait(rx)
                }
            };

            match step {
                Step::Reuse(conn, worker_idle_time) => {
                    return Ok((CheckoutKind::Reuse, Some(conn), worker_idle_time))
                }
                Step::Fresh => return Ok((CheckoutKind::Fresh, None, Duration::ZERO)),
                Step::Retry => {
                    if Instant::now() >= deadline {
                        return Err(PoolError::PoolTimeout(pool_timeout));
                    }
                    continue;
                }
                Step::Wait(rx) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match tokio::time::timeout(remaining, rx).await {
                        Ok(Ok(Handoff::Idle(conn, worker_idle_time))) => {
                            return Ok((CheckoutKind::Reuse, Some(conn), worker_idle_time))
                        }
                        Ok(Ok(Handoff::Fresh)) => {
                            return Ok((CheckoutKind::Fresh, None, Duration::ZERO))
                        }
                        Ok(Err(_canceled)) => {
                            return Err(PoolError::PoolTimeout(pool_timeout));
                        }
                        Err(_elapsed) => {
                            let mut inner = self.shared.inner.lock().await;
                            inner.waiters.retain(|tx| !tx.is_canceled());
                            return Err(PoolError::PoolTimeout(pool_timeout));
                        }
                    }
                }
            }
        }
    }

    /// A freshly reserved slot failed to dial: give the slot back without
    /// letting it leak as permanently in-use.
    pub(crate) async fn release_failed_fresh(&self) {
        let mut inner = self.shared.inner.lock().await;

        loop {
            let Some(tx) = inner.waiters.pop_front() else {
                break;
            };
            if tx.is_canceled() {
                continue;
            }
            match tx.send(Handoff::Fresh) {
                Ok(()) => return,
                Err(_) => continue,
            }
        }

        inner.uninitialized += 1;
        inner.in_use -= 1;
        if let Some(m) = &self.shared.metrics {
            m.add_in_use(-1);
        }
    }

    /// Checkin (`InUse -> Idle`, or eviction on close). Hands the
    /// connection (or a freed fresh-dial slot) directly to the
    /// longest-waiting caller before ever touching the idle deque or the
    /// uninitialized count.
    pub(crate) async fn checkin(&self, conn: C) {
        let mut idle_opt = worker::checkin(conn);
        let mut inner = self.shared.inner.lock().await;

        loop {
            let Some(tx) = inner.waiters.pop_front() else {
                break;
            };
            if tx.is_canceled() {
                continue;
            }

            let handoff = match idle_opt.take() {
                Some(idle) => match idle.try_checkout(&self.shared.origin) {
                    Ok((conn, worker_idle_time)) => Handoff::Idle(conn, worker_idle_time),
                    Err(conn) => {
                        worker::evict(conn);
                        Handoff::Fresh
                    }
                },
                None => Handoff::Fresh,
            };

            match tx.send(handoff) {
                Ok(()) => return,
                Err(returned) => {
                    idle_opt = match returned {
                        Handoff::Idle(conn, _) => Some(IdleWorker::new(conn)),
                        Handoff::Fresh => None,
                    };
                    continue;
                }
            }
        }

        match idle_opt {
            Some(idle) => inner.idle.push_back(idle),
            None => inner.uninitialized += 1,
        }
        inner.in_use -= 1;
        if let Some(m) = &self.shared.metrics {
            m.add_in_use(-1);
        }
    }

    /// Dispatch an unsolicited signal to every currently idle connection
    /// that recognizes it, evicting any that report it as fatal.
    pub(crate) async fn dispatch_unsolicited(&self, signal: &str) {
        let mut inner = self.shared.inner.lock().await;
        let mut keep = VecDeque::with_capacity(inner.idle.len());
        while let Some(mut idle) = inner.idle.pop_front() {
            match worker::on_unsolicited(&mut idle.conn, signal) {
                crate::connection::DiscardOutcome::Fatal => {
                    worker::evict(idle.conn);
                    inner.uninitialized += 1;
                }
                _ => keep.push_back(idle),
            }
        }
        inner.idle = keep;
    }

    pub(crate) fn record_timing(&self, checkout: Duration, usage: Option<Duration>) {
        if let Some(m) = &self.shared.metrics {
            m.record_checkout(checkout);
            if let Some(usage) = usage {
                m.record_usage(usage);
            }
        }
    }

    /// Close every worker: idle connections are closed immediately; workers
    /// currently checked out are closed as they're returned.
    pub async fn shutdown(&self) {
        let mut inner = self.shared.inner.lock().await;
        while let Some(idle) = inner.idle.pop_front() {
            worker::evict(idle.conn);
        }
        inner.uninitialized = 0;
        metrics::deregister(&self.shared.name, &self.shared.origin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::Scheme;
    use crate::test_support::{opts_for, StubConnection, StubControl};

    fn origin(host: &str) -> Origin {
        Origin::new(Scheme::Http, host, 80)
    }

    fn pool(host: &str, pool_size: usize, control: &StubControl) -> Pool<StubConnection> {
        Pool::new(
            "test",
            origin(host),
            PoolConfig {
                pool_size,
                conn_opts: opts_for(control),
                pool_max_idle_time: IdleLimit::Infinite,
                start_pool_metrics: true,
                pool_idx: 0,
            },
        )
    }

    #[tokio::test]
    async fn checkout_dials_fresh_until_pool_size_is_exhausted() {
        let control = StubControl::new(Duration::from_secs(60));
        let pool = pool("checkout-fresh", 2, &control);

        let (kind1, conn1, _) = pool.checkout(Duration::from_millis(50)).await.unwrap();
        assert_eq!(kind1, CheckoutKind::Fresh);
        assert!(conn1.is_none());

        let (kind2, conn2, _) = pool.checkout(Duration::from_millis(50)).await.unwrap();
        assert_eq!(kind2, CheckoutKind::Fresh);
        assert!(conn2.is_none());

        // Both slots are now uninitialized-exhausted; a third checkout must
        // queue and time out since nothing has been checked in.
        let err = pool.checkout(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolTimeout(_)));
    }

    #[tokio::test]
    async fn checked_in_connection_is_reused_on_next_checkout() {
        let control = StubControl::new(Duration::from_secs(60));
        let pool = pool("checkout-reuse", 1, &control);

        let (kind, conn, _) = pool.checkout(Duration::from_millis(50)).await.unwrap();
        assert_eq!(kind, CheckoutKind::Fresh);
        assert!(conn.is_none());

        let dialed = StubConnection::connect(pool.origin(), pool.conn_opts())
            .await
            .unwrap();
        pool.checkin(dialed).await;

        let (kind, conn, idle_time) = pool.checkout(Duration::from_millis(50)).await.unwrap();
        assert_eq!(kind, CheckoutKind::Reuse);
        assert!(idle_time < Duration::from_secs(60));
        assert!(crate::test_support::mode_is_passive(&conn.unwrap()));
    }

    #[tokio::test]
    async fn stale_idle_connection_is_evicted_and_checkout_falls_back_to_fresh() {
        let control = StubControl::new(Duration::from_millis(10));
        let pool = pool("checkout-stale", 1, &control);

        let dialed = StubConnection::connect(pool.origin(), pool.conn_opts())
            .await
            .unwrap();
        pool.checkin(dialed).await;

        tokio::time::sleep(Duration::from_millis(40)).await;

        let (kind, conn, idle_time) = pool.checkout(Duration::from_millis(50)).await.unwrap();
        assert_eq!(kind, CheckoutKind::Fresh);
        assert!(conn.is_none());
        assert_eq!(idle_time, Duration::ZERO);
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let control = StubControl::new(Duration::from_secs(60));
        let pool = pool("checkout-fifo", 1, &control);

        // Exhaust the only slot.
        let (_, _conn, _) = pool.checkout(Duration::from_millis(50)).await.unwrap();

        let pool_a = pool.clone();
        let pool_b = pool.clone();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_a = order.clone();
        let order_b = order.clone();

        let waiter_a = tokio::spawn(async move {
            pool_a.checkout(Duration::from_millis(500)).await.unwrap();
            order_a.lock().unwrap().push("a");
        });
        // Give waiter_a a head start so it's enqueued first.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let waiter_b = tokio::spawn(async move {
            pool_b.checkout(Duration::from_millis(500)).await.unwrap();
            order_b.lock().unwrap().push("b");
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let dialed = StubConnection::connect(pool.origin(), pool.conn_opts())
            .await
            .unwrap();
        pool.checkin(dialed).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let dialed2 = StubConnection::connect(pool.origin(), pool.conn_opts())
            .await
            .unwrap();
        pool.checkin(dialed2).await;

        waiter_a.await.unwrap();
        waiter_b.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn checkin_decrements_in_use_gauge() {
        let control = StubControl::new(Duration::from_secs(60));
        let pool = pool("checkin-gauge", 2, &control);

        let (_, _, _) = pool.checkout(Duration::from_millis(50)).await.unwrap();
        assert_eq!(pool.status().unwrap().in_use, 1);

        let dialed = StubConnection::connect(pool.origin(), pool.conn_opts())
            .await
            .unwrap();
        pool.checkin(dialed).await;
        assert_eq!(pool.status().unwrap().in_use, 0);
    }

    #[tokio::test]
    async fn disabled_metrics_means_no_status() {
        let control = StubControl::new(Duration::from_secs(60));
        let pool = Pool::<StubConnection>::new(
            "checkout-no-metrics",
            origin("checkout-no-metrics"),
            PoolConfig {
                pool_size: 1,
                conn_opts: opts_for(&control),
                pool_max_idle_time: IdleLimit::Infinite,
                start_pool_metrics: false,
                pool_idx: 0,
            },
        );
        assert!(pool.status().is_none());
        assert!(metrics::get_pool_status(pool.name(), pool.origin()).is_err());
    }

    #[tokio::test]
    async fn pool_max_idle_time_self_terminates_when_quiescent() {
        let control = StubControl::new(Duration::from_secs(60));
        let pool = Pool::<StubConnection>::new(
            "pool-idle-reap",
            origin("pool-idle-reap"),
            PoolConfig {
                pool_size: 1,
                conn_opts: opts_for(&control),
                pool_max_idle_time: IdleLimit::Finite(Duration::from_millis(30)),
                start_pool_metrics: false,
                pool_idx: 0,
            },
        );

        let dialed = StubConnection::connect(pool.origin(), pool.conn_opts())
            .await
            .unwrap();
        pool.checkin(dialed).await;

        assert!(!pool.is_stopped());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(pool.is_stopped());
    }
}
