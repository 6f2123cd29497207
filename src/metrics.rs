//! Lock-free metrics block with deadline-bounded reset.
//!
//! The hot path (checkout/checkin accounting) never blocks: gauges are a
//! plain atomic add, and the grouped timing counters use a queue-of-writers
//! counter plus a boolean lock so a `reset` can zero them without a mutex
//! (spec.md §4.B, §9).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::error::PoolError;
use crate::origin::Origin;

const IDX_POOL_SIZE: usize = 0;
const IDX_IN_USE: usize = 1;
const IDX_TOTAL_CHECKOUT_COUNT: usize = 2;
const IDX_TOTAL_CHECKOUT_TIME_US: usize = 3;
const IDX_TOTAL_USAGE_TIME_US: usize = 4;
const IDX_MAX_CHECKOUT_TIME_US: usize = 5;
const IDX_MAX_USAGE_TIME_US: usize = 6;
const IDX_RESET_LOCK: usize = 7;
const IDX_RESET_LOCK_QUEUE: usize = 8;
const COUNTER_COUNT: usize = 9;

/// Point-in-time readout, never blocking a concurrent writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct MetricsStatus {
    pub available: u64,
    pub in_use: u64,
    pub avg_checkout_us: u64,
    pub max_checkout_us: u64,
    pub avg_usage_us: u64,
    pub max_usage_us: u64,
}

/// A fixed-length block of 64-bit atomic counters for one pool instance.
pub struct MetricsBlock {
    counters: [AtomicU64; COUNTER_COUNT],
}

impl MetricsBlock {
    fn new(pool_size: u64) -> Self {
        let block = MetricsBlock {
            counters: Default::default(),
        };
        block.counters[IDX_POOL_SIZE].store(pool_size, Ordering::Relaxed);
        block
    }

    /// Gauge add: unconditional, bypasses the writer protocol entirely.
    pub fn add_in_use(&self, delta: i64) {
        if delta >= 0 {
            self.counters[IDX_IN_USE].fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.counters[IDX_IN_USE].fetch_sub((-delta) as u64, Ordering::AcqRel);
        }
    }

    /// Records one completed checkout: increments the shared count and adds
    /// `duration` to the checkout-time total, under the writer protocol;
    /// updates the best-effort max outside it.
    pub fn record_checkout(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.with_writer_slot(|| {
            self.counters[IDX_TOTAL_CHECKOUT_COUNT].fetch_add(1, Ordering::AcqRel);
            self.counters[IDX_TOTAL_CHECKOUT_TIME_US].fetch_add(us, Ordering::AcqRel);
        });
        self.put_max(IDX_MAX_CHECKOUT_TIME_US, us);
    }

    /// Records one completed exchange's usage time. Does *not* increment
    /// `total_checkout_count` — that counter is the shared denominator for
    /// both averages and is only touched once per checkout, in
    /// `record_checkout` (see DESIGN.md).
    pub fn record_usage(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.with_writer_slot(|| {
            self.counters[IDX_TOTAL_USAGE_TIME_US].fetch_add(us, Ordering::AcqRel);
        });
        self.put_max(IDX_MAX_USAGE_TIME_US, us);
    }

    /// `put_max`: best-effort, read-then-write without CAS. May be
    /// overwritten by a lower concurrent writer — documented imprecision,
    /// tests must only assert `max >= avg`.
    fn put_max(&self, idx: usize, value: u64) {
        let current = self.counters[idx].load(Ordering::Acquire);
        if value > current {
            self.counters[idx].store(value, Ordering::Release);
        }
    }

    /// Writer protocol for the grouped timing counters: observe the reset
    /// lock, and if clear, register as an in-flight writer for the duration
    /// of `f`. If the lock is held, the update is dropped silently.
    fn with_writer_slot<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if self.counters[IDX_RESET_LOCK].load(Ordering::Acquire) != 0 {
            return None;
        }
        self.counters[IDX_RESET_LOCK_QUEUE].fetch_add(1, Ordering::AcqRel);
        let r = f();
        self.counters[IDX_RESET_LOCK_QUEUE].fetch_sub(1, Ordering::AcqRel);
        Some(r)
    }

    /// Non-blocking readout.
    pub fn status(&self) -> MetricsStatus {
        let pool_size = self.counters[IDX_POOL_SIZE].load(Ordering::Acquire);
        let in_use = self.counters[IDX_IN_USE].load(Ordering::Acquire);
        let count = self.counters[IDX_TOTAL_CHECKOUT_COUNT].load(Ordering::Acquire);
        let total_checkout = self.counters[IDX_TOTAL_CHECKOUT_TIME_US].load(Ordering::Acquire);
        let total_usage = self.counters[IDX_TOTAL_USAGE_TIME_US].load(Ordering::Acquire);
        let max_checkout = self.counters[IDX_MAX_CHECKOUT_TIME_US].load(Ordering::Acquire);
        let max_usage = self.counters[IDX_MAX_USAGE_TIME_US].load(Ordering::Acquire);

        let avg = |total: u64| -> u64 {
            if count == 0 {
                0
            } else {
                ((total as f64) / (count as f64)).round() as u64
            }
        };

        MetricsStatus {
            available: pool_size.saturating_sub(in_use),
            in_use,
            avg_checkout_us: avg(total_checkout),
            max_checkout_us: max_checkout,
            avg_usage_us: avg(total_usage),
            max_usage_us: max_usage,
        }
    }

    /// Deadline-bounded reset of the timing set (count, both totals, both
    /// maxima). Gauges are untouched.
    pub async fn reset(&self, deadline: Instant) -> Result<(), ResetTimeout> {
        self.counters[IDX_RESET_LOCK].store(1, Ordering::Release);

        while self.counters[IDX_RESET_LOCK_QUEUE].load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                self.counters[IDX_RESET_LOCK].store(0, Ordering::Release);
                return Err(ResetTimeout);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for idx in [
            IDX_TOTAL_CHECKOUT_COUNT,
            IDX_TOTAL_CHECKOUT_TIME_US,
            IDX_TOTAL_USAGE_TIME_US,
            IDX_MAX_CHECKOUT_TIME_US,
            IDX_MAX_USAGE_TIME_US,
        ] {
            self.counters[idx].store(0, Ordering::Release);
        }

        self.counters[IDX_RESET_LOCK].store(0, Ordering::Release);
        Ok(())
    }
}

/// `reset` could not quiesce the timing writers before its deadline; the
/// timing counters may be inconsistent (a count may have landed without its
/// paired time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetTimeout;

impl std::fmt::Display for ResetTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("metrics reset timed out")
    }
}

impl std::error::Error for ResetTimeout {}

type RegistryKey = (String, Origin);
type RegistryValue = Vec<(u32, Arc<MetricsBlock>)>;

fn registry() -> &'static std::sync::Mutex<HashMap<RegistryKey, RegistryValue>> {
    static REGISTRY: OnceLock<std::sync::Mutex<HashMap<RegistryKey, RegistryValue>>> =
        OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// Allocate (or, for a repeated `(name, origin, pool_idx)`, return the
/// existing) metrics block and register it under `(name, origin)`.
pub fn init(name: &str, origin: &Origin, pool_idx: u32, pool_size: u64) -> Arc<MetricsBlock> {
    let mut reg = registry().lock().expect("metrics registry lock");
    let key = (name.to_string(), origin.clone());
    let entries = reg.entry(key).or_default();

    if let Some((_, existing)) = entries.iter().find(|(idx, _)| *idx == pool_idx) {
        return existing.clone();
    }

    let block = Arc::new(MetricsBlock::new(pool_size));
    entries.push((pool_idx, block.clone()));
    block
}

/// Remove all metrics refs previously registered for `(name, origin)`.
pub fn deregister(name: &str, origin: &Origin) {
    let mut reg = registry().lock().expect("metrics registry lock");
    reg.remove(&(name.to_string(), origin.clone()));
}

/// All metrics refs registered for `(name, origin)`, one per pool replica.
pub fn refs(name: &str, origin: &Origin) -> Option<Vec<Arc<MetricsBlock>>> {
    let reg = registry().lock().expect("metrics registry lock");
    reg.get(&(name.to_string(), origin.clone()))
        .map(|entries| entries.iter().map(|(_, block)| block.clone()).collect())
}

/// Consults the cross-host registry for every metrics block attached to
/// `(name, origin)` — one per pool replica — and reads each of them.
/// `PoolError::MetricsNotFound` if no replica ever registered (spec.md
/// §4.B/§7); never blocks a writer.
pub fn get_pool_status(
    name: &str,
    origin: &Origin,
) -> Result<Vec<MetricsStatus>, PoolError<std::convert::Infallible>> {
    refs(name, origin)
        .map(|blocks| blocks.iter().map(|b| b.status()).collect())
        .ok_or(PoolError::MetricsNotFound)
}

/// Resets every metrics replica registered for `(name, origin)`, each under
/// its own deadline-bounded writer-quiescence wait (spec.md §4.B).
pub async fn reset_metrics(
    name: &str,
    origin: &Origin,
    deadline: Instant,
) -> Result<(), PoolError<std::convert::Infallible>> {
    let blocks = refs(name, origin).ok_or(PoolError::MetricsNotFound)?;
    for block in blocks {
        block.reset(deadline).await.map_err(|_| PoolError::ResetTimeout)?;
    }
    Ok(())
}
