//! Telemetry event emission (spec.md §6).
//!
//! Grounded in `hyper-util`'s pool module's use of `tracing::{debug, trace}`
//! at lifecycle points; each function here is one named event with its
//! measurements/metadata as structured fields.

use std::time::Duration;

use crate::origin::Origin;

pub(crate) fn emit_queue_start(origin: &Origin) {
    tracing::debug!(
        event = "queue.start",
        scheme = %origin.scheme,
        host = %origin.host,
        port = origin.port,
    );
}

pub(crate) fn emit_queue_stop(origin: &Origin, idle_time: Duration, reused: bool) {
    tracing::debug!(
        event = "queue.stop",
        idle_time_us = idle_time.as_micros() as u64,
        reused,
        scheme = %origin.scheme,
        host = %origin.host,
        port = origin.port,
    );
}

pub(crate) fn emit_queue_exception(origin: &Origin, kind: &str, data: &str) {
    tracing::warn!(
        event = "queue.exception",
        kind,
        data,
        scheme = %origin.scheme,
        host = %origin.host,
        port = origin.port,
    );
}

/// Emits both the current event name and its deprecated alias, per
/// spec.md §9's "preserve the dual-emit for one release" note.
pub(crate) fn emit_conn_max_idle_time_exceeded(origin: &Origin, idle_time: Duration) {
    let idle_time_us = idle_time.as_micros() as u64;
    tracing::debug!(
        event = "conn_max_idle_time_exceeded",
        idle_time_us,
        scheme = %origin.scheme,
        host = %origin.host,
        port = origin.port,
    );
    tracing::debug!(
        event = "max_idle_time_exceeded",
        idle_time_us,
        scheme = %origin.scheme,
        host = %origin.host,
        port = origin.port,
    );
}

pub(crate) fn emit_pool_max_idle_time_exceeded(origin: &Origin) {
    tracing::debug!(
        event = "pool_max_idle_time_exceeded",
        scheme = %origin.scheme,
        host = %origin.host,
        port = origin.port,
    );
}
