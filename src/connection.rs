//! The external, codec-level contract a pool drives.
//!
//! Everything in this module is a collaborator interface (spec.md §4.A):
//! the HTTP/1 wire codec, TLS, and name resolution live outside this crate.
//! `Connection` is the seam; production callers bring their own impl, and
//! [`crate::test_support::StubConnection`] stands in for it in tests.

use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;

use crate::origin::Origin;

/// Whether a connection is delivering bytes to its controller on its own
/// (`Active`, while idle in the pool) or being pulled on demand by the
/// current owner (`Passive`, while checked out for an exchange).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Active,
    Passive,
}

/// One part of a streamed response, handed to a caller's fold function in
/// protocol order.
#[derive(Debug)]
pub enum Part<D> {
    Status(u16),
    Header(String, String),
    Data(D),
    Trailer(Vec<(String, String)>),
    End,
}

/// Outcome of routing an unsolicited signal (e.g. a peer half-close) to an
/// idle connection.
#[derive(Debug)]
pub enum DiscardOutcome {
    /// The message was meaningful and has been handled; the connection
    /// stays idle.
    Consumed,
    /// The message wasn't for this connection; ignore it.
    Unknown,
    /// The message indicates the connection is no longer usable.
    Fatal,
}

/// Opaque, codec-defined connection options, forwarded verbatim from
/// [`crate::pool::PoolConfig::conn_opts`].
#[derive(Clone, Debug, Default)]
pub struct ConnOpts(pub std::collections::HashMap<String, String>);

/// The codec-level contract a [`crate::pool::Pool`] drives.
///
/// A `Connection` value is owned by exactly one of: the pool's idle set, the
/// caller mid-exchange, or no one (closed/dropped) — spec.md §3. Rust's move
/// semantics enforce this automatically, which is why there is no
/// `transfer` operation here (see DESIGN.md).
#[async_trait]
pub trait Connection: Send + Sized + 'static {
    /// A request value accepted by [`Connection::request`].
    type Request: Send + 'static;
    /// A data chunk yielded by [`Part::Data`].
    type Data: Send + 'static;
    /// The error type this connection's exchanges and dial can fail with.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Dial a fresh connection to `origin`.
    async fn connect(origin: &Origin, opts: &ConnOpts) -> Result<Self, Self::Error>;

    /// Whether the underlying socket is still open.
    fn is_open(&self) -> bool;

    /// Switch between active (pool-owned, idle) and passive (caller-owned,
    /// mid-exchange) delivery.
    fn set_mode(&mut self, mode: Mode);

    /// The authoritative staleness oracle: considers `max_idle_time` plus
    /// any protocol-level signal (e.g. a peer half-close already observed).
    fn reusable(&self, idle_time: Duration) -> bool;

    /// Route an unsolicited signal observed while idle.
    fn discard(&mut self, signal: &str) -> DiscardOutcome;

    /// Best-effort, idempotent close.
    fn close(&mut self);

    /// Drive one request/response exchange, invoking `fold` for each
    /// response part in protocol order.
    ///
    /// `fold` returns [`ControlFlow::Break`] to halt the exchange early —
    /// the caller asked to stop (e.g. an async request was cancelled) — at
    /// which point `request` must stop waiting on the wire and return `Ok`
    /// with the accumulator as of the break, rather than treat the halt as
    /// a transport error. This is the suspension point cancellation
    /// observes (spec.md §5, GLOSSARY "Fold").
    async fn request<Acc, F>(
        &mut self,
        req: Self::Request,
        acc: Acc,
        fold: F,
        receive_timeout: Duration,
        idle_time: Duration,
    ) -> Result<Acc, Self::Error>
    where
        Acc: Send + 'static,
        F: FnMut(Part<Self::Data>, Acc) -> ControlFlow<Acc, Acc> + Send + 'static;
}
