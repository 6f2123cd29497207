//! Minimal, injectable [`Connection`](crate::Connection) test double.
//!
//! Grounded on the teacher's test-only `Uniq<T>` and `hyper-util`'s
//! `Uniq<T>`/`CanClose` — small stand-ins for a real codec, just enough to
//! drive the pool's own state machine in tests.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::connection::{Connection, ConnOpts, DiscardOutcome, Mode, Part};
use crate::origin::Origin;

#[derive(Debug, Clone, thiserror::Error)]
#[error("stub connection error: {0}")]
pub(crate) struct StubError(pub(crate) String);

/// Shared knobs controlling every [`StubConnection`] dialed against a given
/// [`ConnOpts`] handle, so a test can make connections "go bad" after the
/// pool has already been built.
#[derive(Clone)]
pub(crate) struct StubControl {
    pub(crate) dial_count: Arc<AtomicUsize>,
    pub(crate) fail_dial: Arc<AtomicBool>,
    pub(crate) max_idle_time: Duration,
    pub(crate) request_delay_ms: Arc<AtomicU64>,
    pub(crate) fail_request: Arc<AtomicBool>,
}

impl StubControl {
    pub(crate) fn new(max_idle_time: Duration) -> Self {
        StubControl {
            dial_count: Arc::new(AtomicUsize::new(0)),
            fail_dial: Arc::new(AtomicBool::new(false)),
            max_idle_time,
            request_delay_ms: Arc::new(AtomicU64::new(0)),
            fail_request: Arc::new(AtomicBool::new(false)),
        }
    }
}

fn handles() -> &'static Mutex<HashMap<u64, StubControl>> {
    static HANDLES: OnceLock<Mutex<HashMap<u64, StubControl>>> = OnceLock::new();
    HANDLES.get_or_init(Default::default)
}

/// Register `control` and return a [`ConnOpts`] a pool can carry, so its
/// dials find their way back to the same [`StubControl`] the test holds.
pub(crate) fn opts_for(control: &StubControl) -> ConnOpts {
    static NEXT_HANDLE: AtomicU64 = AtomicU64::new(0);
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    handles()
        .lock()
        .expect("stub control registry lock")
        .insert(handle, control.clone());

    let mut map = HashMap::new();
    map.insert("__stub_handle".to_string(), handle.to_string());
    ConnOpts(map)
}

fn control_of(opts: &ConnOpts) -> StubControl {
    let handle: u64 = opts
        .0
        .get("__stub_handle")
        .expect("StubConnection requires opts built by opts_for")
        .parse()
        .expect("stub handle must be a u64");
    handles()
        .lock()
        .expect("stub control registry lock")
        .get(&handle)
        .cloned()
        .expect("stub handle must still be registered")
}

pub(crate) struct StubConnection {
    control: StubControl,
    open: bool,
    mode: Mode,
}

#[async_trait]
impl Connection for StubConnection {
    type Request = &'static str;
    type Data = Vec<u8>;
    type Error = StubError;

    async fn connect(_origin: &Origin, opts: &ConnOpts) -> Result<Self, Self::Error> {
        let control = control_of(opts);
        control.dial_count.fetch_add(1, Ordering::SeqCst);
        if control.fail_dial.load(Ordering::SeqCst) {
            return Err(StubError("dial refused".into()));
        }
        Ok(StubConnection {
            control,
            open: true,
            mode: Mode::Active,
        })
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn reusable(&self, idle_time: Duration) -> bool {
        self.open && idle_time < self.control.max_idle_time
    }

    fn discard(&mut self, signal: &str) -> DiscardOutcome {
        match signal {
            "fatal" => {
                self.open = false;
                DiscardOutcome::Fatal
            }
            "known" => DiscardOutcome::Consumed,
            _ => DiscardOutcome::Unknown,
        }
    }

    fn close(&mut self) {
        self.open = false;
    }

    async fn request<Acc, F>(
        &mut self,
        req: Self::Request,
        acc: Acc,
        mut fold: F,
        _receive_timeout: Duration,
        _idle_time: Duration,
    ) -> Result<Acc, Self::Error>
    where
        Acc: Send + 'static,
        F: FnMut(Part<Self::Data>, Acc) -> ControlFlow<Acc, Acc> + Send + 'static,
    {
        let delay_ms = self.control.request_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self.control.fail_request.load(Ordering::SeqCst) {
            self.open = false;
            return Err(StubError("transport failure".into()));
        }

        macro_rules! step {
            ($acc:expr, $part:expr) => {
                match fold($part, $acc) {
                    ControlFlow::Continue(acc) => acc,
                    ControlFlow::Break(acc) => return Ok(acc),
                }
            };
        }

        let acc = step!(acc, Part::Status(200));
        let acc = step!(acc, Part::Header("content-type".into(), "text/plain".into()));
        let acc = step!(acc, Part::Data(req.as_bytes().to_vec()));
        let acc = step!(acc, Part::End);
        Ok(acc)
    }
}

pub(crate) fn mode_is_passive(conn: &StubConnection) -> bool {
    matches!(conn.mode, Mode::Passive)
}
