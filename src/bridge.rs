//! Per-session bridge between a running process and an interactive client.
//!
//! The bridge is the single owner of a session's transport attachment, its
//! byte budgets and its terminal outcome. Transports may attach before, during
//! or after the run; every path ends in exactly one close callback.

use crate::sandbox::{InputSink, RunError, RunOutcome};
use crate::workspace::SessionKey;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const OUTPUT_LIMIT_NOTICE: &str = "\n[output limit exceeded]\n";
pub const INPUT_LIMIT_NOTICE: &str = "\n[input limit exceeded]\n";

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// What the bridge asks the transport to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    Close,
}

/// Bridge-side handle on an attached client connection.
#[derive(Debug)]
pub struct Transport {
    id: u64,
    tx: mpsc::UnboundedSender<Frame>,
}

impl Transport {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            let _ = self.tx.send(Frame::Data(bytes));
        }
    }

    fn close(&self) {
        let _ = self.tx.send(Frame::Close);
    }
}

/// Outcome of the session's process, set at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Running,
    Exited(i32),
    Aborted,
    Errored(String),
}

impl Terminal {
    pub fn notice(&self) -> Option<String> {
        match self {
            Terminal::Running => None,
            Terminal::Exited(code) => Some(format!("\n[process exited with code {}]\n", code)),
            Terminal::Aborted => Some("\n[process was aborted]\n".to_string()),
            Terminal::Errored(message) => Some(format!("\n[run failed]: {}\n", message)),
        }
    }
}

impl From<Result<RunOutcome, RunError>> for Terminal {
    fn from(result: Result<RunOutcome, RunError>) -> Self {
        match result {
            Ok(RunOutcome::Exited(code)) => Terminal::Exited(code),
            Ok(RunOutcome::TimedOut) => Terminal::Aborted,
            Err(e) => Terminal::Errored(e.to_string()),
        }
    }
}

/// Why a bridge closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Terminal notice delivered to a client.
    Finished,
    OutputLimit,
    InputLimit,
    /// Nobody attached within the grace window after the last notice.
    GraceExpired,
    /// Client went away after the process had already finished.
    Disconnected,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Finished => "finished",
            CloseReason::OutputLimit => "output limit exceeded",
            CloseReason::InputLimit => "input limit exceeded",
            CloseReason::GraceExpired => "grace window expired",
            CloseReason::Disconnected => "client disconnected",
        };
        f.write_str(s)
    }
}

/// Result of offering a transport to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// Live session; the transport now receives output as it arrives.
    Attached,
    /// Session already ended; buffered output and notice were sent, transport closed.
    Delivered,
    /// Transport closed without delivery (session closed or already attached).
    Refused,
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeLimits {
    pub input_cap: usize,
    pub output_cap: usize,
    pub grace_window: Duration,
}

impl From<&crate::config::Limits> for BridgeLimits {
    fn from(limits: &crate::config::Limits) -> Self {
        Self {
            input_cap: limits.input_cap,
            output_cap: limits.output_cap,
            grace_window: limits.grace_window,
        }
    }
}

pub type CloseCallback = Box<dyn FnOnce(CloseReason) + Send>;

enum Phase {
    /// No client yet (or it left while the process runs); output accumulates.
    Pending { outbound: Vec<u8> },
    Attached { transport: Transport },
    /// Final bytes are buffered for a late client while the grace timer runs.
    Draining { outbound: Vec<u8>, reason: CloseReason },
    Closed { reason: CloseReason },
}

struct Inner {
    phase: Phase,
    terminal: Terminal,
    bytes_out: usize,
    bytes_in: usize,
    input: Option<InputSink>,
    inbound: Vec<u8>,
    grace: Option<JoinHandle<()>>,
    on_close: Option<CloseCallback>,
}

type Closing = (CloseCallback, CloseReason);

impl Inner {
    /// One-shot transition into `Closed`. Returns the callback to run once
    /// the lock is released.
    fn close(&mut self, reason: CloseReason) -> Option<Closing> {
        if matches!(self.phase, Phase::Closed { .. }) {
            return None;
        }
        self.phase = Phase::Closed { reason };
        self.input = None;
        self.inbound.clear();
        if let Some(timer) = self.grace.take() {
            timer.abort();
        }
        self.on_close.take().map(|callback| (callback, reason))
    }
}

pub struct Bridge {
    key: SessionKey,
    limits: BridgeLimits,
    inner: Mutex<Inner>,
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("key", &self.key)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Bridge {
    pub fn new(key: SessionKey, limits: BridgeLimits, on_close: CloseCallback) -> Arc<Self> {
        Arc::new(Self {
            key,
            limits,
            inner: Mutex::new(Inner {
                phase: Phase::Pending {
                    outbound: Vec::new(),
                },
                terminal: Terminal::Running,
                bytes_out: 0,
                bytes_in: 0,
                input: None,
                inbound: Vec::new(),
                grace: None,
                on_close: Some(on_close),
            }),
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn terminal(&self) -> Terminal {
        self.lock().terminal.clone()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match &self.lock().phase {
            Phase::Closed { reason } => Some(*reason),
            _ => None,
        }
    }

    pub fn attach(&self, transport: Transport) -> Attach {
        let mut inner = self.lock();
        let mut closing = None;
        let attach = match &mut inner.phase {
            Phase::Pending { outbound } => {
                transport.send(mem::take(outbound));
                inner.phase = Phase::Attached { transport };
                Attach::Attached
            }
            Phase::Attached { .. } => {
                warn!(key = %self.key, "Session already has a client; refusing second transport");
                transport.close();
                Attach::Refused
            }
            Phase::Draining { outbound, reason } => {
                let reason = *reason;
                transport.send(mem::take(outbound));
                transport.close();
                closing = inner.close(reason);
                Attach::Delivered
            }
            Phase::Closed { .. } => {
                transport.close();
                Attach::Refused
            }
        };
        drop(inner);
        info!(key = %self.key, ?attach, "Transport offered");
        self.fire(closing);
        attach
    }

    /// Called with each chunk of process stdout/stderr, in arrival order.
    pub fn deliver_output(self: &Arc<Self>, chunk: &[u8]) {
        let mut inner = self.lock();
        if inner.terminal != Terminal::Running
            || matches!(inner.phase, Phase::Draining { .. } | Phase::Closed { .. })
        {
            return;
        }

        let room = self.limits.output_cap.saturating_sub(inner.bytes_out);
        let accepted = &chunk[..chunk.len().min(room)];
        inner.bytes_out += chunk.len();
        let exceeded = inner.bytes_out > self.limits.output_cap;

        let mut closing = None;
        match &mut inner.phase {
            Phase::Pending { outbound } => {
                outbound.extend_from_slice(accepted);
                if exceeded {
                    outbound.extend_from_slice(OUTPUT_LIMIT_NOTICE.as_bytes());
                    let outbound = mem::take(outbound);
                    inner.phase = Phase::Draining {
                        outbound,
                        reason: CloseReason::OutputLimit,
                    };
                    self.arm_grace(&mut inner);
                }
            }
            Phase::Attached { transport } => {
                transport.send(accepted.to_vec());
                if exceeded {
                    transport.send(OUTPUT_LIMIT_NOTICE.as_bytes().to_vec());
                    transport.close();
                    closing = inner.close(CloseReason::OutputLimit);
                }
            }
            Phase::Draining { .. } | Phase::Closed { .. } => {}
        }
        if exceeded {
            warn!(key = %self.key, cap = self.limits.output_cap, "Output limit exceeded");
        }
        drop(inner);
        self.fire(closing);
    }

    /// Called with each message received from the attached transport.
    pub fn deliver_input(&self, chunk: &[u8]) {
        let mut inner = self.lock();
        if !matches!(inner.phase, Phase::Attached { .. }) {
            return;
        }

        let room = self.limits.input_cap.saturating_sub(inner.bytes_in);
        let accepted = &chunk[..chunk.len().min(room)];
        inner.bytes_in += chunk.len();
        let exceeded = inner.bytes_in > self.limits.input_cap;

        if !accepted.is_empty() {
            let inner = &mut *inner;
            match &inner.input {
                Some(sink) => {
                    if !sink.write(accepted) {
                        debug!(key = %self.key, "Process stdin is gone; dropping input");
                    }
                }
                None => inner.inbound.extend_from_slice(accepted),
            }
        }

        let mut closing = None;
        if exceeded {
            if let Phase::Attached { transport } = &inner.phase {
                transport.send(INPUT_LIMIT_NOTICE.as_bytes().to_vec());
                transport.close();
            }
            warn!(key = %self.key, cap = self.limits.input_cap, "Input limit exceeded");
            closing = inner.close(CloseReason::InputLimit);
        }
        drop(inner);
        self.fire(closing);
    }

    /// Hands over the process's stdin. Input received earlier is flushed first.
    pub fn set_input_sink(&self, sink: InputSink) {
        let mut inner = self.lock();
        if inner.terminal != Terminal::Running || matches!(inner.phase, Phase::Closed { .. }) {
            return;
        }
        let pending = mem::take(&mut inner.inbound);
        if !pending.is_empty() {
            sink.write(&pending);
        }
        inner.input = Some(sink);
    }

    /// Records the process outcome. Only the first call has any effect.
    pub fn finish(self: &Arc<Self>, terminal: Terminal) {
        let Some(notice) = terminal.notice() else {
            return;
        };
        let mut inner = self.lock();
        if inner.terminal != Terminal::Running {
            debug!(key = %self.key, "Ignoring repeated finish");
            return;
        }
        info!(key = %self.key, terminal = ?terminal, "Session finished");
        inner.terminal = terminal;
        inner.input = None;

        let mut closing = None;
        match &mut inner.phase {
            Phase::Pending { outbound } => {
                outbound.extend_from_slice(notice.as_bytes());
                let outbound = mem::take(outbound);
                inner.phase = Phase::Draining {
                    outbound,
                    reason: CloseReason::Finished,
                };
                self.arm_grace(&mut inner);
            }
            Phase::Attached { transport } => {
                transport.send(notice.into_bytes());
                transport.close();
                closing = inner.close(CloseReason::Finished);
            }
            // A limit already ended the conversation; its notice stands alone.
            Phase::Draining { .. } | Phase::Closed { .. } => {}
        }
        drop(inner);
        self.fire(closing);
    }

    /// The transport identified by `transport_id` went away.
    pub fn detach(&self, transport_id: u64) {
        let mut inner = self.lock();
        let current = matches!(&inner.phase, Phase::Attached { transport } if transport.id == transport_id);
        if !current {
            return;
        }
        let mut closing = None;
        if inner.terminal == Terminal::Running {
            info!(key = %self.key, "Client detached; buffering output until it returns");
            inner.phase = Phase::Pending {
                outbound: Vec::new(),
            };
        } else {
            closing = inner.close(CloseReason::Disconnected);
        }
        drop(inner);
        self.fire(closing);
    }

    fn expire(&self) {
        let mut inner = self.lock();
        let mut closing = None;
        if matches!(inner.phase, Phase::Draining { .. }) {
            info!(key = %self.key, "No client attached within grace window");
            inner.grace = None;
            closing = inner.close(CloseReason::GraceExpired);
        }
        drop(inner);
        self.fire(closing);
    }

    fn arm_grace(self: &Arc<Self>, inner: &mut Inner) {
        let bridge: Weak<Self> = Arc::downgrade(self);
        let window = self.limits.grace_window;
        inner.grace = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(bridge) = bridge.upgrade() {
                bridge.expire();
            }
        }));
    }

    fn fire(&self, closing: Option<Closing>) {
        if let Some((callback, reason)) = closing {
            info!(key = %self.key, %reason, "Session closed");
            callback(reason);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
