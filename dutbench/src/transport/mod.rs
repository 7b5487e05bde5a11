//! Byte-stream endpoints for devices under test.
//!
//! Every device talks to the engine through a [`Transport`]: a line oriented
//! endpoint with `open`/`close`, `write_line` and a bounded `read_line`.
//! Serial ports and spawned processes share this interface.
//!
//! ```text
//! +------------------+   signal   +------------------+
//! |  reader thread   | ---------> |    dispatcher    |
//! | (serial/process) |            |   (one per run)  |
//! +--------+---------+            +--------+---------+
//!          | push lines                    | read_line(0)
//!          v                               v
//! +--------+-------------------------------+---------+
//! |                    LineQueue                     |
//! +--------------------------------------------------+
//! ```
//!
//! Transports with their own reader thread install a [`LineNotifier`] so the
//! dispatcher is woken per received line. Transports without one are polled.

pub mod lines;
pub mod process;
pub mod scripted;
#[cfg(feature = "native")]
pub mod serial;

use {
    crate::error::{Error, Result},
    parking_lot::{Condvar, Mutex},
    std::{
        collections::VecDeque,
        sync::Arc,
        time::{Duration, Instant},
    },
};

pub use {
    lines::{LineAssembler, clean_line, drain_utf8_lossy},
    process::ProcessTransport,
    scripted::{ScriptedControl, ScriptedTransport},
};
#[cfg(feature = "native")]
pub use serial::{SerialConfig, SerialTransport};

/// Callback invoked whenever a transport has a new line ready.
pub type LineNotifier = Arc<dyn Fn() + Send + Sync>;

/// Line oriented connection to a device.
pub trait Transport: Send {
    /// Open the connection. Opening an already open transport is a no-op.
    fn open(&mut self) -> Result<()>;

    /// Close the connection and stop any reader thread.
    fn close(&mut self) -> Result<()>;

    /// Write one line; the transport appends its line terminator.
    fn write_line(&mut self, line: &str) -> Result<()>;

    /// Read one line, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time and an error once the
    /// connection is gone.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>>;

    /// Human readable endpoint name (port path, program name).
    fn name(&self) -> &str;

    /// Install a notifier fired for every buffered line.
    ///
    /// Returns `false` if the transport has no independent reader; the
    /// dispatcher then polls it.
    fn set_notifier(&mut self, notifier: LineNotifier) -> bool {
        let _ = notifier;
        false
    }
}

#[derive(Default)]
struct QueueState {
    lines: VecDeque<String>,
    failure: Option<String>,
}

/// Buffer shared between a reader thread and the transport's `read_line`.
///
/// Lines pushed before a failure are still delivered; once drained, reads
/// report the failure.
#[derive(Default)]
pub struct LineQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    notifier: Mutex<Option<LineNotifier>>,
}

impl LineQueue {
    /// Create an empty queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set the notifier fired on every push and on failure.
    pub fn set_notifier(&self, notifier: LineNotifier) {
        *self.notifier.lock() = Some(notifier);
    }

    /// Append a received line.
    pub fn push(&self, line: String) {
        self.state.lock().lines.push_back(line);
        self.available.notify_all();
        self.notify();
    }

    /// Record that the connection is gone.
    pub fn fail(&self, reason: impl Into<String>) {
        {
            let mut state = self.state.lock();
            if state.failure.is_none() {
                state.failure = Some(reason.into());
            }
        }
        self.available.notify_all();
        self.notify();
    }

    /// Forget buffered lines and any recorded failure.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.lines.clear();
        state.failure = None;
    }

    /// Take the next line, waiting up to `timeout`.
    pub fn pop(&self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(line) = state.lines.pop_front() {
                return Ok(Some(line));
            }
            if let Some(reason) = &state.failure {
                return Err(Error::Transport(reason.clone()));
            }
            if timeout.is_zero()
                || self
                    .available
                    .wait_until(&mut state, deadline)
                    .timed_out()
            {
                return match state.lines.pop_front() {
                    Some(line) => Ok(Some(line)),
                    None => Ok(None),
                };
            }
        }
    }

    fn notify(&self) {
        let notifier = self.notifier.lock().clone();
        if let Some(notifier) = notifier {
            notifier();
        }
    }
}
