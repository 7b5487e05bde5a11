//! Command protocol layer: requests, responses and asynchronous proxies.
//!
//! A command is a line of text sent to a device. The device answers with any
//! number of trace lines followed by `retcode: <n>`.
//!
//! ```rust
//! use dutbench::command::{CommandMode, CommandOptions};
//! use std::time::Duration;
//!
//! let options = CommandOptions::default()
//!     .with_timeout(Duration::from_secs(5))
//!     .with_mode(CommandMode::Asynchronous);
//! assert_eq!(options.expected_retcode, Some(0));
//! ```

pub mod executor;
pub mod response;

use {
    crate::{device::Device, error::Result},
    std::{
        sync::{Arc, OnceLock},
        time::{Duration, Instant},
    },
};

pub use {
    executor::Commands,
    response::{
        CommandResponse, DEAD_DEVICE_SENTINEL, REBOOT_MARKER, ReturnCode, describe_retcode,
        parse_retcode, verify_lines,
    },
};

/// Default command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(50);

/// How the caller waits for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandMode {
    /// Block until the response arrives.
    #[default]
    Synchronous,
    /// Return an [`AsyncResponse`] immediately; reading it blocks.
    Asynchronous,
    /// Write the command and do not collect a response.
    FireAndForget,
}

impl CommandMode {
    /// Whether a response is collected for this mode.
    pub fn collects_response(self) -> bool {
        !matches!(self, Self::FireAndForget)
    }
}

/// Options controlling one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOptions {
    /// Time allowed from submission to `retcode:`.
    pub timeout: Duration,
    /// Required return code; `None` accepts anything.
    pub expected_retcode: Option<i32>,
    /// Waiting mode.
    pub mode: CommandMode,
    /// Raise on a mismatching return code instead of logging it.
    pub report_failure: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
            expected_retcode: Some(0),
            mode: CommandMode::Synchronous,
            report_failure: true,
        }
    }
}

impl CommandOptions {
    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the required return code (`None` accepts anything).
    #[must_use]
    pub fn with_expected(mut self, expected: Option<i32>) -> Self {
        self.expected_retcode = expected;
        self
    }

    /// Set the waiting mode.
    #[must_use]
    pub fn with_mode(mut self, mode: CommandMode) -> Self {
        self.mode = mode;
        self
    }

    /// Log mismatches instead of failing.
    #[must_use]
    pub fn without_failure_report(mut self) -> Self {
        self.report_failure = false;
        self
    }

    /// Return code actually enforced.
    pub fn enforced_retcode(&self) -> Option<i32> {
        if self.report_failure {
            self.expected_retcode
        } else {
            None
        }
    }
}

/// A command bound for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Command line.
    pub text: String,
    /// Submission time; stamped again when the dispatcher accepts it.
    pub submitted_at: Instant,
    /// Allowed time to complete.
    pub timeout: Duration,
    /// Return code checked by the protocol layer.
    pub expected_retcode: Option<i32>,
    /// Waiting mode.
    pub mode: CommandMode,
}

impl CommandRequest {
    /// Build a request from text and options.
    pub fn new(text: impl Into<String>, options: &CommandOptions) -> Self {
        Self {
            text: text.into(),
            submitted_at: Instant::now(),
            timeout: options.timeout,
            expected_retcode: options.enforced_retcode(),
            mode: options.mode,
        }
    }

    /// Deadline for the response.
    pub fn deadline(&self) -> Instant {
        self.submitted_at + self.timeout
    }
}

/// Write-once storage behind an [`AsyncResponse`].
#[derive(Debug, Default)]
pub(crate) struct AsyncSlot {
    response: OnceLock<CommandResponse>,
}

impl AsyncSlot {
    /// Install the response. Later installs are ignored.
    pub(crate) fn install(&self, response: CommandResponse) -> bool {
        self.response.set(response).is_ok()
    }

    pub(crate) fn get(&self) -> Option<&CommandResponse> {
        self.response.get()
    }
}

/// Placeholder returned for asynchronous commands.
///
/// The first read blocks until the dispatcher installs the response; every
/// later read returns the same data immediately.
#[derive(Clone)]
pub struct AsyncResponse {
    device: Arc<Device>,
    slot: Arc<AsyncSlot>,
}

impl std::fmt::Debug for AsyncResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResponse")
            .field("device", &self.device.index())
            .field("response", &self.slot.get())
            .finish()
    }
}

impl AsyncResponse {
    pub(crate) fn new(device: Arc<Device>, slot: Arc<AsyncSlot>) -> Self {
        Self { device, slot }
    }

    /// Whether the response has been installed.
    pub fn is_ready(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Index of the device the command went to.
    pub fn device_index(&self) -> usize {
        self.device.index()
    }

    pub(crate) fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Block until the response is installed and return it.
    pub fn wait(&self) -> Result<&CommandResponse> {
        if let Some(response) = self.slot.get() {
            return Ok(response);
        }
        self.device.await_slot(&self.slot)?;
        Ok(self.slot.response.get_or_init(CommandResponse::default))
    }

    /// Return code, blocking on first access.
    pub fn retcode(&self) -> Result<Option<ReturnCode>> {
        Ok(self.wait()?.retcode)
    }

    /// Trace lines, blocking on first access.
    pub fn lines(&self) -> Result<&[String]> {
        Ok(&self.wait()?.lines)
    }

    #[cfg(test)]
    pub(crate) fn install(&self, response: CommandResponse) -> bool {
        self.slot.install(response)
    }
}

/// What [`crate::Dispatcher::submit`] hands back.
#[derive(Debug)]
pub enum Submitted {
    /// Fire-and-forget command written.
    Sent,
    /// Asynchronous command pending.
    Pending(AsyncResponse),
    /// Synchronous command completed.
    Completed(CommandResponse),
}

impl Submitted {
    /// Resolve to a response, waiting on a pending proxy.
    ///
    /// Fire-and-forget commands resolve to an empty response.
    pub fn into_response(self) -> Result<CommandResponse> {
        match self {
            Self::Sent => Ok(CommandResponse::default()),
            Self::Pending(proxy) => proxy.wait().cloned(),
            Self::Completed(response) => Ok(response),
        }
    }

    /// The completed response, if this was a synchronous command.
    pub fn response(&self) -> Option<&CommandResponse> {
        match self {
            Self::Completed(response) => Some(response),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = CommandOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(50));
        assert_eq!(options.expected_retcode, Some(0));
        assert_eq!(options.mode, CommandMode::Synchronous);
        assert!(options.report_failure);
    }

    #[test]
    fn test_failure_report_disables_expected() {
        let options = CommandOptions::default().without_failure_report();
        assert_eq!(options.enforced_retcode(), None);
        let request = CommandRequest::new("reset", &options);
        assert_eq!(request.expected_retcode, None);
    }

    #[test]
    fn test_request_deadline() {
        let options = CommandOptions::default().with_timeout(Duration::from_secs(3));
        let request = CommandRequest::new("ping", &options);
        assert_eq!(request.deadline() - request.submitted_at, Duration::from_secs(3));
    }

    #[test]
    fn test_slot_installs_once() {
        let slot = AsyncSlot::default();
        let first = CommandResponse {
            retcode: Some(ReturnCode::Value(0)),
            ..CommandResponse::default()
        };
        assert!(slot.install(first.clone()));
        assert!(!slot.install(CommandResponse::timed_out(Duration::ZERO)));
        assert_eq!(slot.get(), Some(&first));
    }

    #[test]
    fn test_sent_resolves_to_empty() {
        let response = Submitted::Sent.into_response().unwrap();
        assert_eq!(response.retcode, None);
        assert!(response.lines.is_empty());
    }
}
