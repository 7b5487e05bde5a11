//! Devices under test.
//!
//! A [`Device`] owns a transport and the per-device command state: at most
//! one outstanding request, the pending response slot, the trace buffer and a
//! liveness flag. Only the dispatcher thread writes the response side;
//! callers read it after the ready flag is raised.

pub mod discovery;

use {
    crate::{
        command::{AsyncSlot, CommandMode, CommandRequest, CommandResponse, ReturnCode, describe_retcode, parse_retcode},
        error::{Error, Result},
        events::Matcher,
        resource::DeviceRequirement,
        transport::{LineNotifier, Transport},
    },
    log::{debug, error, warn},
    parking_lot::{Condvar, Mutex},
    std::{
        fmt,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::{Duration, Instant},
    },
};

pub use discovery::{BridgeKind, DetectedPort, detect_ports};

/// Interval at which blocked callers re-check deadlines and interrupts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Identity of a device within one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// 1-based index.
    pub index: usize,
    /// Optional nickname from the requirement.
    pub nick: Option<String>,
    /// Allocated resource identifier (serial number, port path).
    pub resource_id: Option<String>,
    /// Platform name.
    pub platform: Option<String>,
    /// Device type tag (`hardware`, `serial`, `process`, ...).
    pub kind: String,
}

impl DeviceInfo {
    /// Display name: the nickname, or `dut<index>`.
    pub fn name(&self) -> String {
        self.nick
            .clone()
            .unwrap_or_else(|| format!("dut{}", self.index))
    }
}

/// Device connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed, transport not opened.
    Unopened,
    /// Transport open, not yet serviced by a dispatcher.
    Connected,
    /// Registered with a dispatcher.
    Running,
    /// Closed; no further I/O.
    Closed,
}

/// Selects a device by 1-based index or nickname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRef {
    /// 1-based index.
    Index(usize),
    /// Nickname.
    Nick(String),
}

impl From<usize> for DeviceRef {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for DeviceRef {
    fn from(text: &str) -> Self {
        match text.parse() {
            Ok(index) => Self::Index(index),
            Err(_) => Self::Nick(text.to_string()),
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "#{index}"),
            Self::Nick(nick) => write!(f, "'{nick}'"),
        }
    }
}

/// Find a device in `devices` by reference.
pub fn find_device<'a>(devices: &'a [Arc<Device>], target: &DeviceRef) -> Result<&'a Arc<Device>> {
    let found = match target {
        DeviceRef::Index(index) => devices.iter().find(|d| d.index() == *index),
        DeviceRef::Nick(nick) => devices.iter().find(|d| d.info.nick.as_deref() == Some(nick.as_str())),
    };
    found.ok_or_else(|| Error::Lookup(format!("no device {target} (have {})", devices.len())))
}

/// What the dispatcher learned from one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineOutcome {
    /// Part of the outstanding response.
    Collected,
    /// Completed the outstanding response.
    Resolved,
    /// Nothing outstanding.
    Unsolicited,
    /// Nothing outstanding, yet the line carried a return code.
    UnrequestedRetcode,
}

/// How a request was accepted by [`Device::try_install`].
#[derive(Debug)]
pub(crate) enum Installed {
    /// Synchronous; only the holder of this ticket takes the response.
    Owned(u64),
    /// Asynchronous; the response lands in the slot.
    Pending(Arc<AsyncSlot>),
    /// Fire-and-forget.
    Queued,
}

struct PendingAsync {
    slot: Arc<AsyncSlot>,
    expected: Option<i32>,
    command: String,
}

struct DeviceState {
    lifecycle: Lifecycle,
    query: Option<CommandRequest>,
    waiting: Option<CommandRequest>,
    response_ready: bool,
    owner: Option<u64>,
    tickets: u64,
    response: Option<CommandResponse>,
    last: Option<CommandResponse>,
    response_lines: Vec<String>,
    deadline: Option<Instant>,
    pending_async: Option<PendingAsync>,
    async_failure: Option<Error>,
    traces: Vec<String>,
    previous: Option<String>,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Unopened,
            query: None,
            waiting: None,
            response_ready: true,
            owner: None,
            tickets: 0,
            response: None,
            last: None,
            response_lines: Vec::new(),
            deadline: None,
            pending_async: None,
            async_failure: None,
            traces: Vec::new(),
            previous: None,
        }
    }

    fn outstanding(&self) -> Option<&CommandRequest> {
        self.waiting.as_ref().or(self.query.as_ref())
    }
}

/// A device under test.
pub struct Device {
    info: DeviceInfo,
    requirement: DeviceRequirement,
    transport: Mutex<Box<dyn Transport>>,
    state: Mutex<DeviceState>,
    ready: Condvar,
    alive: AtomicBool,
    polled: AtomicBool,
    store_traces: AtomicBool,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Create a device around an unopened transport.
    pub fn new(
        info: DeviceInfo,
        requirement: DeviceRequirement,
        transport: impl Transport + 'static,
    ) -> Self {
        Self {
            info,
            requirement,
            transport: Mutex::new(Box::new(transport)),
            state: Mutex::new(DeviceState::new()),
            ready: Condvar::new(),
            alive: AtomicBool::new(true),
            polled: AtomicBool::new(true),
            store_traces: AtomicBool::new(true),
        }
    }

    /// Identity.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// 1-based index.
    pub fn index(&self) -> usize {
        self.info.index
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.info.name()
    }

    /// Requirement this device was built from.
    pub fn requirement(&self) -> &DeviceRequirement {
        &self.requirement
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    /// `false` once the transport failed.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// `true` once closed.
    pub fn is_closed(&self) -> bool {
        self.lifecycle() == Lifecycle::Closed
    }

    /// Open the transport.
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Unopened => {},
            Lifecycle::Closed => {
                return Err(Error::DeviceConnection(format!("{} is closed", self.name())));
            },
            Lifecycle::Connected | Lifecycle::Running => return Ok(()),
        }
        self.transport
            .lock()
            .open()
            .map_err(|e| match e {
                Error::DeviceConnection(_) => e,
                other => Error::DeviceConnection(format!("{}: {other}", self.name())),
            })?;
        debug!("{} connected via {}", self.name(), self.transport.lock().name());
        state.lifecycle = Lifecycle::Connected;
        Ok(())
    }

    /// Close the transport, releasing any waiter with the dead-device sentinel.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            state.lifecycle = Lifecycle::Closed;
            self.resolve_dead(&mut state);
        }
        debug!("Closing {}", self.name());
        self.transport.lock().close()
    }

    /// Collected trace lines.
    pub fn traces(&self) -> Vec<String> {
        self.state.lock().traces.clone()
    }

    /// Drop collected trace lines.
    pub fn clear_traces(&self) {
        self.state.lock().traces.clear();
    }

    /// Enable or disable trace collection.
    pub fn set_store_traces(&self, enabled: bool) {
        self.store_traces.store(enabled, Ordering::Relaxed);
    }

    /// Whether any collected trace line matches.
    pub fn traces_contain(&self, matcher: &Matcher) -> bool {
        self.state
            .lock()
            .traces
            .iter()
            .any(|line| matcher.find(line).is_some())
    }

    /// Text of the last submitted command.
    pub fn previous_command(&self) -> Option<String> {
        self.state.lock().previous.clone()
    }

    /// Whether a request is queued, in flight, or resolved but unread.
    pub fn has_outstanding(&self) -> bool {
        let state = self.state.lock();
        !state.response_ready || state.owner.is_some()
    }

    /// Block until the outstanding request resolves or its deadline passes.
    ///
    /// Returns a copy of the latest response and leaves the submitter's own
    /// copy in place. Returns an empty response when nothing was ever
    /// submitted. A dead device yields a [`ReturnCode::DeviceDied`] response,
    /// not an error.
    pub fn await_ready(&self) -> Result<CommandResponse> {
        let mut state = self.state.lock();
        loop {
            self.check_alive(&mut state);
            if state.response_ready {
                return Ok(state.last.clone().unwrap_or_default());
            }
            self.check_unowned(&mut state)?;
            self.ready.wait_for(&mut state, POLL_INTERVAL);
        }
    }

    /// Block until nothing is outstanding and no response is left unread.
    pub(crate) fn await_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            self.check_alive(&mut state);
            if state.response_ready && state.owner.is_none() {
                return Ok(());
            }
            self.check_unowned(&mut state)?;
            self.ready.wait_for(&mut state, POLL_INTERVAL);
        }
    }

    /// Block until the synchronous request holding `ticket` resolves and take its response.
    pub(crate) fn await_response(&self, ticket: u64) -> Result<CommandResponse> {
        let mut state = self.state.lock();
        loop {
            self.check_alive(&mut state);
            if state.owner != Some(ticket) {
                return Err(Error::StepError(format!("{}: request was dropped", self.name())));
            }
            if let Some(response) = state.response.take() {
                state.owner = None;
                self.ready.notify_all();
                return Ok(response);
            }
            if let Some(err) = self.expire(&mut state) {
                return Err(err);
            }
            self.ready.wait_for(&mut state, POLL_INTERVAL);
        }
    }

    /// Block until `slot` holds a response.
    pub(crate) fn await_slot(&self, slot: &Arc<AsyncSlot>) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            self.check_alive(&mut state);
            if slot.get().is_some() {
                return Ok(());
            }
            let owned = state
                .pending_async
                .as_ref()
                .is_some_and(|pending| Arc::ptr_eq(&pending.slot, slot));
            if !owned {
                slot.install(CommandResponse::default());
                return Ok(());
            }
            if let Some(err) = self.expire(&mut state) {
                return Err(err);
            }
            self.ready.wait_for(&mut state, POLL_INTERVAL);
        }
    }

    fn check_alive(&self, state: &mut DeviceState) {
        if !state.response_ready && !self.is_alive() {
            self.resolve_dead(state);
        }
    }

    /// Enforce deadline and interrupt for requests nobody else is waiting on.
    ///
    /// A synchronous submitter polices its own request, so an owned one is
    /// only left on interrupt.
    fn check_unowned(&self, state: &mut DeviceState) -> Result<()> {
        if state.owner.is_some() {
            return if crate::is_interrupted_requested() {
                Err(Error::Interrupted)
            } else {
                Ok(())
            };
        }
        self.expire(state).map_or(Ok(()), Err)
    }

    /// Abandon the outstanding request once its deadline passed or an interrupt arrived.
    fn expire(&self, state: &mut DeviceState) -> Option<Error> {
        if state.response_ready {
            return None;
        }
        let elapsed = state.outstanding().map(|r| r.submitted_at.elapsed()).unwrap_or_default();
        if state.deadline.is_some_and(|deadline| Instant::now() > deadline) {
            let command = state
                .outstanding()
                .map(|r| r.text.clone())
                .or_else(|| state.previous.clone())
                .unwrap_or_default();
            error!("{} CMD timeout: {command}", self.name());
            self.abandon(state, CommandResponse::timed_out(elapsed));
            return Some(Error::Timeout(format!("{}: '{command}'", self.name())));
        }
        if crate::is_interrupted_requested() {
            self.abandon(state, CommandResponse::timed_out(elapsed));
            return Some(Error::Interrupted);
        }
        None
    }

    fn check_async(&self, pending: &PendingAsync, response: &CommandResponse) -> Option<Error> {
        let expected = pending.expected?;
        if response.retcode == Some(ReturnCode::Value(expected)) {
            return None;
        }
        Some(match response.retcode {
            Some(ReturnCode::DeviceDied) => Error::DeviceDied(self.name()),
            _ if response.timed_out => Error::Timeout(format!("{}: '{}'", self.name(), pending.command)),
            other => Error::CommandFailed {
                device: self.index(),
                command: pending.command.clone(),
                reason: format!(
                    "asynchronous command returned unexpected result ({})",
                    describe_retcode(other)
                ),
                trailing: response.lines.clone(),
            },
        })
    }

    fn clear_request(state: &mut DeviceState) {
        state.query = None;
        state.waiting = None;
        state.deadline = None;
        state.response_lines.clear();
        state.response_ready = true;
    }

    /// Hand the response of the outstanding request to whoever submitted it.
    ///
    /// An asynchronous request gets it in its slot, a synchronous one in the
    /// owner's response field. Fire-and-forget responses are only kept as `last`.
    fn finish(&self, state: &mut DeviceState, response: CommandResponse) {
        Self::clear_request(state);
        state.last = Some(response.clone());
        if let Some(pending) = state.pending_async.take() {
            state.async_failure = self.check_async(&pending, &response);
            pending.slot.install(response);
        } else if state.owner.is_some() {
            state.response = Some(response);
        }
        self.ready.notify_all();
    }

    /// Drop the outstanding request so the dispatcher does not wait on it.
    fn abandon(&self, state: &mut DeviceState, filler: CommandResponse) {
        Self::clear_request(state);
        state.response = None;
        state.owner = None;
        state.last = Some(filler.clone());
        if let Some(pending) = state.pending_async.take() {
            pending.slot.install(filler);
        }
        self.ready.notify_all();
    }

    fn resolve_dead(&self, state: &mut DeviceState) {
        if state.response_ready {
            return;
        }
        let elapsed = state
            .outstanding()
            .map(|r| r.submitted_at.elapsed())
            .unwrap_or_default();
        let lines = std::mem::take(&mut state.response_lines);
        self.finish(state, CommandResponse::device_died(lines, elapsed));
    }

    pub(crate) fn take_async_failure(&self) -> Option<Error> {
        self.state.lock().async_failure.take()
    }

    /// Queue a request unless one is outstanding; gives the request back if busy.
    pub(crate) fn try_install(
        &self,
        mut request: CommandRequest,
    ) -> std::result::Result<Installed, CommandRequest> {
        let mut state = self.state.lock();
        if !state.response_ready || state.owner.is_some() {
            return Err(request);
        }
        request.submitted_at = Instant::now();
        state.response_ready = false;
        state.response = None;
        state.response_lines.clear();
        state.deadline = Some(request.deadline());
        state.previous = Some(request.text.clone());
        let installed = match request.mode {
            CommandMode::Asynchronous => {
                let slot = Arc::new(AsyncSlot::default());
                state.pending_async = Some(PendingAsync {
                    slot: Arc::clone(&slot),
                    expected: request.expected_retcode,
                    command: request.text.clone(),
                });
                Installed::Pending(slot)
            },
            CommandMode::Synchronous => {
                state.tickets += 1;
                state.owner = Some(state.tickets);
                Installed::Owned(state.tickets)
            },
            CommandMode::FireAndForget => Installed::Queued,
        };
        state.query = Some(request);
        Ok(installed)
    }

    /// Install the dispatcher's notifier; `false` means the device must be polled.
    pub(crate) fn attach(&self, notifier: LineNotifier) -> bool {
        let independent = self.transport.lock().set_notifier(notifier);
        self.polled.store(!independent, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Connected {
            state.lifecycle = Lifecycle::Running;
        }
        independent
    }

    /// Whether the dispatcher should visit this device without a signal.
    pub(crate) fn needs_poll(&self) -> bool {
        if self.is_closed() || !self.is_alive() {
            return false;
        }
        self.polled.load(Ordering::SeqCst) || self.state.lock().waiting.is_some()
    }

    /// Take the queued request unless a read is outstanding.
    pub(crate) fn take_query(&self) -> Option<CommandRequest> {
        let mut state = self.state.lock();
        if state.waiting.is_some() {
            return None;
        }
        state.query.take()
    }

    pub(crate) fn write_raw(&self, text: &str) -> Result<()> {
        self.transport.lock().write_line(text)
    }

    pub(crate) fn read_available(&self) -> Result<Option<String>> {
        self.transport.lock().read_line(Duration::ZERO)
    }

    /// Record that `request` was written.
    pub(crate) fn on_written(&self, request: CommandRequest) {
        let mut state = self.state.lock();
        if state.response_ready {
            debug!("{}: '{}' was abandoned before it was written", self.name(), request.text);
            return;
        }
        if request.mode.collects_response() {
            state.waiting = Some(request);
        } else {
            state.deadline = None;
            state.response_ready = true;
            self.ready.notify_all();
        }
    }

    /// Account for one received line.
    pub(crate) fn on_line(&self, line: &str) -> LineOutcome {
        let retcode = parse_retcode(line);
        let mut state = self.state.lock();
        if self.store_traces.load(Ordering::Relaxed) {
            state.traces.push(line.to_string());
        }
        let Some(request) = state.waiting.take() else {
            return if retcode.is_some() {
                LineOutcome::UnrequestedRetcode
            } else {
                LineOutcome::Unsolicited
            };
        };
        state.response_lines.push(line.to_string());
        let Some(code) = retcode else {
            state.waiting = Some(request);
            return LineOutcome::Collected;
        };
        let lines = std::mem::take(&mut state.response_lines);
        let elapsed = request.submitted_at.elapsed();
        let response = match code {
            ReturnCode::DeviceDied => {
                warn!("{}: reboot detected while running '{}'", self.name(), request.text);
                CommandResponse::device_died(lines, elapsed)
            },
            ReturnCode::Value(_) => CommandResponse {
                retcode: Some(code),
                lines,
                elapsed,
                timed_out: false,
            },
        };
        self.finish(&mut state, response);
        LineOutcome::Resolved
    }

    /// Mark the device dead and release any waiter.
    pub(crate) fn on_lost(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.resolve_dead(&mut self.state.lock());
    }
}
