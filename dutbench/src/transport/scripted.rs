//! In-memory transport for exercising benches without hardware.

use {
    crate::{
        error::{Error, Result},
        transport::Transport,
    },
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::{Duration, Instant},
    },
};

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

#[derive(Default)]
struct Shared {
    output: Mutex<VecDeque<String>>,
    written: Mutex<Vec<String>>,
    dead: AtomicBool,
    closed: AtomicBool,
}

/// A device simulated by a closure mapping each written line to output lines.
///
/// The transport has no reader thread, so the dispatcher polls it.
pub struct ScriptedTransport {
    name: String,
    responder: Responder,
    shared: Arc<Shared>,
    open: bool,
}

/// Handle for injecting output into, inspecting, or killing a [`ScriptedTransport`].
#[derive(Clone)]
pub struct ScriptedControl {
    shared: Arc<Shared>,
}

impl ScriptedTransport {
    /// Create a transport whose responses come from `responder`.
    pub fn new<F>(name: impl Into<String>, responder: F) -> Self
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        Self {
            name: name.into(),
            responder: Box::new(responder),
            shared: Arc::new(Shared::default()),
            open: false,
        }
    }

    /// A device answering `echo <text>` with the text and `retcode: 0`, and
    /// anything else with `retcode: -5` (unknown command).
    pub fn echo(name: impl Into<String>) -> Self {
        Self::new(name, |line| match line.strip_prefix("echo ") {
            Some(text) => vec![text.to_string(), "retcode: 0".to_string()],
            None if line == "echo" => vec!["retcode: 0".to_string()],
            None => vec!["retcode: -5".to_string()],
        })
    }

    /// Control handle sharing this transport's buffers.
    pub fn control(&self) -> ScriptedControl {
        ScriptedControl {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl ScriptedControl {
    /// Queue a line as if the device printed it unprompted.
    pub fn emit(&self, line: impl Into<String>) {
        self.shared.output.lock().push_back(line.into());
    }

    /// Make every further read fail, as if the cable was pulled.
    pub fn kill(&self) {
        self.shared.dead.store(true, Ordering::SeqCst);
    }

    /// Lines written to the device so far.
    pub fn written(&self) -> Vec<String> {
        self.shared.written.lock().clone()
    }

    /// Whether the transport was closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn open(&mut self) -> Result<()> {
        if self.shared.dead.load(Ordering::SeqCst) {
            return Err(Error::DeviceConnection(format!("{} is dead", self.name)));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        if !self.open || self.shared.dead.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("{} is not connected", self.name)));
        }
        self.shared.written.lock().push(line.to_string());
        let reply = (self.responder)(line);
        self.shared.output.lock().extend(reply);
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.dead.load(Ordering::SeqCst) {
                return Err(Error::Transport(format!("{} connection lost", self.name)));
            }
            if let Some(line) = self.shared.output.lock().pop_front() {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
