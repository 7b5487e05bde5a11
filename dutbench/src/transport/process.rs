//! Spawned-process transport: a program's stdin/stdout acting as a device.

use {
    crate::{
        error::{Error, Result},
        transport::{LineAssembler, LineNotifier, LineQueue, Transport},
    },
    log::{debug, trace, warn},
    std::{
        io::{ErrorKind, Read, Write},
        path::PathBuf,
        process::{Child, ChildStdin, Command, Stdio},
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// A device backed by a child process.
///
/// stdout and stderr both feed the device's line buffer. The transport is
/// considered dead once both streams reach end-of-file.
pub struct ProcessTransport {
    program: PathBuf,
    args: Vec<String>,
    name: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    queue: Arc<LineQueue>,
    readers: Vec<JoinHandle<()>>,
}

impl ProcessTransport {
    /// Create an unopened process transport.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let program = program.into();
        let name = program
            .file_name()
            .map_or_else(|| program.display().to_string(), |n| n.to_string_lossy().into_owned());
        Self {
            program,
            args,
            name,
            child: None,
            stdin: None,
            queue: LineQueue::new(),
            readers: Vec::new(),
        }
    }

    /// Operating system process id, if running.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn spawn_reader<R>(&mut self, stream: R, label: &'static str, open_streams: &Arc<AtomicUsize>) -> Result<()>
    where
        R: Read + Send + 'static,
    {
        let queue = Arc::clone(&self.queue);
        let open_streams = Arc::clone(open_streams);
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("{label}:{name}"))
            .spawn(move || {
                let mut stream = stream;
                let mut assembler = LineAssembler::new();
                let mut buf = [0u8; 1024];
                let reason = loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break format!("{name}: {label} closed"),
                        Ok(n) => {
                            for line in assembler.feed(&buf[..n]) {
                                trace!("{name} {label}: {line}");
                                queue.push(line);
                            }
                        },
                        Err(e) if e.kind() == ErrorKind::Interrupted => {},
                        Err(e) => break format!("{name}: {label} read failed: {e}"),
                    }
                };
                if let Some(line) = assembler.finish() {
                    queue.push(line);
                }
                if open_streams.fetch_sub(1, Ordering::SeqCst) == 1 {
                    debug!("{reason}");
                    queue.fail(reason);
                }
            })?;
        self.readers.push(handle);
        Ok(())
    }
}

impl Transport for ProcessTransport {
    fn open(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::DeviceConnection(format!("failed to start {}: {e}", self.program.display()))
            })?;
        debug!("Started {} (pid {})", self.program.display(), child.id());

        self.queue.reset();
        let open_streams = Arc::new(AtomicUsize::new(2));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.stdin = child.stdin.take();
        self.child = Some(child);

        match (stdout, stderr) {
            (Some(stdout), Some(stderr)) => {
                self.spawn_reader(stdout, "stdout", &open_streams)?;
                self.spawn_reader(stderr, "stderr", &open_streams)?;
                Ok(())
            },
            _ => Err(Error::DeviceConnection(format!(
                "{}: process pipes unavailable",
                self.name
            ))),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => debug!("{} already exited: {status}", self.name),
                _ => {
                    if let Err(e) = child.kill() {
                        warn!("Failed to kill {}: {e}", self.name);
                    }
                    let _ = child.wait();
                    debug!("Stopped {}", self.name);
                },
            }
        }
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Transport(format!("{} is not running", self.name)))?;
        trace!("{} -> {line}", self.name);
        let written = stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .and_then(|()| stdin.flush());
        written.map_err(|e| Error::Transport(format!("{}: write failed: {e}", self.name)))
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        self.queue.pop(timeout)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_notifier(&mut self, notifier: LineNotifier) -> bool {
        self.queue.set_notifier(notifier);
        true
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
