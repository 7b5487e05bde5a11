//! Serial port transport using the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        transport::{LineAssembler, LineNotifier, LineQueue, Transport},
    },
    log::{debug, trace, warn},
    serialport::{ClearBuffer, SerialPort},
    std::{
        io::{ErrorKind, Read, Write},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout of the background reader; bounds how fast `close` returns.
    pub poll_interval: Duration,
    /// Terminator appended by `write_line`.
    pub line_ending: String,
    /// Use RTS/CTS flow control.
    pub hardware_flow: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            poll_interval: Duration::from_millis(50),
            line_ending: "\n".to_string(),
            hardware_flow: false,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the line terminator.
    #[must_use]
    pub fn with_line_ending(mut self, ending: impl Into<String>) -> Self {
        self.line_ending = ending.into();
        self
    }

    /// Enable or disable RTS/CTS flow control.
    #[must_use]
    pub fn with_hardware_flow(mut self, enabled: bool) -> Self {
        self.hardware_flow = enabled;
        self
    }
}

/// Serial device connection with a background line reader.
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
    queue: Arc<LineQueue>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// Create an unopened transport.
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: None,
            queue: LineQueue::new(),
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    fn spawn_reader(&mut self, mut port: Box<dyn SerialPort>) -> Result<()> {
        let queue = Arc::clone(&self.queue);
        let stop = Arc::clone(&self.stop);
        let name = self.config.port_name.clone();
        let handle = thread::Builder::new()
            .name(format!("serial-reader:{name}"))
            .spawn(move || {
                let mut assembler = LineAssembler::new();
                let mut buf = [0u8; 1024];
                while !stop.load(Ordering::Relaxed) {
                    match port.read(&mut buf) {
                        Ok(0) => {},
                        Ok(n) => {
                            trace!("{name} <- {} bytes", n);
                            for line in assembler.feed(&buf[..n]) {
                                queue.push(line);
                            }
                        },
                        Err(e) if e.kind() == ErrorKind::TimedOut => {},
                        Err(e) if e.kind() == ErrorKind::Interrupted => {},
                        Err(e) => {
                            warn!("{name}: serial read failed: {e}");
                            queue.fail(format!("{name}: {e}"));
                            break;
                        },
                    }
                }
                if let Some(line) = assembler.finish() {
                    queue.push(line);
                }
            })?;
        self.reader = Some(handle);
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let flow = if self.config.hardware_flow {
            serialport::FlowControl::Hardware
        } else {
            serialport::FlowControl::None
        };
        let port = serialport::new(&self.config.port_name, self.config.baud_rate)
            .timeout(self.config.poll_interval)
            .flow_control(flow)
            .open()
            .map_err(|e| {
                Error::DeviceConnection(format!("{}: {e}", self.config.port_name))
            })?;
        port.clear(ClearBuffer::All)?;
        debug!(
            "Opened {} at {} baud",
            self.config.port_name, self.config.baud_rate
        );

        self.queue.reset();
        self.stop.store(false, Ordering::Relaxed);
        let reader = port.try_clone()?;
        self.port = Some(port);
        self.spawn_reader(reader)
    }

    fn close(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if self.port.take().is_some() {
            debug!("Closed {}", self.config.port_name);
        }
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let port = self.port.as_mut().ok_or_else(|| {
            Error::Transport(format!("{} is not open", self.config.port_name))
        })?;
        trace!("{} -> {line}", self.config.port_name);
        port.write_all(line.as_bytes())?;
        port.write_all(self.config.line_ending.as_bytes())?;
        port.flush()?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        self.queue.pop(timeout)
    }

    fn name(&self) -> &str {
        &self.config.port_name
    }

    fn set_notifier(&mut self, notifier: LineNotifier) -> bool {
        self.queue.set_notifier(notifier);
        true
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
