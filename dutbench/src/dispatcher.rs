//! The per-run device dispatcher.
//!
//! One coordinating thread services every registered device. Producers
//! (a submit, or a reader thread with a fresh line) push the device onto a
//! channel; the thread pops it and does one of three things:
//!
//! 1. a request is queued and nothing is in flight: write it,
//! 2. otherwise: read what is buffered, resolving the outstanding response
//!    on `retcode:` and publishing every line to the [`EventBus`].
//!
//! Devices whose transport has no reader thread are also swept periodically.
//! All reads are non-blocking, so a silent device never stalls the others.

use {
    crate::{
        command::{AsyncResponse, CommandRequest, CommandResponse, Submitted},
        device::{Device, Installed, LineOutcome},
        error::{Error, Result},
        events::{Event, EventBus, EventKind},
    },
    flume::{Receiver, RecvTimeoutError, Sender},
    log::{debug, error, info, trace, warn},
    parking_lot::Mutex,
    std::{
        sync::Arc,
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

/// How often devices without a reader thread are polled.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(10);

enum Signal {
    Attention(Arc<Device>),
    Shutdown,
}

struct Shared {
    devices: Mutex<Vec<Arc<Device>>>,
    events: Arc<EventBus>,
}

/// Owns the coordinating thread for one run.
///
/// Dropping the dispatcher stops the thread; devices are not closed.
pub struct Dispatcher {
    tx: Sender<Signal>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start a dispatcher thread with a fresh event bus.
    pub fn new() -> Result<Self> {
        Self::with_events(Arc::new(EventBus::new()))
    }

    /// Start a dispatcher thread publishing to `events`.
    pub fn with_events(events: Arc<EventBus>) -> Result<Self> {
        let (tx, rx) = flume::unbounded();
        let shared = Arc::new(Shared {
            devices: Mutex::new(Vec::new()),
            events,
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("dut-dispatcher".to_string())
            .spawn(move || run(&rx, &worker_shared))?;
        Ok(Self {
            tx,
            shared,
            worker: Some(worker),
        })
    }

    /// Event bus receiving every line from registered devices.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.shared.events
    }

    /// Registered devices, in registration order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.shared.devices.lock().clone()
    }

    /// Start servicing an opened device.
    pub fn register(&self, device: &Arc<Device>) {
        let tx = self.tx.clone();
        let weak = Arc::downgrade(device);
        let independent = device.attach(Arc::new(move || {
            if let Some(device) = weak.upgrade() {
                let _ = tx.send(Signal::Attention(device));
            }
        }));
        debug!(
            "Registered {} ({})",
            device.name(),
            if independent { "reader thread" } else { "polled" }
        );
        let mut devices = self.shared.devices.lock();
        if !devices.iter().any(|d| Arc::ptr_eq(d, device)) {
            devices.push(Arc::clone(device));
        }
        drop(devices);
        self.signal(device);
    }

    /// Stop servicing a device.
    pub fn unregister(&self, device: &Arc<Device>) {
        self.shared
            .devices
            .lock()
            .retain(|d| !Arc::ptr_eq(d, device));
    }

    /// Submit a request, first waiting for any earlier request on the device.
    ///
    /// - synchronous: blocks and returns [`Submitted::Completed`]
    /// - asynchronous: returns [`Submitted::Pending`] right away
    /// - fire-and-forget: returns [`Submitted::Sent`] once queued
    pub fn submit(&self, device: &Arc<Device>, request: CommandRequest) -> Result<Submitted> {
        let mut request = request;
        loop {
            if device.is_closed() {
                return Err(Error::DeviceConnection(format!("{} is closed", device.name())));
            }
            settle_previous(device)?;
            if !device.is_alive() {
                return Err(Error::DeviceDied(device.name()));
            }
            match device.try_install(request) {
                Ok(installed) => {
                    self.signal(device);
                    return match installed {
                        Installed::Owned(ticket) => Ok(Submitted::Completed(device.await_response(ticket)?)),
                        Installed::Pending(slot) => {
                            Ok(Submitted::Pending(AsyncResponse::new(Arc::clone(device), slot)))
                        },
                        Installed::Queued => Ok(Submitted::Sent),
                    };
                },
                Err(returned) => request = returned,
            }
        }
    }

    /// Block until the device's outstanding request resolves.
    ///
    /// Returns a copy of the response; the submitter still receives its own.
    pub fn await_ready(&self, device: &Device) -> Result<CommandResponse> {
        device.await_ready()
    }

    /// Stop the dispatcher thread.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.tx.send(Signal::Shutdown);
            if worker.join().is_err() {
                error!("Dispatcher thread panicked");
            }
        }
    }

    fn signal(&self, device: &Arc<Device>) {
        let _ = self.tx.send(Signal::Attention(Arc::clone(device)));
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wait out the previous request and surface a failed asynchronous result.
///
/// Never consumes the response of another caller's synchronous request.
fn settle_previous(device: &Device) -> Result<()> {
    device.await_idle()?;
    match device.take_async_failure() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn run(rx: &Receiver<Signal>, shared: &Shared) {
    trace!("Dispatcher started");
    let mut last_sweep = Instant::now();
    loop {
        match rx.recv_timeout(SWEEP_INTERVAL) {
            Ok(Signal::Attention(device)) => service(&shared.events, &device),
            Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {},
        }
        if last_sweep.elapsed() >= SWEEP_INTERVAL {
            let devices = shared.devices.lock().clone();
            for device in devices.iter().filter(|d| d.needs_poll()) {
                service(&shared.events, device);
            }
            last_sweep = Instant::now();
        }
    }
    trace!("Dispatcher stopped");
}

fn service(events: &EventBus, device: &Arc<Device>) {
    if device.is_closed() || !device.is_alive() {
        return;
    }
    match device.take_query() {
        Some(request) => write_request(events, device, request),
        None => drain(events, device),
    }
}

fn write_request(events: &EventBus, device: &Device, request: CommandRequest) {
    debug!("{} --> {}", device.name(), request.text);
    match device.write_raw(&request.text) {
        Ok(()) => device.on_written(request),
        Err(e) => {
            error!("{}: writing '{}' failed: {e}", device.name(), request.text);
            lost(events, device, &e);
        },
    }
}

fn drain(events: &EventBus, device: &Device) {
    loop {
        match device.read_available() {
            Ok(Some(line)) => {
                debug!("<{}: {line}", device.name());
                let outcome = device.on_line(&line);
                if outcome == LineOutcome::UnrequestedRetcode {
                    warn!("{}: unrequested retcode in '{line}'", device.name());
                }
                events.publish(&Event::line(device.index(), line));
                if outcome == LineOutcome::Resolved {
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                lost(events, device, &e);
                break;
            },
        }
    }
}

fn lost(events: &EventBus, device: &Device, reason: &Error) {
    if !device.is_alive() {
        return;
    }
    info!("{} connection lost: {reason}", device.name());
    device.on_lost();
    events.publish(&Event {
        kind: EventKind::DeviceLost,
        source: Some(device.index()),
        line: reason.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            command::{CommandMode, CommandOptions, ReturnCode},
            device::DeviceInfo,
            resource::DeviceRequirement,
            transport::{ScriptedControl, ScriptedTransport},
        },
    };

    fn echo_device(index: usize) -> (Arc<Device>, ScriptedControl) {
        let transport = ScriptedTransport::echo(format!("sim{index}"));
        let control = transport.control();
        let device = Device::new(
            DeviceInfo {
                index,
                nick: None,
                resource_id: None,
                platform: None,
                kind: "scripted".into(),
            },
            DeviceRequirement::default(),
            transport,
        );
        device.open().unwrap();
        (Arc::new(device), control)
    }

    fn options() -> CommandOptions {
        CommandOptions::default().with_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_synchronous_round_trip() {
        let dispatcher = Dispatcher::new().unwrap();
        let (dev, _) = echo_device(1);
        dispatcher.register(&dev);
        let submitted = dispatcher
            .submit(&dev, CommandRequest::new("echo hi", &options()))
            .unwrap();
        let response = submitted.response().unwrap();
        assert_eq!(response.retcode, Some(ReturnCode::Value(0)));
        assert_eq!(response.lines, vec!["hi", "retcode: 0"]);
    }

    #[test]
    fn test_requests_are_written_in_order() {
        let dispatcher = Dispatcher::new().unwrap();
        let (dev, control) = echo_device(1);
        dispatcher.register(&dev);
        let async_opts = options().with_mode(CommandMode::Asynchronous);
        let first = dispatcher
            .submit(&dev, CommandRequest::new("echo 1", &async_opts))
            .unwrap();
        let second = dispatcher
            .submit(&dev, CommandRequest::new("echo 2", &async_opts))
            .unwrap();
        let third = dispatcher
            .submit(&dev, CommandRequest::new("echo 3", &options()))
            .unwrap();
        for (n, submitted) in [first, second, third].into_iter().enumerate() {
            let response = submitted.into_response().unwrap();
            assert_eq!(response.lines[0], (n + 1).to_string());
        }
        assert_eq!(control.written(), vec!["echo 1", "echo 2", "echo 3"]);
    }

    #[test]
    fn test_unsolicited_lines_are_published() {
        let dispatcher = Dispatcher::new().unwrap();
        let (dev, control) = echo_device(2);
        dispatcher.register(&dev);
        control.emit("boot done");
        let found = dispatcher.events().wait_for(
            EventKind::LineReceived,
            crate::events::Matcher::parse("boot").unwrap(),
            Some(2),
            Duration::from_secs(5),
        );
        assert_eq!(found.unwrap().line, "boot done");
    }

    #[test]
    fn test_dead_device_resolves_waiter_with_sentinel() {
        let dispatcher = Dispatcher::new().unwrap();
        let transport = ScriptedTransport::new("mute", |_| Vec::new());
        let control = transport.control();
        let dev = Arc::new(Device::new(
            DeviceInfo {
                index: 1,
                nick: None,
                resource_id: None,
                platform: None,
                kind: "scripted".into(),
            },
            DeviceRequirement::default(),
            transport,
        ));
        dev.open().unwrap();
        dispatcher.register(&dev);
        let pending = dispatcher
            .submit(&dev, CommandRequest::new("hang", &options().with_mode(CommandMode::Asynchronous)))
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        control.kill();
        let Submitted::Pending(proxy) = pending else {
            panic!("expected pending response");
        };
        assert_eq!(proxy.retcode().unwrap(), Some(ReturnCode::DeviceDied));
        assert!(matches!(
            dispatcher.submit(&dev, CommandRequest::new("again", &options())),
            Err(Error::DeviceDied(_))
        ));
    }

    #[test]
    fn test_timeout_does_not_wedge_device() {
        let dispatcher = Dispatcher::new().unwrap();
        let transport = ScriptedTransport::new("slow", |line| {
            if line == "slow" {
                Vec::new()
            } else {
                vec!["retcode: 0".to_string()]
            }
        });
        let dev = Arc::new(Device::new(
            DeviceInfo {
                index: 1,
                nick: None,
                resource_id: None,
                platform: None,
                kind: "scripted".into(),
            },
            DeviceRequirement::default(),
            transport,
        ));
        dev.open().unwrap();
        dispatcher.register(&dev);
        let short = options().with_timeout(Duration::from_millis(100));
        assert!(matches!(
            dispatcher.submit(&dev, CommandRequest::new("slow", &short)),
            Err(Error::Timeout(_))
        ));
        let response = dispatcher
            .submit(&dev, CommandRequest::new("fast", &options()))
            .unwrap()
            .into_response()
            .unwrap();
        assert!(response.success());
    }

    #[test]
    fn test_fire_and_forget_returns_immediately() {
        let dispatcher = Dispatcher::new().unwrap();
        let (dev, control) = echo_device(1);
        dispatcher.register(&dev);
        let submitted = dispatcher
            .submit(
                &dev,
                CommandRequest::new("echo off", &options().with_mode(CommandMode::FireAndForget)),
            )
            .unwrap();
        assert!(matches!(submitted, Submitted::Sent));
        let next = dispatcher
            .submit(&dev, CommandRequest::new("echo x", &options()))
            .unwrap()
            .into_response()
            .unwrap();
        assert!(next.success());
        assert_eq!(control.written(), vec!["echo off", "echo x"]);
    }

    #[test]
    fn test_async_proxy_installs_once() {
        let dispatcher = Dispatcher::new().unwrap();
        let (dev, _) = echo_device(1);
        dispatcher.register(&dev);
        let Submitted::Pending(proxy) = dispatcher
            .submit(
                &dev,
                CommandRequest::new("echo once", &options().with_mode(CommandMode::Asynchronous)),
            )
            .unwrap()
        else {
            panic!("expected pending response");
        };
        let first = proxy.wait().unwrap().clone();
        assert!(!proxy.install(CommandResponse::timed_out(Duration::ZERO)));
        assert_eq!(proxy.wait().unwrap(), &first);
        assert_eq!(proxy.lines().unwrap()[0], "once");
    }

    #[test]
    fn test_async_unexpected_result_surfaces_on_next_submit() {
        let dispatcher = Dispatcher::new().unwrap();
        let (dev, _) = echo_device(1);
        dispatcher.register(&dev);
        dispatcher
            .submit(
                &dev,
                CommandRequest::new("bogus", &options().with_mode(CommandMode::Asynchronous)),
            )
            .unwrap();
        let err = dispatcher
            .submit(&dev, CommandRequest::new("echo next", &options()))
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { ref command, .. } if command == "bogus"));
    }

    #[test]
    fn test_concurrent_synchronous_callers_get_their_own_responses() {
        const ROUNDS: usize = 10;
        let dispatcher = Dispatcher::new().unwrap();
        let transport = ScriptedTransport::new("manual", |_| Vec::new());
        let control = transport.control();
        let dev = Arc::new(Device::new(
            DeviceInfo {
                index: 1,
                nick: None,
                resource_id: None,
                platform: None,
                kind: "scripted".into(),
            },
            DeviceRequirement::default(),
            transport,
        ));
        dev.open().unwrap();
        dispatcher.register(&dev);

        let mismatches = thread::scope(|s| {
            let callers: Vec<_> = (0..2)
                .map(|n| {
                    let (dispatcher, dev) = (&dispatcher, &dev);
                    s.spawn(move || {
                        let mut mismatches = 0;
                        for round in 0..ROUNDS {
                            let payload = format!("t{n}-{round}");
                            let response = dispatcher
                                .submit(dev, CommandRequest::new(format!("echo {payload}"), &options()))
                                .unwrap()
                                .into_response()
                                .unwrap();
                            if response.lines.first() != Some(&payload) {
                                mismatches += 1;
                            }
                        }
                        mismatches
                    })
                })
                .collect();

            let mut answered = 0;
            while callers.iter().any(|caller| !caller.is_finished()) {
                let written = control.written();
                for line in &written[answered..] {
                    control.emit(line.trim_start_matches("echo "));
                    control.emit("retcode: 0");
                }
                answered = written.len();
                thread::sleep(Duration::from_millis(5));
            }
            callers.into_iter().map(|caller| caller.join().unwrap()).sum::<usize>()
        });

        assert_eq!(mismatches, 0);
        assert_eq!(control.written().len(), 2 * ROUNDS);
    }
}
