//! Executing commands against the devices of a run.

use {
    crate::{
        command::{
            AsyncResponse, CommandMode, CommandOptions, CommandRequest, CommandResponse,
            ReturnCode, Submitted, describe_retcode,
        },
        device::{Device, DeviceRef, find_device},
        dispatcher::Dispatcher,
        error::{Error, Result},
        events::{EventKind, Flag, Matcher, Subscription},
    },
    log::{debug, error, info, warn},
    std::{sync::Arc, time::Duration},
    uuid::Uuid,
};

/// Attempts made by [`Commands::sync_cli`].
pub const SYNC_RETRIES: usize = 5;

/// Time allowed for each sync attempt.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Trailing trace lines carried by a command failure.
const TRAILING_LINES: usize = 10;

/// Command front end over a dispatcher and the devices of one run.
#[derive(Clone, Copy)]
pub struct Commands<'a> {
    dispatcher: &'a Dispatcher,
    devices: &'a [Arc<Device>],
}

impl<'a> Commands<'a> {
    /// Bind a dispatcher to a device list ordered by index.
    pub fn new(dispatcher: &'a Dispatcher, devices: &'a [Arc<Device>]) -> Self {
        Self {
            dispatcher,
            devices,
        }
    }

    /// Devices commands can target.
    pub fn devices(&self) -> &'a [Arc<Device>] {
        self.devices
    }

    /// Run `text` on one device.
    ///
    /// Waits for any earlier request on the device first. Synchronous
    /// commands are checked against the expected return code here;
    /// asynchronous ones when they are settled.
    pub fn execute(
        &self,
        target: impl Into<DeviceRef>,
        text: &str,
        options: &CommandOptions,
    ) -> Result<Submitted> {
        let device = find_device(self.devices, &target.into())?;
        self.execute_on(device, text, options)
    }

    /// Run `text` synchronously with default options.
    pub fn command(&self, target: impl Into<DeviceRef>, text: &str) -> Result<CommandResponse> {
        self.execute(target, text, &CommandOptions::default())?
            .into_response()
    }

    /// Run `text` on every device.
    ///
    /// Requests go out in index order and may complete in any order. With a
    /// synchronous mode every response is awaited and checked, and the result
    /// is in index order.
    pub fn broadcast(&self, text: &str, options: &CommandOptions) -> Result<Vec<Submitted>> {
        if options.mode != CommandMode::Synchronous {
            return self
                .devices
                .iter()
                .map(|device| self.execute_on(device, text, options))
                .collect();
        }

        let fan_out = options
            .clone()
            .with_mode(CommandMode::Asynchronous)
            .with_expected(None);
        let mut pending = Vec::with_capacity(self.devices.len());
        for device in self.devices {
            debug!("broadcast {} <-- {text}", device.name());
            match self.dispatcher.submit(device, CommandRequest::new(text, &fan_out))? {
                Submitted::Pending(proxy) => pending.push((device, proxy)),
                other => return Err(Error::StepError(format!(
                    "broadcast to {} was not queued asynchronously: {other:?}",
                    device.name()
                ))),
            }
        }

        let mut results = Vec::with_capacity(pending.len());
        for (device, proxy) in pending {
            let response = proxy.wait()?.clone();
            results.push(Submitted::Completed(check_response(device, text, options, response)?));
        }
        Ok(results)
    }

    /// Wait for an asynchronous command and surface its failure, if any.
    pub fn wait_for_async(&self, pending: &AsyncResponse) -> Result<CommandResponse> {
        let response = pending.wait()?.clone();
        match pending.device().take_async_failure() {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }

    /// Send each command in order to one device, stopping at the first failure.
    pub fn send_sequence(
        &self,
        device: &Arc<Device>,
        commands: &[String],
        options: &CommandOptions,
    ) -> Result<()> {
        for text in commands {
            self.execute_on(device, text, options)?.into_response()?;
        }
        Ok(())
    }

    /// Send every device its `init_cli_cmds`.
    pub fn send_init_commands(&self, options: &CommandOptions) -> Result<()> {
        for device in self.devices {
            let commands = &device.requirement().application.init_cli_cmds;
            if !commands.is_empty() {
                info!("Sending init commands to {}", device.name());
                self.send_sequence(device, commands, options)?;
            }
        }
        Ok(())
    }

    /// Send every live device its `post_cli_cmds`, logging failures only.
    pub fn send_post_commands(&self, options: &CommandOptions) {
        for device in self.devices.iter().filter(|d| d.is_alive() && !d.is_closed()) {
            for text in &device.requirement().application.post_cli_cmds {
                let result = self
                    .execute_on(device, text, options)
                    .and_then(Submitted::into_response);
                if let Err(e) = result {
                    warn!("{}: post command '{text}' failed: {e}", device.name());
                }
            }
        }
    }

    /// Check that a device's command line is responsive.
    ///
    /// Sends `echo <token>` and waits for the token to come back, retrying
    /// with a fresh token up to [`SYNC_RETRIES`] times.
    pub fn sync_cli(&self, target: impl Into<DeviceRef>) -> Result<()> {
        let device = find_device(self.devices, &target.into())?;
        self.sync_device(device, SYNC_RETRIES, SYNC_TIMEOUT)
    }

    /// [`Commands::sync_cli`] with explicit retries and per-attempt timeout.
    pub fn sync_device(&self, device: &Arc<Device>, retries: usize, timeout: Duration) -> Result<()> {
        let events = self.dispatcher.events();
        let options = CommandOptions::default()
            .with_timeout(timeout)
            .with_expected(None);
        for attempt in 1..=retries {
            let token = Uuid::new_v4().to_string();
            let flag = Arc::new(Flag::default());
            let id = events.subscribe(
                Subscription::new(EventKind::LineReceived, Matcher::Literal(token.clone()))
                    .with_source(device.index())
                    .with_flag(Arc::clone(&flag)),
            );
            debug!("Sync attempt {attempt}/{retries} on {}", device.name());
            let sent = self
                .execute_on(device, &format!("echo {token}"), &options)
                .and_then(Submitted::into_response);
            match sent {
                Ok(_) if flag.wait(timeout) => return Ok(()),
                Ok(_) => {},
                Err(Error::Timeout(_)) => {},
                Err(e) => {
                    events.unsubscribe(id);
                    return Err(e);
                },
            }
            events.unsubscribe(id);
        }
        Err(Error::StepError(format!(
            "Unable to sync CLI on {} after {retries} attempts",
            device.name()
        )))
    }

    fn execute_on(
        &self,
        device: &Arc<Device>,
        text: &str,
        options: &CommandOptions,
    ) -> Result<Submitted> {
        let submitted = self
            .dispatcher
            .submit(device, CommandRequest::new(text, options))?;
        match submitted {
            Submitted::Completed(response) => {
                check_response(device, text, options, response).map(Submitted::Completed)
            },
            other => Ok(other),
        }
    }
}

/// Compare a completed response against the expected return code.
fn check_response(
    device: &Device,
    text: &str,
    options: &CommandOptions,
    response: CommandResponse,
) -> Result<CommandResponse> {
    if response.timed_out {
        return Err(Error::Timeout(format!("{}: '{text}'", device.name())));
    }
    let Some(expected) = options.expected_retcode else {
        return Ok(response);
    };
    if response.retcode == Some(ReturnCode::Value(expected)) {
        return Ok(response);
    }
    let err = if response.device_dead() {
        Error::DeviceDied(device.name())
    } else {
        let skip = response.lines.len().saturating_sub(TRAILING_LINES);
        Error::CommandFailed {
            device: device.index(),
            command: text.to_string(),
            reason: describe_retcode(response.retcode),
            trailing: response.lines[skip..].to_vec(),
        }
    };
    if options.report_failure {
        error!("{err}");
        Err(err)
    } else {
        warn!("{err} (not reported)");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            device::DeviceInfo,
            resource::DeviceRequirement,
            transport::{ScriptedControl, ScriptedTransport},
        },
    };

    fn echo_devices(count: usize) -> (Vec<Arc<Device>>, Vec<ScriptedControl>) {
        (1..=count)
            .map(|index| {
                let transport = ScriptedTransport::echo(format!("sim{index}"));
                let control = transport.control();
                let device = Device::new(
                    DeviceInfo {
                        index,
                        nick: (index == 2).then(|| "sink".to_string()),
                        resource_id: None,
                        platform: None,
                        kind: "scripted".into(),
                    },
                    DeviceRequirement::default(),
                    transport,
                );
                device.open().unwrap();
                (Arc::new(device), control)
            })
            .unzip()
    }

    fn register(dispatcher: &Dispatcher, devices: &[Arc<Device>]) {
        for device in devices {
            dispatcher.register(device);
        }
    }

    #[test]
    fn test_command_by_nick() {
        let dispatcher = Dispatcher::new().unwrap();
        let (devices, controls) = echo_devices(2);
        register(&dispatcher, &devices);
        let commands = Commands::new(&dispatcher, &devices);
        let response = commands.command("sink", "echo hello").unwrap();
        assert_eq!(response.output().collect::<Vec<_>>(), vec!["hello"]);
        assert!(controls[0].written().is_empty());
    }

    #[test]
    fn test_unexpected_retcode_fails_with_reason() {
        let dispatcher = Dispatcher::new().unwrap();
        let (devices, _) = echo_devices(1);
        register(&dispatcher, &devices);
        let commands = Commands::new(&dispatcher, &devices);
        match commands.command(1, "frobnicate") {
            Err(Error::CommandFailed { device, reason, trailing, .. }) => {
                assert_eq!(device, 1);
                assert_eq!(reason, "unknown command");
                assert_eq!(trailing, vec!["retcode: -5"]);
            },
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_unreported_failure_returns_response() {
        let dispatcher = Dispatcher::new().unwrap();
        let (devices, _) = echo_devices(1);
        register(&dispatcher, &devices);
        let commands = Commands::new(&dispatcher, &devices);
        let options = CommandOptions::default().without_failure_report();
        let response = commands
            .execute(1, "frobnicate", &options)
            .unwrap()
            .into_response()
            .unwrap();
        assert_eq!(response.retcode, Some(ReturnCode::Value(-5)));
    }

    #[test]
    fn test_broadcast_in_index_order() {
        let dispatcher = Dispatcher::new().unwrap();
        let (devices, controls) = echo_devices(3);
        register(&dispatcher, &devices);
        let commands = Commands::new(&dispatcher, &devices);
        let results = commands
            .broadcast("echo hi", &CommandOptions::default())
            .unwrap();
        assert_eq!(results.len(), 3);
        for result in &results {
            let response = result.response().unwrap();
            assert!(response.success());
            assert_eq!(response.lines[0], "hi");
        }
        for control in &controls {
            assert_eq!(control.written(), vec!["echo hi"]);
        }
    }

    #[test]
    fn test_broadcast_reports_failing_device() {
        let dispatcher = Dispatcher::new().unwrap();
        let (devices, _) = echo_devices(2);
        register(&dispatcher, &devices);
        let commands = Commands::new(&dispatcher, &devices);
        let err = commands
            .broadcast("nope", &CommandOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { device: 1, .. }));
    }

    #[test]
    fn test_wait_for_async_surfaces_failure_once() {
        let dispatcher = Dispatcher::new().unwrap();
        let (devices, _) = echo_devices(1);
        register(&dispatcher, &devices);
        let commands = Commands::new(&dispatcher, &devices);
        let options = CommandOptions::default().with_mode(CommandMode::Asynchronous);
        let Submitted::Pending(proxy) = commands.execute(1, "nope", &options).unwrap() else {
            panic!("expected pending response");
        };
        assert!(commands.wait_for_async(&proxy).is_err());
        assert!(commands.command(1, "echo after").is_ok());
    }

    #[test]
    fn test_sync_cli() {
        let dispatcher = Dispatcher::new().unwrap();
        let (devices, controls) = echo_devices(1);
        register(&dispatcher, &devices);
        let commands = Commands::new(&dispatcher, &devices);
        commands.sync_cli(1).unwrap();
        assert!(controls[0].written()[0].starts_with("echo "));
    }

    #[test]
    fn test_sync_cli_gives_up() {
        let dispatcher = Dispatcher::new().unwrap();
        let transport = ScriptedTransport::new("mute", |_| vec!["retcode: 0".to_string()]);
        let device = Device::new(
            DeviceInfo {
                index: 1,
                nick: None,
                resource_id: None,
                platform: None,
                kind: "scripted".into(),
            },
            DeviceRequirement::default(),
            transport,
        );
        device.open().unwrap();
        let devices = vec![Arc::new(device)];
        register(&dispatcher, &devices);
        let commands = Commands::new(&dispatcher, &devices);
        let err = commands
            .sync_device(&devices[0], 2, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, Error::StepError(_)));
    }
}
