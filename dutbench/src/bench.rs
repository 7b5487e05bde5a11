//! Test cases and the bench they run on.

use {
    crate::{
        command::{
            AsyncResponse, CommandOptions, CommandResponse, Commands, Submitted,
            executor::{SYNC_RETRIES, SYNC_TIMEOUT},
        },
        device::{Device, DeviceRef, find_device},
        dispatcher::Dispatcher,
        error::{Error, Result},
        events::{EventBus, EventKind, EventMatch, Matcher},
        options::RunOptions,
        resource::{AllocationContextList, Requirements, ResourceProvider},
        runner::{Phases, RunReport, RunStateMachine},
    },
    log::{info, warn},
    std::{sync::Arc, time::Duration},
};

/// A test case run by [`run_testcase`].
pub trait TestCase {
    /// Test case name.
    fn name(&self) -> &str;

    /// Devices the test needs.
    fn requirements(&self) -> Requirements {
        Requirements::new()
    }

    /// Reason to skip the test, checked before any device is allocated.
    fn skip_reason(&self) -> Option<String> {
        None
    }

    /// Runs once the bench is ready.
    fn setup(&self, _bench: &Bench<'_>) -> Result<()> {
        Ok(())
    }

    /// Test body.
    fn case(&self, bench: &Bench<'_>) -> Result<()>;

    /// Runs after the body, and after a failing body.
    fn teardown(&self, _bench: &Bench<'_>) -> Result<()> {
        Ok(())
    }
}

/// Devices and command access for one test run.
pub struct Bench<'a> {
    name: String,
    options: RunOptions,
    dispatcher: Dispatcher,
    provider: &'a ResourceProvider,
    devices: Vec<Arc<Device>>,
    allocations: Option<AllocationContextList>,
}

impl<'a> Bench<'a> {
    /// Empty bench with its own dispatcher.
    pub fn new(name: impl Into<String>, options: RunOptions, provider: &'a ResourceProvider) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            options,
            dispatcher: Dispatcher::new()?,
            provider,
            devices: Vec::new(),
            allocations: None,
        })
    }

    /// Test case name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run options.
    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Devices in index order.
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Number of devices.
    pub fn dut_count(&self) -> usize {
        self.devices.len()
    }

    /// Device by index or nickname.
    pub fn device(&self, target: impl Into<DeviceRef>) -> Result<&Arc<Device>> {
        find_device(&self.devices, &target.into())
    }

    /// Event bus receiving every device line.
    pub fn events(&self) -> &Arc<EventBus> {
        self.dispatcher.events()
    }

    /// Command front end for this bench's devices.
    pub fn commands(&self) -> Commands<'_> {
        Commands::new(&self.dispatcher, &self.devices)
    }

    /// Command options with the run's default timeout.
    pub fn command_options(&self) -> CommandOptions {
        self.options.command_options()
    }

    /// Run `text` synchronously, expecting `retcode: 0`.
    pub fn command(&self, target: impl Into<DeviceRef>, text: &str) -> Result<CommandResponse> {
        self.commands()
            .execute(target, text, &self.command_options())?
            .into_response()
    }

    /// Run `text` with explicit options.
    pub fn execute(
        &self,
        target: impl Into<DeviceRef>,
        text: &str,
        options: &CommandOptions,
    ) -> Result<Submitted> {
        self.commands().execute(target, text, options)
    }

    /// Run `text` on every device.
    pub fn broadcast(&self, text: &str, options: &CommandOptions) -> Result<Vec<Submitted>> {
        self.commands().broadcast(text, options)
    }

    /// Wait for an asynchronous command.
    pub fn wait_for_async(&self, pending: &AsyncResponse) -> Result<CommandResponse> {
        self.commands().wait_for_async(pending)
    }

    /// Wait until a device (or any device) prints a line matching `pattern`.
    ///
    /// `pattern` is a substring, or a regular expression prefixed with `regex:`.
    pub fn wait_for_line(
        &self,
        target: Option<DeviceRef>,
        pattern: &str,
        timeout: Duration,
    ) -> Result<EventMatch> {
        let source = target
            .map(|t| self.device(t).map(|d| d.index()))
            .transpose()?;
        let matcher = Matcher::parse(pattern)?;
        self.events()
            .wait_for(EventKind::LineReceived, matcher, source, timeout)
            .ok_or_else(|| {
                Error::Timeout(format!(
                    "no line matching '{pattern}' within {:.1}s",
                    timeout.as_secs_f64()
                ))
            })
    }

    /// Check a device's command line with an echo handshake.
    pub fn sync_cli(&self, target: impl Into<DeviceRef>) -> Result<()> {
        self.commands().sync_cli(target)
    }

    /// Allocate, initialize and open the devices `case` requires.
    pub fn setup(&mut self, case: &dyn TestCase) -> Result<()> {
        if let Some(reason) = case.skip_reason() {
            return Err(Error::Skipped(reason));
        }
        let requirements = case.requirements().resolve()?;
        info!("{} requires {} device(s)", self.name, requirements.len());
        let contexts = self.provider.allocate(&requirements)?;
        // init_duts releases the contexts itself when it fails
        self.devices = self.provider.init_duts(&contexts, &self.options)?;
        self.allocations = Some(contexts);
        if self.devices.len() != requirements.len() {
            return Err(Error::Allocation(format!(
                "{} device(s) required, {} initialized",
                requirements.len(),
                self.devices.len()
            )));
        }
        self.provider
            .open_devices(&self.devices, &self.dispatcher, &self.options)?;

        let commands = self.commands();
        if self.options.sync_start {
            for device in &self.devices {
                commands.sync_device(device, SYNC_RETRIES, SYNC_TIMEOUT)?;
            }
        }
        let options = self.command_options();
        commands.send_init_commands(&options)?;
        for device in &self.devices {
            commands.send_sequence(device, &device.requirement().pre_cmds, &options)?;
        }
        for text in &self.options.pre_cmds {
            commands.broadcast(text, &options)?;
        }
        Ok(())
    }

    /// Send closing commands, close every device and release resources.
    ///
    /// Every step is attempted; the first error is returned.
    pub fn teardown(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        let commands = self.commands();
        let options = self.command_options();
        let usable: Vec<_> = self
            .devices
            .iter()
            .filter(|d| d.is_alive() && !d.is_closed())
            .cloned()
            .collect();
        for device in &usable {
            let mut sequence = device.requirement().post_cmds.clone();
            sequence.extend(self.options.post_cmds.iter().cloned());
            if let Err(e) = commands.send_sequence(device, &sequence, &options) {
                warn!("{}: post commands failed: {e}", device.name());
                errors.push(e);
            }
        }
        Commands::new(&self.dispatcher, &usable).send_post_commands(&options);

        for device in &self.devices {
            self.dispatcher.unregister(device);
            if let Err(e) = device.close() {
                warn!("Closing {} failed: {e}", device.name());
                errors.push(e);
            }
        }
        if let Some(contexts) = self.allocations.take() {
            self.provider.release(&contexts);
        }
        self.devices.clear();
        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct TestRun<'a> {
    case: &'a dyn TestCase,
    bench: Bench<'a>,
}

impl Phases for TestRun<'_> {
    fn setup_bench(&mut self) -> Result<()> {
        self.bench.setup(self.case)
    }

    fn setup_test(&mut self) -> Result<()> {
        if self.bench.options.skip_setup {
            info!("Test setup skipped");
            return Ok(());
        }
        self.case.setup(&self.bench)
    }

    fn run_case(&mut self) -> Result<()> {
        if self.bench.options.skip_case {
            info!("Test case skipped");
            return Ok(());
        }
        self.case.case(&self.bench)
    }

    fn teardown_test(&mut self) -> Result<()> {
        if self.bench.options.skip_teardown {
            info!("Test teardown skipped");
            return Ok(());
        }
        self.case.teardown(&self.bench)
    }

    fn teardown_bench(&mut self) -> Result<()> {
        self.bench.teardown()
    }
}

/// Run `case` through the full state machine and report the outcome.
pub fn run_testcase(case: &dyn TestCase, options: &RunOptions, provider: &ResourceProvider) -> RunReport {
    let name = case.name().to_string();
    let bench = match Bench::new(name.clone(), options.clone(), provider) {
        Ok(bench) => bench,
        Err(e) => return RunReport::not_started(name, &e),
    };
    let mut run = TestRun { case, bench };
    RunStateMachine::new(name).run(&mut run)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            Outcome,
            resource::{AllocationContext, LocalAllocator, RequirementOverride},
            runner::RunState,
            transport::ScriptedTransport,
        },
        parking_lot::Mutex,
    };

    fn provider() -> ResourceProvider {
        ResourceProvider::new(LocalAllocator::default()).with_constructor(
            "scripted",
            |context: &AllocationContext, _: &RunOptions| {
                let transport = ScriptedTransport::echo(format!("sim{}", context.index));
                transport.control().emit("ready");
                Ok(Device::new(context.device_info(), context.requirement.clone(), transport))
            },
        )
    }

    struct Body<F> {
        count: usize,
        skip: Option<String>,
        body: F,
        log: Mutex<Vec<&'static str>>,
    }

    impl<F: Fn(&Bench<'_>) -> Result<()>> Body<F> {
        fn new(count: usize, body: F) -> Self {
            Self {
                count,
                skip: None,
                body,
                log: Mutex::new(Vec::new()),
            }
        }
    }

    impl<F: Fn(&Bench<'_>) -> Result<()>> TestCase for Body<F> {
        fn name(&self) -> &str {
            "body"
        }

        fn requirements(&self) -> Requirements {
            Requirements::new().with_defaults(
                RequirementOverride::default()
                    .with_count(self.count)
                    .with_type("scripted")
                    .with_nick("node{i}")
                    .with_ready_trigger("ready"),
            )
        }

        fn skip_reason(&self) -> Option<String> {
            self.skip.clone()
        }

        fn setup(&self, _: &Bench<'_>) -> Result<()> {
            self.log.lock().push("setup");
            Ok(())
        }

        fn case(&self, bench: &Bench<'_>) -> Result<()> {
            self.log.lock().push("case");
            (self.body)(bench)
        }

        fn teardown(&self, _: &Bench<'_>) -> Result<()> {
            self.log.lock().push("teardown");
            Ok(())
        }
    }

    #[test]
    fn test_broadcast_case_passes() {
        let case = Body::new(2, |bench: &Bench<'_>| {
            assert_eq!(bench.dut_count(), 2);
            for submitted in bench.broadcast("echo hi", &bench.command_options())? {
                let response = submitted.into_response()?;
                response.verify_message(&["hi"])?;
            }
            bench.command("node2", "echo direct")?;
            Ok(())
        });
        let report = run_testcase(&case, &RunOptions::default(), &provider());
        assert_eq!(report.outcome, Outcome::Success, "{:?}", report.reason);
        assert_eq!(*case.log.lock(), vec!["setup", "case", "teardown"]);
    }

    #[test]
    fn test_failing_command_is_tc_exception() {
        let case = Body::new(1, |bench: &Bench<'_>| bench.command(1, "explode").map(|_| ()));
        let report = run_testcase(&case, &RunOptions::default(), &provider());
        assert_eq!(report.outcome, Outcome::TcException);
        assert!(report.reason.as_deref().unwrap().contains("unknown command"));
        assert_eq!(*case.log.lock(), vec!["setup", "case", "teardown"]);
        assert!(report.ran(RunState::BenchTeardown));
    }

    #[test]
    fn test_skip_reason() {
        let mut case = Body::new(1, |_: &Bench<'_>| Ok(()));
        case.skip = Some("needs radio".into());
        let report = run_testcase(&case, &RunOptions::default(), &provider());
        assert_eq!(report.outcome, Outcome::Skip);
        assert!(case.log.lock().is_empty());
    }

    #[test]
    fn test_skip_case_option() {
        let case = Body::new(1, |_: &Bench<'_>| Err(Error::StepFailed("ran".into())));
        let options = RunOptions {
            skip_case: true,
            ..RunOptions::default()
        };
        let report = run_testcase(&case, &options, &provider());
        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(*case.log.lock(), vec!["setup", "teardown"]);
    }

    #[test]
    fn test_wait_for_line_times_out() {
        let case = Body::new(1, |bench: &Bench<'_>| {
            let err = bench
                .wait_for_line(Some(DeviceRef::Index(1)), "never", Duration::from_millis(50))
                .unwrap_err();
            assert!(matches!(err, Error::Timeout(_)));
            bench.sync_cli("node1")
        });
        let report = run_testcase(&case, &RunOptions::default(), &provider());
        assert_eq!(report.outcome, Outcome::Success, "{:?}", report.reason);
    }

    #[test]
    fn test_pre_and_init_commands_are_sent() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&written);
        let provider = ResourceProvider::new(LocalAllocator::default()).with_constructor(
            "scripted",
            move |context: &AllocationContext, _: &RunOptions| {
                let sink = Arc::clone(&sink);
                let transport = ScriptedTransport::new("rec", move |line| {
                    sink.lock().push(line.to_string());
                    vec!["retcode: 0".to_string()]
                });
                Ok(Device::new(context.device_info(), context.requirement.clone(), transport))
            },
        );
        struct Plain;
        impl TestCase for Plain {
            fn name(&self) -> &str {
                "plain"
            }
            fn requirements(&self) -> Requirements {
                let mut defaults = RequirementOverride::default()
                    .with_count(1)
                    .with_type("scripted");
                defaults.application = Some(crate::resource::ApplicationOverride {
                    init_cli_cmds: Some(vec!["init".into()]),
                    post_cli_cmds: Some(vec!["bye".into()]),
                    ..Default::default()
                });
                defaults.pre_cmds = Some(vec!["pre".into()]);
                Requirements::new().with_defaults(defaults)
            }
            fn case(&self, bench: &Bench<'_>) -> Result<()> {
                bench.command(1, "body").map(|_| ())
            }
        }
        let options = RunOptions {
            pre_cmds: vec!["all-pre".into()],
            post_cmds: vec!["all-post".into()],
            ..RunOptions::default()
        };
        let report = run_testcase(&Plain, &options, &provider);
        assert!(report.passed(), "{:?}", report.reason);
        assert_eq!(
            *written.lock(),
            vec!["init", "pre", "all-pre", "body", "all-post", "bye"]
        );
    }
}
