//! Declarative test scenarios.
//!
//! A scenario is a TOML file naming the devices it needs and the steps of
//! its setup, body and teardown phases:
//!
//! ```toml
//! name = "echo"
//!
//! [requirements.duts."*"]
//! count = 2
//! type = "process"
//! application = { bin = "dut-sim", cli_ready_trigger = "cmd ready" }
//!
//! [[case]]
//! command = "echo hi"
//! expect = ["hi"]
//!
//! [[case]]
//! wait_for = "regex:^link up"
//! device = 2
//! timeout = 10
//! ```

use {
    crate::CliError,
    anyhow::Result,
    dutbench::{
        AsyncResponse, Bench, CommandMode, CommandOptions, CommandResponse, DeviceRef, Error,
        Submitted, TestCase, is_interrupted_requested, resource::Requirements,
    },
    log::{debug, info},
    serde::Deserialize,
    std::{
        fs,
        path::Path,
        thread,
        time::{Duration, Instant},
    },
};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// How a command step waits for its response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepMode {
    /// Wait for the response before the next step.
    #[default]
    Sync,
    /// Collect the response at the end of the phase.
    Async,
    /// Send and never read a response.
    FireAndForget,
}

impl From<StepMode> for CommandMode {
    fn from(mode: StepMode) -> Self {
        match mode {
            StepMode::Sync => Self::Synchronous,
            StepMode::Async => Self::Asynchronous,
            StepMode::FireAndForget => Self::FireAndForget,
        }
    }
}

/// Device selector: a 1-based index, a nickname or `"*"` for every device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DeviceSpec {
    Index(usize),
    Name(String),
}

impl DeviceSpec {
    /// `None` for every device.
    fn target(&self) -> Option<DeviceRef> {
        match self {
            Self::Index(index) => Some(DeviceRef::Index(*index)),
            Self::Name(name) if name == "*" => None,
            Self::Name(name) => Some(DeviceRef::from(name.as_str())),
        }
    }
}

/// One step as written in the file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Step {
    /// Command line to send.
    pub command: Option<String>,
    /// Pattern of a line to wait for.
    pub wait_for: Option<String>,
    /// Seconds to pause.
    pub sleep: Option<f64>,
    /// Target device; commands default to every device, waits to any device.
    pub device: Option<DeviceSpec>,
    /// Required return code (default 0).
    pub expected_retcode: Option<i32>,
    /// Accept any return code.
    pub ignore_retcode: bool,
    /// Seconds; defaults to the run's command timeout.
    pub timeout: Option<f64>,
    pub mode: StepMode,
    /// Fragments the response must contain, in order.
    pub expect: Vec<String>,
}

/// What a validated step does.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Action<'a> {
    Command(&'a str),
    WaitFor(&'a str),
    Sleep(Duration),
}

impl Step {
    fn action(&self) -> std::result::Result<Action<'_>, String> {
        match (&self.command, &self.wait_for, self.sleep) {
            (Some(command), None, None) => {
                if self.mode == StepMode::FireAndForget && !self.expect.is_empty() {
                    return Err("fire-and-forget commands cannot have 'expect'".to_string());
                }
                Ok(Action::Command(command))
            },
            (None, Some(pattern), None) => Ok(Action::WaitFor(pattern)),
            (None, None, Some(secs)) => Duration::try_from_secs_f64(secs)
                .map(Action::Sleep)
                .map_err(|e| format!("invalid sleep {secs}: {e}")),
            _ => Err("each step needs exactly one of 'command', 'wait_for' or 'sleep'".to_string()),
        }
    }

    fn timeout(&self, default: Duration) -> std::result::Result<Duration, String> {
        self.timeout.map_or(Ok(default), |secs| {
            Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid timeout {secs}: {e}"))
        })
    }

    fn command_options(&self, defaults: CommandOptions) -> dutbench::Result<CommandOptions> {
        let timeout = self.timeout(defaults.timeout).map_err(Error::Config)?;
        let expected = if self.ignore_retcode {
            None
        } else {
            Some(self.expected_retcode.unwrap_or(0))
        };
        Ok(defaults
            .with_timeout(timeout)
            .with_expected(expected)
            .with_mode(self.mode.into()))
    }

    fn verify(&self, response: &CommandResponse) -> dutbench::Result<()> {
        let expected: Vec<&str> = self.expect.iter().map(String::as_str).collect();
        response.verify_message(&expected)
    }
}

/// A scenario file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scenario {
    /// Test name; defaults to the file stem.
    pub name: Option<String>,
    /// Skip with this reason.
    pub skip: Option<String>,
    pub requirements: Requirements,
    pub setup: Vec<Step>,
    pub case: Vec<Step>,
    pub teardown: Vec<Step>,
}

impl Scenario {
    /// Parse and check a scenario file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::Usage(format!("cannot read scenario {}: {e}", path.display())))?;
        let mut scenario = Self::parse(&content)
            .map_err(|e| CliError::Usage(format!("invalid scenario {}: {e}", path.display())))?;
        if scenario.name.is_none() {
            scenario.name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned());
        }
        Ok(scenario)
    }

    /// Parse and check scenario text.
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let scenario: Self = toml::from_str(content).map_err(|e| e.to_string())?;
        scenario.requirements.resolve().map_err(|e| e.to_string())?;
        for (phase, steps) in scenario.phases() {
            for (n, step) in steps.iter().enumerate() {
                step.action()
                    .and_then(|_| step.timeout(Duration::ZERO))
                    .map_err(|e| format!("{phase} step {}: {e}", n + 1))?;
            }
        }
        Ok(scenario)
    }

    fn phases(&self) -> [(&'static str, &[Step]); 3] {
        [
            ("setup", self.setup.as_slice()),
            ("case", self.case.as_slice()),
            ("teardown", self.teardown.as_slice()),
        ]
    }

    /// Display name.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("scenario")
    }
}

fn run_steps(bench: &Bench<'_>, phase: &str, steps: &[Step]) -> dutbench::Result<()> {
    let mut pending: Vec<(&Step, AsyncResponse)> = Vec::new();
    for (n, step) in steps.iter().enumerate() {
        if is_interrupted_requested() {
            return Err(Error::Interrupted);
        }
        let action = step.action().map_err(Error::Config)?;
        debug!("{phase} step {}: {action:?}", n + 1);
        match action {
            Action::Command(text) => {
                let options = step.command_options(bench.command_options())?;
                let submitted = match step.device.as_ref().and_then(DeviceSpec::target) {
                    Some(target) => vec![bench.execute(target, text, &options)?],
                    None => bench.broadcast(text, &options)?,
                };
                for result in submitted {
                    match result {
                        Submitted::Sent => {},
                        Submitted::Pending(proxy) => pending.push((step, proxy)),
                        Submitted::Completed(response) => step.verify(&response)?,
                    }
                }
            },
            Action::WaitFor(pattern) => {
                let timeout = step
                    .timeout(bench.command_options().timeout)
                    .map_err(Error::Config)?;
                let target = step.device.as_ref().and_then(DeviceSpec::target);
                let found = bench.wait_for_line(target, pattern, timeout)?;
                match found.source {
                    Some(index) => info!("matched '{}' on dut{index}", found.line),
                    None => info!("matched '{}'", found.line),
                }
            },
            Action::Sleep(duration) => sleep(duration)?,
        }
    }
    for (step, proxy) in pending {
        let response = bench.wait_for_async(&proxy)?;
        step.verify(&response)?;
    }
    Ok(())
}

fn sleep(duration: Duration) -> dutbench::Result<()> {
    let deadline = Instant::now() + duration;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        if is_interrupted_requested() {
            return Err(Error::Interrupted);
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

impl TestCase for Scenario {
    fn name(&self) -> &str {
        Scenario::name(self)
    }

    fn requirements(&self) -> Requirements {
        self.requirements.clone()
    }

    fn skip_reason(&self) -> Option<String> {
        self.skip.clone()
    }

    fn setup(&self, bench: &Bench<'_>) -> dutbench::Result<()> {
        run_steps(bench, "setup", &self.setup)
    }

    fn case(&self, bench: &Bench<'_>) -> dutbench::Result<()> {
        run_steps(bench, "case", &self.case)
    }

    fn teardown(&self, bench: &Bench<'_>) -> dutbench::Result<()> {
        run_steps(bench, "teardown", &self.teardown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::parse(
            r#"
            name = "echo"

            [requirements.duts."*"]
            count = 2
            type = "process"
            application = { bin = "/bin/sh", bin_args = ["-c", "cat"] }

            [requirements.duts."2"]
            nick = "peer"

            [[case]]
            command = "echo hi"
            expect = ["hi"]

            [[case]]
            command = "status"
            device = "peer"
            ignore_retcode = true
            mode = "async"

            [[case]]
            wait_for = "regex:^up"
            device = 1
            timeout = 2.5

            [[teardown]]
            sleep = 0.1
            "#,
        )
        .unwrap();

        assert_eq!(scenario.name(), "echo");
        assert_eq!(scenario.requirements.count().unwrap(), 2);
        assert_eq!(scenario.case.len(), 3);
        assert_eq!(scenario.case[0].action(), Ok(Action::Command("echo hi")));
        assert_eq!(
            scenario.case[1].device.as_ref().and_then(DeviceSpec::target),
            Some(DeviceRef::Nick("peer".into()))
        );
        assert_eq!(scenario.case[1].mode, StepMode::Async);
        assert_eq!(
            scenario.case[2].device.as_ref().and_then(DeviceSpec::target),
            Some(DeviceRef::Index(1))
        );
        assert_eq!(
            scenario.teardown[0].action(),
            Ok(Action::Sleep(Duration::from_millis(100)))
        );
    }

    #[test]
    fn test_star_targets_every_device() {
        let spec = DeviceSpec::Name("*".into());
        assert_eq!(spec.target(), None);
    }

    #[test]
    fn test_step_needs_exactly_one_action() {
        let err = Scenario::parse("[[case]]\ncommand = \"a\"\nsleep = 1\n").unwrap_err();
        assert!(err.contains("case step 1"), "{err}");

        let err = Scenario::parse("[[setup]]\ndevice = 1\n").unwrap_err();
        assert!(err.contains("setup step 1"), "{err}");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Scenario::parse("[[case]]\nsleep = -1.0\n").is_err());
        assert!(Scenario::parse("[[case]]\ncommand = \"a\"\ntimeout = -2.0\n").is_err());
        assert!(
            Scenario::parse("[[case]]\ncommand = \"a\"\nmode = \"fire-and-forget\"\nexpect = [\"x\"]\n")
                .is_err()
        );
        assert!(Scenario::parse("[[case]]\ncomand = \"typo\"\n").is_err());
        assert!(Scenario::parse("[requirements.duts.\"0\"]\n").is_err());
    }

    #[test]
    fn test_command_options() {
        let defaults = CommandOptions::default();

        let step = Step {
            command: Some("x".into()),
            timeout: Some(1.5),
            expected_retcode: Some(3),
            ..Step::default()
        };
        let options = step.command_options(defaults.clone()).unwrap();
        assert_eq!(options.timeout, Duration::from_millis(1500));
        assert_eq!(options.expected_retcode, Some(3));
        assert_eq!(options.mode, CommandMode::Synchronous);

        let step = Step {
            command: Some("x".into()),
            ignore_retcode: true,
            mode: StepMode::FireAndForget,
            ..Step::default()
        };
        let options = step.command_options(defaults.clone()).unwrap();
        assert_eq!(options.timeout, defaults.timeout);
        assert_eq!(options.expected_retcode, None);
        assert_eq!(options.mode, CommandMode::FireAndForget);
    }

    #[test]
    fn test_name_defaults_to_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smoke_test.toml");
        fs::write(&path, "[[case]]\nsleep = 0\n").unwrap();
        let scenario = Scenario::from_file(&path).unwrap();
        assert_eq!(scenario.name(), "smoke_test");
    }
}
