//! Test-run state machine.
//!
//! ```text
//! initial -> bench-setup -> test-setup -> executing -> test-teardown -> bench-teardown -> finished
//!                 |              |  \          |  \           |
//!                 |              |   '---------+---'-> test-teardown (jump-to-teardown-test)
//!                 '--------------+-------------+--------------'-> bench-teardown (jump-to-teardown)
//! ```
//!
//! The first failure decides the outcome. Recovery phases run after it under
//! their own guard; their failures are logged and kept in the phase log only.

use {
    crate::{
        error::{Error, FailureKind, Result},
        outcome::{Outcome, Verdict},
    },
    log::{error, info, warn},
    serde::{Serialize, Serializer},
    std::{
        fmt,
        time::{Duration, Instant},
    },
};

/// State of one test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    /// Not started.
    Initial,
    /// Allocating and opening devices.
    BenchSetup,
    /// Test case setup.
    TestSetup,
    /// Test case body.
    Executing,
    /// Test case teardown.
    TestTeardown,
    /// Releasing devices.
    BenchTeardown,
    /// Done.
    Finished,
}

impl RunState {
    fn banner(self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::BenchSetup => "TEST BENCH SETUP",
            Self::TestSetup => "TEST SETUP",
            Self::Executing => "TEST CASE",
            Self::TestTeardown => "TEST TEARDOWN",
            Self::BenchTeardown => "TEST BENCH TEARDOWN",
            Self::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initial => "initial",
            Self::BenchSetup => "bench-setup",
            Self::TestSetup => "test-setup",
            Self::Executing => "executing",
            Self::TestTeardown => "test-teardown",
            Self::BenchTeardown => "bench-teardown",
            Self::Finished => "finished",
        })
    }
}

/// Events driving [`transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Leave the initial state.
    Start,
    /// Current phase completed.
    Proceed,
    /// Skip to bench teardown.
    JumpToTeardown,
    /// Skip to test teardown.
    JumpToTeardownTest,
    /// Stop from any state.
    Finish,
}

/// Next state for `trigger` in `from`, or `None` if not allowed.
pub fn transition(from: RunState, trigger: Trigger) -> Option<RunState> {
    use RunState::{
        BenchSetup, BenchTeardown, Executing, Finished, Initial, TestSetup, TestTeardown,
    };
    match (from, trigger) {
        (Initial, Trigger::Start) => Some(BenchSetup),
        (BenchSetup, Trigger::Proceed) => Some(TestSetup),
        (TestSetup, Trigger::Proceed) => Some(Executing),
        (Executing, Trigger::Proceed) => Some(TestTeardown),
        (TestTeardown, Trigger::Proceed) => Some(BenchTeardown),
        (BenchTeardown, Trigger::Proceed) => Some(Finished),
        (BenchSetup | TestSetup | Executing | TestTeardown, Trigger::JumpToTeardown) => {
            Some(BenchTeardown)
        },
        (TestSetup | Executing, Trigger::JumpToTeardownTest) => Some(TestTeardown),
        (Finished, Trigger::Finish) => None,
        (_, Trigger::Finish) => Some(Finished),
        _ => None,
    }
}

/// Outcome for a failure of `kind` raised in `state`.
pub fn select_outcome(state: RunState, kind: FailureKind) -> Outcome {
    use FailureKind::{Inconclusive, Interrupted, Skipped};
    match (state, kind) {
        (_, Interrupted) => Outcome::AbortedByUser,
        (RunState::BenchSetup, Skipped) => Outcome::Skip,
        (RunState::BenchSetup, _) => Outcome::SetupBenchFailed,
        (RunState::TestSetup, Inconclusive) => Outcome::Inconclusive,
        (RunState::TestSetup, Skipped) => Outcome::Skip,
        (RunState::TestSetup, _) => Outcome::SetupTestFailed,
        (RunState::Executing, Inconclusive) => Outcome::Inconclusive,
        (RunState::Executing, Skipped) => Outcome::Skip,
        (RunState::Executing, _) => Outcome::TcException,
        (RunState::TestTeardown, Inconclusive) => Outcome::Inconclusive,
        (RunState::TestTeardown, Skipped) => Outcome::Skip,
        (RunState::TestTeardown, _) => Outcome::TeardownTestFailed,
        (RunState::BenchTeardown, _) => Outcome::TeardownBenchFailed,
        (RunState::Initial | RunState::Finished, _) => Outcome::Unknown,
    }
}

/// Recovery phases to run after a failure of `kind` in `state`, in order.
pub fn recovery_plan(state: RunState, kind: FailureKind) -> &'static [RunState] {
    match state {
        RunState::BenchSetup | RunState::TestTeardown => &[RunState::BenchTeardown],
        RunState::TestSetup if kind == FailureKind::StepFail => {
            &[RunState::TestTeardown, RunState::BenchTeardown]
        },
        RunState::TestSetup => &[RunState::BenchTeardown],
        RunState::Executing => &[RunState::TestTeardown, RunState::BenchTeardown],
        RunState::Initial | RunState::BenchTeardown | RunState::Finished => &[],
    }
}

/// Phase actions driven by [`RunStateMachine`].
pub trait Phases {
    /// Allocate, initialize and open devices.
    fn setup_bench(&mut self) -> Result<()>;
    /// Test case setup.
    fn setup_test(&mut self) -> Result<()>;
    /// Test case body.
    fn run_case(&mut self) -> Result<()>;
    /// Test case teardown.
    fn teardown_test(&mut self) -> Result<()>;
    /// Close and release devices.
    fn teardown_bench(&mut self) -> Result<()>;
}

/// One attempted phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseRecord {
    /// Phase.
    pub state: RunState,
    /// Error text if the phase failed.
    pub error: Option<String>,
    /// Ran as part of failure recovery.
    pub recovery: bool,
    /// Time spent.
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
}

/// Result of one test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Test case name.
    pub name: String,
    /// Outcome code.
    pub outcome: Outcome,
    /// Verdict derived from the outcome.
    pub verdict: Verdict,
    /// Reason of the first failure.
    pub reason: Option<String>,
    /// State the first failure was raised in.
    pub failed_state: Option<RunState>,
    /// Total run time.
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    /// Phases in the order they ran.
    pub phases: Vec<PhaseRecord>,
}

impl RunReport {
    /// Whether the run passed.
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Report for a run that failed before its bench could be built.
    pub fn not_started(name: impl Into<String>, err: &Error) -> Self {
        error!("Unable to initialize bench: {err}");
        Self {
            name: name.into(),
            outcome: Outcome::InitializeBench,
            verdict: Outcome::InitializeBench.verdict(),
            reason: Some(err.to_string()),
            failed_state: Some(RunState::Initial),
            duration: Duration::ZERO,
            phases: Vec::new(),
        }
    }

    /// Whether `state` ran (in any role).
    pub fn ran(&self, state: RunState) -> bool {
        self.phases.iter().any(|p| p.state == state)
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

struct Failure {
    state: RunState,
    outcome: Outcome,
    reason: String,
}

/// Drives [`Phases`] through one run.
pub struct RunStateMachine {
    name: String,
    state: RunState,
    failure: Option<Failure>,
    phases: Vec<PhaseRecord>,
}

impl RunStateMachine {
    /// Fresh machine in [`RunState::Initial`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RunState::Initial,
            failure: None,
            phases: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        self.state
    }

    fn fire(&mut self, trigger: Trigger) -> bool {
        match transition(self.state, trigger) {
            Some(next) => {
                self.state = next;
                true
            },
            None => {
                warn!("Ignoring {trigger:?} in state {}", self.state);
                false
            },
        }
    }

    /// Run every phase and return the report. Always ends in [`RunState::Finished`].
    pub fn run(mut self, phases: &mut dyn Phases) -> RunReport {
        let started = Instant::now();
        self.fire(Trigger::Start);
        while self.state != RunState::Finished {
            let state = self.state;
            match self.run_phase(phases, state, false) {
                Ok(()) => {
                    self.fire(Trigger::Proceed);
                },
                Err(e) => {
                    self.record_failure(state, &e);
                    self.recover(phases, state, e.kind());
                    self.fire(Trigger::Finish);
                },
            }
        }
        self.report(started.elapsed())
    }

    fn run_phase(&mut self, phases: &mut dyn Phases, state: RunState, recovery: bool) -> Result<()> {
        info!("------{} STARTS---------", state.banner());
        let started = Instant::now();
        let result = match state {
            RunState::BenchSetup => phases.setup_bench(),
            RunState::TestSetup => phases.setup_test(),
            RunState::Executing => phases.run_case(),
            RunState::TestTeardown => phases.teardown_test(),
            RunState::BenchTeardown => phases.teardown_bench(),
            RunState::Initial | RunState::Finished => Ok(()),
        };
        self.phases.push(PhaseRecord {
            state,
            error: result.as_ref().err().map(ToString::to_string),
            recovery,
            duration: started.elapsed(),
        });
        info!("------{} ENDS---------", state.banner());
        result
    }

    fn record_failure(&mut self, state: RunState, err: &Error) {
        let kind = err.kind();
        let outcome = select_outcome(state, kind);
        if self.failure.is_some() {
            warn!("Further failure in {state}: {err}");
            return;
        }
        match kind {
            FailureKind::Skipped => info!("Test skipped: {err}"),
            _ => error!("{state} failed ({}): {err}", outcome.name()),
        }
        self.failure = Some(Failure {
            state,
            outcome,
            reason: err.to_string(),
        });
    }

    fn recover(&mut self, phases: &mut dyn Phases, failed: RunState, kind: FailureKind) {
        let plan = recovery_plan(failed, kind);
        let mut steps = || {
            for &target in plan {
                let trigger = if target == RunState::TestTeardown {
                    Trigger::JumpToTeardownTest
                } else if self.state == RunState::TestTeardown {
                    Trigger::Proceed
                } else {
                    Trigger::JumpToTeardown
                };
                if !self.fire(trigger) {
                    continue;
                }
                if let Err(e) = self.run_phase(phases, target, true) {
                    warn!("Recovery phase {target} failed: {e}");
                }
            }
        };
        if kind == FailureKind::Interrupted || crate::is_interrupted_requested() {
            warn!("Interrupted; running teardown, interrupt again to force exit");
            crate::with_interrupts_suppressed(steps);
        } else {
            steps();
        }
    }

    fn report(self, duration: Duration) -> RunReport {
        let (outcome, reason, failed_state) = match self.failure {
            Some(failure) => (failure.outcome, Some(failure.reason), Some(failure.state)),
            None => (Outcome::Success, None, None),
        };
        info!(
            "{}: {} in {:.2}s",
            self.name,
            outcome,
            duration.as_secs_f64()
        );
        RunReport {
            name: self.name,
            outcome,
            verdict: outcome.verdict(),
            reason,
            failed_state,
            duration,
            phases: self.phases,
        }
    }
}
