//! # dutbench
//!
//! A test-execution engine for devices under test (DUTs) driven over a line
//! oriented command interface.
//!
//! The crate provides:
//!
//! - a per-run [`Dispatcher`] servicing every device's transport from one thread
//! - a command protocol with synchronous, asynchronous and fire-and-forget modes
//! - an [`EventBus`] for "wait until the device prints X" synchronization
//! - resource allocation, optional flashing and device initialization
//! - a test-run state machine mapping failures to outcome codes
//!
//! ## Transports
//!
//! - **Serial** (`native` feature, default): via the `serialport` crate
//! - **Process**: a spawned program talking over stdin/stdout
//! - **Scripted**: in-memory devices for tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use dutbench::{
//!     Bench, Outcome, ResourceProvider, RunOptions, TestCase,
//!     resource::{LocalAllocator, RequirementOverride, Requirements},
//! };
//!
//! struct Hello;
//!
//! impl TestCase for Hello {
//!     fn name(&self) -> &str {
//!         "hello"
//!     }
//!
//!     fn requirements(&self) -> Requirements {
//!         Requirements::new().with_defaults(
//!             RequirementOverride::default()
//!                 .with_count(2)
//!                 .with_type("process")
//!                 .with_bin("/usr/local/bin/dut-sim", Vec::new()),
//!         )
//!     }
//!
//!     fn case(&self, bench: &Bench<'_>) -> dutbench::Result<()> {
//!         bench.broadcast("echo hi", &bench.command_options())?;
//!         Ok(())
//!     }
//! }
//!
//! let provider = ResourceProvider::new(LocalAllocator::default());
//! let report = dutbench::run_testcase(&Hello, &RunOptions::default(), &provider);
//! assert_eq!(report.outcome, Outcome::Success);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::{
    cell::Cell,
    sync::{Arc, OnceLock},
};

pub mod bench;
pub mod command;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod options;
pub mod outcome;
pub mod resource;
pub mod runner;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

thread_local! {
    static SUPPRESSED: Cell<usize> = const { Cell::new(0) };
}

/// Register a global interruption checker consulted by blocking waits.
///
/// The checker should return `true` when the current run should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
///
/// Always `false` on a thread running recovery phases.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    if SUPPRESSED.with(Cell::get) > 0 {
        return false;
    }
    if test_interrupted() {
        return true;
    }
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

struct SuppressGuard;

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        SUPPRESSED.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Run `f` with interrupt checks disabled on this thread.
pub(crate) fn with_interrupts_suppressed<T>(f: impl FnOnce() -> T) -> T {
    SUPPRESSED.with(|depth| depth.set(depth.get() + 1));
    let _guard = SuppressGuard;
    f()
}

#[cfg(test)]
thread_local! {
    static TEST_INTERRUPTED: Cell<bool> = const { Cell::new(false) };
}

/// Simulate an interrupt on the calling test thread.
#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    TEST_INTERRUPTED.with(|flag| flag.set(value));
}

#[cfg(test)]
fn test_interrupted() -> bool {
    TEST_INTERRUPTED.with(Cell::get)
}

#[cfg(not(test))]
fn test_interrupted() -> bool {
    false
}

pub use {
    bench::{Bench, TestCase, run_testcase},
    command::{
        AsyncResponse, CommandMode, CommandOptions, CommandRequest, CommandResponse, Commands,
        ReturnCode, Submitted,
    },
    device::{Device, DeviceInfo, DeviceRef, Lifecycle, detect_ports},
    dispatcher::Dispatcher,
    error::{Error, FailureKind, Result},
    events::{Event, EventBus, EventKind, EventMatch, Flag, Matcher, Subscription},
    options::RunOptions,
    outcome::{Outcome, Verdict},
    resource::{ResourceProvider, flash::Flasher},
    runner::{RunReport, RunState},
    transport::Transport,
};
