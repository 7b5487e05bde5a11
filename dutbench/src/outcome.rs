//! Outcome codes and verdicts reported for a test run.

use {
    serde::{Serialize, Serializer},
    std::fmt,
};

/// Terminal outcome of one test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Test was skipped.
    Skip,
    /// Test passed.
    Success,
    /// Bench setup raised.
    SetupBenchFailed,
    /// Test setup raised.
    SetupTestFailed,
    /// Fewer devices than required were available.
    MissingDuts,
    /// Requirements did not yield a device count.
    UndefinedDutCount,
    /// A device could not be connected.
    DutConnectionFailed,
    /// Test body raised.
    TcException,
    /// Test teardown raised.
    TeardownTestFailed,
    /// Bench could not be initialized.
    InitializeBench,
    /// No verdict was reached.
    NoPreliminaryVerdict,
    /// Bench teardown raised.
    TeardownBenchFailed,
    /// User interrupted the run.
    AbortedByUser,
    /// Unclassified failure.
    Unknown,
    /// Environment made the result undecidable.
    Inconclusive,
    /// Test case could not be found.
    TcNotFound,
}

/// Pass/fail classification of an [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Outcome is success.
    Pass,
    /// Outcome is a failure attributable to the device or the test.
    Fail,
    /// Outcome is skip.
    Skip,
    /// Outcome is an infrastructure problem.
    Inconclusive,
}

const ALL: [Outcome; 16] = [
    Outcome::Skip,
    Outcome::Success,
    Outcome::SetupBenchFailed,
    Outcome::SetupTestFailed,
    Outcome::MissingDuts,
    Outcome::UndefinedDutCount,
    Outcome::DutConnectionFailed,
    Outcome::TcException,
    Outcome::TeardownTestFailed,
    Outcome::InitializeBench,
    Outcome::NoPreliminaryVerdict,
    Outcome::TeardownBenchFailed,
    Outcome::AbortedByUser,
    Outcome::Unknown,
    Outcome::Inconclusive,
    Outcome::TcNotFound,
];

impl Outcome {
    /// Numeric code consumed by reporting.
    pub fn code(self) -> i32 {
        match self {
            Self::Skip => -1,
            Self::Success => 0,
            Self::SetupBenchFailed => 1000,
            Self::SetupTestFailed => 1001,
            Self::MissingDuts => 1002,
            Self::UndefinedDutCount => 1003,
            Self::DutConnectionFailed => 1004,
            Self::TcException => 1005,
            Self::TeardownTestFailed => 1006,
            Self::InitializeBench => 1007,
            Self::NoPreliminaryVerdict => 1010,
            Self::TeardownBenchFailed => 1011,
            Self::AbortedByUser => 1012,
            Self::Unknown => 1013,
            Self::Inconclusive => 1014,
            Self::TcNotFound => 1015,
        }
    }

    /// Outcome for a numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        ALL.into_iter().find(|outcome| outcome.code() == code)
    }

    /// Short kebab-case name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Success => "success",
            Self::SetupBenchFailed => "setup-bench-failed",
            Self::SetupTestFailed => "setup-test-failed",
            Self::MissingDuts => "missing-duts",
            Self::UndefinedDutCount => "undefined-dut-count",
            Self::DutConnectionFailed => "dut-connection-failed",
            Self::TcException => "tc-exception",
            Self::TeardownTestFailed => "teardown-test-failed",
            Self::InitializeBench => "initialize-bench",
            Self::NoPreliminaryVerdict => "no-preliminary-verdict",
            Self::TeardownBenchFailed => "teardown-bench-failed",
            Self::AbortedByUser => "aborted-by-user",
            Self::Unknown => "unknown",
            Self::Inconclusive => "inconclusive",
            Self::TcNotFound => "tc-not-found",
        }
    }

    /// Whether the outcome reflects the environment rather than the device.
    pub fn is_inconclusive(self) -> bool {
        matches!(
            self,
            Self::SetupBenchFailed
                | Self::DutConnectionFailed
                | Self::InitializeBench
                | Self::TeardownBenchFailed
                | Self::AbortedByUser
                | Self::Inconclusive
                | Self::TcNotFound
        )
    }

    /// Verdict derived from the code.
    pub fn verdict(self) -> Verdict {
        match self {
            Self::Success => Verdict::Pass,
            Self::Skip => Verdict::Skip,
            other if other.is_inconclusive() => Verdict::Inconclusive,
            _ => Verdict::Fail,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
            Self::Inconclusive => "inconclusive",
        })
    }
}
