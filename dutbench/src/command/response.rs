//! Command responses and the return-code wire convention.

use {
    crate::{
        error::{Error, Result},
        events::Matcher,
    },
    regex::Regex,
    std::{sync::LazyLock, time::Duration},
};

/// Line a device prints when its command interpreter restarts.
pub const REBOOT_MARKER: &str = "cmd tasklet init";

/// Integer reported for a dead device.
pub const DEAD_DEVICE_SENTINEL: i32 = -1;

static RETCODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"retcode: (-?\d+)").expect("retcode pattern is valid")
});

/// How a command completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    /// The device reported `retcode: <value>`.
    Value(i32),
    /// The device died (connection lost or rebooted) before answering.
    DeviceDied,
}

impl ReturnCode {
    /// Integer form; a dead device maps to [`DEAD_DEVICE_SENTINEL`].
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Value(v) => v,
            Self::DeviceDied => DEAD_DEVICE_SENTINEL,
        }
    }
}

/// Parse a trace line for the return-code marker or the reboot marker.
pub fn parse_retcode(line: &str) -> Option<ReturnCode> {
    if line.contains(REBOOT_MARKER) {
        return Some(ReturnCode::DeviceDied);
    }
    RETCODE_PATTERN
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .map(ReturnCode::Value)
}

/// Human readable reason for a well-known return code.
pub fn describe_retcode(code: Option<ReturnCode>) -> String {
    match code {
        None => "no return code".to_string(),
        Some(ReturnCode::DeviceDied) => "device died".to_string(),
        Some(ReturnCode::Value(-2)) => "invalid parameters".to_string(),
        Some(ReturnCode::Value(-3)) => "command not implemented".to_string(),
        Some(ReturnCode::Value(-4)) => "command callback missing".to_string(),
        Some(ReturnCode::Value(-5)) => "unknown command".to_string(),
        Some(ReturnCode::Value(v)) => format!("retcode: {v}"),
    }
}

/// Result of one command.
///
/// Written once by the dispatcher; cloned out to whoever reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResponse {
    /// Completion code, `None` if nothing was received.
    pub retcode: Option<ReturnCode>,
    /// Trace lines collected since the previous response.
    pub lines: Vec<String>,
    /// Time from submission to completion.
    pub elapsed: Duration,
    /// The command timed out before a return code arrived.
    pub timed_out: bool,
}

impl CommandResponse {
    /// Response for a device that died mid-command.
    pub fn device_died(lines: Vec<String>, elapsed: Duration) -> Self {
        Self {
            retcode: Some(ReturnCode::DeviceDied),
            lines,
            elapsed,
            timed_out: false,
        }
    }

    /// Response for a command that ran out of time.
    pub fn timed_out(elapsed: Duration) -> Self {
        Self {
            timed_out: true,
            elapsed,
            ..Self::default()
        }
    }

    /// `true` for `retcode: 0`.
    pub fn success(&self) -> bool {
        self.retcode == Some(ReturnCode::Value(0))
    }

    /// `true` for any completion other than `retcode: 0`.
    pub fn failed(&self) -> bool {
        !self.success()
    }

    /// `true` if the device died before answering.
    pub fn device_dead(&self) -> bool {
        self.retcode == Some(ReturnCode::DeviceDied)
    }

    /// Lines without the trailing return-code marker.
    pub fn output(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .map(String::as_str)
            .filter(|line| parse_retcode(line).is_none())
    }

    /// Check that `expected` fragments appear in order across the response lines.
    ///
    /// Fragments are substrings unless prefixed with `regex:`. A fragment
    /// prefixed with `!` must not appear after the previous match.
    pub fn verify_message(&self, expected: &[&str]) -> Result<()> {
        verify_lines(&self.lines, expected)
    }

    /// Fail if the command took longer than `max`.
    pub fn verify_response_time(&self, max: Duration) -> Result<()> {
        if self.elapsed > max {
            return Err(Error::StepFailed(format!(
                "response took {:.3}s, more than allowed {:.3}s",
                self.elapsed.as_secs_f64(),
                max.as_secs_f64()
            )));
        }
        Ok(())
    }
}

/// Ordered search used by [`CommandResponse::verify_message`].
pub fn verify_lines(lines: &[String], expected: &[&str]) -> Result<()> {
    let mut position = 0;
    for fragment in expected {
        if let Some(absent) = fragment.strip_prefix('!') {
            let matcher = Matcher::parse(absent)?;
            if let Some(line) = lines[position..].iter().find(|l| matcher.find(l).is_some()) {
                return Err(Error::Lookup(format!(
                    "unexpected '{absent}' found in line '{line}'"
                )));
            }
            continue;
        }
        let matcher = Matcher::parse(fragment)?;
        match lines[position..]
            .iter()
            .position(|l| matcher.find(l).is_some())
        {
            Some(offset) => position += offset + 1,
            None => {
                return Err(Error::Lookup(format!(
                    "expected '{fragment}' not found in response"
                )));
            },
        }
    }
    Ok(())
}
