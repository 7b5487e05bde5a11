//! Run-wide options.

use {
    crate::command::{CommandOptions, DEFAULT_COMMAND_TIMEOUT},
    serde::{Deserialize, Serialize},
    std::time::Duration,
};

/// Default time allowed for a device to print its ready line.
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 30;

/// Options for one test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Initialize devices on one worker per device.
    pub parallel_flash: bool,
    /// Flash even when the target already holds the same binary.
    pub force_flash: bool,
    /// Never flash.
    pub skip_flash: bool,
    /// Skip the test case's setup phase.
    pub skip_setup: bool,
    /// Skip the test case body.
    pub skip_case: bool,
    /// Skip the test case's teardown phase.
    pub skip_teardown: bool,
    /// Check every device's command line with an echo handshake after ready.
    pub sync_start: bool,
    /// Commands broadcast before the test case.
    pub pre_cmds: Vec<String>,
    /// Commands broadcast after the test case.
    pub post_cmds: Vec<String>,
    /// Default ready-line timeout in seconds.
    pub ready_timeout_secs: u64,
    /// Default command timeout in seconds.
    pub command_timeout_secs: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallel_flash: false,
            force_flash: false,
            skip_flash: false,
            skip_setup: false,
            skip_case: false,
            skip_teardown: false,
            sync_start: false,
            pre_cmds: Vec::new(),
            post_cmds: Vec::new(),
            ready_timeout_secs: DEFAULT_READY_TIMEOUT_SECS,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
        }
    }
}

impl RunOptions {
    /// Ready-line timeout.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Command options carrying the configured default timeout.
    pub fn command_options(&self) -> CommandOptions {
        CommandOptions::default().with_timeout(Duration::from_secs(self.command_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let options: RunOptions = toml::from_str("parallel_flash = true\npre_cmds = [\"reset\"]").unwrap();
        assert!(options.parallel_flash);
        assert_eq!(options.pre_cmds, vec!["reset"]);
        assert_eq!(options.ready_timeout(), Duration::from_secs(30));
        assert_eq!(options.command_options().timeout, Duration::from_secs(50));
    }
}
