//! Resource requirements, allocation and device initialization.
//!
//! A test declares what devices it needs with [`Requirements`]. The
//! [`ResourceProvider`] turns them into an [`AllocationContextList`] through an
//! [`Allocator`], builds one [`crate::Device`] per context, and opens them.
//!
//! ```rust
//! use dutbench::resource::{RequirementOverride, Requirements};
//!
//! let requirements = Requirements::new()
//!     .with_defaults(RequirementOverride::default().with_count(3).with_type("process").with_nick("node{i}"))
//!     .with_device("3", RequirementOverride::default().with_nick("sink"));
//! let resolved = requirements.resolve().unwrap();
//! assert_eq!(resolved[0].nick.as_deref(), Some("node1"));
//! assert_eq!(resolved[2].nick.as_deref(), Some("sink"));
//! ```

pub mod allocator;
pub mod context;
pub mod flash;
pub mod provider;

use {
    crate::error::{Error, Result},
    serde::{Deserialize, Serialize},
    std::{collections::BTreeMap, path::PathBuf, time::Duration},
};

pub use {
    allocator::{Allocator, LocalAllocator, ResourceInfo},
    context::{AllocationContext, AllocationContextList, DeviceConstructor, default_constructors},
    flash::{CopyFlasher, Flasher, flash_needed},
    provider::ResourceProvider,
};

/// Device type used when a requirement names none.
pub const DEFAULT_DEVICE_TYPE: &str = "hardware";

/// How the device's application is launched and recognised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Binary to flash (hardware) or run (process).
    pub bin: Option<PathBuf>,
    /// Arguments for a process binary.
    pub bin_args: Vec<String>,
    /// Line the device prints once its command line is ready.
    pub cli_ready_trigger: Option<String>,
    /// Seconds to wait for the ready line.
    pub cli_ready_trigger_timeout: Option<u64>,
    /// Commands sent once the device is ready.
    pub init_cli_cmds: Vec<String>,
    /// Commands sent before the device is released.
    pub post_cli_cmds: Vec<String>,
    /// Serial baud rate.
    pub baudrate: Option<u32>,
}

/// Partial [`ApplicationConfig`] used in overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationOverride {
    /// See [`ApplicationConfig::bin`].
    pub bin: Option<PathBuf>,
    /// See [`ApplicationConfig::bin_args`].
    pub bin_args: Option<Vec<String>>,
    /// See [`ApplicationConfig::cli_ready_trigger`].
    pub cli_ready_trigger: Option<String>,
    /// See [`ApplicationConfig::cli_ready_trigger_timeout`].
    pub cli_ready_trigger_timeout: Option<u64>,
    /// See [`ApplicationConfig::init_cli_cmds`].
    pub init_cli_cmds: Option<Vec<String>>,
    /// See [`ApplicationConfig::post_cli_cmds`].
    pub post_cli_cmds: Option<Vec<String>>,
    /// See [`ApplicationConfig::baudrate`].
    pub baudrate: Option<u32>,
}

impl ApplicationOverride {
    fn apply(&self, target: &mut ApplicationConfig) {
        if let Some(bin) = &self.bin {
            target.bin = Some(bin.clone());
        }
        if let Some(args) = &self.bin_args {
            target.bin_args.clone_from(args);
        }
        if let Some(trigger) = &self.cli_ready_trigger {
            target.cli_ready_trigger = Some(trigger.clone());
        }
        if let Some(timeout) = self.cli_ready_trigger_timeout {
            target.cli_ready_trigger_timeout = Some(timeout);
        }
        if let Some(cmds) = &self.init_cli_cmds {
            target.init_cli_cmds.clone_from(cmds);
        }
        if let Some(cmds) = &self.post_cli_cmds {
            target.post_cli_cmds.clone_from(cmds);
        }
        if let Some(baud) = self.baudrate {
            target.baudrate = Some(baud);
        }
    }
}

/// Fully resolved requirement for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceRequirement {
    /// Device type tag (`hardware`, `serial`, `process`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Platforms the device may be.
    pub allowed_platforms: Vec<String>,
    /// Exact platform required.
    pub platform_name: Option<String>,
    /// Nickname.
    pub nick: Option<String>,
    /// Serial port for `serial` devices.
    pub serial_port: Option<String>,
    /// Application settings.
    pub application: ApplicationConfig,
    /// Commands sent to this device before the test case.
    pub pre_cmds: Vec<String>,
    /// Commands sent to this device after the test case.
    pub post_cmds: Vec<String>,
}

impl Default for DeviceRequirement {
    fn default() -> Self {
        Self {
            kind: DEFAULT_DEVICE_TYPE.to_string(),
            allowed_platforms: Vec::new(),
            platform_name: None,
            nick: None,
            serial_port: None,
            application: ApplicationConfig::default(),
            pre_cmds: Vec::new(),
            post_cmds: Vec::new(),
        }
    }
}

impl DeviceRequirement {
    /// Ready-line timeout, falling back to `default`.
    pub fn ready_timeout(&self, default: Duration) -> Duration {
        self.application
            .cli_ready_trigger_timeout
            .map_or(default, Duration::from_secs)
    }

    /// Whether `platform` satisfies this requirement.
    pub fn accepts_platform(&self, platform: Option<&str>) -> bool {
        if let Some(name) = &self.platform_name {
            return platform == Some(name.as_str());
        }
        self.allowed_platforms.is_empty()
            || platform.is_some_and(|p| self.allowed_platforms.iter().any(|a| a == p))
    }
}

/// Partial requirement applied to one or more devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequirementOverride {
    /// Number of devices; only meaningful under `"*"`.
    pub count: Option<usize>,
    /// See [`DeviceRequirement::kind`].
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// See [`DeviceRequirement::allowed_platforms`].
    pub allowed_platforms: Option<Vec<String>>,
    /// See [`DeviceRequirement::platform_name`].
    pub platform_name: Option<String>,
    /// Nickname; `{i}` and `{n}` expand to index and count.
    pub nick: Option<String>,
    /// See [`DeviceRequirement::serial_port`].
    pub serial_port: Option<String>,
    /// Application settings.
    pub application: Option<ApplicationOverride>,
    /// See [`DeviceRequirement::pre_cmds`].
    pub pre_cmds: Option<Vec<String>>,
    /// See [`DeviceRequirement::post_cmds`].
    pub post_cmds: Option<Vec<String>>,
}

impl RequirementOverride {
    /// Set the device count.
    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Set the device type.
    #[must_use]
    pub fn with_type(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Set the nickname template.
    #[must_use]
    pub fn with_nick(mut self, nick: impl Into<String>) -> Self {
        self.nick = Some(nick.into());
        self
    }

    /// Set the application binary and its arguments.
    #[must_use]
    pub fn with_bin(mut self, bin: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let application = self.application.get_or_insert_with(ApplicationOverride::default);
        application.bin = Some(bin.into());
        application.bin_args = Some(args);
        self
    }

    /// Set the ready line.
    #[must_use]
    pub fn with_ready_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.application
            .get_or_insert_with(ApplicationOverride::default)
            .cli_ready_trigger = Some(trigger.into());
        self
    }

    fn apply(&self, target: &mut DeviceRequirement) {
        if let Some(kind) = &self.kind {
            target.kind.clone_from(kind);
        }
        if let Some(platforms) = &self.allowed_platforms {
            target.allowed_platforms.clone_from(platforms);
        }
        if let Some(platform) = &self.platform_name {
            target.platform_name = Some(platform.clone());
        }
        if let Some(nick) = &self.nick {
            target.nick = Some(nick.clone());
        }
        if let Some(port) = &self.serial_port {
            target.serial_port = Some(port.clone());
        }
        if let Some(application) = &self.application {
            application.apply(&mut target.application);
        }
        if let Some(cmds) = &self.pre_cmds {
            target.pre_cmds.clone_from(cmds);
        }
        if let Some(cmds) = &self.post_cmds {
            target.post_cmds.clone_from(cmds);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DutKey {
    All,
    Index(usize),
    Range(usize, usize),
}

impl DutKey {
    fn parse(key: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid dut key '{key}'"));
        let index = |text: &str| -> Result<usize> {
            match text.trim().parse() {
                Ok(0) | Err(_) => Err(invalid()),
                Ok(n) => Ok(n),
            }
        };
        let key = key.trim();
        if key == "*" {
            return Ok(Self::All);
        }
        match key.split_once("..") {
            Some((start, end)) => {
                let (start, end) = (index(start)?, index(end)?);
                if start > end {
                    return Err(invalid());
                }
                Ok(Self::Range(start, end))
            },
            None => index(key).map(Self::Index),
        }
    }

    fn highest(self) -> usize {
        match self {
            Self::All => 0,
            Self::Index(i) | Self::Range(_, i) => i,
        }
    }
}

/// Device requirements of a test case, keyed like `{"*": ..., "2": ..., "1..3": ...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    /// Overrides by key.
    #[serde(default)]
    pub duts: BTreeMap<String, RequirementOverride>,
}

impl Requirements {
    /// No devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `"*"` entry.
    #[must_use]
    pub fn with_defaults(mut self, defaults: RequirementOverride) -> Self {
        self.duts.insert("*".to_string(), defaults);
        self
    }

    /// Set the entry for an index (`"2"`) or an inclusive range (`"1..3"`).
    #[must_use]
    pub fn with_device(mut self, key: impl Into<String>, value: RequirementOverride) -> Self {
        self.duts.insert(key.into(), value);
        self
    }

    /// Number of devices: the `"*"` count, else the highest index mentioned.
    pub fn count(&self) -> Result<usize> {
        let mut highest = 0;
        for key in self.duts.keys() {
            highest = highest.max(DutKey::parse(key)?.highest());
        }
        match self.duts.get("*").and_then(|all| all.count) {
            Some(count) if highest > count => Err(Error::Config(format!(
                "dut index {highest} exceeds count {count}"
            ))),
            Some(count) => Ok(count),
            None => Ok(highest),
        }
    }

    /// Resolve one [`DeviceRequirement`] per device, in index order.
    pub fn resolve(&self) -> Result<Vec<DeviceRequirement>> {
        let count = self.count()?;
        let mut singles = Vec::new();
        let mut ranges = Vec::new();
        for (key, value) in &self.duts {
            match DutKey::parse(key)? {
                DutKey::All => {},
                DutKey::Index(i) => singles.push((i, i, value)),
                DutKey::Range(start, end) => ranges.push((start, end, value)),
            }
        }
        // BTreeMap orders "10" before "2"
        singles.sort_by_key(|(start, ..)| *start);
        ranges.sort_by_key(|(start, end, _)| (*start, *end));

        let mut resolved = Vec::with_capacity(count);
        for index in 1..=count {
            let mut requirement = DeviceRequirement::default();
            if let Some(all) = self.duts.get("*") {
                all.apply(&mut requirement);
            }
            for (start, end, value) in singles.iter().chain(ranges.iter()) {
                if (*start..=*end).contains(&index) {
                    value.apply(&mut requirement);
                }
            }
            requirement.nick = requirement.nick.map(|nick| {
                nick.replace("{i}", &index.to_string())
                    .replace("{n}", &count.to_string())
            });
            resolved.push(requirement);
        }

        let mut seen = std::collections::HashSet::new();
        for nick in resolved.iter().filter_map(|r| r.nick.as_deref()) {
            if !seen.insert(nick) {
                return Err(Error::Config(format!("duplicate nick '{nick}'")));
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_all_index_range() {
        let requirements = Requirements::new()
            .with_defaults(RequirementOverride::default().with_count(3).with_type("process"))
            .with_device("2", RequirementOverride::default().with_type("serial").with_nick("two"))
            .with_device("2..3", RequirementOverride::default().with_type("hardware"));
        let resolved = requirements.resolve().unwrap();
        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[0].kind, "process");
        assert_eq!(resolved[1].kind, "hardware");
        assert_eq!(resolved[1].nick.as_deref(), Some("two"));
        assert_eq!(resolved[2].kind, "hardware");
    }

    #[test]
    fn test_count_from_highest_index() {
        let requirements = Requirements::new()
            .with_device("4", RequirementOverride::default().with_nick("last"));
        let resolved = requirements.resolve().unwrap();
        assert_eq!(resolved.len(), 4);
        assert_eq!(resolved[0].kind, DEFAULT_DEVICE_TYPE);
        assert_eq!(resolved[3].nick.as_deref(), Some("last"));
    }

    #[test]
    fn test_nick_substitution_and_duplicates() {
        let unique = Requirements::new()
            .with_defaults(RequirementOverride::default().with_count(2).with_nick("dev{i}of{n}"));
        let resolved = unique.resolve().unwrap();
        assert_eq!(resolved[1].nick.as_deref(), Some("dev2of2"));

        let duplicated = Requirements::new()
            .with_defaults(RequirementOverride::default().with_count(2).with_nick("same"));
        assert!(matches!(duplicated.resolve(), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_keys() {
        for key in ["0", "x", "3..1", "1..b"] {
            let requirements = Requirements::new().with_device(key, RequirementOverride::default());
            assert!(requirements.resolve().is_err(), "{key} should be rejected");
        }
        let too_far = Requirements::new()
            .with_defaults(RequirementOverride::default().with_count(1))
            .with_device("2", RequirementOverride::default());
        assert!(too_far.count().is_err());
    }

    #[test]
    fn test_toml_schema() {
        let requirements: Requirements = toml::from_str(
            r#"
            [duts."*"]
            count = 2
            type = "process"
            application = { bin = "/bin/sh", cli_ready_trigger = "ready", init_cli_cmds = ["echo init"] }

            [duts."2"]
            nick = "sink"
            allowed_platforms = ["K64F"]
            "#,
        )
        .unwrap();
        let resolved = requirements.resolve().unwrap();
        assert_eq!(resolved[0].application.bin, Some(PathBuf::from("/bin/sh")));
        assert_eq!(resolved[1].application.init_cli_cmds, vec!["echo init"]);
        assert!(resolved[1].accepts_platform(Some("K64F")));
        assert!(!resolved[1].accepts_platform(None));
        assert!(resolved[0].accepts_platform(None));
    }

    #[test]
    fn test_ready_timeout_fallback() {
        let mut requirement = DeviceRequirement::default();
        assert_eq!(requirement.ready_timeout(Duration::from_secs(30)), Duration::from_secs(30));
        requirement.application.cli_ready_trigger_timeout = Some(5);
        assert_eq!(requirement.ready_timeout(Duration::from_secs(30)), Duration::from_secs(5));
    }
}
