//! Configuration file support for dutbench.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments and environment variables (DUTBENCH_*)
//! 2. Local config file (./dutbench.toml)
//! 3. Global config file (~/.config/dutbench/config.toml)
//!
//! `--config PATH` replaces the file layers.

use {
    crate::CliError,
    anyhow::Result,
    directories::ProjectDirs,
    dutbench::{RunOptions, resource::ResourceInfo},
    log::{debug, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

/// Run option overrides from a `[run]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub parallel_flash: Option<bool>,
    pub force_flash: Option<bool>,
    pub skip_flash: Option<bool>,
    pub skip_setup: Option<bool>,
    pub skip_case: Option<bool>,
    pub skip_teardown: Option<bool>,
    pub sync_start: Option<bool>,
    pub pre_cmds: Option<Vec<String>>,
    pub post_cmds: Option<Vec<String>>,
    /// Seconds.
    pub ready_timeout: Option<u64>,
    /// Seconds.
    pub command_timeout: Option<u64>,
}

impl RunConfig {
    fn merge(&mut self, other: Self) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        take!(
            parallel_flash,
            force_flash,
            skip_flash,
            skip_setup,
            skip_case,
            skip_teardown,
            sync_start,
            pre_cmds,
            post_cmds,
            ready_timeout,
            command_timeout
        );
    }

    /// Apply the set fields to `options`.
    pub fn apply(&self, options: &mut RunOptions) {
        macro_rules! put {
            ($($field:ident => $target:ident),*) => {
                $(if let Some(value) = &self.$field {
                    options.$target = value.clone();
                })*
            };
        }
        put!(
            parallel_flash => parallel_flash,
            force_flash => force_flash,
            skip_flash => skip_flash,
            skip_setup => skip_setup,
            skip_case => skip_case,
            skip_teardown => skip_teardown,
            sync_start => sync_start,
            pre_cmds => pre_cmds,
            post_cmds => post_cmds,
            ready_timeout => ready_timeout_secs,
            command_timeout => command_timeout_secs
        );
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Run options.
    pub run: RunConfig,
    /// Hardware inventory.
    pub resources: Vec<ResourceInfo>,
    /// Also allocate from auto-detected serial ports.
    pub discover_serial: bool,
}

impl Config {
    /// Load configuration from the global and local files.
    ///
    /// Unreadable files are skipped with a warning.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            match Self::load_from_file(&global_path) {
                Ok(Some(global)) => {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global);
                },
                Ok(None) => {},
                Err(e) => warn!("{e:#}"),
            }
        }

        match Self::load_from_file(Path::new("dutbench.toml")) {
            Ok(Some(local)) => {
                debug!("Loaded local config from dutbench.toml");
                config.merge(local);
            },
            Ok(None) => {},
            Err(e) => warn!("{e:#}"),
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Result<Self> {
        match Self::load_from_file(path)? {
            Some(config) => {
                debug!("Loaded config from {}", path.display());
                Ok(config)
            },
            None => Err(CliError::Usage(format!("config file {} not found", path.display())).into()),
        }
    }

    /// Parse a config file, `None` if it does not exist.
    fn load_from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::Usage(format!("failed to read {}: {e}", path.display())))?;
        let config = toml::from_str(&content)
            .map_err(|e| CliError::Usage(format!("failed to parse {}: {e}", path.display())))?;
        Ok(Some(config))
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "dutbench").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        self.run.merge(other.run);
        for resource in other.resources {
            match self
                .resources
                .iter_mut()
                .find(|r| r.resource_id == resource.resource_id)
            {
                Some(existing) => *existing = resource,
                None => self.resources.push(resource),
            }
        }
        if other.discover_serial {
            self.discover_serial = true;
        }
    }

    /// Run options from the built-in defaults and the `[run]` section.
    pub fn run_options(&self) -> RunOptions {
        let mut options = RunOptions::default();
        self.run.apply(&mut options);
        options
    }
}
