//! dutbench CLI - Run declarative test scenarios against devices under test.
//!
//! ## Features
//!
//! - Run TOML test scenarios on serial, hardware and process devices
//! - Human or JSON run reports
//! - Serial port listing
//! - Shell completion generation
//! - Layered configuration files and environment variable support

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        process,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

mod commands;
mod config;
mod report;
mod scenario;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Number of Ctrl-C presses received.
static INTERRUPTS: AtomicUsize = AtomicUsize::new(0);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTS.load(Ordering::SeqCst) > 0
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation or input files.
    #[error("{0}")]
    Usage(String),
    /// Stopped by the user.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

/// dutbench - Run command/response tests against devices under test.
///
/// Environment variables:
///   DUTBENCH_CONFIG            - Configuration file path
///   DUTBENCH_PARALLEL_FLASH    - Initialize devices in parallel
///   DUTBENCH_FORCE_FLASH       - Flash even if the content hash matches
///   DUTBENCH_SKIP_FLASH        - Never flash
///   RUST_LOG                   - Log filter (overrides -v/-q)
#[derive(Parser)]
#[command(name = "dutbench")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH", env = "DUTBENCH_CONFIG")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Flags of the `run` subcommand.
#[derive(clap::Args)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct RunArgs {
    /// Scenario files to run, in order.
    #[arg(required = true, value_name = "SCENARIO")]
    scenarios: Vec<PathBuf>,

    /// Print reports as JSON to stdout.
    #[arg(long)]
    json: bool,

    /// Initialize devices on one worker per device.
    #[arg(long, env = "DUTBENCH_PARALLEL_FLASH")]
    parallel_flash: bool,

    /// Flash even when the device already holds the binary.
    #[arg(long, env = "DUTBENCH_FORCE_FLASH", conflicts_with = "skip_flash")]
    force_flash: bool,

    /// Never flash.
    #[arg(long, env = "DUTBENCH_SKIP_FLASH")]
    skip_flash: bool,

    /// Run an echo handshake on every device once it is ready.
    #[arg(long)]
    sync_start: bool,

    /// Stop after the first failing scenario.
    #[arg(long)]
    fail_fast: bool,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Run test scenarios.
    Run(RunArgs),

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

/// First Ctrl-C asks the run to stop after teardown, the second exits.
fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        if INTERRUPTS.fetch_add(1, Ordering::SeqCst) > 0 {
            process::exit(130);
        }
        eprintln!(
            "\n{} Interrupted, tearing down (press Ctrl-C again to exit now)",
            style("⚠").yellow()
        );
    });
    if let Err(e) = result {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    dutbench::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Commands::Run(args) => {
            let config = match &cli.config_path {
                Some(path) => Config::load_from_path(path)?,
                None => Config::load(),
            };
            commands::run::cmd_run(cli, args, &config)
        },
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json)?;
            Ok(0)
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(0)
        },
    }
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    debug!(
        "dutbench v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let code = match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            err.downcast_ref::<CliError>()
                .map_or(1, CliError::exit_code)
        },
    };
    process::exit(code);
}
