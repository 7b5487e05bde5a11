//! Scenario runs.

use {
    crate::{
        Cli, CliError, RunArgs,
        config::Config,
        report::{self, Summary},
        scenario::Scenario,
        use_fancy_output, was_interrupted,
    },
    anyhow::{Context, Result},
    console::style,
    dutbench::{
        ResourceProvider, RunOptions, Verdict,
        resource::LocalAllocator,
        run_testcase,
    },
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    log::{info, warn},
};

/// Run options from the config with command-line switches on top.
fn run_options(args: &RunArgs, config: &Config) -> RunOptions {
    let mut options = config.run_options();
    if args.parallel_flash {
        options.parallel_flash = true;
    }
    if args.force_flash {
        options.force_flash = true;
        options.skip_flash = false;
    }
    if args.skip_flash {
        options.skip_flash = true;
    }
    if args.sync_start {
        options.sync_start = true;
    }
    options
}

fn provider(config: &Config) -> ResourceProvider {
    let allocator = if config.discover_serial {
        LocalAllocator::discover().with_resources(config.resources.clone())
    } else {
        LocalAllocator::new(config.resources.clone())
    };
    info!("Inventory: {} resource(s)", allocator.resources().len());
    ResourceProvider::new(allocator)
}

fn progress_bar(cli: &Cli, args: &RunArgs, total: usize) -> ProgressBar {
    if total < 2 || args.json || cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

/// Run every scenario in order and report; returns the exit code.
pub(crate) fn cmd_run(cli: &Cli, args: &RunArgs, config: &Config) -> Result<i32> {
    let scenarios = args
        .scenarios
        .iter()
        .map(|path| Scenario::from_file(path))
        .collect::<Result<Vec<_>>>()?;

    let options = run_options(args, config);
    let provider = provider(config);
    let pb = progress_bar(cli, args, scenarios.len());

    let mut reports = Vec::with_capacity(scenarios.len());
    for scenario in &scenarios {
        if was_interrupted() {
            warn!("Interrupted, not starting '{}'", scenario.name());
            break;
        }
        pb.set_message(scenario.name().to_string());
        let report = run_testcase(scenario, &options, &provider);
        pb.inc(1);

        let failed = matches!(report.verdict, Verdict::Fail | Verdict::Inconclusive);
        reports.push(report);
        if failed && args.fail_fast {
            warn!("Stopping after failure of '{}' (--fail-fast)", scenario.name());
            break;
        }
    }
    pb.finish_and_clear();

    if args.json {
        println!("{}", report::to_json(&reports).context("failed to encode reports")?);
    } else if !cli.quiet || reports.iter().any(|r| !r.passed()) {
        report::print_human(&reports, cli.verbose > 0);
    }

    if was_interrupted() {
        return Err(CliError::Cancelled(format!(
            "run aborted by user after {} of {} scenario(s)",
            reports.len(),
            scenarios.len()
        ))
        .into());
    }

    let code = Summary::of(&reports).exit_code();
    if code == 0 && !cli.quiet && !args.json {
        eprintln!("{} All scenarios passed", style("🎉").green().bold());
    }
    Ok(code)
}
