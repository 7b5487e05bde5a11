//! Run report rendering.

use {
    console::style,
    dutbench::{RunReport, Verdict},
    serde::Serialize,
};

/// Verdict counts over a set of runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub inconclusive: usize,
}

impl Summary {
    /// Count the verdicts of `reports`.
    pub fn of(reports: &[RunReport]) -> Self {
        reports.iter().fold(
            Self {
                total: reports.len(),
                ..Self::default()
            },
            |mut summary, report| {
                match report.verdict {
                    Verdict::Pass => summary.passed += 1,
                    Verdict::Fail => summary.failed += 1,
                    Verdict::Skip => summary.skipped += 1,
                    Verdict::Inconclusive => summary.inconclusive += 1,
                }
                summary
            },
        )
    }

    /// Process exit code for the run: 0 unless something failed or was inconclusive.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.failed + self.inconclusive > 0)
    }
}

/// One line per report plus phase details for failures, to stderr.
pub fn print_human(reports: &[RunReport], verbose: bool) {
    for report in reports {
        let mark = match report.verdict {
            Verdict::Pass => style("✓ PASS").green().bold(),
            Verdict::Fail => style("✗ FAIL").red().bold(),
            Verdict::Skip => style("- SKIP").yellow().bold(),
            Verdict::Inconclusive => style("? INCONCLUSIVE").magenta().bold(),
        };
        eprintln!(
            "{mark} {} {} {}",
            style(&report.name).cyan(),
            style(format!("[{}]", report.outcome)).dim(),
            style(format!("({:.2}s)", report.duration.as_secs_f64())).dim()
        );
        if let Some(reason) = &report.reason {
            match report.failed_state {
                Some(state) => eprintln!("    {} {state}: {reason}", style("•").dim()),
                None => eprintln!("    {} {reason}", style("•").dim()),
            }
        }
        if verbose || !report.passed() {
            for phase in &report.phases {
                let label = if phase.recovery { " (recovery)" } else { "" };
                let status = match &phase.error {
                    Some(err) => style(format!("error: {err}")).red().to_string(),
                    None => style("ok").green().to_string(),
                };
                eprintln!(
                    "      {:<16} {:>7.2}s  {status}{label}",
                    phase.state.to_string(),
                    phase.duration.as_secs_f64()
                );
            }
        }
    }

    let summary = Summary::of(reports);
    eprintln!(
        "\n{} {} passed, {} failed, {} skipped, {} inconclusive",
        style(format!("{} scenario(s):", summary.total)).bold(),
        style(summary.passed).green(),
        style(summary.failed).red(),
        style(summary.skipped).yellow(),
        style(summary.inconclusive).magenta()
    );
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    summary: Summary,
    reports: &'a [RunReport],
}

/// Reports and summary as pretty JSON.
pub fn to_json(reports: &[RunReport]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&JsonOutput {
        summary: Summary::of(reports),
        reports,
    })
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        dutbench::{Error, Outcome},
    };

    fn failed(name: &str) -> RunReport {
        RunReport::not_started(name, &Error::Config("bad".into()))
    }

    #[test]
    fn test_summary_counts_and_exit_code() {
        let reports = vec![failed("a"), failed("b")];
        let summary = Summary::of(&reports);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.passed + summary.failed + summary.inconclusive, 2);
        assert_eq!(summary.exit_code(), 1);

        assert_eq!(Summary::of(&[]).exit_code(), 0);
    }

    #[test]
    fn test_json_shape() {
        let reports = vec![failed("a")];
        let json: serde_json::Value = serde_json::from_str(&to_json(&reports).unwrap()).unwrap();
        assert_eq!(json["summary"]["total"], 1);
        assert_eq!(json["reports"][0]["name"], "a");
        assert_eq!(json["reports"][0]["outcome"], Outcome::InitializeBench.code());
        assert!(json["reports"][0]["reason"].as_str().unwrap().contains("bad"));
    }
}
