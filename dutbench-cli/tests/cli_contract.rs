//! Integration tests for core CLI contract behavior.

use {
    predicates::prelude::*,
    std::{fs, path::Path},
    tempfile::tempdir,
};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("dutbench")
}

#[cfg(unix)]
const DEVICE_SCRIPT: &str = r#"echo "cmd ready"
while IFS= read -r line; do
  case "$line" in
    "echo "*) printf '%s\n' "${line#echo }"; echo "retcode: 0" ;;
    *) echo "retcode: -5" ;;
  esac
done"#;

/// Scenario running two shell devices with `steps` as the case body.
#[cfg(unix)]
fn write_scenario(dir: &Path, name: &str, steps: &str) -> std::path::PathBuf {
    let script = DEVICE_SCRIPT.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n");
    let content = format!(
        r#"
[requirements.duts."*"]
count = 2
type = "process"
nick = "sh{{i}}"

[requirements.duts."*".application]
bin = "/bin/sh"
bin_args = ["-c", "{script}"]
cli_ready_trigger = "cmd ready"
cli_ready_trigger_timeout = 10

{steps}
"#
    );
    let path = dir.join(name);
    fs::write(&path, content).expect("scenario should be written");
    path
}

/// Empty config so host config files do not leak into tests.
fn empty_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("config.toml");
    fs::write(&path, "").expect("config should be written");
    path
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("dutbench"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn run_help_lists_flash_switches() {
    let mut cmd = cli_cmd();
    cmd.args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--skip-flash"))
        .stdout(predicate::str::contains("--json"));
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("dutbench"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn list_ports_json_returns_valid_json() {
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value =
        serde_json::from_str(&stdout).expect("stdout should be valid JSON");
    assert!(parsed.is_array(), "should be a JSON array");
}

#[test]
fn completions_bash_writes_script() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dutbench"));
}

#[test]
fn missing_scenario_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    let config = empty_config(dir.path());

    let mut cmd = cli_cmd();
    cmd.arg("--config")
        .arg(&config)
        .arg("run")
        .arg(dir.path().join("absent.toml"))
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("cannot read scenario"));
}

#[test]
fn invalid_scenario_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    let config = empty_config(dir.path());
    let scenario = dir.path().join("bad.toml");
    fs::write(&scenario, "[[case]]\ncommand = \"a\"\nsleep = 1\n").expect("write");

    let mut cmd = cli_cmd();
    cmd.arg("--config")
        .arg(&config)
        .arg("run")
        .arg(&scenario)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("case step 1"));
}

#[test]
fn skipped_scenario_exits_zero() {
    let dir = tempdir().expect("tempdir should be created");
    let config = empty_config(dir.path());
    let scenario = dir.path().join("skipped.toml");
    fs::write(&scenario, "skip = \"not today\"\n[[case]]\nsleep = 0\n").expect("write");

    let mut cmd = cli_cmd();
    let output = cmd
        .arg("--config")
        .arg(&config)
        .args(["run", "--json"])
        .arg(&scenario)
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert_eq!(json["summary"]["skipped"], 1);
    assert_eq!(json["reports"][0]["verdict"], "skip");
}

#[cfg(unix)]
#[test]
fn shell_scenario_passes_with_json_report() {
    let dir = tempdir().expect("tempdir should be created");
    let config = empty_config(dir.path());
    let scenario = write_scenario(
        dir.path(),
        "echo.toml",
        r#"
[[case]]
command = "echo hi"
expect = ["hi"]

[[case]]
command = "echo only-two"
device = "sh2"
expect = ["only-two"]
"#,
    );

    let mut cmd = cli_cmd();
    let output = cmd
        .arg("--config")
        .arg(&config)
        .args(["run", "--json"])
        .arg(&scenario)
        .output()
        .expect("command should execute");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "stdout: {stdout}\nstderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(json["summary"]["passed"], 1);
    assert_eq!(json["reports"][0]["name"], "echo");
    assert_eq!(json["reports"][0]["outcome"], 0);
}

#[cfg(unix)]
#[test]
fn failing_command_exits_one() {
    let dir = tempdir().expect("tempdir should be created");
    let config = empty_config(dir.path());
    let scenario = write_scenario(
        dir.path(),
        "unknown.toml",
        r#"
[[case]]
command = "frobnicate"
device = 1
"#,
    );

    let mut cmd = cli_cmd();
    cmd.arg("--config")
        .arg(&config)
        .arg("run")
        .arg(&scenario)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("FAIL"))
        .stderr(predicate::str::contains("unknown command"));
}
