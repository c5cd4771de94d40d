//! Smoke tests -- verify the binary runs and its subcommands work end to end.

use assert_cmd::Command;
use predicates::prelude::*;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("accel-dispatch").unwrap();
    // Keep a config on the build host from leaking into the tests.
    cmd.env("ACCEL_DISPATCH_CONFIG", "/nonexistent/dispatch.toml");
    cmd
}

#[test]
fn test_cli_help() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Task dispatch for multi-core compute accelerators"));
}

#[test]
fn test_cli_version() {
    cli()
        .arg("version")
        .assert()
        .success()
        .stdout(predicates::str::contains(format!(
            "accel-dispatch {}",
            env!("CARGO_PKG_VERSION")
        )));
}

#[test]
fn test_info_json_lists_default_cores() {
    let output = cli().args(["info", "--json"]).output().unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let cores = json["cores"].as_array().unwrap();
    assert_eq!(cores.len(), 2);
    assert_eq!(cores[0]["core_type"], "4pe");
    assert_eq!(cores[0]["remaining"], 32);
    assert_eq!(json["groups"][0]["proportion"], 100);
}

#[test]
fn test_info_table() {
    cli()
        .arg("info")
        .assert()
        .success()
        .stdout(predicates::str::contains("Core").and(predicates::str::contains("proportion 100%")));
}

#[test]
fn test_info_with_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dispatch.toml");
    std::fs::write(
        &path,
        r#"
[[device.cores]]
core_type = "1pe"
fifo_capacity = 4

[simulation]
time_scale = 0.0
"#,
    )
    .unwrap();

    let output = cli()
        .args(["--config", path.to_str().unwrap(), "info", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["cores"].as_array().unwrap().len(), 1);
    assert_eq!(json["cores"][0]["core_type"], "1pe");
    assert_eq!(json["cores"][0]["capacity"], 4);
}

#[test]
fn test_bad_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dispatch.toml");
    std::fs::write(&path, "[device]\npage_size = 3000\n").unwrap();

    cli()
        .args(["--config", path.to_str().unwrap(), "info"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid config file"));
}

#[test]
fn test_bench_trig_core_completes_everything() {
    let output = cli()
        .args(["bench", "--tasks", "40", "--estimate-us", "20", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["tasks"], 40);
    let done = report["done"].as_u64().unwrap();
    let failed = report["failed"].as_u64().unwrap();
    assert_eq!(done + failed, 40);
}

#[test]
fn test_bench_trig_task_by_load() {
    cli()
        .args([
            "bench", "--kind", "trig-task", "--choose", "load", "--tasks", "10", "--estimate-us",
            "10",
        ])
        .assert()
        .success()
        .stdout(predicates::str::contains("Tasks:        10"));
}

#[test]
fn test_bench_no_core_mask() {
    cli()
        .args(["bench", "--mask", "16", "--tasks", "1"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("opening core handle"));
}
