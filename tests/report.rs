//! Integration test for `callgauge report` against snapshots delivered in-process.

use std::path::Path;
use std::process::Command;

use callgauge::deliver::write_snapshot;
use callgauge::json::JsonRenderer;
use callgauge_runtime::{Profiler, ProfilerConfig, RenderOptions};

fn deliver_sample(dir: &Path) {
    let profiler = Profiler::new(ProfilerConfig::default());
    profiler.profile("Server", "handle", || {
        for _ in 0..3 {
            profiler.profile("Db", "query", || std::hint::black_box(1));
        }
        profiler.profile("Cache", "get", || std::hint::black_box(2));
    });
    let options = RenderOptions {
        min_max: true,
        highlight_critical: false,
        ..RenderOptions::default()
    };
    write_snapshot(&profiler, &JsonRenderer, &options, dir).unwrap();
}

fn report(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_callgauge"))
        .arg("report")
        .args(args)
        .env_remove("CALLGAUGE_SNAPSHOT_DIR")
        .output()
        .expect("failed to run callgauge report")
}

#[test]
fn report_renders_latest_outline() {
    let tmp = tempfile::tempdir().unwrap();
    deliver_sample(tmp.path());

    let dir = tmp.path().to_str().unwrap();
    let output = report(&["--dir", dir, "--class-names"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "report failed:\n{stderr}");

    let lines: Vec<&str> = stdout.lines().collect();
    assert!(lines[0].starts_with("source: "), "{stdout}");
    let root = lines
        .iter()
        .position(|l| l.starts_with("Server::handle  1 call"))
        .unwrap_or_else(|| panic!("root missing:\n{stdout}"));
    assert!(
        lines[root + 1..]
            .iter()
            .any(|l| l.trim_start().starts_with("Db::query  3 calls")),
        "callee missing:\n{stdout}"
    );
}

#[test]
fn report_json_for_explicit_file() {
    let tmp = tempfile::tempdir().unwrap();
    deliver_sample(tmp.path());
    let file = callgauge::deliver::latest_snapshot(tmp.path()).unwrap();

    let output = report(&[file.to_str().unwrap(), "--json", "--min-max"]);
    assert!(output.status.success());
    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let root = &doc["roots"][0];
    assert_eq!(root["method"], "handle");
    assert!(root.get("class").is_none(), "class names are opt-in");
    assert!(root.get("min").is_some());
    assert_eq!(root["edges"].as_array().unwrap().len(), 2);
}

#[test]
fn report_without_snapshots_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let output = report(&["--dir", tmp.path().to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.starts_with("error: no callgauge snapshots found"),
        "{stderr}"
    );
}
