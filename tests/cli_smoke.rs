use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_path(prefix: &str, ext: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before unix epoch")
        .as_nanos();
    path.push(format!("{prefix}_{}_{}.{}", std::process::id(), nanos, ext));
    path
}

fn find_arghmm_binary() -> PathBuf {
    if let Some(path) = option_env!("CARGO_BIN_EXE_arghmm") {
        return PathBuf::from(path);
    }

    let current = std::env::current_exe().expect("failed to get current exe path");
    let deps_dir = current
        .parent()
        .expect("failed to get deps dir from current exe")
        .to_path_buf();
    let debug_dir = deps_dir
        .parent()
        .expect("failed to get debug dir from deps dir")
        .to_path_buf();

    let direct = debug_dir.join("arghmm");
    if direct.exists() {
        return direct;
    }
    panic!("failed to find arghmm binary in CARGO_BIN_EXE_arghmm or target/debug");
}

const JOB: &str = r#"{
  "model": {
    "times": [0.0, 10.0, 100.0, 1000.0, 10000.0],
    "popsizes": [10000.0],
    "rho": 1e-4,
    "mu": 1e-4
  },
  "sequences": [
    {"name": "a", "seq": "AACGTACGTA"},
    {"name": "b", "seq": "AACGTACGTT"},
    {"name": "c", "seq": "AACCTACGTG"},
    {"name": "new", "seq": "AACGTNCGTA"}
  ],
  "start_coord": 100,
  "blocks": [
    {"parents": [3, 3, 4, 4, null], "ages": [0, 0, 0, 1, 2], "len": 6},
    {
      "parents": [4, 3, 3, 4, null],
      "ages": [0, 0, 0, 1, 2],
      "len": 4,
      "switch": {
        "nstates1": 11,
        "nstates2": 11,
        "determ": [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
        "determ_prob": [1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1]
      }
    }
  ]
}"#;

fn run_task(job: &Path, task: &str) -> Value {
    let output = unique_temp_path(&format!("arghmm_cli_{task}"), "json");
    let status = Command::new(find_arghmm_binary())
        .arg(job)
        .arg(&output)
        .arg("--task")
        .arg(task)
        .arg("--seed")
        .arg("11")
        .arg("--no-progress")
        .status()
        .expect("failed to run arghmm binary");
    assert!(status.success(), "arghmm --task {task} exited with non-zero status");

    let out = fs::read_to_string(&output).expect("failed to read arghmm output json");
    let _ = fs::remove_file(output);
    serde_json::from_str(&out).expect("output json is invalid")
}

#[test]
fn cli_runs_threading_tasks() {
    let job = unique_temp_path("arghmm_cli_job", "json");
    fs::write(&job, JOB).expect("failed to write cli test job");

    let max = run_task(&job, "max");
    assert_eq!(max["start_coord"], 100);
    assert_eq!(max["path"].as_array().map(Vec::len), Some(10));
    assert_eq!(max["states"].as_array().map(Vec::len), Some(10));

    let sample = run_task(&job, "sample");
    assert_eq!(sample["path"].as_array().map(Vec::len), Some(10));
    assert_eq!(run_task(&job, "sample")["path"], sample["path"]);

    let fwd = run_task(&job, "forward");
    assert_eq!(fwd["cols"].as_array().map(Vec::len), Some(10));

    let check = run_task(&job, "check-emit");
    assert_eq!(check["ok"], true);

    let noncompat = run_task(&job, "noncompat");
    assert_eq!(noncompat["noncompat"], 1);

    let _ = fs::remove_file(job);
}

#[test]
fn cli_fails_on_missing_job() {
    let job = unique_temp_path("arghmm_cli_missing", "json");
    let output = unique_temp_path("arghmm_cli_missing_out", "json");
    let status = Command::new(find_arghmm_binary())
        .arg(&job)
        .arg(&output)
        .arg("--no-progress")
        .status()
        .expect("failed to run arghmm binary");
    assert!(!status.success());
    assert!(!output.exists());
}
