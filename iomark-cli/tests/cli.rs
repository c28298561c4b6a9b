use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn iomark() -> Command {
    let mut cmd = Command::cargo_bin("iomark").unwrap();
    // Keep host config out of the tests.
    cmd.env("IOMARK_CONFIG", "/nonexistent/iomark.toml");
    cmd
}

#[test]
fn help_lists_the_main_flags() {
    iomark()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--queuedepth"))
        .stdout(predicate::str::contains("--ordering"))
        .stdout(predicate::str::contains("--throttle"));
}

#[test]
fn missing_targets_is_an_invalid_argument() {
    iomark()
        .args(["--numreqs", "10"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no targets"));
}

#[test]
fn bad_suboption_is_an_invalid_option() {
    iomark()
        .args(["--null", "--numreqs", "4", "--throttle", "warp=9"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("throttle"));
}

#[test]
fn unknown_flag_is_an_invalid_argument() {
    iomark().arg("--frobnicate").assert().code(2);
}

#[test]
fn sequential_read_of_a_real_file_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("data.bin");
    fs::write(&file, vec![7u8; 64 * 1024]).unwrap();

    iomark()
        .args([
            "--target",
            file.to_str().unwrap(),
            "--blocksize",
            "4096",
            "--reqsize",
            "1",
            "--numreqs",
            "16",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("16 ops"))
        .stdout(predicate::str::contains("65536 bytes"));
}

#[test]
fn write_run_creates_the_target_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("out.bin");

    iomark()
        .args([
            "--target",
            file.to_str().unwrap(),
            "--op",
            "write",
            "--blocksize",
            "4096",
            "--reqsize",
            "2",
            "--numreqs",
            "8",
            "--queuedepth",
            "2",
        ])
        .assert()
        .success();
    assert_eq!(fs::metadata(&file).unwrap().len(), 8 * 2 * 4096);
}

#[test]
fn null_target_runs_without_storage() {
    iomark()
        .args(["--null", "--numreqs", "100", "--blocksize", "1024", "--reqsize", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("100 ops"));
}

#[test]
fn missing_input_file_fails_target_start() {
    iomark()
        .args(["--target", "/nonexistent/input.bin", "--numreqs", "4"])
        .assert()
        .code(4);
}
