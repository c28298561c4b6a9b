use assert_cmd::Command;
use predicates::prelude::*;

use iomark_engine::trace::{ts_opts, TraceBuffer, TraceConfig, TraceEntry};

fn write_sample_dump(path: &std::path::Path, entries: usize) {
    let buf = TraceBuffer::new(&TraceConfig {
        options: ts_opts::ON | ts_opts::DUMP,
        size: entries.max(1),
        binary_path: Some(path.to_path_buf()),
        ..Default::default()
    });
    for i in 0..entries as i64 {
        buf.record(TraceEntry {
            op_type: 1,
            worker_id: (i % 4) as u8,
            pass_number: 1,
            thread_id: 1000,
            disk_xfer: 4096,
            net_xfer: 0,
            op_number: i,
            byte_offset: i * 4096,
            disk_start: 100 + i as u64,
            disk_end: 200 + i as u64,
            net_start: 0,
            net_end: 0,
        });
    }
    buf.write_dump(&Default::default()).unwrap();
}

#[test]
fn table_output_carries_header_and_rows() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("t.ts");
    write_sample_dump(&dump, 5);

    Command::cargo_bin("iomark-trace")
        .unwrap()
        .arg(&dump)
        .assert()
        .success()
        .stdout(predicate::str::contains("entries     5"))
        .stdout(predicate::str::contains("read"));
}

#[test]
fn json_output_is_one_object_per_line() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("t.ts");
    write_sample_dump(&dump, 3);

    let out = Command::cargo_bin("iomark-trace")
        .unwrap()
        .args([dump.to_str().unwrap(), "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    // Header line plus one line per entry.
    assert_eq!(lines.len(), 4);
    for line in lines {
        let v: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(v.is_object());
    }
}

#[test]
fn garbage_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let bad = dir.path().join("bad.ts");
    std::fs::write(&bad, b"not a dump").unwrap();

    Command::cargo_bin("iomark-trace")
        .unwrap()
        .arg(&bad)
        .assert()
        .failure();
}
