//! End-to-end copy over loopback: a source plan and a destination plan
//! in one process, paired worker-for-worker over TCP.

use std::fs;
use std::path::Path;
use std::thread;

use iomark_engine::exit_code;
use iomark_engine::plan::{E2eAttr, Plan, PlanAttr, TargetAttr};
use iomark_engine::target::{pattern_fill, E2eRole};
use iomark_engine::trace::{read_dump, ts_opts, TraceConfig};
use iomark_engine::types::{OrderingMode, TargetRole};

const BLOCK: usize = 4096;
const OPS: u64 = 16;
const QD: usize = 2;

fn make_patterned_file(path: &Path, bytes: usize) {
    let mut data = vec![0u8; bytes];
    pattern_fill(&mut data, 0);
    fs::write(path, &data).unwrap();
}

fn e2e_attr(role: E2eRole, base_port: u16) -> E2eAttr {
    E2eAttr {
        role,
        host: "127.0.0.1".into(),
        base_port,
        port_count: QD as u16,
        nodelay: true,
        linger: None,
    }
}

#[test]
fn e2e_copy_delivers_identical_bytes_in_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let src_file = dir.path().join("src.dat");
    let dst_file = dir.path().join("dst.dat");
    let dst_dump = dir.path().join("dst.ts");
    make_patterned_file(&src_file, OPS as usize * BLOCK);
    let base_port = 41710;

    let dst_path = dst_file.clone();
    let dest = thread::spawn(move || {
        let attr = PlanAttr::new().block_size(BLOCK).request_size(1);
        let ta = TargetAttr {
            role: TargetRole::Out,
            uri: dst_path,
            num_reqs: Some(OPS),
            num_threads: QD,
            network_ordering: OrderingMode::Serial,
            e2e: Some(e2e_attr(E2eRole::Destination, base_port)),
            trace: TraceConfig {
                options: ts_opts::ON | ts_opts::DUMP,
                size: 2 * OPS as usize,
                binary_path: Some(dst_dump.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut plan = Plan::new(attr, vec![ta]).unwrap();
        let results = plan.run().unwrap();
        (results, dst_dump)
    });

    let src_path = src_file.clone();
    let source = thread::spawn(move || {
        let attr = PlanAttr::new().block_size(BLOCK).request_size(1);
        let ta = TargetAttr {
            role: TargetRole::In,
            uri: src_path,
            num_reqs: Some(OPS),
            num_threads: QD,
            e2e: Some(e2e_attr(E2eRole::Source, base_port)),
            ..Default::default()
        };
        let mut plan = Plan::new(attr, vec![ta]).unwrap();
        plan.run().unwrap()
    });

    let src_results = source.join().unwrap();
    let (dst_results, dump) = dest.join().unwrap();

    assert_eq!(src_results.exit_code, exit_code::SUCCESS);
    assert_eq!(dst_results.exit_code, exit_code::SUCCESS);
    assert_eq!(src_results.targets[0].counters.read_op_count, OPS);
    assert_eq!(dst_results.targets[0].counters.write_op_count, OPS);

    // Round trip: destination bytes equal source bytes.
    let src_bytes = fs::read(&src_file).unwrap();
    let dst_bytes = fs::read(&dst_file).unwrap();
    assert_eq!(src_bytes, dst_bytes);

    // Serial network ordering: sequences were delivered 0..OPS in strict
    // order, which the write timestamps reflect.
    let (_, entries) = read_dump(&dump).unwrap();
    let mut writes: Vec<_> = entries
        .iter()
        .filter(|e| e.op_type == 2)
        .cloned()
        .collect();
    assert_eq!(writes.len(), OPS as usize);
    writes.sort_by_key(|e| e.op_number);
    for (i, e) in writes.iter().enumerate() {
        assert_eq!(e.op_number, i as i64);
        assert_eq!(e.byte_offset, i as i64 * BLOCK as i64);
        assert!(e.net_end >= e.net_start);
        assert!(e.net_xfer as usize == BLOCK);
    }
    for pair in writes.windows(2) {
        // Strictly increasing delivery: a later sequence starts its disk
        // write only after the earlier one began.
        assert!(pair[1].disk_start >= pair[0].disk_start);
    }
    // EOF markers: one per worker pair.
    let eofs = entries.iter().filter(|e| e.op_type == 4).count();
    assert_eq!(eofs, QD);
}
