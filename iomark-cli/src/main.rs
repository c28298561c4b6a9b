//! iomark: drive one or more targets through passes of read, write, or
//! end-to-end copy operations and report throughput.
//!
//! Exit codes: 0 success, 1 init failure, 2 invalid argument, 3 invalid
//! option, 4 target start failure, 5 cancelled, 6 I/O error. The most
//! severe condition observed wins.

mod args;
mod config;

use std::sync::atomic::Ordering;

use clap::error::ErrorKind;
use clap::Parser;
use log::{info, warn};

use iomark_engine::error::exit_code;
use iomark_engine::plan::{Plan, RunResults};

use crate::args::Args;
use crate::config::Config;

fn main() {
    env_logger::init();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_code::SUCCESS,
                ErrorKind::InvalidValue | ErrorKind::ValueValidation => exit_code::INVALID_OPTION,
                _ => exit_code::INVALID_ARGUMENT,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    std::process::exit(run(args));
}

fn run(args: Args) -> i32 {
    let defaults = Config::load();
    let (plan_attr, target_attrs) = match args.into_plan(&defaults) {
        Ok(built) => built,
        Err(e) => {
            eprintln!("iomark: {e}");
            return e.severity();
        }
    };

    let mut plan = match Plan::new(plan_attr, target_attrs) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("iomark: {e}");
            return e.severity();
        }
    };

    let abort = plan.abort_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("iomark: interrupt, draining");
        abort.store(true, Ordering::SeqCst);
    }) {
        warn!("could not install interrupt handler: {e}");
    }

    match plan.run() {
        Ok(results) => {
            report(&results);
            results.exit_code
        }
        Err(e) => {
            eprintln!("iomark: {e}");
            e.severity()
        }
    }
}

fn report(results: &RunResults) {
    for t in &results.targets {
        let c = &t.counters;
        let elapsed_s = c.elapsed_time as f64 / 1e9;
        println!(
            "target {}: {} ops ({} read, {} write, {} noop), {} bytes, \
             {:.3} s, {:.2} MB/s, avg op {} us, errors {}",
            t.target,
            c.op_count,
            c.read_op_count,
            c.write_op_count,
            c.noop_op_count,
            c.bytes_xfered,
            elapsed_s,
            c.throughput_mbps(),
            c.avg_op_time() / 1_000,
            t.error_count,
        );
        for (id, w) in t.worker_counters.iter().enumerate() {
            info!(
                "target {} worker {id}: {} ops, {} bytes, avg op {} us",
                t.target,
                w.op_count,
                w.bytes_xfered,
                w.avg_op_time() / 1_000
            );
        }
        if t.tot_collisions > 0 {
            warn!(
                "target {}: {} offset-table collisions (dispatch anomaly)",
                t.target, t.tot_collisions
            );
        }
    }
    if results.cancelled {
        eprintln!("iomark: run cancelled");
    }
}
