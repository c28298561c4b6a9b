//! Read an iomark binary timestamp dump and render it as a table or as
//! JSON lines.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use iomark_engine::trace::{read_dump, TraceEntry, TraceHeader};

#[derive(Parser, Debug)]
#[command(name = "iomark-trace")]
#[command(version)]
#[command(about = "Render iomark timestamp dumps")]
struct Args {
    /// Binary dump file written with --ts dump=FILE
    file: PathBuf,

    /// Emit one JSON object per entry instead of the table
    #[arg(long)]
    json: bool,

    /// Show only the header
    #[arg(long)]
    header: bool,

    /// Sort entries by op number instead of table order
    #[arg(long)]
    sort: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let (header, mut entries) = read_dump(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    if args.sort {
        entries.sort_by_key(|e| e.op_number);
    }
    if args.json {
        print_json(&header, &entries, args.header)?;
    } else {
        print_table(&header, &entries, args.header);
    }
    Ok(())
}

fn print_json(header: &TraceHeader, entries: &[TraceEntry], header_only: bool) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(header)?);
    if header_only {
        return Ok(());
    }
    for e in entries {
        println!("{}", serde_json::to_string(e)?);
    }
    Ok(())
}

fn print_table(header: &TraceHeader, entries: &[TraceEntry], header_only: bool) {
    println!("version     {}", header.version);
    println!("target      {}", header.target_number);
    println!("reqsize     {} blocks", header.reqsize);
    println!("blocksize   {} bytes", header.blocksize);
    println!("entries     {}", header.numents);
    println!("options     0x{:04x}", header.options);
    println!("trigger op  {}", header.trigger_op);
    println!("overhead    {} ns/read", header.timer_overhead);
    println!("delta       {} ns", header.delta);
    println!("id          {}", header.id);
    println!("written     {}", header.ctime);
    if header_only {
        return;
    }
    println!(
        "{:>8} {:>6} {:>5} {:>6} {:>14} {:>12} {:>12} {:>12} {:>12}",
        "op", "pass", "wkr", "type", "offset", "disk_start", "disk_end", "net_start", "net_end"
    );
    for e in entries {
        println!(
            "{:>8} {:>6} {:>5} {:>6} {:>14} {:>12} {:>12} {:>12} {:>12}",
            e.op_number,
            e.pass_number,
            e.worker_id,
            e.op_str(),
            e.byte_offset,
            e.disk_start,
            e.disk_end,
            e.net_start,
            e.net_end
        );
    }
}
