//! Per-operation timestamp trace.
//!
//! A fixed-capacity table of 64-byte entries with an atomic write index.
//! Workers claim an index with `fetch_add` and write their own slot, so
//! the hot path takes no lock. Entries are not index-ordered under
//! concurrent writers; each entry carries its op number for reordering.
//!
//! The binary dump is a little-endian header (magic `0xDEADBEEF`)
//! followed by the packed entry array. `iomark-trace` and the tests read
//! dumps back through [`read_dump`].

use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;

use crate::nclk::{nclk_overhead, Nclk};
use crate::task::OpType;

/// Trace option bits.
pub mod ts_opts {
    pub const NORMALIZE: u64 = 0x0001;
    pub const ON: u64 = 0x0002;
    pub const SUMMARY: u64 = 0x0004;
    pub const DETAILED: u64 = 0x0008;
    pub const APPEND: u64 = 0x0010;
    pub const DUMP: u64 = 0x0020;
    pub const WRAP: u64 = 0x0040;
    pub const ONESHOT: u64 = 0x0080;
    pub const STOP: u64 = 0x0100;
    pub const TRIGTIME: u64 = 0x0400;
    pub const TRIGOP: u64 = 0x0800;
    pub const TRIGGERED: u64 = 0x1000;
    pub const SUPPRESS: u64 = 0x2000;
}

pub const TS_MAGIC: u32 = 0xDEAD_BEEF;
pub const TS_VERSION: &str = "iomark-ts-1";

pub const TRACE_ENTRY_BYTES: usize = 64;
const VERSION_FIELD: usize = 64;
const ID_FIELD: usize = 256;
const CTIME_FIELD: usize = 32;
/// Fixed header size: fields plus the three padded strings.
pub const TRACE_HEADER_BYTES: usize = 4 + VERSION_FIELD + 4 + 4 + 4 + 8 * 6 + ID_FIELD + CTIME_FIELD;

/// One traced operation. Exactly 64 bytes, `#[repr(C)]`, written to the
/// dump verbatim in little-endian field order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TraceEntry {
    pub op_type: u8,
    pub worker_id: u8,
    pub pass_number: u16,
    pub thread_id: i32,
    pub disk_xfer: i32,
    pub net_xfer: i32,
    pub op_number: i64,
    pub byte_offset: i64,
    pub disk_start: u64,
    pub disk_end: u64,
    pub net_start: u64,
    pub net_end: u64,
}

impl TraceEntry {
    pub fn op_code(op: OpType) -> u8 {
        match op {
            OpType::Noop => 0,
            OpType::Read => 1,
            OpType::Write => 2,
            OpType::Eof => 4,
        }
    }

    pub fn op_str(&self) -> &'static str {
        match self.op_type {
            0 => "noop",
            1 => "read",
            2 => "write",
            4 => "eof",
            _ => "?",
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.op_type);
        buf.put_u8(self.worker_id);
        buf.put_u16_le(self.pass_number);
        buf.put_i32_le(self.thread_id);
        buf.put_i32_le(self.disk_xfer);
        buf.put_i32_le(self.net_xfer);
        buf.put_i64_le(self.op_number);
        buf.put_i64_le(self.byte_offset);
        buf.put_u64_le(self.disk_start);
        buf.put_u64_le(self.disk_end);
        buf.put_u64_le(self.net_start);
        buf.put_u64_le(self.net_end);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Self {
            op_type: buf.get_u8(),
            worker_id: buf.get_u8(),
            pass_number: buf.get_u16_le(),
            thread_id: buf.get_i32_le(),
            disk_xfer: buf.get_i32_le(),
            net_xfer: buf.get_i32_le(),
            op_number: buf.get_i64_le(),
            byte_offset: buf.get_i64_le(),
            disk_start: buf.get_u64_le(),
            disk_end: buf.get_u64_le(),
            net_start: buf.get_u64_le(),
            net_end: buf.get_u64_le(),
        }
    }
}

/// Dump file header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceHeader {
    pub magic: u32,
    pub version: String,
    pub target_number: i32,
    pub reqsize: i32,
    pub blocksize: i32,
    pub numents: i64,
    pub trigger_op: i64,
    pub trigger_time: u64,
    pub options: u64,
    pub timer_overhead: u64,
    pub delta: u64,
    pub id: String,
    pub ctime: String,
}

/// Static configuration for a target's trace.
#[derive(Debug, Clone, Default)]
pub struct TraceConfig {
    pub options: u64,
    pub size: usize,
    pub trigger_op: i64,
    pub trigger_time: Nclk,
    pub binary_path: Option<PathBuf>,
}

impl TraceConfig {
    pub fn enabled(&self) -> bool {
        self.options & (ts_opts::ON | ts_opts::TRIGOP | ts_opts::TRIGTIME) != 0
    }
}

// Each index is claimed exactly once via fetch_add, so writers never
// alias a slot. Under WRAP two writers could only collide if `size` ops
// were in flight at once, and in-flight ops are bounded by queue depth,
// far below any sane table size.
struct Cell(UnsafeCell<TraceEntry>);
unsafe impl Sync for Cell {}

pub struct TraceBuffer {
    options: AtomicU64,
    size: usize,
    index: AtomicU64,
    trigger_op: i64,
    trigger_time: Nclk,
    entries: Box<[Cell]>,
    binary_path: Option<PathBuf>,
}

impl std::fmt::Debug for TraceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceBuffer")
            .field("options", &self.options)
            .field("size", &self.size)
            .field("index", &self.index)
            .field("trigger_op", &self.trigger_op)
            .field("trigger_time", &self.trigger_time)
            .field("binary_path", &self.binary_path)
            .finish_non_exhaustive()
    }
}

impl TraceBuffer {
    pub fn new(cfg: &TraceConfig) -> Self {
        let size = cfg.size.max(1);
        let entries = (0..size)
            .map(|_| Cell(UnsafeCell::new(TraceEntry::default())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            options: AtomicU64::new(cfg.options),
            size,
            index: AtomicU64::new(0),
            trigger_op: cfg.trigger_op,
            trigger_time: cfg.trigger_time,
            entries,
            binary_path: cfg.binary_path.clone(),
        }
    }

    pub fn options(&self) -> u64 {
        self.options.load(Ordering::Acquire)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn binary_path(&self) -> Option<&Path> {
        self.binary_path.as_deref()
    }

    /// Entries currently holding valid data.
    pub fn count(&self) -> usize {
        (self.index.load(Ordering::Acquire) as usize).min(self.size)
    }

    /// Record one operation. Lock-free; drops the entry when tracing is
    /// off, not yet triggered, or the table is exhausted in one-shot mode.
    pub fn record(&self, entry: TraceEntry) {
        let mut opts = self.options.load(Ordering::Acquire);
        if opts & ts_opts::TRIGOP != 0 && opts & ts_opts::TRIGGERED == 0 {
            if entry.op_number >= self.trigger_op {
                self.options.fetch_or(ts_opts::TRIGGERED, Ordering::AcqRel);
                opts |= ts_opts::TRIGGERED;
            }
        }
        if opts & ts_opts::TRIGTIME != 0 && opts & ts_opts::TRIGGERED == 0 {
            if entry.disk_start >= self.trigger_time {
                self.options.fetch_or(ts_opts::TRIGGERED, Ordering::AcqRel);
                opts |= ts_opts::TRIGGERED;
            }
        }
        if opts & (ts_opts::ON | ts_opts::TRIGGERED) == 0 || opts & ts_opts::STOP != 0 {
            return;
        }
        let idx = self.index.fetch_add(1, Ordering::AcqRel);
        let slot = if (idx as usize) < self.size {
            idx as usize
        } else if opts & ts_opts::WRAP != 0 {
            (idx % self.size as u64) as usize
        } else {
            // One-shot (and the plain full case): drop and auto-disable.
            self.options.fetch_or(ts_opts::STOP, Ordering::AcqRel);
            return;
        };
        unsafe {
            *self.entries[slot].0.get() = entry;
        }
    }

    /// Copy out the valid entries in table order.
    pub fn entries(&self) -> Vec<TraceEntry> {
        let n = self.count();
        (0..n)
            .map(|i| unsafe { *self.entries[i].0.get() })
            .collect()
    }

    /// Write the binary dump for this buffer. `normalize` subtracts the
    /// smallest nonzero timestamp from every entry and records it as the
    /// header delta.
    pub fn write_dump(&self, meta: &DumpMeta) -> std::io::Result<()> {
        let path = match &self.binary_path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let opts = self.options();
        if opts & ts_opts::SUPPRESS != 0 {
            return Ok(());
        }
        let mut entries = self.entries();
        let delta = if opts & ts_opts::NORMALIZE != 0 {
            let delta = entries
                .iter()
                .map(|e| e.disk_start)
                .filter(|&t| t != 0)
                .min()
                .unwrap_or(0);
            for e in &mut entries {
                for ts in [
                    &mut e.disk_start,
                    &mut e.disk_end,
                    &mut e.net_start,
                    &mut e.net_end,
                ] {
                    if *ts != 0 {
                        *ts -= delta;
                    }
                }
            }
            delta
        } else {
            0
        };

        let header = TraceHeader {
            magic: TS_MAGIC,
            version: TS_VERSION.to_string(),
            target_number: meta.target_number,
            reqsize: meta.reqsize,
            blocksize: meta.blocksize,
            numents: entries.len() as i64,
            trigger_op: self.trigger_op,
            trigger_time: self.trigger_time,
            options: opts,
            timer_overhead: nclk_overhead(),
            delta,
            id: meta.id.clone(),
            ctime: chrono::Local::now().format("%a %b %e %T %Y").to_string(),
        };

        let mut buf = BytesMut::with_capacity(TRACE_HEADER_BYTES + entries.len() * TRACE_ENTRY_BYTES);
        encode_header(&header, &mut buf);
        for e in &entries {
            e.encode(&mut buf);
        }

        let mut file = if opts & ts_opts::APPEND != 0 {
            OpenOptions::new().create(true).append(true).open(&path)?
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)?
        };
        file.write_all(&buf)
    }
}

/// Identity fields the plan supplies for dump headers.
#[derive(Debug, Clone, Default)]
pub struct DumpMeta {
    pub target_number: i32,
    pub reqsize: i32,
    pub blocksize: i32,
    pub id: String,
}

/// Hostname-and-program identity string for dump headers.
pub fn run_identity() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("iomark {} on {host}", env!("CARGO_PKG_VERSION"))
}

fn put_padded(buf: &mut BytesMut, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width - 1);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, width - n);
}

fn get_padded(buf: &mut impl Buf, width: usize) -> String {
    let mut raw = vec![0u8; width];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn encode_header(h: &TraceHeader, buf: &mut BytesMut) {
    buf.put_u32_le(h.magic);
    put_padded(buf, &h.version, VERSION_FIELD);
    buf.put_i32_le(h.target_number);
    buf.put_i32_le(h.reqsize);
    buf.put_i32_le(h.blocksize);
    buf.put_i64_le(h.numents);
    buf.put_i64_le(h.trigger_op);
    buf.put_u64_le(h.trigger_time);
    buf.put_u64_le(h.options);
    buf.put_u64_le(h.timer_overhead);
    buf.put_u64_le(h.delta);
    put_padded(buf, &h.id, ID_FIELD);
    put_padded(buf, &h.ctime, CTIME_FIELD);
}

/// Read a binary dump back. Fails on a bad magic, reporting a
/// byte-swapped magic as a foreign-endian file.
pub fn read_dump(path: &Path) -> std::io::Result<(TraceHeader, Vec<TraceEntry>)> {
    let mut raw = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut raw)?;
    if raw.len() < TRACE_HEADER_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("dump too short: {} bytes", raw.len()),
        ));
    }
    let mut buf = &raw[..];
    let magic = buf.get_u32_le();
    if magic != TS_MAGIC {
        let kind = if magic == TS_MAGIC.swap_bytes() {
            "foreign-endian dump"
        } else {
            "bad magic"
        };
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{kind}: 0x{magic:08X}"),
        ));
    }
    let header = TraceHeader {
        magic,
        version: get_padded(&mut buf, VERSION_FIELD),
        target_number: buf.get_i32_le(),
        reqsize: buf.get_i32_le(),
        blocksize: buf.get_i32_le(),
        numents: buf.get_i64_le(),
        trigger_op: buf.get_i64_le(),
        trigger_time: buf.get_u64_le(),
        options: buf.get_u64_le(),
        timer_overhead: buf.get_u64_le(),
        delta: buf.get_u64_le(),
        id: get_padded(&mut buf, ID_FIELD),
        ctime: get_padded(&mut buf, CTIME_FIELD),
    };
    let want = header.numents as usize;
    if buf.remaining() < want * TRACE_ENTRY_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "dump truncated: header claims {want} entries, {} bytes remain",
                buf.remaining()
            ),
        ));
    }
    let entries = (0..want).map(|_| TraceEntry::decode(&mut buf)).collect();
    Ok((header, entries))
}
