//! Target configuration, storage backends, and shared per-target state.
//!
//! A target owns one offset table, one trace buffer, one counter block,
//! and `queue_depth` workers. Each worker opens its own descriptor on
//! the target so direct I/O and per-pass reopen work per thread.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::counters::Counters;
use crate::e2e::{E2eAddressTable, E2eSocketOptions, SequenceGate};
use crate::error::EngineError;
use crate::seek::SeekOptions;
use crate::task::OpType;
use crate::throttle::Throttle;
use crate::tot::TargetOffsetTable;
use crate::trace::{TraceBuffer, TraceConfig};
use crate::types::{OrderingMode, TargetRole};

/// Option flag set for one target.
#[derive(Debug, Clone, Default)]
pub struct TargetOptions {
    pub dio: bool,
    pub preallocate: bool,
    pub delete_on_finish: bool,
    pub verify: bool,
    pub recreate_per_pass: bool,
    pub reopen_per_pass: bool,
    pub stop_on_error: bool,
    pub storage_ordering: OrderingMode,
    pub network_ordering: OrderingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum E2eRole {
    Source,
    Destination,
}

#[derive(Debug, Clone)]
pub struct E2eConfig {
    pub role: E2eRole,
    pub table: E2eAddressTable,
    pub socket: E2eSocketOptions,
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub number: usize,
    pub role: TargetRole,
    pub uri: PathBuf,
    /// Bytes per block.
    pub block_size: usize,
    /// Blocks per request; one op moves `block_size * request_size` bytes.
    pub request_size: usize,
    pub num_reqs: u64,
    /// Byte extent of the target the pass runs over.
    pub length: u64,
    /// Byte offset added to every op.
    pub start_offset: i64,
    /// Additional byte offset per completed pass.
    pub pass_offset: i64,
    pub queue_depth: usize,
    pub retry_count: u32,
    /// Error budget; 0 means unlimited.
    pub max_errors: u64,
    pub seek: SeekOptions,
    pub throttle: Throttle,
    pub trace: TraceConfig,
    pub e2e: Option<E2eConfig>,
    pub options: TargetOptions,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            number: 0,
            role: TargetRole::Out,
            uri: PathBuf::new(),
            block_size: 1024,
            request_size: 128,
            num_reqs: 0,
            length: 0,
            start_offset: 0,
            pass_offset: 0,
            queue_depth: 1,
            retry_count: 0,
            max_errors: 0,
            seek: SeekOptions::default(),
            throttle: Throttle::None,
            trace: TraceConfig::default(),
            e2e: None,
            options: TargetOptions::default(),
        }
    }
}

impl TargetConfig {
    /// Bytes moved by one op.
    pub fn xfer_size(&self) -> usize {
        self.block_size * self.request_size
    }

    pub fn is_null(&self) -> bool {
        self.role == TargetRole::Null
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.block_size == 0 || self.request_size == 0 {
            return Err(EngineError::Config(format!(
                "target {}: block size and request size must be nonzero",
                self.number
            )));
        }
        if self.queue_depth == 0 {
            return Err(EngineError::Config(format!(
                "target {}: queue depth must be at least 1",
                self.number
            )));
        }
        if self.num_reqs == 0 {
            return Err(EngineError::Config(format!(
                "target {}: no operations requested",
                self.number
            )));
        }
        if !self.is_null() && self.uri.as_os_str().is_empty() {
            return Err(EngineError::Config(format!(
                "target {}: no uri given",
                self.number
            )));
        }
        if self.queue_depth > u8::MAX as usize {
            return Err(EngineError::Config(format!(
                "target {}: queue depth {} exceeds the per-target limit of {}",
                self.number,
                self.queue_depth,
                u8::MAX
            )));
        }
        Ok(())
    }
}

/// Storage side of an I/O issue. End-to-end roles wrap one of these with
/// a socket in the worker: a source reads here then sends, a sink
/// receives then writes here.
pub enum TargetBackend {
    File(FileBackend),
    Null,
}

pub struct FileBackend {
    file: File,
}

impl TargetBackend {
    pub fn open(cfg: &TargetConfig) -> Result<Self, EngineError> {
        if cfg.is_null() {
            return Ok(TargetBackend::Null);
        }
        let file = open_file(cfg, false)?;
        Ok(TargetBackend::File(FileBackend { file }))
    }

    /// Recreate the file from scratch (per-pass recreate).
    pub fn recreate(cfg: &TargetConfig) -> Result<Self, EngineError> {
        if cfg.is_null() {
            return Ok(TargetBackend::Null);
        }
        let file = open_file(cfg, true)?;
        Ok(TargetBackend::File(FileBackend { file }))
    }

    /// Issue one positioned transfer. Null targets fabricate success of
    /// the full size, as do noops.
    pub fn issue(&self, op: OpType, buf: &mut [u8], offset: i64) -> std::io::Result<usize> {
        match self {
            TargetBackend::Null => Ok(buf.len()),
            TargetBackend::File(f) => match op {
                OpType::Read => f.file.read_at(buf, offset as u64),
                OpType::Write => f.file.write_at(buf, offset as u64),
                OpType::Noop | OpType::Eof => Ok(buf.len()),
            },
        }
    }

    pub fn flush(&self) -> std::io::Result<()> {
        match self {
            TargetBackend::Null => Ok(()),
            TargetBackend::File(f) => f.file.sync_data(),
        }
    }
}

fn open_file(cfg: &TargetConfig, truncate: bool) -> Result<File, EngineError> {
    let mut opts = OpenOptions::new();
    opts.read(true);
    let writable = cfg.role == TargetRole::Out;
    if writable {
        opts.write(true).create(true);
        if truncate {
            opts.truncate(true);
        }
    }
    if cfg.options.dio {
        opts.custom_flags(libc::O_DIRECT);
    }
    let file = opts.open(&cfg.uri).map_err(|e| EngineError::TargetStart {
        target: cfg.number,
        reason: format!("open {}: {e}", cfg.uri.display()),
    })?;
    if writable && cfg.options.preallocate && cfg.length > 0 {
        let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, cfg.length as libc::off_t) };
        if rc != 0 {
            return Err(EngineError::TargetStart {
                target: cfg.number,
                reason: format!(
                    "preallocate {} bytes on {}: {}",
                    cfg.length,
                    cfg.uri.display(),
                    std::io::Error::from_raw_os_error(rc)
                ),
            });
        }
    }
    Ok(file)
}

/// Shared mutable state of a running target. One instance per target,
/// shared by its scheduler, its workers, and the plan coordinator.
#[derive(Debug)]
pub struct TargetState {
    pub cfg: TargetConfig,
    pub tot: TargetOffsetTable,
    pub trace: Option<TraceBuffer>,
    /// Snapshot lock: readers (results, heartbeat) take it briefly.
    pub counters: Mutex<Counters>,
    /// Plan-wide abort flag.
    pub abort: Arc<AtomicBool>,
    /// Set by the plan's runtime timer.
    pub run_time_expired: Arc<AtomicBool>,
    /// Set by a stop trigger from another target.
    pub stop_requested: AtomicBool,
    pub error_count: AtomicU64,
    /// At least one op failed past its retries.
    pub io_error_seen: AtomicBool,
    /// Serial network-ordering gate for destination workers.
    pub seq_gate: SequenceGate,
    pub eof_workers: AtomicUsize,
    pub failed_workers: AtomicUsize,
    pub current_pass: AtomicU32,
}

impl TargetState {
    pub fn new(
        cfg: TargetConfig,
        abort: Arc<AtomicBool>,
        run_time_expired: Arc<AtomicBool>,
    ) -> Self {
        let tot = TargetOffsetTable::new(cfg.queue_depth, cfg.num_reqs);
        let trace = if cfg.trace.enabled() {
            Some(TraceBuffer::new(&cfg.trace))
        } else {
            None
        };
        Self {
            cfg,
            tot,
            trace,
            counters: Mutex::new(Counters::default()),
            abort,
            run_time_expired,
            stop_requested: AtomicBool::new(false),
            error_count: AtomicU64::new(0),
            io_error_seen: AtomicBool::new(false),
            seq_gate: SequenceGate::new(),
            eof_workers: AtomicUsize::new(0),
            failed_workers: AtomicUsize::new(0),
            // Passes are 1-based; destination workers may record entries
            // before their scheduler stamps the first pass.
            current_pass: AtomicU32::new(1),
        }
    }

    /// True once the error budget is spent.
    pub fn errors_exhausted(&self) -> bool {
        let max = self.cfg.max_errors;
        max > 0 && self.error_count.load(Ordering::Relaxed) >= max
    }

    /// Scheduler stop check, polled between ops.
    pub fn should_stop(&self) -> bool {
        self.abort.load(Ordering::Acquire)
            || self.run_time_expired.load(Ordering::Acquire)
            || self.stop_requested.load(Ordering::Acquire)
            || self.errors_exhausted()
            || (self.cfg.options.stop_on_error && self.error_count.load(Ordering::Relaxed) > 0)
    }
}

/// Worker I/O buffer, aligned for direct I/O when requested.
pub struct IoBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer is owned by exactly one worker; the raw pointer never
// escapes the owning thread.
unsafe impl Send for IoBuffer {}

impl IoBuffer {
    pub fn new(len: usize, align: usize) -> Result<Self, EngineError> {
        let layout = Layout::from_size_align(len.max(1), align.max(1).next_power_of_two())
            .map_err(|e| EngineError::Config(format!("bad buffer layout: {e}")))?;
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| EngineError::Resource {
            what: format!("allocate {len}-byte worker buffer"),
            source: std::io::Error::from_raw_os_error(libc::ENOMEM),
        })?;
        Ok(Self { ptr, layout })
    }

    /// Page-aligned when direct I/O is on, word-aligned otherwise.
    pub fn for_target(cfg: &TargetConfig) -> Result<Self, EngineError> {
        let align = if cfg.options.dio { page_size() } else { 8 };
        Self::new(cfg.xfer_size(), align)
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

pub fn page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 {
        4096
    } else {
        n as usize
    }
}

/// Stamp each 8-byte lane with its own absolute byte offset, so a
/// read-back can verify both contents and location.
pub fn pattern_fill(buf: &mut [u8], byte_offset: i64) {
    for (i, chunk) in buf.chunks_mut(8).enumerate() {
        let v = (byte_offset as u64).wrapping_add((i * 8) as u64).to_le_bytes();
        let n = chunk.len();
        chunk.copy_from_slice(&v[..n]);
    }
}

/// Count of 8-byte lanes that do not match the fill pattern.
pub fn pattern_mismatches(buf: &[u8], byte_offset: i64) -> usize {
    buf.chunks(8)
        .enumerate()
        .filter(|&(i, chunk)| {
            let v = (byte_offset as u64)
                .wrapping_add((i * 8) as u64)
                .to_le_bytes();
            chunk != &v[..chunk.len()]
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xfer_size() {
        let cfg = TargetConfig {
            block_size: 1024,
            request_size: 4,
            ..Default::default()
        };
        assert_eq!(cfg.xfer_size(), 4096);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let cfg = TargetConfig {
            block_size: 0,
            num_reqs: 10,
            uri: "/tmp/x".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = TargetConfig {
            num_reqs: 0,
            uri: "/tmp/x".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_null_backend_fabricates_success() {
        let backend = TargetBackend::Null;
        let mut buf = vec![0u8; 4096];
        let n = backend.issue(OpType::Write, &mut buf, 0).unwrap();
        assert_eq!(n, 4096);
    }

    #[test]
    fn test_file_backend_positioned_io() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TargetConfig {
            role: TargetRole::Out,
            uri: dir.path().join("t0.dat"),
            block_size: 512,
            request_size: 2,
            num_reqs: 4,
            ..Default::default()
        };
        let backend = TargetBackend::open(&cfg).unwrap();
        let mut buf = vec![0u8; 1024];
        pattern_fill(&mut buf, 2048);
        let n = backend.issue(OpType::Write, &mut buf, 2048).unwrap();
        assert_eq!(n, 1024);
        backend.flush().unwrap();

        let mut read_back = vec![0u8; 1024];
        let n = backend.issue(OpType::Read, &mut read_back, 2048).unwrap();
        assert_eq!(n, 1024);
        assert_eq!(pattern_mismatches(&read_back, 2048), 0);
        // A deliberate offset mismatch is caught.
        assert!(pattern_mismatches(&read_back, 4096) > 0);
    }

    #[test]
    fn test_io_buffer_alignment() {
        let buf = IoBuffer::new(8192, page_size()).unwrap();
        assert_eq!(buf.as_slice().as_ptr() as usize % page_size(), 0);
        assert_eq!(buf.len(), 8192);
        // Freshly allocated buffers are zeroed.
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pattern_roundtrip() {
        let mut buf = vec![0u8; 4096];
        pattern_fill(&mut buf, 12288);
        assert_eq!(pattern_mismatches(&buf, 12288), 0);
        buf[100] ^= 0xFF;
        assert_eq!(pattern_mismatches(&buf, 12288), 1);
    }
}
