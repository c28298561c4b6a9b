//! Worker threads.
//!
//! A worker loops on its rendezvous gate: mark available, wait for a
//! task, run it. One I/O per task, offset-table slot held across the
//! transfer, counters folded into the target on completion, one trace
//! entry per op.
//!
//! End-to-end destinations run a different loop: instead of a gate they
//! consume framed blocks from their paired source worker's socket and
//! write each at the carried byte offset.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, error, info, warn};

use crate::counters::Counters;
use crate::e2e::{E2eHeader, E2eRecv, E2eReceiver, E2eSender, accept_with_abort, E2E_MAGIC};
use crate::nclk::nclk_now;
use crate::target::{
    pattern_fill, pattern_mismatches, IoBuffer, TargetBackend, TargetState,
};
use crate::task::{OpType, Task, TaskKind};
use crate::tot::TotWait;
use crate::trace::TraceEntry;
use crate::types::OrderingMode;
use crate::util::{lock, wait};

/// Per-worker rendezvous: the scheduler parks a task here and the worker
/// picks it up.
pub struct WorkerGate {
    slot: Mutex<Option<Task>>,
    cond: Condvar,
}

impl WorkerGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub fn hand(&self, task: Task) {
        let mut slot = lock(&self.slot);
        debug_assert!(slot.is_none(), "worker gate already holds a task");
        *slot = Some(task);
        self.cond.notify_one();
    }

    fn wait_task(&self) -> Task {
        let mut slot = lock(&self.slot);
        loop {
            if let Some(task) = slot.take() {
                return task;
            }
            slot = wait(&self.cond, slot);
        }
    }
}

/// Which workers have signalled idle. The scheduler always takes the
/// lowest-numbered available worker so pass traces are reproducible.
pub struct AvailabilitySet {
    ids: Mutex<BTreeSet<usize>>,
    cond: Condvar,
}

impl AvailabilitySet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ids: Mutex::new(BTreeSet::new()),
            cond: Condvar::new(),
        })
    }

    pub fn mark_available(&self, id: usize) {
        lock(&self.ids).insert(id);
        self.cond.notify_all();
    }

    /// Claim the lowest-numbered available worker, blocking if none.
    pub fn wait_lowest(&self) -> usize {
        let mut ids = lock(&self.ids);
        loop {
            if let Some(&id) = ids.iter().next() {
                ids.remove(&id);
                return id;
            }
            ids = wait(&self.cond, ids);
        }
    }

    /// Claim a specific worker, blocking until it is idle.
    pub fn take(&self, id: usize) {
        let mut ids = lock(&self.ids);
        while !ids.remove(&id) {
            ids = wait(&self.cond, ids);
        }
    }

    /// Block until `n` workers are idle at once (end-of-pass detection).
    pub fn wait_all(&self, n: usize) {
        let mut ids = lock(&self.ids);
        while ids.len() < n {
            ids = wait(&self.cond, ids);
        }
    }

    pub fn count(&self) -> usize {
        lock(&self.ids).len()
    }
}

/// Everything a worker thread needs.
pub struct WorkerContext {
    pub id: usize,
    pub state: Arc<TargetState>,
    pub gate: Arc<WorkerGate>,
    pub avail: Arc<AvailabilitySet>,
    /// This worker's private counter block; the scheduler reads it at
    /// pass end for the per-worker report.
    pub counters: Arc<Mutex<Counters>>,
    pub tot_wait: Arc<TotWait>,
}

fn thread_id() -> i32 {
    unsafe { libc::gettid() }
}

/// Task-driven worker loop, used by storage targets, null targets, and
/// end-to-end sources.
pub fn run_worker(
    ctx: WorkerContext,
    mut backend: TargetBackend,
    mut sender: Option<E2eSender>,
    mut buf: IoBuffer,
) {
    let tid = thread_id();
    debug!(
        "target {} worker {}: up (tid {tid})",
        ctx.state.cfg.number, ctx.id
    );
    loop {
        ctx.avail.mark_available(ctx.id);
        let mut task = ctx.gate.wait_task();
        match task.kind {
            TaskKind::Stop => break,
            TaskKind::Reopen => {
                match TargetBackend::open(&ctx.state.cfg) {
                    Ok(b) => backend = b,
                    Err(e) => {
                        warn!(
                            "target {} worker {}: reopen failed: {e}",
                            ctx.state.cfg.number, ctx.id
                        );
                        ctx.state.failed_workers.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            TaskKind::Eof => {
                if let Some(s) = sender.as_mut() {
                    let net_start = nclk_now();
                    if let Err(e) = s.send_eof(task.e2e_sequence) {
                        warn!(
                            "target {} worker {}: eof send failed: {e}",
                            ctx.state.cfg.number, ctx.id
                        );
                    }
                    let net_end = nclk_now();
                    if let Some(trace) = &ctx.state.trace {
                        trace.record(TraceEntry {
                            op_type: TraceEntry::op_code(OpType::Eof),
                            worker_id: ctx.id as u8,
                            pass_number: ctx.state.current_pass.load(Ordering::Relaxed) as u16,
                            thread_id: tid,
                            op_number: task.e2e_sequence,
                            net_start,
                            net_end,
                            ..TraceEntry::default()
                        });
                    }
                }
            }
            TaskKind::Io => run_io(&ctx, &mut backend, sender.as_mut(), &mut buf, &mut task, tid),
        }
    }
    if let Err(e) = backend.flush() {
        warn!(
            "target {} worker {}: flush on stop failed: {e}",
            ctx.state.cfg.number, ctx.id
        );
    }
    debug!("target {} worker {}: down", ctx.state.cfg.number, ctx.id);
}

fn run_io(
    ctx: &WorkerContext,
    backend: &mut TargetBackend,
    sender: Option<&mut E2eSender>,
    buf: &mut IoBuffer,
    task: &mut Task,
    tid: i32,
) {
    let st = &ctx.state;
    let cfg = &st.cfg;
    let ordering = cfg.options.storage_ordering;
    let size = task.xfer_size.min(buf.len());

    st.tot
        .acquire(task.op_number, ctx.id as i32, &ctx.tot_wait, ordering);

    if task.op_type == OpType::Write {
        pattern_fill(&mut buf.as_mut_slice()[..size], task.byte_offset);
    }
    let disk_start = nclk_now();
    let result = issue_with_retry(backend, task, &mut buf.as_mut_slice()[..size], cfg.retry_count);
    let disk_end = nclk_now();

    // Source side of an end-to-end pair: forward what was just read.
    let mut net_start = 0;
    let mut net_end = 0;
    let mut net_xfer = 0i32;
    if let Some(s) = sender {
        if let Ok(n) = &result {
            net_start = nclk_now();
            let header = E2eHeader {
                magic: E2E_MAGIC,
                sender_worker_id: ctx.id as i32,
                sequence: task.e2e_sequence,
                send_time: net_start,
                recv_time: 0,
                location: task.byte_offset,
                length: *n as i64,
            };
            match s.send(&header, &buf.as_slice()[..*n]) {
                Ok(()) => net_xfer = *n as i32,
                Err(e) => {
                    st.failed_workers.fetch_add(1, Ordering::Relaxed);
                    st.error_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "target {} worker {} op {}: e2e send failed: {e}",
                        cfg.number, ctx.id, task.op_number
                    );
                }
            }
            net_end = nclk_now();
        }
    }

    st.tot
        .release(task.op_number, ctx.id as i32, task.byte_offset, size as i32);

    let mut op_errors = 0u64;
    match &result {
        Ok(n) => {
            task.io_status = *n as i64;
            if task.verify && task.op_type == OpType::Read && !cfg.is_null() {
                let mismatches = pattern_mismatches(&buf.as_slice()[..*n], task.byte_offset);
                if mismatches > 0 {
                    op_errors += 1;
                    warn!(
                        "target {} worker {} op {} offset {}: verify failed, {mismatches} lanes differ",
                        cfg.number, ctx.id, task.op_number, task.byte_offset
                    );
                }
            }
        }
        Err(e) => {
            task.io_status = -1;
            task.io_errno = e.raw_os_error().unwrap_or(0);
            op_errors += 1;
            st.io_error_seen.store(true, Ordering::Release);
            error!(
                "target {} worker {} op {} offset {}: requested {} bytes, transferred {}: {e}",
                cfg.number, ctx.id, task.op_number, task.byte_offset, size, task.io_status
            );
        }
    }
    if op_errors > 0 {
        st.error_count.fetch_add(op_errors, Ordering::Relaxed);
    }

    let elapsed = disk_end.saturating_sub(disk_start);
    let bytes = result.as_ref().map(|&n| n as u64).unwrap_or(0);
    {
        let mut wc = lock(&ctx.counters);
        wc.record_op(task.op_type, bytes, elapsed, disk_start);
        wc.error_count += op_errors;
    }
    {
        let mut tc = lock(&st.counters);
        tc.record_op(task.op_type, bytes, elapsed, disk_start);
        tc.error_count += op_errors;
    }

    if let Some(trace) = &st.trace {
        trace.record(TraceEntry {
            op_type: TraceEntry::op_code(task.op_type),
            worker_id: ctx.id as u8,
            pass_number: st.current_pass.load(Ordering::Relaxed) as u16,
            thread_id: tid,
            disk_xfer: bytes as i32,
            net_xfer,
            op_number: task.op_number,
            byte_offset: task.byte_offset,
            disk_start,
            disk_end,
            net_start,
            net_end,
        });
    }
}

/// One positioned transfer, retried on short returns and transient
/// errors. Exhausting the retries produces the error the caller reports.
fn issue_with_retry(
    backend: &TargetBackend,
    task: &Task,
    buf: &mut [u8],
    retries: u32,
) -> std::io::Result<usize> {
    let want = buf.len();
    let mut last: std::io::Result<usize> = Ok(0);
    for attempt in 0..=retries {
        match backend.issue(task.op_type, buf, task.byte_offset) {
            Ok(n) if n == want => return Ok(n),
            Ok(n) => {
                if attempt < retries {
                    warn!(
                        "op {} offset {}: short transfer {n}/{want}, retry {}/{retries}",
                        task.op_number,
                        task.byte_offset,
                        attempt + 1
                    );
                }
                last = Ok(n);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                last = Err(e);
            }
            Err(e) => {
                if attempt < retries {
                    warn!(
                        "op {} offset {}: {e}, retry {}/{retries}",
                        task.op_number,
                        task.byte_offset,
                        attempt + 1
                    );
                }
                last = Err(e);
            }
        }
    }
    match last {
        Ok(n) => Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("short transfer: {n} of {want} bytes"),
        )),
        Err(e) => Err(e),
    }
}

/// Destination-side worker loop for an end-to-end pair. Accepts one
/// connection, then writes every received block at its carried offset
/// until EOF, a connection failure, or abort.
pub fn run_worker_destination(
    ctx: WorkerContext,
    backend: TargetBackend,
    listener: TcpListener,
    mut buf: IoBuffer,
) {
    let tid = thread_id();
    let st = Arc::clone(&ctx.state);
    let cfg = &st.cfg;
    let socket_opts = cfg
        .e2e
        .as_ref()
        .map(|e| e.socket.clone())
        .unwrap_or_default();

    let stream = match accept_with_abort(&listener, || st.should_stop()) {
        Ok(Some(stream)) => stream,
        Ok(None) => {
            // Aborted while waiting for the peer.
            ctx.avail.mark_available(ctx.id);
            return;
        }
        Err(e) => {
            warn!("target {} worker {}: {e}", cfg.number, ctx.id);
            st.failed_workers.fetch_add(1, Ordering::Relaxed);
            ctx.avail.mark_available(ctx.id);
            return;
        }
    };
    let mut receiver = match E2eReceiver::new(stream, &socket_opts) {
        Ok(r) => r,
        Err(e) => {
            warn!("target {} worker {}: {e}", cfg.number, ctx.id);
            st.failed_workers.fetch_add(1, Ordering::Relaxed);
            ctx.avail.mark_available(ctx.id);
            return;
        }
    };
    info!(
        "target {} worker {}: peer connected",
        cfg.number, ctx.id
    );

    loop {
        if st.abort.load(Ordering::Acquire) {
            break;
        }
        match receiver.recv(buf.as_mut_slice()) {
            Ok(E2eRecv::Eof(header)) => {
                st.eof_workers.fetch_add(1, Ordering::Relaxed);
                if let Some(trace) = &st.trace {
                    trace.record(TraceEntry {
                        op_type: TraceEntry::op_code(OpType::Eof),
                        worker_id: ctx.id as u8,
                        pass_number: st.current_pass.load(Ordering::Relaxed) as u16,
                        thread_id: tid,
                        op_number: header.sequence,
                        net_start: header.send_time,
                        net_end: header.recv_time,
                        ..TraceEntry::default()
                    });
                }
                debug!(
                    "target {} worker {}: end of stream at sequence {}",
                    cfg.number, ctx.id, header.sequence
                );
                break;
            }
            Ok(E2eRecv::Block(header)) => {
                let len = header.length as usize;
                if cfg.options.network_ordering == OrderingMode::Serial
                    && !st.seq_gate.await_turn(header.sequence, &st.abort)
                {
                    break;
                }
                let mut task = Task::io(OpType::Write, header.location, len, header.sequence);
                st.tot.acquire(
                    header.sequence,
                    ctx.id as i32,
                    &ctx.tot_wait,
                    cfg.options.storage_ordering,
                );
                let disk_start = nclk_now();
                let result = issue_with_retry(
                    &backend,
                    &task,
                    &mut buf.as_mut_slice()[..len],
                    cfg.retry_count,
                );
                let disk_end = nclk_now();
                st.tot
                    .release(header.sequence, ctx.id as i32, header.location, len as i32);
                if cfg.options.network_ordering == OrderingMode::Serial {
                    st.seq_gate.advance(header.sequence);
                }

                let mut op_errors = 0u64;
                match &result {
                    Ok(n) => task.io_status = *n as i64,
                    Err(e) => {
                        task.io_status = -1;
                        op_errors += 1;
                        st.io_error_seen.store(true, Ordering::Release);
                        error!(
                            "target {} worker {} op {} offset {}: requested {len} bytes, transferred -1: {e}",
                            cfg.number, ctx.id, header.sequence, header.location
                        );
                    }
                }
                if op_errors > 0 {
                    st.error_count.fetch_add(op_errors, Ordering::Relaxed);
                }

                let elapsed = disk_end.saturating_sub(disk_start);
                let bytes = result.as_ref().map(|&n| n as u64).unwrap_or(0);
                {
                    let mut wc = lock(&ctx.counters);
                    wc.record_op(OpType::Write, bytes, elapsed, disk_start);
                    wc.error_count += op_errors;
                }
                {
                    let mut tc = lock(&st.counters);
                    tc.record_op(OpType::Write, bytes, elapsed, disk_start);
                    tc.error_count += op_errors;
                }
                if let Some(trace) = &st.trace {
                    trace.record(TraceEntry {
                        op_type: TraceEntry::op_code(OpType::Write),
                        worker_id: ctx.id as u8,
                        pass_number: st.current_pass.load(Ordering::Relaxed) as u16,
                        thread_id: tid,
                        disk_xfer: bytes as i32,
                        net_xfer: len as i32,
                        op_number: header.sequence,
                        byte_offset: header.location,
                        disk_start,
                        disk_end,
                        net_start: header.send_time,
                        net_end: header.recv_time,
                    });
                }
                // Error budget or stop-on-error: stop consuming, and
                // free any peer parked on a sequence this stream still
                // holds.
                if st.errors_exhausted()
                    || (cfg.options.stop_on_error && st.error_count.load(Ordering::Relaxed) > 0)
                {
                    st.failed_workers.fetch_add(1, Ordering::Relaxed);
                    st.seq_gate.poison();
                    break;
                }
            }
            Err(e) => {
                warn!(
                    "target {} worker {}: receive failed: {e}",
                    cfg.number, ctx.id
                );
                st.failed_workers.fetch_add(1, Ordering::Relaxed);
                st.error_count.fetch_add(1, Ordering::Relaxed);
                st.seq_gate.poison();
                break;
            }
        }
    }
    if let Err(e) = backend.flush() {
        warn!(
            "target {} worker {}: flush failed: {e}",
            cfg.number, ctx.id
        );
    }
    ctx.avail.mark_available(ctx.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_gate_hands_one_task() {
        let gate = WorkerGate::new();
        let g = Arc::clone(&gate);
        let h = thread::spawn(move || g.wait_task());
        thread::sleep(Duration::from_millis(20));
        gate.hand(Task::io(OpType::Read, 4096, 1024, 7));
        let task = h.join().unwrap();
        assert_eq!(task.op_number, 7);
        assert_eq!(task.byte_offset, 4096);
    }

    #[test]
    fn test_availability_prefers_lowest() {
        let avail = AvailabilitySet::new();
        avail.mark_available(2);
        avail.mark_available(0);
        avail.mark_available(1);
        assert_eq!(avail.wait_lowest(), 0);
        assert_eq!(avail.wait_lowest(), 1);
        assert_eq!(avail.wait_lowest(), 2);
    }

    #[test]
    fn test_availability_take_blocks_for_specific_id() {
        let avail = AvailabilitySet::new();
        avail.mark_available(1);
        let a = Arc::clone(&avail);
        let h = thread::spawn(move || {
            a.take(0);
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!h.is_finished());
        avail.mark_available(0);
        h.join().unwrap();
        // Worker 1 is still available.
        assert_eq!(avail.count(), 1);
    }

    #[test]
    fn test_null_issue_fabricates_full_transfer() {
        let backend = TargetBackend::Null;
        let task = Task::io(OpType::Read, 0, 16, 0);
        let mut buf = vec![0u8; 16];
        let n = issue_with_retry(&backend, &task, &mut buf, 2).unwrap();
        assert_eq!(n, 16);
    }
}
