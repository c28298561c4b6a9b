//! Per-target pass driver.
//!
//! One scheduler thread per target. It spawns the target's workers,
//! then for each pass pulls seek entries in order, applies the throttle
//! and any lockstep gate, hands each op to the lowest-numbered available
//! worker, and fires start/stop triggers at interval crossings. A pass
//! ends when every entry has been dispatched and all workers are idle
//! again; a stop condition (abort, runtime expiry, error budget, stop
//! trigger) drains instead.

use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::barrier::{Barrier, BarrierWait, Occupant, OccupantKind};
use crate::counters::Counters;
use crate::e2e::{bind_for_worker, E2eSender};
use crate::error::EngineError;
use crate::lockstep::{IntervalTracker, LockstepMaster, LockstepSlave, LsInterval};
use crate::nclk::{nclk_now, Nclk};
use crate::seek::{self, SeekEntry, SeekOp};
use crate::target::{E2eRole, IoBuffer, TargetBackend, TargetState};
use crate::task::{OpType, Task};
use crate::tot::TotWait;
use crate::trace::DumpMeta;
use crate::util::lock;
use crate::worker::{
    run_worker, run_worker_destination, AvailabilitySet, WorkerContext, WorkerGate,
};

/// When a trigger fires, measured against this target's own progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerPoint {
    Op(u64),
    Bytes(u64),
    Percent(f64),
    Time(Nclk),
}

impl TriggerPoint {
    fn crossed(&self, ops: u64, bytes: u64, elapsed: Nclk, num_ops: u64) -> bool {
        match *self {
            TriggerPoint::Op(n) => ops >= n,
            TriggerPoint::Bytes(b) => bytes >= b,
            TriggerPoint::Time(t) => elapsed >= t,
            TriggerPoint::Percent(p) => num_ops > 0 && ops as f64 * 100.0 >= p * num_ops as f64,
        }
    }
}

/// This target's end of a lockstep pair.
#[derive(Debug)]
pub enum LockstepEndpoint {
    Master {
        link: LockstepMaster,
        interval: LsInterval,
    },
    Slave {
        link: LockstepSlave,
        interval: LsInterval,
    },
}

/// Everything the scheduler thread needs beyond the target state.
#[derive(Debug)]
pub struct SchedulerConfig {
    pub state: Arc<TargetState>,
    pub passes: u32,
    pub pass_delay: Duration,
    pub pre_pass: Arc<Barrier>,
    pub post_pass: Arc<Barrier>,
    pub lockstep: Option<LockstepEndpoint>,
    /// Barrier this target waits on before its first dispatch.
    pub start_gate: Option<Arc<Barrier>>,
    /// Single-shot signal released toward another target.
    pub start_trigger: Option<(TriggerPoint, Arc<Barrier>)>,
    /// Single-shot stop request aimed at another target.
    pub stop_trigger: Option<(TriggerPoint, Arc<TargetState>)>,
}

/// What one target reports back to the plan.
pub struct TargetSummary {
    pub target: usize,
    pub counters: Counters,
    pub worker_counters: Vec<Counters>,
    pub error_count: u64,
    pub io_error_seen: bool,
    pub dispatched_ops: u64,
    pub tot_collisions: u64,
}

struct WorkerHandle {
    gate: Arc<WorkerGate>,
    counters: Arc<Mutex<Counters>>,
    join: JoinHandle<()>,
}

/// Spawn the scheduler thread for one target. The first message on
/// `ready_tx` reports whether worker bring-up succeeded.
pub fn spawn_target_scheduler(
    cfg: SchedulerConfig,
    ready_tx: Sender<Result<usize, EngineError>>,
) -> std::io::Result<JoinHandle<TargetSummary>> {
    let name = format!("sched-t{}", cfg.state.cfg.number);
    thread::Builder::new()
        .name(name)
        .spawn(move || run_target_scheduler(cfg, ready_tx))
}

fn run_target_scheduler(
    mut cfg: SchedulerConfig,
    ready_tx: Sender<Result<usize, EngineError>>,
) -> TargetSummary {
    let state = Arc::clone(&cfg.state);
    let target = state.cfg.number;
    let avail = AvailabilitySet::new();

    let is_destination = matches!(
        state.cfg.e2e.as_ref().map(|e| e.role),
        Some(E2eRole::Destination)
    );

    let seeks = if is_destination {
        Vec::new()
    } else {
        match build_seek_list(&state) {
            Ok(s) => s,
            Err(e) => {
                state.abort.store(true, Ordering::Release);
                let _ = ready_tx.send(Err(e));
                return empty_summary(&state);
            }
        }
    };

    let workers = match setup_workers(&state, &avail) {
        Ok(w) => w,
        Err((spawned, e)) => {
            // Roll back what came up, then report the failure.
            state.abort.store(true, Ordering::Release);
            drain_workers(&state, &avail, &spawned, is_destination);
            for w in spawned {
                let _ = w.join.join();
            }
            let _ = ready_tx.send(Err(e));
            return empty_summary(&state);
        }
    };
    info!(
        "target {target}: ready with {} workers, {} ops per pass",
        workers.len(),
        if is_destination {
            "streamed".to_string()
        } else {
            seeks.len().to_string()
        }
    );
    if ready_tx.send(Ok(target)).is_err() {
        // Plan went away before we came up.
        state.abort.store(true, Ordering::Release);
        drain_workers(&state, &avail, &workers, is_destination);
        for w in workers {
            let _ = w.join.join();
        }
        return empty_summary(&state);
    }

    let occupant = Occupant::new(format!("scheduler-t{target}"), OccupantKind::Scheduler);
    let mut final_counters = Counters::default();
    let mut dispatched_total = 0u64;

    for pass in 1..=cfg.passes {
        if cfg.pre_pass.enter(occupant.clone()) == BarrierWait::Cancelled {
            break;
        }
        if pass == 1 {
            if let Some(gate) = cfg.start_gate.take() {
                debug!("target {target}: waiting on start trigger");
                let _ = gate.enter(occupant.clone());
            }
        }
        let dispatched = if is_destination {
            run_destination_pass(&state, &avail, pass)
        } else {
            run_dispatch_pass(&mut cfg, &state, &avail, &workers, &seeks, pass)
        };
        dispatched_total += dispatched;
        {
            let mut tc = lock(&state.counters);
            tc.close_pass(nclk_now());
            // Counts and banked durations sum across passes; the pass
            // stamps carry only the most recent pass.
            final_counters.accumulate(&tc);
            final_counters.pass_number = tc.pass_number;
            final_counters.pass_start_time = tc.pass_start_time;
            final_counters.pass_end_time = tc.pass_end_time;
        }
        // The master's half of the pair is gone after its pass; dropping
        // the channel frees the slave.
        cfg.lockstep = None;

        if cfg.post_pass.enter(occupant.clone()) == BarrierWait::Cancelled {
            break;
        }
        // A stop condition does not break the barrier cadence: the
        // remaining passes run empty, keeping every party aligned with
        // the coordinator.
        if pass < cfg.passes && !cfg.pass_delay.is_zero() && !state.should_stop() {
            thread::sleep(cfg.pass_delay);
        }
    }

    // An armed start trigger that never fired would leave its peer
    // parked forever; cancel it instead.
    if let Some((_, barrier)) = cfg.start_trigger.take() {
        barrier.destroy();
    }

    drain_workers(&state, &avail, &workers, is_destination);

    if let Some(trace) = &state.trace {
        let meta = DumpMeta {
            target_number: target as i32,
            reqsize: state.cfg.request_size as i32,
            blocksize: state.cfg.block_size as i32,
            id: crate::trace::run_identity(),
        };
        if let Err(e) = trace.write_dump(&meta) {
            warn!("target {target}: trace dump failed: {e}");
        }
    }

    if state.cfg.options.delete_on_finish && !state.cfg.is_null() {
        if let Err(e) = std::fs::remove_file(&state.cfg.uri) {
            warn!(
                "target {target}: delete on finish of {} failed: {e}",
                state.cfg.uri.display()
            );
        }
    }

    let worker_counters: Vec<Counters> = workers
        .iter()
        .map(|w| lock(&w.counters).clone())
        .collect();
    for w in workers {
        if w.join.join().is_err() {
            warn!("target {target}: a worker thread panicked");
        }
    }

    TargetSummary {
        target,
        counters: final_counters,
        worker_counters,
        error_count: state.error_count.load(Ordering::Relaxed),
        io_error_seen: state.io_error_seen.load(Ordering::Acquire),
        dispatched_ops: dispatched_total,
        tot_collisions: state.tot.collisions(),
    }
}

fn empty_summary(state: &TargetState) -> TargetSummary {
    TargetSummary {
        target: state.cfg.number,
        counters: Counters::default(),
        worker_counters: Vec::new(),
        error_count: state.error_count.load(Ordering::Relaxed),
        io_error_seen: state.io_error_seen.load(Ordering::Acquire),
        dispatched_ops: 0,
        tot_collisions: state.tot.collisions(),
    }
}

fn build_seek_list(state: &TargetState) -> Result<Vec<SeekEntry>, EngineError> {
    let seeks = seek::generate(&state.cfg.seek)?;
    debug!(
        "target {}: seek list of {} entries ({:?})",
        state.cfg.number,
        seeks.len(),
        state.cfg.seek.pattern
    );
    Ok(seeks)
}

type SetupResult = Result<Vec<WorkerHandle>, (Vec<WorkerHandle>, EngineError)>;

fn setup_workers(state: &Arc<TargetState>, avail: &Arc<AvailabilitySet>) -> SetupResult {
    let cfg = &state.cfg;
    let role = cfg.e2e.as_ref().map(|e| e.role);
    let mut handles: Vec<WorkerHandle> = Vec::with_capacity(cfg.queue_depth);

    for id in 0..cfg.queue_depth {
        let setup = (|| -> Result<WorkerHandle, EngineError> {
            let backend = TargetBackend::open(cfg)?;
            let buf = IoBuffer::for_target(cfg)?;
            let gate = WorkerGate::new();
            let counters = Arc::new(Mutex::new(Counters::default()));
            let ctx = WorkerContext {
                id,
                state: Arc::clone(state),
                gate: Arc::clone(&gate),
                avail: Arc::clone(avail),
                counters: Arc::clone(&counters),
                tot_wait: TotWait::new(),
            };
            let name = format!("t{}w{id}", cfg.number);
            let join = match cfg.e2e.as_ref() {
                Some(e2e) if e2e.role == E2eRole::Destination => {
                    let listener = bind_for_worker(&e2e.table, id)?;
                    thread::Builder::new()
                        .name(name)
                        .spawn(move || run_worker_destination(ctx, backend, listener, buf))
                }
                Some(e2e) => {
                    let sender = E2eSender::connect(&e2e.table, &e2e.socket, id)?;
                    thread::Builder::new()
                        .name(name)
                        .spawn(move || run_worker(ctx, backend, Some(sender), buf))
                }
                None => thread::Builder::new()
                    .name(name)
                    .spawn(move || run_worker(ctx, backend, None, buf)),
            }
            .map_err(|e| EngineError::Resource {
                what: format!("spawn worker {id} for target {}", cfg.number),
                source: e,
            })?;
            Ok(WorkerHandle {
                gate,
                counters,
                join,
            })
        })();
        match setup {
            Ok(h) => handles.push(h),
            Err(e) => return Err((handles, e)),
        }
    }
    Ok(handles)
}

fn run_dispatch_pass(
    cfg: &mut SchedulerConfig,
    state: &Arc<TargetState>,
    avail: &Arc<AvailabilitySet>,
    workers: &[WorkerHandle],
    seeks: &[SeekEntry],
    pass: u32,
) -> u64 {
    let tcfg = &state.cfg;
    let qd = tcfg.queue_depth;
    state.current_pass.store(pass, Ordering::Relaxed);

    if pass > 1 && (tcfg.options.recreate_per_pass || tcfg.options.reopen_per_pass) {
        if tcfg.options.recreate_per_pass {
            // One truncate up front; workers then reopen plain.
            if let Err(e) = TargetBackend::recreate(tcfg) {
                warn!("target {}: recreate failed: {e}", tcfg.number);
            }
        }
        for (id, w) in workers.iter().enumerate() {
            avail.take(id);
            w.gate.hand(Task::reopen());
        }
    }

    let pass_start = nclk_now();
    {
        let mut tc = lock(&state.counters);
        tc.reset_for_pass(pass, pass_start);
    }

    let num_ops = seeks.len() as u64;
    let pass_byte_shift = tcfg.pass_offset * (pass as i64 - 1);
    let mut last_issue: Nclk = 0;
    let mut bytes_issued = 0u64;
    let mut dispatched = 0u64;
    let mut slave_tracker = None;
    let mut master_tracker = None;
    match &cfg.lockstep {
        Some(LockstepEndpoint::Slave { interval, .. }) => {
            slave_tracker = Some(IntervalTracker::new(*interval));
        }
        Some(LockstepEndpoint::Master { interval, .. }) => {
            master_tracker = Some(IntervalTracker::new(*interval));
        }
        None => {}
    }
    let mut slave_running = false;

    for (n, entry) in seeks.iter().enumerate() {
        if state.should_stop() {
            info!(
                "target {}: stopping pass {pass} after {dispatched} of {num_ops} ops",
                tcfg.number
            );
            break;
        }
        let xfer = entry.reqsize.max(1) as u64 * tcfg.block_size as u64;
        let deadline =
            tcfg.throttle
                .next_issue_time(pass_start, last_issue, n as u64, bytes_issued, xfer);
        sleep_until(deadline, state);

        // A lockstep slave consumes one mark per interval of its own ops.
        let mut master_gone = false;
        if let Some(LockstepEndpoint::Slave { link, .. }) = &cfg.lockstep {
            let first = n == 0 && !slave_running;
            let boundary = slave_tracker
                .as_mut()
                .map(|t| t.crossed(n as u64, bytes_issued, nclk_now() - pass_start, num_ops))
                .unwrap_or(false);
            if first || boundary {
                if !first {
                    link.ack();
                }
                if link.wait() {
                    slave_running = true;
                } else {
                    // Master finished; run free to our own end of pass.
                    master_gone = true;
                    slave_running = false;
                }
            }
        }
        if master_gone {
            cfg.lockstep = None;
        }

        let id = avail.wait_lowest();
        let mut task = Task::io(
            map_op(entry.op),
            entry.block_location as i64 * tcfg.block_size as i64
                + tcfg.start_offset
                + pass_byte_shift,
            xfer as usize,
            n as i64,
        );
        task.verify = entry.op == SeekOp::WriteVerify || tcfg.options.verify;
        task.time_to_issue = deadline;
        workers[id].gate.hand(task);
        last_issue = nclk_now();
        dispatched += 1;
        bytes_issued += xfer;

        let mut slave_gone = false;
        if let Some(LockstepEndpoint::Master { link, .. }) = &cfg.lockstep {
            let crossed = master_tracker
                .as_mut()
                .map(|t| t.crossed(dispatched, bytes_issued, last_issue - pass_start, num_ops))
                .unwrap_or(false);
            if crossed && !link.signal() {
                slave_gone = true;
            }
        }
        if slave_gone {
            cfg.lockstep = None;
        }

        let elapsed = last_issue - pass_start;
        let fire_start = cfg
            .start_trigger
            .as_ref()
            .map_or(false, |(p, _)| p.crossed(dispatched, bytes_issued, elapsed, num_ops));
        if fire_start {
            if let Some((_, barrier)) = cfg.start_trigger.take() {
                info!("target {}: start trigger fired at op {dispatched}", tcfg.number);
                let _ = barrier.enter(Occupant::new(
                    format!("trigger-t{}", tcfg.number),
                    OccupantKind::Scheduler,
                ));
            }
        }
        let fire_stop = cfg
            .stop_trigger
            .as_ref()
            .map_or(false, |(p, _)| p.crossed(dispatched, bytes_issued, elapsed, num_ops));
        if fire_stop {
            if let Some((_, peer)) = cfg.stop_trigger.take() {
                info!(
                    "target {}: stop trigger fired at op {dispatched} toward target {}",
                    tcfg.number, peer.cfg.number
                );
                peer.stop_requested.store(true, Ordering::Release);
            }
        }
    }

    // A slave that consumed a mark owes one final acknowledgement.
    if slave_running {
        if let Some(LockstepEndpoint::Slave { link, .. }) = &cfg.lockstep {
            link.ack();
        }
    }

    // All dispatched: wait until every worker has gone idle again.
    avail.wait_all(qd);

    // End-to-end source: close out the stream, one EOF per worker pair.
    if matches!(
        state.cfg.e2e.as_ref().map(|e| e.role),
        Some(E2eRole::Source)
    ) {
        for (id, w) in workers.iter().enumerate() {
            avail.take(id);
            w.gate.hand(Task::eof(num_ops as i64));
        }
        avail.wait_all(qd);
    }

    dispatched
}

fn run_destination_pass(state: &Arc<TargetState>, avail: &Arc<AvailabilitySet>, pass: u32) -> u64 {
    state.current_pass.store(pass, Ordering::Relaxed);
    {
        // Workers may already be streaming, so stamp the pass fields
        // without zeroing what they have counted.
        let mut tc = lock(&state.counters);
        tc.pass_number = pass;
        tc.pass_start_time = nclk_now();
    }
    // Workers stream until every one has seen EOF or failed.
    avail.wait_all(state.cfg.queue_depth);
    let tc = lock(&state.counters);
    tc.op_count
}

fn drain_workers(
    state: &Arc<TargetState>,
    avail: &Arc<AvailabilitySet>,
    workers: &[WorkerHandle],
    is_destination: bool,
) {
    for (id, w) in workers.iter().enumerate() {
        avail.take(id);
        if !is_destination {
            w.gate.hand(Task::stop());
        }
    }
    debug!("target {}: drained", state.cfg.number);
}

fn map_op(op: SeekOp) -> OpType {
    match op {
        SeekOp::Read | SeekOp::WriteVerify => OpType::Read,
        SeekOp::Write => OpType::Write,
        SeekOp::Noop => OpType::Noop,
        SeekOp::Eof => OpType::Eof,
    }
}

/// Sleep toward a deadline in slices, so stop conditions stay
/// responsive under long throttle waits.
fn sleep_until(deadline: Nclk, state: &TargetState) {
    if deadline == 0 {
        return;
    }
    loop {
        if state.should_stop() {
            return;
        }
        let now = nclk_now();
        if now >= deadline {
            return;
        }
        let slice = (deadline - now).min(100_000_000);
        thread::sleep(Duration::from_nanos(slice));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_point_crossings() {
        assert!(TriggerPoint::Op(10).crossed(10, 0, 0, 100));
        assert!(!TriggerPoint::Op(10).crossed(9, 0, 0, 100));
        assert!(TriggerPoint::Bytes(4096).crossed(1, 4096, 0, 100));
        assert!(TriggerPoint::Percent(50.0).crossed(50, 0, 0, 100));
        assert!(!TriggerPoint::Percent(50.0).crossed(49, 0, 0, 100));
        assert!(TriggerPoint::Time(1_000).crossed(0, 0, 1_000, 100));
    }

    #[test]
    fn test_map_op() {
        assert_eq!(map_op(SeekOp::Read), OpType::Read);
        assert_eq!(map_op(SeekOp::WriteVerify), OpType::Read);
        assert_eq!(map_op(SeekOp::Write), OpType::Write);
    }
}
