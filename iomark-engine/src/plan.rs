//! Plan construction and coordination.
//!
//! A plan owns its targets. `new` validates everything before a single
//! thread spawns; `start` brings up one scheduler per target plus the
//! support threads (runtime timer, heartbeat) and rolls the whole plan
//! back if any target fails to come up; `wait` walks the pre/post pass
//! barriers with the schedulers, then joins them and folds the results.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::barrier::{Barrier, Occupant, OccupantKind};
use crate::counters::Counters;
use crate::e2e::{E2eAddressTable, E2eSocketOptions};
use crate::error::{exit_code, EngineError};
use crate::lockstep::{lockstep_pair, LsInterval};
use crate::nclk::{nclk_initialize, nclk_now};
use crate::scheduler::{
    spawn_target_scheduler, LockstepEndpoint, SchedulerConfig, TargetSummary, TriggerPoint,
};
use crate::seek::{SeekOptions, SeekPattern};
use crate::target::{E2eConfig, E2eRole, TargetConfig, TargetOptions, TargetState};
use crate::throttle::Throttle;
use crate::trace::TraceConfig;
use crate::types::{OrderingMode, TargetRole};
use crate::util::lock;

/// Plan-wide attributes: sizes and policies every target inherits.
#[derive(Debug, Clone)]
pub struct PlanAttr {
    pub block_size: usize,
    /// Blocks per request.
    pub request_size: usize,
    pub retry_count: u32,
    pub passes: u32,
    pub pass_delay: Duration,
    /// Wall-clock budget for the whole run; None means unbounded.
    pub runtime: Option<Duration>,
    /// Heartbeat log interval; None disables the heartbeat thread.
    pub heartbeat: Option<Duration>,
    pub lockstep: Option<LockstepSpec>,
    pub triggers: Vec<TriggerDef>,
}

impl Default for PlanAttr {
    fn default() -> Self {
        Self {
            block_size: 1024,
            request_size: 128,
            retry_count: 0,
            passes: 1,
            pass_delay: Duration::ZERO,
            runtime: None,
            heartbeat: None,
            lockstep: None,
            triggers: Vec::new(),
        }
    }
}

impl PlanAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn request_size(mut self, blocks: usize) -> Self {
        self.request_size = blocks;
        self
    }

    pub fn retry_count(mut self, n: u32) -> Self {
        self.retry_count = n;
        self
    }

    pub fn passes(mut self, n: u32) -> Self {
        self.passes = n.max(1);
        self
    }
}

/// Forced master/slave pairing between two targets of the plan.
#[derive(Debug, Clone)]
pub struct LockstepSpec {
    pub master: usize,
    pub slave: usize,
    pub interval: LsInterval,
    pub overlapped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    Start,
    Stop,
}

/// `from` fires `action` at `to` when it crosses `point`.
#[derive(Debug, Clone)]
pub struct TriggerDef {
    pub from: usize,
    pub to: usize,
    pub point: TriggerPoint,
    pub action: TriggerAction,
}

/// Per-target attributes, combined with the plan attributes into a
/// [`TargetConfig`] at plan build.
#[derive(Debug, Clone)]
pub struct TargetAttr {
    pub role: TargetRole,
    pub uri: PathBuf,
    /// Byte extent; derived from the op count when zero.
    pub length: u64,
    /// Queue depth.
    pub num_threads: usize,
    pub start_offset: i64,
    pub pass_offset: i64,
    pub dio: bool,
    /// Ops per pass; derived from `length` when None.
    pub num_reqs: Option<u64>,
    /// Fraction of ops that are reads.
    pub rw_ratio: f64,
    pub seek_pattern: SeekPattern,
    pub seed: u64,
    pub seek_save: Option<PathBuf>,
    pub verify: bool,
    pub storage_ordering: OrderingMode,
    pub network_ordering: OrderingMode,
    pub throttle: Throttle,
    pub trace: TraceConfig,
    pub max_errors: u64,
    pub retry_count: Option<u32>,
    pub stop_on_error: bool,
    pub preallocate: bool,
    pub delete_on_finish: bool,
    pub recreate_per_pass: bool,
    pub reopen_per_pass: bool,
    pub e2e: Option<E2eAttr>,
}

#[derive(Debug, Clone)]
pub struct E2eAttr {
    pub role: E2eRole,
    pub host: String,
    pub base_port: u16,
    pub port_count: u16,
    pub nodelay: bool,
    pub linger: Option<i32>,
}

impl Default for TargetAttr {
    fn default() -> Self {
        Self {
            role: TargetRole::Out,
            uri: PathBuf::new(),
            length: 0,
            num_threads: 1,
            start_offset: 0,
            pass_offset: 0,
            dio: false,
            num_reqs: None,
            rw_ratio: 1.0,
            seek_pattern: SeekPattern::Sequential,
            seed: 72058,
            seek_save: None,
            verify: false,
            storage_ordering: OrderingMode::Loose,
            network_ordering: OrderingMode::Loose,
            throttle: Throttle::None,
            trace: TraceConfig::default(),
            max_errors: 0,
            retry_count: None,
            stop_on_error: false,
            preallocate: false,
            delete_on_finish: false,
            recreate_per_pass: false,
            reopen_per_pass: false,
            e2e: None,
        }
    }
}

impl TargetAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(mut self, role: TargetRole) -> Self {
        self.role = role;
        self
    }

    pub fn uri(mut self, uri: impl Into<PathBuf>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn length(mut self, bytes: u64) -> Self {
        self.length = bytes;
        self
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    pub fn start_offset(mut self, bytes: i64) -> Self {
        self.start_offset = bytes;
        self
    }

    pub fn dio(mut self, on: bool) -> Self {
        self.dio = on;
        self
    }
}

/// Final state of one target after the run.
#[derive(Debug)]
pub struct TargetResult {
    pub target: usize,
    pub counters: Counters,
    pub worker_counters: Vec<Counters>,
    pub error_count: u64,
    pub dispatched_ops: u64,
    pub tot_collisions: u64,
}

#[derive(Debug)]
pub struct RunResults {
    pub targets: Vec<TargetResult>,
    pub exit_code: i32,
    pub cancelled: bool,
}

#[derive(Debug)]
pub struct Plan {
    attr: PlanAttr,
    states: Vec<Arc<TargetState>>,
    scheds: Option<Vec<SchedulerConfig>>,
    handles: Vec<JoinHandle<TargetSummary>>,
    pre_pass: Arc<Barrier>,
    post_pass: Arc<Barrier>,
    abort: Arc<AtomicBool>,
    run_time_expired: Arc<AtomicBool>,
    support_stop: Arc<AtomicBool>,
    support_joins: Vec<JoinHandle<()>>,
    started: bool,
}

impl Plan {
    pub fn new(attr: PlanAttr, target_attrs: Vec<TargetAttr>) -> Result<Self, EngineError> {
        if nclk_initialize() == 0 {
            return Err(EngineError::Resource {
                what: "monotonic clock".into(),
                source: std::io::Error::new(std::io::ErrorKind::Unsupported, "no usable clock"),
            });
        }
        if target_attrs.is_empty() {
            return Err(EngineError::Config("plan has no targets".into()));
        }
        if attr.block_size == 0 || attr.request_size == 0 {
            return Err(EngineError::Config(
                "block size and request size must be nonzero".into(),
            ));
        }
        let passes = attr.passes.max(1);

        let abort = Arc::new(AtomicBool::new(false));
        let run_time_expired = Arc::new(AtomicBool::new(false));

        let mut states = Vec::with_capacity(target_attrs.len());
        for (number, ta) in target_attrs.iter().enumerate() {
            let cfg = build_target_config(&attr, ta, number)?;
            cfg.validate()?;
            if cfg.e2e.is_some() && passes > 1 {
                return Err(EngineError::Config(format!(
                    "target {number}: an end-to-end pair runs a single pass"
                )));
            }
            states.push(Arc::new(TargetState::new(
                cfg,
                Arc::clone(&abort),
                Arc::clone(&run_time_expired),
            )));
        }

        let ntargets = states.len();
        let pre_pass = Arc::new(Barrier::new("pre_pass", ntargets + 1));
        let post_pass = Arc::new(Barrier::new("post_pass", ntargets + 1));

        let mut scheds: Vec<SchedulerConfig> = states
            .iter()
            .map(|st| SchedulerConfig {
                state: Arc::clone(st),
                passes,
                pass_delay: attr.pass_delay,
                pre_pass: Arc::clone(&pre_pass),
                post_pass: Arc::clone(&post_pass),
                lockstep: None,
                start_gate: None,
                start_trigger: None,
                stop_trigger: None,
            })
            .collect();

        if let Some(ls) = &attr.lockstep {
            if ls.master >= ntargets || ls.slave >= ntargets || ls.master == ls.slave {
                return Err(EngineError::Config(format!(
                    "lockstep pair {}/{} does not name two distinct targets",
                    ls.master, ls.slave
                )));
            }
            if passes > 1 {
                return Err(EngineError::Config(
                    "lockstep applies to single-pass plans".into(),
                ));
            }
            let (master, slave) = lockstep_pair(ls.overlapped);
            scheds[ls.master].lockstep = Some(LockstepEndpoint::Master {
                link: master,
                interval: ls.interval,
            });
            scheds[ls.slave].lockstep = Some(LockstepEndpoint::Slave {
                link: slave,
                interval: ls.interval,
            });
        }

        for (i, trig) in attr.triggers.iter().enumerate() {
            if trig.from >= ntargets || trig.to >= ntargets || trig.from == trig.to {
                return Err(EngineError::Config(format!(
                    "trigger {} does not name two distinct targets",
                    i
                )));
            }
            match trig.action {
                TriggerAction::Start => {
                    let barrier = Arc::new(Barrier::new(format!("start-trigger-{i}"), 2));
                    scheds[trig.from].start_trigger = Some((trig.point, Arc::clone(&barrier)));
                    scheds[trig.to].start_gate = Some(barrier);
                }
                TriggerAction::Stop => {
                    scheds[trig.from].stop_trigger =
                        Some((trig.point, Arc::clone(&states[trig.to])));
                }
            }
        }

        Ok(Self {
            attr,
            states,
            scheds: Some(scheds),
            handles: Vec::new(),
            pre_pass,
            post_pass,
            abort,
            run_time_expired,
            support_stop: Arc::new(AtomicBool::new(false)),
            support_joins: Vec::new(),
            started: false,
        })
    }

    /// Flag polled between ops everywhere; setting it drains the run.
    /// Hand this to a signal handler.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Spawn every target's scheduler and the support threads. On any
    /// target-start failure the partial plan is torn back down.
    pub fn start(&mut self) -> Result<(), EngineError> {
        let scheds = self
            .scheds
            .take()
            .ok_or_else(|| EngineError::Config("plan already started".into()))?;
        let ntargets = scheds.len();
        let (ready_tx, ready_rx) = channel();

        for sched in scheds {
            let handle = spawn_target_scheduler(sched, ready_tx.clone()).map_err(|e| {
                EngineError::Resource {
                    what: "spawn scheduler thread".into(),
                    source: e,
                }
            })?;
            self.handles.push(handle);
        }
        drop(ready_tx);

        let mut first_failure: Option<EngineError> = None;
        for _ in 0..ntargets {
            match ready_rx.recv() {
                Ok(Ok(target)) => info!("target {target} started"),
                Ok(Err(e)) => {
                    warn!("{e}");
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
                Err(_) => break,
            }
        }
        if let Some(e) = first_failure {
            self.teardown();
            return Err(e);
        }

        self.spawn_support_threads();
        self.started = true;
        Ok(())
    }

    fn spawn_support_threads(&mut self) {
        if let Some(runtime) = self.attr.runtime {
            if !runtime.is_zero() {
                let expired = Arc::clone(&self.run_time_expired);
                let stop = Arc::clone(&self.support_stop);
                if let Ok(h) = thread::Builder::new().name("run-timer".into()).spawn(move || {
                    let deadline = nclk_now() + runtime.as_nanos() as u64;
                    while !stop.load(Ordering::Acquire) && nclk_now() < deadline {
                        thread::sleep(Duration::from_millis(50));
                    }
                    if !stop.load(Ordering::Acquire) {
                        info!("run time expired");
                        expired.store(true, Ordering::Release);
                    }
                }) {
                    self.support_joins.push(h);
                }
            }
        }
        if let Some(interval) = self.attr.heartbeat {
            let states: Vec<Arc<TargetState>> = self.states.iter().map(Arc::clone).collect();
            let stop = Arc::clone(&self.support_stop);
            if let Ok(h) = thread::Builder::new().name("heartbeat".into()).spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    for st in &states {
                        let tc = lock(&st.counters);
                        // The pass is still open, so rate the bytes
                        // against the clock rather than the banked
                        // pass duration.
                        let live_ns = nclk_now().saturating_sub(tc.pass_start_time);
                        let mbps = if tc.pass_start_time == 0 || live_ns == 0 {
                            0.0
                        } else {
                            (tc.bytes_xfered as f64 / 1e6) / (live_ns as f64 / 1e9)
                        };
                        info!(
                            "heartbeat: target {} pass {} ops {} bytes {} ({mbps:.2} MB/s)",
                            st.cfg.number, tc.pass_number, tc.op_count, tc.bytes_xfered
                        );
                    }
                }
            }) {
                self.support_joins.push(h);
            }
        }
    }

    /// Walk the pass barriers with the schedulers, then join them and
    /// fold the run's results.
    pub fn wait(&mut self) -> Result<RunResults, EngineError> {
        if !self.started {
            return Err(EngineError::Config("plan was never started".into()));
        }
        let occupant = Occupant::new("plan", OccupantKind::Coordinator);
        let passes = self.attr.passes.max(1);
        for pass in 1..=passes {
            if self.pre_pass.enter(occupant.clone()) == crate::barrier::BarrierWait::Cancelled {
                break;
            }
            info!("pass {pass} of {passes} underway");
            if self.post_pass.enter(occupant.clone()) == crate::barrier::BarrierWait::Cancelled {
                break;
            }
        }

        let summaries: Vec<TargetSummary> = self
            .handles
            .drain(..)
            .map(|h| h.join())
            .filter_map(|r| match r {
                Ok(s) => Some(s),
                Err(_) => {
                    warn!("a scheduler thread panicked");
                    None
                }
            })
            .collect();
        self.stop_support_threads();
        self.started = false;

        let cancelled = self.abort.load(Ordering::Acquire);
        let mut code = exit_code::SUCCESS;
        for s in &summaries {
            if s.io_error_seen || s.error_count > 0 {
                code = code.max(exit_code::IO_ERROR);
            }
        }
        if cancelled {
            code = code.max(exit_code::CANCELLED);
        }

        let targets = summaries
            .into_iter()
            .map(|s| TargetResult {
                target: s.target,
                counters: s.counters,
                worker_counters: s.worker_counters,
                error_count: s.error_count,
                dispatched_ops: s.dispatched_ops,
                tot_collisions: s.tot_collisions,
            })
            .collect();
        Ok(RunResults {
            targets,
            exit_code: code,
            cancelled,
        })
    }

    /// Convenience: start then wait.
    pub fn run(&mut self) -> Result<RunResults, EngineError> {
        self.start()?;
        self.wait()
    }

    fn stop_support_threads(&mut self) {
        self.support_stop.store(true, Ordering::Release);
        for h in self.support_joins.drain(..) {
            let _ = h.join();
        }
    }

    fn teardown(&mut self) {
        self.abort.store(true, Ordering::Release);
        self.pre_pass.destroy();
        self.post_pass.destroy();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
        self.stop_support_threads();
        self.started = false;
    }
}

impl Drop for Plan {
    fn drop(&mut self) {
        if self.started || !self.handles.is_empty() {
            self.teardown();
        }
    }
}

fn build_target_config(
    attr: &PlanAttr,
    ta: &TargetAttr,
    number: usize,
) -> Result<TargetConfig, EngineError> {
    let xfer = attr.block_size as u64 * attr.request_size as u64;
    let num_reqs = match ta.num_reqs {
        Some(n) => n,
        None if ta.length > 0 => ta.length / xfer,
        None => 0,
    };
    let length = if ta.length > 0 {
        ta.length
    } else {
        num_reqs * xfer
    };
    let range_blocks = length / attr.block_size as u64;

    let seek = SeekOptions {
        pattern: ta.seek_pattern.clone(),
        seed: ta.seed,
        range: range_blocks,
        reqsize: attr.request_size as i32,
        stride: 0,
        interleave: 1,
        num_rw_ops: num_reqs,
        rw_ratio: ta.rw_ratio,
        queue_depth: ta.num_threads,
        verify: ta.verify && ta.rw_ratio < 1.0,
        save_file: ta.seek_save.clone(),
    };

    let e2e = ta.e2e.as_ref().map(|e| E2eConfig {
        role: e.role,
        table: E2eAddressTable::single(e.host.clone(), e.base_port, e.port_count),
        socket: E2eSocketOptions {
            nodelay: e.nodelay,
            linger: e.linger,
            ..E2eSocketOptions::default()
        },
    });

    Ok(TargetConfig {
        number,
        role: ta.role,
        uri: ta.uri.clone(),
        block_size: attr.block_size,
        request_size: attr.request_size,
        num_reqs,
        length,
        start_offset: ta.start_offset,
        pass_offset: ta.pass_offset,
        queue_depth: ta.num_threads.max(1),
        retry_count: ta.retry_count.unwrap_or(attr.retry_count),
        max_errors: ta.max_errors,
        seek,
        throttle: ta.throttle,
        trace: ta.trace.clone(),
        e2e,
        options: TargetOptions {
            dio: ta.dio,
            preallocate: ta.preallocate,
            delete_on_finish: ta.delete_on_finish,
            verify: ta.verify,
            recreate_per_pass: ta.recreate_per_pass,
            reopen_per_pass: ta.reopen_per_pass,
            stop_on_error: ta.stop_on_error,
            storage_ordering: ta.storage_ordering,
            network_ordering: ta.network_ordering,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_rejects_empty_target_list() {
        assert!(Plan::new(PlanAttr::default(), Vec::new()).is_err());
    }

    #[test]
    fn test_plan_rejects_zero_ops() {
        let ta = TargetAttr::new().uri("/tmp/whatever");
        let err = Plan::new(PlanAttr::default(), vec![ta]).unwrap_err();
        assert!(err.to_string().contains("no operations"));
    }

    #[test]
    fn test_target_config_derives_counts() {
        let attr = PlanAttr::new().block_size(1024).request_size(4);
        let ta = TargetAttr {
            uri: "/tmp/t".into(),
            length: 40960,
            ..Default::default()
        };
        let cfg = build_target_config(&attr, &ta, 0).unwrap();
        assert_eq!(cfg.num_reqs, 10);
        assert_eq!(cfg.xfer_size(), 4096);
        assert_eq!(cfg.seek.range, 40);
        assert_eq!(cfg.seek.num_rw_ops, 10);
    }

    #[test]
    fn test_lockstep_validation() {
        let attr = PlanAttr {
            lockstep: Some(LockstepSpec {
                master: 0,
                slave: 0,
                interval: LsInterval::Ops(10),
                overlapped: false,
            }),
            ..Default::default()
        };
        let ta = TargetAttr {
            role: TargetRole::Null,
            num_reqs: Some(10),
            length: 40960,
            ..Default::default()
        };
        let err = Plan::new(attr, vec![ta.clone(), ta]).unwrap_err();
        assert!(err.to_string().contains("lockstep"));
    }
}
