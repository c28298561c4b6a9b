//! Flag surface and option-string parsing.
//!
//! Sub-option strings (`--throttle ops=1000`, `--ts dump=trace.bin`,
//! `--e2e source:host:40010:4`) are parsed here into engine types; a bad
//! value is an invalid-option error, exit code 3.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use iomark_engine::error::EngineError;
use iomark_engine::lockstep::LsInterval;
use iomark_engine::nclk::BILLION;
use iomark_engine::plan::{E2eAttr, LockstepSpec, PlanAttr, TargetAttr};
use iomark_engine::scheduler::TriggerPoint;
use iomark_engine::seek::SeekPattern;
use iomark_engine::target::E2eRole;
use iomark_engine::throttle::Throttle;
use iomark_engine::trace::{ts_opts, TraceConfig};
use iomark_engine::types::{OrderingMode, TargetRole};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "iomark")]
#[command(version)]
#[command(about = "Multi-threaded data mover and storage benchmark")]
pub struct Args {
    /// Target file or device; repeat for multiple targets
    #[arg(long = "target", value_name = "PATH")]
    pub targets: Vec<PathBuf>,

    /// Run against a null target (no storage behind the ops)
    #[arg(long)]
    pub null: bool,

    /// Operation for every target
    #[arg(long, value_parser = ["read", "write"], default_value = "read")]
    pub op: String,

    /// Fraction of ops that are reads, overriding --op
    #[arg(long, value_name = "RATIO")]
    pub rwratio: Option<f64>,

    /// Request size in blocks
    #[arg(long, value_name = "BLOCKS")]
    pub reqsize: Option<usize>,

    /// Block size in bytes
    #[arg(long, value_name = "BYTES")]
    pub blocksize: Option<usize>,

    /// Number of requests per pass
    #[arg(long, value_name = "N")]
    pub numreqs: Option<u64>,

    /// Bytes to move per pass (alternative to --numreqs)
    #[arg(long, value_name = "BYTES")]
    pub bytes: Option<u64>,

    #[arg(long, value_name = "N")]
    pub passes: Option<u32>,

    /// Seconds between passes
    #[arg(long, value_name = "SECS")]
    pub passdelay: Option<f64>,

    /// Worker threads per target
    #[arg(long, value_name = "N")]
    pub queuedepth: Option<usize>,

    /// Seek pattern: sequential|random|staggered|load=FILE|save=FILE|seed=N
    #[arg(long = "seek", value_name = "SPEC")]
    pub seek: Vec<String>,

    /// Ordering: {serial|loose|none}[:{storage|network}]
    #[arg(long, value_name = "SPEC")]
    pub ordering: Vec<String>,

    /// Throttle: ops=N | bw=MBPS | abw=MBPS | delay=SECS
    #[arg(long, value_name = "SPEC")]
    pub throttle: Option<String>,

    /// Lockstep: MASTER SLAVE INTERVAL (e.g. 0 1 ops=10[:overlapped])
    #[arg(long, num_args = 3, value_names = ["MASTER", "SLAVE", "INTERVAL"])]
    pub lockstep: Option<Vec<String>>,

    /// End-to-end role: {source|destination}:HOST:BASEPORT:NPORTS
    #[arg(long, value_name = "SPEC")]
    pub e2e: Option<String>,

    /// Timestamp tracing: on|size=N|dump=FILE|wrap|oneshot|normalize|trigop=N
    #[arg(long = "ts", value_name = "SPEC")]
    pub ts: Vec<String>,

    /// Direct I/O (page-cache bypass; aligned buffers)
    #[arg(long)]
    pub dio: bool,

    /// Verify read contents against the location pattern
    #[arg(long)]
    pub verify: bool,

    /// Retries per op on short or failed transfers
    #[arg(long, value_name = "N")]
    pub retry: Option<u32>,

    /// Error budget before the pass drains; 0 is unlimited
    #[arg(long, value_name = "N")]
    pub maxerrors: Option<u64>,

    /// Byte offset added to every op
    #[arg(long, value_name = "BYTES")]
    pub startoffset: Option<i64>,

    /// Additional byte offset per pass
    #[arg(long, value_name = "BYTES")]
    pub passoffset: Option<i64>,

    /// Wall-clock limit in seconds; 0 is unlimited
    #[arg(long, value_name = "SECS")]
    pub runtime: Option<u64>,

    /// Drain the pass on the first op error
    #[arg(long = "stop-on-error")]
    pub stop_on_error: bool,

    /// Heartbeat log interval in seconds
    #[arg(long, value_name = "SECS")]
    pub heartbeat: Option<u64>,

    /// Preallocate output targets to their full length
    #[arg(long)]
    pub preallocate: bool,

    /// Remove target files when the run finishes
    #[arg(long = "deletefile")]
    pub delete_on_finish: bool,

    /// Recreate output targets at each pass
    #[arg(long)]
    pub recreate: bool,

    /// Reopen targets at each pass
    #[arg(long)]
    pub reopen: bool,
}

impl Args {
    /// Resolve flags over config-file defaults into a plan.
    pub fn into_plan(self, defaults: &Config) -> Result<(PlanAttr, Vec<TargetAttr>), EngineError> {
        let block_size = self.blocksize.unwrap_or(defaults.defaults.blocksize);
        let request_size = self.reqsize.unwrap_or(defaults.defaults.reqsize);
        let queue_depth = self.queuedepth.unwrap_or(defaults.defaults.queuedepth);
        let passes = self.passes.unwrap_or(defaults.defaults.passes);
        let retry = self.retry.unwrap_or(defaults.defaults.retry);
        let heartbeat = self.heartbeat.or(defaults.output.heartbeat_secs);

        let (storage_ordering, network_ordering) = parse_ordering(&self.ordering)?;
        let throttle = match &self.throttle {
            Some(spec) => parse_throttle(spec)?,
            None => Throttle::None,
        };
        let seek = parse_seek(&self.seek)?;
        let trace = parse_ts(&self.ts)?;
        let e2e = match &self.e2e {
            Some(spec) => Some(parse_e2e(spec)?),
            None => None,
        };
        let lockstep = match &self.lockstep {
            Some(raw) => Some(parse_lockstep(raw)?),
            None => None,
        };

        let attr = PlanAttr {
            block_size,
            request_size,
            retry_count: retry,
            passes: passes.max(1),
            pass_delay: Duration::from_secs_f64(self.passdelay.unwrap_or(0.0).max(0.0)),
            runtime: match self.runtime {
                Some(0) | None => None,
                Some(secs) => Some(Duration::from_secs(secs)),
            },
            heartbeat: heartbeat.map(Duration::from_secs),
            lockstep,
            // Start/stop triggers are wired through the library API;
            // the CLI exposes lockstep, which covers the common pairing.
            triggers: Vec::new(),
        };
        if attr.block_size == 0 || attr.request_size == 0 {
            return Err(EngineError::Option(
                "blocksize and reqsize must be nonzero".into(),
            ));
        }

        let xfer = (attr.block_size * attr.request_size) as u64;
        let num_reqs = match (self.numreqs, self.bytes) {
            (Some(n), _) => Some(n),
            (None, Some(bytes)) => Some(bytes / xfer),
            (None, None) => None,
        };

        let rw_ratio = match self.rwratio {
            Some(r) if (0.0..=1.0).contains(&r) => r,
            Some(r) => {
                return Err(EngineError::Option(format!(
                    "rwratio {r} is outside [0, 1]"
                )))
            }
            None => match (self.op.as_str(), &e2e) {
                (_, Some(e)) if e.role == E2eRole::Destination => 0.0,
                (_, Some(_)) => 1.0,
                ("write", _) => 0.0,
                _ => 1.0,
            },
        };

        let role = match &e2e {
            Some(e) if e.role == E2eRole::Destination => TargetRole::Out,
            Some(_) => TargetRole::In,
            None if self.null => TargetRole::Null,
            None if rw_ratio < 1.0 => TargetRole::Out,
            None => TargetRole::In,
        };

        let uris: Vec<PathBuf> = if self.null {
            vec![PathBuf::new()]
        } else if self.targets.is_empty() {
            return Err(EngineError::Config(
                "no targets given; use --target PATH or --null".into(),
            ));
        } else {
            self.targets.clone()
        };

        let mut targets = Vec::with_capacity(uris.len());
        for uri in uris {
            targets.push(TargetAttr {
                role,
                uri,
                length: self.bytes.unwrap_or(0),
                num_threads: queue_depth.max(1),
                start_offset: self.startoffset.unwrap_or(0),
                pass_offset: self.passoffset.unwrap_or(0),
                dio: self.dio,
                num_reqs,
                rw_ratio,
                seek_pattern: seek.pattern.clone(),
                seed: seek.seed,
                seek_save: seek.save.clone(),
                verify: self.verify,
                storage_ordering,
                network_ordering,
                throttle,
                trace: trace.clone(),
                max_errors: self.maxerrors.unwrap_or(0),
                retry_count: None,
                stop_on_error: self.stop_on_error,
                preallocate: self.preallocate,
                delete_on_finish: self.delete_on_finish,
                recreate_per_pass: self.recreate,
                reopen_per_pass: self.reopen,
                e2e: e2e.clone(),
            });
        }

        Ok((attr, targets))
    }
}

pub struct SeekSpec {
    pub pattern: SeekPattern,
    pub seed: u64,
    pub save: Option<PathBuf>,
}

pub fn parse_seek(specs: &[String]) -> Result<SeekSpec, EngineError> {
    let mut out = SeekSpec {
        pattern: SeekPattern::Sequential,
        seed: 72058,
        save: None,
    };
    for spec in specs {
        match spec.as_str() {
            "sequential" => out.pattern = SeekPattern::Sequential,
            "random" => out.pattern = SeekPattern::Random,
            "staggered" => out.pattern = SeekPattern::Staggered,
            other => {
                if let Some(path) = other.strip_prefix("load=") {
                    out.pattern = SeekPattern::Load(PathBuf::from(path));
                } else if let Some(path) = other.strip_prefix("save=") {
                    out.save = Some(PathBuf::from(path));
                } else if let Some(seed) = other.strip_prefix("seed=") {
                    out.seed = seed.parse().map_err(|_| {
                        EngineError::Option(format!("bad seek seed '{seed}'"))
                    })?;
                } else {
                    return Err(EngineError::Option(format!("unknown seek spec '{other}'")));
                }
            }
        }
    }
    Ok(out)
}

pub fn parse_ordering(specs: &[String]) -> Result<(OrderingMode, OrderingMode), EngineError> {
    let mut storage = OrderingMode::Loose;
    let mut network = OrderingMode::Loose;
    for spec in specs {
        let (mode_str, scope) = match spec.split_once(':') {
            Some((m, s)) => (m, Some(s)),
            None => (spec.as_str(), None),
        };
        let mode: OrderingMode = mode_str
            .parse()
            .map_err(EngineError::Option)?;
        match scope {
            None => {
                storage = mode;
                network = mode;
            }
            Some("storage") => storage = mode,
            Some("network") => network = mode,
            Some(other) => {
                return Err(EngineError::Option(format!(
                    "unknown ordering scope '{other}'"
                )))
            }
        }
    }
    Ok((storage, network))
}

pub fn parse_throttle(spec: &str) -> Result<Throttle, EngineError> {
    let (kind, value) = spec
        .split_once('=')
        .ok_or_else(|| EngineError::Option(format!("throttle '{spec}' wants KIND=VALUE")))?;
    let value: f64 = value
        .parse()
        .map_err(|_| EngineError::Option(format!("bad throttle value '{value}'")))?;
    if value <= 0.0 {
        return Err(EngineError::Option(format!(
            "throttle value {value} must be positive"
        )));
    }
    match kind {
        "ops" => Ok(Throttle::Ops(value)),
        "bw" => Ok(Throttle::Bandwidth(value)),
        "abw" => Ok(Throttle::AvgBandwidth(value)),
        "delay" => Ok(Throttle::Delay((value * BILLION as f64) as u64)),
        other => Err(EngineError::Option(format!(
            "unknown throttle kind '{other}'"
        ))),
    }
}

pub fn parse_ts(specs: &[String]) -> Result<TraceConfig, EngineError> {
    let mut cfg = TraceConfig {
        size: 4096,
        ..Default::default()
    };
    for spec in specs {
        match spec.as_str() {
            "on" => cfg.options |= ts_opts::ON,
            "wrap" => cfg.options |= ts_opts::WRAP,
            "oneshot" => cfg.options |= ts_opts::ONESHOT,
            "normalize" => cfg.options |= ts_opts::NORMALIZE,
            "append" => cfg.options |= ts_opts::APPEND,
            "detailed" => cfg.options |= ts_opts::DETAILED,
            "summary" => cfg.options |= ts_opts::SUMMARY,
            "suppress" => cfg.options |= ts_opts::SUPPRESS,
            other => {
                if let Some(path) = other.strip_prefix("dump=") {
                    cfg.options |= ts_opts::ON | ts_opts::DUMP;
                    cfg.binary_path = Some(PathBuf::from(path));
                } else if let Some(n) = other.strip_prefix("size=") {
                    cfg.size = n.parse().map_err(|_| {
                        EngineError::Option(format!("bad trace size '{n}'"))
                    })?;
                } else if let Some(n) = other.strip_prefix("trigop=") {
                    cfg.options |= ts_opts::TRIGOP;
                    cfg.trigger_op = n.parse().map_err(|_| {
                        EngineError::Option(format!("bad trigger op '{n}'"))
                    })?;
                } else {
                    return Err(EngineError::Option(format!("unknown ts spec '{other}'")));
                }
            }
        }
    }
    Ok(cfg)
}

pub fn parse_e2e(spec: &str) -> Result<E2eAttr, EngineError> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() != 4 {
        return Err(EngineError::Option(format!(
            "e2e '{spec}' wants ROLE:HOST:BASEPORT:NPORTS"
        )));
    }
    let role = match parts[0] {
        "source" => E2eRole::Source,
        "destination" => E2eRole::Destination,
        other => {
            return Err(EngineError::Option(format!(
                "unknown e2e role '{other}'"
            )))
        }
    };
    let base_port: u16 = parts[2]
        .parse()
        .map_err(|_| EngineError::Option(format!("bad e2e port '{}'", parts[2])))?;
    let port_count: u16 = parts[3]
        .parse()
        .map_err(|_| EngineError::Option(format!("bad e2e port count '{}'", parts[3])))?;
    if port_count == 0 {
        return Err(EngineError::Option("e2e port count must be nonzero".into()));
    }
    Ok(E2eAttr {
        role,
        host: parts[1].to_string(),
        base_port,
        port_count,
        nodelay: false,
        linger: None,
    })
}

pub fn parse_lockstep(raw: &[String]) -> Result<LockstepSpec, EngineError> {
    let master: usize = raw[0]
        .parse()
        .map_err(|_| EngineError::Option(format!("bad lockstep master '{}'", raw[0])))?;
    let slave: usize = raw[1]
        .parse()
        .map_err(|_| EngineError::Option(format!("bad lockstep slave '{}'", raw[1])))?;
    let (interval_str, overlapped) = match raw[2].strip_suffix(":overlapped") {
        Some(s) => (s, true),
        None => (raw[2].as_str(), false),
    };
    let (kind, value) = interval_str.split_once('=').ok_or_else(|| {
        EngineError::Option(format!("lockstep interval '{interval_str}' wants KIND=VALUE"))
    })?;
    let interval = match kind {
        "ops" => LsInterval::Ops(value.parse().map_err(|_| {
            EngineError::Option(format!("bad lockstep interval '{value}'"))
        })?),
        "bytes" => LsInterval::Bytes(value.parse().map_err(|_| {
            EngineError::Option(format!("bad lockstep interval '{value}'"))
        })?),
        "time" => {
            let secs: f64 = value.parse().map_err(|_| {
                EngineError::Option(format!("bad lockstep interval '{value}'"))
            })?;
            LsInterval::Time((secs * BILLION as f64) as u64)
        }
        "percent" => LsInterval::Percent(value.parse().map_err(|_| {
            EngineError::Option(format!("bad lockstep interval '{value}'"))
        })?),
        other => {
            return Err(EngineError::Option(format!(
                "unknown lockstep interval kind '{other}'"
            )))
        }
    };
    Ok(LockstepSpec {
        master,
        slave,
        interval,
        overlapped,
    })
}

/// Kept for future CLI exposure of start/stop triggers.
#[allow(dead_code)]
pub fn parse_trigger_point(spec: &str) -> Result<TriggerPoint, EngineError> {
    let (kind, value) = spec
        .split_once('=')
        .ok_or_else(|| EngineError::Option(format!("trigger '{spec}' wants KIND=VALUE")))?;
    match kind {
        "op" => Ok(TriggerPoint::Op(value.parse().map_err(|_| {
            EngineError::Option(format!("bad trigger value '{value}'"))
        })?)),
        "bytes" => Ok(TriggerPoint::Bytes(value.parse().map_err(|_| {
            EngineError::Option(format!("bad trigger value '{value}'"))
        })?)),
        "percent" => Ok(TriggerPoint::Percent(value.parse().map_err(|_| {
            EngineError::Option(format!("bad trigger value '{value}'"))
        })?)),
        "time" => {
            let secs: f64 = value.parse().map_err(|_| {
                EngineError::Option(format!("bad trigger value '{value}'"))
            })?;
            Ok(TriggerPoint::Time((secs * BILLION as f64) as u64))
        }
        other => Err(EngineError::Option(format!(
            "unknown trigger kind '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ordering_scopes() {
        let (s, n) = parse_ordering(&["serial".to_string()]).unwrap();
        assert_eq!(s, OrderingMode::Serial);
        assert_eq!(n, OrderingMode::Serial);
        let (s, n) =
            parse_ordering(&["none:network".to_string(), "serial:storage".to_string()]).unwrap();
        assert_eq!(s, OrderingMode::Serial);
        assert_eq!(n, OrderingMode::None);
        assert!(parse_ordering(&["tight".to_string()]).is_err());
    }

    #[test]
    fn test_parse_throttle() {
        assert_eq!(parse_throttle("ops=1000").unwrap(), Throttle::Ops(1000.0));
        assert_eq!(parse_throttle("bw=2.5").unwrap(), Throttle::Bandwidth(2.5));
        assert_eq!(
            parse_throttle("delay=0.5").unwrap(),
            Throttle::Delay(500_000_000)
        );
        assert!(parse_throttle("warp=9").is_err());
        assert!(parse_throttle("ops=-5").is_err());
    }

    #[test]
    fn test_parse_seek() {
        let s = parse_seek(&[
            "random".to_string(),
            "seed=99".to_string(),
            "save=out.txt".to_string(),
        ])
        .unwrap();
        assert_eq!(s.pattern, SeekPattern::Random);
        assert_eq!(s.seed, 99);
        assert_eq!(s.save, Some(PathBuf::from("out.txt")));
        assert!(parse_seek(&["spiral".to_string()]).is_err());
    }

    #[test]
    fn test_parse_ts() {
        let cfg = parse_ts(&[
            "dump=trace.bin".to_string(),
            "oneshot".to_string(),
            "size=256".to_string(),
        ])
        .unwrap();
        assert!(cfg.options & ts_opts::ON != 0);
        assert!(cfg.options & ts_opts::DUMP != 0);
        assert!(cfg.options & ts_opts::ONESHOT != 0);
        assert_eq!(cfg.size, 256);
        assert_eq!(cfg.binary_path, Some(PathBuf::from("trace.bin")));
    }

    #[test]
    fn test_parse_e2e() {
        let e = parse_e2e("source:10.0.0.5:40010:8").unwrap();
        assert_eq!(e.role, E2eRole::Source);
        assert_eq!(e.host, "10.0.0.5");
        assert_eq!(e.base_port, 40010);
        assert_eq!(e.port_count, 8);
        assert!(parse_e2e("proxy:h:1:1").is_err());
        assert!(parse_e2e("source:h:1").is_err());
    }

    #[test]
    fn test_parse_lockstep() {
        let raw = vec!["0".to_string(), "1".to_string(), "ops=10".to_string()];
        let ls = parse_lockstep(&raw).unwrap();
        assert_eq!(ls.master, 0);
        assert_eq!(ls.slave, 1);
        assert_eq!(ls.interval, LsInterval::Ops(10));
        assert!(!ls.overlapped);

        let raw = vec![
            "1".to_string(),
            "0".to_string(),
            "time=2.5:overlapped".to_string(),
        ];
        let ls = parse_lockstep(&raw).unwrap();
        assert_eq!(ls.interval, LsInterval::Time(2_500_000_000));
        assert!(ls.overlapped);
    }

    #[test]
    fn test_into_plan_defaults_roles_from_op() {
        let args = Args::parse_from(["iomark", "--target", "/tmp/x", "--numreqs", "10"]);
        let (attr, targets) = args.into_plan(&Config::default()).unwrap();
        assert_eq!(attr.block_size, 1024);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].role, TargetRole::In);
        assert_eq!(targets[0].rw_ratio, 1.0);

        let args = Args::parse_from([
            "iomark", "--target", "/tmp/x", "--numreqs", "10", "--op", "write",
        ]);
        let (_, targets) = args.into_plan(&Config::default()).unwrap();
        assert_eq!(targets[0].role, TargetRole::Out);
        assert_eq!(targets[0].rw_ratio, 0.0);
    }

    #[test]
    fn test_into_plan_requires_targets() {
        let args = Args::parse_from(["iomark", "--numreqs", "10"]);
        assert!(args.into_plan(&Config::default()).is_err());
    }
}
