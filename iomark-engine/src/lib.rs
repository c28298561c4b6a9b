//! Core engine of the iomark data mover.
//!
//! A *plan* drives one or more *targets* (files, block devices, null sinks,
//! or network endpoints) through one or more *passes* of read, write, noop,
//! or end-to-end copy operations. Each target runs a scheduler thread plus
//! `queue_depth` worker threads; cross-worker ordering is enforced by the
//! per-target offset table, and every operation can be captured in a
//! fixed-size timestamp trace buffer.
//!
//! The crate is a library; the `iomark` binary builds a [`plan::Plan`] from
//! command-line flags, and `iomark-trace` reads the binary trace dumps this
//! crate writes.

pub mod barrier;
pub mod counters;
pub mod e2e;
pub mod error;
pub mod lockstep;
pub mod nclk;
pub mod plan;
pub mod scheduler;
pub mod seek;
pub mod target;
pub mod task;
pub mod throttle;
pub mod tot;
pub mod trace;
pub mod types;
pub mod worker;

pub(crate) mod util;

pub use error::{exit_code, EngineError};
pub use plan::{Plan, PlanAttr, RunResults, TargetAttr};
pub use types::{OrderingMode, TargetRole};
