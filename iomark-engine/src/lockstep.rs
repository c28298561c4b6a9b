//! Master/slave lockstep between two targets.
//!
//! The master sends one mark per interval crossing; the slave consumes
//! one mark before running each of its own intervals. In synchronous
//! mode the master additionally blocks until the slave acknowledges the
//! previous interval, so the pair advances strictly turn by turn. In
//! overlapped mode the master signals and keeps going.
//!
//! Channel closure doubles as the completion signal: when the master
//! finishes its pass it drops its sender, the slave's `wait` returns
//! `false`, and the slave runs unthrottled to its own end of pass.

use std::sync::mpsc::{channel, Receiver, Sender};

use crate::nclk::Nclk;

/// What an interval is measured in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LsInterval {
    Time(Nclk),
    Ops(u64),
    Bytes(u64),
    Percent(f64),
}

/// One interval grant from master to slave.
struct LsMark;

#[derive(Debug)]
pub struct LockstepMaster {
    marks: Sender<LsMark>,
    acks: Option<Receiver<()>>,
}

#[derive(Debug)]
pub struct LockstepSlave {
    marks: Receiver<LsMark>,
    acks: Option<Sender<()>>,
}

/// Build a linked master/slave pair. `overlapped` masters signal and
/// continue; synchronous masters wait for the slave's acknowledgement.
pub fn lockstep_pair(overlapped: bool) -> (LockstepMaster, LockstepSlave) {
    let (mark_tx, mark_rx) = channel();
    if overlapped {
        (
            LockstepMaster {
                marks: mark_tx,
                acks: None,
            },
            LockstepSlave {
                marks: mark_rx,
                acks: None,
            },
        )
    } else {
        let (ack_tx, ack_rx) = channel();
        (
            LockstepMaster {
                marks: mark_tx,
                acks: Some(ack_rx),
            },
            LockstepSlave {
                marks: mark_rx,
                acks: Some(ack_tx),
            },
        )
    }
}

impl LockstepMaster {
    /// Signal one interval crossing. Returns false when the slave is
    /// gone, which the master treats as "stop signalling".
    pub fn signal(&self) -> bool {
        if self.marks.send(LsMark).is_err() {
            return false;
        }
        match &self.acks {
            Some(rx) => rx.recv().is_ok(),
            None => true,
        }
    }
}

impl LockstepSlave {
    /// Wait for the next interval grant. Returns false once the master
    /// has finished its pass.
    pub fn wait(&self) -> bool {
        self.marks.recv().is_ok()
    }

    /// Acknowledge completion of the interval just run (synchronous mode
    /// only; a no-op when overlapped).
    pub fn ack(&self) {
        if let Some(tx) = &self.acks {
            let _ = tx.send(());
        }
    }
}

/// Tracks interval crossings against a target's issue counters.
#[derive(Debug)]
pub struct IntervalTracker {
    interval: LsInterval,
    crossings: u64,
}

impl IntervalTracker {
    pub fn new(interval: LsInterval) -> Self {
        Self {
            interval,
            crossings: 0,
        }
    }

    /// True each time the counters pass another interval boundary.
    /// Call once per dispatched op with the post-dispatch totals.
    pub fn crossed(
        &mut self,
        ops_issued: u64,
        bytes_issued: u64,
        elapsed: Nclk,
        num_ops: u64,
    ) -> bool {
        let boundary = match self.interval {
            LsInterval::Ops(n) if n > 0 => ops_issued / n,
            LsInterval::Bytes(b) if b > 0 => bytes_issued / b,
            LsInterval::Time(t) if t > 0 => elapsed / t,
            LsInterval::Percent(p) if p > 0.0 && num_ops > 0 => {
                let per = ((num_ops as f64) * p / 100.0).max(1.0) as u64;
                ops_issued / per
            }
            _ => return false,
        };
        if boundary > self.crossings {
            self.crossings = boundary;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_overlapped_master_never_blocks() {
        let (master, slave) = lockstep_pair(true);
        assert!(master.signal());
        assert!(master.signal());
        assert!(slave.wait());
        assert!(slave.wait());
        drop(master);
        // Master gone: the slave runs free.
        assert!(!slave.wait());
    }

    #[test]
    fn test_synchronous_pair_alternates() {
        let (master, slave) = lockstep_pair(false);
        let h = thread::spawn(move || {
            // Slave: consume three intervals, acking each.
            let mut got = 0;
            while slave.wait() {
                got += 1;
                slave.ack();
            }
            got
        });
        for _ in 0..3 {
            assert!(master.signal());
        }
        drop(master);
        assert_eq!(h.join().unwrap(), 3);
    }

    #[test]
    fn test_interval_tracker_ops() {
        let mut t = IntervalTracker::new(LsInterval::Ops(10));
        assert!(!t.crossed(5, 0, 0, 100));
        assert!(t.crossed(10, 0, 0, 100));
        assert!(!t.crossed(15, 0, 0, 100));
        assert!(t.crossed(20, 0, 0, 100));
    }

    #[test]
    fn test_interval_tracker_percent() {
        // 25% of 40 ops = every 10 ops.
        let mut t = IntervalTracker::new(LsInterval::Percent(25.0));
        assert!(!t.crossed(9, 0, 0, 40));
        assert!(t.crossed(10, 0, 0, 40));
        assert!(t.crossed(20, 0, 0, 40));
    }

    #[test]
    fn test_signal_after_slave_drop() {
        let (master, slave) = lockstep_pair(true);
        drop(slave);
        assert!(!master.signal());
    }
}
