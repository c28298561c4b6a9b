//! Named multi-party rendezvous.
//!
//! A barrier has a fixed capacity and a list of occupants currently
//! parked in it. Occupant identity survives until release so a stalled
//! run can report exactly who is holding the barrier up. `destroy`
//! cancels every waiter with a distinguished status.

use std::sync::{Condvar, Mutex};

use crate::util::{lock, wait};

/// Who is standing in a barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupant {
    pub name: String,
    pub kind: OccupantKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupantKind {
    Coordinator,
    Scheduler,
    Worker,
    Support,
}

impl Occupant {
    pub fn new(name: impl Into<String>, kind: OccupantKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Result of an `enter` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWait {
    /// All parties arrived; everyone was released together.
    Released,
    /// The barrier was destroyed while waiting.
    Cancelled,
}

#[derive(Debug)]
struct BarrierState {
    occupants: Vec<Occupant>,
    generation: u64,
    cancelled: bool,
}

#[derive(Debug)]
pub struct Barrier {
    name: String,
    capacity: usize,
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl Barrier {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            state: Mutex::new(BarrierState {
                occupants: Vec::new(),
                generation: 0,
                cancelled: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until `capacity` occupants have entered, then release all of
    /// them atomically. No ordering is guaranteed among entrants; the
    /// release edge happens-before every waiter's return.
    pub fn enter(&self, occupant: Occupant) -> BarrierWait {
        let mut st = lock(&self.state);
        if st.cancelled {
            return BarrierWait::Cancelled;
        }
        st.occupants.push(occupant);
        if st.occupants.len() == self.capacity {
            st.occupants.clear();
            st.generation += 1;
            self.cond.notify_all();
            return BarrierWait::Released;
        }
        let gen = st.generation;
        while !st.cancelled && st.generation == gen {
            st = wait(&self.cond, st);
        }
        if st.generation == gen {
            BarrierWait::Cancelled
        } else {
            BarrierWait::Released
        }
    }

    /// Cancel every current and future waiter. Occupant records are kept
    /// so diagnostics can still report who was parked here.
    pub fn destroy(&self) {
        let mut st = lock(&self.state);
        st.cancelled = true;
        self.cond.notify_all();
    }

    /// Occupants currently parked in the barrier.
    pub fn waiting(&self) -> Vec<Occupant> {
        lock(&self.state).occupants.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_release_at_capacity() {
        let barrier = Arc::new(Barrier::new("pass_start", 3));
        let mut handles = Vec::new();
        for i in 0..2 {
            let b = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                b.enter(Occupant::new(format!("worker{i}"), OccupantKind::Worker))
            }));
        }
        // Give the two waiters time to park, then check the roster.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(barrier.waiting().len(), 2);

        let status = barrier.enter(Occupant::new("scheduler", OccupantKind::Scheduler));
        assert_eq!(status, BarrierWait::Released);
        for h in handles {
            assert_eq!(h.join().unwrap(), BarrierWait::Released);
        }
        assert!(barrier.waiting().is_empty());
    }

    #[test]
    fn test_destroy_cancels_waiters() {
        let barrier = Arc::new(Barrier::new("doomed", 2));
        let b = Arc::clone(&barrier);
        let h = thread::spawn(move || b.enter(Occupant::new("w0", OccupantKind::Worker)));
        thread::sleep(Duration::from_millis(50));
        barrier.destroy();
        assert_eq!(h.join().unwrap(), BarrierWait::Cancelled);
        // Entering a destroyed barrier fails immediately.
        let late = barrier.enter(Occupant::new("late", OccupantKind::Worker));
        assert_eq!(late, BarrierWait::Cancelled);
    }

    #[test]
    fn test_barrier_is_reusable_across_generations() {
        let barrier = Arc::new(Barrier::new("per_pass", 2));
        for _ in 0..3 {
            let b = Arc::clone(&barrier);
            let h = thread::spawn(move || b.enter(Occupant::new("w", OccupantKind::Worker)));
            assert_eq!(
                barrier.enter(Occupant::new("s", OccupantKind::Scheduler)),
                BarrierWait::Released
            );
            assert_eq!(h.join().unwrap(), BarrierWait::Released);
        }
    }
}
