//! Per-worker and per-target operation counters.
//!
//! Workers keep a private counter block and fold each completed op into
//! the target's block under the target's snapshot lock. Extended stats
//! track the longest and shortest op of the pass.

use crate::nclk::Nclk;
use crate::task::OpType;

#[derive(Debug, Clone)]
pub struct Counters {
    pub pass_number: u32,
    pub pass_start_time: Nclk,
    pub pass_end_time: Nclk,
    /// Wall-clock time of completed passes; summed across passes when
    /// counter blocks are folded.
    pub elapsed_time: Nclk,
    pub first_op_start_time: Nclk,

    pub op_count: u64,
    pub read_op_count: u64,
    pub write_op_count: u64,
    pub noop_op_count: u64,

    pub bytes_xfered: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_noop: u64,

    pub op_time: Nclk,
    pub read_op_time: Nclk,
    pub write_op_time: Nclk,
    pub noop_op_time: Nclk,

    pub shortest_op_time: Nclk,
    pub longest_op_time: Nclk,

    pub error_count: u64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            pass_number: 0,
            pass_start_time: 0,
            pass_end_time: 0,
            elapsed_time: 0,
            first_op_start_time: 0,
            op_count: 0,
            read_op_count: 0,
            write_op_count: 0,
            noop_op_count: 0,
            bytes_xfered: 0,
            bytes_read: 0,
            bytes_written: 0,
            bytes_noop: 0,
            op_time: 0,
            read_op_time: 0,
            write_op_time: 0,
            noop_op_time: 0,
            shortest_op_time: Nclk::MAX,
            longest_op_time: 0,
            error_count: 0,
        }
    }
}

impl Counters {
    pub fn reset_for_pass(&mut self, pass: u32, now: Nclk) {
        *self = Self {
            pass_number: pass,
            pass_start_time: now,
            ..Self::default()
        };
    }

    /// Record one completed op.
    pub fn record_op(&mut self, op: OpType, bytes: u64, elapsed: Nclk, start: Nclk) {
        if self.first_op_start_time == 0 || start < self.first_op_start_time {
            self.first_op_start_time = start;
        }
        self.op_count += 1;
        self.bytes_xfered += bytes;
        self.op_time += elapsed;
        match op {
            OpType::Read => {
                self.read_op_count += 1;
                self.bytes_read += bytes;
                self.read_op_time += elapsed;
            }
            OpType::Write => {
                self.write_op_count += 1;
                self.bytes_written += bytes;
                self.write_op_time += elapsed;
            }
            OpType::Noop | OpType::Eof => {
                self.noop_op_count += 1;
                self.bytes_noop += bytes;
                self.noop_op_time += elapsed;
            }
        }
        if elapsed < self.shortest_op_time {
            self.shortest_op_time = elapsed;
        }
        if elapsed > self.longest_op_time {
            self.longest_op_time = elapsed;
        }
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    /// Stamp the end of the current pass and bank its duration.
    pub fn close_pass(&mut self, now: Nclk) {
        self.pass_end_time = now;
        self.elapsed_time = now.saturating_sub(self.pass_start_time);
    }

    /// Fold another counter block into this one (worker -> target, or
    /// pass -> run). Pass durations sum, so aggregate throughput stays
    /// consistent with the aggregate byte count.
    pub fn accumulate(&mut self, other: &Counters) {
        if other.first_op_start_time != 0
            && (self.first_op_start_time == 0 || other.first_op_start_time < self.first_op_start_time)
        {
            self.first_op_start_time = other.first_op_start_time;
        }
        self.elapsed_time += other.elapsed_time;
        self.op_count += other.op_count;
        self.read_op_count += other.read_op_count;
        self.write_op_count += other.write_op_count;
        self.noop_op_count += other.noop_op_count;
        self.bytes_xfered += other.bytes_xfered;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.bytes_noop += other.bytes_noop;
        self.op_time += other.op_time;
        self.read_op_time += other.read_op_time;
        self.write_op_time += other.write_op_time;
        self.noop_op_time += other.noop_op_time;
        self.shortest_op_time = self.shortest_op_time.min(other.shortest_op_time);
        self.longest_op_time = self.longest_op_time.max(other.longest_op_time);
        self.error_count += other.error_count;
    }

    /// Span of the most recent pass.
    pub fn pass_elapsed(&self) -> Nclk {
        self.pass_end_time.saturating_sub(self.pass_start_time)
    }

    /// MB/s over the banked elapsed time (decimal megabytes, like every
    /// storage vendor). Zero until a pass has been closed; a live rate
    /// mid-pass needs the caller's own clock reading.
    pub fn throughput_mbps(&self) -> f64 {
        if self.elapsed_time == 0 {
            return 0.0;
        }
        (self.bytes_xfered as f64 / 1e6) / (self.elapsed_time as f64 / 1e9)
    }

    /// Mean op latency in nanoseconds.
    pub fn avg_op_time(&self) -> Nclk {
        if self.op_count == 0 {
            0
        } else {
            self.op_time / self.op_count
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_accumulate() {
        let mut a = Counters::default();
        a.record_op(OpType::Read, 4096, 1000, 10);
        a.record_op(OpType::Write, 4096, 3000, 20);
        let mut b = Counters::default();
        b.record_op(OpType::Read, 8192, 500, 5);
        b.record_error();

        let mut total = Counters::default();
        total.accumulate(&a);
        total.accumulate(&b);

        assert_eq!(total.op_count, 3);
        assert_eq!(total.read_op_count, 2);
        assert_eq!(total.write_op_count, 1);
        assert_eq!(total.bytes_xfered, 16384);
        assert_eq!(total.bytes_read, 12288);
        assert_eq!(total.shortest_op_time, 500);
        assert_eq!(total.longest_op_time, 3000);
        assert_eq!(total.first_op_start_time, 5);
        assert_eq!(total.error_count, 1);
    }

    #[test]
    fn test_throughput_uses_banked_elapsed() {
        let mut c = Counters::default();
        c.reset_for_pass(1, 0);
        c.record_op(OpType::Read, 100_000_000, 1, 1);
        // Mid-pass there is no banked duration yet.
        assert_eq!(c.throughput_mbps(), 0.0);
        c.close_pass(1_000_000_000); // one second
        assert_eq!(c.elapsed_time, 1_000_000_000);
        assert!((c.throughput_mbps() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_multi_pass_fold_sums_durations() {
        // Two one-second passes of 100 MB each: the aggregate is
        // 200 MB over two seconds, still 100 MB/s.
        let mut total = Counters::default();
        for pass in 1..=2u32 {
            let mut c = Counters::default();
            c.reset_for_pass(pass, 5_000_000_000 * pass as u64);
            c.record_op(OpType::Write, 100_000_000, 1, 1);
            c.close_pass(5_000_000_000 * pass as u64 + 1_000_000_000);
            total.accumulate(&c);
        }
        assert_eq!(total.bytes_xfered, 200_000_000);
        assert_eq!(total.elapsed_time, 2_000_000_000);
        assert!((total.throughput_mbps() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_accumulate_keeps_untouched_shortest() {
        let mut total = Counters::default();
        let worker = Counters::default(); // never ran an op
        total.accumulate(&worker);
        assert_eq!(total.shortest_op_time, Nclk::MAX);
        assert_eq!(total.op_count, 0);
    }
}
