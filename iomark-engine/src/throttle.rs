//! Op-issuance rate limiting.
//!
//! Every variant answers the same question: given what has been issued
//! so far, when may the next op go out? The scheduler sleeps until the
//! returned deadline.

use crate::nclk::Nclk;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Throttle {
    #[default]
    None,
    /// Target ops per second.
    Ops(f64),
    /// Target bandwidth in MB/s, spaced per op from the previous issue.
    Bandwidth(f64),
    /// Target average bandwidth in MB/s over the whole pass.
    AvgBandwidth(f64),
    /// Fixed delay between issues, in nanoseconds.
    Delay(Nclk),
}

impl Throttle {
    /// Earliest time op number `ops_issued` (0-based) may be issued.
    /// `bytes_issued` excludes the op about to go out; `next_xfer` is its
    /// size in bytes.
    pub fn next_issue_time(
        &self,
        pass_start: Nclk,
        last_issue: Nclk,
        ops_issued: u64,
        bytes_issued: u64,
        next_xfer: u64,
    ) -> Nclk {
        match *self {
            Throttle::None => 0,
            Throttle::Ops(rate) if rate > 0.0 => {
                pass_start + (ops_issued as f64 * (1e9 / rate)) as u64
            }
            Throttle::Bandwidth(mbps) if mbps > 0.0 => {
                if ops_issued == 0 {
                    pass_start
                } else {
                    last_issue + (next_xfer as f64 / (mbps * 1e6) * 1e9) as u64
                }
            }
            Throttle::AvgBandwidth(mbps) if mbps > 0.0 => {
                pass_start + (bytes_issued as f64 / (mbps * 1e6) * 1e9) as u64
            }
            Throttle::Delay(ns) => {
                if ops_issued == 0 {
                    pass_start
                } else {
                    last_issue + ns
                }
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_delays() {
        assert_eq!(Throttle::None.next_issue_time(100, 200, 5, 1000, 100), 0);
    }

    #[test]
    fn test_ops_spaces_from_pass_start() {
        let t = Throttle::Ops(1000.0); // one op per millisecond
        assert_eq!(t.next_issue_time(0, 0, 0, 0, 4096), 0);
        assert_eq!(t.next_issue_time(0, 0, 1, 4096, 4096), 1_000_000);
        assert_eq!(t.next_issue_time(0, 0, 10, 0, 4096), 10_000_000);
    }

    #[test]
    fn test_bandwidth_spaces_per_op() {
        // 1 MB/s, 1 MB ops: one op per second, measured from the last issue.
        let t = Throttle::Bandwidth(1.0);
        let d = t.next_issue_time(0, 5_000_000_000, 3, 3_000_000, 1_000_000);
        assert_eq!(d, 6_000_000_000);
    }

    #[test]
    fn test_avg_bandwidth_uses_cumulative_bytes() {
        // 2 MB/s average: 6 MB already issued means the next op waits
        // until the 3-second mark regardless of when the last issue was.
        let t = Throttle::AvgBandwidth(2.0);
        let d = t.next_issue_time(1_000_000_000, 0, 6, 6_000_000, 1_000_000);
        assert_eq!(d, 4_000_000_000);
    }

    #[test]
    fn test_delay_is_constant() {
        let t = Throttle::Delay(50_000);
        assert_eq!(t.next_issue_time(7, 100_000, 2, 0, 0), 150_000);
    }

    #[test]
    fn test_nonpositive_rates_disable() {
        assert_eq!(Throttle::Ops(0.0).next_issue_time(0, 0, 9, 0, 0), 0);
        assert_eq!(Throttle::Bandwidth(-1.0).next_issue_time(0, 0, 9, 0, 0), 0);
    }
}
