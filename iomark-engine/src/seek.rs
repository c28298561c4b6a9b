//! Seek list generation.
//!
//! A pass is driven by a finite list of seek entries, one per operation,
//! generated up front so two runs with the same parameters issue the
//! same sequence. Locations are in blocks; the scheduler converts to
//! bytes when it builds each task.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::EngineError;
use crate::nclk::Nclk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOp {
    Read,
    Write,
    /// Read-back verification of the preceding write.
    WriteVerify,
    Noop,
    Eof,
}

impl SeekOp {
    pub fn code(&self) -> char {
        match self {
            SeekOp::Read => 'r',
            SeekOp::Write => 'w',
            SeekOp::WriteVerify => 'v',
            SeekOp::Noop => 'n',
            SeekOp::Eof => 'e',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        match c {
            'r' => Some(SeekOp::Read),
            'w' => Some(SeekOp::Write),
            'v' => Some(SeekOp::WriteVerify),
            'n' => Some(SeekOp::Noop),
            'e' => Some(SeekOp::Eof),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekEntry {
    pub op: SeekOp,
    /// Starting location in blocks.
    pub block_location: u64,
    /// Request size in blocks.
    pub reqsize: i32,
    /// Relative time this op should start, or 0.
    pub start_time: Nclk,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SeekPattern {
    #[default]
    Sequential,
    Random,
    Staggered,
    Load(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SeekOptions {
    pub pattern: SeekPattern,
    pub seed: u64,
    /// Range of locations, in blocks.
    pub range: u64,
    /// Request size in blocks.
    pub reqsize: i32,
    /// Blocks between successive sequential requests; defaults to reqsize.
    pub stride: u64,
    /// Sequential interleave factor; 1 means none.
    pub interleave: u64,
    pub num_rw_ops: u64,
    /// Fraction of ops that are reads, in [0, 1].
    pub rw_ratio: f64,
    /// Stripes for the staggered pattern.
    pub queue_depth: usize,
    /// Follow every write with a read-back verify entry.
    pub verify: bool,
    pub save_file: Option<PathBuf>,
}

impl Default for SeekOptions {
    fn default() -> Self {
        Self {
            pattern: SeekPattern::Sequential,
            seed: 72058,
            range: 0,
            reqsize: 1,
            stride: 0,
            interleave: 1,
            num_rw_ops: 0,
            rw_ratio: 1.0,
            queue_depth: 1,
            verify: false,
            save_file: None,
        }
    }
}

/// True when op `i` of `n` should be a read, given `reads` total reads.
/// Spreads the reads stably so the mix holds over any prefix.
fn is_read(i: u64, n: u64, reads: u64) -> bool {
    ((i + 1) as u128 * reads as u128) / n as u128 > (i as u128 * reads as u128) / n as u128
}

/// Generate the seek list for one pass.
pub fn generate(opts: &SeekOptions) -> Result<Vec<SeekEntry>, EngineError> {
    if let SeekPattern::Load(path) = &opts.pattern {
        let list = load(path)?;
        if let Some(save) = &opts.save_file {
            save_list(&list, save)?;
        }
        return Ok(list);
    }

    let n = opts.num_rw_ops;
    if n == 0 {
        return Err(EngineError::Config("seek list would be empty".into()));
    }
    if opts.range == 0 {
        return Err(EngineError::Config("seek range is zero blocks".into()));
    }
    let reqsize = opts.reqsize.max(1) as u64;
    if opts.range < reqsize {
        return Err(EngineError::Config(format!(
            "seek range {} blocks is smaller than one request ({} blocks)",
            opts.range, reqsize
        )));
    }
    let stride = if opts.stride == 0 { reqsize } else { opts.stride };
    let stride = stride * opts.interleave.max(1);
    let ratio = opts.rw_ratio.clamp(0.0, 1.0);
    let reads = (ratio * n as f64).floor() as u64;

    // Request-aligned sampling keeps every request inside the range.
    let slots = opts.range / reqsize;
    let mut rng = StdRng::seed_from_u64(opts.seed);

    let mut list = Vec::with_capacity(n as usize);
    for i in 0..n {
        let block_location = match &opts.pattern {
            SeekPattern::Sequential => (i * stride) % opts.range,
            SeekPattern::Random => rng.gen_range(0..slots) * reqsize,
            SeekPattern::Staggered => {
                let qd = opts.queue_depth.max(1) as u64;
                let stripe = (opts.range / qd).max(reqsize);
                ((i % qd) * stripe + (i / qd) * stride) % opts.range
            }
            SeekPattern::Load(_) => unreachable!(),
        };
        let op = if is_read(i, n, reads) {
            SeekOp::Read
        } else {
            SeekOp::Write
        };
        list.push(SeekEntry {
            op,
            block_location,
            reqsize: reqsize as i32,
            start_time: 0,
        });
        if opts.verify && op == SeekOp::Write {
            list.push(SeekEntry {
                op: SeekOp::WriteVerify,
                block_location,
                reqsize: reqsize as i32,
                start_time: 0,
            });
        }
    }

    if let Some(save) = &opts.save_file {
        save_list(&list, save)?;
    }
    Ok(list)
}

/// Load a seek list saved by [`save_list`]: one `op location reqsize`
/// triple per line, `#` comments allowed.
pub fn load(path: &Path) -> Result<Vec<SeekEntry>, EngineError> {
    let text = fs::read_to_string(path).map_err(|e| EngineError::Resource {
        what: format!("seek load file {}", path.display()),
        source: e,
    })?;
    let mut list = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let parsed = (|| {
            let op = fields.next()?;
            let loc = fields.next()?;
            let req = fields.next()?;
            if fields.next().is_some() {
                return None;
            }
            let mut chars = op.chars();
            let code = chars.next()?;
            if chars.next().is_some() {
                return None;
            }
            Some(SeekEntry {
                op: SeekOp::from_code(code)?,
                block_location: loc.parse().ok()?,
                reqsize: req.parse().ok()?,
                start_time: 0,
            })
        })();
        match parsed {
            Some(entry) => list.push(entry),
            None => {
                return Err(EngineError::Config(format!(
                    "malformed seek record at {}:{}: '{}'",
                    path.display(),
                    lineno + 1,
                    line
                )))
            }
        }
    }
    if list.is_empty() {
        return Err(EngineError::Config(format!(
            "seek load file {} holds no records",
            path.display()
        )));
    }
    Ok(list)
}

/// Save a seek list in load-compatible form.
pub fn save_list(list: &[SeekEntry], path: &Path) -> Result<(), EngineError> {
    let mut out = String::with_capacity(list.len() * 16);
    for e in list {
        out.push_str(&format!("{} {} {}\n", e.op.code(), e.block_location, e.reqsize));
    }
    let mut file = fs::File::create(path).map_err(|e| EngineError::Resource {
        what: format!("seek save file {}", path.display()),
        source: e,
    })?;
    file.write_all(out.as_bytes()).map_err(|e| EngineError::Resource {
        what: format!("seek save file {}", path.display()),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(num: u64, range: u64) -> SeekOptions {
        SeekOptions {
            range,
            num_rw_ops: num,
            reqsize: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_sequential_covers_range_without_gaps() {
        // stride defaults to reqsize: locations 0, 4, 8, ...
        let list = generate(&base(100, 400)).unwrap();
        assert_eq!(list.len(), 100);
        for (i, e) in list.iter().enumerate() {
            assert_eq!(e.block_location, (i as u64 * 4) % 400);
            assert_eq!(e.op, SeekOp::Read);
        }
    }

    #[test]
    fn test_random_is_reproducible() {
        let opts = SeekOptions {
            pattern: SeekPattern::Random,
            seed: 72058,
            ..base(1000, 4000)
        };
        let a = generate(&opts).unwrap();
        let b = generate(&opts).unwrap();
        assert_eq!(a, b);
        // Locations stay request-aligned and in range.
        for e in &a {
            assert_eq!(e.block_location % 4, 0);
            assert!(e.block_location + 4 <= 4000);
        }
        // A different seed moves the sequence.
        let c = generate(&SeekOptions { seed: 1, ..opts }).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_staggered_stripes_across_queue_depth() {
        let opts = SeekOptions {
            pattern: SeekPattern::Staggered,
            queue_depth: 4,
            ..base(8, 1600)
        };
        let list = generate(&opts).unwrap();
        // Stripe size 400: first four ops land at the head of each stripe.
        assert_eq!(list[0].block_location, 0);
        assert_eq!(list[1].block_location, 400);
        assert_eq!(list[2].block_location, 800);
        assert_eq!(list[3].block_location, 1200);
        // Second round advances by one stride within each stripe.
        assert_eq!(list[4].block_location, 4);
        assert_eq!(list[5].block_location, 404);
    }

    #[test]
    fn test_rw_ratio_is_exact_and_stable() {
        let opts = SeekOptions {
            rw_ratio: 0.3,
            ..base(10, 400)
        };
        let list = generate(&opts).unwrap();
        let reads = list.iter().filter(|e| e.op == SeekOp::Read).count();
        assert_eq!(reads, 3);
        // Same options, same interleave.
        assert_eq!(generate(&opts).unwrap(), list);
    }

    #[test]
    fn test_verify_interleaves_after_writes() {
        let opts = SeekOptions {
            rw_ratio: 0.0,
            verify: true,
            ..base(3, 400)
        };
        let list = generate(&opts).unwrap();
        assert_eq!(list.len(), 6);
        assert_eq!(list[0].op, SeekOp::Write);
        assert_eq!(list[1].op, SeekOp::WriteVerify);
        assert_eq!(list[1].block_location, list[0].block_location);
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeks.txt");
        let opts = SeekOptions {
            pattern: SeekPattern::Random,
            rw_ratio: 0.5,
            save_file: Some(path.clone()),
            ..base(64, 4000)
        };
        let original = generate(&opts).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_rejects_malformed_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        std::fs::write(&path, "r 0 4\nx 4 4\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains(":2"));

        std::fs::write(&path, "r 0\n").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_range_smaller_than_request_is_rejected() {
        let opts = SeekOptions {
            range: 2,
            reqsize: 4,
            num_rw_ops: 1,
            ..Default::default()
        };
        assert!(generate(&opts).is_err());
    }
}
