//! The unit of work handed from a scheduler to a worker.

use crate::nclk::Nclk;

/// What the worker should do with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Perform one I/O operation.
    Io,
    /// Close and reopen the target (per-pass reopen/recreate).
    Reopen,
    /// Stop working and exit.
    Stop,
    /// Send an end-of-stream marker to the destination (e2e source).
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Read,
    Write,
    Noop,
    Eof,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Read => "READ",
            OpType::Write => "WRITE",
            OpType::Noop => "NOOP",
            OpType::Eof => "EOF",
        }
    }
}

/// One dispatched operation. Status and errno slots are filled in by the
/// worker as the I/O completes.
#[derive(Debug, Clone)]
pub struct Task {
    pub kind: TaskKind,
    pub op_type: OpType,
    pub byte_offset: i64,
    pub xfer_size: usize,
    pub op_number: i64,
    /// Global sequence number when part of an end-to-end stream.
    pub e2e_sequence: i64,
    /// Earliest time the I/O may be issued, or 0.
    pub time_to_issue: Nclk,
    /// Bytes transferred, or -1 on failure.
    pub io_status: i64,
    pub io_errno: i32,
    /// Read back and check the data pattern after the op.
    pub verify: bool,
}

impl Task {
    pub fn io(op_type: OpType, byte_offset: i64, xfer_size: usize, op_number: i64) -> Self {
        Self {
            kind: TaskKind::Io,
            op_type,
            byte_offset,
            xfer_size,
            op_number,
            e2e_sequence: op_number,
            time_to_issue: 0,
            io_status: 0,
            io_errno: 0,
            verify: false,
        }
    }

    pub fn stop() -> Self {
        Self {
            kind: TaskKind::Stop,
            ..Self::io(OpType::Noop, 0, 0, -1)
        }
    }

    pub fn reopen() -> Self {
        Self {
            kind: TaskKind::Reopen,
            ..Self::io(OpType::Noop, 0, 0, -1)
        }
    }

    pub fn eof(sequence: i64) -> Self {
        let mut t = Self::io(OpType::Eof, 0, 0, -1);
        t.kind = TaskKind::Eof;
        t.e2e_sequence = sequence;
        t
    }
}
