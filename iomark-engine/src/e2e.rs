//! End-to-end copy channel.
//!
//! A source target pairs with a destination target over TCP, one
//! connection per worker pair. After each local read the source worker
//! sends a framed message; the destination worker reads the header, then
//! exactly the payload, and writes it at the carried byte offset. A
//! zero-length EOF message ends the stream.
//!
//! The header magic is verified on every message. A byte-swapped magic
//! means the peer wrote with foreign endianness; either way the
//! connection is closed and the pair fails.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use log::warn;

use crate::error::EngineError;
use crate::nclk::nclk_now;
use crate::util::lock;

pub const E2E_MAGIC: u32 = 0xE2ED_A7A5;
pub const E2E_HEADER_BYTES: usize = 48;
/// Largest single send/recv call; bigger payloads are looped.
pub const MAX_SINGLE_XMIT: usize = 1 << 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E2eHeader {
    pub magic: u32,
    pub sender_worker_id: i32,
    /// Global sequence across all source workers.
    pub sequence: i64,
    pub send_time: u64,
    /// Stamped by the receiver on arrival.
    pub recv_time: u64,
    /// Byte offset in the destination target.
    pub location: i64,
    /// Payload bytes following the header; 0 marks end of stream.
    pub length: i64,
}

impl E2eHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.magic);
        buf.put_i32_le(self.sender_worker_id);
        buf.put_i64_le(self.sequence);
        buf.put_u64_le(self.send_time);
        buf.put_u64_le(self.recv_time);
        buf.put_i64_le(self.location);
        buf.put_i64_le(self.length);
    }

    pub fn decode(raw: &[u8; E2E_HEADER_BYTES]) -> Result<Self, EngineError> {
        let mut buf = &raw[..];
        let magic = buf.get_u32_le();
        if magic != E2E_MAGIC {
            let reason = if magic == E2E_MAGIC.swap_bytes() {
                "peer endianness mismatch"
            } else {
                "bad magic"
            };
            return Err(EngineError::Protocol(format!(
                "e2e header {reason}: 0x{magic:08X}"
            )));
        }
        let header = Self {
            magic,
            sender_worker_id: buf.get_i32_le(),
            sequence: buf.get_i64_le(),
            send_time: buf.get_u64_le(),
            recv_time: buf.get_u64_le(),
            location: buf.get_i64_le(),
            length: buf.get_i64_le(),
        };
        if header.length < 0 {
            return Err(EngineError::Protocol(format!(
                "e2e header carries negative length {}",
                header.length
            )));
        }
        Ok(header)
    }
}

/// One `(host, base_port, port_count)` address entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct E2eAddressEntry {
    pub host: String,
    pub base_port: u16,
    pub port_count: u16,
}

#[derive(Debug, Clone, Default)]
pub struct E2eAddressTable {
    pub entries: Vec<E2eAddressEntry>,
}

impl E2eAddressTable {
    pub fn single(host: impl Into<String>, base_port: u16, port_count: u16) -> Self {
        Self {
            entries: vec![E2eAddressEntry {
                host: host.into(),
                base_port,
                port_count: port_count.max(1),
            }],
        }
    }

    /// Address for worker `w`: round-robin over the host entries, then
    /// `base_port + (w mod port_count)` within the entry.
    pub fn address_for(&self, worker: usize) -> Result<(String, u16), EngineError> {
        if self.entries.is_empty() {
            return Err(EngineError::Config("e2e address table is empty".into()));
        }
        let entry = &self.entries[worker % self.entries.len()];
        let port = entry.base_port + (worker as u16 % entry.port_count.max(1));
        Ok((entry.host.clone(), port))
    }
}

/// Socket options shared by both sides.
#[derive(Debug, Clone)]
pub struct E2eSocketOptions {
    pub nodelay: bool,
    /// SO_LINGER seconds, when set.
    pub linger: Option<i32>,
    pub connect_retries: u32,
}

impl Default for E2eSocketOptions {
    fn default() -> Self {
        Self {
            nodelay: false,
            linger: None,
            connect_retries: 50,
        }
    }
}

fn apply_socket_options(stream: &TcpStream, opts: &E2eSocketOptions) -> std::io::Result<()> {
    stream.set_nodelay(opts.nodelay)?;
    if let Some(secs) = opts.linger {
        set_linger(stream, secs)?;
    }
    Ok(())
}

fn set_linger(stream: &TcpStream, secs: i32) -> std::io::Result<()> {
    let ling = libc::linger {
        l_onoff: 1,
        l_linger: secs,
    };
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &ling as *const libc::linger as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Source side of one worker pair.
pub struct E2eSender {
    stream: TcpStream,
    worker_id: i32,
}

impl E2eSender {
    /// Connect to the paired destination worker, retrying while the
    /// listener comes up.
    pub fn connect(
        table: &E2eAddressTable,
        opts: &E2eSocketOptions,
        worker: usize,
    ) -> Result<Self, EngineError> {
        let (host, port) = table.address_for(worker)?;
        let addr = format!("{host}:{port}");
        let mut last_err = None;
        for _ in 0..=opts.connect_retries {
            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    apply_socket_options(&stream, opts).map_err(|e| EngineError::Resource {
                        what: format!("e2e socket options on {addr}"),
                        source: e,
                    })?;
                    return Ok(Self {
                        stream,
                        worker_id: worker as i32,
                    });
                }
                Err(e) => {
                    last_err = Some(e);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
        Err(EngineError::Resource {
            what: format!("e2e connect to {addr}"),
            source: last_err
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no attempt")),
        })
    }

    /// Send one framed block. The header's send_time should already be
    /// stamped; payload length must equal `header.length`.
    pub fn send(&mut self, header: &E2eHeader, payload: &[u8]) -> std::io::Result<()> {
        debug_assert_eq!(header.length as usize, payload.len());
        let mut buf = BytesMut::with_capacity(E2E_HEADER_BYTES);
        header.encode(&mut buf);
        self.stream.write_all(&buf)?;
        for chunk in payload.chunks(MAX_SINGLE_XMIT) {
            self.stream.write_all(chunk)?;
        }
        Ok(())
    }

    /// Send the end-of-stream marker.
    pub fn send_eof(&mut self, sequence: i64) -> std::io::Result<()> {
        let header = E2eHeader {
            magic: E2E_MAGIC,
            sender_worker_id: self.worker_id,
            sequence,
            send_time: nclk_now(),
            recv_time: 0,
            location: -1,
            length: 0,
        };
        self.send(&header, &[])
    }
}

/// Destination side of one worker pair.
pub struct E2eReceiver {
    stream: TcpStream,
}

/// One received message, or end of stream.
pub enum E2eRecv {
    Block(E2eHeader),
    Eof(E2eHeader),
}

impl E2eReceiver {
    pub fn new(stream: TcpStream, opts: &E2eSocketOptions) -> Result<Self, EngineError> {
        apply_socket_options(&stream, opts).map_err(|e| EngineError::Resource {
            what: "e2e receiver socket options".into(),
            source: e,
        })?;
        Ok(Self { stream })
    }

    /// Read one message. The payload lands in `payload`, which must hold
    /// at least `header.length` bytes. `recv_time` is stamped here.
    pub fn recv(&mut self, payload: &mut [u8]) -> Result<E2eRecv, EngineError> {
        let mut raw = [0u8; E2E_HEADER_BYTES];
        self.stream
            .read_exact(&mut raw)
            .map_err(|e| EngineError::Protocol(format!("e2e header read: {e}")))?;
        let mut header = E2eHeader::decode(&raw)?;
        header.recv_time = nclk_now();
        if header.length == 0 {
            return Ok(E2eRecv::Eof(header));
        }
        let want = header.length as usize;
        if want > payload.len() {
            return Err(EngineError::Protocol(format!(
                "e2e payload of {want} bytes exceeds worker buffer of {}",
                payload.len()
            )));
        }
        let mut read = 0;
        while read < want {
            let chunk = (want - read).min(MAX_SINGLE_XMIT);
            let n = self
                .stream
                .read(&mut payload[read..read + chunk])
                .map_err(|e| EngineError::Protocol(format!("e2e payload read: {e}")))?;
            if n == 0 {
                return Err(EngineError::Protocol(format!(
                    "e2e connection closed mid-payload at {read}/{want} bytes"
                )));
            }
            read += n;
        }
        Ok(E2eRecv::Block(header))
    }
}

/// Bind the listener for destination worker `w`.
pub fn bind_for_worker(
    table: &E2eAddressTable,
    worker: usize,
) -> Result<TcpListener, EngineError> {
    let (host, port) = table.address_for(worker)?;
    let addr = format!("{host}:{port}");
    TcpListener::bind(&addr).map_err(|e| EngineError::Resource {
        what: format!("e2e bind {addr}"),
        source: e,
    })
}

/// Accept one connection, polling `cancelled` while waiting so a
/// stopped run does not park forever on a peer that never arrives.
pub fn accept_with_abort(
    listener: &TcpListener,
    cancelled: impl Fn() -> bool,
) -> Result<Option<TcpStream>, EngineError> {
    listener.set_nonblocking(true).map_err(|e| EngineError::Resource {
        what: "e2e listener nonblocking".into(),
        source: e,
    })?;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).map_err(|e| EngineError::Resource {
                    what: "e2e accepted socket blocking".into(),
                    source: e,
                })?;
                return Ok(Some(stream));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if cancelled() {
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                warn!("e2e accept failed: {e}");
                return Err(EngineError::Resource {
                    what: "e2e accept".into(),
                    source: e,
                });
            }
        }
    }
}

/// Serial-delivery gate shared by all destination workers of a target.
/// A worker holding sequence `s` parks until every earlier sequence has
/// been delivered; out-of-order arrivals wait in their workers, which
/// bounds buffered messages by the queue depth.
#[derive(Debug)]
pub struct SequenceGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Debug)]
struct GateState {
    next: i64,
    poisoned: bool,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                next: 0,
                poisoned: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Block until `sequence` is next. Returns false on abort or after a
    /// peer poisoned the gate; the sequence will never come.
    pub fn await_turn(&self, sequence: i64, abort: &AtomicBool) -> bool {
        let mut st = lock(&self.state);
        while st.next != sequence {
            if st.poisoned || abort.load(Ordering::Acquire) {
                return false;
            }
            let (guard, _timeout) = self
                .cond
                .wait_timeout(st, Duration::from_millis(100))
                .unwrap_or_else(|e| e.into_inner());
            st = guard;
        }
        !st.poisoned
    }

    /// Mark `sequence` delivered and wake the waiters.
    pub fn advance(&self, sequence: i64) {
        let mut st = lock(&self.state);
        if st.next == sequence {
            st.next = sequence + 1;
        }
        self.cond.notify_all();
    }

    /// A worker that stops consuming leaves a hole in the sequence
    /// space; poisoning frees everyone still waiting on it.
    pub fn poison(&self) {
        lock(&self.state).poisoned = true;
        self.cond.notify_all();
    }
}

impl Default for SequenceGate {
    fn default() -> Self {
        Self::new()
    }
}
