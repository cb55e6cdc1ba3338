//! The post-hook engine
//!
//! One `record_*` entry per intercepted call. Every recorder follows the
//! same shape: look the connection up under its slot lock, stamp a new
//! event with `id == events_total`, apply the variant's side effects,
//! append, flush when the threshold is reached - then, with the lock
//! released, echo the event in verbose mode and sample `tcp_info` when
//! both gates pass.
//!
//! The slot lock is never held across anything that can re-enter the
//! wrapped entry points: the forced bind, the capture setup and the
//! `tcp_info` probe all run between `with` calls.

use crate::config::Config;
use crate::conn::Connection;
use crate::events::{
    BindData, CloseData, ConnectData, EventPayload, ListenData, MsgData, SetsockoptData,
    ShutdownData, SocketData, TcpEvent, TransferData, TransferFlags, IovecData, RecvFlags,
    SendFlags, VectoredData,
};
use crate::sockaddr::{self, AddrData};
use crate::table::DescriptorTable;
use crate::{now_micros, tcpinfo, PCAP_FILE};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tcpsnitch_capture::CaptureSession;
use tracing::{debug, error, info, warn};

/// First port the forced bind tries; start of the kernel's default
/// ephemeral range (/proc/sys/net/ipv4/ip_local_port_range).
const FORCE_BIND_MIN_PORT: u16 = 32768;
/// Last port the forced bind tries.
const FORCE_BIND_MAX_PORT: u16 = 60999;

static TABLE: Lazy<DescriptorTable> = Lazy::new(DescriptorTable::new);
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(0);
static STATE: Lazy<RwLock<Option<Arc<RunState>>>> = Lazy::new(|| RwLock::new(None));

/// Everything the recorder needs that is fixed for one process run.
pub struct RunState {
    pub config: Config,

    /// Per-process output directory; `None` degrades to memory-only.
    pub run_dir: Option<PathBuf>,

    /// The library's private stdout (fd 3) for the verbose event echo.
    pub verbose_out: Option<Mutex<File>>,
}

/// Install the run state. Called once from init, and again by the child
/// after a fork reset.
pub fn install(state: RunState) {
    *STATE.write() = Some(Arc::new(state));
}

/// Drop all recorder state after a fork.
///
/// Runs in the single-threaded child. Connection records own nothing
/// that needs teardown (sinks reopen per flush, capture handles detach
/// on drop - their worker threads do not exist in the child), so plain
/// drops are safe. The id counter restarts at zero.
pub fn reset() {
    TABLE.reset();
    NEXT_CONN_ID.store(0, Ordering::SeqCst);
    *STATE.write() = None;
}

fn state() -> Option<Arc<RunState>> {
    STATE.read().clone()
}

/// socket(): create a fresh connection for the descriptor.
///
/// A still-present record for the same descriptor means its close was
/// never observed; it is retired first with a synthesized close.
pub fn record_socket(fd: RawFd, domain: i32, raw_type: i32, protocol: i32) {
    let Some(state) = state() else { return };
    if TABLE.contains(fd) {
        record_close(fd, 0, 0, true);
    }

    let id = NEXT_CONN_ID.fetch_add(1, Ordering::SeqCst);
    let mut conn = Connection::new(id, state.run_dir.as_deref());
    debug!("socket on connection {} (fd {})", id, fd);

    let event = TcpEvent::new(
        0,
        i64::from(fd),
        0,
        EventPayload::Socket(SocketData::new(domain, raw_type, protocol)),
    );
    conn.push(event.clone());
    let info_due = conn.tcp_info_due(&state.config, now_micros());
    if conn.flush_due(state.config.dump_every_events) {
        conn.flush_logged(false);
    }
    if let Err(err) = TABLE.put(fd, conn) {
        error!("could not register connection {}: {}", id, err);
        return;
    }
    post_append(fd, &state, &event, info_due);
}

pub fn record_bind(fd: RawFd, rv: i64, err: i32, addr: Option<SocketAddr>) {
    append(fd, rv, err, |conn| {
        let data = BindData {
            addr: endpoint(addr.as_ref()),
            force_bind: conn.force_bind,
        };
        if rv == 0 {
            conn.bound_addr = addr;
        }
        EventPayload::Bind(data)
    });
}

pub fn record_connect(fd: RawFd, rv: i64, err: i32, addr: Option<SocketAddr>) {
    append(fd, rv, err, |conn| {
        EventPayload::Connect(ConnectData {
            addr: endpoint(addr.as_ref()),
        })
    });

    // First event with a peer address: the capture can become precise
    // enough to start. EINPROGRESS is a nonblocking connect underway.
    let establishing = rv == 0 || (rv == -1 && err == libc::EINPROGRESS);
    if establishing {
        if let Some(peer) = addr {
            maybe_start_capture(fd, peer);
        }
    }
}

pub fn record_shutdown(fd: RawFd, rv: i64, err: i32, how: i32) {
    append(fd, rv, err, |_| {
        EventPayload::Shutdown(ShutdownData::from_how(how))
    });
}

pub fn record_listen(fd: RawFd, rv: i64, err: i32, backlog: i32) {
    append(fd, rv, err, |_| EventPayload::Listen(ListenData { backlog }));
}

pub fn record_setsockopt(fd: RawFd, rv: i64, err: i32, level: i32, optname: i32) {
    append(fd, rv, err, |_| {
        EventPayload::Setsockopt(SetsockoptData::new(level, optname))
    });
}

pub fn record_send(fd: RawFd, rv: i64, err: i32, bytes: usize, flags: i32) {
    append(fd, rv, err, |conn| {
        conn.bytes_sent += bytes as u64;
        EventPayload::Send(TransferData::send(bytes as u64, flags))
    });
}

pub fn record_recv(fd: RawFd, rv: i64, err: i32, bytes: usize, flags: i32) {
    append(fd, rv, err, |conn| {
        conn.bytes_received += bytes as u64;
        EventPayload::Recv(TransferData::recv(bytes as u64, flags))
    });
}

pub fn record_sendto(
    fd: RawFd,
    rv: i64,
    err: i32,
    bytes: usize,
    flags: i32,
    addr: Option<SocketAddr>,
) {
    append(fd, rv, err, |conn| {
        conn.bytes_sent += bytes as u64;
        let data = TransferData::send(bytes as u64, flags)
            .with_addr(addr.as_ref().map(AddrData::from_socket_addr));
        EventPayload::Sendto(data)
    });

    // An explicit destination also pins down the peer for capture.
    if rv != -1 {
        if let Some(peer) = addr {
            maybe_start_capture(fd, peer);
        }
    }
}

pub fn record_recvfrom(
    fd: RawFd,
    rv: i64,
    err: i32,
    bytes: usize,
    flags: i32,
    addr: Option<SocketAddr>,
) {
    append(fd, rv, err, |conn| {
        conn.bytes_received += bytes as u64;
        let data = TransferData::recv(bytes as u64, flags)
            .with_addr(addr.as_ref().map(AddrData::from_socket_addr));
        EventPayload::Recvfrom(data)
    });
}

/// Borrowed summary of a raw `msghdr`, decoded by the hook layer.
pub struct MsgView {
    pub addr: Option<SocketAddr>,
    pub control_data: bool,
    pub iov_sizes: Vec<usize>,
}

pub fn record_sendmsg(fd: RawFd, rv: i64, err: i32, msg: MsgView, flags: i32) {
    append(fd, rv, err, |conn| {
        let iovec = IovecData::from_sizes(msg.iov_sizes);
        let bytes = iovec.total_bytes();
        conn.bytes_sent += bytes;
        EventPayload::Sendmsg(MsgData {
            bytes,
            flags: TransferFlags::Send(SendFlags::from_bits(flags)),
            addr: msg.addr.as_ref().map(AddrData::from_socket_addr),
            control_data: msg.control_data,
            iovec,
        })
    });
}

pub fn record_recvmsg(fd: RawFd, rv: i64, err: i32, msg: MsgView, flags: i32) {
    append(fd, rv, err, |conn| {
        let iovec = IovecData::from_sizes(msg.iov_sizes);
        let bytes = iovec.total_bytes();
        conn.bytes_received += bytes;
        EventPayload::Recvmsg(MsgData {
            bytes,
            flags: TransferFlags::Recv(RecvFlags::from_bits(flags)),
            addr: msg.addr.as_ref().map(AddrData::from_socket_addr),
            control_data: msg.control_data,
            iovec,
        })
    });
}

pub fn record_write(fd: RawFd, rv: i64, err: i32, bytes: usize) {
    append(fd, rv, err, |conn| {
        conn.bytes_sent += bytes as u64;
        EventPayload::Write(TransferData::plain(bytes as u64))
    });
}

pub fn record_read(fd: RawFd, rv: i64, err: i32, bytes: usize) {
    append(fd, rv, err, |conn| {
        conn.bytes_received += bytes as u64;
        EventPayload::Read(TransferData::plain(bytes as u64))
    });
}

pub fn record_writev(fd: RawFd, rv: i64, err: i32, iov_sizes: Vec<usize>) {
    append(fd, rv, err, |conn| {
        let data = VectoredData::from_sizes(iov_sizes);
        conn.bytes_sent += data.bytes;
        EventPayload::Writev(data)
    });
}

pub fn record_readv(fd: RawFd, rv: i64, err: i32, iov_sizes: Vec<usize>) {
    append(fd, rv, err, |conn| {
        let data = VectoredData::from_sizes(iov_sizes);
        conn.bytes_received += data.bytes;
        EventPayload::Readv(data)
    });
}

/// close(): terminal path. Removes the record, stops the capture after a
/// 2 x rtt linger, appends the closing event and final-flushes the file.
///
/// `synthesized` marks closes the library invented (stale descriptor
/// reuse, atexit sweep) rather than observed.
pub fn record_close(fd: RawFd, rv: i64, err: i32, synthesized: bool) {
    let Some(state) = state() else { return };
    let Some(mut conn) = TABLE.remove(fd) else { return };
    debug!("close on connection {} (fd {})", conn.id, fd);

    let event = TcpEvent::new(
        conn.events_total,
        rv,
        err,
        EventPayload::Close(CloseData {
            detected: synthesized,
        }),
    );
    if let Some(capture) = conn.capture.take() {
        let linger = Duration::from_micros(u64::from(conn.rtt_micros) * 2);
        capture.stop(linger);
    }
    conn.push(event.clone());
    conn.flush_logged(true);
    echo_event(&state, &event);
}

/// atexit sweep: retire every connection still live so each file ends in
/// a valid JSON array.
pub fn sweep_unclosed() {
    info!("closing {} descriptor slots before exit", TABLE.size());
    for fd in 0..TABLE.size() as RawFd {
        if TABLE.contains(fd) {
            record_close(fd, 0, 0, true);
        }
    }
}

/// Shared append path for all non-terminal, non-creating variants.
fn append(fd: RawFd, rv: i64, err: i32, build: impl FnOnce(&mut Connection) -> EventPayload) {
    let Some(state) = state() else { return };
    let now = now_micros();
    let appended = TABLE.with(fd, |conn| {
        let payload = build(conn);
        let event = TcpEvent::new(conn.events_total, rv, err, payload);
        debug!("{} on connection {}", event.payload.kind(), conn.id);
        conn.push(event.clone());
        let info_due = !event.payload.is_tcp_info() && conn.tcp_info_due(&state.config, now);
        if conn.flush_due(state.config.dump_every_events) {
            conn.flush_logged(false);
        }
        (event, info_due)
    });
    if let Some((event, info_due)) = appended {
        post_append(fd, &state, &event, info_due);
    }
}

/// Lock-free tail of every append: verbose echo, then the tcp_info probe
/// (which re-enters `append`, but can never become due again there).
fn post_append(fd: RawFd, state: &RunState, event: &TcpEvent, info_due: bool) {
    echo_event(state, event);
    if info_due {
        let (rv, err, snapshot) = tcpinfo::query(fd);
        append(fd, i64::from(rv), err, |conn| {
            conn.apply_tcp_info(&snapshot, now_micros());
            EventPayload::TcpInfo(snapshot)
        });
    }
}

/// Verbose mode: one JSON line per event on the library stdout.
fn echo_event(state: &RunState, event: &TcpEvent) {
    let Some(out) = &state.verbose_out else { return };
    if let Ok(line) = serde_json::to_string(event) {
        let _ = writeln!(out.lock(), "{}", line);
    }
}

fn endpoint(addr: Option<&SocketAddr>) -> AddrData {
    match addr {
        Some(addr) => AddrData::from_socket_addr(addr),
        // Non-internet or truncated address: keep the event, not the peer.
        None => AddrData {
            ip: String::new(),
            port: String::new(),
            hostname: None,
            service: None,
        },
    }
}

/// Start the packet capture for `fd` unless one is already running.
///
/// Ensures a bound local address first - a precise filter needs the
/// local port. The slot lock is dropped around the forced bind because
/// `bind()` resolves to the interposed wrapper and re-enters the
/// recorder (which also means the forced bind is recorded like any
/// other, flagged `force_bind`).
fn maybe_start_capture(fd: RawFd, peer: SocketAddr) {
    let Some(state) = state() else { return };
    if !state.config.capture_enabled {
        return;
    }
    let Some((id, directory, bound, running)) = TABLE.with(fd, |conn| {
        (
            conn.id,
            conn.directory.clone(),
            conn.bound_addr,
            conn.capture.is_some(),
        )
    }) else {
        return;
    };
    if running {
        return;
    }
    let Some(directory) = directory else { return };

    let local = match bound {
        Some(addr) => Some(addr),
        None => {
            TABLE.with(fd, |conn| conn.force_bind = true);
            match force_bind(fd, peer.is_ipv6()) {
                Ok(()) => TABLE.with(fd, |conn| conn.bound_addr).flatten(),
                Err(err) => {
                    info!(
                        "connection {}: forced bind failed ({}), filtering on peer only",
                        id, err
                    );
                    None
                }
            }
        }
    };

    let filter = tcpsnitch_capture::bpf_filter(&peer, local.as_ref());
    let path = directory.join(PCAP_FILE);
    match CaptureSession::start(state.config.capture_device.as_deref(), &filter, &path) {
        Ok(session) => {
            let mut session = Some(session);
            let stored = TABLE.with(fd, |conn| {
                if conn.capture.is_none() {
                    conn.capture = session.take();
                    true
                } else {
                    false
                }
            });
            // The connection may have been closed while the handle was
            // opening; a leftover session is stopped right away.
            if stored != Some(true) {
                if let Some(session) = session {
                    session.stop(Duration::ZERO);
                }
            }
        }
        Err(err) => warn!("connection {}: capture disabled: {}", id, err),
    }
}

/// Bind `fd` to the first free port of the ephemeral range.
///
/// Calls through the interposed `bind` wrapper on purpose; each attempt
/// is an observable event and a success sets `bound_addr` via the
/// regular bind post-hook.
fn force_bind(fd: RawFd, ipv6: bool) -> std::io::Result<()> {
    for port in FORCE_BIND_MIN_PORT..=FORCE_BIND_MAX_PORT {
        let addr = if ipv6 {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
        };
        let (storage, len) = sockaddr::to_raw(&addr);
        let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EADDRINUSE) {
            return Err(err);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        "ephemeral port range exhausted",
    ))
}
