//! Variant-specific event payloads

use crate::sockaddr::AddrData;
use serde::{Deserialize, Serialize};

/// Type bits of the `socket()` `type` argument, below the `SOCK_CLOEXEC`
/// and `SOCK_NONBLOCK` modifier flags.
pub const SOCK_TYPE_MASK: i32 = 0xf;

/// `socket()` arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketData {
    pub domain: i32,
    pub socket_type: i32,
    pub protocol: i32,
    pub sock_cloexec: bool,
    pub sock_nonblock: bool,
}

impl SocketData {
    pub fn new(domain: i32, raw_type: i32, protocol: i32) -> Self {
        Self {
            domain,
            socket_type: raw_type & SOCK_TYPE_MASK,
            protocol,
            sock_cloexec: raw_type & libc::SOCK_CLOEXEC != 0,
            sock_nonblock: raw_type & libc::SOCK_NONBLOCK != 0,
        }
    }
}

/// `bind()` address, with a marker for binds the library itself issued
/// to make the capture filter precise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindData {
    #[serde(flatten)]
    pub addr: AddrData,
    pub force_bind: bool,
}

/// `connect()` destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectData {
    #[serde(flatten)]
    pub addr: AddrData,
}

/// `shutdown()` direction, decoded from `how`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownData {
    pub shut_rd: bool,
    pub shut_wr: bool,
}

impl ShutdownData {
    pub fn from_how(how: i32) -> Self {
        Self {
            shut_rd: how == libc::SHUT_RD || how == libc::SHUT_RDWR,
            shut_wr: how == libc::SHUT_WR || how == libc::SHUT_RDWR,
        }
    }
}

/// `listen()` backlog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenData {
    pub backlog: i32,
}

/// `setsockopt()` level and option, with symbolic names when resolvable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetsockoptData {
    pub level: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_str: Option<String>,
    pub optname: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optname_str: Option<String>,
}

impl SetsockoptData {
    pub fn new(level: i32, optname: i32) -> Self {
        Self {
            level,
            level_str: level_name(level).map(str::to_owned),
            optname,
            optname_str: optname_name(level, optname).map(str::to_owned),
        }
    }
}

/// Scalar data transfer: `send`, `recv`, `sendto`, `recvfrom`, `write`,
/// `read`. `bytes` is the count the program asked for, not the count the
/// kernel moved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferData {
    pub bytes: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<TransferFlags>,

    /// Peer address, for the `*to`/`*from` variants.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<AddrData>,
}

impl TransferData {
    /// `write`/`read`: no flags, no address.
    pub fn plain(bytes: u64) -> Self {
        Self {
            bytes,
            flags: None,
            addr: None,
        }
    }

    pub fn send(bytes: u64, flags: i32) -> Self {
        Self {
            bytes,
            flags: Some(TransferFlags::Send(SendFlags::from_bits(flags))),
            addr: None,
        }
    }

    pub fn recv(bytes: u64, flags: i32) -> Self {
        Self {
            bytes,
            flags: Some(TransferFlags::Recv(RecvFlags::from_bits(flags))),
            addr: None,
        }
    }

    pub fn with_addr(mut self, addr: Option<AddrData>) -> Self {
        self.addr = addr;
        self
    }
}

/// Direction-specific decoded `MSG_*` flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransferFlags {
    Send(SendFlags),
    Recv(RecvFlags),
}

/// `MSG_*` bits meaningful on the send path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendFlags {
    pub msg_confirm: bool,
    pub msg_dontroute: bool,
    pub msg_dontwait: bool,
    pub msg_eor: bool,
    pub msg_more: bool,
    pub msg_nosignal: bool,
    pub msg_oob: bool,
}

impl SendFlags {
    pub fn from_bits(flags: i32) -> Self {
        Self {
            msg_confirm: flags & libc::MSG_CONFIRM != 0,
            msg_dontroute: flags & libc::MSG_DONTROUTE != 0,
            msg_dontwait: flags & libc::MSG_DONTWAIT != 0,
            msg_eor: flags & libc::MSG_EOR != 0,
            msg_more: flags & libc::MSG_MORE != 0,
            msg_nosignal: flags & libc::MSG_NOSIGNAL != 0,
            msg_oob: flags & libc::MSG_OOB != 0,
        }
    }
}

/// `MSG_*` bits meaningful on the receive path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecvFlags {
    pub msg_cmsg_cloexec: bool,
    pub msg_dontwait: bool,
    pub msg_errqueue: bool,
    pub msg_oob: bool,
    pub msg_peek: bool,
    pub msg_trunc: bool,
    pub msg_waitall: bool,
}

impl RecvFlags {
    pub fn from_bits(flags: i32) -> Self {
        Self {
            msg_cmsg_cloexec: flags & libc::MSG_CMSG_CLOEXEC != 0,
            msg_dontwait: flags & libc::MSG_DONTWAIT != 0,
            msg_errqueue: flags & libc::MSG_ERRQUEUE != 0,
            msg_oob: flags & libc::MSG_OOB != 0,
            msg_peek: flags & libc::MSG_PEEK != 0,
            msg_trunc: flags & libc::MSG_TRUNC != 0,
            msg_waitall: flags & libc::MSG_WAITALL != 0,
        }
    }
}

/// Scatter/gather list summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IovecData {
    pub iovec_count: usize,
    pub iovec_sizes: Vec<usize>,
}

impl IovecData {
    pub fn from_sizes(sizes: Vec<usize>) -> Self {
        Self {
            iovec_count: sizes.len(),
            iovec_sizes: sizes,
        }
    }

    /// Nominal transfer size of the whole list.
    pub fn total_bytes(&self) -> u64 {
        self.iovec_sizes.iter().map(|&n| n as u64).sum()
    }
}

/// `writev`/`readv` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectoredData {
    pub bytes: u64,
    pub iovec: IovecData,
}

impl VectoredData {
    pub fn from_sizes(sizes: Vec<usize>) -> Self {
        let iovec = IovecData::from_sizes(sizes);
        Self {
            bytes: iovec.total_bytes(),
            iovec,
        }
    }
}

/// `sendmsg`/`recvmsg` payload: msghdr summary plus flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgData {
    pub bytes: u64,

    #[serde(flatten)]
    pub flags: TransferFlags,

    /// Destination/source address from `msg_name`, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<AddrData>,

    /// Whether ancillary (control) data accompanied the message.
    pub control_data: bool,

    pub iovec: IovecData,
}

/// `close()` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseData {
    /// True when the event was synthesized by the library (stale
    /// descriptor replacement or the atexit sweep) rather than observed
    /// from the traced program.
    pub detected: bool,
}

/// Protocol name for a `setsockopt` level.
pub fn level_name(level: i32) -> Option<&'static str> {
    match level {
        libc::SOL_SOCKET => Some("sol_socket"),
        libc::IPPROTO_IP => Some("ip"),
        libc::IPPROTO_TCP => Some("tcp"),
        libc::IPPROTO_UDP => Some("udp"),
        libc::IPPROTO_IPV6 => Some("ipv6"),
        _ => None,
    }
}

/// Symbolic name of a socket option, for the levels and options the
/// library knows about.
pub fn optname_name(level: i32, optname: i32) -> Option<&'static str> {
    match level {
        libc::SOL_SOCKET => match optname {
            libc::SO_REUSEADDR => Some("SO_REUSEADDR"),
            libc::SO_REUSEPORT => Some("SO_REUSEPORT"),
            libc::SO_KEEPALIVE => Some("SO_KEEPALIVE"),
            libc::SO_LINGER => Some("SO_LINGER"),
            libc::SO_RCVBUF => Some("SO_RCVBUF"),
            libc::SO_SNDBUF => Some("SO_SNDBUF"),
            libc::SO_RCVTIMEO => Some("SO_RCVTIMEO"),
            libc::SO_SNDTIMEO => Some("SO_SNDTIMEO"),
            libc::SO_BROADCAST => Some("SO_BROADCAST"),
            libc::SO_OOBINLINE => Some("SO_OOBINLINE"),
            libc::SO_ERROR => Some("SO_ERROR"),
            _ => None,
        },
        libc::IPPROTO_TCP => match optname {
            libc::TCP_NODELAY => Some("TCP_NODELAY"),
            libc::TCP_MAXSEG => Some("TCP_MAXSEG"),
            libc::TCP_CORK => Some("TCP_CORK"),
            libc::TCP_KEEPIDLE => Some("TCP_KEEPIDLE"),
            libc::TCP_KEEPINTVL => Some("TCP_KEEPINTVL"),
            libc::TCP_KEEPCNT => Some("TCP_KEEPCNT"),
            libc::TCP_QUICKACK => Some("TCP_QUICKACK"),
            libc::TCP_USER_TIMEOUT => Some("TCP_USER_TIMEOUT"),
            libc::TCP_CONGESTION => Some("TCP_CONGESTION"),
            libc::TCP_FASTOPEN => Some("TCP_FASTOPEN"),
            _ => None,
        },
        libc::IPPROTO_IP => match optname {
            libc::IP_TOS => Some("IP_TOS"),
            libc::IP_TTL => Some("IP_TTL"),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_type_mask_and_modifiers() {
        let data = SocketData::new(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
        );
        assert_eq!(data.socket_type, libc::SOCK_STREAM);
        assert!(data.sock_cloexec);
        assert!(data.sock_nonblock);
    }

    #[test]
    fn test_shutdown_how_decoding() {
        let rd = ShutdownData::from_how(libc::SHUT_RD);
        assert!(rd.shut_rd && !rd.shut_wr);
        let wr = ShutdownData::from_how(libc::SHUT_WR);
        assert!(!wr.shut_rd && wr.shut_wr);
        let both = ShutdownData::from_how(libc::SHUT_RDWR);
        assert!(both.shut_rd && both.shut_wr);
    }

    #[test]
    fn test_send_flag_bits() {
        let flags = SendFlags::from_bits(libc::MSG_MORE | libc::MSG_NOSIGNAL);
        assert!(flags.msg_more);
        assert!(flags.msg_nosignal);
        assert!(!flags.msg_oob);
    }

    #[test]
    fn test_iovec_totals() {
        let vectored = VectoredData::from_sizes(vec![10, 20, 70]);
        assert_eq!(vectored.bytes, 100);
        assert_eq!(vectored.iovec.iovec_count, 3);
    }

    #[test]
    fn test_setsockopt_names() {
        let data = SetsockoptData::new(libc::IPPROTO_TCP, libc::TCP_NODELAY);
        assert_eq!(data.level_str.as_deref(), Some("tcp"));
        assert_eq!(data.optname_str.as_deref(), Some("TCP_NODELAY"));

        let unknown = SetsockoptData::new(9999, 1);
        assert!(unknown.level_str.is_none());
        assert!(unknown.optname_str.is_none());
    }
}
