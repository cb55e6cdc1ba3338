//! Socket-call event types
//!
//! Every intercepted call becomes one immutable event: a common envelope
//! (id, timestamp, outcome) flattened together with a variant-specific
//! payload. The variant set is closed; there is no extension point.

pub mod payload;

pub use payload::*;

use crate::tcpinfo::TcpInfoSnapshot;
use serde::{Deserialize, Serialize};

/// Fields shared by every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Dense 0-based index within the connection. Never reused.
    pub id: u64,

    /// Seconds part of the wall-clock timestamp.
    pub timestamp_sec: i64,

    /// Microseconds part of the wall-clock timestamp.
    pub timestamp_usec: i64,

    /// Verbatim return value of the real call.
    pub return_value: i64,

    /// Whether the call succeeded, judged per variant.
    pub success: bool,

    /// OS error string, present only on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_str: Option<String>,
}

impl EventEnvelope {
    /// Stamp a new envelope for the event at index `id`.
    pub fn new(id: u64, return_value: i64, err: i32, success: bool) -> Self {
        let now = chrono::Utc::now();
        Self {
            id,
            timestamp_sec: now.timestamp(),
            timestamp_usec: i64::from(now.timestamp_subsec_micros()),
            return_value,
            success,
            error_str: if success {
                None
            } else {
                Some(std::io::Error::from_raw_os_error(err).to_string())
            },
        }
    }
}

/// One recorded call on one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpEvent {
    #[serde(flatten)]
    pub envelope: EventEnvelope,

    #[serde(flatten)]
    pub payload: EventPayload,
}

impl TcpEvent {
    /// Build an event, deriving `success` from the payload variant.
    pub fn new(id: u64, return_value: i64, err: i32, payload: EventPayload) -> Self {
        let success = payload.succeeded(return_value);
        Self {
            envelope: EventEnvelope::new(id, return_value, err, success),
            payload,
        }
    }
}

/// The closed set of event variants.
///
/// The serialized tag matches the intercepted function name, so the
/// `type` field of each JSON object reads `"socket"`, `"sendmsg"`,
/// `"tcp_info"` and so on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Socket(SocketData),
    Bind(BindData),
    Connect(ConnectData),
    Shutdown(ShutdownData),
    Listen(ListenData),
    Setsockopt(SetsockoptData),
    Send(TransferData),
    Recv(TransferData),
    Sendto(TransferData),
    Recvfrom(TransferData),
    Sendmsg(MsgData),
    Recvmsg(MsgData),
    Write(TransferData),
    Read(TransferData),
    Close(CloseData),
    Writev(VectoredData),
    Readv(VectoredData),
    TcpInfo(TcpInfoSnapshot),
}

impl EventPayload {
    /// The serialized tag of this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Socket(_) => "socket",
            EventPayload::Bind(_) => "bind",
            EventPayload::Connect(_) => "connect",
            EventPayload::Shutdown(_) => "shutdown",
            EventPayload::Listen(_) => "listen",
            EventPayload::Setsockopt(_) => "setsockopt",
            EventPayload::Send(_) => "send",
            EventPayload::Recv(_) => "recv",
            EventPayload::Sendto(_) => "sendto",
            EventPayload::Recvfrom(_) => "recvfrom",
            EventPayload::Sendmsg(_) => "sendmsg",
            EventPayload::Recvmsg(_) => "recvmsg",
            EventPayload::Write(_) => "write",
            EventPayload::Read(_) => "read",
            EventPayload::Close(_) => "close",
            EventPayload::Writev(_) => "writev",
            EventPayload::Readv(_) => "readv",
            EventPayload::TcpInfo(_) => "tcp_info",
        }
    }

    /// Judge the return value of the wrapped call for this variant.
    pub fn succeeded(&self, return_value: i64) -> bool {
        match self {
            // socket() yields a descriptor; anything nonnegative is one.
            EventPayload::Socket(_) => return_value >= 0,
            EventPayload::Close(_) => return_value == 0,
            _ => return_value != -1,
        }
    }

    /// Whether this is a kernel telemetry sample rather than an
    /// intercepted call. Samples never trigger further sampling.
    pub fn is_tcp_info(&self) -> bool {
        matches!(self, EventPayload::TcpInfo(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sockaddr::AddrData;

    #[test]
    fn test_serialized_shape_is_flat() {
        let ev = TcpEvent::new(
            0,
            7,
            0,
            EventPayload::Socket(SocketData {
                domain: libc::AF_INET,
                socket_type: libc::SOCK_STREAM,
                protocol: 0,
                sock_cloexec: false,
                sock_nonblock: true,
            }),
        );
        let json: serde_json::Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["id"], 0);
        assert_eq!(json["type"], "socket");
        assert_eq!(json["return_value"], 7);
        assert_eq!(json["success"], true);
        assert_eq!(json["sock_nonblock"], true);
        assert!(json.get("error_str").is_none());
        assert!(json.get("timestamp_sec").is_some());
    }

    #[test]
    fn test_variant_tags_match_call_names() {
        let cases: Vec<(EventPayload, &str)> = vec![
            (EventPayload::Close(CloseData { detected: true }), "close"),
            (
                EventPayload::TcpInfo(TcpInfoSnapshot::default()),
                "tcp_info",
            ),
            (
                EventPayload::Writev(VectoredData {
                    bytes: 0,
                    iovec: IovecData::from_sizes(vec![]),
                }),
                "writev",
            ),
        ];
        for (payload, tag) in cases {
            assert_eq!(payload.kind(), tag);
            let json = serde_json::to_value(TcpEvent::new(3, -1, libc::EBADF, payload)).unwrap();
            assert_eq!(json["type"], tag);
        }
    }

    #[test]
    fn test_failure_carries_error_string() {
        let ev = TcpEvent::new(
            2,
            -1,
            libc::ECONNREFUSED,
            EventPayload::Connect(ConnectData {
                addr: AddrData {
                    ip: "1.2.3.4".into(),
                    port: "80".into(),
                    hostname: None,
                    service: None,
                },
            }),
        );
        assert!(!ev.envelope.success);
        let msg = ev.envelope.error_str.unwrap();
        assert!(msg.contains("refused"), "unexpected error string: {msg}");
    }

    #[test]
    fn test_success_judgement_per_variant() {
        let socket = EventPayload::Socket(SocketData {
            domain: 0,
            socket_type: 0,
            protocol: 0,
            sock_cloexec: false,
            sock_nonblock: false,
        });
        assert!(socket.succeeded(0));
        assert!(!socket.succeeded(-1));

        let close = EventPayload::Close(CloseData { detected: false });
        assert!(close.succeeded(0));
        assert!(!close.succeeded(1));

        let listen = EventPayload::Listen(ListenData { backlog: 1 });
        assert!(listen.succeeded(0));
        assert!(!listen.succeeded(-1));
    }
}
