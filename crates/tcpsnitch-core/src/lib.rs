//! tcpsnitch core - connection tracking and event recording
//!
//! This crate holds the in-process state of the interception engine:
//!
//! - **Config**: read-once snapshot of the launcher-provided options
//! - **Events**: the closed set of socket-call event types and their
//!   JSON envelope
//! - **Table**: the process-wide descriptor -> connection mapping
//! - **Conn**: per-connection record, pending event list and counters
//! - **Sink**: the per-connection `events.json` array file
//! - **Recorder**: the post-hook engine invoked by the preload wrappers
//! - **Tcpinfo**: kernel `TCP_INFO` sampling
//! - **Logging**: `tracing` setup for the library's own log file
//!
//! Nothing in here ever surfaces an error to the traced program; all
//! failures are logged and degrade to dropping the affected artifact.

pub mod config;
pub mod conn;
pub mod events;
pub mod logging;
pub mod recorder;
pub mod sink;
pub mod sockaddr;
pub mod table;
pub mod tcpinfo;

pub use config::Config;
pub use conn::Connection;
pub use events::{EventEnvelope, EventPayload, TcpEvent};
pub use sockaddr::AddrData;
pub use table::DescriptorTable;
pub use tcpinfo::TcpInfoSnapshot;

/// Library version, recorded for the launcher's metadata sidecar.
pub const SNITCH_VERSION: &str = env!("CARGO_PKG_VERSION");

/// File name of the per-connection event log, inside `<run_dir>/<id>/`.
pub const EVENTS_FILE: &str = "events.json";

/// File name of the per-connection packet trace, inside `<run_dir>/<id>/`.
pub const PCAP_FILE: &str = "capture.pcap";

/// File name of the library's own log, inside `<run_dir>/`.
pub const MAIN_LOG_FILE: &str = "main.log";

/// Current time as microseconds since the Unix epoch.
pub(crate) fn now_micros() -> i64 {
    let now = chrono::Utc::now();
    now.timestamp() * 1_000_000 + i64::from(now.timestamp_subsec_micros())
}
