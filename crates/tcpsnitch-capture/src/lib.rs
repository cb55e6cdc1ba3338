//! Per-connection packet capture
//!
//! Each tracked connection may own one capture session: a live pcap
//! handle with a connection-specific BPF filter, dumped to the
//! connection's `capture.pcap` by a dedicated worker thread.
//!
//! Capture is strictly best-effort. Every failure here disables the
//! trace for one connection and nothing else.

pub mod filter;
pub mod session;

pub use filter::bpf_filter;
pub use session::{CaptureError, CaptureSession};
