//! Per-connection record
//!
//! One `Connection` exists per live tracked descriptor. It owns the
//! pending event FIFO, the cumulative transfer counters, the bookmarks
//! driving the `tcp_info` gates, the bound-address state used by the
//! capture filter, and the capture session itself.
//!
//! All mutation happens under the owning descriptor-table slot lock.

use crate::config::Config;
use crate::events::TcpEvent;
use crate::sink::{EventSink, SinkError};
use crate::tcpinfo::TcpInfoSnapshot;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tcpsnitch_capture::CaptureSession;
use tracing::error;

pub struct Connection {
    /// Process-global monotone connection id.
    pub id: u64,

    /// `<run_dir>/<id>/`, owning the connection's artifacts. `None` in
    /// degraded mode.
    pub directory: Option<PathBuf>,

    sink: Option<EventSink>,
    pending: VecDeque<TcpEvent>,

    /// Lifetime event count; keeps growing across flushes.
    pub events_total: u64,

    /// Events already written to `events.json`.
    pub last_flushed: u64,

    /// Cumulative nominal bytes across all send-family events.
    pub bytes_sent: u64,

    /// Cumulative nominal bytes across all receive-family events.
    pub bytes_received: u64,

    /// Transfer total at the last `tcp_info` sample.
    pub last_info_dump_bytes: u64,

    /// Wall clock (µs since epoch) at the last `tcp_info` sample.
    pub last_info_dump_micros: i64,

    /// Local address once the socket is bound.
    pub bound_addr: Option<SocketAddr>,

    /// Whether the library issued the bind itself.
    pub force_bind: bool,

    /// Running packet capture, when enabled and started.
    pub capture: Option<CaptureSession>,

    /// Most recent kernel round-trip estimate, microseconds.
    pub rtt_micros: u32,
}

impl Connection {
    /// Create the record and materialize its directory under `base`.
    /// Directory failures degrade the connection to in-memory only.
    pub fn new(id: u64, base: Option<&Path>) -> Self {
        let directory = base.and_then(|base| {
            let dir = base.join(id.to_string());
            match std::fs::create_dir(&dir) {
                Ok(()) => Some(dir),
                Err(err) => {
                    error!("could not create {}: {}", dir.display(), err);
                    None
                }
            }
        });
        let sink = directory.as_deref().map(EventSink::new);
        Self {
            id,
            directory,
            sink,
            pending: VecDeque::new(),
            events_total: 0,
            last_flushed: 0,
            bytes_sent: 0,
            bytes_received: 0,
            last_info_dump_bytes: 0,
            last_info_dump_micros: 0,
            bound_addr: None,
            force_bind: false,
            capture: None,
            rtt_micros: 0,
        }
    }

    /// Append an event. The caller must have stamped it with
    /// `id == events_total`.
    pub fn push(&mut self, event: TcpEvent) {
        debug_assert_eq!(event.envelope.id, self.events_total);
        self.pending.push_back(event);
        self.events_total += 1;
    }

    /// Events appended but not yet on disk.
    pub fn pending_count(&self) -> u64 {
        self.events_total - self.last_flushed
    }

    /// Whether the JSON flush threshold has been reached.
    pub fn flush_due(&self, dump_every_events: u64) -> bool {
        self.pending_count() >= dump_every_events
    }

    /// Whether both `tcp_info` gates pass. A gate set to 0 is disabled.
    pub fn tcp_info_due(&self, config: &Config, now_micros: i64) -> bool {
        if config.dump_every_micros > 0
            && now_micros - self.last_info_dump_micros < config.dump_every_micros
        {
            return false;
        }
        if config.dump_every_bytes > 0 {
            let transferred = self.bytes_sent + self.bytes_received;
            if transferred - self.last_info_dump_bytes < config.dump_every_bytes {
                return false;
            }
        }
        true
    }

    /// Record a `tcp_info` sample's side effects: reset both gate
    /// bookmarks and remember the round-trip estimate.
    pub fn apply_tcp_info(&mut self, info: &TcpInfoSnapshot, now_micros: i64) {
        self.last_info_dump_bytes = self.bytes_sent + self.bytes_received;
        self.last_info_dump_micros = now_micros;
        self.rtt_micros = info.rtt;
    }

    /// Write pending events to `events.json` and drain them.
    ///
    /// On failure the events stay queued and the next flush retries
    /// implicitly; the connection keeps collecting either way.
    pub fn flush(&mut self, final_flush: bool) -> Result<(), SinkError> {
        let Some(sink) = &self.sink else {
            // Degraded mode: drop instead of growing without bound.
            self.pending.clear();
            self.last_flushed = self.events_total;
            return Ok(());
        };
        sink.append(&self.pending, final_flush, self.events_total)?;
        self.pending.clear();
        self.last_flushed = self.events_total;
        Ok(())
    }

    /// Flush and log on failure, for the in-lock fast path.
    pub fn flush_logged(&mut self, final_flush: bool) {
        if let Err(err) = self.flush(final_flush) {
            error!("connection {}: flush failed: {}", self.id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CloseData, EventPayload, TcpEvent, TransferData};
    use tempfile::tempdir;

    fn push_event(conn: &mut Connection, payload: EventPayload) {
        let event = TcpEvent::new(conn.events_total, 0, 0, payload);
        conn.push(event);
    }

    #[test]
    fn test_ids_are_dense_and_counters_monotone() {
        let mut conn = Connection::new(0, None);
        for bytes in [10, 20, 30] {
            push_event(&mut conn, EventPayload::Send(TransferData::send(bytes, 0)));
            conn.bytes_sent += bytes;
        }
        assert_eq!(conn.events_total, 3);
        assert_eq!(conn.bytes_sent, 60);
        assert_eq!(conn.bytes_received, 0);
    }

    #[test]
    fn test_directory_and_final_flush() {
        let base = tempdir().unwrap();
        let mut conn = Connection::new(4, Some(base.path()));
        assert_eq!(conn.directory.as_deref(), Some(base.path().join("4").as_path()));

        push_event(&mut conn, EventPayload::Write(TransferData::plain(100)));
        push_event(&mut conn, EventPayload::Close(CloseData { detected: false }));
        conn.flush(true).unwrap();
        assert_eq!(conn.pending_count(), 0);

        let raw = std::fs::read_to_string(base.path().join("4").join(crate::EVENTS_FILE)).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["type"], "write");
        assert_eq!(parsed[1]["type"], "close");
    }

    #[test]
    fn test_flush_due_threshold() {
        let mut conn = Connection::new(0, None);
        for _ in 0..3 {
            push_event(&mut conn, EventPayload::Read(TransferData::plain(1)));
        }
        assert!(!conn.flush_due(4));
        assert!(conn.flush_due(3));
        conn.flush(false).unwrap();
        assert!(!conn.flush_due(1));
    }

    #[test]
    fn test_tcp_info_gates() {
        let config = Config {
            dump_every_bytes: 1024,
            dump_every_micros: 0,
            ..Config::default()
        };
        let mut conn = Connection::new(0, None);

        conn.bytes_sent = 500;
        assert!(!conn.tcp_info_due(&config, 10));

        conn.bytes_sent = 1100;
        assert!(conn.tcp_info_due(&config, 20));

        conn.apply_tcp_info(&TcpInfoSnapshot::default(), 20);
        assert_eq!(conn.last_info_dump_bytes, 1100);

        conn.bytes_sent = 1600;
        assert!(!conn.tcp_info_due(&config, 30));
    }

    #[test]
    fn test_tcp_info_time_gate() {
        let config = Config {
            dump_every_bytes: 0,
            dump_every_micros: 1000,
            ..Config::default()
        };
        let mut conn = Connection::new(0, None);
        conn.apply_tcp_info(&TcpInfoSnapshot::default(), 5000);
        assert!(!conn.tcp_info_due(&config, 5500));
        assert!(conn.tcp_info_due(&config, 6000));
    }

    #[test]
    fn test_both_gates_disabled_always_due() {
        let config = Config {
            dump_every_bytes: 0,
            dump_every_micros: 0,
            ..Config::default()
        };
        let conn = Connection::new(0, None);
        assert!(conn.tcp_info_due(&config, 0));
    }

    #[test]
    fn test_rtt_tracks_latest_sample() {
        let mut conn = Connection::new(0, None);
        let info = TcpInfoSnapshot {
            rtt: 25_000,
            ..TcpInfoSnapshot::default()
        };
        conn.apply_tcp_info(&info, 0);
        assert_eq!(conn.rtt_micros, 25_000);
    }

    #[test]
    fn test_failed_flush_keeps_events_queued() {
        let base = tempdir().unwrap();
        let mut conn = Connection::new(0, Some(base.path()));
        push_event(&mut conn, EventPayload::Write(TransferData::plain(1)));

        // Removing the directory makes the append fail.
        std::fs::remove_dir_all(base.path().join("0")).unwrap();
        assert!(conn.flush(false).is_err());
        assert_eq!(conn.pending_count(), 1);

        // Recreating it lets the retry go through with correct framing.
        std::fs::create_dir(base.path().join("0")).unwrap();
        push_event(&mut conn, EventPayload::Close(CloseData { detected: true }));
        conn.flush(true).unwrap();
        let raw = std::fs::read_to_string(base.path().join("0").join(crate::EVENTS_FILE)).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
    }
}
