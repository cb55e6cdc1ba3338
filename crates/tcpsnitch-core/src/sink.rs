//! On-disk artifacts: run directory allocation and the per-connection
//! JSON event file
//!
//! Each connection owns a single `events.json` holding one JSON array,
//! written append-only across flushes: event 0 opens the bracket, every
//! event is followed by a comma except the last one of the final flush,
//! which closes the array.

use crate::events::TcpEvent;
use crate::EVENTS_FILE;
use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("event serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pick the per-process run directory under `base`: the first integer
/// suffix with no existing directory, created world-writable so traced
/// programs running as any user can write their artifacts.
pub fn allocate_run_dir(base: &Path) -> std::io::Result<PathBuf> {
    for index in 0..u32::MAX {
        let path = base.join(index.to_string());
        match DirBuilder::new().mode(0o777).create(&path) {
            Ok(()) => return Ok(path),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
    Err(std::io::Error::other("run directory space exhausted"))
}

/// Append-only writer for one connection's `events.json`.
#[derive(Debug)]
pub struct EventSink {
    path: PathBuf,
}

impl EventSink {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(EVENTS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a batch of pending events.
    ///
    /// `events_total` is the connection's lifetime event count, used to
    /// recognize the last event of a final flush. The whole batch is
    /// serialized before the file is touched, so a failure leaves the
    /// file without a partial batch and the caller keeps the events
    /// queued for the next attempt.
    pub fn append<'a>(
        &self,
        events: impl IntoIterator<Item = &'a TcpEvent>,
        final_flush: bool,
        events_total: u64,
    ) -> Result<(), SinkError> {
        let mut batch = String::new();
        for event in events {
            if event.envelope.id == 0 {
                batch.push_str("[\n");
            }
            batch.push_str(&serde_json::to_string(event)?);
            if final_flush && event.envelope.id + 1 == events_total {
                batch.push('\n');
            } else {
                batch.push_str(",\n");
            }
        }
        if final_flush {
            batch.push(']');
        }
        if batch.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(batch.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CloseData, EventPayload, ListenData, TcpEvent};
    use tempfile::tempdir;

    fn event(id: u64, payload: EventPayload) -> TcpEvent {
        TcpEvent::new(id, 0, 0, payload)
    }

    #[test]
    fn test_allocate_run_dir_picks_first_free_integer() {
        let base = tempdir().unwrap();
        std::fs::create_dir(base.path().join("0")).unwrap();
        std::fs::create_dir(base.path().join("1")).unwrap();

        let dir = allocate_run_dir(base.path()).unwrap();
        assert_eq!(dir, base.path().join("2"));
        assert!(dir.is_dir());

        // A second process lands on the next free slot.
        assert_eq!(allocate_run_dir(base.path()).unwrap(), base.path().join("3"));
    }

    #[test]
    fn test_single_final_flush_is_a_valid_array() {
        let dir = tempdir().unwrap();
        let sink = EventSink::new(dir.path());
        let events = vec![
            event(0, EventPayload::Listen(ListenData { backlog: 10 })),
            event(1, EventPayload::Close(CloseData { detected: false })),
        ];
        sink.append(&events, true, 2).unwrap();

        let raw = std::fs::read_to_string(sink.path()).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["type"], "listen");
        assert_eq!(parsed[1]["type"], "close");
    }

    #[test]
    fn test_batched_flushes_concatenate_into_one_array() {
        let dir = tempdir().unwrap();
        let sink = EventSink::new(dir.path());

        let first = vec![
            event(0, EventPayload::Listen(ListenData { backlog: 1 })),
            event(1, EventPayload::Listen(ListenData { backlog: 2 })),
        ];
        sink.append(&first, false, 2).unwrap();

        let second = vec![event(2, EventPayload::Close(CloseData { detected: true }))];
        sink.append(&second, true, 3).unwrap();

        let raw = std::fs::read_to_string(sink.path()).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[2]["id"], 2);
    }

    #[test]
    fn test_failed_append_leaves_no_partial_batch() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone");
        let sink = EventSink::new(&missing);
        let events = vec![event(0, EventPayload::Close(CloseData { detected: true }))];
        assert!(sink.append(&events, true, 1).is_err());
        assert!(!sink.path().exists());
    }

    #[test]
    fn test_empty_non_final_batch_writes_nothing() {
        let dir = tempdir().unwrap();
        let sink = EventSink::new(dir.path());
        sink.append(std::iter::empty(), false, 0).unwrap();
        assert!(!sink.path().exists());
    }
}
