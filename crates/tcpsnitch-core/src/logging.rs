//! Library logging
//!
//! Two `tracing` fmt layers: one into `<run_dir>/main.log`, one onto the
//! library's private stderr. The launcher hands us descriptors 3 and 4
//! as our own stdout/stderr so we never mix output into the traced
//! program's streams; when fd 4 is absent we fall back to the process
//! stderr.
//!
//! The global subscriber can only be installed once per process, but a
//! forked child must log into its own fresh run directory. The file
//! writer therefore goes through a swappable global target that
//! [`reset`] clears and the next [`init`] re-points.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;
use std::sync::Once;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// Launcher-provided private stdout of the library.
pub const STDOUT_FD: RawFd = 3;
/// Launcher-provided private stderr of the library.
pub const STDERR_FD: RawFd = 4;

static FILE_TARGET: Lazy<Mutex<Option<File>>> = Lazy::new(|| Mutex::new(None));
static STDERR_TARGET: Lazy<Mutex<Option<File>>> = Lazy::new(|| Mutex::new(None));
static INSTALL: Once = Once::new();

/// Map the launcher's 0..5 verbosity to a `tracing` filter.
pub fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        4 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Duplicate one of the launcher-provided descriptors into an owned
/// stream. Returns `None` when the descriptor was not passed in.
pub fn claim_private_stream(fd: RawFd) -> Option<File> {
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return None;
    }
    Some(unsafe { File::from_raw_fd(dup) })
}

/// Wire the subscriber up and point the file layer at `log_file`.
///
/// Idempotent; a second call (post-fork re-init) only re-points the
/// writers. Filter levels are fixed by the first call of the process.
pub fn init(log_file: Option<&Path>, file_level: u8, stderr_level: u8) {
    *FILE_TARGET.lock() = log_file.and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });
    {
        let mut stderr = STDERR_TARGET.lock();
        if stderr.is_none() {
            *stderr = claim_private_stream(STDERR_FD);
        }
    }

    INSTALL.call_once(|| {
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(|| TargetWriter {
                target: &FILE_TARGET,
                fall_back_to_stderr: false,
            })
            .with_filter(level_filter(file_level));
        let stderr_layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(|| TargetWriter {
                target: &STDERR_TARGET,
                fall_back_to_stderr: true,
            })
            .with_filter(level_filter(stderr_level));

        // try_init: the traced program may already have a subscriber.
        let _ = tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .try_init();
    });
}

/// Detach the file writer. Used by the post-fork reset; the next
/// [`init`] re-points it at the child's run directory.
pub fn reset() {
    *FILE_TARGET.lock() = None;
}

struct TargetWriter {
    target: &'static Mutex<Option<File>>,
    fall_back_to_stderr: bool,
}

impl Write for TargetWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.target.lock().as_mut() {
            Some(file) => file.write(buf),
            None if self.fall_back_to_stderr => std::io::stderr().write(buf),
            // No sink: swallow silently rather than pollute the host.
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.target.lock().as_mut() {
            Some(file) => file.flush(),
            None if self.fall_back_to_stderr => std::io::stderr().flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The writer targets are process globals; serialize the tests that
    // re-point them.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_filter(0), LevelFilter::OFF);
        assert_eq!(level_filter(2), LevelFilter::WARN);
        assert_eq!(level_filter(5), LevelFilter::TRACE);
        assert_eq!(level_filter(200), LevelFilter::TRACE);
    }

    #[test]
    fn test_init_writes_to_log_file() {
        let _guard = TEST_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.log");
        init(Some(&path), 5, 0);
        tracing::warn!("hello from the test");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello from the test"));
    }

    #[test]
    fn test_reset_detaches_file_writer() {
        let _guard = TEST_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.log");
        init(Some(&path), 5, 0);
        reset();
        tracing::warn!("after reset");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("after reset"));
    }
}
