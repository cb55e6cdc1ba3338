//! Configuration snapshot for the interception engine
//!
//! Options come from environment variables set up by the launcher. The
//! snapshot is taken once at init time and never changes afterwards; a
//! forked child takes a fresh snapshot when it re-initializes.
//!
//! Unknown or missing variables take defaults, and values that fail to
//! parse fall back to the default as well (the launcher is not always
//! in control of the environment it hands us).

use std::path::PathBuf;
use tracing::warn;

/// Lower bound on the byte delta between two `tcp_info` samples.
pub const ENV_BYTES_IVAL: &str = "TCPSNITCH_BYTES_IVAL";
/// Lower bound on elapsed microseconds between two `tcp_info` samples.
pub const ENV_MICROS_IVAL: &str = "TCPSNITCH_MICROS_IVAL";
/// Event-count threshold that triggers a JSON flush.
pub const ENV_EVENTS_IVAL: &str = "TCPSNITCH_EVENTS_IVAL";
/// Nonzero enables per-connection packet capture.
pub const ENV_CAPTURE: &str = "TCPSNITCH_CAPTURE";
/// Base directory for per-process run directories.
pub const ENV_DIR: &str = "TCPSNITCH_DIR";
/// Device to capture on; pcap picks a default when unset.
pub const ENV_DEV: &str = "TCPSNITCH_DEV";
/// Verbosity of the `main.log` file (0..5).
pub const ENV_LOG_FILE_LEVEL: &str = "TCPSNITCH_LOG_FILE_LEVEL";
/// Verbosity of the library's stderr (0..5).
pub const ENV_LOG_STDERR_LEVEL: &str = "TCPSNITCH_LOG_STDERR_LEVEL";
/// Nonzero echoes every event as a JSON line on the library's stdout.
pub const ENV_VERBOSE: &str = "TCPSNITCH_VERBOSE";

/// Immutable snapshot of the engine options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Byte gate for `tcp_info` sampling; 0 disables the gate.
    pub dump_every_bytes: u64,

    /// Time gate for `tcp_info` sampling, in microseconds; 0 disables it.
    pub dump_every_micros: i64,

    /// Flush the JSON file every this many pending events. Always > 0.
    pub dump_every_events: u64,

    /// Whether to attach a packet capture to each connection.
    pub capture_enabled: bool,

    /// Base output directory. `None` means degraded, in-memory-only mode.
    pub log_dir: Option<PathBuf>,

    /// Capture device override.
    pub capture_device: Option<String>,

    /// File log verbosity, 0 (off) .. 5 (trace).
    pub log_level_file: u8,

    /// Stderr log verbosity, 0 (off) .. 5 (trace).
    pub log_level_stderr: u8,

    /// Echo events on the library stdout.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dump_every_bytes: 4096,
            dump_every_micros: 0,
            dump_every_events: 1000,
            capture_enabled: false,
            log_dir: None,
            capture_device: None,
            log_level_file: 2,
            log_level_stderr: 2,
            verbose: false,
        }
    }
}

impl Config {
    /// Snapshot the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Snapshot from an arbitrary key/value source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let mut config = Self {
            dump_every_bytes: int_opt(&get, ENV_BYTES_IVAL, defaults.dump_every_bytes),
            dump_every_micros: int_opt(&get, ENV_MICROS_IVAL, defaults.dump_every_micros),
            dump_every_events: int_opt(&get, ENV_EVENTS_IVAL, defaults.dump_every_events),
            capture_enabled: flag_opt(&get, ENV_CAPTURE),
            log_dir: get(ENV_DIR).map(PathBuf::from),
            capture_device: get(ENV_DEV).filter(|dev| !dev.is_empty()),
            log_level_file: int_opt(&get, ENV_LOG_FILE_LEVEL, defaults.log_level_file),
            log_level_stderr: int_opt(&get, ENV_LOG_STDERR_LEVEL, defaults.log_level_stderr),
            verbose: flag_opt(&get, ENV_VERBOSE),
        };

        // A zero flush threshold would never flush anything.
        if config.dump_every_events == 0 {
            warn!("{} must be > 0, using 1", ENV_EVENTS_IVAL);
            config.dump_every_events = 1;
        }
        config.log_level_file = config.log_level_file.min(5);
        config.log_level_stderr = config.log_level_stderr.min(5);
        config
    }
}

fn int_opt<T, F>(get: &F, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has non-integer value {:?}, using default", key, raw);
            default
        }),
        None => default,
    }
}

fn flag_opt<F: Fn(&str) -> Option<String>>(get: &F, key: &str) -> bool {
    int_opt::<i64, F>(get, key, 0) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config.dump_every_bytes, 4096);
        assert_eq!(config.dump_every_micros, 0);
        assert_eq!(config.dump_every_events, 1000);
        assert!(!config.capture_enabled);
        assert!(config.log_dir.is_none());
        assert_eq!(config.log_level_file, 2);
        assert!(!config.verbose);
    }

    #[test]
    fn test_full_environment() {
        let config = Config::from_lookup(lookup(&[
            (ENV_BYTES_IVAL, "1024"),
            (ENV_MICROS_IVAL, "500000"),
            (ENV_EVENTS_IVAL, "1"),
            (ENV_CAPTURE, "1"),
            (ENV_DIR, "/tmp/snitch"),
            (ENV_DEV, "eth0"),
            (ENV_LOG_FILE_LEVEL, "4"),
            (ENV_LOG_STDERR_LEVEL, "0"),
            (ENV_VERBOSE, "1"),
        ]));
        assert_eq!(config.dump_every_bytes, 1024);
        assert_eq!(config.dump_every_micros, 500_000);
        assert_eq!(config.dump_every_events, 1);
        assert!(config.capture_enabled);
        assert_eq!(config.log_dir.as_deref(), Some(std::path::Path::new("/tmp/snitch")));
        assert_eq!(config.capture_device.as_deref(), Some("eth0"));
        assert_eq!(config.log_level_file, 4);
        assert_eq!(config.log_level_stderr, 0);
        assert!(config.verbose);
    }

    #[test]
    fn test_non_integer_falls_back_to_default() {
        let config = Config::from_lookup(lookup(&[
            (ENV_BYTES_IVAL, "lots"),
            (ENV_EVENTS_IVAL, ""),
            (ENV_CAPTURE, "yes please"),
        ]));
        assert_eq!(config.dump_every_bytes, 4096);
        assert_eq!(config.dump_every_events, 1000);
        assert!(!config.capture_enabled);
    }

    #[test]
    fn test_zero_event_threshold_is_coerced() {
        let config = Config::from_lookup(lookup(&[(ENV_EVENTS_IVAL, "0")]));
        assert_eq!(config.dump_every_events, 1);
    }

    #[test]
    fn test_levels_are_clamped() {
        let config = Config::from_lookup(lookup(&[(ENV_LOG_FILE_LEVEL, "99")]));
        assert_eq!(config.log_level_file, 5);
    }
}
