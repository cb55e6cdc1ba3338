//! One-time initialization, atexit cleanup and the post-fork reset

use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use tcpsnitch_core::recorder::{self, RunState};
use tcpsnitch_core::{logging, sink, Config, MAIN_LOG_FILE, SNITCH_VERSION};
use tracing::{error, info};

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static INIT_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    // Init itself opens files and directories, which re-enters the
    // wrapped write/close; those recursive calls must not wait on
    // INIT_LOCK.
    static INITIALIZING: Cell<bool> = const { Cell::new(false) };
}

/// Bring the library up if it is not yet. Idempotent and callable from
/// every wrapper.
pub fn ensure() {
    if INITIALIZED.load(Ordering::Acquire) {
        return;
    }
    if INITIALIZING.with(Cell::get) {
        return;
    }
    INITIALIZING.with(|flag| flag.set(true));
    {
        let _guard = INIT_LOCK.lock();
        if !INITIALIZED.load(Ordering::Acquire) {
            initialize();
            INITIALIZED.store(true, Ordering::Release);
        }
    }
    INITIALIZING.with(|flag| flag.set(false));
}

/// Drop all state after `fork` so the child starts clean. The next
/// wrapped call in the child re-initializes into a fresh run directory
/// with a fresh connection-id counter.
pub fn reset_after_fork() {
    recorder::reset();
    logging::reset();
    INITIALIZED.store(false, Ordering::Release);
}

fn initialize() {
    let config = Config::from_env();

    // Allocate the per-process run directory first; the log file lives
    // inside it. Failures leave `run_dir` unset and the library keeps
    // running in memory-only mode.
    let mut run_dir_err = None;
    let run_dir = config.log_dir.as_deref().and_then(|base| {
        sink::allocate_run_dir(base)
            .map_err(|err| run_dir_err = Some((base.to_path_buf(), err)))
            .ok()
    });

    logging::init(
        run_dir.as_ref().map(|dir| dir.join(MAIN_LOG_FILE)).as_deref(),
        config.log_level_file,
        config.log_level_stderr,
    );
    if let Some((base, err)) = run_dir_err {
        error!(
            "no run directory under {}: {}; nothing will be written to disk",
            base.display(),
            err
        );
    } else if config.log_dir.is_none() {
        error!(
            "{} is not set; nothing will be written to disk",
            tcpsnitch_core::config::ENV_DIR
        );
    }

    let verbose_out = config
        .verbose
        .then(|| logging::claim_private_stream(logging::STDOUT_FD))
        .flatten()
        .map(Mutex::new);

    recorder::install(RunState {
        config,
        run_dir,
        verbose_out,
    });
    unsafe { libc::atexit(atexit_cleanup) };
    info!("tcpsnitch {} attached to pid {}", SNITCH_VERSION, std::process::id());
}

/// Retire every still-open connection so each `events.json` ends as a
/// valid array even when the program never closed its sockets.
extern "C" fn atexit_cleanup() {
    recorder::sweep_unclosed();
}
