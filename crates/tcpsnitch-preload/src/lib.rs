//! tcpsnitch preload library
//!
//! Loaded into an unmodified target program via `LD_PRELOAD`. The
//! dynamic linker resolves our exported symbols ahead of libc's, so
//! every socket-related call lands in [`hooks`] first. Each wrapper
//! forwards to the real symbol, hands the outcome to the recorder in
//! `tcpsnitch-core`, restores `errno` and returns the real result - the
//! traced program can never observe the library in a return path.
//!
//! Lifecycle: the first wrapped call initializes the library
//! ([`init::ensure`]); an `atexit` handler retires still-open
//! connections; a `fork` resets the child to a clean slate.

mod hooks;
mod init;
mod interpose;
