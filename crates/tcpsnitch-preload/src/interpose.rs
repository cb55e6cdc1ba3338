//! Real-symbol resolution
//!
//! Each wrapped entry point forwards to the next definition of its own
//! symbol in dynamic-linker order, looked up once per process through
//! `dlsym(RTLD_NEXT, ..)` and cached in an atomic slot.

use libc::c_int;

/// Resolve the real `$name` once, yielding `Option<$ty>`.
///
/// The two-flag dance keeps the fast path to a single atomic load while
/// making a failed lookup (`None`) as sticky as a successful one.
macro_rules! real {
    ($name:ident : $ty:ty) => {{
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
        static ADDR: AtomicUsize = AtomicUsize::new(0);
        static RESOLVED: AtomicBool = AtomicBool::new(false);
        if !RESOLVED.load(Ordering::Acquire) {
            let sym = unsafe {
                libc::dlsym(
                    libc::RTLD_NEXT,
                    concat!(stringify!($name), "\0").as_ptr() as *const libc::c_char,
                )
            };
            if !sym.is_null() {
                ADDR.store(sym as usize, Ordering::Release);
            }
            RESOLVED.store(true, Ordering::Release);
            if sym.is_null() {
                // Marked resolved first: this very log line re-enters the
                // write wrapper, which must not retry the lookup.
                tracing::error!("could not resolve real '{}'", stringify!($name));
            }
        }
        match ADDR.load(Ordering::Acquire) {
            0 => None,
            addr => Some(unsafe { std::mem::transmute::<usize, $ty>(addr) }),
        }
    }};
}

pub(crate) use real;

pub fn get_errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

pub fn set_errno(value: c_int) {
    unsafe { *libc::__errno_location() = value }
}
