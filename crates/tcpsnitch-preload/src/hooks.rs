//! Wrapped entry points
//!
//! One replacement per intercepted call, all the same shape: resolve
//! the real symbol, trigger init, invoke the real call with unchanged
//! arguments, capture `(return value, errno)`, dispatch the post-hook,
//! restore `errno`, return the captured value.
//!
//! Raw pointers from the traced program are decoded here, at the ABI
//! boundary; everything behind `recorder` works on owned values.

use crate::init;
use crate::interpose::{get_errno, real, set_errno};
use libc::{c_int, c_void, iovec, msghdr, pid_t, size_t, sockaddr, socklen_t, ssize_t};
use tcpsnitch_core::events::SOCK_TYPE_MASK;
use tcpsnitch_core::recorder::{self, MsgView};
use tcpsnitch_core::sockaddr::decode;

/// Only internet-domain stream sockets get a connection record; packet
/// sockets (pcap's own), unix sockets and datagram descriptors pass
/// through unobserved.
fn tracked_socket(domain: c_int, raw_type: c_int) -> bool {
    (domain == libc::AF_INET || domain == libc::AF_INET6)
        && raw_type & SOCK_TYPE_MASK == libc::SOCK_STREAM
}

/// Sum of the nominal lengths in a raw iovec array.
unsafe fn iovec_sizes(iov: *const iovec, iovcnt: c_int) -> Vec<usize> {
    if iov.is_null() || iovcnt <= 0 {
        return Vec::new();
    }
    (0..iovcnt as usize).map(|i| (*iov.add(i)).iov_len).collect()
}

/// Decode the pieces of a `msghdr` the event model keeps.
unsafe fn msg_view(msg: *const msghdr) -> MsgView {
    if msg.is_null() {
        return MsgView {
            addr: None,
            control_data: false,
            iov_sizes: Vec::new(),
        };
    }
    let msg = &*msg;
    MsgView {
        addr: decode(msg.msg_name as *const sockaddr, msg.msg_namelen),
        control_data: !msg.msg_control.is_null(),
        iov_sizes: iovec_sizes(msg.msg_iov, msg.msg_iovlen as c_int),
    }
}

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, raw_type: c_int, protocol: c_int) -> c_int {
    type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
    let Some(real) = real!(socket: SocketFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    init::ensure();

    let fd = real(domain, raw_type, protocol);
    let err = get_errno();
    if fd >= 0 && tracked_socket(domain, raw_type) {
        recorder::record_socket(fd, domain, raw_type, protocol);
    }
    set_errno(err);
    fd
}

#[no_mangle]
pub unsafe extern "C" fn bind(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    type BindFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
    let Some(real) = real!(bind: BindFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    init::ensure();

    let rv = real(fd, addr, len);
    let err = get_errno();
    recorder::record_bind(fd, i64::from(rv), err, decode(addr, len));
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
    let Some(real) = real!(connect: ConnectFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    init::ensure();

    let rv = real(fd, addr, len);
    let err = get_errno();
    recorder::record_connect(fd, i64::from(rv), err, decode(addr, len));
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn shutdown(fd: c_int, how: c_int) -> c_int {
    type ShutdownFn = unsafe extern "C" fn(c_int, c_int) -> c_int;
    let Some(real) = real!(shutdown: ShutdownFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    init::ensure();

    let rv = real(fd, how);
    let err = get_errno();
    recorder::record_shutdown(fd, i64::from(rv), err, how);
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn listen(fd: c_int, backlog: c_int) -> c_int {
    type ListenFn = unsafe extern "C" fn(c_int, c_int) -> c_int;
    let Some(real) = real!(listen: ListenFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    init::ensure();

    let rv = real(fd, backlog);
    let err = get_errno();
    recorder::record_listen(fd, i64::from(rv), err, backlog);
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    type SetsockoptFn =
        unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;
    let Some(real) = real!(setsockopt: SetsockoptFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    init::ensure();

    let rv = real(fd, level, optname, optval, optlen);
    let err = get_errno();
    recorder::record_setsockopt(fd, i64::from(rv), err, level, optname);
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn send(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
) -> ssize_t {
    type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
    let Some(real) = real!(send: SendFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    init::ensure();

    let rv = real(fd, buf, len, flags);
    let err = get_errno();
    recorder::record_send(fd, rv as i64, err, len, flags);
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
    let Some(real) = real!(recv: RecvFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    init::ensure();

    let rv = real(fd, buf, len, flags);
    let err = get_errno();
    recorder::record_recv(fd, rv as i64, err, len, flags);
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    type SendtoFn = unsafe extern "C" fn(
        c_int,
        *const c_void,
        size_t,
        c_int,
        *const sockaddr,
        socklen_t,
    ) -> ssize_t;
    let Some(real) = real!(sendto: SendtoFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    init::ensure();

    let rv = real(fd, buf, len, flags, dest_addr, addrlen);
    let err = get_errno();
    recorder::record_sendto(fd, rv as i64, err, len, flags, decode(dest_addr, addrlen));
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    type RecvfromFn = unsafe extern "C" fn(
        c_int,
        *mut c_void,
        size_t,
        c_int,
        *mut sockaddr,
        *mut socklen_t,
    ) -> ssize_t;
    let Some(real) = real!(recvfrom: RecvfromFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    init::ensure();

    let rv = real(fd, buf, len, flags, src_addr, addrlen);
    let err = get_errno();
    // The kernel fills the peer address on the way out.
    let peer = if rv >= 0 && !src_addr.is_null() && !addrlen.is_null() {
        decode(src_addr as *const sockaddr, *addrlen)
    } else {
        None
    };
    recorder::record_recvfrom(fd, rv as i64, err, len, flags, peer);
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    type SendmsgFn = unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t;
    let Some(real) = real!(sendmsg: SendmsgFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    init::ensure();

    let rv = real(fd, msg, flags);
    let err = get_errno();
    recorder::record_sendmsg(fd, rv as i64, err, msg_view(msg), flags);
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    type RecvmsgFn = unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t;
    let Some(real) = real!(recvmsg: RecvmsgFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    init::ensure();

    let rv = real(fd, msg, flags);
    let err = get_errno();
    recorder::record_recvmsg(fd, rv as i64, err, msg_view(msg), flags);
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
    let Some(real) = real!(write: WriteFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    // Standard streams stay out of the event pipeline; our own logging
    // writes to them and must not loop back in.
    if fd <= 2 {
        return real(fd, buf, count);
    }
    init::ensure();

    let rv = real(fd, buf, count);
    let err = get_errno();
    recorder::record_write(fd, rv as i64, err, count);
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
    let Some(real) = real!(read: ReadFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    if fd <= 2 {
        return real(fd, buf, count);
    }
    init::ensure();

    let rv = real(fd, buf, count);
    let err = get_errno();
    recorder::record_read(fd, rv as i64, err, count);
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
    let Some(real) = real!(close: CloseFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    init::ensure();

    let rv = real(fd);
    let err = get_errno();
    recorder::record_close(fd, i64::from(rv), err, false);
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    type WritevFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
    let Some(real) = real!(writev: WritevFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    if fd <= 2 {
        return real(fd, iov, iovcnt);
    }
    init::ensure();

    let rv = real(fd, iov, iovcnt);
    let err = get_errno();
    recorder::record_writev(fd, rv as i64, err, iovec_sizes(iov, iovcnt));
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    type ReadvFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
    let Some(real) = real!(readv: ReadvFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    if fd <= 2 {
        return real(fd, iov, iovcnt);
    }
    init::ensure();

    let rv = real(fd, iov, iovcnt);
    let err = get_errno();
    recorder::record_readv(fd, rv as i64, err, iovec_sizes(iov, iovcnt));
    set_errno(err);
    rv
}

#[no_mangle]
pub unsafe extern "C" fn fork() -> pid_t {
    type ForkFn = unsafe extern "C" fn() -> pid_t;
    let Some(real) = real!(fork: ForkFn) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    init::ensure();

    let pid = real();
    let err = get_errno();
    if pid == 0 {
        // The child inherits descriptors but not ownership of the
        // parent's connection state; it starts from a clean slate and
        // re-initializes on its next wrapped call.
        init::reset_after_fork();
    }
    set_errno(err);
    pid
}
