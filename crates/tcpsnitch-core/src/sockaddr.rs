//! Raw `sockaddr` decoding and address enrichment
//!
//! The wrapped entry points hand us `*const sockaddr` pointers straight
//! from the traced program. They are decoded here, once, into owned
//! values; everything past the hook layer works with `std::net` types.

use libc::{c_char, sockaddr, sockaddr_in, sockaddr_in6, socklen_t, AF_INET, AF_INET6};
use serde::{Deserialize, Serialize};
use std::ffi::CStr;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Decoded endpoint as it appears in the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrData {
    /// Numeric IP string.
    pub ip: String,

    /// Numeric port string.
    pub port: String,

    /// Reverse-resolved host name, when the resolver knows one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Well-known service name for the port, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl AddrData {
    /// Build the logged form of an endpoint, including `getnameinfo`
    /// resolution. Resolution failures leave the optional fields empty.
    pub fn from_socket_addr(addr: &SocketAddr) -> Self {
        let (hostname, service) = resolve(addr);
        Self {
            ip: addr.ip().to_string(),
            port: addr.port().to_string(),
            hostname,
            service,
        }
    }
}

/// Decode a raw `sockaddr` into a [`SocketAddr`].
///
/// Returns `None` for null pointers, truncated lengths and non-internet
/// families (unix sockets, packet sockets and the like are not tracked).
///
/// # Safety
///
/// `addr` must either be null or point to at least `len` readable bytes.
pub unsafe fn decode(addr: *const sockaddr, len: socklen_t) -> Option<SocketAddr> {
    if addr.is_null() || len == 0 {
        return None;
    }

    match i32::from((*addr).sa_family) {
        AF_INET if len as usize >= mem::size_of::<sockaddr_in>() => {
            let sin = &*(addr as *const sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        AF_INET6 if len as usize >= mem::size_of::<sockaddr_in6>() => {
            let sin6 = &*(addr as *const sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

/// Re-encode a [`SocketAddr`] as raw storage for kernel calls.
pub fn to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = sockaddr_in {
                sin_family: AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe { *(&mut storage as *mut _ as *mut sockaddr_in) = sin };
            mem::size_of::<sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = sockaddr_in6 {
                sin6_family: AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { *(&mut storage as *mut _ as *mut sockaddr_in6) = sin6 };
            mem::size_of::<sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

/// Reverse-resolve host and service names for an endpoint.
fn resolve(addr: &SocketAddr) -> (Option<String>, Option<String>) {
    let (storage, len) = to_raw(addr);
    const NI_MAXSERV: usize = 32;
    let mut host = [0 as c_char; libc::NI_MAXHOST as usize];
    let mut serv = [0 as c_char; NI_MAXSERV];

    let rc = unsafe {
        libc::getnameinfo(
            &storage as *const _ as *const sockaddr,
            len,
            host.as_mut_ptr(),
            host.len() as socklen_t,
            serv.as_mut_ptr(),
            serv.len() as socklen_t,
            0,
        )
    };
    if rc != 0 {
        return (None, None);
    }

    let own = |buf: &[c_char]| {
        let s = unsafe { CStr::from_ptr(buf.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        (!s.is_empty()).then_some(s)
    };
    (own(&host), own(&serv))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ipv4() {
        let sin = sockaddr_in {
            sin_family: AF_INET as libc::sa_family_t,
            sin_port: 8080u16.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(Ipv4Addr::new(10, 0, 0, 1)).to_be(),
            },
            sin_zero: [0; 8],
        };
        let decoded = unsafe {
            decode(
                &sin as *const _ as *const sockaddr,
                mem::size_of::<sockaddr_in>() as socklen_t,
            )
        };
        assert_eq!(decoded, Some("10.0.0.1:8080".parse().unwrap()));
    }

    #[test]
    fn test_decode_rejects_null_and_short() {
        assert_eq!(unsafe { decode(std::ptr::null(), 16) }, None);
        let sin: sockaddr_in = unsafe { mem::zeroed() };
        assert_eq!(unsafe { decode(&sin as *const _ as *const sockaddr, 2) }, None);
    }

    #[test]
    fn test_raw_round_trip() {
        for addr in ["1.2.3.4:80", "[2001:db8::1]:443"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let (storage, len) = to_raw(&addr);
            let back = unsafe { decode(&storage as *const _ as *const sockaddr, len) };
            assert_eq!(back, Some(addr));
        }
    }

    #[test]
    fn test_addr_data_strings() {
        let data = AddrData::from_socket_addr(&"127.0.0.1:80".parse().unwrap());
        assert_eq!(data.ip, "127.0.0.1");
        assert_eq!(data.port, "80");
    }
}
