//! BPF filter construction
//!
//! The filter keeps the trace down to the one flow the connection
//! represents: peer host and peer port always, plus the local port when
//! a bound address is known (either the program's own bind or the
//! library's forced one).

use std::net::SocketAddr;

/// Build the capture filter for a connection.
pub fn bpf_filter(peer: &SocketAddr, local: Option<&SocketAddr>) -> String {
    let mut filter = format!("host {} and port {}", peer.ip(), peer.port());
    if let Some(local) = local {
        filter.push_str(&format!(" and port {}", local.port()));
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_only_filter() {
        let peer: SocketAddr = "10.0.0.1:443".parse().unwrap();
        assert_eq!(bpf_filter(&peer, None), "host 10.0.0.1 and port 443");
    }

    #[test]
    fn test_filter_with_local_port() {
        let peer: SocketAddr = "10.0.0.1:443".parse().unwrap();
        let local: SocketAddr = "0.0.0.0:40123".parse().unwrap();
        assert_eq!(
            bpf_filter(&peer, Some(&local)),
            "host 10.0.0.1 and port 443 and port 40123"
        );
    }

    #[test]
    fn test_ipv6_peer() {
        let peer: SocketAddr = "[2001:db8::1]:80".parse().unwrap();
        assert_eq!(bpf_filter(&peer, None), "host 2001:db8::1 and port 80");
    }
}
