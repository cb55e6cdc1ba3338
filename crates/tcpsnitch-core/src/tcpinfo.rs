//! Kernel flow telemetry via `getsockopt(TCP_INFO)`

use libc::{c_void, socklen_t, IPPROTO_TCP, TCP_INFO};
use serde::{Deserialize, Serialize};
use std::mem;
use std::os::unix::io::RawFd;

/// Flattened copy of the kernel's `struct tcp_info`.
///
/// Field names drop the `tcpi_` prefix; units are whatever the kernel
/// reports (times in microseconds, windows in segments).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TcpInfoSnapshot {
    pub state: u8,
    pub ca_state: u8,
    pub retransmits: u8,
    pub probes: u8,
    pub backoff: u8,
    pub options: u8,
    pub snd_wscale: u8,
    pub rcv_wscale: u8,
    pub rto: u32,
    pub ato: u32,
    pub snd_mss: u32,
    pub rcv_mss: u32,
    pub unacked: u32,
    pub sacked: u32,
    pub lost: u32,
    pub retrans: u32,
    pub fackets: u32,
    pub last_data_sent: u32,
    pub last_ack_sent: u32,
    pub last_data_recv: u32,
    pub last_ack_recv: u32,
    pub pmtu: u32,
    pub rcv_ssthresh: u32,
    pub rtt: u32,
    pub rttvar: u32,
    pub snd_ssthresh: u32,
    pub snd_cwnd: u32,
    pub advmss: u32,
    pub reordering: u32,
    pub rcv_rtt: u32,
    pub rcv_space: u32,
    pub total_retrans: u32,
}

impl From<&libc::tcp_info> for TcpInfoSnapshot {
    fn from(info: &libc::tcp_info) -> Self {
        Self {
            state: info.tcpi_state,
            ca_state: info.tcpi_ca_state,
            retransmits: info.tcpi_retransmits,
            probes: info.tcpi_probes,
            backoff: info.tcpi_backoff,
            options: info.tcpi_options,
            // Two 4-bit kernel bitfields packed into one byte.
            snd_wscale: info.tcpi_snd_rcv_wscale & 0x0f,
            rcv_wscale: info.tcpi_snd_rcv_wscale >> 4,
            rto: info.tcpi_rto,
            ato: info.tcpi_ato,
            snd_mss: info.tcpi_snd_mss,
            rcv_mss: info.tcpi_rcv_mss,
            unacked: info.tcpi_unacked,
            sacked: info.tcpi_sacked,
            lost: info.tcpi_lost,
            retrans: info.tcpi_retrans,
            fackets: info.tcpi_fackets,
            last_data_sent: info.tcpi_last_data_sent,
            last_ack_sent: info.tcpi_last_ack_sent,
            last_data_recv: info.tcpi_last_data_recv,
            last_ack_recv: info.tcpi_last_ack_recv,
            pmtu: info.tcpi_pmtu,
            rcv_ssthresh: info.tcpi_rcv_ssthresh,
            rtt: info.tcpi_rtt,
            rttvar: info.tcpi_rttvar,
            snd_ssthresh: info.tcpi_snd_ssthresh,
            snd_cwnd: info.tcpi_snd_cwnd,
            advmss: info.tcpi_advmss,
            reordering: info.tcpi_reordering,
            rcv_rtt: info.tcpi_rcv_rtt,
            rcv_space: info.tcpi_rcv_space,
            total_retrans: info.tcpi_total_retrans,
        }
    }
}

/// Query `TCP_INFO` on a descriptor.
///
/// Returns the raw `getsockopt` return value, the errno it left behind
/// and the snapshot (zeroed when the query failed, so a failed sample is
/// still recordable with `success = false`).
pub fn query(fd: RawFd) -> (i32, i32, TcpInfoSnapshot) {
    let mut info: libc::tcp_info = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::tcp_info>() as socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            IPPROTO_TCP,
            TCP_INFO,
            &mut info as *mut _ as *mut c_void,
            &mut len,
        )
    };
    if rc == 0 {
        (rc, 0, TcpInfoSnapshot::from(&info))
    } else {
        let err = unsafe { *libc::__errno_location() };
        (rc, err, TcpInfoSnapshot::default())
    }
}
