//! UDP probe using a raw DNS query packet.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use super::{bounded, elapsed_ms, probe_budget, resolve_address, ProbeError, ProbeKind, ProbeResult};

/// Name asked for in every probe query.
pub const PROBE_DOMAIN: &str = "example.com";

pub const DNS_PORT: u16 = 53;

/// Largest response we wait for.
const MAX_RESPONSE: usize = 512;

/// Run a UDP probe against the DNS port of `target`.
///
/// Any datagram coming back counts as success; its contents are not checked.
pub async fn run_udp_probe(target: &str, timeout: Duration) -> ProbeResult {
    bounded(ProbeKind::Udp, probe_budget(timeout, 2.0), async {
        let ip = resolve_address(target, timeout).await?;
        udp_exchange(SocketAddr::new(ip, DNS_PORT), timeout).await
    })
    .await
}

/// Send one query to `dest` and time the first datagram received.
pub(crate) async fn udp_exchange(dest: SocketAddr, timeout: Duration) -> Result<ProbeResult, ProbeError> {
    let bind_addr = if dest.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;

    let packet = build_dns_query(PROBE_DOMAIN);

    let start = Instant::now();
    socket
        .send_to(&packet, dest)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let mut response = [0u8; MAX_RESPONSE];
    tokio::time::timeout(timeout, socket.recv_from(&mut response))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;

    Ok(ProbeResult::success(elapsed_ms(start)))
}

/// Build a minimal DNS query packet for the A record of `domain`.
///
/// Layout: 12 byte header, length-prefixed labels ending in a zero byte,
/// QTYPE and QCLASS.
pub fn build_dns_query(domain: &str) -> Vec<u8> {
    let tx_id: u16 = rand::random();
    let flags: u16 = 0x0100; // Standard query, recursion desired
    let qd_count: u16 = 1;
    let an_count: u16 = 0;
    let ns_count: u16 = 0;
    let ar_count: u16 = 0;

    let mut packet = Vec::with_capacity(18 + domain.len());
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&qd_count.to_be_bytes());
    packet.extend_from_slice(&an_count.to_be_bytes());
    packet.extend_from_slice(&ns_count.to_be_bytes());
    packet.extend_from_slice(&ar_count.to_be_bytes());

    for label in domain.split('.').filter(|l| !l.is_empty()) {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    // QTYPE: A record (1)
    packet.extend_from_slice(&1u16.to_be_bytes());
    // QCLASS: IN (1)
    packet.extend_from_slice(&1u16.to_be_bytes());

    packet
}
