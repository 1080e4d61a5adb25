//! TCP socket probe: time to complete a connect handshake.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use super::{bounded, elapsed_ms, probe_budget, resolve_address, ProbeError, ProbeKind, ProbeResult};

/// Run a socket probe against `target:port`.
///
/// Latency covers name resolution and the connect. Resolution failure is a
/// plain probe failure.
pub async fn run_socket_probe(target: &str, port: u16, timeout: Duration) -> ProbeResult {
    bounded(ProbeKind::Socket, probe_budget(timeout, 2.0), async {
        let start = Instant::now();
        let ip = resolve_address(target, timeout).await?;
        let addr = SocketAddr::new(ip, port);

        tokio::task::spawn_blocking(move || connect_blocking(addr, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))??;

        Ok(ProbeResult::success(elapsed_ms(start)))
    })
    .await
}

fn connect_blocking(addr: SocketAddr, timeout: Duration) -> Result<(), ProbeError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ProbeError::Network(format!("Failed to create socket: {}", e)))?;

    socket.connect_timeout(&addr.into(), timeout).map_err(|e| {
        if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(format!("connect to {} failed: {}", addr, e))
        }
    })
}
