//! Probe module for connectivity checks.
//!
//! Supports ping, TCP socket, HTTP and UDP (DNS) probes. Every probe
//! reports a [`ProbeResult`]; errors never escape a probe.

mod http;
mod ping;
mod socket;
mod udp;

pub use http::*;
pub use ping::*;
pub use socket::*;
pub use udp::*;

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

/// Fixed slack added on top of every probe budget for process/OS overhead.
pub const PROBE_OVERHEAD: Duration = Duration::from_millis(250);

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("http error: {0}")]
    Http(String),
}

/// Outcome of a single probe invocation.
///
/// `latencies` holds round-trip samples in milliseconds. A successful probe
/// may still carry no samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeResult {
    pub success: bool,
    pub latencies: Vec<f64>,
}

impl ProbeResult {
    pub fn success(latency_ms: f64) -> Self {
        Self {
            success: true,
            latencies: vec![latency_ms],
        }
    }

    /// Successful iff at least one sample arrived.
    pub fn from_samples(latencies: Vec<f64>) -> Self {
        Self {
            success: !latencies.is_empty(),
            latencies,
        }
    }

    pub fn failure() -> Self {
        Self::default()
    }

    /// First latency sample of a successful probe.
    pub fn latency_ms(&self) -> Option<f64> {
        if self.success {
            self.latencies.first().copied()
        } else {
            None
        }
    }
}

/// The closed set of probe techniques.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Ping,
    Socket,
    Http,
    Udp,
}

impl ProbeKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProbeKind::Ping => "ping",
            ProbeKind::Socket => "socket",
            ProbeKind::Http => "http",
            ProbeKind::Udp => "udp",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Policy selecting which probes decide connectivity for a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CheckMethod {
    Ping,
    Socket,
    Http,
    Udp,
    #[default]
    All,
}

impl CheckMethod {
    /// Probes run for this policy, in execution order.
    pub fn probes(&self) -> &'static [ProbeKind] {
        match self {
            CheckMethod::Ping => &[ProbeKind::Ping],
            CheckMethod::Socket => &[ProbeKind::Socket],
            CheckMethod::Http => &[ProbeKind::Http],
            CheckMethod::Udp => &[ProbeKind::Udp],
            CheckMethod::All => &[
                ProbeKind::Ping,
                ProbeKind::Socket,
                ProbeKind::Http,
                ProbeKind::Udp,
            ],
        }
    }

    pub fn includes(&self, kind: ProbeKind) -> bool {
        self.probes().contains(&kind)
    }

    pub fn label(&self) -> &'static str {
        match self {
            CheckMethod::Ping => "ping",
            CheckMethod::Socket => "socket",
            CheckMethod::Http => "http",
            CheckMethod::Udp => "udp",
            CheckMethod::All => "all",
        }
    }
}

impl fmt::Display for CheckMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CheckMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ping" => Ok(CheckMethod::Ping),
            "socket" => Ok(CheckMethod::Socket),
            "http" => Ok(CheckMethod::Http),
            "udp" => Ok(CheckMethod::Udp),
            "all" => Ok(CheckMethod::All),
            other => Err(format!("unknown check method: {}", other)),
        }
    }
}

/// Wall-clock budget for a probe: `timeout * factor` plus fixed overhead.
pub fn probe_budget(timeout: Duration, factor: f64) -> Duration {
    timeout.mul_f64(factor) + PROBE_OVERHEAD
}

/// Drive a probe future to completion within `budget`.
///
/// Errors and budget overruns are logged and folded into a failed result.
pub async fn bounded<F>(kind: ProbeKind, budget: Duration, probe: F) -> ProbeResult
where
    F: Future<Output = Result<ProbeResult, ProbeError>>,
{
    match tokio::time::timeout(budget, probe).await {
        Ok(Ok(result)) => result,
        Ok(Err(ProbeError::Timeout(t))) => {
            tracing::debug!("{} probe timed out after {:?}", kind, t);
            ProbeResult::failure()
        }
        Ok(Err(e)) => {
            tracing::debug!("{} probe failed: {}", kind, e);
            ProbeResult::failure()
        }
        Err(_) => {
            tracing::warn!("{} probe exceeded its budget of {:?}", kind, budget);
            ProbeResult::failure()
        }
    }
}

/// Resolve hostname to IP address, bounded by `timeout`.
pub async fn resolve_address(address: &str, timeout: Duration) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let lookup = tokio::net::lookup_host(format!("{}:0", address));
    let addrs: Vec<_> = tokio::time::timeout(timeout, lookup)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .collect();

    addrs
        .iter()
        .find(|sa| sa.is_ipv4())
        .or_else(|| addrs.first())
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_method_selection() {
        assert_eq!(CheckMethod::All.probes().len(), 4);
        assert!(CheckMethod::Udp.includes(ProbeKind::Udp));
        assert!(!CheckMethod::Udp.includes(ProbeKind::Ping));
        assert!(CheckMethod::All.includes(ProbeKind::Http));
    }

    #[test]
    fn test_check_method_parse() {
        assert_eq!("ALL".parse::<CheckMethod>().unwrap(), CheckMethod::All);
        assert_eq!(" socket ".parse::<CheckMethod>().unwrap(), CheckMethod::Socket);
        assert!("icmp".parse::<CheckMethod>().is_err());
    }

    #[test]
    fn test_probe_result_latency() {
        assert_eq!(ProbeResult::success(12.5).latency_ms(), Some(12.5));
        assert_eq!(ProbeResult::failure().latency_ms(), None);
        assert!(!ProbeResult::from_samples(vec![]).success);
        assert!(ProbeResult::from_samples(vec![3.0]).success);
    }

    #[tokio::test]
    async fn test_bounded_folds_errors() {
        let result = bounded(ProbeKind::Socket, Duration::from_secs(1), async {
            Err(ProbeError::Network("refused".to_string()))
        })
        .await;
        assert_eq!(result, ProbeResult::failure());
    }

    #[tokio::test]
    async fn test_bounded_enforces_budget() {
        let started = Instant::now();
        let result = bounded(ProbeKind::Udp, Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ProbeResult::success(1.0))
        })
        .await;
        assert!(!result.success);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let ip = resolve_address("127.0.0.1", Duration::from_millis(100)).await.unwrap();
        assert!(ip.is_loopback());
    }
}
