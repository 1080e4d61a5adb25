//! Ping probe implementation with native ICMP and command fallback.
//!
//! The backend sits behind [`PingRunner`] so the sampling side only sees
//! "zero or more round-trip samples per invocation".

use std::future::Future;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{bounded, probe_budget, resolve_address, ProbeError, ProbeKind, ProbeResult, PROBE_OVERHEAD};

/// Source of ping round-trip samples.
pub trait PingRunner: Send + Sync {
    /// Send `count` echo requests to `target`, each waiting up to `timeout`,
    /// and return the round-trip times (ms) of the replies that arrived.
    fn run(
        &self,
        target: &str,
        count: u32,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<f64>, ProbeError>> + Send;
}

/// Summary of one ping invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PingStats {
    pub avg_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub packet_loss_pct: Option<f64>,
}

impl PingStats {
    /// Compute mean, sample standard deviation and loss for `count` requests.
    pub fn from_samples(samples: &[f64], count: u32) -> Self {
        let n = samples.len();
        let packet_loss_pct = if count > 0 {
            let lost = count.saturating_sub(n as u32);
            Some(lost as f64 / count as f64 * 100.0)
        } else {
            None
        };

        if n == 0 {
            return Self {
                avg_ms: None,
                jitter_ms: None,
                packet_loss_pct,
            };
        }

        let avg = samples.iter().sum::<f64>() / n as f64;
        let jitter = if n > 1 {
            let sq: f64 = samples.iter().map(|t| (t - avg).powi(2)).sum();
            (sq / (n - 1) as f64).sqrt()
        } else {
            0.0
        };

        Self {
            avg_ms: Some(avg),
            jitter_ms: Some(jitter),
            packet_loss_pct,
        }
    }
}

/// Gap the ping utility leaves between echo requests.
const COMMAND_PACING: Duration = Duration::from_secs(1);

/// Wall-clock budget for one ping invocation.
///
/// Native sockets need at most `timeout` per request. The ping utility
/// paces requests [`COMMAND_PACING`] apart and waits whole seconds per reply,
/// so it gets `(count - 1) * pacing + count * wait` on top of the overhead.
pub fn ping_budget(count: u32, timeout: Duration) -> Duration {
    let count = count.max(1);
    let native = probe_budget(timeout * count, 1.5);
    let command = COMMAND_PACING * (count - 1) + command_wait(timeout) * count + PROBE_OVERHEAD;
    native.max(command)
}

/// Per-reply wait handed to the ping utility.
fn command_wait(timeout: Duration) -> Duration {
    if cfg!(windows) {
        timeout.max(Duration::from_millis(1))
    } else {
        // -W takes whole seconds
        Duration::from_secs(timeout.as_secs_f64().ceil().max(1.0) as u64)
    }
}

/// Run a ping probe: `count` echo requests bounded by [`ping_budget`].
pub async fn run_ping_probe<R: PingRunner>(
    runner: &R,
    target: &str,
    count: u32,
    timeout: Duration,
) -> ProbeResult {
    let budget = ping_budget(count, timeout);
    bounded(ProbeKind::Ping, budget, async {
        runner
            .run(target, count, timeout)
            .await
            .map(ProbeResult::from_samples)
    })
    .await
}

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Default backend: native ICMP sockets when permitted, else the `ping` utility.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPing;

impl PingRunner for SystemPing {
    async fn run(&self, target: &str, count: u32, timeout: Duration) -> Result<Vec<f64>, ProbeError> {
        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

        if capability == IcmpCapability::Native {
            let ip = resolve_address(target, timeout).await?;
            let result = tokio::task::spawn_blocking(move || run_blocking_pings(ip, count, timeout))
                .await
                .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

            match result {
                Ok(samples) => return Ok(samples),
                Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                    tracing::warn!(
                        "Native ping not permitted for {}, falling back to command: {}",
                        target,
                        msg
                    );
                }
                Err(e) => return Err(e),
            }
        }

        run_ping_command(target, count, timeout).await
    }
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW, DGRAM works when ping_group_range allows it
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Wire parameters for one address family.
struct IcmpFamily {
    domain: Domain,
    protocol: Protocol,
    request_type: u8,
    reply_type: u8,
}

impl IcmpFamily {
    fn for_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self {
                domain: Domain::IPV4,
                protocol: Protocol::ICMPV4,
                request_type: 8,
                reply_type: 0,
            },
            IpAddr::V6(_) => Self {
                domain: Domain::IPV6,
                protocol: Protocol::ICMPV6,
                request_type: 128,
                reply_type: 129,
            },
        }
    }
}

/// Send `count` echo requests over one socket and collect reply times.
/// Runs in a dedicated thread via spawn_blocking.
fn run_blocking_pings(ip: IpAddr, count: u32, timeout: Duration) -> Result<Vec<f64>, ProbeError> {
    let family = IcmpFamily::for_ip(ip);

    let (socket, raw) = match Socket::new(family.domain, Type::RAW, Some(family.protocol)) {
        Ok(s) => (s, true),
        Err(_) => {
            let s = Socket::new(family.domain, Type::DGRAM, Some(family.protocol))
                .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))?;
            (s, false)
        }
    };

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let identifier: u16 = rand::random();
    let mut samples = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        match ping_once(&socket, &family, raw, identifier, sequence, timeout) {
            Ok(ms) => samples.push(ms),
            Err(ProbeError::Timeout(_)) => {}
            Err(e) if samples.is_empty() => return Err(e),
            Err(e) => tracing::debug!("Echo request {} to {} lost: {}", sequence, ip, e),
        }
    }

    Ok(samples)
}

fn ping_once(
    socket: &Socket,
    family: &IcmpFamily,
    raw: bool,
    identifier: u16,
    sequence: u16,
    timeout: Duration,
) -> Result<f64, ProbeError> {
    let packet = build_echo_request(family.request_type, identifier, sequence);

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    // Loop until we get OUR reply or the per-packet timeout expires
    loop {
        let remaining = timeout
            .checked_sub(start.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(ProbeError::Timeout(timeout))?;
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

        let mut buf: [MaybeUninit<u8>; 1500] = unsafe { MaybeUninit::uninit().assume_init() };
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("Failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if is_matching_reply(buf, family.reply_type, raw, identifier, sequence) {
            return Ok(elapsed.as_secs_f64() * 1000.0);
        }
    }
}

/// Check a received datagram against our outstanding request.
///
/// RAW IPv4 sockets deliver the IP header first. DGRAM sockets get the
/// identifier rewritten by the kernel, so only the sequence is compared.
fn is_matching_reply(buf: &[u8], reply_type: u8, raw: bool, identifier: u16, sequence: u16) -> bool {
    let offset = if !buf.is_empty() && buf[0] >> 4 == 4 {
        ((buf[0] & 0x0F) as usize) * 4
    } else {
        0
    };
    if buf.len() < offset + 8 {
        return false;
    }

    let icmp = &buf[offset..];
    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    icmp[0] == reply_type && reply_seq == sequence && (!raw || reply_id == identifier)
}

/// Build an echo request (ICMP type 8 or ICMPv6 type 128, code 0).
fn build_echo_request(request_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = request_type;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    // ICMPv6 checksums are filled in by the kernel
    if request_type == 8 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run the platform ping utility and parse every reply time it prints.
async fn run_ping_command(address: &str, count: u32, timeout: Duration) -> Result<Vec<f64>, ProbeError> {
    run_ping_program(Command::new("ping"), address, count, timeout).await
}

async fn run_ping_program(
    mut command: Command,
    address: &str,
    count: u32,
    timeout: Duration,
) -> Result<Vec<f64>, ProbeError> {
    let wait = command_wait(timeout);
    if cfg!(windows) {
        command.args(["-n", &count.to_string(), "-w", &wait.as_millis().to_string(), address]);
    } else {
        command.args(["-c", &count.to_string(), "-W", &wait.as_secs().to_string(), address]);
    }

    let output = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let samples = parse_ping_output(&stdout);

    if samples.is_empty() && !output.status.success() {
        tracing::debug!(
            "ping {} exited with {}: {}",
            address,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(samples)
}

/// Extract per-reply round-trip times (ms) from ping output.
///
/// Handles `time=12.3 ms`, `time<1ms` and the localized `время=12 мс`.
pub fn parse_ping_output(output: &str) -> Vec<f64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?:time|время)\s*[=<]\s*(?P<val>[0-9]+(?:[.,][0-9]+)?)").unwrap()
    });

    re.captures_iter(output)
        .filter_map(|caps| caps.name("val"))
        .filter_map(|m| m.as_str().replace(',', ".").parse::<f64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPing(Vec<f64>);

    impl PingRunner for FixedPing {
        async fn run(&self, _target: &str, count: u32, _timeout: Duration) -> Result<Vec<f64>, ProbeError> {
            Ok(self.0.iter().copied().take(count as usize).collect())
        }
    }

    struct BrokenPing;

    impl PingRunner for BrokenPing {
        async fn run(&self, _target: &str, _count: u32, _timeout: Duration) -> Result<Vec<f64>, ProbeError> {
            Err(ProbeError::Command("no ping binary".to_string()))
        }
    }

    #[test]
    fn test_jitter_is_sample_stddev() {
        let stats = PingStats::from_samples(&[10.0, 20.0, 30.0], 3);
        assert_eq!(stats.avg_ms, Some(20.0));
        assert!((stats.jitter_ms.unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(stats.packet_loss_pct, Some(0.0));
    }

    #[test]
    fn test_single_sample_has_zero_jitter() {
        let stats = PingStats::from_samples(&[42.0], 3);
        assert_eq!(stats.avg_ms, Some(42.0));
        assert_eq!(stats.jitter_ms, Some(0.0));
        assert!((stats.packet_loss_pct.unwrap() - 66.67).abs() < 0.01);
    }

    #[test]
    fn test_no_samples() {
        let stats = PingStats::from_samples(&[], 4);
        assert_eq!(stats.avg_ms, None);
        assert_eq!(stats.jitter_ms, None);
        assert_eq!(stats.packet_loss_pct, Some(100.0));
    }

    #[test]
    fn test_icmp_checksum_verifies() {
        let packet = build_echo_request(8, 0x1234, 0x0001);
        // A packet carrying its own checksum sums to zero
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_echo_request() {
        let packet = build_echo_request(8, 0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);

        let v6 = build_echo_request(128, 1, 2);
        assert_eq!(v6[0], 128);
        assert_eq!(v6[2..4], [0, 0]);
    }

    #[test]
    fn test_matching_reply_dgram_ignores_identifier() {
        let mut reply = vec![0u8; 8];
        reply[4..6].copy_from_slice(&0x9999u16.to_be_bytes());
        reply[6..8].copy_from_slice(&7u16.to_be_bytes());
        assert!(is_matching_reply(&reply, 0, false, 0x1234, 7));
        assert!(!is_matching_reply(&reply, 0, true, 0x1234, 7));
        assert!(!is_matching_reply(&reply, 0, false, 0x1234, 8));
    }

    #[test]
    fn test_matching_reply_skips_ipv4_header() {
        let mut reply = vec![0u8; 28];
        reply[0] = 0x45;
        reply[20] = 0;
        reply[24..26].copy_from_slice(&0x1234u16.to_be_bytes());
        reply[26..28].copy_from_slice(&3u16.to_be_bytes());
        assert!(is_matching_reply(&reply, 0, true, 0x1234, 3));
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms
64 bytes from 8.8.8.8: icmp_seq=3 ttl=117 time=14.1 ms

--- 8.8.8.8 ping statistics ---
3 packets transmitted, 2 received, 33.3333% packet loss, time 2003ms
rtt min/avg/max/mdev = 12.300/13.200/14.100/0.900 ms"#;
        assert_eq!(parse_ping_output(output), vec![12.3, 14.1]);
    }

    #[test]
    fn test_parse_ping_output_windows() {
        let output = "Reply from 8.8.8.8: bytes=32 time=17ms TTL=117\nReply from 8.8.8.8: bytes=32 time<1ms TTL=117";
        assert_eq!(parse_ping_output(output), vec![17.0, 1.0]);
    }

    #[test]
    fn test_parse_ping_output_localized() {
        let output = "Ответ от 8.8.8.8: число байт=32 время=21мс TTL=117\nОтвет от 8.8.8.8: время=19,5 мс";
        assert_eq!(parse_ping_output(output), vec![21.0, 19.5]);
    }

    #[test]
    fn test_parse_ping_output_total_loss() {
        let output = "3 packets transmitted, 0 received, 100% packet loss, time 2036ms";
        assert!(parse_ping_output(output).is_empty());
    }

    #[tokio::test]
    async fn test_run_ping_probe_with_partial_replies() {
        let runner = FixedPing(vec![5.0]);
        let result = run_ping_probe(&runner, "host", 3, Duration::from_millis(100)).await;
        assert!(result.success);
        assert_eq!(result.latencies, vec![5.0]);
    }

    #[tokio::test]
    async fn test_run_ping_probe_backend_error() {
        let result = run_ping_probe(&BrokenPing, "host", 3, Duration::from_millis(100)).await;
        assert!(!result.success);
        assert!(result.latencies.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_ping_budget_covers_command_pacing() {
        // 2 gaps of 1 s + 3 waits rounded up to 1 s + overhead
        assert_eq!(ping_budget(3, Duration::from_millis(300)), Duration::from_millis(5250));
        assert_eq!(ping_budget(1, Duration::from_millis(300)), Duration::from_millis(1250));
        // Long timeouts are dominated by the native bound
        assert_eq!(ping_budget(2, Duration::from_secs(4)), Duration::from_millis(12250));
        assert_eq!(command_wait(Duration::from_millis(1500)), Duration::from_secs(2));
    }

    /// Runs a shell script in place of the system ping utility.
    #[cfg(unix)]
    struct ScriptPing(std::path::PathBuf);

    #[cfg(unix)]
    impl PingRunner for ScriptPing {
        async fn run(&self, target: &str, count: u32, timeout: Duration) -> Result<Vec<f64>, ProbeError> {
            let mut command = Command::new("sh");
            command.arg(&self.0);
            run_ping_program(command, target, count, timeout).await
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_ping_with_subsecond_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ping.sh");
        std::fs::write(
            &script,
            r#"echo "PING 127.0.0.1 (127.0.0.1) 56(84) bytes of data."
for seq in 1 2 3; do
  echo "64 bytes from 127.0.0.1: icmp_seq=$seq ttl=64 time=0.05 ms"
  if [ "$seq" -lt 3 ]; then sleep 1; fi
done
exit 0
"#,
        )
        .unwrap();

        let runner = ScriptPing(script);
        let result = run_ping_probe(&runner, "127.0.0.1", 3, Duration::from_millis(300)).await;
        assert!(result.success);
        assert_eq!(result.latencies, vec![0.05, 0.05, 0.05]);
    }
}
