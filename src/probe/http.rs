//! HTTP probe implementation.
//!
//! A `reqwest` client does the primary GET. When it fails at the transport
//! level the probe retries once with a minimal client: raw HTTP/1.1 over TCP
//! for `http://` URLs, a proxy-less HTTP/1 client for `https://` URLs.

use std::time::{Duration, Instant};

use reqwest::Url;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{bounded, elapsed_ms, probe_budget, ProbeError, ProbeKind, ProbeResult};

/// Cap on bytes read while looking for the status line.
const STATUS_LINE_LIMIT: usize = 4096;

/// Reusable HTTP probe with its primary and fallback clients.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    timeout: Duration,
    client: reqwest::Client,
    direct_client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;

        let direct_client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .http1_only()
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;

        Ok(Self {
            url: url.to_string(),
            timeout,
            client,
            direct_client,
        })
    }

    /// Run the probe. Success iff the response status is 200.
    pub async fn run(&self) -> ProbeResult {
        bounded(ProbeKind::Http, probe_budget(self.timeout, 2.0), async {
            let (status, latency) = match timed_get(&self.client, &self.url, self.timeout).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::debug!("primary HTTP client failed for {}: {}, trying fallback", self.url, e);
                    self.fallback_get().await?
                }
            };

            if status == 200 {
                Ok(ProbeResult::success(latency))
            } else {
                Err(ProbeError::Http(format!("unexpected status {}", status)))
            }
        })
        .await
    }

    async fn fallback_get(&self) -> Result<(u16, f64), ProbeError> {
        let url = Url::parse(&self.url).map_err(|e| ProbeError::Config(e.to_string()))?;
        match url.scheme() {
            "http" => raw_get(&url, self.timeout).await,
            _ => timed_get(&self.direct_client, &self.url, self.timeout).await,
        }
    }
}

/// GET with a `reqwest` client; returns status and latency including the body.
async fn timed_get(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<(u16, f64), ProbeError> {
    let start = Instant::now();

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;
    let status = response.status().as_u16();

    let _body = response
        .bytes()
        .await
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    Ok((status, elapsed_ms(start)))
}

/// Minimal HTTP/1.1 GET over a plain TCP socket, timed up to the status line.
async fn raw_get(url: &Url, timeout: Duration) -> Result<(u16, f64), ProbeError> {
    let host = url
        .host_str()
        .ok_or_else(|| ProbeError::Config(format!("URL has no host: {}", url)))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    let host_header = match url.port() {
        Some(p) => format!("{}:{}", host, p),
        None => host.to_string(),
    };

    let start = Instant::now();
    let exchange = async {
        let mut stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ProbeError::Network(format!("connect failed: {}", e)))?;

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: linkwatch/{}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            path,
            host_header,
            env!("CARGO_PKG_VERSION")
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| ProbeError::Network(format!("write failed: {}", e)))?;

        let mut head = Vec::with_capacity(256);
        let mut chunk = [0u8; 512];
        while !head.windows(2).any(|w| w == b"\r\n") && head.len() < STATUS_LINE_LIMIT {
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| ProbeError::Network(format!("read failed: {}", e)))?;
            if n == 0 {
                break;
            }
            head.extend_from_slice(&chunk[..n]);
        }

        let text = String::from_utf8_lossy(&head);
        parse_status_line(&text)
            .ok_or_else(|| ProbeError::Http(format!("malformed response: {:?}", text.lines().next())))
    };

    let status = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;

    Ok((status, elapsed_ms(start)))
}

/// Parse the status code out of `HTTP/1.x NNN Reason`.
fn parse_status_line(response: &str) -> Option<u16> {
    let line = response.lines().next()?;
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK\r\n"), Some(200));
        assert_eq!(parse_status_line("HTTP/1.0 404 Not Found"), Some(404));
        assert_eq!(parse_status_line("SSH-2.0-OpenSSH"), None);
        assert_eq!(parse_status_line(""), None);
    }

    #[tokio::test]
    async fn test_raw_get_reads_status() {
        let port = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let url = Url::parse(&format!("http://127.0.0.1:{}/health?x=1", port)).unwrap();

        let (status, latency) = raw_get(&url, Duration::from_secs(1)).await.unwrap();
        assert_eq!(status, 200);
        assert!(latency >= 0.0);
    }

    #[tokio::test]
    async fn test_raw_get_non_200() {
        let port = serve_once("HTTP/1.1 503 Service Unavailable\r\n\r\n").await;
        let url = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();

        let (status, _) = raw_get(&url, Duration::from_secs(1)).await.unwrap();
        assert_eq!(status, 503);
    }

    /// Answer every connection with `response`, counting connections.
    async fn serve_counting(response: &'static str) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        (port, hits)
    }

    /// Probe whose primary client ignores proxy settings from the environment.
    fn local_probe(port: u16) -> HttpProbe {
        let timeout = Duration::from_secs(1);
        let mut probe = HttpProbe::new(&format!("http://127.0.0.1:{}/", port), timeout).unwrap();
        probe.client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .unwrap();
        probe
    }

    #[tokio::test]
    async fn test_http_probe_ok() {
        let (port, hits) = serve_counting("HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let result = local_probe(port).run().await;
        assert!(result.success);
        assert!(result.latency_ms().is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_probe_non_200_does_not_fall_back() {
        let (port, hits) =
            serve_counting("HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let result = local_probe(port).run().await;
        assert!(!result.success);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_probe_falls_back_on_transport_error() {
        let (port, hits) = serve_counting("HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;

        // Closed port standing in for a broken proxy
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let mut probe = local_probe(port);
        probe.client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .proxy(reqwest::Proxy::all(format!("http://127.0.0.1:{}", dead_port)).unwrap())
            .build()
            .unwrap();

        let result = probe.run().await;
        assert!(result.success);
        // Only the raw fallback reached the server
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_probe_invalid_url() {
        let probe = HttpProbe::new("http://256.256.256.256", Duration::from_millis(100)).unwrap();
        let result = probe.run().await;
        assert!(!result.success);
    }
}
