// ABOUTME: Individual probes: plain HTTP via hyper, TCP connect, and remote commands.
// ABOUTME: Each poll yields an Observation; probes never fail the caller directly.

use super::ProbeError;
use crate::ssh::{CommandRunner, TargetHost};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::Uri;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Bytes of response body kept for `expect_body` matching.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// The condition holds.
    Healthy(String),
    /// The target answered, but not the way it should (HTTP 500, exit 1).
    Unhealthy(String),
    /// The target could not be reached at all.
    Unreachable(String),
}

impl Observation {
    pub fn detail(&self) -> &str {
        match self {
            Observation::Healthy(d) | Observation::Unhealthy(d) | Observation::Unreachable(d) => d,
        }
    }
}

/// One way of checking a condition.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn observe(&self) -> Observation;
}

/// GET over plain HTTP/1.1.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    uri: Uri,
    host: String,
    port: u16,
    expect_status: u16,
    expect_body: Option<String>,
}

impl HttpProbe {
    pub fn new(
        url: &str,
        expect_status: u16,
        expect_body: Option<String>,
    ) -> Result<Self, ProbeError> {
        let uri = url.parse::<Uri>().map_err(|e| ProbeError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        match uri.scheme_str() {
            Some("http") => {}
            Some(scheme) => {
                return Err(ProbeError::UnsupportedScheme {
                    url: url.to_string(),
                    scheme: scheme.to_string(),
                });
            }
            None => {
                return Err(ProbeError::InvalidUrl {
                    url: url.to_string(),
                    reason: "missing scheme".to_string(),
                });
            }
        }

        let host = uri
            .host()
            .ok_or_else(|| ProbeError::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_string();
        let port = uri.port_u16().unwrap_or(80);

        Ok(Self {
            uri,
            host,
            port,
            expect_status,
            expect_body,
        })
    }

    async fn request(&self) -> Result<(u16, String), String> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| format!("connect to {}:{} failed: {}", self.host, self.port, e))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| format!("HTTP handshake failed: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("health probe connection error: {}", e);
            }
        });

        let path = self
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let authority = self
            .uri
            .authority()
            .map(|a| a.as_str())
            .unwrap_or(self.host.as_str());

        let req = hyper::Request::builder()
            .method("GET")
            .uri(path)
            .header(hyper::header::HOST, authority)
            .header(hyper::header::USER_AGENT, "shipwright-health")
            .body(Empty::<Bytes>::new())
            .map_err(|e| format!("failed to build request: {}", e))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| format!("request failed: {}", e))?;
        let status = resp.status().as_u16();

        let mut body = resp.into_body();
        let mut kept = Vec::new();
        while kept.len() < MAX_BODY_BYTES {
            let Some(frame) = body.frame().await else {
                break;
            };
            let frame = frame.map_err(|e| format!("failed to read response: {}", e))?;
            if let Ok(data) = frame.into_data() {
                let room = MAX_BODY_BYTES - kept.len();
                kept.extend_from_slice(&data[..data.len().min(room)]);
            }
        }
        Ok((status, String::from_utf8_lossy(&kept).into_owned()))
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn observe(&self) -> Observation {
        let (status, body) = match self.request().await {
            Ok(response) => response,
            Err(e) => return Observation::Unreachable(e),
        };

        if status != self.expect_status {
            return Observation::Unhealthy(format!(
                "HTTP {} (expected {})",
                status, self.expect_status
            ));
        }
        if let Some(expected) = &self.expect_body
            && !body.contains(expected.as_str())
        {
            return Observation::Unhealthy(format!(
                "HTTP {} without expected body {:?}",
                status, expected
            ));
        }
        Observation::Healthy(format!("HTTP {}", status))
    }
}

/// A TCP connect to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn observe(&self) -> Observation {
        match TcpStream::connect(self.address.as_str()).await {
            Ok(_) => Observation::Healthy(format!("{} accepts connections", self.address)),
            Err(e) => Observation::Unreachable(format!("{}: {}", self.address, e)),
        }
    }
}

/// A command on the target host; exit status 0 means healthy.
pub struct RemoteProbe {
    runner: Arc<dyn CommandRunner>,
    host: TargetHost,
    command: String,
    timeout: Duration,
}

impl RemoteProbe {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        host: TargetHost,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            host,
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Probe for RemoteProbe {
    async fn observe(&self) -> Observation {
        match self.runner.run(&self.host, &self.command, self.timeout).await {
            Ok(output) if output.success() => Observation::Healthy(output.stdout.trim().to_string()),
            Ok(output) => {
                let detail = if output.stderr.trim().is_empty() {
                    output.stdout.trim()
                } else {
                    output.stderr.trim()
                };
                Observation::Unhealthy(format!("exit {}: {}", output.exit_code, detail))
            }
            Err(e) => Observation::Unreachable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: impl Into<String>) -> u16 {
        let response = response.into();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            // The client may hang up early on long bodies.
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        port
    }

    #[test]
    fn rejects_https_and_garbage_urls() {
        assert!(matches!(
            HttpProbe::new("https://example.org/health", 200, None),
            Err(ProbeError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            HttpProbe::new("/health", 200, None),
            Err(ProbeError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn http_probe_checks_status_and_body() {
        let port = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;
        let probe = HttpProbe::new(
            &format!("http://127.0.0.1:{}/health", port),
            200,
            Some("ok".to_string()),
        )
        .unwrap();
        assert_eq!(probe.observe().await, Observation::Healthy("HTTP 200".to_string()));
    }

    #[tokio::test]
    async fn http_probe_reports_server_errors_as_unhealthy() {
        let port = serve_once(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let probe = HttpProbe::new(&format!("http://127.0.0.1:{}/", port), 200, None).unwrap();
        assert!(matches!(probe.observe().await, Observation::Unhealthy(_)));
    }

    #[tokio::test]
    async fn only_the_head_of_a_long_body_is_matched() {
        let body = format!("{}tail", "x".repeat(100_000));
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );

        let port = serve_once(response.clone()).await;
        let probe =
            HttpProbe::new(&format!("http://127.0.0.1:{}/", port), 200, Some("tail".into()))
                .unwrap();
        assert!(matches!(probe.observe().await, Observation::Unhealthy(_)));

        let port = serve_once(response).await;
        let probe =
            HttpProbe::new(&format!("http://127.0.0.1:{}/", port), 200, Some("xxx".into()))
                .unwrap();
        assert_eq!(probe.observe().await, Observation::Healthy("HTTP 200".to_string()));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(matches!(
            TcpProbe::new(address).observe().await,
            Observation::Unreachable(_)
        ));
    }
}
