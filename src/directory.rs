//! Directory service client
//!
//! A relay configured with a directory URL announces itself at startup,
//! heartbeats so the directory can track liveness, and withdraws its
//! listing on shutdown. Everything here is best-effort: the relay serves
//! traffic whether or not the directory ever hears from it.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::logger::log;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const REGISTER_ATTEMPTS: u32 = 5;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// What the directory learns about this relay at registration.
#[derive(Debug, Clone, Serialize)]
pub struct RelayAnnouncement {
    pub id: String,
    /// Hex-encoded key-exchange public key.
    pub public_key: String,
    /// Address clients should dial, which may differ from the bind address
    /// behind NAT or a load balancer.
    pub endpoint: String,
    pub mode: String,
    pub version: String,
    /// Advertised capacity in bytes/sec; zero means unlimited. Advisory
    /// only, the relay does not enforce it.
    pub max_bandwidth: u64,
    pub fingerprint: String,
}

#[derive(Debug, Serialize)]
struct Heartbeat<'a> {
    id: &'a str,
    uptime_secs: u64,
}

pub struct DirectoryClient {
    base_url: String,
    http: reqwest::Client,
}

impl DirectoryClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(DirectoryClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn register(&self, announcement: &RelayAnnouncement) -> anyhow::Result<()> {
        let url = format!("{}/relays/register", self.base_url);
        self.http
            .post(&url)
            .json(announcement)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn heartbeat(&self, id: &str, uptime: Duration) -> anyhow::Result<()> {
        let url = format!("{}/relays/register", self.base_url);
        self.http
            .put(&url)
            .json(&Heartbeat {
                id,
                uptime_secs: uptime.as_secs(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn unregister(&self, id: &str) -> anyhow::Result<()> {
        let url = format!("{}/relays/{}", self.base_url, id);
        self.http.delete(&url).send().await?.error_for_status()?;
        Ok(())
    }
}

/// Register with backoff, heartbeat until shutdown, then withdraw the
/// listing.
pub async fn run(base_url: &str, announcement: RelayAnnouncement, shutdown: CancellationToken) {
    let client = match DirectoryClient::new(base_url) {
        Ok(client) => client,
        Err(e) => {
            log::error!(error = %e, "Directory client setup failed");
            return;
        }
    };

    let mut registered = false;
    for attempt in 0..REGISTER_ATTEMPTS {
        if attempt > 0 {
            let backoff = Duration::from_secs(5) * (attempt + 1);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
        match client.register(&announcement).await {
            Ok(()) => {
                log::info!(
                    directory = base_url,
                    relay_id = %announcement.id,
                    "Registered with directory"
                );
                registered = true;
                break;
            }
            Err(e) => {
                log::warn!(attempt = attempt + 1, error = %e, "Directory registration failed");
            }
        }
    }
    if !registered {
        log::error!(directory = base_url, "Giving up on directory registration");
        return;
    }

    let started = Instant::now();
    let mut ticker = tokio::time::interval_at(started + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = client.heartbeat(&announcement.id, started.elapsed()).await {
                    log::warn!(error = %e, "Directory heartbeat failed");
                }
            }
        }
    }

    if let Err(e) = client.unregister(&announcement.id).await {
        log::debug!(error = %e, "Directory unregister failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn announcement() -> RelayAnnouncement {
        RelayAnnouncement {
            id: "relay-1".to_string(),
            public_key: "ab".repeat(32),
            endpoint: "relay1.example.net:9000".to_string(),
            mode: "any".to_string(),
            version: "0.4.2".to_string(),
            max_bandwidth: 0,
            fingerprint: "cd".repeat(16),
        }
    }

    /// Accept one request, answer 200, and hand back head and body.
    async fn serve_one(listener: tokio::net::TcpListener) -> (String, String) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer closed before the request completed");
            buf.extend_from_slice(&chunk[..n]);
            let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..pos]).to_string();
            let body_len = head
                .lines()
                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < pos + 4 + body_len {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "peer closed mid-body");
                buf.extend_from_slice(&chunk[..n]);
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
            stream.flush().await.unwrap();
            let body = String::from_utf8_lossy(&buf[pos + 4..]).to_string();
            return (head, body);
        }
    }

    #[test]
    fn test_announcement_field_names() {
        let value = serde_json::to_value(announcement()).unwrap();
        for key in [
            "id",
            "public_key",
            "endpoint",
            "mode",
            "version",
            "max_bandwidth",
            "fingerprint",
        ] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(value["id"], "relay-1");
        assert_eq!(value["mode"], "any");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = DirectoryClient::new("http://dir.example.net/").unwrap();
        assert_eq!(client.base_url, "http://dir.example.net");
    }

    #[tokio::test]
    async fn test_register_posts_announcement() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = tokio::spawn(serve_one(listener));

        let client = DirectoryClient::new(&format!("http://{}", addr)).unwrap();
        client.register(&announcement()).await.unwrap();

        let (head, body) = served.await.unwrap();
        assert!(head.starts_with("POST /relays/register HTTP/1.1"), "{}", head);
        assert!(body.contains("\"id\":\"relay-1\""), "{}", body);
        assert!(body.contains("\"endpoint\":\"relay1.example.net:9000\""), "{}", body);
    }

    #[tokio::test]
    async fn test_unregister_deletes_listing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = tokio::spawn(serve_one(listener));

        let client = DirectoryClient::new(&format!("http://{}", addr)).unwrap();
        client.unregister("relay-1").await.unwrap();

        let (head, _) = served.await.unwrap();
        assert!(head.starts_with("DELETE /relays/relay-1 HTTP/1.1"), "{}", head);
    }

    #[tokio::test]
    async fn test_register_rejected_by_directory() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut chunk = [0u8; 4096];
            let _ = stream.read(&mut chunk).await;
            let _ = stream
                .write_all(b"HTTP/1.1 409 Conflict\r\ncontent-length: 0\r\n\r\n")
                .await;
        });

        let client = DirectoryClient::new(&format!("http://{}", addr)).unwrap();
        assert!(client.register(&announcement()).await.is_err());
    }
}
