use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{RelayError, Result};
use crate::protocol::Envelope;

/// Unique connection identifier
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// What this connection is allowed to do on the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Originating client (rooms, circuit origination)
    Client,
    /// Upstream/downstream relay link
    Relay,
}

/// Byte and message counters for one connection. All writers go through
/// atomics so the bridge pumps and the dispatch path never contend.
#[derive(Debug)]
pub struct TransferStats {
    bytes_sent: AtomicI64,
    bytes_received: AtomicI64,
    messages_sent: AtomicI64,
    messages_received: AtomicI64,
    start: Instant,
    /// Millis since `start`, updated on every counter bump.
    last_activity_ms: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        TransferStats {
            bytes_sent: AtomicI64::new(0),
            bytes_received: AtomicI64::new(0),
            messages_sent: AtomicI64::new(0),
            messages_received: AtomicI64::new(0),
            start: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.start.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: i64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn add_bytes_received(&self, n: i64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn add_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn add_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn total_bytes(&self) -> i64 {
        self.bytes_sent.load(Ordering::Relaxed) + self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn total_messages(&self) -> i64 {
        self.messages_sent.load(Ordering::Relaxed)
            + self.messages_received.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let sent = self.bytes_sent.load(Ordering::Relaxed);
        let recv = self.bytes_received.load(Ordering::Relaxed);
        let msg_sent = self.messages_sent.load(Ordering::Relaxed);
        let msg_recv = self.messages_received.load(Ordering::Relaxed);
        StatsSnapshot {
            bytes_sent: sent,
            bytes_received: recv,
            total_bytes: sent + recv,
            messages_sent: msg_sent,
            messages_received: msg_recv,
            total_messages: msg_sent + msg_recv,
            duration_secs: self.duration().as_secs_f64(),
            idle_secs: self.idle_time().as_secs_f64(),
        }
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time stats snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub total_bytes: i64,
    pub messages_sent: i64,
    pub messages_received: i64,
    pub total_messages: i64,
    pub duration_secs: f64,
    pub idle_secs: f64,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct FramedReader {
    inner: BoxedReader,
    buf: BytesMut,
}

/// One framed transport connection.
///
/// Read and write halves carry independent locks so a bridge pump can read
/// from one peer while the dispatcher writes to it. Neither lock is ever
/// held while touching a manager table.
pub struct PeerConnection {
    id: ConnectionId,
    addr: String,
    role: PeerRole,
    reader: Mutex<FramedReader>,
    writer: Mutex<BoxedWriter>,
    pub stats: TransferStats,
    closed: AtomicBool,
    circuits: StdMutex<HashSet<String>>,
    read_timeout: Duration,
    write_timeout: Duration,
    max_frame_len: usize,
}

impl PeerConnection {
    pub fn new<S>(
        stream: S,
        addr: String,
        role: PeerRole,
        read_timeout: Duration,
        write_timeout: Duration,
        max_frame_len: usize,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        PeerConnection {
            id: next_connection_id(),
            addr,
            role,
            reader: Mutex::new(FramedReader {
                inner: Box::new(r),
                buf: BytesMut::with_capacity(8 * 1024),
            }),
            writer: Mutex::new(Box::new(w)),
            stats: TransferStats::new(),
            closed: AtomicBool::new(false),
            circuits: StdMutex::new(HashSet::new()),
            read_timeout,
            write_timeout,
            max_frame_len,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read the next complete envelope. `Ok(None)` means the peer closed the
    /// stream cleanly at a frame boundary.
    pub async fn recv(&self) -> Result<Option<Envelope>> {
        self.recv_with_timeout(self.read_timeout).await
    }

    /// Like `recv`, but with a caller-supplied deadline. Used by the bridge
    /// pumps, which run their own idle watchdog instead of the per-read one.
    pub async fn recv_with_timeout(&self, deadline: Duration) -> Result<Option<Envelope>> {
        let mut reader = self.reader.lock().await;
        loop {
            if let Some(env) = Envelope::decode(&mut reader.buf, self.max_frame_len)? {
                self.stats.add_message_received();
                self.stats.add_bytes_received(env.payload.len() as i64);
                return Ok(Some(env));
            }
            let mut chunk = [0u8; 8 * 1024];
            let n = timeout(deadline, reader.inner.read(&mut chunk))
                .await
                .map_err(|_| RelayError::Connection(format!("read timeout from {}", self.addr)))??;
            if n == 0 {
                if reader.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RelayError::Connection(format!(
                    "{} closed mid-frame with {} buffered bytes",
                    self.addr,
                    reader.buf.len()
                )));
            }
            reader.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Write one envelope. Fails fast once the connection is closed.
    pub async fn send(&self, env: &Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::Connection(format!("{} already closed", self.addr)));
        }
        let wire = env.encode()?;
        let mut writer = self.writer.lock().await;
        timeout(self.write_timeout, async {
            writer.write_all(&wire).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| RelayError::Connection(format!("write timeout to {}", self.addr)))??;
        self.stats.add_message_sent();
        self.stats.add_bytes_sent(env.payload.len() as i64);
        Ok(())
    }

    /// Shut down the write half. Safe to call more than once; only the
    /// first call performs the shutdown.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Associate a circuit with this connection for teardown bookkeeping.
    pub fn attach_circuit(&self, circuit_id: &str) {
        if let Ok(mut set) = self.circuits.lock() {
            set.insert(circuit_id.to_string());
        }
    }

    pub fn detach_circuit(&self, circuit_id: &str) {
        if let Ok(mut set) = self.circuits.lock() {
            set.remove(circuit_id);
        }
    }

    /// Circuits that ride this connection, for destroy-on-disconnect.
    pub fn circuit_ids(&self) -> Vec<String> {
        self.circuits
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageType, DEFAULT_MAX_FRAME_LEN};
    use bytes::Bytes;

    fn pair() -> (PeerConnection, PeerConnection) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let mk = |s, addr: &str| {
            PeerConnection::new(
                s,
                addr.to_string(),
                PeerRole::Client,
                Duration::from_secs(5),
                Duration::from_secs(5),
                DEFAULT_MAX_FRAME_LEN,
            )
        };
        (mk(a, "1.1.1.1:1000"), mk(b, "2.2.2.2:2000"))
    }

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let (a, b) = pair();
        let env = Envelope::new(
            MessageType::Data,
            42,
            "",
            Bytes::from_static(b"hello"),
        );
        a.send(&env).await.unwrap();
        let got = b.recv().await.unwrap().unwrap();
        assert_eq!(got, env);
        assert_eq!(a.stats.total_messages(), 1);
        assert_eq!(b.stats.total_messages(), 1);
        assert_eq!(b.stats.snapshot().bytes_received, 5);
    }

    #[tokio::test]
    async fn test_recv_clean_eof_returns_none() {
        let (a, b) = pair();
        a.close().await;
        assert!(b.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_mid_frame_eof_is_error() {
        let (a, b) = tokio::io::duplex(1024);
        let peer = PeerConnection::new(
            b,
            "peer".to_string(),
            PeerRole::Client,
            Duration::from_secs(5),
            Duration::from_secs(5),
            DEFAULT_MAX_FRAME_LEN,
        );
        let mut a = a;
        // Half a frame header, then EOF.
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);
        assert!(peer.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (_a, b) = tokio::io::duplex(1024);
        let peer = PeerConnection::new(
            b,
            "peer".to_string(),
            PeerRole::Client,
            Duration::from_millis(20),
            Duration::from_secs(5),
            DEFAULT_MAX_FRAME_LEN,
        );
        let err = peer.recv().await.unwrap_err();
        assert!(format!("{}", err).contains("read timeout"));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (a, _b) = pair();
        a.close().await;
        let env = Envelope::new(MessageType::Ping, 1, "", Bytes::new());
        assert!(a.send(&env).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, _b) = pair();
        a.close().await;
        a.close().await;
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let (a, b) = pair();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_circuit_attachment() {
        let (a, _b) = {
            let (x, y) = tokio::io::duplex(1024);
            let mk = |s| {
                PeerConnection::new(
                    s,
                    "p".to_string(),
                    PeerRole::Relay,
                    Duration::from_secs(1),
                    Duration::from_secs(1),
                    DEFAULT_MAX_FRAME_LEN,
                )
            };
            (mk(x), mk(y))
        };
        a.attach_circuit("c1");
        a.attach_circuit("c2");
        a.attach_circuit("c1");
        let mut ids = a.circuit_ids();
        ids.sort();
        assert_eq!(ids, vec!["c1", "c2"]);
        a.detach_circuit("c1");
        assert_eq!(a.circuit_ids(), vec!["c2"]);
    }

    #[test]
    fn test_stats_idle_time_tracks_activity() {
        let stats = TransferStats::new();
        std::thread::sleep(Duration::from_millis(15));
        stats.add_bytes_sent(100);
        assert!(stats.idle_time() < Duration::from_millis(10));
        assert_eq!(stats.total_bytes(), 100);
    }
}
