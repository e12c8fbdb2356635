use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::peer::PeerConnection;
use crate::protocol::{Envelope, MessageType};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Total bytes (both directions) before the session is cut.
    pub max_bytes: u64,
    pub idle_timeout: Duration,
    pub watchdog_interval: Duration,
    /// Per-read deadline inside the pumps; idleness is the watchdog's job,
    /// so this only bounds a wedged read.
    pub read_timeout: Duration,
    /// How often the relay pings both peers to keep NATs and dead-peer
    /// detection honest.
    pub ping_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            max_bytes: 10 * 1024 * 1024 * 1024,
            idle_timeout: Duration::from_secs(300),
            watchdog_interval: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Why a bridge session ended. The first reason recorded wins; later
/// writers lose silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Peer1Disconnect,
    Peer2Disconnect,
    IdleTimeout,
    ByteLimitExceeded,
    Normal,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Peer1Disconnect => "peer1_disconnect",
            TerminationReason::Peer2Disconnect => "peer2_disconnect",
            TerminationReason::IdleTimeout => "idle_timeout",
            TerminationReason::ByteLimitExceeded => "byte_limit_exceeded",
            TerminationReason::Normal => "normal",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final accounting for one bridge session.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    pub bytes_1_to_2: u64,
    pub bytes_2_to_1: u64,
    pub messages_1_to_2: u64,
    pub messages_2_to_1: u64,
    pub duration_secs: f64,
    pub reason: &'static str,
}

impl BridgeStats {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_1_to_2 + self.bytes_2_to_1
    }

    pub fn total_messages(&self) -> u64 {
        self.messages_1_to_2 + self.messages_2_to_1
    }
}

struct Shared {
    bytes_1_to_2: AtomicU64,
    bytes_2_to_1: AtomicU64,
    messages_1_to_2: AtomicU64,
    messages_2_to_1: AtomicU64,
    start: Instant,
    /// Millis since `start`, bumped on every forwarded frame.
    last_activity_ms: AtomicU64,
    /// Bytes claimed by the pumps before forwarding; may overshoot
    /// `max_bytes`, the per-direction counters never do.
    reserved: AtomicU64,
    reason: OnceLock<TerminationReason>,
    done: CancellationToken,
    max_bytes: u64,
}

impl Shared {
    fn touch(&self) {
        let ms = self.start.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }

    /// Claim `len` bytes of the session budget. Both pumps reserve before
    /// they forward, so two concurrent frames cannot both slip under the
    /// ceiling.
    fn reserve(&self, len: u64) -> bool {
        let prior = self.reserved.fetch_add(len, Ordering::Relaxed);
        prior + len <= self.max_bytes
    }

    /// Record a termination reason and signal both pumps. Only the first
    /// caller's reason survives.
    fn finish(&self, reason: TerminationReason) {
        let _ = self.reason.set(reason);
        self.done.cancel();
    }
}

/// Pump frames between two peers until one side ends the session.
///
/// Blocks until both pumps and the watchdog have exited; the returned stats
/// carry the first termination reason recorded. Cancelling `parent` ends the
/// session with reason `normal`.
pub async fn run(
    peer1: Arc<PeerConnection>,
    peer2: Arc<PeerConnection>,
    config: BridgeConfig,
    parent: &CancellationToken,
) -> BridgeStats {
    let shared = Arc::new(Shared {
        bytes_1_to_2: AtomicU64::new(0),
        bytes_2_to_1: AtomicU64::new(0),
        messages_1_to_2: AtomicU64::new(0),
        messages_2_to_1: AtomicU64::new(0),
        start: Instant::now(),
        last_activity_ms: AtomicU64::new(0),
        reserved: AtomicU64::new(0),
        reason: OnceLock::new(),
        done: parent.child_token(),
        max_bytes: config.max_bytes,
    });

    let pump_1_to_2 = tokio::spawn(pump(
        Arc::clone(&peer1),
        Arc::clone(&peer2),
        Arc::clone(&shared),
        Direction::OneToTwo,
        config.read_timeout,
    ));
    let pump_2_to_1 = tokio::spawn(pump(
        Arc::clone(&peer2),
        Arc::clone(&peer1),
        Arc::clone(&shared),
        Direction::TwoToOne,
        config.read_timeout,
    ));

    let watchdog = {
        let shared = Arc::clone(&shared);
        let peer1 = Arc::clone(&peer1);
        let peer2 = Arc::clone(&peer2);
        let interval = config.watchdog_interval;
        let idle_timeout = config.idle_timeout;
        let ping_interval = config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval() fires immediately; the first ping waits a full
            // period instead.
            let mut ping_ticker =
                tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
            ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shared.done.cancelled() => break,
                    _ = ticker.tick() => {
                        if shared.idle_for() > idle_timeout {
                            shared.finish(TerminationReason::IdleTimeout);
                            break;
                        }
                    }
                    _ = ping_ticker.tick() => {
                        // Best effort; a dead peer surfaces in its pump.
                        let ping = Envelope::new(MessageType::Ping, 0, "", Bytes::new());
                        let _ = peer1.send(&ping).await;
                        let _ = peer2.send(&ping).await;
                    }
                }
            }
        })
    };

    let _ = pump_1_to_2.await;
    let _ = pump_2_to_1.await;
    let _ = watchdog.await;

    let reason = shared
        .reason
        .get()
        .copied()
        .unwrap_or(TerminationReason::Normal);

    // Tell the surviving side its counterpart is gone, best effort.
    let notice = Envelope::new(MessageType::PeerLeft, 0, "", Bytes::new());
    match reason {
        TerminationReason::Peer1Disconnect => {
            let _ = peer2.send(&notice).await;
        }
        TerminationReason::Peer2Disconnect => {
            let _ = peer1.send(&notice).await;
        }
        _ => {}
    }

    // Stop accepting writes on both sides; the session is over regardless
    // of which side ended it.
    peer1.close().await;
    peer2.close().await;

    BridgeStats {
        bytes_1_to_2: shared.bytes_1_to_2.load(Ordering::Relaxed),
        bytes_2_to_1: shared.bytes_2_to_1.load(Ordering::Relaxed),
        messages_1_to_2: shared.messages_1_to_2.load(Ordering::Relaxed),
        messages_2_to_1: shared.messages_2_to_1.load(Ordering::Relaxed),
        duration_secs: shared.start.elapsed().as_secs_f64(),
        reason: reason.as_str(),
    }
}

#[derive(Clone, Copy)]
enum Direction {
    OneToTwo,
    TwoToOne,
}

impl Direction {
    fn disconnect_reason(self) -> TerminationReason {
        match self {
            Direction::OneToTwo => TerminationReason::Peer1Disconnect,
            Direction::TwoToOne => TerminationReason::Peer2Disconnect,
        }
    }
}

async fn pump(
    from: Arc<PeerConnection>,
    to: Arc<PeerConnection>,
    shared: Arc<Shared>,
    dir: Direction,
    read_timeout: Duration,
) {
    loop {
        let received = tokio::select! {
            _ = shared.done.cancelled() => return,
            r = from.recv_with_timeout(read_timeout) => r,
        };
        let env = match received {
            Ok(Some(env)) => env,
            Ok(None) | Err(_) => {
                shared.finish(dir.disconnect_reason());
                return;
            }
        };

        match env.msg_type {
            // Liveness probes are answered locally, never forwarded.
            MessageType::Ping => {
                let pong = Envelope::new(MessageType::Pong, env.request_id, "", Bytes::new());
                if from.send(&pong).await.is_err() {
                    shared.finish(dir.disconnect_reason());
                    return;
                }
                continue;
            }
            MessageType::Pong => continue,
            _ => {}
        }

        let len = env.payload.len() as u64;
        if !shared.reserve(len) {
            shared.finish(TerminationReason::ByteLimitExceeded);
            return;
        }
        if to.send(&env).await.is_err() {
            shared.finish(match dir {
                Direction::OneToTwo => TerminationReason::Peer2Disconnect,
                Direction::TwoToOne => TerminationReason::Peer1Disconnect,
            });
            return;
        }
        match dir {
            Direction::OneToTwo => {
                shared.bytes_1_to_2.fetch_add(len, Ordering::Relaxed);
                shared.messages_1_to_2.fetch_add(1, Ordering::Relaxed);
            }
            Direction::TwoToOne => {
                shared.bytes_2_to_1.fetch_add(len, Ordering::Relaxed);
                shared.messages_2_to_1.fetch_add(1, Ordering::Relaxed);
            }
        }
        shared.touch();
    }
}
