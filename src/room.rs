use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use dashmap::DashMap;
use rand::{Rng, RngCore};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::logger::log;
use crate::peer::{ConnectionId, PeerConnection};

/// Words for human-readable codes: easy to pronounce, phonetically
/// distinct, memorable.
const WORD_LIST: &[&str] = &[
    "alpha", "beta", "gamma", "delta", "echo",
    "foxtrot", "golf", "hotel", "india", "juliet",
    "kilo", "lima", "mike", "november", "oscar",
    "papa", "quebec", "romeo", "sierra", "tango",
    "uniform", "victor", "whiskey", "xray", "yankee",
    "zulu",
    "ocean", "river", "mountain", "forest", "desert",
    "sunset", "sunrise", "thunder", "lightning", "rainbow",
    "crystal", "diamond", "emerald", "sapphire", "ruby",
    "silver", "golden", "bronze", "copper", "iron",
    "falcon", "eagle", "phoenix", "dragon", "tiger",
    "panther", "cobra", "viper", "shark", "dolphin",
    "comet", "meteor", "nebula", "galaxy", "quasar",
    "pulsar", "nova", "cosmos", "orbit", "lunar",
    "solar", "stellar", "zenith", "horizon", "vertex",
    "cipher", "matrix", "vector", "prism", "quantum",
    "photon", "neutron", "proton", "electron", "plasma",
    "carbon", "helium", "neon", "argon", "xenon",
    "atlas", "titan", "apollo", "mercury", "venus",
    "mars", "jupiter", "saturn", "neptune", "pluto",
    "aurora", "blizzard", "cyclone", "tornado", "tsunami",
    "meadow", "valley", "canyon", "glacier", "volcano",
    "bamboo", "cedar", "maple", "willow", "sequoia",
    "jasper", "onyx", "opal", "pearl", "coral",
    "amber", "ivory", "jade", "marble", "granite",
    "crimson", "scarlet", "indigo", "violet", "azure",
    "magenta", "turquoise", "lavender", "burgundy", "olive",
];

const SEPARATOR: char = '-';

/// Generates and validates human-readable rendezvous codes.
#[derive(Debug, Clone)]
pub struct CodeGenerator {
    word_count: usize,
}

impl CodeGenerator {
    /// Word count is clamped to 2..=5; 3 gives roughly 21 bits of entropy
    /// against online guessing, which the rate limiter backs up.
    pub fn new(word_count: usize) -> Self {
        let word_count = if word_count < 2 { 3 } else { word_count.min(5) };
        CodeGenerator { word_count }
    }

    pub fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        let words: Vec<&str> = (0..self.word_count)
            .map(|_| WORD_LIST[rng.gen_range(0..WORD_LIST.len())])
            .collect();
        words.join(&SEPARATOR.to_string())
    }

    /// A valid code has exactly `word_count` words, all from the list.
    pub fn validate(&self, code: &str) -> bool {
        let parts: Vec<&str> = code.split(SEPARATOR).collect();
        if parts.len() != self.word_count {
            return false;
        }
        parts
            .iter()
            .all(|w| WORD_LIST.contains(&w.to_lowercase().as_str()))
    }

    /// Lowercase and map common separator variants. Idempotent.
    pub fn normalize(&self, code: &str) -> String {
        code.to_lowercase().replace([' ', '_'], "-")
    }

    pub fn word_count(&self) -> usize {
        self.word_count
    }

    pub fn entropy_bits(&self) -> f64 {
        self.word_count as f64 * (WORD_LIST.len() as f64).log2()
    }

    pub fn total_combinations(&self) -> u64 {
        (WORD_LIST.len() as u64).pow(self.word_count as u32)
    }
}

/// Snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub id: String,
    pub code: String,
    pub peer_count: usize,
    pub age_secs: f64,
    pub remaining_secs: f64,
    pub closed: bool,
}

/// A rendezvous point for at most two peers.
pub struct Room {
    id: String,
    code: String,
    created_at: Instant,
    expires_at: StdMutex<Instant>,
    peers: StdMutex<Vec<(ConnectionId, Arc<PeerConnection>)>>,
    closed: AtomicBool,
    /// Signalled when the second peer arrives or the room closes, so the
    /// creator can stop waiting.
    pub peer_joined: Notify,
}

impl Room {
    fn new(id: String, code: String, expiry: Duration) -> Self {
        let now = Instant::now();
        Room {
            id,
            code,
            created_at: now,
            expires_at: StdMutex::new(now + expiry),
            peers: StdMutex::new(Vec::with_capacity(2)),
            closed: AtomicBool::new(false),
            peer_joined: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at.lock() {
            Ok(at) => Instant::now() >= *at,
            Err(_) => true,
        }
    }

    pub fn time_remaining(&self) -> Duration {
        self.expires_at
            .lock()
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    pub fn extend_expiry(&self, by: Duration) {
        if let Ok(mut at) = self.expires_at.lock() {
            *at += by;
        }
    }

    /// Add a peer. Returns the peer's position (0 = creator side).
    pub fn add_peer(&self, peer: Arc<PeerConnection>) -> Result<usize> {
        if self.is_closed() || self.is_expired() {
            return Err(RelayError::RoomClosed);
        }
        let mut peers = self
            .peers
            .lock()
            .map_err(|_| RelayError::Other("room peer lock poisoned".to_string()))?;
        if peers.iter().any(|(id, _)| *id == peer.id()) {
            return Err(RelayError::PeerAlreadyInRoom);
        }
        if peers.len() >= 2 {
            return Err(RelayError::RoomFull);
        }
        let position = peers.len();
        peers.push((peer.id(), peer));
        drop(peers);
        if position == 1 {
            self.peer_joined.notify_waiters();
        }
        Ok(position)
    }

    pub fn remove_peer(&self, conn_id: ConnectionId) -> bool {
        match self.peers.lock() {
            Ok(mut peers) => {
                let before = peers.len();
                peers.retain(|(id, _)| *id != conn_id);
                peers.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn peers(&self) -> Vec<Arc<PeerConnection>> {
        self.peers
            .lock()
            .map(|p| p.iter().map(|(_, peer)| Arc::clone(peer)).collect())
            .unwrap_or_default()
    }

    /// The counterpart of `conn_id`, once both peers are present.
    pub fn other_peer(&self, conn_id: ConnectionId) -> Option<Arc<PeerConnection>> {
        self.peers.lock().ok().and_then(|peers| {
            peers
                .iter()
                .find(|(id, _)| *id != conn_id)
                .map(|(_, peer)| Arc::clone(peer))
        })
    }

    /// Close the room and wake any waiter. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.peer_joined.notify_waiters();
    }

    pub fn stats(&self) -> RoomStats {
        RoomStats {
            id: self.id.clone(),
            code: self.code.clone(),
            peer_count: self.peer_count(),
            age_secs: self.created_at.elapsed().as_secs_f64(),
            remaining_secs: self.time_remaining().as_secs_f64(),
            closed: self.is_closed(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_rooms: usize,
    pub default_expiry: Duration,
    pub max_expiry: Duration,
    pub sweep_interval: Duration,
    pub code_word_count: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        RoomConfig {
            max_rooms: 10_000,
            default_expiry: Duration::from_secs(24 * 3600),
            max_expiry: Duration::from_secs(72 * 3600),
            sweep_interval: Duration::from_secs(300),
            code_word_count: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomManagerStats {
    pub active_rooms: usize,
    pub total_created: u64,
    pub total_expired: u64,
}

const CODE_COLLISION_RETRIES: usize = 10;

/// Grace before an empty room may be garbage collected, so a creator has
/// time to send the first frame after CREATE_ROOM.
const EMPTY_ROOM_GRACE: Duration = Duration::from_secs(60);

/// Owns all rooms and the code index.
pub struct RoomManager {
    rooms: DashMap<String, Arc<Room>>,
    code_index: DashMap<String, String>,
    code_gen: CodeGenerator,
    config: RoomConfig,
    total_created: AtomicU64,
    total_expired: AtomicU64,
    shutdown: CancellationToken,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl RoomManager {
    pub fn new(config: RoomConfig) -> Self {
        let code_gen = CodeGenerator::new(config.code_word_count);
        RoomManager {
            rooms: DashMap::new(),
            code_index: DashMap::new(),
            code_gen,
            config,
            total_created: AtomicU64::new(0),
            total_expired: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            sweeper: StdMutex::new(None),
        }
    }

    /// Create a room with the requested lifetime (clamped to the maximum;
    /// `None` selects the default).
    pub fn create_room(&self, expiry: Option<Duration>) -> Result<Arc<Room>> {
        if self.rooms.len() >= self.config.max_rooms {
            return Err(RelayError::MaxRoomsReached(self.config.max_rooms));
        }
        let expiry = expiry
            .unwrap_or(self.config.default_expiry)
            .min(self.config.max_expiry);

        // Reserve a unique code first; the code index is the contention
        // point between concurrent creates.
        let id = generate_room_id();
        let mut code = None;
        for _ in 0..CODE_COLLISION_RETRIES {
            let candidate = self.code_gen.generate();
            match self.code_index.entry(candidate.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(id.clone());
                    code = Some(candidate);
                    break;
                }
            }
        }
        let code = code
            .ok_or_else(|| RelayError::Other("failed to generate a unique room code".to_string()))?;

        let room = Arc::new(Room::new(id.clone(), code.clone(), expiry));
        self.rooms.insert(id, Arc::clone(&room));
        self.total_created.fetch_add(1, Ordering::Relaxed);
        log::room(&code, "created");
        Ok(room)
    }

    pub fn get_room(&self, id: &str) -> Result<Arc<Room>> {
        self.rooms
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(RelayError::RoomNotFound)
    }

    /// Lookup by human-readable code; the code is normalized first.
    pub fn get_room_by_code(&self, code: &str) -> Result<Arc<Room>> {
        let code = self.code_gen.normalize(code);
        let id = self
            .code_index
            .get(&code)
            .map(|e| e.value().clone())
            .ok_or(RelayError::RoomNotFound)?;
        self.get_room(&id)
    }

    /// Remove a room from both indices and close it.
    pub fn remove_room(&self, id: &str) {
        if let Some((_, room)) = self.rooms.remove(id) {
            self.code_index
                .remove_if(room.code(), |_, room_id| room_id == id);
            room.close();
            log::room(room.code(), "removed");
        }
    }

    pub fn validate_code(&self, code: &str) -> bool {
        self.code_gen.validate(&self.code_gen.normalize(code))
    }

    pub fn stats(&self) -> RoomManagerStats {
        RoomManagerStats {
            active_rooms: self.rooms.len(),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_expired: self.total_expired.load(Ordering::Relaxed),
        }
    }

    pub fn list_rooms(&self) -> Vec<RoomStats> {
        self.rooms.iter().map(|e| e.value().stats()).collect()
    }

    /// Close and remove expired rooms; also collect rooms that never got a
    /// peer and are past the grace period. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let expired: Vec<String> = self
            .rooms
            .iter()
            .filter(|e| {
                let room = e.value();
                room.is_expired()
                    || room.is_closed()
                    || (room.peer_count() == 0 && room.created_at.elapsed() > EMPTY_ROOM_GRACE)
            })
            .map(|e| e.key().clone())
            .collect();
        let removed = expired.len();
        for id in expired {
            if let Some((_, room)) = self.rooms.remove(&id) {
                self.code_index
                    .remove_if(room.code(), |_, room_id| room_id == &id);
                if room.is_expired() {
                    self.total_expired.fetch_add(1, Ordering::Relaxed);
                    log::room(room.code(), "expired");
                }
                room.close();
            }
        }
        removed
    }

    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let token = self.shutdown.clone();
        let interval = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = manager.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "room sweep");
                        }
                    }
                }
            }
        });
        if let Ok(mut slot) = self.sweeper.lock() {
            *slot = Some(handle);
        }
    }

    /// Stop the sweep task and close every room.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().ok().and_then(|mut s| s.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        for entry in self.rooms.iter() {
            entry.value().close();
        }
        self.rooms.clear();
        self.code_index.clear();
    }
}

/// 16 random bytes, hex encoded.
fn generate_room_id() -> String {
    let mut raw = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerRole;
    use crate::protocol::DEFAULT_MAX_FRAME_LEN;

    fn test_peer() -> Arc<PeerConnection> {
        // The far end is dropped; these tests never touch the wire.
        let (a, _b) = tokio::io::duplex(1024);
        Arc::new(PeerConnection::new(
            a,
            "test".to_string(),
            PeerRole::Client,
            Duration::from_secs(1),
            Duration::from_secs(1),
            DEFAULT_MAX_FRAME_LEN,
        ))
    }

    #[test]
    fn test_code_generator_shape() {
        let gen = CodeGenerator::new(3);
        for _ in 0..50 {
            let code = gen.generate();
            assert_eq!(code.split('-').count(), 3, "{}", code);
            assert!(gen.validate(&code), "{}", code);
        }
    }

    #[test]
    fn test_code_generator_clamps_word_count() {
        assert_eq!(CodeGenerator::new(0).word_count(), 3);
        assert_eq!(CodeGenerator::new(1).word_count(), 3);
        assert_eq!(CodeGenerator::new(2).word_count(), 2);
        assert_eq!(CodeGenerator::new(9).word_count(), 5);
    }

    #[test]
    fn test_validate_rejects_bad_codes() {
        let gen = CodeGenerator::new(3);
        assert!(!gen.validate("alpha-bravo"));
        assert!(!gen.validate("alpha-nonsenseword-gamma"));
        assert!(!gen.validate(""));
        assert!(gen.validate("ALPHA-Ocean-zulu"));
    }

    #[test]
    fn test_normalize_variants() {
        let gen = CodeGenerator::new(3);
        assert_eq!(gen.normalize("Alpha Ocean ZULU"), "alpha-ocean-zulu");
        assert_eq!(gen.normalize("alpha_ocean_zulu"), "alpha-ocean-zulu");
        // Idempotent
        assert_eq!(gen.normalize("alpha-ocean-zulu"), "alpha-ocean-zulu");
    }

    #[test]
    fn test_entropy_grows_with_word_count() {
        let three = CodeGenerator::new(3).entropy_bits();
        let five = CodeGenerator::new(5).entropy_bits();
        assert!(three > 20.0 && three < 22.0, "{}", three);
        assert!(five > three);
        assert_eq!(
            CodeGenerator::new(2).total_combinations(),
            (WORD_LIST.len() as u64).pow(2)
        );
    }

    #[test]
    fn test_room_two_peers_then_full() {
        let room = Room::new("r1".into(), "alpha-beta-gamma".into(), Duration::from_secs(60));
        assert_eq!(room.add_peer(test_peer()).unwrap(), 0);
        let second = test_peer();
        assert_eq!(room.add_peer(Arc::clone(&second)).unwrap(), 1);
        assert!(matches!(
            room.add_peer(test_peer()),
            Err(RelayError::RoomFull)
        ));
        assert_eq!(room.peer_count(), 2);
        assert!(matches!(
            room.add_peer(second),
            Err(RelayError::PeerAlreadyInRoom)
        ));
    }

    #[test]
    fn test_room_other_peer() {
        let room = Room::new("r1".into(), "c".into(), Duration::from_secs(60));
        let a = test_peer();
        let b = test_peer();
        room.add_peer(Arc::clone(&a)).unwrap();
        assert!(room.other_peer(a.id()).is_none());
        room.add_peer(Arc::clone(&b)).unwrap();
        assert_eq!(room.other_peer(a.id()).unwrap().id(), b.id());
        assert_eq!(room.other_peer(b.id()).unwrap().id(), a.id());
    }

    #[test]
    fn test_room_remove_peer() {
        let room = Room::new("r1".into(), "c".into(), Duration::from_secs(60));
        let a = test_peer();
        room.add_peer(Arc::clone(&a)).unwrap();
        assert!(room.remove_peer(a.id()));
        assert!(!room.remove_peer(a.id()));
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_closed_room_rejects_peers() {
        let room = Room::new("r1".into(), "c".into(), Duration::from_secs(60));
        room.close();
        room.close();
        assert!(matches!(
            room.add_peer(test_peer()),
            Err(RelayError::RoomClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_room_rejects_peers() {
        let room = Room::new("r1".into(), "c".into(), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(room.is_expired());
        assert!(matches!(
            room.add_peer(test_peer()),
            Err(RelayError::RoomClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_expiry() {
        let room = Room::new("r1".into(), "c".into(), Duration::from_secs(10));
        room.extend_expiry(Duration::from_secs(20));
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(!room.is_expired());
        assert!(room.time_remaining() > Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_peer_joined_notifies_waiter() {
        let room = Arc::new(Room::new("r1".into(), "c".into(), Duration::from_secs(60)));
        room.add_peer(test_peer()).unwrap();
        let waiter = {
            let room = Arc::clone(&room);
            tokio::spawn(async move { room.peer_joined.notified().await })
        };
        tokio::task::yield_now().await;
        room.add_peer(test_peer()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be woken")
            .unwrap();
    }

    #[test]
    fn test_manager_create_and_lookup() {
        let mgr = RoomManager::new(RoomConfig::default());
        let room = mgr.create_room(None).unwrap();
        assert!(mgr.validate_code(room.code()));
        let found = mgr.get_room_by_code(room.code()).unwrap();
        assert_eq!(found.id(), room.id());
        // Lookup tolerates case and separator variants.
        let sloppy = room.code().to_uppercase().replace('-', " ");
        assert_eq!(mgr.get_room_by_code(&sloppy).unwrap().id(), room.id());
        assert!(mgr.get_room_by_code("alpha-beta-gamma-delta").is_err());
    }

    #[test]
    fn test_manager_max_rooms() {
        let mgr = RoomManager::new(RoomConfig {
            max_rooms: 2,
            ..RoomConfig::default()
        });
        mgr.create_room(None).unwrap();
        mgr.create_room(None).unwrap();
        assert!(matches!(
            mgr.create_room(None),
            Err(RelayError::MaxRoomsReached(2))
        ));
    }

    #[test]
    fn test_manager_expiry_clamped_to_max() {
        let mgr = RoomManager::new(RoomConfig {
            max_expiry: Duration::from_secs(100),
            ..RoomConfig::default()
        });
        let room = mgr.create_room(Some(Duration::from_secs(100_000))).unwrap();
        assert!(room.time_remaining() <= Duration::from_secs(100));
    }

    #[test]
    fn test_manager_remove_room_frees_code() {
        let mgr = RoomManager::new(RoomConfig::default());
        let room = mgr.create_room(None).unwrap();
        let code = room.code().to_string();
        mgr.remove_room(room.id());
        assert!(room.is_closed());
        assert!(mgr.get_room_by_code(&code).is_err());
        assert_eq!(mgr.stats().active_rooms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired_and_counts() {
        let mgr = RoomManager::new(RoomConfig::default());
        let short = mgr.create_room(Some(Duration::from_secs(5))).unwrap();
        short.add_peer(test_peer()).unwrap();
        let long = mgr.create_room(Some(Duration::from_secs(3600))).unwrap();
        long.add_peer(test_peer()).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        let removed = mgr.sweep();
        assert_eq!(removed, 1);
        assert!(short.is_closed());
        assert!(mgr.get_room(long.id()).is_ok());
        assert_eq!(mgr.stats().total_expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_collects_abandoned_empty_rooms() {
        let mgr = RoomManager::new(RoomConfig::default());
        let empty = mgr.create_room(Some(Duration::from_secs(3600))).unwrap();
        let occupied = mgr.create_room(Some(Duration::from_secs(3600))).unwrap();
        occupied.add_peer(test_peer()).unwrap();

        // Inside the grace period nothing is collected.
        assert_eq!(mgr.sweep(), 0);
        tokio::time::advance(EMPTY_ROOM_GRACE + Duration::from_secs(1)).await;
        assert_eq!(mgr.sweep(), 1);
        assert!(mgr.get_room(empty.id()).is_err());
        assert!(mgr.get_room(occupied.id()).is_ok());
        // Abandonment is not expiry.
        assert_eq!(mgr.stats().total_expired, 0);
    }

    #[tokio::test]
    async fn test_manager_stop_closes_rooms() {
        let mgr = Arc::new(RoomManager::new(RoomConfig::default()));
        mgr.start();
        let room = mgr.create_room(None).unwrap();
        mgr.stop().await;
        assert!(room.is_closed());
        assert_eq!(mgr.stats().active_rooms, 0);
    }
}
