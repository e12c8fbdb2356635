use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::RngCore;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{RelayError, Result};
use crate::logger::log;
use crate::onion::{self, KeyExchanger, SessionKey};
use crate::peer::ConnectionId;
use crate::protocol::CreateCircuitRequest;

/// Circuit id wire format: 16 random bytes, lowercase hex.
pub const CIRCUIT_ID_LEN: usize = 32;

/// Circuit lifecycle. `Destroyed` is terminal; `Closing` is the transitional
/// state that makes teardown idempotent under concurrent destroy
/// notifications from both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Embryonic,
    Extending,
    Established,
    Closing,
    Destroyed,
}

impl CircuitState {
    pub fn can_transition_to(self, next: CircuitState) -> bool {
        use CircuitState::*;
        match (self, next) {
            // Any live state may be torn down.
            (Embryonic | Extending | Established | Closing, Destroyed) => true,
            (Embryonic | Extending | Established, Closing) => true,
            (Embryonic, Extending) => true,
            (Embryonic | Extending, Established) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CircuitState::Destroyed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Embryonic => "embryonic",
            CircuitState::Extending => "extending",
            CircuitState::Established => "established",
            CircuitState::Closing => "closing",
            CircuitState::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hop in the circuit path, as this relay sees it.
#[derive(Debug, Clone, Serialize)]
pub struct HopInfo {
    pub endpoint: String,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    hops: Vec<HopInfo>,
    session_key: SessionKey,
    /// Predecessor link; responses and backward destroys route through it.
    origin_conn: ConnectionId,
    /// Successor endpoint once the circuit extends past this relay.
    next_hop: Option<String>,
    bytes_forwarded: u64,
    messages_forwarded: u64,
    created_at: Instant,
    last_activity: Instant,
    decrypt_failures: u32,
}

/// Read-only snapshot for dispatch decisions and the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitInfo {
    pub id: String,
    pub state: &'static str,
    pub hop_count: usize,
    pub next_hop: Option<String>,
    pub bytes_forwarded: u64,
    pub messages_forwarded: u64,
    pub age_secs: f64,
    pub idle_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub active: usize,
    pub created_total: u64,
    pub destroyed_total: u64,
    pub bytes_forwarded_total: u64,
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub max_circuits: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// Per-circuit forwarded-byte ceiling; crossing it destroys the circuit.
    pub max_bytes_per_circuit: u64,
    /// Consecutive unwrap failures tolerated before teardown.
    pub max_decrypt_failures: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        CircuitConfig {
            max_circuits: 10_000,
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            max_bytes_per_circuit: 10 * 1024 * 1024 * 1024,
            max_decrypt_failures: 3,
        }
    }
}

/// Owns every circuit on this relay. All access goes through methods; no
/// guard is ever held across network I/O.
pub struct CircuitManager {
    circuits: DashMap<String, Circuit>,
    config: CircuitConfig,
    key_exchanger: Arc<dyn KeyExchanger>,
    created_total: AtomicU64,
    destroyed_total: AtomicU64,
    bytes_forwarded_total: AtomicU64,
}

/// 16 random bytes, hex encoded.
pub fn generate_circuit_id() -> String {
    let mut raw = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

pub fn validate_circuit_id(id: &str) -> Result<()> {
    if id.len() != CIRCUIT_ID_LEN || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(RelayError::InvalidCircuitId(id.to_string()));
    }
    Ok(())
}

impl CircuitManager {
    pub fn new(config: CircuitConfig, key_exchanger: Arc<dyn KeyExchanger>) -> Self {
        CircuitManager {
            circuits: DashMap::new(),
            config,
            key_exchanger,
            created_total: AtomicU64::new(0),
            destroyed_total: AtomicU64::new(0),
            bytes_forwarded_total: AtomicU64::new(0),
        }
    }

    /// Register a new circuit in `Embryonic` state, bound to the connection
    /// that created it.
    pub fn create_circuit(
        &self,
        req: &CreateCircuitRequest,
        origin_conn: ConnectionId,
    ) -> Result<CircuitInfo> {
        if self.circuits.len() >= self.config.max_circuits {
            return Err(RelayError::MaxCircuitsReached(self.config.max_circuits));
        }
        validate_circuit_id(&req.circuit_id)?;
        let envelope = hex::decode(&req.key_envelope)
            .map_err(|_| RelayError::KeyExchangeFailed("envelope is not hex".to_string()))?;
        let session_key = self
            .key_exchanger
            .derive_session_key(&envelope, &req.circuit_id)?;

        let now = Instant::now();
        let circuit = Circuit {
            state: CircuitState::Embryonic,
            hops: Vec::new(),
            session_key,
            origin_conn,
            next_hop: req.next_hop.clone(),
            bytes_forwarded: 0,
            messages_forwarded: 0,
            created_at: now,
            last_activity: now,
            decrypt_failures: 0,
        };

        match self.circuits.entry(req.circuit_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RelayError::CircuitExists(req.circuit_id.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let info = snapshot(&req.circuit_id, slot.insert(circuit).value());
                self.created_total.fetch_add(1, Ordering::Relaxed);
                log::circuit(&req.circuit_id, "created");
                Ok(info)
            }
        }
    }

    /// Append a hop and move the circuit toward `Established`.
    pub fn extend_circuit(&self, id: &str, next_hop: &str) -> Result<()> {
        let mut circuit = self
            .circuits
            .get_mut(id)
            .ok_or_else(|| RelayError::CircuitNotFound(id.to_string()))?;
        if !circuit.state.can_transition_to(CircuitState::Extending) {
            return Err(RelayError::CircuitClosed(id.to_string()));
        }
        circuit.state = CircuitState::Extending;
        circuit.hops.push(HopInfo {
            endpoint: next_hop.to_string(),
        });
        circuit.next_hop = Some(next_hop.to_string());
        circuit.last_activity = Instant::now();
        log::circuit(id, "extended");
        Ok(())
    }

    pub fn mark_established(&self, id: &str) -> Result<()> {
        let mut circuit = self
            .circuits
            .get_mut(id)
            .ok_or_else(|| RelayError::CircuitNotFound(id.to_string()))?;
        if !circuit.state.can_transition_to(CircuitState::Established) {
            return Err(RelayError::CircuitClosed(id.to_string()));
        }
        circuit.state = CircuitState::Established;
        circuit.last_activity = Instant::now();
        Ok(())
    }

    pub fn get_info(&self, id: &str) -> Result<CircuitInfo> {
        self.circuits
            .get(id)
            .map(|c| snapshot(id, c.value()))
            .ok_or_else(|| RelayError::CircuitNotFound(id.to_string()))
    }

    pub fn get_state(&self, id: &str) -> Result<CircuitState> {
        self.circuits
            .get(id)
            .map(|c| c.state)
            .ok_or_else(|| RelayError::CircuitNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.circuits.contains_key(id)
    }

    /// Copy the session key out so decryption never runs under the table
    /// guard.
    pub fn session_key(&self, id: &str) -> Result<SessionKey> {
        let circuit = self
            .circuits
            .get(id)
            .ok_or_else(|| RelayError::CircuitNotFound(id.to_string()))?;
        if circuit.state.is_terminal() || circuit.state == CircuitState::Closing {
            return Err(RelayError::CircuitClosed(id.to_string()));
        }
        Ok(circuit.session_key)
    }

    pub fn origin_conn(&self, id: &str) -> Result<ConnectionId> {
        self.circuits
            .get(id)
            .map(|c| c.origin_conn)
            .ok_or_else(|| RelayError::CircuitNotFound(id.to_string()))
    }

    pub fn next_hop(&self, id: &str) -> Result<Option<String>> {
        self.circuits
            .get(id)
            .map(|c| c.next_hop.clone())
            .ok_or_else(|| RelayError::CircuitNotFound(id.to_string()))
    }

    /// Account one forwarded message. Crossing the per-circuit byte ceiling
    /// destroys the circuit and reports it closed.
    pub fn record_forward(&self, id: &str, bytes: u64) -> Result<()> {
        let over_limit = {
            let mut circuit = self
                .circuits
                .get_mut(id)
                .ok_or_else(|| RelayError::CircuitNotFound(id.to_string()))?;
            if circuit.state == CircuitState::Closing || circuit.state.is_terminal() {
                return Err(RelayError::CircuitClosed(id.to_string()));
            }
            circuit.bytes_forwarded = circuit.bytes_forwarded.saturating_add(bytes);
            circuit.messages_forwarded += 1;
            circuit.last_activity = Instant::now();
            circuit.bytes_forwarded > self.config.max_bytes_per_circuit
        };
        self.bytes_forwarded_total.fetch_add(bytes, Ordering::Relaxed);
        if over_limit {
            self.destroy_circuit(id, "byte_limit");
            return Err(RelayError::CircuitClosed(id.to_string()));
        }
        Ok(())
    }

    pub fn update_activity(&self, id: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(id) {
            circuit.last_activity = Instant::now();
        }
    }

    /// Count one failed unwrap. Returns true when the failure is fatal and
    /// the circuit was destroyed; a lone failure only earns the sender a
    /// typed error.
    pub fn record_decrypt_failure(&self, id: &str) -> bool {
        let fatal = match self.circuits.get_mut(id) {
            Some(mut circuit) => {
                circuit.decrypt_failures += 1;
                circuit.decrypt_failures >= self.config.max_decrypt_failures
            }
            None => return false,
        };
        if fatal {
            self.destroy_circuit(id, "decrypt_failures");
        }
        fatal
    }

    /// A successful unwrap clears the consecutive-failure counter.
    pub fn record_decrypt_success(&self, id: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(id) {
            circuit.decrypt_failures = 0;
        }
    }

    /// Tear down a circuit. Idempotent: returns true only for the call that
    /// actually performed the teardown, so destroy propagation cannot cycle
    /// between neighbors.
    pub fn destroy_circuit(&self, id: &str, reason: &str) -> bool {
        // Mark Closing first; a concurrent destroy seeing Closing backs off.
        {
            let mut circuit = match self.circuits.get_mut(id) {
                Some(c) => c,
                None => return false,
            };
            if circuit.state == CircuitState::Closing || circuit.state.is_terminal() {
                return false;
            }
            circuit.state = CircuitState::Closing;
        }
        if let Some((_, mut circuit)) = self.circuits.remove(id) {
            circuit.state = CircuitState::Destroyed;
            onion::wipe_key(&mut circuit.session_key);
            self.destroyed_total.fetch_add(1, Ordering::Relaxed);
            tracing::info!(circuit_id = id, reason, "circuit destroyed");
            true
        } else {
            false
        }
    }

    /// Circuits bound to a connection, for teardown on disconnect.
    pub fn circuits_for_conn(&self, conn: ConnectionId) -> Vec<String> {
        self.circuits
            .iter()
            .filter(|e| e.origin_conn == conn)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Circuits riding a given outbound link, for teardown when it dies.
    pub fn circuits_by_next_hop(&self, endpoint: &str) -> Vec<String> {
        self.circuits
            .iter()
            .filter(|e| e.next_hop.as_deref() == Some(endpoint))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            active: self.circuits.len(),
            created_total: self.created_total.load(Ordering::Relaxed),
            destroyed_total: self.destroyed_total.load(Ordering::Relaxed),
            bytes_forwarded_total: self.bytes_forwarded_total.load(Ordering::Relaxed),
        }
    }

    /// Destroy circuits idle past the configured timeout. Each entry carries
    /// the links the circuit had, so the caller can send destroy notices to
    /// both neighbors.
    pub fn sweep(&self) -> Vec<SweptCircuit> {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let expired: Vec<SweptCircuit> = self
            .circuits
            .iter()
            .filter(|e| now.duration_since(e.last_activity) > idle_timeout)
            .map(|e| SweptCircuit {
                id: e.key().clone(),
                next_hop: e.next_hop.clone(),
                origin_conn: e.origin_conn,
            })
            .collect();
        let mut destroyed = Vec::new();
        for swept in expired {
            if self.destroy_circuit(&swept.id, "idle_timeout") {
                destroyed.push(swept);
            }
        }
        destroyed
    }
}

/// What `sweep` reaped: enough routing state to notify both sides of the
/// dead circuit after the table entry is gone.
#[derive(Debug)]
pub struct SweptCircuit {
    pub id: String,
    pub next_hop: Option<String>,
    pub origin_conn: ConnectionId,
}

fn snapshot(id: &str, circuit: &Circuit) -> CircuitInfo {
    let now = Instant::now();
    CircuitInfo {
        id: id.to_string(),
        state: circuit.state.as_str(),
        hop_count: circuit.hops.len(),
        next_hop: circuit.next_hop.clone(),
        bytes_forwarded: circuit.bytes_forwarded,
        messages_forwarded: circuit.messages_forwarded,
        age_secs: now.duration_since(circuit.created_at).as_secs_f64(),
        idle_secs: now.duration_since(circuit.last_activity).as_secs_f64(),
    }
}
