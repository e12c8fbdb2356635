use bytes::{Buf, BufMut, Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RelayError, Result};

pub const SESSION_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// HKDF context string for session keys. Versioned so a future key schedule
/// can coexist with live circuits.
const SESSION_INFO: &[u8] = b"veil-onion-session-v1";

pub type SessionKey = [u8; SESSION_KEY_SIZE];

/// Negotiates session keys from opaque key-encapsulation envelopes.
///
/// The relay never interprets envelope contents beyond what the exchanger
/// defines, so a hybrid KEM can replace the default without touching the
/// circuit path.
pub trait KeyExchanger: Send + Sync {
    /// Public key bytes served to clients.
    fn public_key(&self) -> &[u8];

    /// Hex digest of the public key, for the admin surface and handshakes.
    fn fingerprint(&self) -> String;

    /// Derive the circuit session key from the client's envelope. The
    /// circuit id salts the derivation so identical envelopes on different
    /// circuits yield unrelated keys.
    fn derive_session_key(&self, envelope: &[u8], circuit_id: &str) -> Result<SessionKey>;
}

/// Default exchanger with an ephemeral keypair generated at startup.
///
/// Decapsulation is a fixed-shape stand-in: the shared secret is the first
/// 32 envelope bytes XORed with the public-key digest, then run through
/// HKDF-SHA256 salted by the circuit id.
pub struct EphemeralKeyExchanger {
    public_key: Vec<u8>,
    key_digest: [u8; 32],
}

impl EphemeralKeyExchanger {
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut private);
        let public_key = Sha256::digest(private).to_vec();
        let key_digest = Sha256::digest(&public_key).into();
        EphemeralKeyExchanger {
            public_key,
            key_digest,
        }
    }
}

impl KeyExchanger for EphemeralKeyExchanger {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.public_key))
    }

    fn derive_session_key(&self, envelope: &[u8], circuit_id: &str) -> Result<SessionKey> {
        if envelope.len() < SESSION_KEY_SIZE {
            return Err(RelayError::KeyExchangeFailed(format!(
                "envelope too short: {} bytes",
                envelope.len()
            )));
        }
        let mut shared = [0u8; SESSION_KEY_SIZE];
        for (i, byte) in shared.iter_mut().enumerate() {
            *byte = envelope[i] ^ self.key_digest[i];
        }
        derive_session_key(&shared, circuit_id)
    }
}

/// HKDF-SHA256(secret = shared, salt = circuit id, info = versioned label).
pub fn derive_session_key(shared_secret: &[u8], circuit_id: &str) -> Result<SessionKey> {
    let hk = Hkdf::<Sha256>::new(Some(circuit_id.as_bytes()), shared_secret);
    let mut key = [0u8; SESSION_KEY_SIZE];
    hk.expand(SESSION_INFO, &mut key)
        .map_err(|_| RelayError::KeyExchangeFailed("HKDF expand failed".to_string()))?;
    Ok(key)
}

/// Routing header revealed by unwrapping one layer. An empty `next_hop`
/// marks the exit position.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayerHeader {
    #[serde(default)]
    pub next_hop: String,
    pub payload_size: u64,
}

/// Encrypt one onion layer: `header_len (4 BE) | header JSON | payload`
/// sealed under the session key, random nonce prepended.
pub fn wrap_layer(key: &SessionKey, next_hop: &str, payload: &[u8]) -> Result<Bytes> {
    let header = serde_json::to_vec(&LayerHeader {
        next_hop: next_hop.to_string(),
        payload_size: payload.len() as u64,
    })?;
    let mut plain = BytesMut::with_capacity(4 + header.len() + payload.len());
    plain.put_u32(header.len() as u32);
    plain.put_slice(&header);
    plain.put_slice(payload);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let sealed = cipher
        .encrypt(nonce, plain.as_ref())
        .map_err(|_| RelayError::Other("AEAD seal failed".to_string()))?;

    let mut out = BytesMut::with_capacity(NONCE_SIZE + sealed.len());
    out.put_slice(&nonce_bytes);
    out.put_slice(&sealed);
    Ok(out.freeze())
}

/// Strip exactly one layer, returning the routing header and inner payload.
/// Any tamper or wrong key surfaces as `DecryptionFailed`.
pub fn unwrap_layer(key: &SessionKey, circuit_id: &str, data: &[u8]) -> Result<(LayerHeader, Bytes)> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(RelayError::DecryptionFailed(circuit_id.to_string()));
    }
    let (nonce_bytes, sealed) = data.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let plain = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| RelayError::DecryptionFailed(circuit_id.to_string()))?;

    let mut buf = BytesMut::from(&plain[..]);
    if buf.len() < 4 {
        return Err(RelayError::DecryptionFailed(circuit_id.to_string()));
    }
    let header_len = buf.get_u32() as usize;
    if buf.len() < header_len {
        return Err(RelayError::DecryptionFailed(circuit_id.to_string()));
    }
    let header_bytes = buf.split_to(header_len);
    let header: LayerHeader = serde_json::from_slice(&header_bytes)
        .map_err(|_| RelayError::DecryptionFailed(circuit_id.to_string()))?;
    if header.payload_size != buf.len() as u64 {
        return Err(RelayError::DecryptionFailed(circuit_id.to_string()));
    }
    Ok((header, buf.freeze()))
}

/// Overwrite key material before the circuit record is dropped.
pub fn wipe_key(key: &mut SessionKey) {
    for byte in key.iter_mut() {
        // Volatile write so the zeroing is not elided.
        unsafe { std::ptr::write_volatile(byte, 0) };
    }
}
