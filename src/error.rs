use std::io;
use thiserror::Error;

/// Machine-readable error codes carried in ERROR frames on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    CircuitNotFound,
    CircuitExists,
    InvalidCircuitId,
    CircuitClosed,
    KeyExchangeFailed,
    DecryptionFailed,
    RelayFailed,
    RoomNotFound,
    RoomFull,
    RoomClosed,
    RoomExpired,
    MaxRoomsReached,
    RateLimited,
    InvalidMessage,
    HandshakeFailed,
    TransferFailed,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CircuitNotFound => "CIRCUIT_NOT_FOUND",
            ErrorCode::CircuitExists => "CIRCUIT_EXISTS",
            ErrorCode::InvalidCircuitId => "INVALID_CIRCUIT_ID",
            ErrorCode::CircuitClosed => "CIRCUIT_CLOSED",
            ErrorCode::KeyExchangeFailed => "KEY_EXCHANGE_FAILED",
            ErrorCode::DecryptionFailed => "DECRYPTION_FAILED",
            ErrorCode::RelayFailed => "RELAY_FAILED",
            ErrorCode::RoomNotFound => "ROOM_NOT_FOUND",
            ErrorCode::RoomFull => "ROOM_FULL",
            ErrorCode::RoomClosed => "ROOM_CLOSED",
            ErrorCode::RoomExpired => "ROOM_EXPIRED",
            ErrorCode::MaxRoomsReached => "MAX_ROOMS_REACHED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::HandshakeFailed => "HANDSHAKE_FAILED",
            ErrorCode::TransferFailed => "TRANSFER_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire protocol decode/encode error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Circuit lookup failed
    #[error("circuit not found: {0}")]
    CircuitNotFound(String),

    /// Circuit id already registered
    #[error("circuit already exists: {0}")]
    CircuitExists(String),

    /// Circuit id failed validation
    #[error("invalid circuit id: {0}")]
    InvalidCircuitId(String),

    /// Circuit is closing or destroyed
    #[error("circuit closed: {0}")]
    CircuitClosed(String),

    /// Circuit table is at capacity
    #[error("maximum circuits reached ({0})")]
    MaxCircuitsReached(usize),

    /// Session key negotiation failed
    #[error("key exchange failed: {0}")]
    KeyExchangeFailed(String),

    /// Onion layer could not be unwrapped
    #[error("decryption failed for circuit {0}")]
    DecryptionFailed(String),

    /// Forwarding to the next hop failed
    #[error("relay failed: {0}")]
    RelayFailed(String),

    /// Room lookup failed
    #[error("room not found")]
    RoomNotFound,

    /// Room already holds two peers
    #[error("room is full")]
    RoomFull,

    /// Room was closed or expired
    #[error("room closed")]
    RoomClosed,

    /// Room table is at capacity
    #[error("maximum rooms reached ({0})")]
    MaxRoomsReached(usize),

    /// Peer already joined this room
    #[error("peer already in room")]
    PeerAlreadyInRoom,

    /// Origin exceeded its rate allowance
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Peer connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Map to the code sent back to the peer in an ERROR frame.
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::CircuitNotFound(_) => ErrorCode::CircuitNotFound,
            RelayError::CircuitExists(_) => ErrorCode::CircuitExists,
            RelayError::InvalidCircuitId(_) => ErrorCode::InvalidCircuitId,
            RelayError::CircuitClosed(_) | RelayError::MaxCircuitsReached(_) => {
                ErrorCode::CircuitClosed
            }
            RelayError::KeyExchangeFailed(_) => ErrorCode::KeyExchangeFailed,
            RelayError::DecryptionFailed(_) => ErrorCode::DecryptionFailed,
            RelayError::RelayFailed(_) => ErrorCode::RelayFailed,
            RelayError::RoomNotFound => ErrorCode::RoomNotFound,
            RelayError::RoomFull | RelayError::PeerAlreadyInRoom => ErrorCode::RoomFull,
            RelayError::RoomClosed => ErrorCode::RoomClosed,
            RelayError::MaxRoomsReached(_) => ErrorCode::MaxRoomsReached,
            RelayError::RateLimited(_) => ErrorCode::RateLimited,
            RelayError::Protocol(_) => ErrorCode::InvalidMessage,
            _ => ErrorCode::InternalError,
        }
    }

}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Other(err.to_string())
    }
}

impl From<toml::de::Error> for RelayError {
    fn from(err: toml::de::Error) -> Self {
        RelayError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Protocol(format!("JSON error: {}", err))
    }
}
