use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Wire protocol version exchanged in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame length prefix (u32 BE) covering the whole envelope.
pub const FRAME_HEADER_LEN: usize = 4;

/// Fixed part of the envelope: type(1) + request_id(4) + circuit_id_len(1)
/// + payload_len(4).
pub const ENVELOPE_FIXED_LEN: usize = 10;

/// Default ceiling on a single frame. Oversized frames are a protocol error,
/// never a buffer growth.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Maximum expiry a room may request, in minutes (72 hours).
pub const MAX_ROOM_EXPIRY_MINUTES: u64 = 72 * 60;

/// Message type tag carried in the first envelope byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    HandshakeHello = 0x01,
    HandshakeAck = 0x02,
    CreateCircuit = 0x10,
    CircuitCreated = 0x11,
    ExtendCircuit = 0x12,
    CircuitExtended = 0x13,
    DestroyCircuit = 0x14,
    CircuitDestroyed = 0x15,
    RelayData = 0x16,
    RelayAck = 0x17,
    CreateRoom = 0x20,
    RoomCreated = 0x21,
    JoinRoom = 0x22,
    RoomJoined = 0x23,
    PeerJoined = 0x24,
    PeerLeft = 0x25,
    Data = 0x30,
    Ping = 0x40,
    Pong = 0x41,
    Error = 0x50,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(MessageType::HandshakeHello),
            0x02 => Some(MessageType::HandshakeAck),
            0x10 => Some(MessageType::CreateCircuit),
            0x11 => Some(MessageType::CircuitCreated),
            0x12 => Some(MessageType::ExtendCircuit),
            0x13 => Some(MessageType::CircuitExtended),
            0x14 => Some(MessageType::DestroyCircuit),
            0x15 => Some(MessageType::CircuitDestroyed),
            0x16 => Some(MessageType::RelayData),
            0x17 => Some(MessageType::RelayAck),
            0x20 => Some(MessageType::CreateRoom),
            0x21 => Some(MessageType::RoomCreated),
            0x22 => Some(MessageType::JoinRoom),
            0x23 => Some(MessageType::RoomJoined),
            0x24 => Some(MessageType::PeerJoined),
            0x25 => Some(MessageType::PeerLeft),
            0x30 => Some(MessageType::Data),
            0x40 => Some(MessageType::Ping),
            0x41 => Some(MessageType::Pong),
            0x50 => Some(MessageType::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::HandshakeHello => "HANDSHAKE_HELLO",
            MessageType::HandshakeAck => "HANDSHAKE_ACK",
            MessageType::CreateCircuit => "CREATE_CIRCUIT",
            MessageType::CircuitCreated => "CIRCUIT_CREATED",
            MessageType::ExtendCircuit => "EXTEND_CIRCUIT",
            MessageType::CircuitExtended => "CIRCUIT_EXTENDED",
            MessageType::DestroyCircuit => "DESTROY_CIRCUIT",
            MessageType::CircuitDestroyed => "CIRCUIT_DESTROYED",
            MessageType::RelayData => "RELAY_DATA",
            MessageType::RelayAck => "RELAY_ACK",
            MessageType::CreateRoom => "CREATE_ROOM",
            MessageType::RoomCreated => "ROOM_CREATED",
            MessageType::JoinRoom => "JOIN_ROOM",
            MessageType::RoomJoined => "ROOM_JOINED",
            MessageType::PeerJoined => "PEER_JOINED",
            MessageType::PeerLeft => "PEER_LEFT",
            MessageType::Data => "DATA",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded wire message.
///
/// Layout inside the length-prefixed frame:
/// `type (1) | request_id (4 BE) | circuit_id_len (1) | circuit_id |
/// payload_len (4 BE) | payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub request_id: u32,
    pub circuit_id: String,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(msg_type: MessageType, request_id: u32, circuit_id: &str, payload: Bytes) -> Self {
        Envelope {
            msg_type,
            request_id,
            circuit_id: circuit_id.to_string(),
            payload,
        }
    }

    /// Control message helper: JSON-encode `payload` into the envelope.
    pub fn control<T: Serialize>(
        msg_type: MessageType,
        request_id: u32,
        circuit_id: &str,
        payload: &T,
    ) -> Result<Self> {
        let body = serde_json::to_vec(payload)?;
        Ok(Envelope::new(msg_type, request_id, circuit_id, body.into()))
    }

    /// Decode the JSON control payload.
    pub fn parse_payload<'a, T: Deserialize<'a>>(&'a self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            RelayError::Protocol(format!("bad {} payload: {}", self.msg_type, e))
        })
    }

    /// Serialize into a single length-prefixed frame.
    pub fn encode(&self) -> Result<Bytes> {
        let id_bytes = self.circuit_id.as_bytes();
        if id_bytes.len() > u8::MAX as usize {
            return Err(RelayError::InvalidCircuitId(format!(
                "circuit id too long: {} bytes",
                id_bytes.len()
            )));
        }
        let body_len = ENVELOPE_FIXED_LEN + id_bytes.len() + self.payload.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body_len);
        buf.put_u32(body_len as u32);
        buf.put_u8(self.msg_type as u8);
        buf.put_u32(self.request_id);
        buf.put_u8(id_bytes.len() as u8);
        buf.put_slice(id_bytes);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Incremental decode from a read buffer. Returns `Ok(None)` when the
    /// buffer does not yet hold a complete frame; on success the frame is
    /// consumed from `buf`.
    pub fn decode(buf: &mut BytesMut, max_frame_len: usize) -> Result<Option<Envelope>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if body_len > max_frame_len {
            return Err(RelayError::Protocol(format!(
                "frame of {} bytes exceeds limit {}",
                body_len, max_frame_len
            )));
        }
        if body_len < ENVELOPE_FIXED_LEN {
            return Err(RelayError::Protocol(format!(
                "frame too short: {} bytes",
                body_len
            )));
        }
        if buf.len() < FRAME_HEADER_LEN + body_len {
            return Ok(None);
        }
        buf.advance(FRAME_HEADER_LEN);
        let mut body = buf.split_to(body_len);

        let type_byte = body.get_u8();
        let msg_type = MessageType::from_u8(type_byte)
            .ok_or_else(|| RelayError::Protocol(format!("unknown message type 0x{:02x}", type_byte)))?;
        let request_id = body.get_u32();
        let id_len = body.get_u8() as usize;
        if body.len() < id_len + 4 {
            return Err(RelayError::Protocol("truncated circuit id".to_string()));
        }
        let id_bytes = body.split_to(id_len);
        let circuit_id = std::str::from_utf8(&id_bytes)
            .map_err(|_| RelayError::Protocol("circuit id is not UTF-8".to_string()))?
            .to_string();
        let payload_len = body.get_u32() as usize;
        if body.len() != payload_len {
            return Err(RelayError::Protocol(format!(
                "payload length mismatch: declared {}, got {}",
                payload_len,
                body.len()
            )));
        }
        Ok(Some(Envelope {
            msg_type,
            request_id,
            circuit_id,
            payload: body.freeze(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Control payloads (JSON)

#[derive(Debug, Serialize, Deserialize)]
pub struct HandshakeHello {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub version: u32,
    pub relay_id: String,
    pub mode: String,
    /// Hex fingerprint of the relay public key.
    pub fingerprint: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateCircuitRequest {
    pub circuit_id: String,
    /// Hex-encoded key-encapsulation envelope.
    pub key_envelope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CircuitCreatedResponse {
    pub circuit_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExtendCircuitRequest {
    pub next_hop: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_envelope: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DestroyCircuitNotice {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    /// Requested lifetime; zero selects the server default.
    #[serde(default)]
    pub expiry_minutes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomCreatedResponse {
    pub room_id: String,
    pub code: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinRoomRequest {
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomJoinedResponse {
    pub room_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Reject out-of-range room lifetimes before touching the room table.
pub fn validate_create_room(req: &CreateRoomRequest) -> Result<()> {
    if req.expiry_minutes > MAX_ROOM_EXPIRY_MINUTES {
        return Err(RelayError::Protocol(format!(
            "expiry cannot exceed {} minutes",
            MAX_ROOM_EXPIRY_MINUTES
        )));
    }
    Ok(())
}

/// Sanity bounds on a join code before normalization.
pub fn validate_join_room(req: &JoinRoomRequest) -> Result<()> {
    if req.code.is_empty() {
        return Err(RelayError::Protocol("room code is required".to_string()));
    }
    if req.code.len() < 5 {
        return Err(RelayError::Protocol("room code too short".to_string()));
    }
    if req.code.len() > 100 {
        return Err(RelayError::Protocol("room code too long".to_string()));
    }
    Ok(())
}
