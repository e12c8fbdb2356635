//! Relay listener and message dispatch
//!
//! Owns the accept loop, the per-connection dispatch task, and the pool of
//! outbound links to neighboring relays. Everything that touches the wire
//! goes through here; the managers never see a socket.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use dashmap::DashMap;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admin::AdminState;
use crate::bridge;
use crate::config::{RelayConfig, RelayMode};
use crate::error::{ErrorCode, RelayError};
use crate::logger::log;
use crate::onion;
use crate::peer::{ConnectionId, PeerConnection, PeerRole};
use crate::protocol::{
    validate_create_room, validate_join_room, CircuitCreatedResponse, CreateCircuitRequest,
    CreateRoomRequest, DestroyCircuitNotice, Envelope, ErrorPayload, ExtendCircuitRequest,
    HandshakeAck, HandshakeHello, JoinRoomRequest, MessageType, RoomCreatedResponse,
    RoomJoinedResponse, PROTOCOL_VERSION,
};
use crate::room::Room;
use crate::tls;

/// TCP keepalive interval — matches Go's net.ListenConfig default (15s).
/// Dead peers are detected in ~45s (3 probes × 15s).
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Parse peer address string into SocketAddr, falling back to 0.0.0.0:0
fn parse_peer_addr(addr: &str) -> SocketAddr {
    addr.parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
}

/// Where a connection task goes after handling one message.
enum Next {
    Continue,
    Stop,
    /// Room created; stop reading and wait for the second peer.
    Park(Arc<Room>),
    /// Bridge session ran to completion on this task.
    Bridged,
}

/// Persistent link to a neighboring relay, plus the task that routes its
/// responses backward.
struct OutboundLink {
    peer: Arc<PeerConnection>,
    reader: JoinHandle<()>,
}

pub struct RelayServer {
    config: RelayConfig,
    state: Arc<AdminState>,
    connections: DashMap<ConnectionId, Arc<PeerConnection>>,
    outbound: DashMap<String, OutboundLink>,
    shutdown: CancellationToken,
}

impl RelayServer {
    pub fn new(config: RelayConfig, state: Arc<AdminState>) -> Self {
        RelayServer {
            config,
            state,
            connections: DashMap::new(),
            outbound: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run the accept loop until the shutdown token fires.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let tls_acceptor = tls::get_tls_acceptor(self.config.tls.as_ref())?;

        // Connection limiter: 0 = unlimited
        let conn_limiter = if self.config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(self.config.max_connections)))
        } else {
            None
        };

        // Bind TCP listener with SO_REUSEADDR for fast restarts
        let socket_addr: SocketAddr = self.config.listen_addr.parse()?;
        let socket = socket2::Socket::new(
            match socket_addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        // Allow immediate rebind after restart (skip TIME_WAIT)
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket_addr.into())?;
        socket.listen(self.config.tcp_backlog)?;

        let listener = tokio::net::TcpListener::from_std(socket.into())?;
        let local_addr = listener.local_addr()?;

        log::info!(
            address = %local_addr,
            mode = self.config.mode.as_str(),
            tls = tls_acceptor.is_some(),
            max_connections = self.config.max_connections,
            "Relay started"
        );
        self.state.mark_ready();

        // Idle circuits are reaped here rather than inside the manager so
        // each teardown can notify both neighbors.
        let sweeper = {
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(server.config.circuit.sweep_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = server.shutdown.cancelled() => break,
                        _ = ticker.tick() => server.sweep_idle_circuits().await,
                    }
                }
            })
        };

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let peer_addr = addr.to_string();
                    log::connection(&peer_addr, "new");

                    // Acquire connection permit (backpressure when at limit)
                    let _permit = if let Some(ref limiter) = conn_limiter {
                        match limiter.clone().acquire_owned().await {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        }
                    } else {
                        None
                    };

                    let server = Arc::clone(&self);
                    let tls_acceptor = tls_acceptor.clone();

                    tokio::spawn(async move {
                        // Hold permit for the lifetime of this connection
                        let _permit = _permit;
                        let result = async {
                            if server.config.tcp_nodelay {
                                let _ = stream.set_nodelay(true);
                            }

                            // Detect dead peers (mobile disconnect, network change)
                            let keepalive = TcpKeepalive::new()
                                .with_time(std::time::Duration::from_secs(TCP_KEEPALIVE_SECS))
                                .with_interval(std::time::Duration::from_secs(TCP_KEEPALIVE_SECS));
                            let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

                            if let Some(tls_acceptor) = tls_acceptor {
                                match tokio::time::timeout(
                                    server.config.tls_handshake_timeout,
                                    tls_acceptor.accept(stream),
                                )
                                .await
                                {
                                    Ok(Ok(tls_stream)) => {
                                        server.handle_connection(tls_stream, peer_addr.clone()).await;
                                        Ok(())
                                    }
                                    Ok(Err(e)) => Err(anyhow!("TLS handshake failed: {}", e)),
                                    Err(_) => Err(anyhow!("TLS handshake timeout")),
                                }
                            } else {
                                server.handle_connection(stream, peer_addr.clone()).await;
                                Ok(())
                            }
                        }
                        .await;

                        if let Err(e) = result {
                            log::debug!(peer = %peer_addr, error = %e, "Connection error");
                        }
                        log::connection(&peer_addr, "closed");
                    });
                }
                Err(e) => {
                    log::error!(error = %e, "Failed to accept connection");
                    if e.kind() == std::io::ErrorKind::Other {
                        break;
                    }
                }
            }
        }

        // A listener failure can break the loop without the token firing.
        self.shutdown.cancel();
        self.drain().await;
        let _ = sweeper.await;
        Ok(())
    }

    /// Reap idle circuits and tell both neighbors about each teardown.
    async fn sweep_idle_circuits(&self) {
        let swept = self.state.circuits.sweep();
        if swept.is_empty() {
            return;
        }
        for circuit in &swept {
            self.state.metrics.circuits_destroyed.inc();
            if let Some(ref endpoint) = circuit.next_hop {
                self.send_destroy_notice(endpoint, &circuit.id, "idle_timeout")
                    .await;
            }
            if let Some(conn) = self.connection(circuit.origin_conn) {
                conn.detach_circuit(&circuit.id);
                let notice = Envelope::control(
                    MessageType::DestroyCircuit,
                    0,
                    &circuit.id,
                    &DestroyCircuitNotice {
                        reason: "idle_timeout".to_string(),
                    },
                );
                if let Ok(env) = notice {
                    let _ = conn.send(&env).await;
                }
            }
        }
        self.sync_circuit_gauge();
        log::debug!(count = swept.len(), "Idle circuit sweep");
    }

    /// Close every inbound connection and outbound link.
    async fn drain(&self) {
        let peers: Vec<Arc<PeerConnection>> = self
            .connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for peer in peers {
            peer.close().await;
        }
        let endpoints: Vec<String> = self.outbound.iter().map(|e| e.key().clone()).collect();
        for endpoint in endpoints {
            if let Some((_, link)) = self.outbound.remove(&endpoint) {
                link.peer.close().await;
                link.reader.abort();
            }
        }
    }

    /// Full lifecycle of one inbound connection: admission, handshake,
    /// dispatch, teardown.
    pub async fn handle_connection<S>(self: Arc<Self>, stream: S, peer_addr: String)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let origin = parse_peer_addr(&peer_addr).ip();
        let peer = Arc::new(PeerConnection::new(
            stream,
            peer_addr.clone(),
            PeerRole::Client,
            self.config.read_timeout,
            self.config.write_timeout,
            self.config.max_frame_len,
        ));

        if !self.state.limiter.allow(origin) {
            self.state.metrics.rate_limit_hits.inc();
            log::rate_limit(&peer_addr, "connection rejected");
            let _ = self
                .send_error(&peer, 0, "", ErrorCode::RateLimited, "too many requests")
                .await;
            peer.close().await;
            return;
        }

        if self.handshake(&peer).await.is_err() {
            peer.close().await;
            return;
        }

        let conn_id = peer.id();
        self.connections.insert(conn_id, Arc::clone(&peer));
        self.state.metrics.connections_total.inc();
        self.state.metrics.active_connections.inc();
        let _unregister = scopeguard::guard((), |_| {
            self.connections.remove(&conn_id);
            self.state.metrics.active_connections.dec();
        });

        let mut parked: Option<Arc<Room>> = None;
        let mut bridged = false;

        loop {
            let env = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = peer.recv() => match res {
                    Ok(Some(env)) => env,
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!(peer = %peer_addr, error = %e, "Read failed");
                        break;
                    }
                },
            };

            match self.dispatch(&peer, origin, env).await {
                Next::Continue => {}
                Next::Stop => break,
                Next::Park(room) => {
                    parked = Some(room);
                    break;
                }
                Next::Bridged => {
                    bridged = true;
                    break;
                }
            }
        }

        let handed_off = match parked {
            Some(room) => self.park_room_creator(&peer, room).await,
            None => false,
        };

        if handed_off || bridged {
            // The bridge session owns the socket now (or already closed it);
            // circuits stay until the idle sweep.
            return;
        }

        for id in self.state.circuits.circuits_for_conn(conn_id) {
            self.destroy_and_propagate(&id, "origin_disconnect").await;
        }
        peer.close().await;
    }

    /// First frame must be a version-compatible hello; anything else ends
    /// the connection before it reaches the dispatch loop.
    async fn handshake(&self, peer: &Arc<PeerConnection>) -> crate::error::Result<()> {
        let env = peer.recv().await?.ok_or_else(|| {
            RelayError::Connection(format!("{} closed before handshake", peer.addr()))
        })?;
        if env.msg_type != MessageType::HandshakeHello {
            let _ = self
                .send_error(
                    peer,
                    env.request_id,
                    "",
                    ErrorCode::HandshakeFailed,
                    "expected HANDSHAKE_HELLO",
                )
                .await;
            return Err(RelayError::Protocol(format!(
                "first frame was {}",
                env.msg_type
            )));
        }
        let hello: HandshakeHello = env.parse_payload()?;
        if hello.version != PROTOCOL_VERSION {
            let _ = self
                .send_error(
                    peer,
                    env.request_id,
                    "",
                    ErrorCode::HandshakeFailed,
                    &format!("unsupported protocol version {}", hello.version),
                )
                .await;
            return Err(RelayError::Protocol(format!(
                "unsupported protocol version {}",
                hello.version
            )));
        }
        let ack = Envelope::control(
            MessageType::HandshakeAck,
            env.request_id,
            "",
            &HandshakeAck {
                version: PROTOCOL_VERSION,
                relay_id: self.config.relay_id.clone(),
                mode: self.config.mode.as_str().to_string(),
                fingerprint: self.state.key_exchanger.fingerprint(),
            },
        )?;
        peer.send(&ack).await
    }

    async fn dispatch(self: &Arc<Self>, peer: &Arc<PeerConnection>, origin: IpAddr, env: Envelope) -> Next {
        let request_id = env.request_id;
        let circuit_id = env.circuit_id.clone();
        let result = match env.msg_type {
            MessageType::Ping => {
                let pong = Envelope::new(MessageType::Pong, request_id, &circuit_id, Bytes::new());
                return match peer.send(&pong).await {
                    Ok(()) => Next::Continue,
                    Err(_) => Next::Stop,
                };
            }
            MessageType::Pong => return Next::Continue,
            MessageType::CreateCircuit => self.handle_create_circuit(peer, origin, &env).await,
            MessageType::ExtendCircuit => self.handle_extend_circuit(peer, &env).await,
            MessageType::RelayData => self.handle_relay_data(peer, &env).await,
            MessageType::DestroyCircuit => self.handle_destroy_circuit(peer, &env).await,
            MessageType::CreateRoom => {
                return match self.handle_create_room(peer, origin, &env).await {
                    Ok(room) => Next::Park(room),
                    Err(e) => self.reply_error(peer, request_id, &circuit_id, e).await,
                };
            }
            MessageType::JoinRoom => {
                return match self.handle_join_room(peer, origin, &env).await {
                    Ok(()) => Next::Bridged,
                    Err(e) => self.reply_error(peer, request_id, &circuit_id, e).await,
                };
            }
            other => {
                log::protocol("unexpected message", Some(other.as_str()));
                Err(RelayError::Protocol(format!(
                    "unexpected {} outside a session",
                    other
                )))
            }
        };

        match result {
            Ok(()) => Next::Continue,
            Err(e) => self.reply_error(peer, request_id, &circuit_id, e).await,
        }
    }

    /// Report a handler error to the peer. Fatal errors end the dispatch
    /// loop; everything else is a typed ERROR frame and carry on.
    async fn reply_error(
        &self,
        peer: &Arc<PeerConnection>,
        request_id: u32,
        circuit_id: &str,
        err: RelayError,
    ) -> Next {
        let code = err.code();
        self.state.metrics.record_error(code.as_str());
        let send = self
            .send_error(peer, request_id, circuit_id, code, &err.to_string())
            .await;
        // Only errors on this connection itself end the loop; a failed
        // forward or a bad request earns an ERROR frame and carries on.
        let fatal = matches!(err, RelayError::Io(_) | RelayError::Connection(_));
        if fatal || send.is_err() {
            Next::Stop
        } else {
            Next::Continue
        }
    }

    async fn send_error(
        &self,
        peer: &Arc<PeerConnection>,
        request_id: u32,
        circuit_id: &str,
        code: ErrorCode,
        message: &str,
    ) -> crate::error::Result<()> {
        let env = Envelope::control(
            MessageType::Error,
            request_id,
            circuit_id,
            &ErrorPayload {
                code: code.as_str().to_string(),
                message: message.to_string(),
                details: None,
            },
        )?;
        peer.send(&env).await
    }

    // -----------------------------------------------------------------------
    // Circuit handlers

    async fn handle_create_circuit(
        &self,
        peer: &Arc<PeerConnection>,
        origin: IpAddr,
        env: &Envelope,
    ) -> crate::error::Result<()> {
        if !self.state.limiter.allow(origin) {
            self.state.metrics.rate_limit_hits.inc();
            return Err(RelayError::RateLimited(origin.to_string()));
        }
        let req: CreateCircuitRequest = env.parse_payload()?;
        let info = self.state.circuits.create_circuit(&req, peer.id())?;
        peer.attach_circuit(&info.id);
        self.state.metrics.circuits_created.inc();
        self.sync_circuit_gauge();
        let reply = Envelope::control(
            MessageType::CircuitCreated,
            env.request_id,
            &info.id,
            &CircuitCreatedResponse {
                circuit_id: info.id.clone(),
            },
        )?;
        peer.send(&reply).await
    }

    async fn handle_extend_circuit(
        self: &Arc<Self>,
        peer: &Arc<PeerConnection>,
        env: &Envelope,
    ) -> crate::error::Result<()> {
        let req: ExtendCircuitRequest = env.parse_payload()?;
        let circuit_id = env.circuit_id.clone();
        if !self.state.circuits.contains(&circuit_id) {
            return Err(RelayError::CircuitNotFound(circuit_id));
        }
        let key_envelope = req
            .key_envelope
            .ok_or_else(|| RelayError::Protocol("extend requires a key envelope".to_string()))?;

        let link = match self.outbound_connection(&req.next_hop).await {
            Ok(link) => link,
            Err(e) => {
                // The circuit cannot grow past a dead hop; end it.
                self.fail_circuit_backward(peer, &circuit_id, "next_hop_unreachable")
                    .await;
                return Err(RelayError::RelayFailed(format!(
                    "next hop {}: {}",
                    req.next_hop, e
                )));
            }
        };

        // The next relay sees an ordinary circuit creation; only the client
        // knows the full path.
        let forward = Envelope::control(
            MessageType::CreateCircuit,
            env.request_id,
            &circuit_id,
            &CreateCircuitRequest {
                circuit_id: circuit_id.clone(),
                key_envelope,
                next_hop: None,
            },
        )?;
        if let Err(e) = link.send(&forward).await {
            self.fail_circuit_backward(peer, &circuit_id, "next_hop_lost").await;
            return Err(RelayError::RelayFailed(format!(
                "forward to {}: {}",
                req.next_hop, e
            )));
        }

        self.state.circuits.extend_circuit(&circuit_id, &req.next_hop)?;

        let reply = Envelope::new(
            MessageType::CircuitExtended,
            env.request_id,
            &circuit_id,
            Bytes::new(),
        );
        peer.send(&reply).await
    }

    async fn handle_relay_data(
        self: &Arc<Self>,
        peer: &Arc<PeerConnection>,
        env: &Envelope,
    ) -> crate::error::Result<()> {
        let circuit_id = env.circuit_id.clone();
        let key = self.state.circuits.session_key(&circuit_id)?;
        // Captured before any teardown path can remove the entry.
        let recorded_hop = self.state.circuits.next_hop(&circuit_id).ok().flatten();

        let (header, inner) = match onion::unwrap_layer(&key, &circuit_id, &env.payload) {
            Ok(unwrapped) => unwrapped,
            Err(e) => {
                if self.state.circuits.record_decrypt_failure(&circuit_id) {
                    self.state.metrics.circuits_destroyed.inc();
                    self.sync_circuit_gauge();
                    if let Some(ref endpoint) = recorded_hop {
                        self.send_destroy_notice(endpoint, &circuit_id, "decrypt_failures")
                            .await;
                    }
                    peer.detach_circuit(&circuit_id);
                }
                return Err(e);
            }
        };
        self.state.circuits.record_decrypt_success(&circuit_id);

        if let Err(e) = self.state.circuits.record_forward(&circuit_id, env.payload.len() as u64) {
            // record_forward destroys over-ceiling circuits itself; only the
            // neighbors still need to hear about it.
            if !self.state.circuits.contains(&circuit_id) {
                self.state.metrics.circuits_destroyed.inc();
                self.sync_circuit_gauge();
                if let Some(ref endpoint) = recorded_hop {
                    self.send_destroy_notice(endpoint, &circuit_id, "byte_limit").await;
                }
                peer.detach_circuit(&circuit_id);
            }
            return Err(e);
        }
        self.state
            .metrics
            .bytes_relayed
            .inc_by(env.payload.len() as u64);
        self.state.metrics.messages_relayed.inc();

        // An empty next hop means the layer addressed to us was the last one.
        if header.next_hop.is_empty() {
            if !self.config.mode.allows_exit() {
                return Err(RelayError::RelayFailed(format!(
                    "{} mode cannot terminate circuits",
                    self.config.mode.as_str()
                )));
            }
            let _ = self.state.circuits.mark_established(&circuit_id);
            log::debug!(
                circuit_id = %circuit_id,
                size = inner.len(),
                "Exit payload delivered"
            );
            let ack = Envelope::new(
                MessageType::RelayAck,
                env.request_id,
                &circuit_id,
                Bytes::new(),
            );
            return peer.send(&ack).await;
        }

        // A routing instruction an exit-only relay cannot honor is an
        // error, not an exit delivery.
        if self.config.mode == RelayMode::Exit {
            return Err(RelayError::Protocol(format!(
                "exit relay cannot forward to {}",
                header.next_hop
            )));
        }

        // A dead next hop ends the circuit, not just this frame.
        let link = match self.outbound_connection(&header.next_hop).await {
            Ok(link) => link,
            Err(e) => {
                self.fail_circuit_backward(peer, &circuit_id, "next_hop_unreachable")
                    .await;
                return Err(RelayError::RelayFailed(format!(
                    "next hop {}: {}",
                    header.next_hop, e
                )));
            }
        };
        let forward = Envelope::new(
            MessageType::RelayData,
            env.request_id,
            &circuit_id,
            inner,
        );
        if let Err(e) = link.send(&forward).await {
            self.fail_circuit_backward(peer, &circuit_id, "next_hop_lost").await;
            return Err(RelayError::RelayFailed(format!(
                "forward to {}: {}",
                header.next_hop, e
            )));
        }
        log::debug!(
            circuit_id = %circuit_id,
            next_hop = %header.next_hop,
            "Data relayed"
        );
        Ok(())
    }

    async fn handle_destroy_circuit(
        &self,
        peer: &Arc<PeerConnection>,
        env: &Envelope,
    ) -> crate::error::Result<()> {
        let reason = env
            .parse_payload::<DestroyCircuitNotice>()
            .map(|n| n.reason)
            .unwrap_or_default();
        let reason = if reason.is_empty() {
            "peer_request".to_string()
        } else {
            reason
        };

        self.destroy_and_propagate(&env.circuit_id, &reason).await;
        peer.detach_circuit(&env.circuit_id);

        // Confirm even when the circuit was already gone; teardown is
        // idempotent on both ends.
        let reply = Envelope::new(
            MessageType::CircuitDestroyed,
            env.request_id,
            &env.circuit_id,
            Bytes::new(),
        );
        peer.send(&reply).await
    }

    /// Tear down a circuit and tell its successor, if this relay performed
    /// the teardown. Losers of the destroy race stay silent so notices
    /// cannot ping-pong between neighbors.
    async fn destroy_and_propagate(&self, circuit_id: &str, reason: &str) -> bool {
        if !self.state.circuits.contains(circuit_id) {
            return false;
        }
        let next_hop = self.state.circuits.next_hop(circuit_id).ok().flatten();
        if !self.state.circuits.destroy_circuit(circuit_id, reason) {
            return false;
        }
        self.state.metrics.circuits_destroyed.inc();
        self.sync_circuit_gauge();
        if let Some(endpoint) = next_hop {
            self.send_destroy_notice(&endpoint, circuit_id, reason).await;
        }
        true
    }

    /// A dead next hop is fatal to the circuit: tear it down, notify the
    /// successor side if any link remains, and tell the predecessor that
    /// sent the frame.
    async fn fail_circuit_backward(
        &self,
        peer: &Arc<PeerConnection>,
        circuit_id: &str,
        reason: &str,
    ) {
        if !self.destroy_and_propagate(circuit_id, reason).await {
            return;
        }
        peer.detach_circuit(circuit_id);
        let notice = Envelope::control(
            MessageType::DestroyCircuit,
            0,
            circuit_id,
            &DestroyCircuitNotice {
                reason: reason.to_string(),
            },
        );
        if let Ok(env) = notice {
            let _ = peer.send(&env).await;
        }
    }

    /// Send a destroy notice down the outbound link the circuit was using.
    async fn send_destroy_notice(&self, endpoint: &str, circuit_id: &str, reason: &str) {
        let link = self
            .outbound
            .get(endpoint)
            .map(|l| Arc::clone(&l.peer));
        let link = match link {
            Some(link) if !link.is_closed() => link,
            _ => return,
        };
        let notice = match Envelope::control(
            MessageType::DestroyCircuit,
            0,
            circuit_id,
            &DestroyCircuitNotice {
                reason: reason.to_string(),
            },
        ) {
            Ok(env) => env,
            Err(_) => return,
        };
        let _ = link.send(&notice).await;
    }

    // -----------------------------------------------------------------------
    // Room handlers

    async fn handle_create_room(
        &self,
        peer: &Arc<PeerConnection>,
        origin: IpAddr,
        env: &Envelope,
    ) -> crate::error::Result<Arc<Room>> {
        if !self.config.mode.accepts_clients() {
            return Err(RelayError::Protocol(format!(
                "{} mode does not accept client sessions",
                self.config.mode.as_str()
            )));
        }
        if !self.state.limiter.allow(origin) {
            self.state.metrics.rate_limit_hits.inc();
            return Err(RelayError::RateLimited(origin.to_string()));
        }
        let req: CreateRoomRequest = env.parse_payload()?;
        validate_create_room(&req)?;
        let expiry = if req.expiry_minutes == 0 {
            None
        } else {
            Some(std::time::Duration::from_secs(req.expiry_minutes * 60))
        };

        let room = self.state.rooms.create_room(expiry)?;
        room.add_peer(Arc::clone(peer))?;
        self.state.metrics.rooms_created.inc();
        self.sync_room_gauge();

        let reply = Envelope::control(
            MessageType::RoomCreated,
            env.request_id,
            "",
            &RoomCreatedResponse {
                room_id: room.id().to_string(),
                code: room.code().to_string(),
                expires_in_secs: room.time_remaining().as_secs(),
            },
        )?;
        peer.send(&reply).await?;
        Ok(room)
    }

    /// Wait for the second peer after a room creation. Returns true when the
    /// socket was handed off to a bridge session started by the joiner's
    /// task.
    async fn park_room_creator(&self, peer: &Arc<PeerConnection>, room: Arc<Room>) -> bool {
        let notified = room.peer_joined.notified();
        tokio::pin!(notified);
        // Register before checking so a join between the check and the await
        // cannot be missed.
        notified.as_mut().enable();
        if room.peer_count() >= 2 {
            return true;
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                room.remove_peer(peer.id());
                false
            }
            _ = tokio::time::sleep(room.time_remaining()) => {
                log::room(room.code(), "expired while waiting");
                room.remove_peer(peer.id());
                self.state.rooms.remove_room(room.id());
                self.state.metrics.rooms_expired.inc();
                self.sync_room_gauge();
                false
            }
            _ = &mut notified => {
                // close() also notifies; only a real join is a handoff.
                !room.is_closed() && room.peer_count() >= 2
            }
        }
    }

    async fn handle_join_room(
        self: &Arc<Self>,
        peer: &Arc<PeerConnection>,
        origin: IpAddr,
        env: &Envelope,
    ) -> crate::error::Result<()> {
        if !self.config.mode.accepts_clients() {
            return Err(RelayError::Protocol(format!(
                "{} mode does not accept client sessions",
                self.config.mode.as_str()
            )));
        }
        if !self.state.limiter.allow(origin) {
            self.state.metrics.rate_limit_hits.inc();
            return Err(RelayError::RateLimited(origin.to_string()));
        }
        let req: JoinRoomRequest = env.parse_payload()?;
        validate_join_room(&req)?;

        let room = self.state.rooms.get_room_by_code(&req.code)?;
        room.add_peer(Arc::clone(peer))?;
        let creator = match room.other_peer(peer.id()) {
            Some(creator) => creator,
            None => {
                room.remove_peer(peer.id());
                return Err(RelayError::RoomClosed);
            }
        };

        let reply = Envelope::control(
            MessageType::RoomJoined,
            env.request_id,
            "",
            &RoomJoinedResponse {
                room_id: room.id().to_string(),
            },
        )?;
        peer.send(&reply).await?;
        let joined = Envelope::new(MessageType::PeerJoined, 0, "", Bytes::new());
        let _ = creator.send(&joined).await;

        log::room(room.code(), "bridging");
        let stats = bridge::run(
            creator,
            Arc::clone(peer),
            self.config.bridge.clone(),
            &self.shutdown,
        )
        .await;

        self.state.metrics.transfers_completed.inc();
        self.state
            .metrics
            .transfer_duration
            .observe(stats.duration_secs);
        self.state.metrics.bytes_relayed.inc_by(stats.total_bytes());
        log::info!(
            room = room.code(),
            bytes = stats.total_bytes(),
            messages = stats.total_messages(),
            duration_secs = stats.duration_secs,
            reason = stats.reason,
            "Bridge session finished"
        );

        self.state.rooms.remove_room(room.id());
        self.sync_room_gauge();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Outbound links

    /// Reuse or dial the link to `endpoint`. Each endpoint gets one shared
    /// connection; a dead one is replaced on the next call.
    async fn outbound_connection(
        self: &Arc<Self>,
        endpoint: &str,
    ) -> crate::error::Result<Arc<PeerConnection>> {
        if let Some(link) = self.outbound.get(endpoint) {
            if !link.peer.is_closed() {
                return Ok(Arc::clone(&link.peer));
            }
        }
        self.outbound.remove(endpoint);

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| RelayError::Connection(format!("connect timeout to {}", endpoint)))??;
        let _ = stream.set_nodelay(true);

        let peer = Arc::new(PeerConnection::new(
            stream,
            endpoint.to_string(),
            PeerRole::Relay,
            self.config.read_timeout,
            self.config.write_timeout,
            self.config.max_frame_len,
        ));

        let hello = Envelope::control(
            MessageType::HandshakeHello,
            0,
            "",
            &HandshakeHello {
                version: PROTOCOL_VERSION,
                client_info: Some(self.config.relay_id.clone()),
            },
        )?;
        peer.send(&hello).await?;

        let reader = {
            let server = Arc::clone(self);
            let peer = Arc::clone(&peer);
            let endpoint = endpoint.to_string();
            tokio::spawn(async move {
                server.run_outbound_reader(peer, endpoint).await;
            })
        };

        match self.outbound.entry(endpoint.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                // Lost a dial race; keep the first link.
                reader.abort();
                peer.close().await;
                Ok(Arc::clone(&existing.get().peer))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let peer = Arc::clone(&peer);
                slot.insert(OutboundLink {
                    peer: Arc::clone(&peer),
                    reader,
                });
                log::connection(&peer.addr().to_string(), "outbound link up");
                Ok(peer)
            }
        }
    }

    /// Route frames from a downstream relay back to the circuits that use
    /// this link. Runs until the link dies, then destroys those circuits.
    async fn run_outbound_reader(self: Arc<Self>, link: Arc<PeerConnection>, endpoint: String) {
        loop {
            let env = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = link.recv() => match res {
                    Ok(Some(env)) => env,
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!(endpoint = %endpoint, error = %e, "Outbound link read failed");
                        break;
                    }
                },
            };

            match env.msg_type {
                MessageType::HandshakeAck => continue,
                MessageType::Ping => {
                    let pong =
                        Envelope::new(MessageType::Pong, env.request_id, &env.circuit_id, Bytes::new());
                    if link.send(&pong).await.is_err() {
                        break;
                    }
                    continue;
                }
                MessageType::Pong => continue,
                MessageType::CircuitCreated => {
                    // Hop-by-hop ack for our forwarded creation; the
                    // predecessor already received CIRCUIT_EXTENDED.
                    let _ = self.state.circuits.mark_established(&env.circuit_id);
                    continue;
                }
                MessageType::DestroyCircuit => {
                    let reason = env
                        .parse_payload::<DestroyCircuitNotice>()
                        .map(|n| n.reason)
                        .unwrap_or_else(|_| "next_hop_request".to_string());
                    self.route_backward_destroy(&env, &reason).await;
                    continue;
                }
                _ => {}
            }
            self.route_backward(&env).await;
        }

        self.outbound.remove(&endpoint);
        link.close().await;
        for id in self.state.circuits.circuits_by_next_hop(&endpoint) {
            let origin = self.state.circuits.origin_conn(&id).ok();
            if self.state.circuits.destroy_circuit(&id, "next_hop_lost") {
                self.state.metrics.circuits_destroyed.inc();
                self.sync_circuit_gauge();
                if let Some(conn) = origin.and_then(|c| self.connection(c)) {
                    let notice = Envelope::control(
                        MessageType::DestroyCircuit,
                        0,
                        &id,
                        &DestroyCircuitNotice {
                            reason: "next_hop_lost".to_string(),
                        },
                    );
                    if let Ok(env) = notice {
                        let _ = conn.send(&env).await;
                    }
                }
            }
        }
        log::connection(&endpoint, "outbound link down");
    }

    fn connection(&self, id: ConnectionId) -> Option<Arc<PeerConnection>> {
        self.connections.get(&id).map(|c| Arc::clone(c.value()))
    }

    // Gauges track the manager tables, which the sweep tasks also mutate;
    // resampling instead of inc/dec keeps them honest.
    fn sync_circuit_gauge(&self) {
        self.state
            .metrics
            .active_circuits
            .set(self.state.circuits.stats().active as i64);
    }

    fn sync_room_gauge(&self) {
        self.state
            .metrics
            .active_rooms
            .set(self.state.rooms.stats().active_rooms as i64);
    }

    /// Forward a downstream frame to the connection the circuit came from.
    async fn route_backward(&self, env: &Envelope) {
        if env.circuit_id.is_empty() {
            return;
        }
        let origin = match self.state.circuits.origin_conn(&env.circuit_id) {
            Ok(origin) => origin,
            Err(_) => {
                log::debug!(circuit_id = %env.circuit_id, "Dropping frame for unknown circuit");
                return;
            }
        };
        self.state.circuits.update_activity(&env.circuit_id);
        match self.connection(origin) {
            Some(conn) => {
                let _ = conn.send(env).await;
            }
            None => {
                log::debug!(circuit_id = %env.circuit_id, "Origin connection gone");
            }
        }
    }

    /// A downstream relay tore the circuit down; mirror it here and tell
    /// the predecessor.
    async fn route_backward_destroy(&self, env: &Envelope, reason: &str) {
        let origin = self.state.circuits.origin_conn(&env.circuit_id).ok();
        if !self.state.circuits.destroy_circuit(&env.circuit_id, reason) {
            return;
        }
        self.state.metrics.circuits_destroyed.inc();
        self.sync_circuit_gauge();
        if let Some(conn) = origin.and_then(|c| self.connection(c)) {
            conn.detach_circuit(&env.circuit_id);
            let _ = conn.send(env).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{AdminState, Metrics};
    use crate::circuit::{generate_circuit_id, CircuitConfig, CircuitManager};
    use crate::config::RelayMode;
    use crate::onion::{EphemeralKeyExchanger, KeyExchanger};
    use crate::protocol::DEFAULT_MAX_FRAME_LEN;
    use crate::ratelimit::{RateLimitConfig, RateLimiter};
    use crate::room::{RoomConfig, RoomManager};
    use sha2::{Digest, Sha256};
    use std::time::Duration;

    fn test_config(mode: RelayMode) -> RelayConfig {
        RelayConfig {
            relay_id: "relay-test".to_string(),
            mode,
            listen_addr: "127.0.0.1:0".to_string(),
            admin_addr: "127.0.0.1:0".to_string(),
            max_connections: 16,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            tls_handshake_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            tcp_backlog: 128,
            tcp_nodelay: true,
            tls: None,
            public_endpoint: None,
            directory_url: None,
            max_bandwidth: 0,
            circuit: CircuitConfig::default(),
            room: RoomConfig::default(),
            rate_limit: RateLimitConfig::default(),
            bridge: crate::bridge::BridgeConfig {
                max_bytes: 1024 * 1024,
                idle_timeout: Duration::from_secs(5),
                watchdog_interval: Duration::from_millis(50),
                read_timeout: Duration::from_secs(5),
                ping_interval: Duration::from_secs(30),
            },
        }
    }

    fn test_server(mode: RelayMode) -> Arc<RelayServer> {
        test_server_with(test_config(mode))
    }

    fn test_server_with(config: RelayConfig) -> Arc<RelayServer> {
        let exchanger: Arc<dyn KeyExchanger> = Arc::new(EphemeralKeyExchanger::generate());
        let circuits = Arc::new(CircuitManager::new(
            config.circuit.clone(),
            Arc::clone(&exchanger),
        ));
        let rooms = Arc::new(RoomManager::new(config.room.clone()));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let state = Arc::new(AdminState::new(
            config.relay_id.clone(),
            config.mode,
            Metrics::new().unwrap(),
            circuits,
            rooms,
            limiter,
            exchanger,
        ));
        Arc::new(RelayServer::new(config, state))
    }

    /// Spawn a connection task and return the client side of the pipe.
    fn connect(server: &Arc<RelayServer>, addr: &str) -> Arc<PeerConnection> {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let server = Arc::clone(server);
        let addr = addr.to_string();
        tokio::spawn(async move {
            server.handle_connection(server_io, addr).await;
        });
        Arc::new(PeerConnection::new(
            client_io,
            "client".to_string(),
            PeerRole::Client,
            Duration::from_secs(5),
            Duration::from_secs(5),
            DEFAULT_MAX_FRAME_LEN,
        ))
    }

    async fn do_handshake(client: &Arc<PeerConnection>) -> HandshakeAck {
        let hello = Envelope::control(
            MessageType::HandshakeHello,
            1,
            "",
            &HandshakeHello {
                version: PROTOCOL_VERSION,
                client_info: None,
            },
        )
        .unwrap();
        client.send(&hello).await.unwrap();
        let ack = client.recv().await.unwrap().unwrap();
        assert_eq!(ack.msg_type, MessageType::HandshakeAck);
        ack.parse_payload().unwrap()
    }

    /// Hex key envelope the default exchanger accepts for `circuit_id`.
    fn make_envelope(server: &Arc<RelayServer>) -> String {
        // Any 32 bytes decapsulate under the stand-in exchanger; use the
        // public key digest so the shared secret is all zeros.
        let digest: [u8; 32] =
            Sha256::digest(server.state.key_exchanger.public_key()).into();
        hex::encode(digest)
    }

    async fn create_circuit(
        client: &Arc<PeerConnection>,
        server: &Arc<RelayServer>,
    ) -> String {
        let circuit_id = generate_circuit_id();
        let req = Envelope::control(
            MessageType::CreateCircuit,
            2,
            &circuit_id,
            &CreateCircuitRequest {
                circuit_id: circuit_id.clone(),
                key_envelope: make_envelope(server),
                next_hop: None,
            },
        )
        .unwrap();
        client.send(&req).await.unwrap();
        let reply = client.recv().await.unwrap().unwrap();
        assert_eq!(reply.msg_type, MessageType::CircuitCreated);
        assert_eq!(reply.circuit_id, circuit_id);
        circuit_id
    }

    #[tokio::test]
    async fn test_handshake_and_ping() {
        let server = test_server(RelayMode::Any);
        let client = connect(&server, "10.0.0.1:5000");

        let ack = do_handshake(&client).await;
        assert_eq!(ack.version, PROTOCOL_VERSION);
        assert_eq!(ack.relay_id, "relay-test");
        assert_eq!(ack.mode, "any");
        assert!(!ack.fingerprint.is_empty());

        let ping = Envelope::new(MessageType::Ping, 9, "", Bytes::new());
        client.send(&ping).await.unwrap();
        let pong = client.recv().await.unwrap().unwrap();
        assert_eq!(pong.msg_type, MessageType::Pong);
        assert_eq!(pong.request_id, 9);
        // Registration happens before the dispatch loop answers anything.
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_first_frame() {
        let server = test_server(RelayMode::Any);
        let client = connect(&server, "10.0.0.2:5000");

        let ping = Envelope::new(MessageType::Ping, 1, "", Bytes::new());
        client.send(&ping).await.unwrap();
        let err = client.recv().await.unwrap().unwrap();
        assert_eq!(err.msg_type, MessageType::Error);
        let payload: ErrorPayload = err.parse_payload().unwrap();
        assert_eq!(payload.code, "HANDSHAKE_FAILED");
        // Server closes after a failed handshake.
        assert!(client.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handshake_rejects_version_mismatch() {
        let server = test_server(RelayMode::Any);
        let client = connect(&server, "10.0.0.3:5000");

        let hello = Envelope::control(
            MessageType::HandshakeHello,
            1,
            "",
            &HandshakeHello {
                version: 99,
                client_info: None,
            },
        )
        .unwrap();
        client.send(&hello).await.unwrap();
        let err = client.recv().await.unwrap().unwrap();
        let payload: ErrorPayload = err.parse_payload().unwrap();
        assert_eq!(payload.code, "HANDSHAKE_FAILED");
    }

    #[tokio::test]
    async fn test_create_and_destroy_circuit() {
        let server = test_server(RelayMode::Any);
        let client = connect(&server, "10.0.0.4:5000");
        do_handshake(&client).await;

        let circuit_id = create_circuit(&client, &server).await;
        assert!(server.state.circuits.contains(&circuit_id));

        let destroy = Envelope::control(
            MessageType::DestroyCircuit,
            3,
            &circuit_id,
            &DestroyCircuitNotice {
                reason: "done".to_string(),
            },
        )
        .unwrap();
        client.send(&destroy).await.unwrap();
        let reply = client.recv().await.unwrap().unwrap();
        assert_eq!(reply.msg_type, MessageType::CircuitDestroyed);
        assert!(!server.state.circuits.contains(&circuit_id));

        // Destroy again: still confirmed, still idempotent.
        client.send(&destroy).await.unwrap();
        let reply = client.recv().await.unwrap().unwrap();
        assert_eq!(reply.msg_type, MessageType::CircuitDestroyed);
    }

    #[tokio::test]
    async fn test_create_circuit_duplicate_id_rejected() {
        let server = test_server(RelayMode::Any);
        let client = connect(&server, "10.0.0.5:5000");
        do_handshake(&client).await;

        let circuit_id = create_circuit(&client, &server).await;
        let req = Envelope::control(
            MessageType::CreateCircuit,
            4,
            &circuit_id,
            &CreateCircuitRequest {
                circuit_id: circuit_id.clone(),
                key_envelope: make_envelope(&server),
                next_hop: None,
            },
        )
        .unwrap();
        client.send(&req).await.unwrap();
        let err = client.recv().await.unwrap().unwrap();
        assert_eq!(err.msg_type, MessageType::Error);
        let payload: ErrorPayload = err.parse_payload().unwrap();
        assert_eq!(payload.code, "CIRCUIT_EXISTS");
    }

    #[tokio::test]
    async fn test_relay_data_exit_delivery() {
        let server = test_server(RelayMode::Exit);
        let client = connect(&server, "10.0.0.6:5000");
        do_handshake(&client).await;
        let circuit_id = create_circuit(&client, &server).await;

        let key = server.state.circuits.session_key(&circuit_id).unwrap();
        let wrapped = onion::wrap_layer(&key, "", b"final payload").unwrap();
        let data = Envelope::new(MessageType::RelayData, 5, &circuit_id, wrapped);
        client.send(&data).await.unwrap();

        let ack = client.recv().await.unwrap().unwrap();
        assert_eq!(ack.msg_type, MessageType::RelayAck);
        assert_eq!(ack.circuit_id, circuit_id);
        assert_eq!(
            server.state.circuits.get_state(&circuit_id).unwrap(),
            crate::circuit::CircuitState::Established
        );
    }

    #[tokio::test]
    async fn test_relay_data_garbage_gets_decryption_error() {
        let server = test_server(RelayMode::Any);
        let client = connect(&server, "10.0.0.7:5000");
        do_handshake(&client).await;
        let circuit_id = create_circuit(&client, &server).await;

        let data = Envelope::new(
            MessageType::RelayData,
            5,
            &circuit_id,
            Bytes::from_static(&[0u8; 64]),
        );
        client.send(&data).await.unwrap();
        let err = client.recv().await.unwrap().unwrap();
        assert_eq!(err.msg_type, MessageType::Error);
        let payload: ErrorPayload = err.parse_payload().unwrap();
        assert_eq!(payload.code, "DECRYPTION_FAILED");
        // One failure is not fatal.
        assert!(server.state.circuits.contains(&circuit_id));
    }

    #[tokio::test]
    async fn test_repeated_decrypt_failures_destroy_circuit() {
        let mut config = test_config(RelayMode::Any);
        config.circuit.max_decrypt_failures = 2;
        let server = test_server_with(config);
        let client = connect(&server, "10.0.0.8:5000");
        do_handshake(&client).await;
        let circuit_id = create_circuit(&client, &server).await;

        for _ in 0..2 {
            let data = Envelope::new(
                MessageType::RelayData,
                6,
                &circuit_id,
                Bytes::from_static(&[0u8; 64]),
            );
            client.send(&data).await.unwrap();
            let err = client.recv().await.unwrap().unwrap();
            assert_eq!(err.msg_type, MessageType::Error);
        }
        assert!(!server.state.circuits.contains(&circuit_id));
    }

    #[tokio::test]
    async fn test_relay_data_unknown_circuit() {
        let server = test_server(RelayMode::Any);
        let client = connect(&server, "10.0.0.9:5000");
        do_handshake(&client).await;

        let data = Envelope::new(
            MessageType::RelayData,
            7,
            &generate_circuit_id(),
            Bytes::from_static(b"x"),
        );
        client.send(&data).await.unwrap();
        let err = client.recv().await.unwrap().unwrap();
        let payload: ErrorPayload = err.parse_payload().unwrap();
        assert_eq!(payload.code, "CIRCUIT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_room_create_join_and_bridge() {
        let server = test_server(RelayMode::Entry);
        let creator = connect(&server, "10.0.1.1:5000");
        let joiner = connect(&server, "10.0.1.2:5000");
        do_handshake(&creator).await;
        do_handshake(&joiner).await;

        let create = Envelope::control(
            MessageType::CreateRoom,
            1,
            "",
            &CreateRoomRequest { expiry_minutes: 10 },
        )
        .unwrap();
        creator.send(&create).await.unwrap();
        let created = creator.recv().await.unwrap().unwrap();
        assert_eq!(created.msg_type, MessageType::RoomCreated);
        let room: RoomCreatedResponse = created.parse_payload().unwrap();
        assert!(!room.code.is_empty());

        let join = Envelope::control(
            MessageType::JoinRoom,
            2,
            "",
            &JoinRoomRequest {
                code: room.code.clone(),
            },
        )
        .unwrap();
        joiner.send(&join).await.unwrap();
        let joined = joiner.recv().await.unwrap().unwrap();
        assert_eq!(joined.msg_type, MessageType::RoomJoined);

        let notice = creator.recv().await.unwrap().unwrap();
        assert_eq!(notice.msg_type, MessageType::PeerJoined);

        // Opaque frames now flow peer to peer through the bridge.
        let payload = Envelope::new(MessageType::Data, 3, "", Bytes::from_static(b"chunk"));
        creator.send(&payload).await.unwrap();
        let relayed = joiner.recv().await.unwrap().unwrap();
        assert_eq!(relayed.msg_type, MessageType::Data);
        assert_eq!(&relayed.payload[..], b"chunk");

        let reply = Envelope::new(MessageType::Data, 4, "", Bytes::from_static(b"echo"));
        joiner.send(&reply).await.unwrap();
        let relayed = creator.recv().await.unwrap().unwrap();
        assert_eq!(&relayed.payload[..], b"echo");

        // Either side hanging up ends the session and the room.
        creator.close().await;
        for _ in 0..50 {
            if server.state.rooms.stats().active_rooms == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.state.rooms.stats().active_rooms, 0);
    }

    #[tokio::test]
    async fn test_join_unknown_code() {
        let server = test_server(RelayMode::Any);
        let client = connect(&server, "10.0.1.3:5000");
        do_handshake(&client).await;

        let join = Envelope::control(
            MessageType::JoinRoom,
            1,
            "",
            &JoinRoomRequest {
                code: "alpha-bravo-charlie".to_string(),
            },
        )
        .unwrap();
        client.send(&join).await.unwrap();
        let err = client.recv().await.unwrap().unwrap();
        let payload: ErrorPayload = err.parse_payload().unwrap();
        assert_eq!(payload.code, "ROOM_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_middle_mode_refuses_rooms() {
        let server = test_server(RelayMode::Middle);
        let client = connect(&server, "10.0.1.4:5000");
        do_handshake(&client).await;

        let create = Envelope::control(
            MessageType::CreateRoom,
            1,
            "",
            &CreateRoomRequest { expiry_minutes: 0 },
        )
        .unwrap();
        client.send(&create).await.unwrap();
        let err = client.recv().await.unwrap().unwrap();
        assert_eq!(err.msg_type, MessageType::Error);
        let payload: ErrorPayload = err.parse_payload().unwrap();
        assert_eq!(payload.code, "INVALID_MESSAGE");
    }

    #[tokio::test]
    async fn test_rate_limited_connection_refused() {
        let mut config = test_config(RelayMode::Any);
        config.rate_limit.rate_per_sec = 0.0;
        config.rate_limit.burst = 1.0;
        let server = test_server_with(config);

        // First connection takes the only token.
        let first = connect(&server, "10.9.9.9:1000");
        do_handshake(&first).await;

        let second = connect(&server, "10.9.9.9:1001");
        let err = second.recv().await.unwrap().unwrap();
        assert_eq!(err.msg_type, MessageType::Error);
        let payload: ErrorPayload = err.parse_payload().unwrap();
        assert_eq!(payload.code, "RATE_LIMITED");
        assert_eq!(server.state.metrics.rate_limit_hits.get(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_destroys_attached_circuits() {
        let server = test_server(RelayMode::Any);
        let client = connect(&server, "10.0.2.1:5000");
        do_handshake(&client).await;
        let circuit_id = create_circuit(&client, &server).await;
        assert!(server.state.circuits.contains(&circuit_id));

        client.close().await;
        for _ in 0..50 {
            if !server.state.circuits.contains(&circuit_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!server.state.circuits.contains(&circuit_id));
    }

    #[tokio::test]
    async fn test_extend_circuit_forwards_to_next_hop() {
        let server = test_server(RelayMode::Any);

        // Fake downstream relay on a real socket; extension dials it. The
        // task holds its socket until released, so the outbound reader does
        // not see a dead link while the test is still asserting.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let next_hop = listener.local_addr().unwrap().to_string();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let downstream = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let relay = PeerConnection::new(
                stream,
                "downstream".to_string(),
                PeerRole::Relay,
                Duration::from_secs(5),
                Duration::from_secs(5),
                DEFAULT_MAX_FRAME_LEN,
            );
            let hello = relay.recv().await.unwrap().unwrap();
            assert_eq!(hello.msg_type, MessageType::HandshakeHello);
            let create = relay.recv().await.unwrap().unwrap();
            assert_eq!(create.msg_type, MessageType::CreateCircuit);
            let req: CreateCircuitRequest = create.parse_payload().unwrap();
            let reply = Envelope::control(
                MessageType::CircuitCreated,
                create.request_id,
                &create.circuit_id,
                &CircuitCreatedResponse {
                    circuit_id: req.circuit_id,
                },
            )
            .unwrap();
            relay.send(&reply).await.unwrap();
            let _ = release_rx.await;
            create.circuit_id
        });

        let client = connect(&server, "10.0.3.1:5000");
        do_handshake(&client).await;
        let circuit_id = create_circuit(&client, &server).await;

        let extend = Envelope::control(
            MessageType::ExtendCircuit,
            8,
            &circuit_id,
            &ExtendCircuitRequest {
                next_hop: next_hop.clone(),
                key_envelope: Some(make_envelope(&server)),
            },
        )
        .unwrap();
        client.send(&extend).await.unwrap();
        let reply = client.recv().await.unwrap().unwrap();
        assert_eq!(reply.msg_type, MessageType::CircuitExtended);

        assert_eq!(
            server.state.circuits.next_hop(&circuit_id).unwrap(),
            Some(next_hop)
        );
        // The downstream confirmation flips the circuit to established.
        for _ in 0..50 {
            if server.state.circuits.get_state(&circuit_id).unwrap()
                == crate::circuit::CircuitState::Established
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            server.state.circuits.get_state(&circuit_id).unwrap(),
            crate::circuit::CircuitState::Established
        );

        release_tx.send(()).unwrap();
        let forwarded_id = downstream.await.unwrap();
        assert_eq!(forwarded_id, circuit_id);
    }

    #[tokio::test]
    async fn test_outbound_link_reused_across_circuits() {
        let server = test_server(RelayMode::Any);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let next_hop = listener.local_addr().unwrap().to_string();
        // One accept only: both extensions must ride the same connection.
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let downstream = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let relay = PeerConnection::new(
                stream,
                "downstream".to_string(),
                PeerRole::Relay,
                Duration::from_secs(5),
                Duration::from_secs(5),
                DEFAULT_MAX_FRAME_LEN,
            );
            let hello = relay.recv().await.unwrap().unwrap();
            assert_eq!(hello.msg_type, MessageType::HandshakeHello);
            let mut ids = Vec::new();
            for _ in 0..2 {
                let create = relay.recv().await.unwrap().unwrap();
                assert_eq!(create.msg_type, MessageType::CreateCircuit);
                let reply = Envelope::control(
                    MessageType::CircuitCreated,
                    create.request_id,
                    &create.circuit_id,
                    &CircuitCreatedResponse {
                        circuit_id: create.circuit_id.clone(),
                    },
                )
                .unwrap();
                relay.send(&reply).await.unwrap();
                ids.push(create.circuit_id);
            }
            // Keep the link up until the test has checked the pool.
            let _ = release_rx.await;
            ids
        });

        let client = connect(&server, "10.0.3.3:5000");
        do_handshake(&client).await;
        let first = create_circuit(&client, &server).await;
        let second = create_circuit(&client, &server).await;

        for id in [&first, &second] {
            let extend = Envelope::control(
                MessageType::ExtendCircuit,
                8,
                id,
                &ExtendCircuitRequest {
                    next_hop: next_hop.clone(),
                    key_envelope: Some(make_envelope(&server)),
                },
            )
            .unwrap();
            client.send(&extend).await.unwrap();
            let reply = client.recv().await.unwrap().unwrap();
            assert_eq!(reply.msg_type, MessageType::CircuitExtended);
        }

        assert_eq!(server.outbound.len(), 1);
        release_tx.send(()).unwrap();
        let forwarded = downstream.await.unwrap();
        assert_eq!(forwarded, vec![first, second]);
    }

    #[tokio::test]
    async fn test_extend_to_unreachable_hop_fails() {
        let mut config = test_config(RelayMode::Any);
        config.connect_timeout = Duration::from_millis(200);
        let server = test_server_with(config);
        let client = connect(&server, "10.0.3.2:5000");
        do_handshake(&client).await;
        let circuit_id = create_circuit(&client, &server).await;

        let extend = Envelope::control(
            MessageType::ExtendCircuit,
            9,
            &circuit_id,
            &ExtendCircuitRequest {
                // Reserved TEST-NET address; nothing listens there.
                next_hop: "192.0.2.1:9".to_string(),
                key_envelope: Some(make_envelope(&server)),
            },
        )
        .unwrap();
        client.send(&extend).await.unwrap();
        // The failed dial kills the circuit; the notice precedes the reply.
        let notice = client.recv().await.unwrap().unwrap();
        assert_eq!(notice.msg_type, MessageType::DestroyCircuit);
        assert_eq!(notice.circuit_id, circuit_id);
        let reason: DestroyCircuitNotice = notice.parse_payload().unwrap();
        assert_eq!(reason.reason, "next_hop_unreachable");
        let err = client.recv().await.unwrap().unwrap();
        assert_eq!(err.msg_type, MessageType::Error);
        let payload: ErrorPayload = err.parse_payload().unwrap();
        assert_eq!(payload.code, "RELAY_FAILED");
        assert!(!server.state.circuits.contains(&circuit_id));
    }

    #[tokio::test]
    async fn test_relay_data_dead_next_hop_destroys_circuit() {
        let mut config = test_config(RelayMode::Any);
        config.connect_timeout = Duration::from_millis(200);
        let server = test_server_with(config);
        let client = connect(&server, "10.0.3.4:5000");
        do_handshake(&client).await;
        let circuit_id = create_circuit(&client, &server).await;

        let key = server.state.circuits.session_key(&circuit_id).unwrap();
        let wrapped = onion::wrap_layer(&key, "192.0.2.1:9", b"onward").unwrap();
        let data = Envelope::new(MessageType::RelayData, 5, &circuit_id, wrapped);
        client.send(&data).await.unwrap();

        let notice = client.recv().await.unwrap().unwrap();
        assert_eq!(notice.msg_type, MessageType::DestroyCircuit);
        assert_eq!(notice.circuit_id, circuit_id);
        let reason: DestroyCircuitNotice = notice.parse_payload().unwrap();
        assert_eq!(reason.reason, "next_hop_unreachable");
        let err = client.recv().await.unwrap().unwrap();
        assert_eq!(err.msg_type, MessageType::Error);
        let payload: ErrorPayload = err.parse_payload().unwrap();
        assert_eq!(payload.code, "RELAY_FAILED");
        assert!(!server.state.circuits.contains(&circuit_id));
    }

    #[tokio::test]
    async fn test_exit_relay_rejects_forward_instruction() {
        let server = test_server(RelayMode::Exit);
        let client = connect(&server, "10.0.3.5:5000");
        do_handshake(&client).await;
        let circuit_id = create_circuit(&client, &server).await;

        let key = server.state.circuits.session_key(&circuit_id).unwrap();
        let wrapped = onion::wrap_layer(&key, "relay9:9000", b"onward").unwrap();
        let data = Envelope::new(MessageType::RelayData, 5, &circuit_id, wrapped);
        client.send(&data).await.unwrap();

        let err = client.recv().await.unwrap().unwrap();
        assert_eq!(err.msg_type, MessageType::Error);
        let payload: ErrorPayload = err.parse_payload().unwrap();
        assert_eq!(payload.code, "INVALID_MESSAGE");
        // A bad routing instruction is not fatal to the circuit.
        assert!(server.state.circuits.contains(&circuit_id));
    }

    #[tokio::test]
    async fn test_idle_sweep_notifies_origin() {
        let mut config = test_config(RelayMode::Any);
        config.circuit.idle_timeout = Duration::from_millis(50);
        let server = test_server_with(config);
        let client = connect(&server, "10.0.4.1:5000");
        do_handshake(&client).await;
        let circuit_id = create_circuit(&client, &server).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        server.sweep_idle_circuits().await;

        assert!(!server.state.circuits.contains(&circuit_id));
        let notice = client.recv().await.unwrap().unwrap();
        assert_eq!(notice.msg_type, MessageType::DestroyCircuit);
        assert_eq!(notice.circuit_id, circuit_id);
        let reason: DestroyCircuitNotice = notice.parse_payload().unwrap();
        assert_eq!(reason.reason, "idle_timeout");
        assert!(server.state.metrics.circuits_destroyed.get() >= 1);
    }

    #[test]
    fn test_parse_peer_addr_fallback() {
        assert_eq!(
            parse_peer_addr("not-an-address"),
            SocketAddr::from(([0, 0, 0, 0], 0))
        );
        assert_eq!(parse_peer_addr("127.0.0.1:8080").to_string(), "127.0.0.1:8080");
    }
}
