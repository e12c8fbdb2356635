//! Admin HTTP surface: health, readiness, info, stats, public key and
//! Prometheus metrics. Plain http1, no framework.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::circuit::CircuitManager;
use crate::config::RelayMode;
use crate::onion::KeyExchanger;
use crate::ratelimit::RateLimiter;
use crate::room::RoomManager;

const NAMESPACE: &str = "veil_relay";

/// All Prometheus instruments, registered on a private registry so the
/// default global one stays untouched.
pub struct Metrics {
    registry: Registry,

    pub connections_total: IntCounter,
    pub active_connections: IntGauge,

    pub circuits_created: IntCounter,
    pub circuits_destroyed: IntCounter,
    pub active_circuits: IntGauge,

    pub rooms_created: IntCounter,
    pub rooms_expired: IntCounter,
    pub active_rooms: IntGauge,

    pub bytes_relayed: IntCounter,
    pub messages_relayed: IntCounter,
    pub transfers_completed: IntCounter,
    pub transfer_duration: Histogram,

    pub errors_total: IntCounterVec,
    pub rate_limit_hits: IntCounter,
    pub banned_origins: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let connections_total = IntCounter::with_opts(
            Opts::new("connections_total", "Total inbound connections").namespace(NAMESPACE),
        )?;
        let active_connections = IntGauge::with_opts(
            Opts::new("active_connections", "Currently open connections").namespace(NAMESPACE),
        )?;
        let circuits_created = IntCounter::with_opts(
            Opts::new("circuits_created_total", "Total circuits created").namespace(NAMESPACE),
        )?;
        let circuits_destroyed = IntCounter::with_opts(
            Opts::new("circuits_destroyed_total", "Total circuits destroyed").namespace(NAMESPACE),
        )?;
        let active_circuits = IntGauge::with_opts(
            Opts::new("active_circuits", "Currently registered circuits").namespace(NAMESPACE),
        )?;
        let rooms_created = IntCounter::with_opts(
            Opts::new("rooms_created_total", "Total rooms created").namespace(NAMESPACE),
        )?;
        let rooms_expired = IntCounter::with_opts(
            Opts::new("rooms_expired_total", "Total rooms expired").namespace(NAMESPACE),
        )?;
        let active_rooms = IntGauge::with_opts(
            Opts::new("active_rooms", "Currently active rooms").namespace(NAMESPACE),
        )?;
        let bytes_relayed = IntCounter::with_opts(
            Opts::new("bytes_relayed_total", "Total bytes relayed").namespace(NAMESPACE),
        )?;
        let messages_relayed = IntCounter::with_opts(
            Opts::new("messages_relayed_total", "Total messages relayed").namespace(NAMESPACE),
        )?;
        let transfers_completed = IntCounter::with_opts(
            Opts::new("transfers_completed_total", "Total bridge sessions completed")
                .namespace(NAMESPACE),
        )?;
        let transfer_duration = Histogram::with_opts(
            HistogramOpts::new("transfer_duration_seconds", "Bridge session duration")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]),
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Total errors by code").namespace(NAMESPACE),
            &["code"],
        )?;
        let rate_limit_hits = IntCounter::with_opts(
            Opts::new("rate_limit_hits_total", "Total rate limit denials").namespace(NAMESPACE),
        )?;
        let banned_origins = IntGauge::with_opts(
            Opts::new("banned_origins", "Currently banned origins").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(circuits_created.clone()))?;
        registry.register(Box::new(circuits_destroyed.clone()))?;
        registry.register(Box::new(active_circuits.clone()))?;
        registry.register(Box::new(rooms_created.clone()))?;
        registry.register(Box::new(rooms_expired.clone()))?;
        registry.register(Box::new(active_rooms.clone()))?;
        registry.register(Box::new(bytes_relayed.clone()))?;
        registry.register(Box::new(messages_relayed.clone()))?;
        registry.register(Box::new(transfers_completed.clone()))?;
        registry.register(Box::new(transfer_duration.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(rate_limit_hits.clone()))?;
        registry.register(Box::new(banned_origins.clone()))?;

        Ok(Metrics {
            registry,
            connections_total,
            active_connections,
            circuits_created,
            circuits_destroyed,
            active_circuits,
            rooms_created,
            rooms_expired,
            active_rooms,
            bytes_relayed,
            messages_relayed,
            transfers_completed,
            transfer_duration,
            errors_total,
            rate_limit_hits,
            banned_origins,
        })
    }

    pub fn record_error(&self, code: &str) {
        self.errors_total.with_label_values(&[code]).inc();
    }

    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

/// Shared state behind every admin endpoint.
pub struct AdminState {
    pub relay_id: String,
    pub mode: RelayMode,
    pub metrics: Metrics,
    pub circuits: Arc<CircuitManager>,
    pub rooms: Arc<RoomManager>,
    pub limiter: Arc<RateLimiter>,
    pub key_exchanger: Arc<dyn KeyExchanger>,
    started: tokio::time::Instant,
    ready: AtomicBool,
}

impl AdminState {
    pub fn new(
        relay_id: String,
        mode: RelayMode,
        metrics: Metrics,
        circuits: Arc<CircuitManager>,
        rooms: Arc<RoomManager>,
        limiter: Arc<RateLimiter>,
        key_exchanger: Arc<dyn KeyExchanger>,
    ) -> Self {
        AdminState {
            relay_id,
            mode,
            metrics,
            circuits,
            rooms,
            limiter,
            key_exchanger,
            started: tokio::time::Instant::now(),
            ready: AtomicBool::new(false),
        }
    }

    /// Flip once the relay listener is accepting.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_default()
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; version=0.0.4")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_default()
}

/// Route a single request. Pure with respect to the transport so tests can
/// call it directly.
pub fn respond(state: &AdminState, method: &Method, path: &str) -> Response<Full<Bytes>> {
    if method != Method::GET {
        return json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            r#"{"error":"method not allowed"}"#.to_string(),
        );
    }
    match path {
        "/health" => json_response(StatusCode::OK, r#"{"status":"ok"}"#.to_string()),
        "/ready" => {
            if state.is_ready() {
                json_response(StatusCode::OK, r#"{"ready":true}"#.to_string())
            } else {
                json_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    r#"{"ready":false}"#.to_string(),
                )
            }
        }
        "/api/v1/info" => {
            let info = serde_json::json!({
                "relay_id": state.relay_id,
                "mode": state.mode.as_str(),
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_secs": state.started.elapsed().as_secs(),
                "fingerprint": state.key_exchanger.fingerprint(),
            });
            json_response(StatusCode::OK, info.to_string())
        }
        "/api/v1/stats" => {
            let stats = serde_json::json!({
                "circuits": state.circuits.stats(),
                "rooms": state.rooms.stats(),
                "rate_limit": state.limiter.stats(),
            });
            json_response(StatusCode::OK, stats.to_string())
        }
        "/api/v1/rooms" => {
            let rooms = serde_json::json!({ "rooms": state.rooms.list_rooms() });
            json_response(StatusCode::OK, rooms.to_string())
        }
        "/api/v1/publickey" => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/octet-stream")
            .body(Full::new(Bytes::copy_from_slice(
                state.key_exchanger.public_key(),
            )))
            .unwrap_or_default(),
        "/metrics" => {
            // The ban table changes outside any request path; resample it
            // at scrape time.
            state
                .metrics
                .banned_origins
                .set(state.limiter.stats().banned_origins as i64);
            match state.metrics.encode() {
                Ok(body) => text_response(StatusCode::OK, body),
                Err(e) => text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("metrics encode failed: {}", e),
                ),
            }
        }
        _ => json_response(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#.to_string()),
    }
}

/// Serve the admin surface until `shutdown` fires.
pub async fn serve(
    state: Arc<AdminState>,
    addr: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr, "admin server listening");
    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let state = Arc::clone(&state);
                async move {
                    Ok::<_, std::convert::Infallible>(respond(
                        &state,
                        req.method(),
                        req.uri().path(),
                    ))
                }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(error = %e, "admin connection error");
            }
        });
    }
    Ok(())
}
