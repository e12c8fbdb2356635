//! Relay node for an anonymizing multi-hop transport
//!
//! Layout:
//! - `protocol`: framed wire envelope and control payloads
//! - `onion`: layered encryption and session key derivation
//! - `circuit`: circuit table and lifecycle
//! - `room`: word-code rendezvous for direct transfers
//! - `bridge`: peer-to-peer frame pumping for paired sessions
//! - `ratelimit`: per-origin token buckets and bans
//! - `server`: accept loop and message dispatch
//! - `directory`: registration and heartbeats with a directory service
//! - `admin`: health, stats and Prometheus endpoints

mod admin;
mod bridge;
mod circuit;
mod config;
mod directory;
mod error;
mod logger;
mod onion;
mod peer;
mod protocol;
mod ratelimit;
mod room;
mod server;
mod tls;

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use anyhow::Result;

use crate::admin::{AdminState, Metrics};
use crate::circuit::CircuitManager;
use crate::logger::{log, LogLevel};
use crate::onion::{EphemeralKeyExchanger, KeyExchanger};
use crate::ratelimit::RateLimiter;
use crate::room::RoomManager;
use crate::server::RelayServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Install ring as the default crypto provider for rustls
    // This must be done before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = config::CliArgs::parse_args();
    cli.validate()?;
    logger::init_logger(LogLevel::from_str(&cli.log_mode));

    let config = config::RelayConfig::build(&cli)?;

    log::info!(
        relay_id = %config.relay_id,
        listen = %config.listen_addr,
        admin = %config.admin_addr,
        mode = config.mode.as_str(),
        "Starting relay"
    );

    let key_exchanger: Arc<dyn KeyExchanger> = Arc::new(EphemeralKeyExchanger::generate());
    log::info!(fingerprint = %key_exchanger.fingerprint(), "Relay keypair generated");

    let circuits = Arc::new(CircuitManager::new(
        config.circuit.clone(),
        Arc::clone(&key_exchanger),
    ));
    let rooms = Arc::new(RoomManager::new(config.room.clone()));
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));

    rooms.start();
    limiter.start();

    let state = Arc::new(AdminState::new(
        config.relay_id.clone(),
        config.mode,
        Metrics::new()?,
        Arc::clone(&circuits),
        Arc::clone(&rooms),
        Arc::clone(&limiter),
        Arc::clone(&key_exchanger),
    ));

    let admin_addr = config.admin_addr.clone();
    let announcement = config.directory_url.clone().map(|url| {
        let endpoint = config
            .public_endpoint
            .clone()
            .unwrap_or_else(|| config.listen_addr.clone());
        (
            url,
            directory::RelayAnnouncement {
                id: config.relay_id.clone(),
                public_key: hex::encode(key_exchanger.public_key()),
                endpoint,
                mode: config.mode.as_str().to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                max_bandwidth: config.max_bandwidth,
                fingerprint: key_exchanger.fingerprint(),
            },
        )
    });
    let relay = Arc::new(RelayServer::new(config, Arc::clone(&state)));
    let shutdown = relay.shutdown_token();

    let admin_task = {
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(state, &admin_addr, shutdown).await {
                log::error!(error = %e, "Admin server failed");
            }
        })
    };

    // Setup shutdown handler
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT");
                let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM");

                tokio::select! {
                    _ = sigint.recv() => {
                        log::info!("SIGINT received, shutting down...");
                    }
                    _ = sigterm.recv() => {
                        log::info!("SIGTERM received, shutting down...");
                    }
                }
            }

            #[cfg(not(unix))]
            {
                tokio::signal::ctrl_c().await.ok();
                log::info!("Shutdown signal received...");
            }

            shutdown.cancel();
        });
    }

    // Announce ourselves to the directory service, if one is configured.
    let directory_task = announcement.map(|(url, info)| {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            directory::run(&url, info, shutdown).await;
        })
    });

    let result = Arc::clone(&relay).run().await;

    if let Some(task) = directory_task {
        let _ = task.await;
    }
    // Bounded drain: the accept loop already closed its connections.
    rooms.stop().await;
    limiter.stop().await;
    admin_task.abort();

    log::info!("Relay stopped");
    result
}
