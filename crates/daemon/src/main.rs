// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// RelayForge Daemon
// Reverse-tunnel server: accepts inbound SSH from remote sites, authenticates
// them via certificate-authority trust, and dispatches outbound dials over
// the resulting tunnels.

mod api;
mod auth;
mod cert;
mod config;
mod dispatcher;
mod permissions;
mod pidfile;
mod registry;
mod server;
mod site;
mod transport;
mod trust;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use hyper_util::rt::TokioIo;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey};
use tokio::net::TcpListener;
use tower::Service;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{create_router, AppState};
use config::DaemonConfig;
use dispatcher::Dispatcher;
use registry::SiteRegistry;
use server::TunnelServer;
use trust::{FileTrustStore, TrustEvaluator, TrustStore};

#[tokio::main]
async fn main() -> Result<()> {
    permissions::set_restrictive_umask();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relayforge_daemon=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("RelayForge Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let _pid_guard = pidfile::PidFileGuard::create()
        .context("Failed to create PID file - another daemon may already be running")?;

    let daemon_config = DaemonConfig::load()?;
    info!("SSH listener: {}", daemon_config.ssh_listen_address);
    info!("Admin API: {} (auth required: {})", daemon_config.admin_bind_address, daemon_config.admin_require_auth);

    let (admin_token, token_was_generated) = if daemon_config.admin_require_auth {
        let (token, was_new) = auth::load_or_generate_token(
            &daemon_config.admin_token_path,
            daemon_config.group_access,
        )?;
        (Some(token), was_new)
    } else {
        info!("Admin authentication disabled - API endpoints are publicly accessible");
        (None, false)
    };
    if token_was_generated {
        info!("Generated new admin API token at {}", daemon_config.admin_token_path.display());
    }

    permissions::ensure_directory_with_permissions(
        &daemon_config.trust_store_path,
        daemon_config.group_access,
    )
    .context("Failed to prepare trust store directory")?;

    let file_trust_store = FileTrustStore::new(&daemon_config.trust_store_path);
    file_trust_store
        .reload()
        .context("Failed to load trust store")?;
    let trust_store: Arc<dyn TrustStore> = Arc::new(file_trust_store);
    let trust_evaluator = Arc::new(TrustEvaluator::new(trust_store));

    let registry = Arc::new(SiteRegistry::new(Duration::from_secs(
        daemon_config.heartbeat_period_secs,
    )));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));

    let host_key = load_or_generate_host_key(&daemon_config.host_key_path, daemon_config.group_access)?;
    let ssh_config = Arc::new(russh::server::Config {
        keys: vec![host_key],
        ..Default::default()
    });

    let tunnel_server = TunnelServer::new(
        Arc::clone(&trust_evaluator),
        Arc::clone(&registry),
        Duration::from_secs(daemon_config.server_timeout_secs),
    );

    let ssh_addr = daemon_config
        .ssh_listen_address
        .parse()
        .context("Invalid ssh_listen_address")?;
    let ssh_task = tokio::spawn(async move {
        if let Err(e) = tunnel_server.serve(ssh_addr, ssh_config).await {
            error!("Tunnel Server exited with error: {}", e);
        }
    });

    let state = Arc::new(AppState {
        dispatcher,
        started_at: SystemTime::now(),
    });

    let app = if let Some(token) = admin_token {
        let auth_state = auth::AuthState::new(token);
        create_router(state).layer(axum::middleware::from_fn_with_state(
            auth_state,
            auth::auth_middleware,
        ))
    } else {
        create_router(state)
    };

    let admin_task = tokio::spawn(serve_admin_http(app, daemon_config.admin_bind_address.clone()));

    tokio::select! {
        _ = ssh_task => {
            info!("Tunnel Server task ended");
        }
        _ = admin_task => {
            info!("Admin API task ended");
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received");
        }
    }

    info!("Daemon shut down");
    Ok(())
}

/// Loads the server's SSH host key, generating and persisting a new Ed25519
/// key on first run (mirrors the teacher's TLS-certificate bootstrap: create
/// once, reuse thereafter).
fn load_or_generate_host_key(path: &Path, group_access: bool) -> Result<PrivateKey> {
    if path.exists() {
        let key = PrivateKey::read_openssh_file(path)
            .context("Failed to read SSH host key")?;
        debug!("Loaded host key from {}", path.display());
        return Ok(key);
    }

    if let Some(parent) = path.parent() {
        permissions::ensure_directory_with_permissions(parent, group_access)
            .context("Failed to create host key directory")?;
    }

    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .context("Failed to generate host key")?;
    key.write_openssh_file(path, russh::keys::ssh_key::LineEnding::LF)
        .context("Failed to write host key")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .context("Failed to set host key permissions")?;
    }

    info!("Generated new SSH host key at {}", path.display());
    Ok(key)
}

/// Serve the admin HTTP surface on plain TCP (loopback-only unless auth is
/// required — enforced by `DaemonConfig::validate`).
async fn serve_admin_http(app: axum::Router, bind_address: String) -> Result<()> {
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind admin API to {}", bind_address))?;

    info!("Admin API listening on {}", bind_address);

    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to accept admin API connection: {}", e);
                continue;
            }
        };

        let app = app.clone();
        tokio::spawn(async move {
            let stream = TokioIo::new(stream);
            let hyper_service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                let mut app = app.clone();
                async move { app.call(request).await }
            });

            if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection_with_upgrades(stream, hyper_service)
                .await
            {
                debug!("admin API connection error: {}", err);
            }
        });
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        };
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }
}
