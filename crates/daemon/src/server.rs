// Tunnel Server: inbound SSH acceptance, `keyAuth`, and channel dispatch
// (spec.md §4.2, §4.3).
//
// Channel-type note (see transport.rs): `heartbeat` is opened by the site
// agent itself — conventional RFC 4254 direction, since the agent is the
// SSH client on this connection. `transport`/`access-point` channels are
// opened in the *other* direction, by us, over a connection the site
// agent initiated. The pinned SSH library's public `Handler`/`Handle`
// surface is not confirmed to expose a documented "server opens a new
// channel toward the connected client" call; `RusshConnectionHandle` below
// assumes `server::Handle` exposes a `channel_open_session`-shaped method
// mirroring the client-side API, since `Handle` already carries the
// machinery to write arbitrary protocol frames back over the connection
// it owns. This is the single riskiest assumption in this codebase — see
// DESIGN.md.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relayforge_common::{CertRole, Error, Result};
use russh::keys::PublicKey;
use russh::server::{self, Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId};
use tracing::{debug, info, warn};

use crate::cert;
use crate::registry::SiteRegistry;
use crate::site::{RemoteConnection, Site};
use crate::transport::{ChannelPurpose, ChannelStream, DialOutcome, SshConnectionHandle};
use crate::trust::TrustEvaluator;

/// Adapter from an established inbound connection's server-side `Handle`
/// to the `SshConnectionHandle` trait `Site` depends on.
pub struct RusshConnectionHandle {
    handle: Handle,
}

impl RusshConnectionHandle {
    pub fn new(handle: Handle) -> Arc<Self> {
        Arc::new(Self { handle })
    }
}

#[async_trait]
impl SshConnectionHandle for RusshConnectionHandle {
    async fn open_channel(
        &self,
        purpose: ChannelPurpose,
        dial_target: Option<&str>,
    ) -> Result<DialOutcome> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::connection_problem(format!("channel open failed: {}", e)))?;

        // Transport channels fold the dial-target request into the
        // subsystem name itself, collapsing "open channel" + "send
        // dial-target request" + "await boolean reply" into one round
        // trip: request success/failure *is* the boolean reply spec.md
        // §6 asks for.
        let subsystem = match (purpose, dial_target) {
            (ChannelPurpose::Transport, Some(target)) => format!("transport-dial:{}", target),
            _ => purpose.subsystem_name().to_string(),
        };

        match channel.request_subsystem(true, subsystem.as_str()).await {
            Ok(()) => Ok(DialOutcome::Stream(ChannelStream::new(
                channel.into_stream(),
            ))),
            Err(_) if dial_target.is_some() => Ok(DialOutcome::Unreachable),
            Err(e) => Err(Error::connection_problem(format!(
                "subsystem request failed: {}",
                e
            ))),
        }
    }

    async fn disconnect(&self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "evicted", "en")
            .await;
    }
}

/// Per-connection state tracked by the Handler (spec.md §4.2, §4.3).
pub struct SshHandler {
    peer_addr: Option<SocketAddr>,
    trust_evaluator: Arc<TrustEvaluator>,
    registry: Arc<SiteRegistry>,
    server_timeout: Duration,
    cert_role: Option<CertRole>,
    authority_domain: Option<String>,
    heartbeat: Option<(ChannelId, Arc<Site>)>,
}

impl SshHandler {
    fn remote_addr_string(&self) -> String {
        self.peer_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl server::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> std::result::Result<Auth, Self::Error> {
        let parsed = match cert::parse(key) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    "auth rejected for user {} from {}: {}",
                    user,
                    self.remote_addr_string(),
                    e
                );
                return Ok(reject());
            }
        };

        match parsed.role {
            CertRole::Host => {
                let domain = parsed
                    .authority_domain
                    .clone()
                    .expect("cert::parse guarantees a domain for host certs");

                match self
                    .trust_evaluator
                    .check_trusted_key(CertRole::Host, &domain, &parsed.signing_key)
                {
                    Ok(()) => {
                        info!(
                            "accepted host cert for domain {} from {}",
                            domain,
                            self.remote_addr_string()
                        );
                        self.cert_role = Some(CertRole::Host);
                        self.authority_domain = Some(domain);
                        Ok(Auth::Accept)
                    }
                    Err(e) => {
                        warn!(
                            "host cert rejected for claimed domain {} from {}: {}",
                            domain,
                            self.remote_addr_string(),
                            e
                        );
                        Ok(reject())
                    }
                }
            }
            CertRole::User => {
                if self.trust_evaluator.is_user_authority(&parsed.signing_key) {
                    self.cert_role = Some(CertRole::User);
                    Ok(Auth::Accept)
                } else {
                    warn!(
                        "user cert rejected from {}: signer not trusted",
                        self.remote_addr_string()
                    );
                    Ok(reject())
                }
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if name != "heartbeat" {
            session.channel_failure(channel)?;
            return Ok(());
        }

        match self.cert_role {
            Some(CertRole::Host) => {
                let domain = self
                    .authority_domain
                    .clone()
                    .expect("host cert auth always records a domain");

                let handle = RusshConnectionHandle::new(session.handle());
                let conn = RemoteConnection::new(
                    self.remote_addr_string(),
                    handle,
                    self.server_timeout,
                );

                match self.registry.upsert_tunnel_site(&domain, conn) {
                    Ok(site) => {
                        self.heartbeat = Some((channel, site));
                        session.channel_success(channel)?;
                    }
                    Err(e) => {
                        warn!("failed to upsert site for domain {}: {}", domain, e);
                        session.channel_failure(channel)?;
                    }
                }
            }
            Some(CertRole::User) => {
                // Hangout mode (legacy ad-hoc session for user certs) is
                // out of scope (spec.md §9).
                debug!("rejecting heartbeat from user-cert session (hangout mode unsupported)");
                session.channel_failure(channel)?;
            }
            None => {
                session.channel_failure(channel)?;
            }
        }

        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if let Some((hb_channel, site)) = &self.heartbeat {
            if *hb_channel == channel {
                site.touch();
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if matches!(&self.heartbeat, Some((hb_channel, _)) if *hb_channel == channel) {
            debug!(
                "heartbeat channel closed for {}",
                self.remote_addr_string()
            );
            self.heartbeat = None;
        }
        session.close(channel)?;
        Ok(())
    }
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
    }
}

/// Accepts inbound SSH, builds one `SshHandler` per connection (spec.md §2).
#[derive(Clone)]
pub struct TunnelServer {
    trust_evaluator: Arc<TrustEvaluator>,
    registry: Arc<SiteRegistry>,
    server_timeout: Duration,
}

impl TunnelServer {
    pub fn new(
        trust_evaluator: Arc<TrustEvaluator>,
        registry: Arc<SiteRegistry>,
        server_timeout: Duration,
    ) -> Self {
        Self {
            trust_evaluator,
            registry,
            server_timeout,
        }
    }

    pub async fn serve(
        mut self,
        addr: SocketAddr,
        config: Arc<server::Config>,
    ) -> anyhow::Result<()> {
        info!("Tunnel Server listening on {}", addr);
        server::Server::run_on_address(&mut self, config, addr).await?;
        Ok(())
    }
}

impl server::Server for TunnelServer {
    type Handler = SshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> SshHandler {
        SshHandler {
            peer_addr,
            trust_evaluator: Arc::clone(&self.trust_evaluator),
            registry: Arc::clone(&self.registry),
            server_timeout: self.server_timeout,
            cert_role: None,
            authority_domain: None,
            heartbeat: None,
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        warn!("session error: {}", error);
    }
}
