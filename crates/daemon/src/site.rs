// Site, Remote Connection, and the round-robin pool (spec.md §3, §4.5).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use relayforge_common::{Error, Result, SiteStatus};
use russh::client;
use tower::Service;
use tracing::{debug, info, warn};

use crate::transport::{
    ChannelPurpose, ChannelStream, ClientAuthMethod, DialOutcome, OutboundClientHandler,
    SshConnectionHandle,
};

/// One live inbound SSH connection from a remote agent (spec.md §3).
/// `invalid` is monotonic: once set, `nextConn` will evict it on the next
/// pass and it never becomes valid again.
pub struct RemoteConnection {
    pub remote_addr: String,
    handle: Arc<dyn SshConnectionHandle>,
    invalid: AtomicBool,
    deadline_refs: AtomicUsize,
    deadline: Mutex<Option<Instant>>,
    default_timeout: Duration,
}

impl RemoteConnection {
    pub fn new(
        remote_addr: String,
        handle: Arc<dyn SshConnectionHandle>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote_addr,
            handle,
            invalid: AtomicBool::new(false),
            deadline_refs: AtomicUsize::new(0),
            deadline: Mutex::new(None),
            default_timeout,
        })
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }

    pub fn mark_invalid(&self) {
        self.invalid.store(true, Ordering::SeqCst);
    }

    /// Refcounted deadline (spec.md §4.5). Held for the lifetime of one
    /// outbound operation; the shared connection deadline only clears once
    /// every overlapping holder has released it.
    fn set_deadline(self: &Arc<Self>) -> DeadlineGuard {
        self.deadline_refs.fetch_add(1, Ordering::SeqCst);
        *self.deadline.lock().unwrap() = Some(Instant::now() + self.default_timeout);
        DeadlineGuard {
            conn: Arc::clone(self),
        }
    }

    /// Time remaining before the shared deadline elapses. Used by callers
    /// performing the actual channel I/O as the timeout for that I/O.
    pub fn remaining_timeout(&self) -> Duration {
        match *self.deadline.lock().unwrap() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => self.default_timeout,
        }
    }

    async fn open_channel(
        &self,
        purpose: ChannelPurpose,
        dial_target: Option<&str>,
    ) -> Result<DialOutcome> {
        self.handle.open_channel(purpose, dial_target).await
    }

    async fn close(&self) {
        self.handle.disconnect().await;
    }
}

struct DeadlineGuard {
    conn: Arc<RemoteConnection>,
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        if self.conn.deadline_refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            *self.conn.deadline.lock().unwrap() = None;
        }
    }
}

struct SiteInner {
    connections: Vec<Arc<RemoteConnection>>,
    cursor: usize,
}

/// The per-authority-domain pool (spec.md §3). Mutex-guarded; readers and
/// writers alike take the lock, since the pool is small and operations are
/// brief (spec.md §5 permits this — only `last_active` gets a relaxed
/// read).
pub struct Site {
    pub domain: String,
    inner: Mutex<SiteInner>,
    last_active_unix: AtomicU64,
    heartbeat_period: Duration,
}

impl Site {
    pub fn new(domain: String, heartbeat_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            domain,
            inner: Mutex::new(SiteInner {
                connections: Vec::new(),
                cursor: 0,
            }),
            last_active_unix: AtomicU64::new(now_unix()),
            heartbeat_period,
        })
    }

    /// Appends a newly authenticated Remote Connection to the pool. Order
    /// of arrival is preserved (spec.md §4.4).
    pub fn attach(&self, conn: Arc<RemoteConnection>) {
        let mut inner = self.inner.lock().unwrap();
        inner.connections.push(conn);
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    /// Round-robin pick with lazy eviction (spec.md §4.5). Every call either
    /// returns a believed-live connection or exhausts the pool and reports
    /// `NotFound`; dead connections are reaped on the same pass.
    pub fn next_conn(&self) -> Result<Arc<RemoteConnection>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.connections.is_empty() {
                return Err(Error::not_found("no active connections"));
            }

            inner.cursor = (inner.cursor + 1) % inner.connections.len();
            let idx = inner.cursor;
            let conn = Arc::clone(&inner.connections[idx]);

            if !conn.is_invalid() {
                return Ok(conn);
            }

            inner.connections.remove(idx);
            inner.cursor = 0;
            debug!(
                "site {}: evicted invalid connection from {}",
                self.domain, conn.remote_addr
            );
            let closer = Arc::clone(&conn);
            tokio::spawn(async move {
                closer.close().await;
            });
        }
    }

    /// `Dial(network, addr)` (spec.md §4.5). Retries within this call only
    /// on tunnel-side failure; a remote "can't reach it" reply is terminal.
    pub async fn dial(&self, addr: &str) -> Result<ChannelStream> {
        loop {
            let conn = self.next_conn()?;
            let _deadline = conn.set_deadline();
            match conn.open_channel(ChannelPurpose::Transport, Some(addr)).await {
                Ok(DialOutcome::Stream(stream)) => return Ok(stream),
                Ok(DialOutcome::Unreachable) => {
                    return Err(Error::connection_problem(format!(
                        "remote site {} cannot reach {}",
                        self.domain, addr
                    )));
                }
                Err(e) => {
                    warn!(
                        "site {}: transport channel to {} failed on {}: {}",
                        self.domain, addr, conn.remote_addr, e
                    );
                    conn.mark_invalid();
                }
            }
        }
    }

    /// `dialAccessPoint(network, addr)` (spec.md §4.5). No dial-target
    /// request; the remote routes access-point traffic to its local
    /// control plane.
    pub async fn dial_access_point(&self) -> Result<ChannelStream> {
        loop {
            let conn = self.next_conn()?;
            let _deadline = conn.set_deadline();
            match conn.open_channel(ChannelPurpose::AccessPoint, None).await {
                Ok(DialOutcome::Stream(stream)) => return Ok(stream),
                Ok(DialOutcome::Unreachable) => {
                    return Err(Error::connection_problem(format!(
                        "remote site {} rejected access-point channel",
                        self.domain
                    )));
                }
                Err(e) => {
                    warn!(
                        "site {}: access-point channel failed on {}: {}",
                        self.domain, conn.remote_addr, e
                    );
                    conn.mark_invalid();
                }
            }
        }
    }

    /// Heartbeat drain hook (spec.md §4.5): called once per heartbeat
    /// request received on the connection's heartbeat channel.
    pub fn touch(&self) {
        self.last_active_unix.store(now_unix(), Ordering::Relaxed);
    }

    /// `GetStatus` (spec.md §4.5): online iff the last heartbeat was within
    /// two heartbeat periods.
    pub fn status(&self) -> SiteStatus {
        let last = self.last_active_unix.load(Ordering::Relaxed);
        let elapsed = now_unix().saturating_sub(last);
        if elapsed <= 2 * self.heartbeat_period.as_secs() {
            SiteStatus::Online
        } else {
            SiteStatus::Offline
        }
    }

    /// `ConnectToServer(network, addr, user, authMethods)` (spec.md §4.5,
    /// §2): opens a `transport` channel exactly like `dial`, then runs an
    /// outbound SSH client handshake over it, trying each auth method in
    /// order until one succeeds. Returns the authenticated client handle;
    /// callers open further channels (port forwards, command execution)
    /// on it the same way they would over a direct TCP-dialed SSH session.
    pub async fn connect_to_server(
        &self,
        addr: &str,
        user: &str,
        auth_methods: &[ClientAuthMethod],
    ) -> Result<client::Handle<OutboundClientHandler>> {
        let stream = self.dial(addr).await?;
        let config = Arc::new(client::Config::default());

        let mut session = client::connect_stream(config, stream, OutboundClientHandler)
            .await
            .map_err(|e| Error::connection_problem(format!("ssh handshake to {} failed: {}", addr, e)))?;

        let mut last_failure: Option<String> = None;
        for method in auth_methods {
            let outcome = match method {
                ClientAuthMethod::PublicKey(key) => {
                    let hash_alg = session
                        .best_supported_rsa_hash()
                        .await
                        .map_err(|e| Error::connection_problem(e.to_string()))?
                        .flatten();
                    let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(Arc::clone(key), hash_alg);
                    session
                        .authenticate_publickey(user, key_with_alg)
                        .await
                        .map_err(|e| Error::connection_problem(e.to_string()))?
                }
                ClientAuthMethod::Password(password) => session
                    .authenticate_password(user, password)
                    .await
                    .map_err(|e| Error::connection_problem(e.to_string()))?,
            };

            match outcome {
                client::AuthResult::Success => return Ok(session),
                client::AuthResult::Failure { partial_success, .. } if partial_success => continue,
                client::AuthResult::Failure { .. } => {
                    last_failure = Some(format!("{} authenticated to {} rejected", addr, user));
                }
            }
        }

        Err(Error::access_denied(last_failure.unwrap_or_else(|| {
            format!("no auth method succeeded against {}", addr)
        })))
    }

    /// The site-scoped control-plane client (spec.md §2, §3): an HTTP
    /// client whose transport dials through this site's tunnel pool
    /// instead of the OS network stack, one `access-point` channel per
    /// request. Callers issue requests the same way they would against
    /// any other `hyper_util` legacy client.
    pub fn control_plane_client(
        self: &Arc<Self>,
    ) -> Client<AccessPointConnector, http_body_util::Full<bytes::Bytes>> {
        Client::builder(TokioExecutor::new()).build(AccessPointConnector {
            site: Arc::clone(self),
        })
    }
}

/// `tower::Service<Uri>` that dials a fresh `access-point` channel per
/// connection attempt, for use as a `hyper_util` legacy client connector
/// (spec.md §4.5 `dialAccessPoint`, wired into the site's own HTTP client).
#[derive(Clone)]
pub struct AccessPointConnector {
    site: Arc<Site>,
}

impl Service<hyper::Uri> for AccessPointConnector {
    type Response = TokioIo<ChannelStream>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: hyper::Uri) -> Self::Future {
        let site = Arc::clone(&self.site);
        Box::pin(async move { site.dial_access_point().await.map(TokioIo::new) })
    }
}

/// A Site variant with no tunnel pool; dials go straight through the OS
/// network stack (spec.md §3 "Direct Site").
pub struct DirectSite {
    pub domain: String,
}

impl DirectSite {
    pub fn new(domain: String) -> Arc<Self> {
        Arc::new(Self { domain })
    }

    pub async fn dial(&self, addr: &str) -> Result<tokio::net::TcpStream> {
        tokio::net::TcpStream::connect(addr)
            .await
            .map_err(Error::Io)
    }

    /// A direct site is reachable iff the OS network stack is; treated as
    /// always online since there is no tunnel liveness signal to track.
    pub fn status(&self) -> SiteStatus {
        SiteStatus::Online
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct MockHandle {
        fail_times: StdAtomicUsize,
        unreachable: bool,
    }

    impl MockHandle {
        fn always_succeeds() -> Arc<Self> {
            Arc::new(Self {
                fail_times: StdAtomicUsize::new(0),
                unreachable: false,
            })
        }

        fn always_fails() -> Arc<Self> {
            Arc::new(Self {
                fail_times: StdAtomicUsize::new(usize::MAX),
                unreachable: false,
            })
        }

        fn always_unreachable() -> Arc<Self> {
            Arc::new(Self {
                fail_times: StdAtomicUsize::new(0),
                unreachable: true,
            })
        }
    }

    #[async_trait::async_trait]
    impl SshConnectionHandle for MockHandle {
        async fn open_channel(
            &self,
            _purpose: ChannelPurpose,
            _dial_target: Option<&str>,
        ) -> Result<DialOutcome> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                return Err(Error::connection_problem("mock transport failure"));
            }
            if self.unreachable {
                return Ok(DialOutcome::Unreachable);
            }
            let (client, _server) = tokio::io::duplex(64);
            Ok(DialOutcome::Stream(ChannelStream::new(client)))
        }

        async fn disconnect(&self) {}
    }

    fn mock_conn(handle: Arc<MockHandle>) -> Arc<RemoteConnection> {
        RemoteConnection::new("127.0.0.1:0".to_string(), handle, Duration::from_secs(5))
    }

    #[test]
    fn next_conn_returns_live_entry_and_keeps_cursor_in_range() {
        let site = Site::new("east.example.com".to_string(), Duration::from_secs(30));
        for _ in 0..3 {
            site.attach(mock_conn(MockHandle::always_succeeds()));
        }

        for _ in 0..10 {
            let conn = site.next_conn().expect("pool has live entries");
            assert!(!conn.is_invalid());
        }
        assert_eq!(site.connection_count(), 3);
    }

    #[test]
    fn next_conn_evicts_all_invalid_then_not_found() {
        let site = Site::new("east.example.com".to_string(), Duration::from_secs(30));
        let conns: Vec<_> = (0..3)
            .map(|_| mock_conn(MockHandle::always_succeeds()))
            .collect();
        for c in &conns {
            site.attach(Arc::clone(c));
        }
        for c in &conns {
            c.mark_invalid();
        }

        for _ in 0..3 {
            assert!(site.next_conn().is_err());
        }
        assert_eq!(site.connection_count(), 0);
        assert!(matches!(site.next_conn(), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn dial_retries_on_transport_failure_then_succeeds() {
        let site = Site::new("east.example.com".to_string(), Duration::from_secs(30));
        site.attach(mock_conn(MockHandle::always_fails()));
        site.attach(mock_conn(MockHandle::always_succeeds()));

        let result = site.dial("10.0.0.5:22").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn dial_unreachable_reply_is_terminal_not_retried() {
        let site = Site::new("east.example.com".to_string(), Duration::from_secs(30));
        site.attach(mock_conn(MockHandle::always_unreachable()));

        let result = site.dial("10.0.0.5:22").await;
        assert!(matches!(result, Err(Error::ConnectionProblem(_))));
        // The connection must not have been marked invalid by an unreachable reply.
        assert_eq!(site.connection_count(), 1);
    }

    #[test]
    fn status_reflects_heartbeat_recency() {
        let site = Site::new("east.example.com".to_string(), Duration::from_secs(30));
        site.touch();
        assert_eq!(site.status(), SiteStatus::Online);

        site.last_active_unix.store(0, Ordering::Relaxed);
        assert_eq!(site.status(), SiteStatus::Offline);
    }

    #[test]
    fn direct_site_is_always_online() {
        let direct = DirectSite::new("legacy.example.com".to_string());
        assert_eq!(direct.status(), SiteStatus::Online);
    }
}
