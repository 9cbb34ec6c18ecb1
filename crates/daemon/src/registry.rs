// Site Registry: process-wide map from authority domain to Site (spec.md §3, §4.4).

use std::sync::{Arc, RwLock};
use std::time::Duration;

use relayforge_common::{is_valid_domain, Error, Result};
use tracing::info;

use crate::site::{DirectSite, RemoteConnection, Site};

/// Either a tunnel-backed Site or a Direct Site, as returned by registry
/// lookups. Callers match on this to invoke the right dial path — a tunnel
/// Site dials through its pool, a Direct Site dials the OS network stack
/// directly (spec.md §3, §8 seed 6).
#[derive(Clone)]
pub enum SiteEntry {
    Tunnel(Arc<Site>),
    Direct(Arc<DirectSite>),
}

impl SiteEntry {
    pub fn domain(&self) -> &str {
        match self {
            SiteEntry::Tunnel(s) => &s.domain,
            SiteEntry::Direct(s) => &s.domain,
        }
    }

    pub fn status(&self) -> relayforge_common::SiteStatus {
        match self {
            SiteEntry::Tunnel(s) => s.status(),
            SiteEntry::Direct(s) => s.status(),
        }
    }

    pub fn connection_count(&self) -> usize {
        match self {
            SiteEntry::Tunnel(s) => s.connection_count(),
            SiteEntry::Direct(_) => 0,
        }
    }
}

struct RegistryInner {
    tunnel_sites: Vec<Arc<Site>>,
    direct_sites: Vec<Arc<DirectSite>>,
}

/// Process-wide state owned by the Tunnel Server (spec.md §3). Readers
/// (`get_sites`, `get_site`, `find_similar_site`) proceed in parallel;
/// `upsert_tunnel_site` is exclusive (spec.md §5).
pub struct SiteRegistry {
    inner: RwLock<RegistryInner>,
    heartbeat_period: Duration,
}

impl SiteRegistry {
    pub fn new(heartbeat_period: Duration) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                tunnel_sites: Vec::new(),
                direct_sites: Vec::new(),
            }),
            heartbeat_period,
        }
    }

    /// Registers a Direct Site at startup (spec.md §8 seed 6). Direct sites
    /// are static configuration, not subject to the tunnel upsert path.
    pub fn register_direct_site(&self, domain: String) {
        let mut inner = self.inner.write().unwrap();
        inner.direct_sites.push(DirectSite::new(domain));
    }

    /// Site Upsert (spec.md §4.4): find-or-create the Site for `domain`
    /// and attach the new Remote Connection to it. The write lock makes
    /// the (find, append) pair atomic — two simultaneous connections from
    /// the same domain serialize onto the same Site.
    pub fn upsert_tunnel_site(&self, domain: &str, conn: Arc<RemoteConnection>) -> Result<Arc<Site>> {
        if !is_valid_domain(domain) {
            return Err(Error::bad_parameter(format!(
                "invalid authority domain: {:?}",
                domain
            )));
        }

        let mut inner = self.inner.write().unwrap();
        if let Some(site) = inner.tunnel_sites.iter().find(|s| s.domain == domain) {
            site.attach(conn);
            return Ok(Arc::clone(site));
        }

        let site = Site::new(domain.to_string(), self.heartbeat_period);
        info!("registry: created new site for domain {}", domain);
        site.attach(conn);
        inner.tunnel_sites.push(Arc::clone(&site));
        Ok(site)
    }

    /// `GetSites()` (spec.md §4.6): tunnel sites then direct sites, in
    /// that order, under the read lock.
    pub fn get_sites(&self) -> Vec<SiteEntry> {
        let inner = self.inner.read().unwrap();
        inner
            .tunnel_sites
            .iter()
            .cloned()
            .map(SiteEntry::Tunnel)
            .chain(inner.direct_sites.iter().cloned().map(SiteEntry::Direct))
            .collect()
    }

    /// `GetSite(domain)` (spec.md §4.6): first exact match across tunnel
    /// sites then direct sites.
    pub fn get_site(&self, domain: &str) -> Result<SiteEntry> {
        let inner = self.inner.read().unwrap();
        inner
            .tunnel_sites
            .iter()
            .find(|s| s.domain == domain)
            .cloned()
            .map(SiteEntry::Tunnel)
            .or_else(|| {
                inner
                    .direct_sites
                    .iter()
                    .find(|s| s.domain == domain)
                    .cloned()
                    .map(SiteEntry::Direct)
            })
            .ok_or_else(|| Error::not_found(format!("no site for domain {}", domain)))
    }

    pub fn domains(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner
            .tunnel_sites
            .iter()
            .map(|s| s.domain.clone())
            .chain(inner.direct_sites.iter().map(|s| s.domain.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelPurpose, ChannelStream, DialOutcome, SshConnectionHandle};
    use async_trait::async_trait;

    struct NoopHandle;

    #[async_trait]
    impl SshConnectionHandle for NoopHandle {
        async fn open_channel(
            &self,
            _purpose: ChannelPurpose,
            _dial_target: Option<&str>,
        ) -> Result<DialOutcome> {
            let (client, _server) = tokio::io::duplex(64);
            Ok(DialOutcome::Stream(ChannelStream::new(client)))
        }
        async fn disconnect(&self) {}
    }

    fn conn() -> Arc<RemoteConnection> {
        RemoteConnection::new(
            "10.1.1.1:2222".to_string(),
            Arc::new(NoopHandle),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn double_registering_same_domain_pools_two_connections() {
        let registry = SiteRegistry::new(Duration::from_secs(30));
        registry.upsert_tunnel_site("east.example.com", conn()).unwrap();
        registry.upsert_tunnel_site("east.example.com", conn()).unwrap();

        let SiteEntry::Tunnel(site) = registry.get_site("east.example.com").unwrap() else {
            panic!("expected tunnel site");
        };
        assert_eq!(site.connection_count(), 2);

        registry.upsert_tunnel_site("east.example.com", conn()).unwrap();
        let SiteEntry::Tunnel(site) = registry.get_site("east.example.com").unwrap() else {
            panic!("expected tunnel site");
        };
        assert_eq!(site.connection_count(), 3);
    }

    #[test]
    fn empty_domain_is_bad_parameter() {
        let registry = SiteRegistry::new(Duration::from_secs(30));
        let err = registry.upsert_tunnel_site("", conn()).unwrap_err();
        assert!(matches!(err, Error::BadParameter(_)));
    }

    #[test]
    fn disjoint_sites_do_not_mutate_each_other() {
        let registry = SiteRegistry::new(Duration::from_secs(30));
        registry.upsert_tunnel_site("a.example.com", conn()).unwrap();
        registry.upsert_tunnel_site("b.example.com", conn()).unwrap();

        let SiteEntry::Tunnel(a) = registry.get_site("a.example.com").unwrap() else {
            panic!()
        };
        let SiteEntry::Tunnel(b) = registry.get_site("b.example.com").unwrap() else {
            panic!()
        };
        assert_eq!(a.connection_count(), 1);
        assert_eq!(b.connection_count(), 1);

        registry.upsert_tunnel_site("a.example.com", conn()).unwrap();
        assert_eq!(a.connection_count(), 2);
        assert_eq!(b.connection_count(), 1);
    }

    #[test]
    fn direct_site_passthrough() {
        let registry = SiteRegistry::new(Duration::from_secs(30));
        registry.register_direct_site("legacy.example.com".to_string());

        match registry.get_site("legacy.example.com").unwrap() {
            SiteEntry::Direct(site) => assert_eq!(site.domain, "legacy.example.com"),
            SiteEntry::Tunnel(_) => panic!("expected direct site"),
        }
    }

    #[test]
    fn get_sites_concatenates_tunnel_then_direct() {
        let registry = SiteRegistry::new(Duration::from_secs(30));
        registry.upsert_tunnel_site("east.example.com", conn()).unwrap();
        registry.register_direct_site("legacy.example.com".to_string());

        let sites = registry.get_sites();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].domain(), "east.example.com");
        assert_eq!(sites[1].domain(), "legacy.example.com");
    }
}
