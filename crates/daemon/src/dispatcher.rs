// Dispatcher: the public API over the Site Registry (spec.md §4.6).

use std::sync::Arc;

use relayforge_common::{best_match, Error, Result};

use crate::registry::{SiteEntry, SiteRegistry};

/// `GetSites`, `GetSite`, `FindSimilarSite` (spec.md §2, §4.6). Holds no
/// state of its own beyond the registry handle — passed explicitly rather
/// than reached for as an ambient singleton (spec.md §9).
pub struct Dispatcher {
    registry: Arc<SiteRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SiteRegistry>) -> Self {
        Self { registry }
    }

    pub fn get_sites(&self) -> Vec<SiteEntry> {
        self.registry.get_sites()
    }

    pub fn get_site(&self, domain: &str) -> Result<SiteEntry> {
        self.registry.get_site(domain)
    }

    /// Domain-suffix fuzzy match (spec.md §4.6). Per the spec's own
    /// redesign recommendation (§9), a zero-similarity candidate is never
    /// returned — this fixes the original's tie-handling quirk where a
    /// zero-similarity first entry would otherwise win.
    pub fn find_similar_site(&self, query: &str) -> Result<SiteEntry> {
        let domains = self.registry.domains();
        let domain_refs: Vec<&str> = domains.iter().map(String::as_str).collect();

        match best_match(query, domain_refs) {
            Some((idx, _similarity)) => {
                let domain = &domains[idx];
                self.registry.get_site(domain)
            }
            None => Err(Error::not_found(format!(
                "no site similar to {}",
                query
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::RemoteConnection;
    use crate::transport::{ChannelPurpose, ChannelStream, DialOutcome, SshConnectionHandle};
    use async_trait::async_trait;
    use std::time::Duration;

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

    fn dispatcher_with(domains: &[&str]) -> Dispatcher {
        let registry = Arc::new(SiteRegistry::new(Duration::from_secs(30)));
        for d in domains {
            registry.upsert_tunnel_site(d, conn()).unwrap();
        }
        Dispatcher::new(registry)
    }

    #[test]
    fn similarity_tie_break_prefers_first_registered() {
        let dispatcher = dispatcher_with(&["x.b.c", "y.c", "z.d"]);
        let site = dispatcher.find_similar_site("a.b.c").unwrap();
        assert_eq!(site.domain(), "x.b.c");
    }

    #[test]
    fn similarity_resolution_seed_five() {
        let dispatcher = dispatcher_with(&["app.prod.example.com", "db.prod.example.com"]);
        let site = dispatcher
            .find_similar_site("cache.prod.example.com")
            .unwrap();
        assert_eq!(site.domain(), "app.prod.example.com");
    }

    #[test]
    fn zero_similarity_is_not_found() {
        let dispatcher = dispatcher_with(&["totally.unrelated"]);
        let err = dispatcher.find_similar_site("east.example.com").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn get_site_exact_match_or_not_found() {
        let dispatcher = dispatcher_with(&["east.example.com"]);
        assert!(dispatcher.get_site("east.example.com").is_ok());
        assert!(matches!(
            dispatcher.get_site("west.example.com"),
            Err(Error::NotFound(_))
        ));
    }
}
