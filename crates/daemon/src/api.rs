// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// RelayForge - Admin HTTP API
// Read-only operator surface over the Dispatcher (SPEC_FULL.md §10.5). Not
// the reverse proxy — that transport hook is out of scope (spec.md §1).

use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tracing::info;

use crate::dispatcher::Dispatcher;

/// Shared application state for the admin surface.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: SystemTime,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct SiteSummary {
    domain: String,
    status: String,
    kind: &'static str,
    connections: usize,
}

#[derive(Serialize)]
struct SitesListResponse {
    sites: Vec<SiteSummary>,
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
}

fn summarize(entry: &crate::registry::SiteEntry) -> SiteSummary {
    let kind = match entry {
        crate::registry::SiteEntry::Tunnel(_) => "tunnel",
        crate::registry::SiteEntry::Direct(_) => "direct",
    };
    SiteSummary {
        domain: entry.domain().to_string(),
        status: entry.status().to_string(),
        kind,
        connections: entry.connection_count(),
    }
}

/// Create the admin API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sites", get(list_sites))
        .route("/sites/:domain", get(get_site))
        .route("/sites/:domain/status", get(get_site_status))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn list_sites(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sites = state
        .dispatcher
        .get_sites()
        .iter()
        .map(summarize)
        .collect();
    Json(SitesListResponse { sites })
}

async fn get_site(State(state): State<Arc<AppState>>, Path(domain): Path<String>) -> impl IntoResponse {
    match state.dispatcher.get_site(&domain) {
        Ok(entry) => Json(summarize(&entry)).into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn get_site_status(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> impl IntoResponse {
    match state.dispatcher.get_site(&domain) {
        Ok(entry) => Json(StatusResponse {
            status: entry.status().to_string(),
        })
        .into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SiteRegistry;
    use std::time::Duration;

    fn state_with(registry: SiteRegistry) -> Arc<AppState> {
        Arc::new(AppState {
            dispatcher: Arc::new(Dispatcher::new(Arc::new(registry))),
            started_at: SystemTime::now(),
        })
    }

    #[tokio::test]
    async fn list_sites_reports_direct_site() {
        let registry = SiteRegistry::new(Duration::from_secs(30));
        registry.register_direct_site("legacy.example.com".to_string());
        let state = state_with(registry);

        let summaries: Vec<SiteSummary> =
            state.dispatcher.get_sites().iter().map(summarize).collect();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].domain, "legacy.example.com");
        assert_eq!(summaries[0].kind, "direct");
        assert_eq!(summaries[0].status, "online");
    }
}
