//! API module - HTTP handlers and routes

pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};

use crate::acme::AcmeAgent;
use crate::config::Config;
use crate::fsops::Reconciler;
use crate::nginx::NginxSupervisor;
use crate::orchestrator::Orchestrator;
use crate::store::StateStore;
use crate::telemetry::Fanout;

/// Shared handler state.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Arc<StateStore>,
    pub fsops: Arc<Reconciler>,
    pub nginx: Arc<NginxSupervisor>,
    pub orchestrator: Arc<Orchestrator>,
    pub fanout: Arc<Fanout>,
    pub acme: Arc<AcmeAgent>,
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/health", get(handlers::health_check))
        // Proxy hosts
        .route("/api/hosts", get(handlers::list_hosts))
        .route("/api/hosts", post(handlers::create_host))
        .route("/api/hosts/:id", get(handlers::get_host))
        .route("/api/hosts/:id", put(handlers::update_host))
        .route("/api/hosts/:id", delete(handlers::delete_host))
        .route("/api/hosts/:id/toggle", post(handlers::toggle_host))
        // Certificates
        .route("/api/certificates", get(handlers::list_certificates))
        .route("/api/certificates", post(handlers::upload_certificate))
        .route(
            "/api/certificates/self-signed",
            post(handlers::create_self_signed),
        )
        .route("/api/certificates/:id", get(handlers::get_certificate))
        .route("/api/certificates/:id", put(handlers::update_certificate))
        .route("/api/certificates/:id", delete(handlers::delete_certificate))
        .route(
            "/api/certificates/:id/renew",
            post(handlers::renew_certificate),
        )
        .route(
            "/api/certificates/:id/apply",
            post(handlers::apply_certificate),
        )
        // ACME
        .route("/api/acme/providers", get(handlers::list_dns_providers))
        .route("/api/acme/obtain", post(handlers::obtain_certificate))
        .route("/api/acme/renewals", get(handlers::renewal_scan))
        // Tags
        .route("/api/tags", get(handlers::list_tags))
        .route("/api/tags", post(handlers::create_tag))
        .route("/api/tags/bulk", post(handlers::bulk_tag))
        .route("/api/tags/:id", put(handlers::update_tag))
        .route("/api/tags/:id", delete(handlers::delete_tag))
        // Default route and maintenance
        .route("/api/default-route", get(handlers::get_default_route))
        .route("/api/default-route", put(handlers::update_default_route))
        .route("/api/maintenance", get(handlers::get_maintenance))
        .route("/api/maintenance", put(handlers::update_maintenance))
        // Nginx management
        .route("/api/nginx/status", get(handlers::nginx_status))
        .route("/api/nginx/test", post(handlers::test_nginx_config))
        .route("/api/nginx/reload", post(handlers::reload_nginx))
        // Metrics and logs
        .route("/api/metrics", get(handlers::get_metrics))
        .route("/api/logs/access", get(handlers::get_access_log))
        // Transfer
        .route("/api/transfer/export", get(handlers::export_hosts))
        .route("/api/transfer/import", post(handlers::import_hosts))
        // Telemetry stream
        .route("/ws", get(handlers::telemetry_ws))
}
