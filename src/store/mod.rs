//! State store
//!
//! The single source of truth for persisted entities. One coarse
//! reader-writer lock covers every map; mutators hold the write lock for
//! validation + mutation + persist, so uniqueness and referential
//! invariants hold transactionally. Persistence is one pretty-printed JSON
//! file per map under the data directory, written best-effort.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use tokio::sync::RwLock;
use url::Url;
use uuid::Uuid;

use crate::error::AppError;
use crate::fsops::Reconciler;
use crate::models::{
    Backend, BulkTagRequest, Certificate, CreateHostRequest, CreateTagRequest, DefaultRoute,
    ImportHost, Maintenance, MaintenanceState, ProxyHost, Tag, TagAction, UpdateCertificateRequest,
    UpdateHostRequest, UpdateTagRequest,
};

pub const HOSTS_FILE: &str = "proxy_hosts.json";
pub const CERTIFICATES_FILE: &str = "certificates.json";
pub const TAGS_FILE: &str = "tags.json";
pub const DEFAULT_ROUTE_FILE: &str = "default_route_state.json";
pub const MAINTENANCE_FILE: &str = "maintenance_backup_state.json";

#[derive(Default)]
struct State {
    hosts: HashMap<Uuid, ProxyHost>,
    certificates: HashMap<Uuid, Certificate>,
    tags: HashMap<Uuid, Tag>,
    default_route: DefaultRoute,
    maintenance: MaintenanceState,
}

/// Prior route/maintenance pair, captured before a staged change so the
/// orchestrator can roll back.
#[derive(Debug, Clone)]
pub struct RouteStateStash {
    pub default_route: DefaultRoute,
    pub maintenance: MaintenanceState,
}

/// Result of staging one imported host record.
pub enum ImportOutcome {
    Created(ProxyHost),
    Updated { new: ProxyHost, prev: ProxyHost },
    Skipped,
}

pub struct StateStore {
    inner: RwLock<State>,
    fsops: Arc<Reconciler>,
}

impl StateStore {
    /// Load all persisted maps. Missing or corrupt files start empty with
    /// a logged warning; a first run has no files.
    pub async fn load(fsops: Arc<Reconciler>) -> Self {
        let hosts: Vec<ProxyHost> = fsops.load_json(HOSTS_FILE).await;
        let certificates: Vec<Certificate> = fsops.load_json(CERTIFICATES_FILE).await;
        let tags: Vec<Tag> = fsops.load_json(TAGS_FILE).await;
        let default_route: DefaultRoute = fsops.load_json(DEFAULT_ROUTE_FILE).await;
        let maintenance: MaintenanceState = fsops.load_json(MAINTENANCE_FILE).await;

        tracing::info!(
            "State loaded: {} hosts, {} certificates, {} tags",
            hosts.len(),
            certificates.len(),
            tags.len()
        );

        let state = State {
            hosts: hosts.into_iter().map(|h| (h.id, h)).collect(),
            certificates: certificates.into_iter().map(|c| (c.id, c)).collect(),
            tags: tags.into_iter().map(|t| (t.id, t)).collect(),
            default_route,
            maintenance,
        };

        Self {
            inner: RwLock::new(state),
            fsops,
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn list_hosts(&self) -> Vec<ProxyHost> {
        let state = self.inner.read().await;
        let mut hosts: Vec<_> = state.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| a.domain.cmp(&b.domain));
        hosts
    }

    pub async fn get_host(&self, id: Uuid) -> Result<ProxyHost, AppError> {
        let state = self.inner.read().await;
        state
            .hosts
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("host {}", id)))
    }

    pub async fn find_host_by_domain(&self, domain: &str) -> Option<ProxyHost> {
        let state = self.inner.read().await;
        state
            .hosts
            .values()
            .find(|h| h.domain.eq_ignore_ascii_case(domain))
            .cloned()
    }

    /// Export view of the host collection, ordered by creation for a
    /// stable round trip.
    pub async fn export_hosts(&self) -> Vec<ProxyHost> {
        let state = self.inner.read().await;
        let mut hosts: Vec<_> = state.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        hosts
    }

    pub async fn list_certificates(&self) -> Vec<Certificate> {
        let state = self.inner.read().await;
        let mut certs: Vec<_> = state.certificates.values().cloned().collect();
        certs.sort_by(|a, b| a.name.cmp(&b.name));
        certs
    }

    pub async fn get_certificate(&self, id: Uuid) -> Result<Certificate, AppError> {
        let state = self.inner.read().await;
        state
            .certificates
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("certificate {}", id)))
    }

    /// Resolve the certificate bound to a host, if any.
    pub async fn certificate_for(&self, host: &ProxyHost) -> Option<Certificate> {
        let id = host.certificate_id?;
        let state = self.inner.read().await;
        state.certificates.get(&id).cloned()
    }

    pub async fn hosts_bound_to_certificate(&self, cert_id: Uuid) -> Vec<ProxyHost> {
        let state = self.inner.read().await;
        state
            .hosts
            .values()
            .filter(|h| h.certificate_id == Some(cert_id))
            .cloned()
            .collect()
    }

    pub async fn list_tags(&self) -> Vec<Tag> {
        let state = self.inner.read().await;
        let mut tags: Vec<_> = state.tags.values().cloned().collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        tags
    }

    pub async fn get_default_route(&self) -> DefaultRoute {
        self.inner.read().await.default_route.clone()
    }

    pub async fn get_maintenance(&self) -> Maintenance {
        self.inner.read().await.maintenance.maintenance.clone()
    }

    pub async fn get_maintenance_state(&self) -> MaintenanceState {
        self.inner.read().await.maintenance.clone()
    }

    // ------------------------------------------------------------------
    // Host staging (barrier-driven; the orchestrator persists on success)
    // ------------------------------------------------------------------

    /// Validate and insert a new host in memory. Not yet persisted.
    pub async fn stage_create_host(&self, req: CreateHostRequest) -> Result<ProxyHost, AppError> {
        let mut state = self.inner.write().await;
        validate_host_payload(&req.domain, req.target.as_deref(), &req.backends)?;
        ensure_domain_free(&state, &req.domain, None)?;
        ensure_certificate_resolves(&state, req.certificate_id)?;
        ensure_tls_flags(req.ssl, req.force_ssl, req.certificate_id)?;
        ensure_tags_resolve(&state, &req.tag_ids)?;

        let now = Utc::now();
        let host = ProxyHost {
            id: Uuid::new_v4(),
            domain: req.domain,
            target: req.target,
            backends: req.backends,
            lb_method: req.lb_method,
            ssl: req.ssl,
            force_ssl: req.force_ssl,
            certificate_id: req.certificate_id,
            websocket: req.websocket,
            maintenance: req.maintenance,
            enabled: req.enabled,
            custom_nginx: req.custom_nginx,
            tag_ids: req.tag_ids,
            created_at: now,
            updated_at: now,
        };
        state.hosts.insert(host.id, host.clone());
        Ok(host)
    }

    /// Validate and apply a partial update in memory. Returns (new, prev).
    pub async fn stage_update_host(
        &self,
        id: Uuid,
        req: UpdateHostRequest,
    ) -> Result<(ProxyHost, ProxyHost), AppError> {
        let mut state = self.inner.write().await;
        let prev = state
            .hosts
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("host {}", id)))?;

        let mut next = prev.clone();
        if let Some(domain) = req.domain {
            next.domain = domain;
        }
        if let Some(target) = req.target {
            next.target = target;
        }
        if let Some(backends) = req.backends {
            next.backends = backends;
        }
        if let Some(lb_method) = req.lb_method {
            next.lb_method = lb_method;
        }
        if let Some(ssl) = req.ssl {
            next.ssl = ssl;
        }
        if let Some(force_ssl) = req.force_ssl {
            next.force_ssl = force_ssl;
        }
        if let Some(certificate_id) = req.certificate_id {
            next.certificate_id = certificate_id;
        }
        if let Some(websocket) = req.websocket {
            next.websocket = websocket;
        }
        if let Some(maintenance) = req.maintenance {
            next.maintenance = maintenance;
        }
        if let Some(enabled) = req.enabled {
            next.enabled = enabled;
        }
        if let Some(custom_nginx) = req.custom_nginx {
            next.custom_nginx = custom_nginx;
        }
        if let Some(tag_ids) = req.tag_ids {
            next.tag_ids = tag_ids;
        }

        validate_host_payload(&next.domain, next.target.as_deref(), &next.backends)?;
        ensure_domain_free(&state, &next.domain, Some(id))?;
        ensure_certificate_resolves(&state, next.certificate_id)?;
        ensure_tls_flags(next.ssl, next.force_ssl, next.certificate_id)?;
        ensure_tags_resolve(&state, &next.tag_ids)?;

        next.updated_at = touch(prev.updated_at);
        state.hosts.insert(id, next.clone());
        Ok((next, prev))
    }

    /// Remove a host in memory. Returns the removed entity for rollback.
    pub async fn stage_remove_host(&self, id: Uuid) -> Result<ProxyHost, AppError> {
        let mut state = self.inner.write().await;
        state
            .hosts
            .remove(&id)
            .ok_or_else(|| AppError::NotFound(format!("host {}", id)))
    }

    /// Stage one imported record against the domain-match rules.
    pub async fn stage_import_host(
        &self,
        item: ImportHost,
        overwrite: bool,
    ) -> Result<ImportOutcome, AppError> {
        let mut state = self.inner.write().await;
        validate_host_payload(&item.domain, item.target.as_deref(), &item.backends)?;
        ensure_certificate_resolves(&state, item.certificate_id)?;
        ensure_tls_flags(item.ssl, item.force_ssl, item.certificate_id)?;

        let existing = state
            .hosts
            .values()
            .find(|h| h.domain.eq_ignore_ascii_case(&item.domain))
            .cloned();

        match existing {
            Some(_) if !overwrite => Ok(ImportOutcome::Skipped),
            Some(prev) => {
                let mut next = prev.clone();
                next.target = item.target;
                next.backends = item.backends;
                next.lb_method = item.lb_method;
                next.ssl = item.ssl;
                next.force_ssl = item.force_ssl;
                next.certificate_id = item.certificate_id;
                next.websocket = item.websocket;
                next.maintenance = item.maintenance;
                next.enabled = item.enabled;
                next.custom_nginx = item.custom_nginx;
                next.tag_ids = item.tag_ids;
                next.updated_at = touch(prev.updated_at);
                state.hosts.insert(next.id, next.clone());
                Ok(ImportOutcome::Updated { new: next, prev })
            }
            None => {
                let now = Utc::now();
                let id = match item.id {
                    Some(id) if !state.hosts.contains_key(&id) => id,
                    _ => Uuid::new_v4(),
                };
                let host = ProxyHost {
                    id,
                    domain: item.domain,
                    target: item.target,
                    backends: item.backends,
                    lb_method: item.lb_method,
                    ssl: item.ssl,
                    force_ssl: item.force_ssl,
                    certificate_id: item.certificate_id,
                    websocket: item.websocket,
                    maintenance: item.maintenance,
                    enabled: item.enabled,
                    custom_nginx: item.custom_nginx,
                    tag_ids: item.tag_ids,
                    created_at: item.created_at.unwrap_or(now),
                    updated_at: now,
                };
                state.hosts.insert(host.id, host.clone());
                Ok(ImportOutcome::Created(host))
            }
        }
    }

    /// Reinsert a prior host value (rollback of an update or delete).
    pub async fn restore_host(&self, host: ProxyHost) {
        self.inner.write().await.hosts.insert(host.id, host);
    }

    /// Drop a staged host (rollback of a create).
    pub async fn discard_host(&self, id: Uuid) {
        self.inner.write().await.hosts.remove(&id);
    }

    pub async fn persist_hosts(&self) {
        let state = self.inner.read().await;
        let mut hosts: Vec<_> = state.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        if let Err(e) = self.fsops.persist_json(HOSTS_FILE, &hosts).await {
            tracing::warn!("Failed to persist {} (non-fatal): {}", HOSTS_FILE, e);
        }
    }

    // ------------------------------------------------------------------
    // Certificates
    // ------------------------------------------------------------------

    /// Insert a fully-built certificate entity and persist.
    pub async fn insert_certificate(&self, cert: Certificate) -> Certificate {
        let mut state = self.inner.write().await;
        state.certificates.insert(cert.id, cert.clone());
        self.persist_certificates_locked(&state).await;
        cert
    }

    pub async fn update_certificate_meta(
        &self,
        id: Uuid,
        req: UpdateCertificateRequest,
    ) -> Result<Certificate, AppError> {
        let mut state = self.inner.write().await;
        if let Some(tag_ids) = &req.tag_ids {
            ensure_tags_resolve(&state, tag_ids)?;
        }
        let cert = state
            .certificates
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("certificate {}", id)))?;

        if let Some(name) = req.name {
            cert.name = name;
        }
        if let Some(auto_renew) = req.auto_renew {
            cert.auto_renew = auto_renew;
        }
        if let Some(tag_ids) = req.tag_ids {
            cert.tag_ids = tag_ids;
        }
        cert.updated_at = touch(cert.updated_at);
        let cert = cert.clone();
        self.persist_certificates_locked(&state).await;
        Ok(cert)
    }

    /// Renewal path: fresh material for the same identity. Host bindings
    /// stay valid because the id is preserved.
    pub async fn update_certificate_material(
        &self,
        id: Uuid,
        cert_path: String,
        key_path: String,
        chain_path: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Result<Certificate, AppError> {
        let mut state = self.inner.write().await;
        let cert = state
            .certificates
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("certificate {}", id)))?;
        cert.cert_path = cert_path;
        cert.key_path = key_path;
        cert.chain_path = chain_path;
        cert.expires_at = expires_at;
        cert.updated_at = touch(cert.updated_at);
        let cert = cert.clone();
        self.persist_certificates_locked(&state).await;
        Ok(cert)
    }

    /// Destroy a certificate. Refused while any host references it.
    pub async fn remove_certificate(&self, id: Uuid) -> Result<Certificate, AppError> {
        let mut state = self.inner.write().await;
        let bound: Vec<String> = state
            .hosts
            .values()
            .filter(|h| h.certificate_id == Some(id))
            .map(|h| h.domain.clone())
            .collect();
        if !bound.is_empty() {
            return Err(AppError::Conflict(format!(
                "certificate is bound to: {}",
                bound.join(", ")
            )));
        }
        let cert = state
            .certificates
            .remove(&id)
            .ok_or_else(|| AppError::NotFound(format!("certificate {}", id)))?;
        self.persist_certificates_locked(&state).await;
        Ok(cert)
    }

    async fn persist_certificates_locked(&self, state: &State) {
        let mut certs: Vec<_> = state.certificates.values().cloned().collect();
        certs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        if let Err(e) = self.fsops.persist_json(CERTIFICATES_FILE, &certs).await {
            tracing::warn!("Failed to persist {} (non-fatal): {}", CERTIFICATES_FILE, e);
        }
    }

    // ------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------

    pub async fn create_tag(&self, req: CreateTagRequest) -> Result<Tag, AppError> {
        let mut state = self.inner.write().await;
        ensure_tag_name_free(&state, &req.name, None)?;
        if req.name.trim().is_empty() {
            return Err(AppError::Validation("tag name must not be empty".into()));
        }
        let now = Utc::now();
        let tag = Tag {
            id: Uuid::new_v4(),
            name: req.name,
            color: req.color,
            created_at: now,
            updated_at: now,
        };
        state.tags.insert(tag.id, tag.clone());
        self.persist_tags_locked(&state).await;
        Ok(tag)
    }

    pub async fn update_tag(&self, id: Uuid, req: UpdateTagRequest) -> Result<Tag, AppError> {
        let mut state = self.inner.write().await;
        if let Some(name) = &req.name {
            if name.trim().is_empty() {
                return Err(AppError::Validation("tag name must not be empty".into()));
            }
            ensure_tag_name_free(&state, name, Some(id))?;
        }
        let tag = state
            .tags
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("tag {}", id)))?;
        if let Some(name) = req.name {
            tag.name = name;
        }
        if let Some(color) = req.color {
            tag.color = color;
        }
        tag.updated_at = touch(tag.updated_at);
        let tag = tag.clone();
        self.persist_tags_locked(&state).await;
        Ok(tag)
    }

    /// Delete a tag and scrub its id from every host and certificate.
    pub async fn delete_tag(&self, id: Uuid) -> Result<Tag, AppError> {
        let mut state = self.inner.write().await;
        let tag = state
            .tags
            .remove(&id)
            .ok_or_else(|| AppError::NotFound(format!("tag {}", id)))?;

        let now = Utc::now();
        for host in state.hosts.values_mut() {
            if host.tag_ids.iter().any(|t| *t == id) {
                host.tag_ids.retain(|t| *t != id);
                host.updated_at = touch(host.updated_at.max(now));
            }
        }
        for cert in state.certificates.values_mut() {
            if cert.tag_ids.iter().any(|t| *t == id) {
                cert.tag_ids.retain(|t| *t != id);
                cert.updated_at = touch(cert.updated_at.max(now));
            }
        }

        self.persist_tags_locked(&state).await;
        self.persist_hosts_locked(&state).await;
        self.persist_certificates_locked(&state).await;
        Ok(tag)
    }

    /// Idempotent bulk add/remove of one tag across hosts and
    /// certificates. Duplicate adds and missing removes count as success.
    pub async fn bulk_tag(&self, req: BulkTagRequest) -> Result<usize, AppError> {
        let mut state = self.inner.write().await;
        if !state.tags.contains_key(&req.tag_id) {
            return Err(AppError::NotFound(format!("tag {}", req.tag_id)));
        }
        // Validate the whole batch before touching anything.
        for host_id in &req.host_ids {
            if !state.hosts.contains_key(host_id) {
                return Err(AppError::NotFound(format!("host {}", host_id)));
            }
        }
        for cert_id in &req.certificate_ids {
            if !state.certificates.contains_key(cert_id) {
                return Err(AppError::NotFound(format!("certificate {}", cert_id)));
            }
        }

        let mut updated = 0usize;
        for host_id in &req.host_ids {
            if let Some(host) = state.hosts.get_mut(host_id) {
                if apply_tag(&mut host.tag_ids, req.tag_id, req.action) {
                    host.updated_at = touch(host.updated_at);
                }
                updated += 1;
            }
        }
        for cert_id in &req.certificate_ids {
            if let Some(cert) = state.certificates.get_mut(cert_id) {
                if apply_tag(&mut cert.tag_ids, req.tag_id, req.action) {
                    cert.updated_at = touch(cert.updated_at);
                }
                updated += 1;
            }
        }

        if !req.host_ids.is_empty() {
            self.persist_hosts_locked(&state).await;
        }
        if !req.certificate_ids.is_empty() {
            self.persist_certificates_locked(&state).await;
        }
        Ok(updated)
    }

    async fn persist_tags_locked(&self, state: &State) {
        let mut tags: Vec<_> = state.tags.values().cloned().collect();
        tags.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        if let Err(e) = self.fsops.persist_json(TAGS_FILE, &tags).await {
            tracing::warn!("Failed to persist {} (non-fatal): {}", TAGS_FILE, e);
        }
    }

    async fn persist_hosts_locked(&self, state: &State) {
        let mut hosts: Vec<_> = state.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        if let Err(e) = self.fsops.persist_json(HOSTS_FILE, &hosts).await {
            tracing::warn!("Failed to persist {} (non-fatal): {}", HOSTS_FILE, e);
        }
    }

    // ------------------------------------------------------------------
    // Default route / maintenance staging
    // ------------------------------------------------------------------

    pub async fn stash_route_state(&self) -> RouteStateStash {
        let state = self.inner.read().await;
        RouteStateStash {
            default_route: state.default_route.clone(),
            maintenance: state.maintenance.clone(),
        }
    }

    pub async fn stage_set_default_route(&self, mut route: DefaultRoute) -> DefaultRoute {
        let mut state = self.inner.write().await;
        route.updated_at = touch(state.default_route.updated_at);
        state.default_route = route.clone();
        route
    }

    /// Stage the maintenance transition. Enabling saves the active default
    /// route into the backup slot; disabling restores it.
    pub async fn stage_set_maintenance(
        &self,
        enabled: bool,
        message: String,
        shadow_route: Option<DefaultRoute>,
    ) -> DefaultRoute {
        let mut state = self.inner.write().await;
        let now = Utc::now();

        if enabled {
            if !state.maintenance.maintenance.enabled {
                state.maintenance.backup = Some(state.default_route.clone());
            }
            if let Some(mut route) = shadow_route {
                route.updated_at = now;
                state.default_route = route;
            }
        } else {
            if let Some(prior) = state.maintenance.backup.take() {
                state.default_route = prior;
            }
        }

        state.maintenance.maintenance = Maintenance {
            enabled,
            message,
            updated_at: now,
        };
        state.default_route.clone()
    }

    pub async fn restore_route_state(&self, stash: RouteStateStash) {
        let mut state = self.inner.write().await;
        state.default_route = stash.default_route;
        state.maintenance = stash.maintenance;
    }

    pub async fn persist_route_state(&self) {
        let state = self.inner.read().await;
        if let Err(e) = self
            .fsops
            .persist_json(DEFAULT_ROUTE_FILE, &state.default_route)
            .await
        {
            tracing::warn!("Failed to persist {} (non-fatal): {}", DEFAULT_ROUTE_FILE, e);
        }
        if let Err(e) = self
            .fsops
            .persist_json(MAINTENANCE_FILE, &state.maintenance)
            .await
        {
            tracing::warn!("Failed to persist {} (non-fatal): {}", MAINTENANCE_FILE, e);
        }
    }
}

// ----------------------------------------------------------------------
// Validation
// ----------------------------------------------------------------------

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9](-?[A-Za-z0-9])*(\.[A-Za-z0-9](-?[A-Za-z0-9])*)+$").unwrap()
    })
}

/// Domain validation: non-empty, optionally one leading wildcard label,
/// then the fixed hostname grammar.
pub fn validate_domain(domain: &str) -> Result<(), AppError> {
    if domain.is_empty() {
        return Err(AppError::Validation("domain must not be empty".into()));
    }
    let stripped = domain.strip_prefix("*.").unwrap_or(domain);
    if stripped.contains('*') {
        return Err(AppError::Validation(format!(
            "only a single leading wildcard label is allowed: {}",
            domain
        )));
    }
    if !domain_re().is_match(stripped) {
        return Err(AppError::Validation(format!("invalid domain: {}", domain)));
    }
    Ok(())
}

fn validate_target(target: &str) -> Result<(), AppError> {
    if !target.starts_with("http://") && !target.starts_with("https://") {
        return Err(AppError::Validation(format!(
            "target must start with http:// or https://: {}",
            target
        )));
    }
    Url::parse(target)
        .map_err(|e| AppError::Validation(format!("invalid target URL {}: {}", target, e)))?;
    Ok(())
}

fn validate_backend(backend: &Backend) -> Result<(), AppError> {
    let (host, port) = backend
        .address
        .rsplit_once(':')
        .ok_or_else(|| {
            AppError::Validation(format!(
                "backend address must be host:port: {}",
                backend.address
            ))
        })?;
    if host.is_empty() {
        return Err(AppError::Validation(format!(
            "backend address must be host:port: {}",
            backend.address
        )));
    }
    let port: u16 = port.parse().map_err(|_| {
        AppError::Validation(format!("invalid backend port in {}", backend.address))
    })?;
    if port == 0 {
        return Err(AppError::Validation(format!(
            "invalid backend port in {}",
            backend.address
        )));
    }
    if backend.weight < 1 {
        return Err(AppError::Validation(format!(
            "backend weight must be >= 1: {}",
            backend.address
        )));
    }
    Ok(())
}

fn validate_host_payload(
    domain: &str,
    target: Option<&str>,
    backends: &[Backend],
) -> Result<(), AppError> {
    validate_domain(domain)?;
    match (target, backends.is_empty()) {
        (Some(_), false) => Err(AppError::Validation(
            "specify either a target URL or backends, not both".into(),
        )),
        (None, true) => Err(AppError::Validation(
            "a target URL or at least one backend is required".into(),
        )),
        (Some(target), true) => validate_target(target),
        (None, false) => {
            for backend in backends {
                validate_backend(backend)?;
            }
            Ok(())
        }
    }
}

fn ensure_domain_free(state: &State, domain: &str, exclude: Option<Uuid>) -> Result<(), AppError> {
    let clash = state
        .hosts
        .values()
        .any(|h| Some(h.id) != exclude && h.domain.eq_ignore_ascii_case(domain));
    if clash {
        return Err(AppError::Conflict(format!(
            "a host with domain {} already exists",
            domain
        )));
    }
    Ok(())
}

fn ensure_certificate_resolves(state: &State, cert_id: Option<Uuid>) -> Result<(), AppError> {
    if let Some(id) = cert_id {
        if !state.certificates.contains_key(&id) {
            return Err(AppError::Validation(format!(
                "certificate {} does not exist",
                id
            )));
        }
    }
    Ok(())
}

/// An `ssl` listener without certificate paths is invalid nginx syntax,
/// so the certificate binding is mandatory whenever TLS is on.
fn ensure_tls_flags(
    ssl: bool,
    force_ssl: bool,
    certificate_id: Option<Uuid>,
) -> Result<(), AppError> {
    if force_ssl && !ssl {
        return Err(AppError::Validation(
            "forceSsl requires ssl to be enabled".into(),
        ));
    }
    if ssl && certificate_id.is_none() {
        return Err(AppError::Validation(
            "ssl requires a bound certificate".into(),
        ));
    }
    Ok(())
}

fn ensure_tags_resolve(state: &State, tag_ids: &[Uuid]) -> Result<(), AppError> {
    for id in tag_ids {
        if !state.tags.contains_key(id) {
            return Err(AppError::Validation(format!("tag {} does not exist", id)));
        }
    }
    Ok(())
}

fn ensure_tag_name_free(state: &State, name: &str, exclude: Option<Uuid>) -> Result<(), AppError> {
    let clash = state
        .tags
        .values()
        .any(|t| Some(t.id) != exclude && t.name.eq_ignore_ascii_case(name));
    if clash {
        return Err(AppError::Conflict(format!(
            "a tag named {} already exists",
            name
        )));
    }
    Ok(())
}

/// Returns true when the set changed.
fn apply_tag(tag_ids: &mut Vec<Uuid>, tag_id: Uuid, action: TagAction) -> bool {
    match action {
        TagAction::Add => {
            if tag_ids.contains(&tag_id) {
                false
            } else {
                tag_ids.push(tag_id);
                true
            }
        }
        TagAction::Remove => {
            let before = tag_ids.len();
            tag_ids.retain(|t| *t != tag_id);
            tag_ids.len() != before
        }
    }
}

/// Strictly-advancing updated-at, even within one clock tick.
fn touch(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > prev {
        now
    } else {
        prev + Duration::milliseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store(root: &TempDir) -> StateStore {
        let fsops = Arc::new(Reconciler::new(
            root.path().join("available").to_str().unwrap(),
            root.path().join("enabled").to_str().unwrap(),
            root.path().join("data").to_str().unwrap(),
        ));
        StateStore::load(fsops).await
    }

    fn create_req(domain: &str) -> CreateHostRequest {
        CreateHostRequest {
            domain: domain.to_string(),
            target: Some("http://127.0.0.1:3000".to_string()),
            backends: vec![],
            lb_method: Default::default(),
            ssl: false,
            force_ssl: false,
            certificate_id: None,
            websocket: false,
            maintenance: false,
            enabled: true,
            custom_nginx: None,
            tag_ids: vec![],
        }
    }

    #[test]
    fn test_domain_validation() {
        assert!(validate_domain("api.example.com").is_ok());
        assert!(validate_domain("*.example.com").is_ok());
        assert!(validate_domain("a-b.example.co.uk").is_ok());
        assert!(validate_domain("").is_err());
        assert!(validate_domain("nodots").is_err());
        assert!(validate_domain("-bad.example.com").is_err());
        assert!(validate_domain("bad-.example.com").is_err());
        assert!(validate_domain("a.*.example.com").is_err());
        assert!(validate_domain("*.*.example.com").is_err());
    }

    #[test]
    fn test_backend_validation() {
        let ok = Backend {
            address: "10.0.0.1:80".into(),
            weight: 1,
            backup: false,
        };
        assert!(validate_backend(&ok).is_ok());

        for bad in ["10.0.0.1", ":80", "10.0.0.1:0", "10.0.0.1:70000", "10.0.0.1:http"] {
            let b = Backend {
                address: bad.into(),
                weight: 1,
                backup: false,
            };
            assert!(validate_backend(&b).is_err(), "{} should fail", bad);
        }
    }

    #[tokio::test]
    async fn test_domain_uniqueness() {
        let root = TempDir::new().unwrap();
        let s = store(&root).await;

        s.stage_create_host(create_req("a.example.com")).await.unwrap();
        let err = s.stage_create_host(create_req("a.example.com")).await;
        assert!(matches!(err, Err(AppError::Conflict(_))));

        // Case-insensitive clash.
        let err = s.stage_create_host(create_req("A.Example.Com")).await;
        assert!(matches!(err, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_update_preserves_id_and_advances_updated_at() {
        let root = TempDir::new().unwrap();
        let s = store(&root).await;

        let host = s.stage_create_host(create_req("a.example.com")).await.unwrap();
        let (new, prev) = s
            .stage_update_host(
                host.id,
                UpdateHostRequest {
                    websocket: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(new.id, prev.id);
        assert!(new.websocket);
        assert!(new.updated_at > prev.updated_at);
    }

    #[tokio::test]
    async fn test_force_ssl_requires_ssl() {
        let root = TempDir::new().unwrap();
        let s = store(&root).await;

        let mut req = create_req("a.example.com");
        req.force_ssl = true;
        let err = s.stage_create_host(req).await;
        assert!(matches!(err, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_ssl_requires_bound_certificate() {
        let root = TempDir::new().unwrap();
        let s = store(&root).await;

        // An ssl listener with no certificate would be invalid nginx
        // syntax, so it must never reach the renderer.
        let mut req = create_req("a.example.com");
        req.ssl = true;
        let err = s.stage_create_host(req).await;
        assert!(matches!(err, Err(AppError::Validation(_))));

        // Same rule when an update clears the binding but leaves ssl on.
        let now = Utc::now();
        let cert = s
            .insert_certificate(Certificate {
                id: Uuid::new_v4(),
                name: "c".into(),
                domains: vec!["a.example.com".into()],
                cert_path: "/tmp/c.crt".into(),
                key_path: "/tmp/c.key".into(),
                chain_path: None,
                provenance: crate::models::CertProvenance::Uploaded,
                expires_at: now,
                auto_renew: false,
                dns_challenge: None,
                tag_ids: vec![],
                created_at: now,
                updated_at: now,
            })
            .await;
        let mut req = create_req("a.example.com");
        req.ssl = true;
        req.certificate_id = Some(cert.id);
        let host = s.stage_create_host(req).await.unwrap();

        let err = s
            .stage_update_host(
                host.id,
                UpdateHostRequest {
                    certificate_id: Some(None),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::Validation(_))));

        // Dropping ssl together with the binding is fine.
        let (updated, _) = s
            .stage_update_host(
                host.id,
                UpdateHostRequest {
                    ssl: Some(false),
                    certificate_id: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.ssl);
        assert!(updated.certificate_id.is_none());
    }

    #[tokio::test]
    async fn test_unknown_certificate_rejected() {
        let root = TempDir::new().unwrap();
        let s = store(&root).await;

        let mut req = create_req("a.example.com");
        req.certificate_id = Some(Uuid::new_v4());
        let err = s.stage_create_host(req).await;
        assert!(matches!(err, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_certificate_delete_refused_while_bound() {
        let root = TempDir::new().unwrap();
        let s = store(&root).await;
        let now = Utc::now();

        let cert = s
            .insert_certificate(Certificate {
                id: Uuid::new_v4(),
                name: "c".into(),
                domains: vec!["a.example.com".into()],
                cert_path: "/tmp/c.crt".into(),
                key_path: "/tmp/c.key".into(),
                chain_path: None,
                provenance: crate::models::CertProvenance::Uploaded,
                expires_at: now,
                auto_renew: false,
                dns_challenge: None,
                tag_ids: vec![],
                created_at: now,
                updated_at: now,
            })
            .await;

        let mut req = create_req("a.example.com");
        req.ssl = true;
        req.certificate_id = Some(cert.id);
        let host = s.stage_create_host(req).await.unwrap();

        let err = s.remove_certificate(cert.id).await;
        assert!(matches!(err, Err(AppError::Conflict(_))));

        s.stage_remove_host(host.id).await.unwrap();
        assert!(s.remove_certificate(cert.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_tag_scrub_on_delete() {
        let root = TempDir::new().unwrap();
        let s = store(&root).await;

        let tag = s
            .create_tag(CreateTagRequest {
                name: "prod".into(),
                color: "#ff0000".into(),
            })
            .await
            .unwrap();

        let mut req = create_req("a.example.com");
        req.tag_ids = vec![tag.id];
        let host = s.stage_create_host(req).await.unwrap();
        assert_eq!(host.tag_ids, vec![tag.id]);

        s.delete_tag(tag.id).await.unwrap();
        let host = s.get_host(host.id).await.unwrap();
        assert!(host.tag_ids.is_empty());
    }

    #[tokio::test]
    async fn test_tag_name_uniqueness() {
        let root = TempDir::new().unwrap();
        let s = store(&root).await;

        s.create_tag(CreateTagRequest {
            name: "prod".into(),
            color: "#f00".into(),
        })
        .await
        .unwrap();
        let err = s
            .create_tag(CreateTagRequest {
                name: "PROD".into(),
                color: "#0f0".into(),
            })
            .await;
        assert!(matches!(err, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_bulk_tag_is_idempotent() {
        let root = TempDir::new().unwrap();
        let s = store(&root).await;

        let tag = s
            .create_tag(CreateTagRequest {
                name: "prod".into(),
                color: "#f00".into(),
            })
            .await
            .unwrap();
        let host = s.stage_create_host(create_req("a.example.com")).await.unwrap();

        let req = || BulkTagRequest {
            action: TagAction::Add,
            tag_id: tag.id,
            host_ids: vec![host.id],
            certificate_ids: vec![],
        };
        assert_eq!(s.bulk_tag(req()).await.unwrap(), 1);
        // Duplicate add is a success no-op.
        assert_eq!(s.bulk_tag(req()).await.unwrap(), 1);
        assert_eq!(s.get_host(host.id).await.unwrap().tag_ids.len(), 1);

        let remove = BulkTagRequest {
            action: TagAction::Remove,
            tag_id: tag.id,
            host_ids: vec![host.id],
            certificate_ids: vec![],
        };
        assert_eq!(s.bulk_tag(remove).await.unwrap(), 1);
        // Missing remove is also a success no-op.
        let remove = BulkTagRequest {
            action: TagAction::Remove,
            tag_id: tag.id,
            host_ids: vec![host.id],
            certificate_ids: vec![],
        };
        assert_eq!(s.bulk_tag(remove).await.unwrap(), 1);
        assert!(s.get_host(host.id).await.unwrap().tag_ids.is_empty());
    }

    #[tokio::test]
    async fn test_import_skip_and_overwrite() {
        let root = TempDir::new().unwrap();
        let s = store(&root).await;

        let existing = s.stage_create_host(create_req("a.example.com")).await.unwrap();

        let item = ImportHost {
            id: None,
            domain: "a.example.com".into(),
            target: Some("http://x:1".into()),
            backends: vec![],
            lb_method: Default::default(),
            ssl: false,
            force_ssl: false,
            certificate_id: None,
            websocket: false,
            maintenance: false,
            enabled: true,
            custom_nginx: None,
            tag_ids: vec![],
            created_at: None,
        };

        // overwrite=false skips the clash.
        match s.stage_import_host(item.clone(), false).await.unwrap() {
            ImportOutcome::Skipped => {}
            _ => panic!("expected skip"),
        }
        let unchanged = s.get_host(existing.id).await.unwrap();
        assert_eq!(unchanged.target.as_deref(), Some("http://127.0.0.1:3000"));

        // overwrite=true updates in place, preserving the id.
        match s.stage_import_host(item, true).await.unwrap() {
            ImportOutcome::Updated { new, .. } => {
                assert_eq!(new.id, existing.id);
                assert_eq!(new.target.as_deref(), Some("http://x:1"));
            }
            _ => panic!("expected update"),
        }
    }

    #[tokio::test]
    async fn test_import_of_export_round_trips() {
        let root = TempDir::new().unwrap();
        let s = store(&root).await;

        s.stage_create_host(create_req("a.example.com")).await.unwrap();
        s.stage_create_host(create_req("b.example.com")).await.unwrap();
        let before = s.export_hosts().await;

        for host in before.clone() {
            let item = ImportHost {
                id: Some(host.id),
                domain: host.domain.clone(),
                target: host.target.clone(),
                backends: host.backends.clone(),
                lb_method: host.lb_method,
                ssl: host.ssl,
                force_ssl: host.force_ssl,
                certificate_id: host.certificate_id,
                websocket: host.websocket,
                maintenance: host.maintenance,
                enabled: host.enabled,
                custom_nginx: host.custom_nginx.clone(),
                tag_ids: host.tag_ids.clone(),
                created_at: Some(host.created_at),
            };
            s.stage_import_host(item, true).await.unwrap();
        }

        let after = s.export_hosts().await;
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.id, a.id);
            assert_eq!(b.domain, a.domain);
            assert_eq!(b.target, a.target);
            assert_eq!(b.created_at, a.created_at);
            // updated_at is allowed to advance.
            assert!(a.updated_at >= b.updated_at);
        }
    }

    #[tokio::test]
    async fn test_maintenance_backup_and_restore() {
        let root = TempDir::new().unwrap();
        let s = store(&root).await;

        let route = DefaultRoute {
            enabled: true,
            mode: crate::models::DefaultRouteMode::Proxy,
            target: Some("http://127.0.0.1:9000".into()),
            ..Default::default()
        };
        s.stage_set_default_route(route.clone()).await;

        let shadow = DefaultRoute {
            enabled: true,
            mode: crate::models::DefaultRouteMode::CustomHtml,
            custom_html: Some("<h1>Be right back</h1>".into()),
            ..Default::default()
        };
        s.stage_set_maintenance(true, "Be right back".into(), Some(shadow))
            .await;

        let state = s.get_maintenance_state().await;
        assert!(state.maintenance.enabled);
        let backup = state.backup.expect("backup slot populated");
        assert_eq!(backup.mode, crate::models::DefaultRouteMode::Proxy);
        assert_eq!(backup.target.as_deref(), Some("http://127.0.0.1:9000"));

        let restored = s.stage_set_maintenance(false, String::new(), None).await;
        assert_eq!(restored.mode, crate::models::DefaultRouteMode::Proxy);
        assert!(s.get_maintenance_state().await.backup.is_none());
    }

    #[test]
    fn test_touch_is_strictly_monotonic() {
        let now = Utc::now();
        let later = touch(now);
        assert!(later > now);
        let even_later = touch(later + Duration::days(1));
        assert!(even_later > later);
    }
}
