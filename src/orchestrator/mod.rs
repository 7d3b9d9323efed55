//! Orchestrator
//!
//! The one place where mutation is linearized against the nginx child.
//! Every operation that must affect nginx runs the same sequence under a
//! single mutex: stage in the store, materialize fragments, `nginx -t`,
//! then reload. A failed `-t` restores the prior fragment bytes and
//! discards the staged change; a failed reload is reported as a warning
//! because the filesystem and state already reflect the desired end state.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::acme::{self, AcmeAgent, ObtainCertificateRequest};
use crate::error::AppError;
use crate::fsops::{FragmentStash, Reconciler};
use crate::models::{
    ApplyCertificateRequest, CertProvenance, Certificate, CreateHostRequest, DefaultRoute,
    DefaultRouteMode, DnsChallenge, ImportReport, ImportRequest, Maintenance, NginxStatus,
    ProxyHost, SelfSignedRequest, UpdateDefaultRouteRequest, UpdateHostRequest,
    UpdateMaintenanceRequest, UploadCertificateRequest,
};
use crate::nginx::NginxControl;
use crate::render;
use crate::store::{ImportOutcome, StateStore};
use crate::telemetry::Fanout;

/// Successful mutation result. `warning` is set when the state committed
/// but `nginx -s reload` needs a retry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOutcome<T> {
    pub result: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl<T> MutationOutcome<T> {
    fn clean(result: T) -> Self {
        Self {
            result,
            warning: None,
        }
    }
}

pub struct Orchestrator {
    store: Arc<StateStore>,
    fsops: Arc<Reconciler>,
    nginx: Arc<dyn NginxControl>,
    fanout: Arc<Fanout>,
    lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<StateStore>,
        fsops: Arc<Reconciler>,
        nginx: Arc<dyn NginxControl>,
        fanout: Arc<Fanout>,
    ) -> Self {
        Self {
            store,
            fsops,
            nginx,
            fanout,
            lock: Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Host mutations
    // ------------------------------------------------------------------

    pub async fn create_host(
        &self,
        req: CreateHostRequest,
    ) -> Result<MutationOutcome<ProxyHost>, AppError> {
        let _guard = self.lock.lock().await;

        let host = self.store.stage_create_host(req).await?;
        let name = render::host_filename(&host.domain);
        let stash = self.fsops.stash(&name).await;

        if let Err(e) = self.materialize_host(&host).await {
            self.store.discard_host(host.id).await;
            let _ = self.fsops.restore(&stash).await;
            return Err(e);
        }

        match self.nginx.validate().await {
            Ok(_) => {}
            Err(e) => {
                self.store.discard_host(host.id).await;
                self.fsops.restore(&stash).await.ok();
                return Err(e);
            }
        }

        let warning = self.reload_with_warning().await;
        self.store.persist_hosts().await;
        self.fanout.emit_nginx_status().await;

        tracing::info!("Host created: {} ({})", host.domain, host.id);
        Ok(MutationOutcome {
            result: host,
            warning,
        })
    }

    pub async fn update_host(
        &self,
        id: Uuid,
        req: UpdateHostRequest,
    ) -> Result<MutationOutcome<ProxyHost>, AppError> {
        let _guard = self.lock.lock().await;

        let (new, prev) = self.store.stage_update_host(id, req).await?;
        let new_name = render::host_filename(&new.domain);
        let old_name = render::host_filename(&prev.domain);

        let new_stash = self.fsops.stash(&new_name).await;
        let old_stash = if old_name != new_name {
            Some(self.fsops.stash(&old_name).await)
        } else {
            None
        };

        // A renamed domain leaves its old fragment behind; withdraw first.
        let result: Result<(), AppError> = async {
            if old_name != new_name {
                self.fsops.withdraw(&old_name).await?;
            }
            self.materialize_host(&new).await?;
            self.nginx.validate().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.store.restore_host(prev).await;
            self.fsops.restore(&new_stash).await.ok();
            if let Some(stash) = &old_stash {
                self.fsops.restore(stash).await.ok();
            }
            return Err(e);
        }

        let warning = self.reload_with_warning().await;
        self.store.persist_hosts().await;
        self.fanout.emit_nginx_status().await;

        tracing::info!("Host updated: {} ({})", new.domain, new.id);
        Ok(MutationOutcome {
            result: new,
            warning,
        })
    }

    pub async fn delete_host(&self, id: Uuid) -> Result<MutationOutcome<ProxyHost>, AppError> {
        let _guard = self.lock.lock().await;

        let host = self.store.stage_remove_host(id).await?;
        let name = render::host_filename(&host.domain);
        let stash = self.fsops.stash(&name).await;

        let result: Result<(), AppError> = async {
            self.fsops.withdraw(&name).await?;
            self.nginx.validate().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.store.restore_host(host).await;
            self.fsops.restore(&stash).await.ok();
            return Err(e);
        }

        let warning = self.reload_with_warning().await;
        self.store.persist_hosts().await;
        self.fanout.emit_nginx_status().await;

        tracing::info!("Host deleted: {} ({})", host.domain, host.id);
        Ok(MutationOutcome {
            result: host,
            warning,
        })
    }

    /// Flip only the enabled flag: the fragment stays, the symlink moves.
    pub async fn toggle_host(&self, id: Uuid) -> Result<MutationOutcome<ProxyHost>, AppError> {
        let current = self.store.get_host(id).await?;
        let req = UpdateHostRequest {
            enabled: Some(!current.enabled),
            ..Default::default()
        };
        self.update_host(id, req).await
    }

    // ------------------------------------------------------------------
    // Certificate application
    // ------------------------------------------------------------------

    /// Bind one certificate to many hosts in a single barrier pass,
    /// regenerating every affected fragment.
    pub async fn apply_certificate(
        &self,
        cert_id: Uuid,
        req: ApplyCertificateRequest,
    ) -> Result<MutationOutcome<Vec<ProxyHost>>, AppError> {
        let _guard = self.lock.lock().await;

        self.store.get_certificate(cert_id).await?;

        let mut updated = Vec::new();
        let mut previous = Vec::new();
        let mut stashes: Vec<FragmentStash> = Vec::new();

        let result: Result<(), AppError> = async {
            for host_id in &req.host_ids {
                let update = UpdateHostRequest {
                    ssl: Some(true),
                    certificate_id: Some(Some(cert_id)),
                    ..Default::default()
                };
                let (new, prev) = self.store.stage_update_host(*host_id, update).await?;
                let name = render::host_filename(&new.domain);
                stashes.push(self.fsops.stash(&name).await);
                self.materialize_host(&new).await?;
                updated.push(new);
                previous.push(prev);
            }
            self.nginx.validate().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            for prev in previous {
                self.store.restore_host(prev).await;
            }
            for stash in &stashes {
                self.fsops.restore(stash).await.ok();
            }
            return Err(e);
        }

        let warning = self.reload_with_warning().await;
        self.store.persist_hosts().await;
        self.fanout.emit_nginx_status().await;

        tracing::info!(
            "Certificate {} applied to {} hosts",
            cert_id,
            updated.len()
        );
        Ok(MutationOutcome {
            result: updated,
            warning,
        })
    }

    // ------------------------------------------------------------------
    // Certificate lifecycle
    // ------------------------------------------------------------------

    /// Issue a certificate via ACME DNS-01. The mutex is held for the
    /// whole issuance so provider calls from concurrent requests never
    /// interleave.
    pub async fn issue_certificate(
        &self,
        agent: &AcmeAgent,
        req: ObtainCertificateRequest,
    ) -> Result<Certificate, AppError> {
        let _guard = self.lock.lock().await;

        for domain in &req.domains {
            crate::store::validate_domain(domain)?;
        }
        let bundle = agent.obtain(&req.domains, &req.challenge).await?;

        let id = Uuid::new_v4();
        let (cert_path, key_path, chain_path) = self
            .fsops
            .write_cert_files(&acme::material_id(id), &bundle.cert_pem, &bundle.key_pem, None)
            .await?;

        let now = chrono::Utc::now();
        let cert = Certificate {
            id,
            name: req
                .name
                .unwrap_or_else(|| req.domains.first().cloned().unwrap_or_default()),
            domains: req.domains,
            cert_path,
            key_path,
            chain_path,
            provenance: CertProvenance::AcmeIssued,
            expires_at: bundle.expires_at,
            auto_renew: req.auto_renew,
            dns_challenge: Some(req.challenge),
            tag_ids: vec![],
            created_at: now,
            updated_at: now,
        };
        let cert = self.store.insert_certificate(cert).await;
        tracing::info!(
            "Certificate issued for {} (expires {})",
            cert.domains.join(", "),
            cert.expires_at
        );
        Ok(cert)
    }

    /// Re-issue for the same domain set, preserving the certificate id so
    /// host bindings stay valid. Bound hosts get a reload so nginx picks
    /// up the fresh material.
    pub async fn renew_certificate(
        &self,
        agent: &AcmeAgent,
        id: Uuid,
        challenge_override: Option<DnsChallenge>,
    ) -> Result<MutationOutcome<Certificate>, AppError> {
        let _guard = self.lock.lock().await;

        let cert = self.store.get_certificate(id).await?;
        if cert.provenance != CertProvenance::AcmeIssued {
            return Err(AppError::Validation(format!(
                "certificate {} was not ACME-issued and cannot be renewed",
                id
            )));
        }
        let challenge = challenge_override
            .or_else(|| cert.dns_challenge.clone())
            .ok_or_else(|| {
                AppError::Validation(
                    "no stored DNS challenge settings; supply providerName and config".into(),
                )
            })?;

        let bundle = agent.obtain(&cert.domains, &challenge).await?;
        let (cert_path, key_path, chain_path) = self
            .fsops
            .write_cert_files(&acme::material_id(id), &bundle.cert_pem, &bundle.key_pem, None)
            .await?;
        let cert = self
            .store
            .update_certificate_material(id, cert_path, key_path, chain_path, bundle.expires_at)
            .await?;

        tracing::info!(
            "Certificate renewed for {} (expires {})",
            cert.domains.join(", "),
            cert.expires_at
        );

        if self.store.hosts_bound_to_certificate(id).await.is_empty() {
            return Ok(MutationOutcome::clean(cert));
        }
        let warning = self.reload_with_warning().await;
        self.fanout.emit_nginx_status().await;
        Ok(MutationOutcome {
            result: cert,
            warning,
        })
    }

    /// Register uploaded PEM material as a certificate entity.
    pub async fn upload_certificate(
        &self,
        req: UploadCertificateRequest,
    ) -> Result<Certificate, AppError> {
        let _guard = self.lock.lock().await;

        for domain in &req.domains {
            crate::store::validate_domain(domain)?;
        }
        if req.domains.is_empty() {
            return Err(AppError::Validation("at least one domain is required".into()));
        }
        let expires_at = acme::parse_not_after(&req.certificate).ok_or_else(|| {
            AppError::Validation("certificate PEM could not be parsed".into())
        })?;

        let id = Uuid::new_v4();
        let (cert_path, key_path, chain_path) = self
            .fsops
            .write_cert_files(
                &acme::material_id(id),
                &req.certificate,
                &req.private_key,
                req.chain.as_deref(),
            )
            .await?;

        let now = chrono::Utc::now();
        let cert = Certificate {
            id,
            name: req.name,
            domains: req.domains,
            cert_path,
            key_path,
            chain_path,
            provenance: CertProvenance::Uploaded,
            expires_at,
            auto_renew: false,
            dns_challenge: None,
            tag_ids: vec![],
            created_at: now,
            updated_at: now,
        };
        let cert = self.store.insert_certificate(cert).await;
        tracing::info!("Certificate uploaded: {} ({})", cert.name, cert.id);
        Ok(cert)
    }

    /// Generate a self-signed certificate entity.
    pub async fn create_self_signed(
        &self,
        agent: &AcmeAgent,
        req: SelfSignedRequest,
    ) -> Result<Certificate, AppError> {
        let _guard = self.lock.lock().await;

        for domain in &req.domains {
            crate::store::validate_domain(domain)?;
        }
        let bundle = agent.self_signed(&req.domains)?;

        let id = Uuid::new_v4();
        let (cert_path, key_path, chain_path) = self
            .fsops
            .write_cert_files(&acme::material_id(id), &bundle.cert_pem, &bundle.key_pem, None)
            .await?;

        let now = chrono::Utc::now();
        let cert = Certificate {
            id,
            name: req.name,
            domains: req.domains,
            cert_path,
            key_path,
            chain_path,
            provenance: CertProvenance::SelfSigned,
            expires_at: bundle.expires_at,
            auto_renew: false,
            dns_challenge: None,
            tag_ids: vec![],
            created_at: now,
            updated_at: now,
        };
        let cert = self.store.insert_certificate(cert).await;
        tracing::info!("Self-signed certificate created: {} ({})", cert.name, cert.id);
        Ok(cert)
    }

    /// Destroy an unreferenced certificate and its on-disk material.
    pub async fn delete_certificate(&self, id: Uuid) -> Result<Certificate, AppError> {
        let _guard = self.lock.lock().await;

        let cert = self.store.remove_certificate(id).await?;
        self.fsops.remove_cert_files(&acme::material_id(id)).await;
        tracing::info!("Certificate deleted: {} ({})", cert.name, cert.id);
        Ok(cert)
    }

    // ------------------------------------------------------------------
    // Default route and maintenance
    // ------------------------------------------------------------------

    pub async fn set_default_route(
        &self,
        req: UpdateDefaultRouteRequest,
    ) -> Result<MutationOutcome<DefaultRoute>, AppError> {
        let _guard = self.lock.lock().await;

        validate_default_route(&req)?;
        let stash = self.store.stash_route_state().await;
        let fragment_stash = self.fsops.stash(render::DEFAULT_ROUTE_FILE).await;
        let route = DefaultRoute {
            enabled: req.enabled,
            mode: req.mode,
            target: req.target,
            status_code: req.status_code,
            custom_html: req.custom_html,
            error_pages: req.error_pages,
            updated_at: chrono::Utc::now(),
        };
        let route = self.store.stage_set_default_route(route).await;

        let result: Result<(), AppError> = async {
            self.materialize_default_route(&route).await?;
            self.nginx.validate().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.store.restore_route_state(stash).await;
            self.fsops.restore(&fragment_stash).await.ok();
            return Err(e);
        }

        let warning = self.reload_with_warning().await;
        self.store.persist_route_state().await;
        self.fanout.emit_nginx_status().await;

        tracing::info!("Default route updated (mode: {:?})", route.mode);
        Ok(MutationOutcome {
            result: route,
            warning,
        })
    }

    /// Enable or disable maintenance. Enabling shadows the default route
    /// with a maintenance page and saves the prior route to the backup
    /// slot; disabling restores it byte-identically.
    pub async fn set_maintenance(
        &self,
        req: UpdateMaintenanceRequest,
    ) -> Result<MutationOutcome<Maintenance>, AppError> {
        let _guard = self.lock.lock().await;

        let message = req.message.unwrap_or_default();
        let stash = self.store.stash_route_state().await;
        let fragment_stash = self.fsops.stash(render::DEFAULT_ROUTE_FILE).await;

        let shadow = if req.enabled {
            Some(DefaultRoute {
                enabled: true,
                mode: DefaultRouteMode::CustomHtml,
                target: None,
                status_code: None,
                custom_html: Some(render::maintenance_html(&message)),
                error_pages: Default::default(),
                updated_at: chrono::Utc::now(),
            })
        } else {
            None
        };

        let route = self
            .store
            .stage_set_maintenance(req.enabled, message.clone(), shadow)
            .await;

        let result: Result<(), AppError> = async {
            self.materialize_default_route(&route).await?;
            self.nginx.validate().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.store.restore_route_state(stash).await;
            self.fsops.restore(&fragment_stash).await.ok();
            return Err(e);
        }

        let warning = self.reload_with_warning().await;
        self.store.persist_route_state().await;

        let maintenance = self.store.get_maintenance().await;
        self.fanout.emit_maintenance(&maintenance).await;
        self.fanout.emit_nginx_status().await;

        tracing::info!("Maintenance mode: {}", maintenance.enabled);
        Ok(MutationOutcome {
            result: maintenance,
            warning,
        })
    }

    // ------------------------------------------------------------------
    // Import
    // ------------------------------------------------------------------

    /// Import host records. Each item gets its own stage + materialize +
    /// validate pass so a broken record rolls back alone; the batch
    /// reports per-item errors instead of aborting.
    pub async fn import_hosts(&self, req: ImportRequest) -> ImportReport {
        let _guard = self.lock.lock().await;
        let mut report = ImportReport::default();
        let mut any_applied = false;

        for item in req.hosts {
            let domain = item.domain.clone();
            match self.import_one(item, req.overwrite).await {
                Ok(ImportOutcomeKind::Imported) => {
                    report.imported += 1;
                    any_applied = true;
                }
                Ok(ImportOutcomeKind::Skipped) => report.skipped += 1,
                Err(e) => report.errors.push(format!("{}: {}", domain, e)),
            }
        }

        if any_applied {
            let warning = self.reload_with_warning().await;
            if let Some(warning) = warning {
                report.errors.push(warning);
            }
            self.store.persist_hosts().await;
            self.fanout.emit_nginx_status().await;
        }
        report
    }

    async fn import_one(
        &self,
        item: crate::models::ImportHost,
        overwrite: bool,
    ) -> Result<ImportOutcomeKind, AppError> {
        let outcome = self.store.stage_import_host(item, overwrite).await?;
        let (host, rollback): (ProxyHost, ImportRollback) = match outcome {
            ImportOutcome::Skipped => return Ok(ImportOutcomeKind::Skipped),
            ImportOutcome::Created(host) => {
                let rollback = ImportRollback::Discard(host.id);
                (host, rollback)
            }
            ImportOutcome::Updated { new, prev } => (new, ImportRollback::Restore(prev)),
        };

        let name = render::host_filename(&host.domain);
        let stash = self.fsops.stash(&name).await;

        let result: Result<(), AppError> = async {
            self.materialize_host(&host).await?;
            self.nginx.validate().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            match rollback {
                ImportRollback::Discard(id) => self.store.discard_host(id).await,
                ImportRollback::Restore(prev) => self.store.restore_host(prev).await,
            }
            self.fsops.restore(&stash).await.ok();
            return Err(e);
        }
        Ok(ImportOutcomeKind::Imported)
    }

    // ------------------------------------------------------------------
    // Direct nginx operations
    // ------------------------------------------------------------------

    /// Validate the live configuration without mutating anything.
    pub async fn validate_config(&self) -> Result<String, AppError> {
        let _guard = self.lock.lock().await;
        self.nginx.validate().await
    }

    /// Operator-requested reload; exclusive like every nginx invocation.
    pub async fn reload(&self) -> Result<String, AppError> {
        let _guard = self.lock.lock().await;
        let result = self.nginx.reload().await;
        self.fanout.emit_nginx_status().await;
        result
    }

    /// Re-materialize every fragment from persisted state. Run at startup
    /// so the filesystem matches the store across restarts.
    pub async fn reconcile_filesystem(&self) -> Result<(), AppError> {
        let _guard = self.lock.lock().await;

        for host in self.store.list_hosts().await {
            self.materialize_host(&host).await?;
        }
        let route = self.store.get_default_route().await;
        self.materialize_default_route(&route).await?;

        match self.nginx.validate().await {
            Ok(_) => {
                if let Err(e) = self.nginx.reload().await {
                    tracing::warn!("Startup reload failed (non-fatal): {}", e);
                }
            }
            Err(e) => tracing::warn!("Startup validation failed (non-fatal): {}", e),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn materialize_host(&self, host: &ProxyHost) -> Result<(), AppError> {
        let cert = self.store.certificate_for(host).await;
        let content = render::render_proxy_host(host, cert.as_ref());
        let name = render::host_filename(&host.domain);
        self.fsops.materialize(&name, &content, host.enabled).await
    }

    async fn materialize_default_route(&self, route: &DefaultRoute) -> Result<(), AppError> {
        if !route.enabled {
            return self.fsops.withdraw(render::DEFAULT_ROUTE_FILE).await;
        }

        if let Some(body) = route.custom_html.as_deref() {
            self.fsops.write_html_body("nubi_default.html", body).await?;
        }
        for (code, body) in &route.error_pages {
            self.fsops
                .write_html_body(&format!("nubi_error_{}.html", code), body)
                .await?;
        }

        let html_dir = self.fsops.html_dir();
        let content = render::render_default_route(route, &html_dir.to_string_lossy());
        self.fsops
            .materialize(render::DEFAULT_ROUTE_FILE, &content, true)
            .await
    }

    /// Reload after a successful validate. Failure does not unwind the
    /// mutation: the filesystem is the desired state and a retry is safe.
    async fn reload_with_warning(&self) -> Option<String> {
        match self.nginx.reload().await {
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Reload after mutation failed: {}", e);
                Some(format!("configuration saved but reload failed: {}", e))
            }
        }
    }

    pub async fn nginx_status(&self) -> NginxStatus {
        // Status is a read; it does not take the mutation lock.
        let running = self.nginx.running().await;
        let config_valid = self.nginx.validate().await.is_ok();
        let version = self.nginx.version().await.ok();
        NginxStatus {
            running,
            config_valid,
            version,
        }
    }
}

enum ImportRollback {
    Discard(Uuid),
    Restore(ProxyHost),
}

enum ImportOutcomeKind {
    Imported,
    Skipped,
}

fn validate_default_route(req: &UpdateDefaultRouteRequest) -> Result<(), AppError> {
    match req.mode {
        DefaultRouteMode::Proxy | DefaultRouteMode::Redirect => {
            let target = req
                .target
                .as_deref()
                .ok_or_else(|| AppError::Validation("target is required for this mode".into()))?;
            if req.mode == DefaultRouteMode::Proxy
                && !target.starts_with("http://")
                && !target.starts_with("https://")
            {
                return Err(AppError::Validation(
                    "proxy target must start with http:// or https://".into(),
                ));
            }
            Ok(())
        }
        DefaultRouteMode::ErrorCode => {
            let code = req
                .status_code
                .ok_or_else(|| AppError::Validation("statusCode is required".into()))?;
            if !(100..=599).contains(&code) {
                return Err(AppError::Validation(format!(
                    "statusCode out of range: {}",
                    code
                )));
            }
            Ok(())
        }
        DefaultRouteMode::CustomHtml => {
            if req.custom_html.as_deref().unwrap_or("").is_empty() {
                return Err(AppError::Validation("customHtml is required".into()));
            }
            Ok(())
        }
        DefaultRouteMode::NginxDefault => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Backend, ImportHost, LbMethod};
    use crate::nginx::NginxSupervisor;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::fs;

    struct MockNginx {
        fail_validate: AtomicBool,
        fail_reload: AtomicBool,
        validates: AtomicUsize,
        reloads: AtomicUsize,
    }

    impl MockNginx {
        fn new() -> Self {
            Self {
                fail_validate: AtomicBool::new(false),
                fail_reload: AtomicBool::new(false),
                validates: AtomicUsize::new(0),
                reloads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl NginxControl for MockNginx {
        async fn validate(&self) -> Result<String, AppError> {
            self.validates.fetch_add(1, Ordering::SeqCst);
            if self.fail_validate.load(Ordering::SeqCst) {
                Err(AppError::ConfigInvalid(
                    "nginx: [emerg] unknown directive \"this\"".into(),
                ))
            } else {
                Ok("nginx: configuration file test is successful".into())
            }
        }

        async fn reload(&self) -> Result<String, AppError> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            if self.fail_reload.load(Ordering::SeqCst) {
                Err(AppError::ReloadFailed("signal process started".into()))
            } else {
                Ok(String::new())
            }
        }

        async fn version(&self) -> Result<String, AppError> {
            Ok("1.24.0".into())
        }

        async fn running(&self) -> bool {
            true
        }
    }

    struct Harness {
        _root: TempDir,
        fsops: Arc<Reconciler>,
        store: Arc<StateStore>,
        nginx: Arc<MockNginx>,
        orchestrator: Orchestrator,
    }

    async fn harness() -> Harness {
        let root = TempDir::new().unwrap();
        let fsops = Arc::new(Reconciler::new(
            root.path().join("sites-available").to_str().unwrap(),
            root.path().join("sites-enabled").to_str().unwrap(),
            root.path().join("data").to_str().unwrap(),
        ));
        let store = Arc::new(StateStore::load(fsops.clone()).await);
        let nginx = Arc::new(MockNginx::new());
        // The fanout's own scrapes hit nothing in tests; events go to an
        // empty sink set.
        let scraper = Arc::new(NginxSupervisor::new(
            "/nonexistent/nginx",
            "/nonexistent/nginx.pid",
            "http://127.0.0.1:1/.nubi/status",
            "eth0",
        ));
        let fanout = Arc::new(Fanout::new(store.clone(), scraper, 5));
        let orchestrator = Orchestrator::new(
            store.clone(),
            fsops.clone(),
            nginx.clone(),
            fanout,
        );
        Harness {
            _root: root,
            fsops,
            store,
            nginx,
            orchestrator,
        }
    }

    fn create_req(domain: &str) -> CreateHostRequest {
        CreateHostRequest {
            domain: domain.to_string(),
            target: Some("http://127.0.0.1:3000".to_string()),
            backends: vec![],
            lb_method: LbMethod::RoundRobin,
            ssl: false,
            force_ssl: false,
            certificate_id: None,
            websocket: true,
            maintenance: false,
            enabled: true,
            custom_nginx: None,
            tag_ids: vec![],
        }
    }

    #[tokio::test]
    async fn test_create_host_materializes_validates_reloads() {
        let h = harness().await;

        let outcome = h
            .orchestrator
            .create_host(create_req("api.example.com"))
            .await
            .unwrap();
        assert!(outcome.warning.is_none());

        let name = "nubi-host-api_example_com.conf";
        let content = fs::read_to_string(h.fsops.available_path(name)).await.unwrap();
        assert_eq!(content.matches("server {").count(), 1);
        assert!(content.contains("listen 80;"));
        assert!(content.contains("proxy_pass http://127.0.0.1:3000;"));
        assert!(content.contains("proxy_set_header Upgrade $http_upgrade;"));
        assert!(fs::symlink_metadata(h.fsops.enabled_path(name)).await.is_ok());

        assert_eq!(h.nginx.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.list_hosts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_rolls_back_file_and_state() {
        let h = harness().await;

        let created = h
            .orchestrator
            .create_host(create_req("api.example.com"))
            .await
            .unwrap()
            .result;
        let name = "nubi-host-api_example_com.conf";
        let before = fs::read(h.fsops.available_path(name)).await.unwrap();
        let reloads_before = h.nginx.reloads.load(Ordering::SeqCst);

        h.nginx.fail_validate.store(true, Ordering::SeqCst);
        let err = h
            .orchestrator
            .update_host(
                created.id,
                UpdateHostRequest {
                    custom_nginx: Some(Some("this is not nginx syntax ;;;".into())),
                    ..Default::default()
                },
            )
            .await;

        match err {
            Err(AppError::ConfigInvalid(diag)) => assert!(diag.contains("unknown directive")),
            other => panic!("expected ConfigInvalid, got {:?}", other.map(|_| ())),
        }

        // On-disk fragment reverts bit-identically.
        let after = fs::read(h.fsops.available_path(name)).await.unwrap();
        assert_eq!(before, after);
        // Store entity unchanged.
        let host = h.store.get_host(created.id).await.unwrap();
        assert!(host.custom_nginx.is_none());
        assert_eq!(host.updated_at, created.updated_at);
        // No reload was attempted.
        assert_eq!(h.nginx.reloads.load(Ordering::SeqCst), reloads_before);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_no_fragment() {
        let h = harness().await;
        h.nginx.fail_validate.store(true, Ordering::SeqCst);

        let err = h.orchestrator.create_host(create_req("bad.example.com")).await;
        assert!(matches!(err, Err(AppError::ConfigInvalid(_))));

        let name = "nubi-host-bad_example_com.conf";
        assert!(fs::metadata(h.fsops.available_path(name)).await.is_err());
        assert!(h.store.list_hosts().await.is_empty());
    }

    #[tokio::test]
    async fn test_reload_failure_commits_with_warning() {
        let h = harness().await;
        h.nginx.fail_reload.store(true, Ordering::SeqCst);

        let outcome = h
            .orchestrator
            .create_host(create_req("api.example.com"))
            .await
            .unwrap();
        assert!(outcome.warning.is_some());
        // State committed despite the failed reload.
        assert_eq!(h.store.list_hosts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_domain_rename_withdraws_old_fragment() {
        let h = harness().await;

        let created = h
            .orchestrator
            .create_host(create_req("old.example.com"))
            .await
            .unwrap()
            .result;
        let old_name = "nubi-host-old_example_com.conf";
        assert!(fs::metadata(h.fsops.available_path(old_name)).await.is_ok());

        h.orchestrator
            .update_host(
                created.id,
                UpdateHostRequest {
                    domain: Some("new.example.com".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let new_name = "nubi-host-new_example_com.conf";
        assert!(fs::metadata(h.fsops.available_path(old_name)).await.is_err());
        assert!(fs::metadata(h.fsops.available_path(new_name)).await.is_ok());
    }

    #[tokio::test]
    async fn test_load_balanced_fragment() {
        let h = harness().await;

        let mut req = create_req("lb.example.com");
        req.target = None;
        req.websocket = false;
        req.backends = vec![
            Backend {
                address: "10.0.0.1:80".into(),
                weight: 3,
                backup: false,
            },
            Backend {
                address: "10.0.0.2:80".into(),
                weight: 1,
                backup: true,
            },
        ];
        req.lb_method = LbMethod::LeastConn;
        h.orchestrator.create_host(req).await.unwrap();

        let content = fs::read_to_string(
            h.fsops.available_path("nubi-host-lb_example_com.conf"),
        )
        .await
        .unwrap();
        assert!(content.contains("upstream nubi_lb_example_com {"));
        assert!(content.contains("least_conn;"));
        assert!(content.contains("server 10.0.0.1:80 weight=3;"));
        assert!(content.contains("server 10.0.0.2:80 backup;"));
        assert!(content.contains("proxy_pass http://nubi_lb_example_com;"));
    }

    #[tokio::test]
    async fn test_maintenance_shadows_and_restores_default_route() {
        let h = harness().await;

        h.orchestrator
            .set_default_route(UpdateDefaultRouteRequest {
                enabled: true,
                mode: DefaultRouteMode::Proxy,
                target: Some("http://127.0.0.1:9000".into()),
                status_code: None,
                custom_html: None,
                error_pages: Default::default(),
            })
            .await
            .unwrap();
        let before = fs::read(h.fsops.available_path(render::DEFAULT_ROUTE_FILE))
            .await
            .unwrap();

        h.orchestrator
            .set_maintenance(UpdateMaintenanceRequest {
                enabled: true,
                message: Some("Be right back".into()),
            })
            .await
            .unwrap();

        let state = h.store.get_maintenance_state().await;
        let backup = state.backup.expect("prior route saved to backup slot");
        assert_eq!(backup.mode, DefaultRouteMode::Proxy);
        assert_eq!(backup.target.as_deref(), Some("http://127.0.0.1:9000"));

        let shadowed = fs::read_to_string(h.fsops.available_path(render::DEFAULT_ROUTE_FILE))
            .await
            .unwrap();
        assert!(shadowed.contains("try_files /nubi_default.html =404;"));
        let body = fs::read_to_string(h.fsops.html_dir().join("nubi_default.html"))
            .await
            .unwrap();
        assert!(body.contains("Be right back"));

        h.orchestrator
            .set_maintenance(UpdateMaintenanceRequest {
                enabled: false,
                message: None,
            })
            .await
            .unwrap();
        let restored = fs::read(h.fsops.available_path(render::DEFAULT_ROUTE_FILE))
            .await
            .unwrap();
        assert_eq!(before, restored);
    }

    #[tokio::test]
    async fn test_import_counts_and_conflict() {
        let h = harness().await;

        h.orchestrator
            .create_host(create_req("a.example.com"))
            .await
            .unwrap();
        let existing = h.store.find_host_by_domain("a.example.com").await.unwrap();

        let item = |domain: &str, target: &str| ImportHost {
            id: None,
            domain: domain.into(),
            target: Some(target.into()),
            backends: vec![],
            lb_method: LbMethod::RoundRobin,
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

        let report = h
            .orchestrator
            .import_hosts(ImportRequest {
                hosts: vec![
                    item("a.example.com", "http://x:1"),
                    item("b.example.com", "http://y:2"),
                ],
                overwrite: false,
            })
            .await;

        assert_eq!(report.imported, 1);
        assert_eq!(report.skipped, 1);
        assert!(report.errors.is_empty());
        assert!(h.store.find_host_by_domain("b.example.com").await.is_some());
        let unchanged = h.store.get_host(existing.id).await.unwrap();
        assert_eq!(unchanged.target.as_deref(), Some("http://127.0.0.1:3000"));
    }

    #[tokio::test]
    async fn test_apply_certificate_regenerates_fragments() {
        let h = harness().await;
        let now = chrono::Utc::now();

        let cert = h
            .store
            .insert_certificate(crate::models::Certificate {
                id: Uuid::new_v4(),
                name: "wild".into(),
                domains: vec!["*.example.com".into()],
                cert_path: "/var/lib/nubi/certs/x.crt".into(),
                key_path: "/var/lib/nubi/certs/x.key".into(),
                chain_path: None,
                provenance: crate::models::CertProvenance::AcmeIssued,
                expires_at: now,
                auto_renew: true,
                dns_challenge: None,
                tag_ids: vec![],
                created_at: now,
                updated_at: now,
            })
            .await;

        let host = h
            .orchestrator
            .create_host(create_req("api.example.com"))
            .await
            .unwrap()
            .result;

        let outcome = h
            .orchestrator
            .apply_certificate(
                cert.id,
                ApplyCertificateRequest {
                    host_ids: vec![host.id],
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.result.len(), 1);
        assert!(outcome.result[0].ssl);

        let content = fs::read_to_string(
            h.fsops.available_path("nubi-host-api_example_com.conf"),
        )
        .await
        .unwrap();
        assert!(content.contains("listen 443 ssl http2;"));
        assert!(content.contains("ssl_certificate /var/lib/nubi/certs/x.crt;"));
    }
}
