//! ACME agent
//!
//! Owns the certificate-issuance lifecycle around the `instant-acme`
//! protocol primitive: the long-lived account credentials under the data
//! directory, DNS-01 challenge publication and propagation, CSR
//! generation, expiry extraction and the renewal scan. The orchestrator
//! serializes every issuance, so provider calls never interleave.

pub mod dns;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use uuid::Uuid;

use crate::error::AppError;
use crate::fsops::Reconciler;
use crate::models::{Certificate, DnsChallenge, RenewalCandidate};

/// Renewal window: certificates closer than this to expiry are reported
/// by the scan.
const RENEWAL_WINDOW_DAYS: i64 = 30;

/// Upper bound used when the issued certificate cannot be parsed,
/// consistent with Let's Encrypt lifetimes.
const FALLBACK_VALIDITY_DAYS: i64 = 90;

/// Issuance request: domains plus the flattened challenge selection.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObtainCertificateRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub domains: Vec<String>,
    #[serde(flatten)]
    pub challenge: DnsChallenge,
    #[serde(default)]
    pub auto_renew: bool,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewCertificateRequest {
    /// Override for the stored challenge settings.
    #[serde(flatten)]
    pub challenge: Option<DnsChallenge>,
}

/// Result of one issuance: full-chain PEM, private key PEM and the
/// extracted expiry.
pub struct IssuedBundle {
    pub cert_pem: String,
    pub key_pem: String,
    pub expires_at: DateTime<Utc>,
}

pub struct AcmeAgent {
    fsops: Arc<Reconciler>,
    staging: bool,
    contact_email: Option<String>,
    propagation_timeout: Duration,
}

impl AcmeAgent {
    pub fn new(
        fsops: Arc<Reconciler>,
        staging: bool,
        contact_email: Option<String>,
        propagation_timeout_secs: u64,
    ) -> Self {
        Self {
            fsops,
            staging,
            contact_email,
            propagation_timeout: Duration::from_secs(propagation_timeout_secs),
        }
    }

    fn directory_url(&self) -> &'static str {
        if self.staging {
            LetsEncrypt::Staging.url()
        } else {
            LetsEncrypt::Production.url()
        }
    }

    /// Load the stored account or register a new one. Credentials live at
    /// `certs/letsencrypt/user.key`, mode 0600.
    async fn account(&self) -> Result<Account, AppError> {
        if let Some(bytes) = self.fsops.read_account_key().await {
            match serde_json::from_slice::<AccountCredentials>(&bytes) {
                Ok(credentials) => {
                    return Account::from_credentials(credentials)
                        .await
                        .map_err(|e| AppError::Acme(format!("account restore failed: {}", e)));
                }
                Err(e) => {
                    tracing::warn!("Stored ACME credentials unreadable ({}), re-registering", e);
                }
            }
        }

        let contact: Vec<String> = self
            .contact_email
            .iter()
            .map(|email| format!("mailto:{}", email))
            .collect();
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            self.directory_url(),
            None,
        )
        .await
        .map_err(|e| AppError::Acme(format!("account registration failed: {}", e)))?;

        let bytes = serde_json::to_vec_pretty(&credentials)?;
        self.fsops.write_account_key(&bytes).await?;
        tracing::info!("Registered ACME account ({})", self.directory_url());
        Ok(account)
    }

    /// Obtain a certificate bundle for one or more domains via DNS-01.
    /// Wildcard identifiers are supported; each authorization publishes a
    /// `_acme-challenge` TXT record through the selected provider.
    pub async fn obtain(
        &self,
        domains: &[String],
        challenge: &DnsChallenge,
    ) -> Result<IssuedBundle, AppError> {
        if domains.is_empty() {
            return Err(AppError::Validation("at least one domain is required".into()));
        }
        let provider = dns::provider(&challenge.provider_name)?;
        dns::validate_config(provider.as_ref(), &challenge.config)?;

        let account = self.account().await?;
        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AppError::Acme(format!("order creation failed: {}", e)))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| AppError::Acme(format!("authorization fetch failed: {}", e)))?;

        // Publish one TXT record per pending authorization.
        let mut published: Vec<(String, String, String)> = Vec::new();
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(AppError::Acme(format!(
                        "authorization in unexpected state: {:?}",
                        status
                    )))
                }
            }

            let challenge_obj = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| {
                    AppError::Acme("server offered no DNS-01 challenge".into())
                })?;

            let Identifier::Dns(domain) = &authz.identifier;
            let record = format!("_acme-challenge.{}", domain.trim_start_matches("*."));
            let value = order.key_authorization(challenge_obj).dns_value();

            provider
                .publish_txt(&challenge.config, &record, &value)
                .await?;
            published.push((record, value, challenge_obj.url.clone()));
        }

        let result = self
            .complete_order(&mut order, &published, domains)
            .await;

        // TXT cleanup is best effort either way.
        for (record, _, _) in &published {
            if let Err(e) = provider.cleanup_txt(&challenge.config, record).await {
                tracing::warn!("TXT cleanup for {} failed (non-fatal): {}", record, e);
            }
        }

        result
    }

    async fn complete_order(
        &self,
        order: &mut instant_acme::Order,
        published: &[(String, String, String)],
        domains: &[String],
    ) -> Result<IssuedBundle, AppError> {
        for (record, value, _) in published {
            dns::wait_for_propagation(record, value, self.propagation_timeout).await?;
        }
        for (_, _, url) in published {
            order
                .set_challenge_ready(url)
                .await
                .map_err(|e| AppError::Acme(format!("challenge submit failed: {}", e)))?;
        }

        // Poll until the CA settles the order.
        let mut tries = 0u32;
        loop {
            let status = order
                .refresh()
                .await
                .map_err(|e| AppError::Acme(format!("order refresh failed: {}", e)))?
                .status;
            match status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    return Err(AppError::Acme("order failed validation".into()))
                }
                _ => {}
            }
            tries += 1;
            if tries > 30 {
                return Err(AppError::Acme("order did not become ready in time".into()));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| AppError::Acme(format!("key generation failed: {}", e)))?;
        let params = rcgen::CertificateParams::new(domains.to_vec())
            .map_err(|e| AppError::Acme(format!("CSR parameters invalid: {}", e)))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| AppError::Acme(format!("CSR generation failed: {}", e)))?;

        order
            .finalize(csr.der())
            .await
            .map_err(|e| AppError::Acme(format!("order finalize failed: {}", e)))?;

        let mut tries = 0u32;
        let cert_pem = loop {
            match order
                .certificate()
                .await
                .map_err(|e| AppError::Acme(format!("certificate download failed: {}", e)))?
            {
                Some(pem) => break pem,
                None => {
                    tries += 1;
                    if tries > 15 {
                        return Err(AppError::Acme(
                            "certificate was not issued in time".into(),
                        ));
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        };

        let expires_at = parse_not_after(&cert_pem).unwrap_or_else(fallback_expiry);

        Ok(IssuedBundle {
            cert_pem,
            key_pem: key_pair.serialize_pem(),
            expires_at,
        })
    }

    /// Generate a self-signed bundle with `rcgen`, no CA involved.
    pub fn self_signed(&self, domains: &[String]) -> Result<IssuedBundle, AppError> {
        if domains.is_empty() {
            return Err(AppError::Validation("at least one domain is required".into()));
        }
        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| AppError::Internal(format!("key generation failed: {}", e)))?;
        let params = rcgen::CertificateParams::new(domains.to_vec())
            .map_err(|e| AppError::Validation(format!("invalid certificate names: {}", e)))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| AppError::Internal(format!("self-signing failed: {}", e)))?;

        let cert_pem = cert.pem();
        let expires_at = parse_not_after(&cert_pem).unwrap_or_else(fallback_expiry);
        Ok(IssuedBundle {
            cert_pem,
            key_pem: key_pair.serialize_pem(),
            expires_at,
        })
    }
}

/// Read `notAfter` from the leaf certificate of a PEM bundle.
pub fn parse_not_after(pem: &str) -> Option<DateTime<Utc>> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).ok()?;
    let cert = parsed.parse_x509().ok()?;
    let timestamp = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(timestamp, 0)
}

fn fallback_expiry() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::days(FALLBACK_VALIDITY_DAYS)
}

/// Read-only renewal scan: auto-renewing ACME certificates within the
/// renewal window (or already expired).
pub fn renewal_scan(certs: &[Certificate], now: DateTime<Utc>) -> Vec<RenewalCandidate> {
    certs
        .iter()
        .filter(|c| {
            c.auto_renew
                && c.provenance == crate::models::CertProvenance::AcmeIssued
                && (c.expires_at - now) < chrono::Duration::days(RENEWAL_WINDOW_DAYS)
        })
        .map(|c| RenewalCandidate {
            days_until_expiry: (c.expires_at - now).num_days(),
            certificate: c.clone(),
        })
        .collect()
}

/// Deterministic on-disk identity for certificate material.
pub fn material_id(cert_id: Uuid) -> String {
    cert_id.simple().to_string()
}
