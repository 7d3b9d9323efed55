//! DNS-01 challenge providers
//!
//! Each provider publishes and removes the `_acme-challenge` TXT record
//! through its vendor API. The provider list is fixed at build time; the
//! required configuration field names per provider are exposed so an
//! operator UI can prompt for them.

mod cloudflare;
mod digitalocean;
mod duckdns;

pub use self::cloudflare::CloudflareDnsProvider;
pub use self::digitalocean::DigitalOceanDnsProvider;
pub use self::duckdns::DuckDnsProvider;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde::Serialize;

use crate::error::AppError;

/// Key/value provider credentials, as entered by the operator.
pub type ProviderConfig = HashMap<String, String>;

/// DNS-01 provider trait
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Provider identifier used in requests.
    fn name(&self) -> &'static str;

    /// Configuration field names the provider requires.
    fn required_fields(&self) -> &'static [&'static str];

    /// Publish a TXT record at `record` with `value`.
    async fn publish_txt(
        &self,
        config: &ProviderConfig,
        record: &str,
        value: &str,
    ) -> Result<(), AppError>;

    /// Remove a previously published TXT record. Best effort.
    async fn cleanup_txt(&self, config: &ProviderConfig, record: &str) -> Result<(), AppError>;
}

/// Every supported provider, in UI listing order.
pub fn providers() -> Vec<Box<dyn DnsProvider>> {
    vec![
        Box::new(CloudflareDnsProvider::new()),
        Box::new(DigitalOceanDnsProvider::new()),
        Box::new(DuckDnsProvider::new()),
    ]
}

/// Look up one provider by name.
pub fn provider(name: &str) -> Result<Box<dyn DnsProvider>, AppError> {
    providers()
        .into_iter()
        .find(|p| p.name().eq_ignore_ascii_case(name))
        .ok_or_else(|| AppError::Validation(format!("unknown DNS provider: {}", name)))
}

/// Check that every required field is present and non-empty.
pub fn validate_config(
    provider: &dyn DnsProvider,
    config: &ProviderConfig,
) -> Result<(), AppError> {
    for field in provider.required_fields() {
        match config.get(*field) {
            Some(value) if !value.trim().is_empty() => {}
            _ => {
                return Err(AppError::Validation(format!(
                    "provider {} requires the {} field",
                    provider.name(),
                    field
                )))
            }
        }
    }
    Ok(())
}

/// Provider descriptor for the UI.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub name: String,
    pub required_fields: Vec<String>,
}

pub fn provider_infos() -> Vec<ProviderInfo> {
    providers()
        .iter()
        .map(|p| ProviderInfo {
            name: p.name().to_string(),
            required_fields: p.required_fields().iter().map(|f| f.to_string()).collect(),
        })
        .collect()
}

/// Poll recursive resolvers until the TXT record carrying `value` is
/// visible or `timeout` elapses. The challenge check resolves against
/// 8.8.8.8 and 1.1.1.1 rather than the local resolver so the view matches
/// what the CA will see.
pub async fn wait_for_propagation(
    record: &str,
    value: &str,
    timeout: Duration,
) -> Result<(), AppError> {
    let nameservers = NameServerConfigGroup::from_ips_clear(
        &[
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
        ],
        53,
        true,
    );
    let config = ResolverConfig::from_parts(None, vec![], nameservers);
    let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match resolver.txt_lookup(record.to_string()).await {
            Ok(lookup) => {
                let found = lookup.iter().any(|txt| {
                    txt.iter()
                        .map(|data| String::from_utf8_lossy(data).into_owned())
                        .collect::<String>()
                        == value
                });
                if found {
                    return Ok(());
                }
                tracing::debug!("TXT for {} not propagated yet", record);
            }
            Err(e) => tracing::debug!("TXT lookup for {} failed: {}", record, e),
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(AppError::Acme(format!(
                "DNS propagation for {} timed out",
                record
            )));
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_registry() {
        let names: Vec<_> = providers().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["cloudflare", "digitalocean", "duckdns"]);
        assert!(provider("cloudflare").is_ok());
        assert!(provider("CLOUDFLARE").is_ok());
        assert!(provider("route53").is_err());
    }

    #[test]
    fn test_required_fields_exposed() {
        let infos = provider_infos();
        let cloudflare = infos.iter().find(|i| i.name == "cloudflare").unwrap();
        assert!(cloudflare.required_fields.contains(&"api_token".to_string()));
        assert!(cloudflare.required_fields.contains(&"zone_id".to_string()));
    }

    #[test]
    fn test_validate_config_rejects_missing_fields() {
        let p = provider("cloudflare").unwrap();
        let mut config = ProviderConfig::new();
        assert!(validate_config(p.as_ref(), &config).is_err());

        config.insert("api_token".into(), "tok".into());
        config.insert("zone_id".into(), "  ".into());
        assert!(validate_config(p.as_ref(), &config).is_err());

        config.insert("zone_id".into(), "zone".into());
        assert!(validate_config(p.as_ref(), &config).is_ok());
    }
}
