//! DuckDNS DNS-01 provider
//!
//! DuckDNS manages one TXT record per subdomain through a simple GET API;
//! `clear=true` removes it.

use async_trait::async_trait;

use super::{DnsProvider, ProviderConfig};
use crate::error::AppError;

const API_BASE: &str = "https://www.duckdns.org/update";

pub struct DuckDnsProvider {
    client: reqwest::Client,
}

impl DuckDnsProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn call(&self, query: &[(&str, &str)]) -> Result<(), AppError> {
        let response = self
            .client
            .get(API_BASE)
            .query(query)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| AppError::Acme(format!("DuckDNS request failed: {}", e)))?;

        let body = response
            .text()
            .await
            .map_err(|e| AppError::Acme(format!("DuckDNS response read failed: {}", e)))?;

        if body.trim().starts_with("OK") {
            Ok(())
        } else {
            Err(AppError::Acme(format!("DuckDNS rejected the update: {}", body.trim())))
        }
    }
}

impl Default for DuckDnsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsProvider for DuckDnsProvider {
    fn name(&self) -> &'static str {
        "duckdns"
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["token", "subdomain"]
    }

    async fn publish_txt(
        &self,
        config: &ProviderConfig,
        record: &str,
        value: &str,
    ) -> Result<(), AppError> {
        let token = field(config, "token")?;
        let subdomain = field(config, "subdomain")?;

        self.call(&[
            ("domains", subdomain),
            ("token", token),
            ("txt", value),
            ("verbose", "true"),
        ])
        .await?;
        tracing::info!("DuckDNS TXT published for {} ({})", subdomain, record);
        Ok(())
    }

    async fn cleanup_txt(&self, config: &ProviderConfig, _record: &str) -> Result<(), AppError> {
        let token = field(config, "token")?;
        let subdomain = field(config, "subdomain")?;

        self.call(&[
            ("domains", subdomain),
            ("token", token),
            ("txt", ""),
            ("clear", "true"),
        ])
        .await
    }
}

fn field<'a>(config: &'a ProviderConfig, name: &str) -> Result<&'a str, AppError> {
    config
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| AppError::Validation(format!("{} is required for DuckDNS", name)))
}
