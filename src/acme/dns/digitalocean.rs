//! DigitalOcean DNS-01 provider

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DnsProvider, ProviderConfig};
use crate::error::AppError;

const API_BASE: &str = "https://api.digitalocean.com/v2";

pub struct DigitalOceanDnsProvider {
    client: reqwest::Client,
}

impl DigitalOceanDnsProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for DigitalOceanDnsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct DoCreateRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    data: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct DoRecord {
    id: u64,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
}

#[derive(Debug, Deserialize)]
struct DoRecordList {
    domain_records: Vec<DoRecord>,
}

#[async_trait]
impl DnsProvider for DigitalOceanDnsProvider {
    fn name(&self) -> &'static str {
        "digitalocean"
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["api_token", "domain"]
    }

    async fn publish_txt(
        &self,
        config: &ProviderConfig,
        record: &str,
        value: &str,
    ) -> Result<(), AppError> {
        let api_token = field(config, "api_token")?;
        let domain = field(config, "domain")?;
        let name = relative_name(record, domain);

        let url = format!("{}/domains/{}/records", API_BASE, domain);
        let body = DoCreateRecord {
            record_type: "TXT",
            name: &name,
            data: value,
            ttl: 120,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_token)
            .json(&body)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| AppError::Acme(format!("DigitalOcean request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Acme(format!(
                "DigitalOcean error {}: {}",
                status, text
            )));
        }

        tracing::info!("DigitalOcean TXT published: {}", record);
        Ok(())
    }

    async fn cleanup_txt(&self, config: &ProviderConfig, record: &str) -> Result<(), AppError> {
        let api_token = field(config, "api_token")?;
        let domain = field(config, "domain")?;
        let name = relative_name(record, domain);

        let url = format!(
            "{}/domains/{}/records?type=TXT&per_page=200",
            API_BASE, domain
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(api_token)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| AppError::Acme(format!("DigitalOcean request failed: {}", e)))?;

        let list: DoRecordList = response
            .json()
            .await
            .map_err(|e| AppError::Acme(format!("DigitalOcean response parse failed: {}", e)))?;

        for found in list
            .domain_records
            .iter()
            .filter(|r| r.record_type == "TXT" && r.name == name)
        {
            let url = format!("{}/domains/{}/records/{}", API_BASE, domain, found.id);
            if let Err(e) = self
                .client
                .delete(&url)
                .bearer_auth(api_token)
                .timeout(std::time::Duration::from_secs(30))
                .send()
                .await
            {
                tracing::warn!("DigitalOcean TXT cleanup failed (non-fatal): {}", e);
            }
        }
        Ok(())
    }
}

/// DigitalOcean wants the record name relative to the managed domain.
fn relative_name(record: &str, domain: &str) -> String {
    record
        .strip_suffix(&format!(".{}", domain))
        .unwrap_or(record)
        .to_string()
}

fn field<'a>(config: &'a ProviderConfig, name: &str) -> Result<&'a str, AppError> {
    config
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| AppError::Validation(format!("{} is required for DigitalOcean", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_name() {
        assert_eq!(
            relative_name("_acme-challenge.api.example.com", "example.com"),
            "_acme-challenge.api"
        );
        assert_eq!(
            relative_name("_acme-challenge.example.org", "example.com"),
            "_acme-challenge.example.org"
        );
    }
}
