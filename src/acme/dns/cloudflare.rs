//! Cloudflare DNS-01 provider

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DnsProvider, ProviderConfig};
use crate::error::AppError;

const API_BASE: &str = "https://api.cloudflare.com/client/v4";

pub struct CloudflareDnsProvider {
    client: reqwest::Client,
}

impl CloudflareDnsProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for CloudflareDnsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct CloudflareTxtRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct CloudflareResponse<T> {
    success: bool,
    errors: Vec<CloudflareError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct CloudflareError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct CloudflareRecordId {
    id: String,
}

#[async_trait]
impl DnsProvider for CloudflareDnsProvider {
    fn name(&self) -> &'static str {
        "cloudflare"
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["api_token", "zone_id"]
    }

    async fn publish_txt(
        &self,
        config: &ProviderConfig,
        record: &str,
        value: &str,
    ) -> Result<(), AppError> {
        let api_token = field(config, "api_token")?;
        let zone_id = field(config, "zone_id")?;

        let url = format!("{}/zones/{}/dns_records", API_BASE, zone_id);
        let body = CloudflareTxtRecord {
            record_type: "TXT",
            name: record,
            content: value,
            ttl: 120,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_token))
            .header("Content-Type", "application/json")
            .json(&body)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| AppError::Acme(format!("Cloudflare request failed: {}", e)))?;

        let cf: CloudflareResponse<CloudflareRecordId> = response
            .json()
            .await
            .map_err(|e| AppError::Acme(format!("Cloudflare response parse failed: {}", e)))?;

        if cf.success {
            tracing::info!("Cloudflare TXT published: {}", record);
            Ok(())
        } else {
            Err(AppError::Acme(format!(
                "Cloudflare error: {}",
                join_errors(&cf.errors)
            )))
        }
    }

    async fn cleanup_txt(&self, config: &ProviderConfig, record: &str) -> Result<(), AppError> {
        let api_token = field(config, "api_token")?;
        let zone_id = field(config, "zone_id")?;

        let url = format!(
            "{}/zones/{}/dns_records?type=TXT&name={}",
            API_BASE, zone_id, record
        );
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", api_token))
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| AppError::Acme(format!("Cloudflare request failed: {}", e)))?;

        let cf: CloudflareResponse<Vec<CloudflareRecordId>> = response
            .json()
            .await
            .map_err(|e| AppError::Acme(format!("Cloudflare response parse failed: {}", e)))?;

        if !cf.success {
            return Err(AppError::Acme(format!(
                "Cloudflare error: {}",
                join_errors(&cf.errors)
            )));
        }

        for found in cf.result.unwrap_or_default() {
            let url = format!("{}/zones/{}/dns_records/{}", API_BASE, zone_id, found.id);
            if let Err(e) = self
                .client
                .delete(&url)
                .header("Authorization", format!("Bearer {}", api_token))
                .timeout(std::time::Duration::from_secs(30))
                .send()
                .await
            {
                tracing::warn!("Cloudflare TXT cleanup failed (non-fatal): {}", e);
            }
        }
        Ok(())
    }
}

fn field<'a>(config: &'a ProviderConfig, name: &str) -> Result<&'a str, AppError> {
    config
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| AppError::Validation(format!("{} is required for Cloudflare", name)))
}

fn join_errors(errors: &[CloudflareError]) -> String {
    errors
        .iter()
        .map(|e| e.message.clone())
        .collect::<Vec<_>>()
        .join(", ")
}
