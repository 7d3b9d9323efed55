//! Data models for Nubi

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Proxy Host Models
// ============================================================================

/// Load-balancing policy for a multi-backend host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LbMethod {
    #[default]
    #[serde(rename = "round_robin")]
    RoundRobin,
    #[serde(rename = "least_conn")]
    LeastConn,
    #[serde(rename = "ip_hash")]
    IpHash,
}

impl std::fmt::Display for LbMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LbMethod::RoundRobin => write!(f, "round_robin"),
            LbMethod::LeastConn => write!(f, "least_conn"),
            LbMethod::IpHash => write!(f, "ip_hash"),
        }
    }
}

impl std::str::FromStr for LbMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round_robin" => Ok(LbMethod::RoundRobin),
            "least_conn" => Ok(LbMethod::LeastConn),
            "ip_hash" => Ok(LbMethod::IpHash),
            _ => Err(format!("Unknown load-balancing method: {}", s)),
        }
    }
}

/// One upstream server inside a load-balanced host. Order within the host
/// is preserved and significant for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub backup: bool,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyHost {
    pub id: Uuid,
    pub domain: String,
    /// Single-target mode. Mutually exclusive with `backends`.
    #[serde(default)]
    pub target: Option<String>,
    /// Load-balanced mode. Non-empty iff `target` is absent.
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub lb_method: LbMethod,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub force_ssl: bool,
    #[serde(default)]
    pub certificate_id: Option<Uuid>,
    #[serde(default)]
    pub websocket: bool,
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Opaque directive block appended verbatim inside `server{}`.
    #[serde(default)]
    pub custom_nginx: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateHostRequest {
    pub domain: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub lb_method: LbMethod,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub force_ssl: bool,
    #[serde(default)]
    pub certificate_id: Option<Uuid>,
    #[serde(default)]
    pub websocket: bool,
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub custom_nginx: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<Uuid>,
}

/// Partial update. Double-`Option` fields distinguish "leave unchanged"
/// from "clear the value".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateHostRequest {
    pub domain: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub target: Option<Option<String>>,
    pub backends: Option<Vec<Backend>>,
    pub lb_method: Option<LbMethod>,
    pub ssl: Option<bool>,
    pub force_ssl: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    pub certificate_id: Option<Option<Uuid>>,
    pub websocket: Option<bool>,
    pub maintenance: Option<bool>,
    pub enabled: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    pub custom_nginx: Option<Option<String>>,
    pub tag_ids: Option<Vec<Uuid>>,
}

fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: serde::Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    serde::Deserialize::deserialize(de).map(Some)
}

// ============================================================================
// Certificate Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertProvenance {
    Uploaded,
    AcmeIssued,
    SelfSigned,
}

impl std::fmt::Display for CertProvenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertProvenance::Uploaded => write!(f, "uploaded"),
            CertProvenance::AcmeIssued => write!(f, "acme_issued"),
            CertProvenance::SelfSigned => write!(f, "self_signed"),
        }
    }
}

/// DNS-01 provider selection: `{providerName, configKVs}`. Stored with an
/// auto-renewing certificate so the scheduler can renew unattended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsChallenge {
    pub provider_name: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub id: Uuid,
    pub name: String,
    pub domains: Vec<String>,
    pub cert_path: String,
    pub key_path: String,
    #[serde(default)]
    pub chain_path: Option<String>,
    pub provenance: CertProvenance,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub auto_renew: bool,
    /// Challenge settings captured at issuance for unattended renewal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_challenge: Option<DnsChallenge>,
    #[serde(default)]
    pub tag_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upload of existing PEM material.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCertificateRequest {
    pub name: String,
    pub domains: Vec<String>,
    pub certificate: String,
    pub private_key: String,
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub auto_renew: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCertificateRequest {
    pub name: Option<String>,
    pub auto_renew: Option<bool>,
    pub tag_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfSignedRequest {
    pub name: String,
    pub domains: Vec<String>,
}

/// Bind one certificate to many hosts in a single barrier pass.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyCertificateRequest {
    pub host_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalCandidate {
    pub certificate: Certificate,
    pub days_until_expiry: i64,
}

// ============================================================================
// Tag Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTagRequest {
    pub name: String,
    #[serde(default = "default_tag_color")]
    pub color: String,
}

fn default_tag_color() -> String {
    "#808080".to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTagRequest {
    pub name: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagAction {
    Add,
    Remove,
}

/// Idempotent bulk tag application: duplicate adds and missing removes are
/// no-ops, counted as success.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkTagRequest {
    pub action: TagAction,
    pub tag_id: Uuid,
    #[serde(default)]
    pub host_ids: Vec<Uuid>,
    #[serde(default)]
    pub certificate_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkTagResponse {
    pub updated: usize,
}

// ============================================================================
// Default Route Models
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultRouteMode {
    #[default]
    NginxDefault,
    CustomHtml,
    ErrorCode,
    Proxy,
    Redirect,
}

/// Singleton catch-all listener rendered as nginx's `default_server`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultRoute {
    pub enabled: bool,
    pub mode: DefaultRouteMode,
    /// Proxy target or redirect destination, depending on mode.
    #[serde(default)]
    pub target: Option<String>,
    /// Returned status for error-code mode.
    #[serde(default)]
    pub status_code: Option<u16>,
    /// Page body for custom-html mode.
    #[serde(default)]
    pub custom_html: Option<String>,
    /// Per-status-code custom bodies, rendered as `error_page` directives.
    #[serde(default)]
    pub error_pages: BTreeMap<u16, String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for DefaultRoute {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: DefaultRouteMode::NginxDefault,
            target: None,
            status_code: None,
            custom_html: None,
            error_pages: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDefaultRouteRequest {
    pub enabled: bool,
    pub mode: DefaultRouteMode,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub custom_html: Option<String>,
    #[serde(default)]
    pub error_pages: BTreeMap<u16, String>,
}

// ============================================================================
// Maintenance Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Maintenance {
    pub enabled: bool,
    #[serde(default)]
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

impl Default for Maintenance {
    fn default() -> Self {
        Self {
            enabled: false,
            message: String::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Persisted singleton: the maintenance flag and the backup slot holding
/// the default route that maintenance shadowed. They change together under
/// the same barrier pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceState {
    pub maintenance: Maintenance,
    #[serde(default)]
    pub backup: Option<DefaultRoute>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMaintenanceRequest {
    pub enabled: bool,
    #[serde(default)]
    pub message: Option<String>,
}

// ============================================================================
// Nginx Status / Metrics Models
// ============================================================================

/// `nginx_status` event payload. Schema is a wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NginxStatus {
    pub running: bool,
    pub config_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Parsed stub-status counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StubStatus {
    pub active: u64,
    pub accepts: u64,
    pub handled: u64,
    pub requests: u64,
    pub reading: u64,
    pub writing: u64,
    pub waiting: u64,
}

/// Interface byte/packet totals from `/proc/net/dev`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

/// `metrics` event payload. Schema is a wire contract: all integers except
/// the formatted uptime string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub active_connections: u64,
    pub uptime: u64,
    pub uptime_string: String,
    pub reading: u64,
    pub writing: u64,
    pub waiting: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

// ============================================================================
// Access Log Models
// ============================================================================

/// One parsed nginx access-log line. Derived, never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogRecord {
    pub client: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub body_bytes: u64,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
}

// ============================================================================
// Import / Export Models
// ============================================================================

/// One incoming host record. Id and created-at survive a round trip so that
/// importing an export restores the original records.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportHost {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub domain: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub lb_method: LbMethod,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub force_ssl: bool,
    #[serde(default)]
    pub certificate_id: Option<Uuid>,
    #[serde(default)]
    pub websocket: bool,
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub custom_nginx: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<Uuid>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub hosts: Vec<ImportHost>,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}
