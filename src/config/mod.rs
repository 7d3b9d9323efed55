//! Configuration module

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub nginx: NginxConfig,
    #[serde(default)]
    pub acme: AcmeConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default)]
    pub static_dir: Option<String>,
    #[serde(default = "default_access_log")]
    pub access_log: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NginxConfig {
    #[serde(default = "default_nginx_binary")]
    pub binary: String,
    #[serde(default = "default_sites_available")]
    pub sites_available: String,
    #[serde(default = "default_sites_enabled")]
    pub sites_enabled: String,
    #[serde(default = "default_pidfile")]
    pub pidfile: String,
    #[serde(default = "default_stub_status_url")]
    pub stub_status_url: String,
    #[serde(default = "default_interface")]
    pub interface: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcmeConfig {
    /// Use the Let's Encrypt staging directory (untrusted roots).
    #[serde(default)]
    pub staging: bool,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default = "default_propagation_timeout")]
    pub propagation_timeout_secs: u64,
    #[serde(default = "default_renewal_check_hours")]
    pub renewal_check_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_scrape_interval")]
    pub interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            static_dir: None,
            access_log: default_access_log(),
        }
    }
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            binary: default_nginx_binary(),
            sites_available: default_sites_available(),
            sites_enabled: default_sites_enabled(),
            pidfile: default_pidfile(),
            stub_status_url: default_stub_status_url(),
            interface: default_interface(),
        }
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            staging: false,
            contact_email: None,
            propagation_timeout_secs: default_propagation_timeout(),
            renewal_check_hours: default_renewal_check_hours(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scrape_interval(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            nginx: NginxConfig::default(),
            acme: AcmeConfig::default(),
            telemetry: TelemetryConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_addr() -> String {
    ":8080".to_string()
}

fn default_access_log() -> String {
    "/var/log/nginx/access.log".to_string()
}

fn default_nginx_binary() -> String {
    "nginx".to_string()
}

fn default_sites_available() -> String {
    "/etc/nginx/sites-available".to_string()
}

fn default_sites_enabled() -> String {
    "/etc/nginx/sites-enabled".to_string()
}

fn default_pidfile() -> String {
    "/run/nginx.pid".to_string()
}

fn default_stub_status_url() -> String {
    "http://127.0.0.1:80/.nubi/status".to_string()
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_data_dir() -> String {
    "/var/lib/nubi".to_string()
}

fn default_propagation_timeout() -> u64 {
    120
}

fn default_renewal_check_hours() -> u64 {
    12
}

fn default_scrape_interval() -> u64 {
    5
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("NUBI").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize().unwrap_or_default();
        Ok(config)
    }

    /// Normalize a `:8080`-style listen flag to a bindable socket address.
    pub fn listen_addr(&self) -> String {
        if self.server.addr.starts_with(':') {
            format!("0.0.0.0{}", self.server.addr)
        } else {
            self.server.addr.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.addr, ":8080");
        assert_eq!(config.nginx.stub_status_url, "http://127.0.0.1:80/.nubi/status");
        assert_eq!(config.data_dir, "/var/lib/nubi");
        assert_eq!(config.acme.propagation_timeout_secs, 120);
    }

    #[test]
    fn test_listen_addr_normalization() {
        let mut config = Config::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
        config.server.addr = "127.0.0.1:9090".to_string();
        assert_eq!(config.listen_addr(), "127.0.0.1:9090");
    }
}
