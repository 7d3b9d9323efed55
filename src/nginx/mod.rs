//! Nginx supervisor
//!
//! Drives the nginx binary as a child process (`-t`, `-s reload`, `-v`),
//! scrapes the stub-status endpoint and reads process/interface metrics.
//! Orchestration consumes it through the `NginxControl` trait so the
//! reload barrier is testable without a running nginx.

pub mod procfs;

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::AppError;
use crate::models::{NetCounters, NginxStatus, StubStatus};

/// Deadline for every nginx child invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the stub-status scrape.
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(2);

/// Control operations the orchestrator needs from nginx.
#[async_trait]
pub trait NginxControl: Send + Sync {
    /// Run `nginx -t`. Ok carries the combined diagnostic output; Err is
    /// `ConfigInvalid` carrying the same text.
    async fn validate(&self) -> Result<String, AppError>;

    /// Run `nginx -s reload`.
    async fn reload(&self) -> Result<String, AppError>;

    /// Run `nginx -v` and return the version string.
    async fn version(&self) -> Result<String, AppError>;

    /// Whether the master process is alive (pidfile probe).
    async fn running(&self) -> bool;
}

pub struct NginxSupervisor {
    binary: String,
    pidfile: PathBuf,
    stub_status_url: String,
    interface: String,
    client: reqwest::Client,
}

impl NginxSupervisor {
    pub fn new(binary: &str, pidfile: &str, stub_status_url: &str, interface: &str) -> Self {
        Self {
            binary: binary.to_string(),
            pidfile: PathBuf::from(pidfile),
            stub_status_url: stub_status_url.to_string(),
            interface: interface.to_string(),
            client: reqwest::Client::builder()
                .timeout(SCRAPE_TIMEOUT)
                .build()
                .unwrap(),
        }
    }

    /// Run the binary with a deadline, returning success flag and combined
    /// stdout+stderr so callers can surface nginx's own diagnostics.
    async fn run(&self, args: &[&str]) -> Result<(bool, String), AppError> {
        let result = timeout(
            COMMAND_TIMEOUT,
            Command::new(&self.binary).args(args).output(),
        )
        .await
        .map_err(|_| {
            AppError::Transient(format!("nginx {} timed out", args.join(" ")))
        })?;

        let output = result
            .map_err(|e| AppError::Transient(format!("failed to run {}: {}", self.binary, e)))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        Ok((output.status.success(), text.trim().to_string()))
    }

    /// Aggregate probe + validate + version into one status record.
    pub async fn status(&self) -> NginxStatus {
        let running = self.running().await;
        let config_valid = self.validate().await.is_ok();
        let version = self.version().await.ok();
        NginxStatus {
            running,
            config_valid,
            version,
        }
    }

    /// GET the stub-status endpoint and parse the counters. Failures are
    /// logged and yield zeroed fields, never errors.
    pub async fn scrape_stub_status(&self) -> StubStatus {
        let body = match self.client.get(&self.stub_status_url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!("stub_status body read failed (non-fatal): {}", e);
                    return StubStatus::default();
                }
            },
            Ok(response) => {
                tracing::debug!(
                    "stub_status returned {} (non-fatal)",
                    response.status()
                );
                return StubStatus::default();
            }
            Err(e) => {
                tracing::debug!("stub_status scrape failed (non-fatal): {}", e);
                return StubStatus::default();
            }
        };
        parse_stub_status(&body)
    }

    pub fn uptime_secs(&self) -> Option<u64> {
        procfs::process_uptime_secs(&self.pidfile)
    }

    pub fn net_counters(&self) -> NetCounters {
        procfs::interface_counters(&self.interface)
    }
}

#[async_trait]
impl NginxControl for NginxSupervisor {
    async fn validate(&self) -> Result<String, AppError> {
        let (ok, output) = self.run(&["-t"]).await?;
        if ok {
            Ok(output)
        } else {
            Err(AppError::ConfigInvalid(output))
        }
    }

    async fn reload(&self) -> Result<String, AppError> {
        let (ok, output) = self.run(&["-s", "reload"]).await?;
        if ok {
            Ok(output)
        } else {
            Err(AppError::ReloadFailed(output))
        }
    }

    async fn version(&self) -> Result<String, AppError> {
        let (ok, output) = self.run(&["-v"]).await?;
        if !ok {
            return Err(AppError::Transient(output));
        }
        // "nginx version: nginx/1.24.0"
        let version = output
            .rsplit("nginx/")
            .next()
            .map(|v| v.split_whitespace().next().unwrap_or(v).to_string())
            .unwrap_or(output);
        Ok(version)
    }

    async fn running(&self) -> bool {
        procfs::pid_alive(&self.pidfile)
    }
}

/// Parse the four-line stub-status format. The scrape's own in-flight
/// request is excluded by subtracting one from `active` and `writing`.
pub fn parse_stub_status(body: &str) -> StubStatus {
    static COUNTERS_RE: OnceLock<Regex> = OnceLock::new();
    let counters_re =
        COUNTERS_RE.get_or_init(|| Regex::new(r"^\s*(\d+)\s+(\d+)\s+(\d+)\s*$").unwrap());

    let mut status = StubStatus::default();

    for line in body.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Active connections:") {
            status.active = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("Reading:") {
            // "Reading: R Writing: W Waiting: Q"
            let nums: Vec<u64> = rest
                .split_whitespace()
                .filter_map(|tok| tok.parse().ok())
                .collect();
            if nums.len() == 3 {
                status.reading = nums[0];
                status.writing = nums[1];
                status.waiting = nums[2];
            }
        } else if let Some(caps) = counters_re.captures(line) {
            status.accepts = caps[1].parse().unwrap_or(0);
            status.handled = caps[2].parse().unwrap_or(0);
            status.requests = caps[3].parse().unwrap_or(0);
        }
    }

    status.active = status.active.saturating_sub(1);
    status.writing = status.writing.saturating_sub(1);
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    const STUB: &str = "Active connections: 291\n\
server accepts handled requests\n\
 16630948 16630948 31070465\n\
Reading: 6 Writing: 179 Waiting: 106\n";

    #[test]
    fn test_parse_stub_status() {
        let status = parse_stub_status(STUB);
        assert_eq!(status.active, 290);
        assert_eq!(status.accepts, 16_630_948);
        assert_eq!(status.handled, 16_630_948);
        assert_eq!(status.requests, 31_070_465);
        assert_eq!(status.reading, 6);
        assert_eq!(status.writing, 178);
        assert_eq!(status.waiting, 106);
    }

    #[test]
    fn test_parse_tolerates_surrounding_whitespace() {
        let padded = "  Active connections: 2 \nserver accepts handled requests\n   10 10 42   \n  Reading: 0 Writing: 1 Waiting: 1  \n";
        let status = parse_stub_status(padded);
        assert_eq!(status.active, 1);
        assert_eq!(status.requests, 42);
        assert_eq!(status.writing, 0);
    }

    #[test]
    fn test_parse_garbage_is_zeroed() {
        let status = parse_stub_status("not a stub status page");
        assert_eq!(status.accepts, 0);
        assert_eq!(status.requests, 0);
        // Self-exclusion saturates at zero rather than underflowing.
        assert_eq!(status.active, 0);
        assert_eq!(status.writing, 0);
    }

    #[tokio::test]
    async fn test_missing_binary_is_transient() {
        let supervisor = NginxSupervisor::new(
            "/nonexistent/nginx",
            "/nonexistent/nginx.pid",
            "http://127.0.0.1:1/.nubi/status",
            "eth0",
        );
        match supervisor.validate().await {
            Err(AppError::Transient(_)) => {}
            other => panic!("expected Transient, got {:?}", other.map(|_| ())),
        }
        assert!(!supervisor.running().await);
    }
}
