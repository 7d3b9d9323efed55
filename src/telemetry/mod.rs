//! Telemetry fanout
//!
//! Keeps the registry of subscriber sinks and pushes typed events to all
//! of them: a periodic scrape loop plus immediate emissions after
//! mutations. A sink whose channel is gone is dropped from the registry.
//! Scrape failures degrade to zeroed fields; the timer never stops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use uuid::Uuid;

use crate::models::{Maintenance, MetricsSnapshot, NginxStatus};
use crate::nginx::{procfs, NginxSupervisor};
use crate::store::StateStore;

/// One message on the wire: `{type, payload}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    NginxStatus(NginxStatus),
    MaintenanceMode(MaintenancePayload),
    Metrics(MetricsSnapshot),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenancePayload {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Commands a subscriber may submit over its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberCommand {
    Reload,
    Test,
    GetStatus,
}

pub struct Fanout {
    sinks: RwLock<HashMap<Uuid, mpsc::UnboundedSender<Event>>>,
    store: Arc<StateStore>,
    nginx: Arc<NginxSupervisor>,
    scrape_interval: Duration,
    started_at: Instant,
}

impl Fanout {
    pub fn new(
        store: Arc<StateStore>,
        nginx: Arc<NginxSupervisor>,
        scrape_interval_secs: u64,
    ) -> Self {
        Self {
            sinks: RwLock::new(HashMap::new()),
            store,
            nginx,
            scrape_interval: Duration::from_secs(scrape_interval_secs),
            started_at: Instant::now(),
        }
    }

    /// Register a new subscriber sink.
    pub async fn subscribe(&self) -> (Uuid, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.sinks.write().await.insert(id, tx);
        tracing::debug!("Telemetry subscriber added: {}", id);
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        self.sinks.write().await.remove(&id);
        tracing::debug!("Telemetry subscriber removed: {}", id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.sinks.read().await.len()
    }

    /// Deliver one event to every sink, dropping sinks whose receiving
    /// side is gone.
    pub async fn broadcast(&self, event: Event) {
        let mut dead = Vec::new();
        {
            let sinks = self.sinks.read().await;
            for (id, tx) in sinks.iter() {
                if tx.send(event.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut sinks = self.sinks.write().await;
            for id in dead {
                sinks.remove(&id);
                tracing::debug!("Dropped dead telemetry sink: {}", id);
            }
        }
    }

    /// Event-driven emission after a mutation, bypassing the timer.
    pub async fn emit_nginx_status(&self) {
        let status = self.nginx.status().await;
        self.broadcast(Event::NginxStatus(status)).await;
    }

    pub async fn emit_maintenance(&self, maintenance: &Maintenance) {
        self.broadcast(Event::MaintenanceMode(MaintenancePayload {
            enabled: maintenance.enabled,
            message: if maintenance.message.is_empty() {
                None
            } else {
                Some(maintenance.message.clone())
            },
        }))
        .await;
    }

    pub async fn emit_metrics(&self) {
        let snapshot = self.collect_metrics().await;
        self.broadcast(Event::Metrics(snapshot)).await;
    }

    /// Assemble the metrics payload from the stub-status and interface
    /// scrapes. Failed scrapes leave zeroed fields.
    pub async fn collect_metrics(&self) -> MetricsSnapshot {
        let stub = self.nginx.scrape_stub_status().await;
        let net = self.nginx.net_counters();
        let uptime = self.nginx.uptime_secs();

        MetricsSnapshot {
            active_connections: stub.active,
            uptime: uptime.unwrap_or(0),
            uptime_string: uptime
                .map(procfs::format_uptime)
                .unwrap_or_else(|| "unknown".to_string()),
            reading: stub.reading,
            writing: stub.writing,
            waiting: stub.waiting,
            rx_bytes: net.rx_bytes,
            tx_bytes: net.tx_bytes,
        }
    }

    pub fn daemon_uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Periodic scrape loop. Each tick emits the three event types; a
    /// failed cycle is swallowed so the cadence stays intact.
    pub async fn start(self: Arc<Self>) {
        tracing::info!(
            "Starting telemetry loop ({}s cadence)...",
            self.scrape_interval.as_secs()
        );
        let mut timer = interval(self.scrape_interval);

        loop {
            timer.tick().await;

            if self.subscriber_count().await == 0 {
                continue;
            }

            self.emit_nginx_status().await;
            let maintenance = self.store.get_maintenance().await;
            self.emit_maintenance(&maintenance).await;
            self.emit_metrics().await;
        }
    }
}
