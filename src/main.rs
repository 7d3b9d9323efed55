//! Nubi - nginx control-plane daemon
//!
//! Owns nginx's on-disk site configuration, issues and applies TLS
//! certificates, orchestrates reloads and exposes a real-time status
//! surface to an operator UI.

mod acme;
mod api;
mod config;
mod error;
mod fsops;
mod logs;
mod models;
mod nginx;
mod orchestrator;
mod render;
mod store;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::acme::AcmeAgent;
use crate::api::AppContext;
use crate::fsops::Reconciler;
use crate::nginx::NginxSupervisor;
use crate::orchestrator::Orchestrator;
use crate::store::StateStore;
use crate::telemetry::Fanout;

#[derive(Parser)]
#[command(name = "nubi")]
#[command(version)]
#[command(about = "Control-plane daemon for a local nginx reverse-proxy deployment")]
struct Cli {
    /// Listen address (host:port, or :port for all interfaces)
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,

    /// Operator UI asset directory
    #[arg(long = "static", value_name = "DIR")]
    static_dir: Option<String>,

    /// Path to the nginx binary
    #[arg(long = "nginx-bin", value_name = "PATH")]
    nginx_bin: Option<String>,

    /// Configuration file path
    #[arg(long, default_value = "config/default")]
    config: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("nubi={},tower_http=warn", cli.log_level).into()),
        )
        .init();

    tracing::info!("Starting Nubi v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration; CLI flags override file values
    let mut config = config::Config::load(&cli.config)?;
    if let Some(addr) = cli.addr {
        config.server.addr = addr;
    }
    if let Some(static_dir) = cli.static_dir {
        config.server.static_dir = Some(static_dir);
    }
    if let Some(nginx_bin) = cli.nginx_bin {
        config.nginx.binary = nginx_bin;
    }
    let config = Arc::new(config);
    tracing::info!("Configuration loaded (data dir: {})", config.data_dir);

    // Filesystem reconciler and persisted state
    let fsops = Arc::new(Reconciler::new(
        &config.nginx.sites_available,
        &config.nginx.sites_enabled,
        &config.data_dir,
    ));
    let store = Arc::new(StateStore::load(fsops.clone()).await);

    // Nginx supervisor
    let nginx = Arc::new(NginxSupervisor::new(
        &config.nginx.binary,
        &config.nginx.pidfile,
        &config.nginx.stub_status_url,
        &config.nginx.interface,
    ));

    // Telemetry fanout and the orchestrator (the reload barrier)
    let fanout = Arc::new(Fanout::new(
        store.clone(),
        nginx.clone(),
        config.telemetry.interval_secs,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        fsops.clone(),
        nginx.clone(),
        fanout.clone(),
    ));

    // ACME agent
    let acme = Arc::new(AcmeAgent::new(
        fsops.clone(),
        config.acme.staging,
        config.acme.contact_email.clone(),
        config.acme.propagation_timeout_secs,
    ));

    // Bring the filesystem in line with persisted state after a restart
    match orchestrator.reconcile_filesystem().await {
        Ok(()) => tracing::info!("Filesystem reconciled with persisted state"),
        Err(e) => tracing::warn!("Filesystem reconcile failed (non-fatal): {}", e),
    }

    start_background_tasks(
        fanout.clone(),
        store.clone(),
        orchestrator.clone(),
        acme.clone(),
        config.acme.renewal_check_hours,
    );

    // Build application router
    let ctx = AppContext {
        config: config.clone(),
        store,
        fsops,
        nginx,
        orchestrator,
        fanout,
        acme,
    };

    let cors = CorsLayer::permissive();
    let mut app = api::routes().with_state(ctx).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    );
    if let Some(static_dir) = &config.server.static_dir {
        app = app.fallback_service(ServeDir::new(static_dir));
    }

    // Start server
    let addr = config.listen_addr();
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Start background tasks (telemetry loop, certificate renewal sweep)
fn start_background_tasks(
    fanout: Arc<Fanout>,
    store: Arc<StateStore>,
    orchestrator: Arc<Orchestrator>,
    acme: Arc<AcmeAgent>,
    renewal_check_hours: u64,
) {
    // Telemetry scrape/broadcast loop
    tokio::spawn(async move {
        fanout.start().await;
    });

    // Renewal sweep: scan on a fixed cadence and renew what it reports
    tokio::spawn(async move {
        let mut timer =
            tokio::time::interval(Duration::from_secs(renewal_check_hours * 3600));
        loop {
            timer.tick().await;

            let certs = store.list_certificates().await;
            let due = acme::renewal_scan(&certs, chrono::Utc::now());
            if due.is_empty() {
                continue;
            }
            tracing::info!("Renewal sweep: {} certificate(s) due", due.len());

            for candidate in due {
                let cert = candidate.certificate;
                if cert.dns_challenge.is_none() {
                    tracing::warn!(
                        "Certificate {} is due for renewal but has no stored DNS challenge settings",
                        cert.name
                    );
                    continue;
                }
                match orchestrator.renew_certificate(&acme, cert.id, None).await {
                    Ok(outcome) => {
                        if let Some(warning) = outcome.warning {
                            tracing::warn!("Renewal of {}: {}", cert.name, warning);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Renewal of {} failed: {}", cert.name, e);
                    }
                }
            }
        }
    });

    tracing::info!("Background tasks started");
}
