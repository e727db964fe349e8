//! Envmon server.
//!
//! # API Endpoints
//!
//! - `POST /api/environment` - Record an environment reading
//! - `GET /api/environment` - Paginated environment readings
//! - `GET /api/environment/latest` - Most recent environment reading
//! - `GET /api/environment/range` - Environment readings in a time range
//! - `GET /api/environment/stats` - Aggregates over a lookback period
//! - `POST /api/system/metrics` - Record a system reading
//! - `GET /api/system/latest` - Most recent system reading
//! - `GET /api/system/range` - System readings in a time range
//! - `GET /api/system/devices` - Latest reading per device
//! - `POST /api/system/command` - Relay a command to a device agent
//! - `POST /api/recipients` - Manage notification recipients
//! - `GET /ws` - Live event stream (WebSocket)
//! - `GET /health` - Health check

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use envmon::api::{self, AppState};
use envmon::config::EnvThresholds;
use envmon::cooldown::CooldownGate;
use envmon::ingest::Ingestor;
use envmon::notify::bus::EventBus;
use envmon::notify::email::{EmailConfig, SmtpMailer};
use envmon::notify::report::TextReport;
use envmon::notify::{DEFAULT_COMPANY_NAME, Dispatcher};
use envmon::storage::Storage;

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 5000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:envmon.db?mode=rwc";

/// How often stale cooldown entries are swept.
const PRUNE_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("envmon=info".parse()?))
        .init();

    // Load configuration from environment
    let port: u16 = env::var("ENVMON_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let db_url = env::var("ENVMON_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

    info!(port, db_url = %db_url, "Starting envmon server");

    let storage = Storage::new(&db_url).await?;
    info!("Database initialized");

    let bus = Arc::new(EventBus::default());

    let company_name =
        env::var("COMPANY_NAME").unwrap_or_else(|_| DEFAULT_COMPANY_NAME.to_string());
    let mut dispatcher = Dispatcher::new(Arc::clone(&bus))
        .with_reports(Arc::new(TextReport))
        .with_company_name(company_name);

    match EmailConfig::from_env().map(|config| SmtpMailer::new(&config)) {
        Some(Ok(mailer)) => {
            info!("SMTP mailer configured");
            dispatcher = dispatcher.with_mailer(Arc::new(mailer));
        }
        Some(Err(e)) => warn!(error = %e, "Invalid SMTP configuration, alert emails disabled"),
        None => warn!("SMTP_HOST not set, alert emails disabled"),
    }

    let ingestor = Arc::new(Ingestor::new(
        Arc::new(storage.clone()),
        Arc::clone(&bus),
        Arc::new(EnvThresholds),
        Arc::new(CooldownGate::new()),
        Arc::new(dispatcher),
        Arc::new(storage.clone()),
    ));

    // Sweep cooldown entries past the retention age
    let pruner = Arc::clone(&ingestor);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            let removed = pruner.prune_cooldowns(Utc::now());
            if removed > 0 {
                debug!(removed, "Pruned cooldown entries");
            }
        }
    });

    let state = AppState {
        storage,
        ingestor,
        bus,
    };

    let app = api::router(state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Envmon is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
