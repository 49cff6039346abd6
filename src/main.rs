use std::sync::Arc;
use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::{error, info, warn};

mod actions;
mod api;
mod config;
mod database;
mod detector;
mod dispatcher;
mod errors;
mod events;
mod ingestion;
mod lifecycle;
mod metrics;
mod models;
mod mqtt;
mod storage;
mod utils;
mod websocket;

use config::Config;
use database::{DatabaseProvider, SqliteDatabase};
use detector::{Detector, HttpDetector};
use dispatcher::DetectionDispatcher;
use events::EventBus;
use ingestion::IngestionController;
use lifecycle::{LifecycleDeps, StreamLifecycle};
use metrics::MetricsAggregator;
use mqtt::MqttBridge;
use storage::FrameStorage;

#[derive(Parser, Debug)]
#[command(name = "stream-sentinel", version, about = "Camera stream ingestion and object detection backend")]
struct Args {
    /// Configuration file (TOML or JSON)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the listen address
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the SQLite database path
    #[arg(long)]
    database: Option<String>,

    /// Tracing filter, e.g. "info" or "stream_sentinel=trace"
    #[arg(long, default_value = "stream_sentinel=debug,info")]
    log_level: String,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub database: Arc<dyn DatabaseProvider>,
    pub lifecycle: StreamLifecycle,
    pub dispatcher: Arc<DetectionDispatcher>,
    pub metrics: Arc<MetricsAggregator>,
    pub detector: Arc<dyn Detector>,
    pub storage: FrameStorage,
    pub events: EventBus,
    pub started_at: DateTime<Utc>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let mut config = Config::load(&args.config).unwrap_or_else(|e| {
        warn!("Could not load {} ({}), using default configuration", args.config, e);
        Config::default()
    });
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(database) = args.database {
        config.database.path = database;
    }
    config.ensure_directories()?;

    let db = SqliteDatabase::new(&config.database.path).await?;
    db.initialize().await?;
    let database: Arc<dyn DatabaseProvider> = Arc::new(db);

    // Nothing survives a restart, so any stream left active is stale.
    let reset = database.reset_active_streams().await?;
    if reset > 0 {
        info!("Reset {} stream(s) left active by a previous run", reset);
    }

    let events = EventBus::new(config.server.event_buffer_size);
    let storage = FrameStorage::new(&config.storage.frame_storage_root);
    let detector: Arc<dyn Detector> = Arc::new(HttpDetector::new(&config.detector)?);
    let metrics = Arc::new(MetricsAggregator::new(database.clone(), config.metrics.clone()));
    let dispatcher = Arc::new(DetectionDispatcher::new(
        &config.detector,
        database.clone(),
        detector.clone(),
        storage.clone(),
        events.clone(),
        metrics.clone(),
    ));

    let (ingestion, decoder_exits) = IngestionController::new(config.ingestion.clone());
    let lifecycle = StreamLifecycle::new(
        LifecycleDeps {
            database: database.clone(),
            ingestor: Arc::new(ingestion),
            dispatcher: dispatcher.clone(),
            metrics: metrics.clone(),
            storage: storage.clone(),
            events: events.clone(),
        },
        config.lifecycle.clone(),
    );
    lifecycle.watch_decoder_exits(decoder_exits);

    if let Some(mqtt_config) = config.mqtt.clone().filter(|m| m.enabled) {
        match MqttBridge::new(mqtt_config) {
            Ok(bridge) => {
                bridge.start(&events);
            }
            Err(e) => error!("MQTT bridge disabled: {}", e),
        }
    }

    spawn_retention_task(&config, database.clone(), storage.clone())?;

    let cors_layer = if let Some(origin) = &config.server.cors_allow_origin {
        if origin == "*" {
            tower_http::cors::CorsLayer::permissive()
        } else {
            match origin.parse::<axum::http::HeaderValue>() {
                Ok(origin_header) => {
                    tower_http::cors::CorsLayer::new()
                        .allow_origin(origin_header)
                        .allow_methods(tower_http::cors::Any)
                        .allow_headers(tower_http::cors::Any)
                }
                Err(_) => {
                    warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                    tower_http::cors::CorsLayer::permissive()
                }
            }
        }
    } else {
        tower_http::cors::CorsLayer::permissive()
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState {
        config: Arc::new(config),
        database,
        lifecycle: lifecycle.clone(),
        dispatcher,
        metrics,
        detector,
        storage,
        events,
        started_at: Utc::now(),
    };
    let app = api::router(state).layer(cors_layer);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping all streams");
    lifecycle.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Periodically drop detections and stored frames past the retention window.
fn spawn_retention_task(config: &Config, database: Arc<dyn DatabaseProvider>, storage: FrameStorage) -> Result<()> {
    let retention = utils::parse_duration(&config.storage.detection_retention)?;
    let every = std::time::Duration::from_secs(config.storage.cleanup_interval_hours.max(1) * 3600);

    info!(
        "Detection retention {} with cleanup every {}h",
        config.storage.detection_retention,
        every.as_secs() / 3600
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let cutoff = Utc::now() - retention;
            match database.delete_old_detections(cutoff).await {
                Ok(0) => {}
                Ok(n) => info!("Deleted {} detections older than {}", n, cutoff),
                Err(e) => error!("Detection cleanup failed: {}", e),
            }
            let pruned = storage.prune_older_than(cutoff).await;
            if pruned > 0 {
                info!("Pruned {} stored frames older than {}", pruned, cutoff);
            }
        }
    });
    Ok(())
}
