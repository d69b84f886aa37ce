pub mod cli;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod cooldown;
pub mod cycle;
pub mod db;
pub mod deploy;
pub mod handlers;
pub mod learning;
pub mod middleware;
pub mod quality;
pub mod shutdown;
pub mod tasks;
pub mod test_utils;
pub mod validation;

pub use db::{query_audit_logs, write_audit_log, AuditLogEntry, SqliteDataStore};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use virtuous_shared::{
    AlertSink, ConfigTarget, LiveConfiguration, Optimizer, QualityDataStore, QualityMeasurement,
    TelemetrySource, VirtuousError,
};

use crate::clock::Clock;
use crate::cooldown::CooldownRegistry;
use crate::cycle::CycleOrchestrator;
use crate::deploy::{ChangeLedger, DeploymentGovernor};
use crate::learning::LearningStore;
use crate::quality::{AlertDispatcher, ThresholdMonitor};
use crate::shutdown::Shutdown;

const MEASUREMENT_CHANNEL_SIZE: usize = 1024;
const EVENT_CHANNEL_SIZE: usize = 256;
const MAINTENANCE_INTERVAL_SECS: u64 = 60;

pub struct AppState {
    pub pool: SqlitePool,
    pub config: config::AppConfig,
    pub clock: Arc<dyn Clock>,
    pub monitor: Arc<ThresholdMonitor>,
    pub alerts: Arc<AlertDispatcher>,
    pub cooldowns: Arc<CooldownRegistry>,
    pub learning: Arc<LearningStore>,
    pub ledger: Arc<ChangeLedger>,
    pub governor: Arc<DeploymentGovernor>,
    pub orchestrator: Arc<CycleOrchestrator>,
    /// Push ingestion shares the evaluation channel with the telemetry poller.
    pub measurement_tx: mpsc::Sender<QualityMeasurement>,
    pub trigger_limiter: Arc<middleware::RateLimiter>,
    pub rollback_limiter: Arc<middleware::RateLimiter>,
    pub shutdown: Arc<Shutdown>,
    pub started_at: DateTime<Utc>,
}

/// External systems the engine talks to.
pub struct Collaborators {
    pub optimizer: Arc<dyn Optimizer>,
    pub target: Arc<dyn ConfigTarget>,
    pub telemetry: Option<Arc<dyn TelemetrySource>>,
    pub sinks: Vec<Arc<dyn AlertSink>>,
}

impl Collaborators {
    /// Picks HTTP collaborators where URLs are configured and built-ins otherwise.
    pub fn from_config(config: &config::AppConfig) -> anyhow::Result<Self> {
        use crate::collaborators::{
            HttpOptimizer, HttpTelemetrySource, InProcessTarget, RuleBasedOptimizer,
            WebhookConfigTarget,
        };
        use crate::quality::sinks::{FileSink, LogSink, WebhookSink};

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(
                config.cycle.optimizer_timeout_secs.max(config.alerts.sink_timeout_secs),
            ))
            .build()?;

        let optimizer: Arc<dyn Optimizer> = match &config.optimizer_url {
            Some(url) => Arc::new(HttpOptimizer::new(client.clone(), url.clone())),
            None => Arc::new(RuleBasedOptimizer::new(config.fallback_models.clone())),
        };
        let target: Arc<dyn ConfigTarget> = match &config.config_push_url {
            Some(url) => Arc::new(WebhookConfigTarget::new(client.clone(), url.clone())),
            None => Arc::new(InProcessTarget),
        };
        let telemetry: Option<Arc<dyn TelemetrySource>> = config
            .telemetry_url
            .as_ref()
            .map(|url| Arc::new(HttpTelemetrySource::new(client.clone(), url.clone())) as _);

        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogSink)];
        if let Some(path) = &config.alerts.log_path {
            sinks.push(Arc::new(FileSink::new(path.clone())));
        }
        if let Some(url) = &config.alerts.webhook_url {
            sinks.push(Arc::new(WebhookSink::new(client, url.clone())));
        }

        Ok(Self {
            optimizer,
            target,
            telemetry,
            sinks,
        })
    }
}

/// Wires the engine together and restores persisted state. The returned
/// receiver feeds [`spawn_engine_tasks`].
pub async fn assemble(
    config: config::AppConfig,
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    collaborators: &Collaborators,
    shutdown: Arc<Shutdown>,
) -> anyhow::Result<(Arc<AppState>, mpsc::Receiver<QualityMeasurement>)> {
    use tracing::info;

    let store: Arc<dyn QualityDataStore> = Arc::new(SqliteDataStore::new(pool.clone()));
    let cooldowns = Arc::new(CooldownRegistry::new(clock.clone()));
    let monitor = Arc::new(ThresholdMonitor::new(config.threshold.clone()));
    let alerts = Arc::new(AlertDispatcher::new(
        config.alerts.clone(),
        cooldowns.clone(),
        collaborators.sinks.clone(),
    ));

    let learning = Arc::new(LearningStore::new(
        config.learning.clone(),
        store.clone(),
        clock.clone(),
    ));
    let restored = learning.load().await?;
    info!(count = restored, "🧠 Learning patterns loaded");

    let ledger = Arc::new(ChangeLedger::new(config.ledger_capacity, store.clone()));
    let entries = ledger.load().await?;
    info!(count = entries, capacity = config.ledger_capacity, "📒 Change ledger loaded");

    let governor = Arc::new(
        DeploymentGovernor::new(
            LiveConfiguration::new(config.default_settings.clone()),
            collaborators.target.clone(),
            ledger.clone(),
            store,
            clock.clone(),
        )
        .with_audit_pool(pool.clone()),
    );
    governor.restore().await?;

    let orchestrator = Arc::new(CycleOrchestrator::new(
        config.cycle.clone(),
        cooldowns.clone(),
        collaborators.optimizer.clone(),
        monitor.clone(),
        learning.clone(),
        governor.clone(),
        clock.clone(),
        shutdown.clone(),
    ));

    let (measurement_tx, measurement_rx) = mpsc::channel(MEASUREMENT_CHANNEL_SIZE);
    let state = Arc::new(AppState {
        pool,
        trigger_limiter: Arc::new(middleware::RateLimiter::per_minute(
            "trigger",
            config.operator_rate_per_min,
        )),
        rollback_limiter: Arc::new(middleware::RateLimiter::per_minute(
            "rollback",
            config.operator_rate_per_min,
        )),
        config,
        started_at: clock.now(),
        clock,
        monitor,
        alerts,
        cooldowns,
        learning,
        ledger,
        governor,
        orchestrator,
        measurement_tx,
        shutdown,
    });
    Ok((state, measurement_rx))
}

/// Starts ingestion (when a telemetry source is configured), evaluation,
/// optimization and maintenance loops.
pub fn spawn_engine_tasks(
    state: &Arc<AppState>,
    measurement_rx: mpsc::Receiver<QualityMeasurement>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
) -> Vec<JoinHandle<()>> {
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let mut handles = Vec::with_capacity(4);

    if let Some(source) = telemetry {
        handles.push(tasks::spawn_ingestion_task(
            source,
            state.measurement_tx.clone(),
            state.config.telemetry_poll_secs,
            state.shutdown.clone(),
        ));
    } else {
        tracing::info!("No TELEMETRY_URL configured; accepting measurements via POST /measurements only");
    }
    handles.push(tasks::spawn_evaluation_task(
        state.monitor.clone(),
        state.alerts.clone(),
        measurement_rx,
        event_tx,
        state.shutdown.clone(),
    ));
    handles.push(tasks::spawn_optimization_task(
        state.orchestrator.clone(),
        event_rx,
        state.shutdown.clone(),
    ));
    handles.push(tasks::spawn_maintenance_task(
        state.learning.clone(),
        state.ledger.clone(),
        state.governor.clone(),
        state.cooldowns.clone(),
        vec![state.trigger_limiter.clone(), state.rollback_limiter.clone()],
        MAINTENANCE_INTERVAL_SECS,
        state.shutdown.clone(),
    ));
    handles
}

pub enum AppError {
    Virtuous(VirtuousError),
    Internal(anyhow::Error),
    NotFound(String),
    Validation(String),
    Conflict(String),
    Forbidden(String),
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, err_type, message) = match self {
            AppError::Virtuous(e) => {
                let (status, err_type) = match &e {
                    VirtuousError::Validation(_) => (StatusCode::BAD_REQUEST, "ValidationError"),
                    VirtuousError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
                    VirtuousError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
                    VirtuousError::OptimizerTimeout(_) => {
                        (StatusCode::GATEWAY_TIMEOUT, "OptimizerTimeout")
                    }
                    VirtuousError::OptimizerFailure(_) => (StatusCode::BAD_GATEWAY, "OptimizerFailure"),
                    VirtuousError::DeploymentFailure(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "DeploymentFailure")
                    }
                    VirtuousError::RollbackFailure(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "RollbackFailure")
                    }
                    VirtuousError::Persistence(_) => {
                        (StatusCode::SERVICE_UNAVAILABLE, "PersistenceFailure")
                    }
                };
                (status, err_type.to_string(), e.to_string())
            }
            AppError::Internal(e) => {
                // Full error stays server-side.
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalError".to_string(),
                    "An internal error occurred".to_string(),
                )
            }
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, "NotFound".to_string(), m),
            AppError::Validation(m) => (StatusCode::BAD_REQUEST, "ValidationError".to_string(), m),
            AppError::Conflict(m) => (StatusCode::CONFLICT, "Conflict".to_string(), m),
            AppError::Forbidden(m) => (StatusCode::FORBIDDEN, "PermissionDenied".to_string(), m),
        };

        let body = axum::Json(serde_json::json!({
            "status": "error",
            "error": {
                "type": err_type,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<VirtuousError> for AppError {
    fn from(err: VirtuousError) -> Self {
        AppError::Virtuous(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Internal(anyhow::anyhow!(err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// All HTTP routes. `/trigger` and `/rollback` carry their own per-client limiters.
pub fn build_router(state: Arc<AppState>) -> axum::Router {
    use axum::routing::{get, post};
    use axum::Router;
    use tower_http::cors::CorsLayer;

    let trigger_routes = Router::new()
        .route("/trigger", post(handlers::cycles::trigger_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.trigger_limiter.clone(),
            middleware::rate_limit_middleware,
        ));

    let rollback_routes = Router::new()
        .route("/rollback", post(handlers::changes::rollback_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.rollback_limiter.clone(),
            middleware::rate_limit_middleware,
        ));

    let api_routes = Router::new()
        .route("/status", get(handlers::status::status_handler))
        .route("/changes", get(handlers::changes::changes_handler))
        .route("/clear-history", post(handlers::changes::clear_history_handler))
        .route("/alerts", get(handlers::alerts::list_alerts))
        .route("/alerts/:id/resolve", post(handlers::alerts::resolve_alert))
        .route("/learning", get(handlers::learning::list_patterns))
        .route(
            "/config",
            get(handlers::live_config::get_config).post(handlers::live_config::set_config),
        )
        .route("/measurements", post(handlers::measurements::ingest_measurement))
        .route("/cycles", get(handlers::cycles::list_cycles))
        .route("/system/version", get(handlers::version_handler))
        .merge(trigger_routes)
        .merge(rollback_routes)
        .layer(axum::extract::DefaultBodyLimit::max(1024 * 1024));

    api_routes.with_state(state.clone()).layer(
        CorsLayer::new()
            .allow_origin(state.config.cors_origins.clone())
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderName::from_static("x-api-key"),
            ]),
    )
}

/// Connects to SQLite (creating the data directory and file as needed) and
/// runs migrations.
pub async fn open_database(database_url: &str) -> anyhow::Result<SqlitePool> {
    use sqlx::sqlite::SqliteConnectOptions;
    use std::str::FromStr;
    use tracing::info;

    if let Some(path_str) = database_url.strip_prefix("sqlite:") {
        let path_str = path_str.split('?').next().unwrap_or(path_str);
        let db_path = std::path::Path::new(path_str);
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && parent != std::path::Path::new(".") {
                std::fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
                }
                info!("📁 Data directory: {}", parent.display());
            }
        }
    }

    let opts = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = sqlx::SqlitePool::connect_with(opts).await?;
    db::init_db(&pool).await?;
    Ok(pool)
}

/// Server entry point.
pub async fn run_server() -> anyhow::Result<()> {
    use crate::clock::SystemClock;
    use crate::config::AppConfig;
    use tracing::info;

    info!("+---------------------------------------+");
    info!("|        Virtuous Cycle Engine          |");
    info!("|        Version {:<10}             |", env!("CARGO_PKG_VERSION"));
    info!("+---------------------------------------+");

    let config = AppConfig::load()?;
    info!(
        "📍 Loaded Config: DB_URL={}, tiers={}/{}/{}, max_concurrent={}",
        config.database_url,
        config.threshold.critical,
        config.threshold.warning,
        config.threshold.target,
        config.cycle.max_concurrent
    );

    if config.api_key.is_none() && !cfg!(debug_assertions) {
        tracing::warn!("⚠️  VIRTUOUS_API_KEY is not set. Mutating endpoints will reject requests.");
    }

    let pool = open_database(&config.database_url).await?;

    let shutdown = Arc::new(Shutdown::new());
    let collaborators = Collaborators::from_config(&config)?;
    info!(
        optimizer = collaborators.optimizer.name(),
        push = config.config_push_url.is_some(),
        sinks = collaborators.sinks.len(),
        "🔌 Collaborators ready"
    );
    let (state, measurement_rx) = assemble(
        config.clone(),
        pool,
        Arc::new(SystemClock),
        &collaborators,
        shutdown.clone(),
    )
    .await?;
    let handles = spawn_engine_tasks(&state, measurement_rx, collaborators.telemetry.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Ctrl-C received");
            signal.trigger();
        }
    });

    let app = build_router(state);
    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.bind_address, config.port)).await?;
    info!(
        "🚀 Virtuous Cycle Engine is listening on http://{}:{}",
        config.bind_address, config.port
    );

    let shutdown_signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal.wait().await;
        info!("🛑 Graceful shutdown signal received. Stopping server...");
    })
    .await?;

    // Loops exit on the same signal; wait for the final flush.
    shutdown.trigger();
    for handle in handles {
        let _ = handle.await;
    }
    info!("👋 Engine stopped");
    Ok(())
}
