//! cloudigrade - Main Entry Point

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, Method};
use axum::Router;
use clap::Parser;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use cloudigrade_backend::{
    api,
    cli::{self, Cli, Command},
    cloud::{aws::AwsCloud, CloudProvider},
    config::Config,
    db,
    error::{AppError, Result},
    queue::{self, MessageQueue},
    services::{
        auth_service::AuthService,
        inspection::{InspectionService, PgImageStore},
        metrics_service, scheduler_service,
        task_worker::{TaskDispatcher, TaskWorker},
    },
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _otel_guard = telemetry::init_tracing(config.otel_endpoint.as_deref(), "cloudigrade")?;
    tracing::info!(command = ?cli.selected_command(), "Starting cloudigrade");

    let db_pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Connected to database");

    db::run_migrations(&db_pool).await?;
    tracing::info!("Database migrations complete");

    match cli.selected_command() {
        Command::Serve => serve(config, db_pool).await,
        Command::Worker => work(config, db_pool).await,
        Command::CreateSuperuser {
            username,
            email,
            password,
        } => cli::create_superuser(&AuthService::new(db_pool), &username, &email, &password).await,
    }
}

async fn serve(config: Config, db_pool: sqlx::PgPool) -> Result<()> {
    let cloud: Arc<dyn CloudProvider> =
        Arc::new(AwsCloud::new(config.houndigrade_region()).await);
    let message_queue = queue::from_config(&config).await;
    let dispatcher = TaskDispatcher::new(message_queue.clone(), &config.aws_name_prefix);

    let metrics_handle = metrics_service::init_metrics()?;
    tracing::info!("Prometheus metrics recorder initialized");

    // Nothing outside this process can read memory queues.
    let workers = if config.queue_backend.is_process_local() {
        let handles = spawn_task_worker(&config, db_pool.clone(), cloud.clone(), message_queue);
        tracing::info!(queues = handles.len(), "Task worker running in the API process");
        handles
    } else {
        Vec::new()
    };

    let mut app_state = api::AppState::new(
        config.clone(),
        db_pool.clone(),
        cloud,
        dispatcher.clone(),
    );
    app_state.set_metrics_handle(metrics_handle);
    let state = Arc::new(app_state);

    scheduler_service::spawn_all(db_pool, dispatcher, &config);

    let app = Router::new()
        .merge(api::routes::create_router(state))
        .layer(axum::middleware::from_fn(metrics_service::metrics_middleware))
        .layer(cors_layer()?)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in workers {
        handle.abort();
    }
    Ok(())
}

async fn work(config: Config, db_pool: sqlx::PgPool) -> Result<()> {
    config.require_shared_queue()?;

    let cloud: Arc<dyn CloudProvider> =
        Arc::new(AwsCloud::new(config.houndigrade_region()).await);
    let message_queue = queue::from_config(&config).await;

    // Task metrics are recorded here but not served.
    metrics_service::init_metrics()?;

    let handles = spawn_task_worker(&config, db_pool, cloud, message_queue);
    tracing::info!(queues = handles.len(), "Task worker running");

    shutdown_signal().await;
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

fn spawn_task_worker(
    config: &Config,
    db_pool: sqlx::PgPool,
    cloud: Arc<dyn CloudProvider>,
    message_queue: Arc<dyn MessageQueue>,
) -> Vec<JoinHandle<()>> {
    let inspection = Arc::new(InspectionService::new(
        cloud,
        message_queue.clone(),
        Arc::new(PgImageStore::new(db_pool)),
        config.clone(),
    ));
    Arc::new(TaskWorker::new(inspection, message_queue, config)).spawn_all()
}

/// CORS: permissive in production, where the API is served same-origin.
/// In development only `CORS_ORIGINS` may call with credentials.
fn cors_layer() -> Result<CorsLayer> {
    if std::env::var("ENVIRONMENT").unwrap_or_default() != "development" {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    }

    let origins = std::env::var("CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".into())
        .split(',')
        .map(|s| {
            s.trim()
                .parse()
                .map_err(|_| AppError::Config(format!("Invalid CORS origin: {s}")))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .allow_credentials(true))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
