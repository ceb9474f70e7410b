use std::future::Future;
use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, Method, StatusCode, Uri},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::gateway::ws_handler;
use crate::llm::OpenAiModel;
use crate::prompting::{render_system_prompt, SystemPromptContext};
use crate::qualification::QualificationHandler;
use crate::queue::{JobQueue, PgJobQueue};
use crate::realtime::{relay_notifications, ConnectionRegistry, Notifier, PgNotifier};
use crate::store::{LeadStore, MessageStore, PgStore};
use crate::worker::Worker;

/// Turns replayed on connect and sent to the model as context.
pub const HISTORY_LIMIT: i64 = 20;
pub const LEADS_PAGE_SIZE: i64 = 20;

pub struct AppState {
    pub messages: Arc<dyn MessageStore>,
    pub leads: Arc<dyn LeadStore>,
    pub queue: Arc<dyn JobQueue>,
    pub registry: ConnectionRegistry,
    pub history_limit: i64,
    pub leads_page_size: i64,
}

pub fn router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/api/v1/alive", get(alive))
        .route("/ws", get(ws_handler))
        .fallback(not_found)
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

async fn alive() -> impl IntoResponse {
    Json(json!({ "status": "success", "message": "Server is up and running" }))
}

async fn not_found(method: Method, uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "status": "error",
            "message": format!(
                "OOPs!! No handler defined for {}: {} route. Check the API documentation for more details.",
                method,
                uri.path()
            ),
        })),
    )
}

pub fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("lead_chat_server={log_level},tower_http=info,warn"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Cancelled on SIGINT or SIGTERM.
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                    }
                }
                Err(err) => {
                    warn!(error = %err, "SIGTERM handler unavailable, waiting for SIGINT only");
                    let _ = ctrl_c.await;
                    info!("received SIGINT, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received Ctrl+C, shutting down");
        }

        trigger.cancel();
    });

    token
}

pub async fn run() -> Result<(), AppError> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env()?;
    init_tracing(&config.log_level);
    info!(app = %config.app_name, role = ?config.role, "starting");

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    debug!("migrations applied");

    let cancel = install_signal_handler();
    let store = Arc::new(PgStore::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool.clone(), &config.queue));
    let registry = ConnectionRegistry::default();
    let mut tasks: JoinSet<Result<(), AppError>> = JoinSet::new();

    if config.role.runs_worker() {
        let notifier: Arc<dyn Notifier> = if config.role.runs_gateway() {
            Arc::new(registry.clone())
        } else {
            Arc::new(PgNotifier::new(pool.clone()))
        };
        let model = Arc::new(OpenAiModel::new(reqwest::Client::new(), &config.openai)?);
        let system_prompt = render_system_prompt(&SystemPromptContext {
            demo_booking_url: &config.demo_booking_url,
        });
        let handler = Arc::new(QualificationHandler::new(
            store.clone(),
            store.clone(),
            model,
            notifier,
            system_prompt,
            HISTORY_LIMIT,
        ));
        let worker = Worker::new(queue.clone(), handler, config.queue.poll_interval);
        let token = cancel.clone();
        tasks.spawn(async move {
            worker.run(token).await;
            Ok(())
        });
    }

    if config.role.runs_gateway() {
        if !config.role.runs_worker() {
            tasks.spawn(cancel_on_error(
                cancel.clone(),
                relay_notifications(pool.clone(), registry.clone(), cancel.clone()),
            ));
        }

        let state = Arc::new(AppState {
            messages: store.clone(),
            leads: store.clone(),
            queue: queue.clone(),
            registry: registry.clone(),
            history_limit: HISTORY_LIMIT,
            leads_page_size: LEADS_PAGE_SIZE,
        });
        let app = router(state, &config.cors_origins);

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
        info!(port = config.port, "{} listening on http://localhost:{}", config.app_name, config.port);
        let token = cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
        cancel.cancel();
    } else {
        cancel.cancelled().await;
    }

    let outcome = join_all(tasks).await;
    pool.close().await;
    if outcome.is_ok() {
        info!("shutdown complete");
    }
    outcome
}

/// Run a task whose failure must stop the whole process.
async fn cancel_on_error<F>(cancel: CancellationToken, task: F) -> Result<(), AppError>
where
    F: Future<Output = Result<(), AppError>>,
{
    let result = task.await;
    if let Err(err) = &result {
        error!(error = %err, "background task failed, shutting down");
        cancel.cancel();
    }
    result
}

/// Wait for every background task and return the first failure.
async fn join_all(mut tasks: JoinSet<Result<(), AppError>>) -> Result<(), AppError> {
    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                failure.get_or_insert(err);
            }
            Err(err) => {
                error!(error = %err, "background task panicked");
                failure.get_or_insert(AppError::Server(std::io::Error::other(err.to_string())));
            }
        }
    }
    failure.map_or(Ok(()), Err)
}
