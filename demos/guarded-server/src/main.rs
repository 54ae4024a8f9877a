use axum::routing::get;
use meshestra_exception::prelude::*;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;

/// Answers `GET /users/{id}`, failing in a different way for a few ids.
fn users(statuses: Arc<StatusRegistry>) -> impl Handler {
    move |exchange: &mut Exchange| -> HandlerResult {
        let path = exchange.request().uri().path().to_string();
        let id = path.trim_start_matches("/users/");

        match id {
            "0" => {
                let status = statuses
                    .get("ERR00404")
                    .map_err(HandlerError::runtime)?
                    .with_args(&[id]);
                Err(HandlerError::Api(status))
            }
            "panic" => panic!("simulated bug while loading user"),
            "io" => {
                std::fs::read("/nonexistent/users.db")?;
                Ok(())
            }
            _ => {
                // Handlers run on worker threads, so blocking here is fine.
                std::thread::sleep(std::time::Duration::from_millis(20));
                let body = serde_json::json!({ "id": id, "name": "Test User" });
                if let Some(sender) = exchange.response_sender() {
                    sender.send_json(body.to_string());
                }
                Ok(())
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    tracing::info!("🚀 Starting guarded server...");

    let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
    let config = ConfigService::from_dir(&config_dir)?.with_env();
    let statuses = Arc::new(StatusRegistry::from_config(&config)?);

    let pipeline = Pipeline::builder()
        .middleware(ExceptionHandler::from_config(&config)?)
        .middleware(CorrelationHandler::from_config(&config)?)
        .handler(users(Arc::clone(&statuses)))
        .workers(WorkerPool::with_available_parallelism()?)
        .build()?;

    for module in ModuleRegistry::global().modules() {
        tracing::info!("Module {} config={:?}", module.name, module.config);
    }

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .fallback_service(pipeline)
        .layer(TraceLayer::new_for_http());

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("{}:{}", host, port);

    tracing::info!("✅ Server running on http://127.0.0.1:{}", port);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => tracing::error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
