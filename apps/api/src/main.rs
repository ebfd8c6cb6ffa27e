use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use assistant_api::assistant_client::OpenAiAssistantClient;
use assistant_api::config::Config;
use assistant_api::conversation::persistence::PgConversationStore;
use assistant_api::conversation::resume_store::PgResumeStore;
use assistant_api::db::create_pool;
use assistant_api::routes::build_router;
use assistant_api::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("assistant_api={},tower_http={}", config.rust_log, config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting assistant API v{}", env!("CARGO_PKG_VERSION"));

    let db = create_pool(&config.database_url).await?;

    let runtime = OpenAiAssistantClient::new(
        config.openai_api_key.clone(),
        config.openai_base_url.clone(),
        config.assistant_id.clone(),
    )?;
    info!("Assistant runtime client initialized (assistant: {})", config.assistant_id);

    let poll_policy = config.poll_policy();
    info!(
        "Run polling every {:?}, giving up after {} polls",
        poll_policy.interval, poll_policy.max_polls
    );

    let shutdown = CancellationToken::new();
    let state = AppState {
        runtime: Arc::new(runtime),
        store: Arc::new(PgConversationStore::new(db.clone())),
        resumes: Arc::new(PgResumeStore::new(db)),
        poll_policy,
        shutdown: shutdown.clone(),
    };

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict origins to the web app's domain

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C and cancels every in-flight run poll.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, cancelling in-flight turns");
    shutdown.cancel();
}
