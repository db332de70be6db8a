use std::sync::Arc;

use axum::{extract::FromRef, routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamux::{
    auth::AuthVerifier,
    config::Config,
    credentials::{memory::InMemoryCredentialStore, postgres::PostgresCredentialStore, CredentialStore},
    crypto::CredentialKey,
    health, logging, metrics,
    registry::MuxRegistry,
    routes,
    token_provider::TokenProvider,
    upstream::{Requester, UpstreamRequester},
};

#[derive(Clone, FromRef)]
struct AppState {
    auth_verifier: AuthVerifier,
    credential_store: Arc<dyn CredentialStore>,
    registry: Arc<MuxRegistry>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }
        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting stream multiplexer");

    let config = Arc::new(Config::from_env()?);

    let credential_store: Arc<dyn CredentialStore> =
        if std::env::var("CREDENTIALS_BACKEND").as_deref() == Ok("memory") {
            tracing::warn!("CREDENTIALS_BACKEND=memory; credentials will not survive a restart");
            Arc::new(InMemoryCredentialStore::new())
        } else {
            let key = CredentialKey::from_config_str(&config.credentials_encryption_key_hex)
                .map_err(|e| anyhow::anyhow!("invalid CREDENTIALS_ENCRYPTION_KEY: {e}"))?;
            let store = PostgresCredentialStore::connect(&config.database_url, key).await?;
            Arc::new(store)
        };
    tracing::info!("Credential store initialized");

    let token_provider = Arc::new(TokenProvider::new(
        credential_store.clone(),
        reqwest::Client::new(),
        config.upstream_token_url.clone(),
        config.upstream_client_id.clone(),
        config.upstream_client_secret.clone(),
    ));

    let requester: Arc<dyn Requester> = Arc::new(UpstreamRequester::new(
        reqwest::Client::new(),
        token_provider,
    ));
    let registry = Arc::new(MuxRegistry::new(config.clone(), requester));
    tracing::info!("Multiplexer registry initialized");

    let auth_verifier = AuthVerifier::new(config.jwt_secret.clone());

    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();
    tracing::info!("Metrics initialized");

    let app_state = AppState {
        auth_verifier,
        credential_store,
        registry,
    };

    let metrics_router = if config.enable_metrics {
        Router::new()
            .route("/metrics", get(metrics::metrics_handler))
            .with_state(metrics_handle)
    } else {
        Router::new()
    };

    let app = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/stream/quotes", get(routes::stream_quotes))
        .route("/stream/bars", get(routes::stream_bars))
        .route("/stream/market-depth", get(routes::stream_market_depth))
        .route("/stream/positions/{account_id}", get(routes::stream_positions))
        .route("/stream/orders/{account_id}", get(routes::stream_orders))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(logging::log_requests_middleware))
        .layer(axum::middleware::from_fn(metrics::track_request_metrics))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
