use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::header::HeaderValue;
use axum::http::Method;
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::AuthProvider;
use crate::config::Config;
use crate::session::Registry;

/// State shared across all web request handlers
pub struct AppState {
    pub registry: Arc<Registry>,
    pub auth: Arc<dyn AuthProvider>,
}

/// Create the axum router for the terminal backend
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(super::api::api_routes())
        .merge(super::socket::ws_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the web server
pub async fn start_server(
    config: &Config,
    registry: Arc<Registry>,
    auth: Arc<dyn AuthProvider>,
) -> Result<()> {
    let state = Arc::new(AppState { registry, auth });

    let mut app = create_router(state);

    // Browsers only send the session cookie cross-origin when the origin is
    // allowed explicitly; wildcard and credentials are mutually exclusive.
    if let Some(origin) = &config.server.allowed_origin {
        let origin = origin
            .parse::<HeaderValue>()
            .with_context(|| format!("Invalid allowed_origin: {}", origin))?;
        app = app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::exact(origin))
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([axum::http::header::CONTENT_TYPE])
                .allow_credentials(true),
        );
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(addr = %addr, "Terminal backend listening");

    axum::serve(listener, app).await?;

    Ok(())
}
