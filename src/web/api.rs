use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use super::server::AppState;
use crate::auth::UserId;
use crate::error::AuthError;
use crate::session::store::TabTopology;

/// HTTP routes. The WebSocket carries terminal traffic; these endpoints let
/// the UI read and write the tab topology without a live terminal.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tabs", get(get_tabs))
        .route("/tabs", post(put_tabs))
        .route("/terminal/close-tab", post(close_tab))
}

/// Resolve the request's cookie to a user, or the status the client gets back.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserId, StatusCode> {
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    match state.auth.validate(cookie).await {
        Ok(user) => Ok(user),
        Err(AuthError::Unauthorized) => Err(StatusCode::UNAUTHORIZED),
        Err(AuthError::Unavailable(_)) => Err(StatusCode::BAD_GATEWAY),
    }
}

async fn get_tabs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<TabTopology>, StatusCode> {
    let user = authenticate(&state, &headers).await?;
    Ok(Json(state.registry.load_topology(&user)))
}

async fn put_tabs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TabTopology>,
) -> Result<Json<TabTopology>, (StatusCode, String)> {
    let user = authenticate(&state, &headers)
        .await
        .map_err(|s| (s, String::new()))?;

    let Some(clean) = body.sanitized() else {
        return Err((
            StatusCode::BAD_REQUEST,
            "No valid tabs provided".to_string(),
        ));
    };

    state.registry.save_topology(&user, &clean).map_err(|e| {
        tracing::error!(user = %user, error = %e, "Failed to save tab topology");
        (StatusCode::INTERNAL_SERVER_ERROR, String::new())
    })?;
    Ok(Json(clean))
}

#[derive(Deserialize, Default)]
struct CloseTabRequest {
    #[serde(rename = "tabId")]
    tab_id: Option<String>,
}

/// Close a tab out of band, e.g. from a workspace page that has no terminal
/// open. Kills the process when the user has a live session.
async fn close_tab(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<CloseTabRequest>>,
) -> Result<Json<TabTopology>, StatusCode> {
    let user = authenticate(&state, &headers).await?;
    let tab_id = body
        .and_then(|Json(b)| b.tab_id)
        .unwrap_or_else(|| "1".to_string());

    if let Some(session) = state.registry.find(&user).await {
        // Live session: the registry kills the process and persists
        match state.registry.close_tab(&session, &tab_id).await {
            Ok(()) | Err(crate::error::TabError::NotFound(_)) => {}
            Err(e) => {
                tracing::error!(user = %user, tab = %tab_id, error = %e, "Close failed");
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
        return Ok(Json(state.registry.load_topology(&user)));
    }

    // No live session: edit the persisted topology directly
    let mut topo = state.registry.load_topology(&user);
    topo.tabs.retain(|t| t != &tab_id);
    if topo.tabs.is_empty() {
        return Ok(Json(TabTopology::default_topology()));
    }
    if topo.active_tab == tab_id {
        topo.active_tab = topo.tabs[0].clone();
    }
    state
        .registry
        .save_topology(&user, &topo)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(topo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthProvider;
    use crate::config::Config;
    use crate::session::{store::TabStore, Registry};
    use crate::web::server::create_router;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_app() -> (tempfile::TempDir, axum::Router) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.terminal.shell = "/bin/sh".to_string();
        let registry = Registry::new(config, TabStore::new(dir.path().to_path_buf()));
        let auth = Arc::new(StaticAuthProvider::new(&[(
            "session=abc",
            "alice@example.com",
        )]));
        let state = Arc::new(AppState { registry, auth });
        (dir, create_router(state))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_tabs_requires_auth() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(Request::get("/tabs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_tabs_defaults_for_new_user() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(
                Request::get("/tabs")
                    .header(header::COOKIE, "session=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["tabs"], serde_json::json!(["1"]));
        assert_eq!(json["active_tab"], "1");
    }

    #[tokio::test]
    async fn test_put_tabs_round_trip() {
        let (_dir, app) = test_app();
        let response = app
            .clone()
            .oneshot(
                Request::post("/tabs")
                    .header(header::COOKIE, "session=abc")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"tabs":["1","2","3"],"active_tab":"2"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get("/tabs")
                    .header(header::COOKIE, "session=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["tabs"], serde_json::json!(["1", "2", "3"]));
        assert_eq!(json["active_tab"], "2");
    }

    #[tokio::test]
    async fn test_put_tabs_sanitizes_ids() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(
                Request::post("/tabs")
                    .header(header::COOKIE, "session=abc")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"tabs":["ok1","../etc/passwd",""],"active_tab":"../etc/passwd"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["tabs"], serde_json::json!(["ok1"]));
        assert_eq!(json["active_tab"], "ok1");
    }

    #[tokio::test]
    async fn test_put_tabs_rejects_all_invalid() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(
                Request::post("/tabs")
                    .header(header::COOKIE, "session=abc")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"tabs":["../x"],"active_tab":"../x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_close_tab_defaults_to_tab_one() {
        let (_dir, app) = test_app();
        app.clone()
            .oneshot(
                Request::post("/tabs")
                    .header(header::COOKIE, "session=abc")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"tabs":["1","2"],"active_tab":"1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        // No body at all: tab "1" is implied
        let response = app
            .oneshot(
                Request::post("/terminal/close-tab")
                    .header(header::COOKIE, "session=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["tabs"], serde_json::json!(["2"]));
        assert_eq!(json["active_tab"], "2");
    }

    #[tokio::test]
    async fn test_close_last_persisted_tab_returns_default() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(
                Request::post("/terminal/close-tab")
                    .header(header::COOKIE, "session=abc")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"tabId":"1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["tabs"], serde_json::json!(["1"]));
    }
}
