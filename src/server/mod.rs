//! HTTP API for the web frontend: session management plus `/run` and
//! `/run_sse` to drive agent turns.

mod routes;

use crate::agent::Runner;
use crate::config::ServerConfig;
use crate::session::SessionStore;
use axum::Router;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub struct AppState {
    pub app_name: String,
    pub runner: Arc<Runner>,
    pub sessions: SessionStore,
}

impl AppState {
    pub fn new(app_name: impl Into<String>, runner: Arc<Runner>) -> Self {
        Self {
            app_name: app_name.into(),
            runner,
            sessions: SessionStore::new(),
        }
    }
}

/// Error body in the `{"detail": ...}` shape the frontend expects.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<crate::error::Error> for ApiError {
    fn from(err: crate::error::Error) -> Self {
        let status = match &err {
            crate::error::Error::NotFound(_) => StatusCode::NOT_FOUND,
            crate::error::Error::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.message }))).into_response()
    }
}

/// Build the application router. Static files are served for unmatched
/// routes when `static_dir` exists, with `index.html` as the fallback page.
pub fn router(state: Arc<AppState>, config: &ServerConfig) -> Router {
    let api = Router::new()
        .route("/health", get(routes::health))
        .route("/list-apps", get(routes::list_apps))
        .route(
            "/apps/:app_name/users/:user_id/sessions",
            get(routes::list_sessions).post(routes::create_session),
        )
        .route(
            "/apps/:app_name/users/:user_id/sessions/:session_id",
            get(routes::get_session)
                .post(routes::create_session_with_id)
                .delete(routes::delete_session),
        )
        .route("/run", post(routes::run))
        .route("/run_sse", post(routes::run_sse))
        .with_state(state);

    let static_dir = &config.static_dir;
    let app = if static_dir.is_dir() {
        info!(dir = %static_dir.display(), "serving static files");
        api.fallback_service(
            ServeDir::new(static_dir)
                .append_index_html_on_directories(true)
                .fallback(ServeFile::new(static_dir.join("index.html"))),
        )
    } else {
        api
    };

    app.layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(state: Arc<AppState>, config: &ServerConfig) -> anyhow::Result<()> {
    let app = router(state, config);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutting down"),
                Err(e) => {
                    warn!(error = %e, "cannot listen for Ctrl-C");
                    std::future::pending::<()>().await
                }
            }
        })
        .await?;
    Ok(())
}
