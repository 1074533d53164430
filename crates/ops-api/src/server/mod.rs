use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::Method;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use contracts::{
    ActiveOperationView, ApiError, ErrorCode, FilesystemNode, HostRecord, InboxMessage,
    LedgerEntry, Operation, OperationEvent, PlayerAction, ProgressView, PublishReport,
    ValidationResult, SCHEMA_VERSION_V1,
};
use ops_core::{CascadeReport, EngineError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{EngineApi, EngineApiError, PersistenceError};

const DEFAULT_PAGE_SIZE: usize = 500;
const MAX_PAGE_SIZE: usize = 5000;
const DEFAULT_SQLITE_PATH: &str = "operations.sqlite";

include!("error.rs");
include!("state.rs");
include!("routes/operations.rs");
include!("routes/players.rs");
include!("util.rs");

pub async fn serve(addr: SocketAddr, api: EngineApi) -> Result<(), ServerError> {
    let state = AppState::new(api);
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "operation api listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/operations",
            post(publish_operations).get(list_operations),
        )
        .route("/api/v1/hosts", post(register_hosts).get(list_hosts))
        .route("/api/v1/players/{player_id}/session", post(open_session))
        .route(
            "/api/v1/players/{player_id}/operations",
            get(list_active_operations),
        )
        .route(
            "/api/v1/players/{player_id}/operations/{operation_id}/confirm",
            post(confirm_step),
        )
        .route("/api/v1/players/{player_id}/inbox", get(list_inbox))
        .route("/api/v1/players/{player_id}/actions", post(submit_action))
        .route(
            "/api/v1/players/{player_id}/hosts/{host_id}/fs",
            get(resolve_filesystem),
        )
        .route("/api/v1/players/{player_id}/progress", get(get_progress))
        .route("/api/v1/players/{player_id}/ledger", get(get_ledger))
        .route("/api/v1/players/{player_id}/events", get(get_events))
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

async fn cors_middleware(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(axum::body::Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut());
    response
}

#[cfg(test)]
mod tests;
