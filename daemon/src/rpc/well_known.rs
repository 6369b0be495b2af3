use actix_web::web::{Data, Query};
use actix_web::{HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use areg_common::error::ApiError;

use crate::rate_limit::EndpointClass;

use super::AppState;

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

pub async fn health_live() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

/// Readiness tracks whether the store answers; the index catches up on
/// its own via backfill and repair.
pub async fn health_ready(state: Data<AppState>) -> HttpResponse {
    let agents = state.store.all_heads().await.len();
    HttpResponse::Ok().json(json!({ "status": "ok", "agents": agents }))
}

#[derive(Debug, Deserialize)]
pub struct IndexQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

/// GET /.well-known/agents/index.json — paginated public index.
pub async fn index(
    state: Data<AppState>,
    request: HttpRequest,
    query: Query<IndexQuery>,
) -> Result<HttpResponse, ApiError> {
    state
        .open_pipeline(&request, EndpointClass::PublicRead)
        .await?;
    let body = state
        .with_deadline(
            state
                .discovery
                .well_known_index(query.cursor.as_deref(), query.limit),
        )
        .await?;
    Ok(HttpResponse::Ok().json(body))
}

/// GET /.well-known/agent.json — the registry's own card.
pub async fn registry_card(
    state: Data<AppState>,
    request: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    state
        .open_pipeline(&request, EndpointClass::PublicRead)
        .await?;
    let card = state.with_deadline(state.discovery.registry_card()).await?;
    Ok(HttpResponse::Ok().json(card))
}

/// GET /metrics — Prometheus exposition, mounted only when enabled.
pub async fn metrics(state: Data<AppState>) -> Result<HttpResponse, ApiError> {
    match &state.prometheus {
        Some(handle) => Ok(HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render())),
        None => Err(ApiError::NotFound),
    }
}
