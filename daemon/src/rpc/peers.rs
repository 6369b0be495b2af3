use std::str::FromStr;

use actix_web::web::{Data, Json, Path};
use actix_web::{HttpRequest, HttpResponse};

use areg_common::api::{CreatePeerRequest, SyncRunSummary, UpdatePeerRequest};
use areg_common::crypto::Hash;
use areg_common::error::ApiError;
use areg_common::principal::Principal;

use crate::rate_limit::EndpointClass;

use super::AppState;

async fn admin_pipeline(
    state: &AppState,
    request: &HttpRequest,
) -> Result<Principal, ApiError> {
    let principal = state
        .auth_pipeline(request, EndpointClass::SyncAdmin)
        .await?;
    state.auth.require_administrator(&principal)?;
    Ok(principal)
}

fn parse_peer_id(id: &str) -> Result<Hash, ApiError> {
    Hash::from_str(id).map_err(|_| ApiError::NotFound)
}

/// GET /peers
pub async fn list(state: Data<AppState>, request: HttpRequest) -> Result<HttpResponse, ApiError> {
    admin_pipeline(&state, &request).await?;
    Ok(HttpResponse::Ok().json(state.federation.list_peers().await))
}

/// POST /peers
pub async fn create(
    state: Data<AppState>,
    request: HttpRequest,
    body: Json<CreatePeerRequest>,
) -> Result<HttpResponse, ApiError> {
    admin_pipeline(&state, &request).await?;
    let peer = state.federation.create_peer(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(peer))
}

/// GET /peers/{id}
pub async fn get(
    state: Data<AppState>,
    request: HttpRequest,
    path: Path<String>,
) -> Result<HttpResponse, ApiError> {
    admin_pipeline(&state, &request).await?;
    let peer = state.federation.get_peer(&parse_peer_id(&path)?).await?;
    Ok(HttpResponse::Ok().json(peer))
}

/// PUT /peers/{id}
pub async fn update(
    state: Data<AppState>,
    request: HttpRequest,
    path: Path<String>,
    body: Json<UpdatePeerRequest>,
) -> Result<HttpResponse, ApiError> {
    admin_pipeline(&state, &request).await?;
    let peer = state
        .federation
        .update_peer(&parse_peer_id(&path)?, body.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(peer))
}

/// DELETE /peers/{id}
pub async fn delete(
    state: Data<AppState>,
    request: HttpRequest,
    path: Path<String>,
) -> Result<HttpResponse, ApiError> {
    admin_pipeline(&state, &request).await?;
    state.federation.delete_peer(&parse_peer_id(&path)?).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// POST /peers/{id}/sync — queue an immediate pull; 202 on acceptance.
pub async fn trigger_sync(
    state: Data<AppState>,
    request: HttpRequest,
    path: Path<String>,
) -> Result<HttpResponse, ApiError> {
    admin_pipeline(&state, &request).await?;
    state
        .federation
        .trigger_sync(&parse_peer_id(&path)?)
        .await?;
    Ok(HttpResponse::Accepted().finish())
}

/// GET /peers/{id}/runs — recent sync runs, newest first.
pub async fn runs(
    state: Data<AppState>,
    request: HttpRequest,
    path: Path<String>,
) -> Result<HttpResponse, ApiError> {
    admin_pipeline(&state, &request).await?;
    let peer_id = parse_peer_id(&path)?;
    state
        .store
        .get_peer(&peer_id)
        .await
        .ok_or(ApiError::NotFound)?;
    let runs: Vec<SyncRunSummary> = state
        .store
        .runs_for_peer(&peer_id)
        .await
        .into_iter()
        .map(|run| SyncRunSummary {
            id: run.id,
            peer_id: run.peer_id,
            started_at: run.started_at,
            finished_at: run.finished_at,
            outcome: run.outcome,
            added: run.added,
            updated: run.updated,
            removed: run.removed,
            error: run.error,
        })
        .collect();
    Ok(HttpResponse::Ok().json(runs))
}
