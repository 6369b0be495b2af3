use std::str::FromStr;

use actix_web::web::{Data, Json, Path, Query};
use actix_web::{HttpRequest, HttpResponse};

use areg_common::api::{EntitlementRequest, PageQuery, PublishRequest, SearchRequest};
use areg_common::crypto::Hash;
use areg_common::error::ApiError;
use areg_common::principal::Principal;

use crate::rate_limit::EndpointClass;

use super::AppState;

/// GET /agents/public — cross-tenant public list, no auth required.
pub async fn list_public(
    state: Data<AppState>,
    request: HttpRequest,
    query: Query<PageQuery>,
) -> Result<HttpResponse, ApiError> {
    state
        .open_pipeline(&request, EndpointClass::PublicRead)
        .await?;
    let body = state
        .with_deadline(state.discovery.list_public(*query))
        .await?;
    Ok(HttpResponse::Ok().json(body))
}

/// GET /agents/entitled — public plus entitled within the caller's tenant.
pub async fn list_entitled(
    state: Data<AppState>,
    request: HttpRequest,
    query: Query<PageQuery>,
) -> Result<HttpResponse, ApiError> {
    let principal = state
        .auth_pipeline(&request, EndpointClass::AuthRead)
        .await?;
    let body = state
        .with_deadline(state.discovery.list_entitled(&principal, *query))
        .await?;
    Ok(HttpResponse::Ok().json(body))
}

/// GET /agents/{id} — record plus latest card, 404 when invisible.
pub async fn get_agent(
    state: Data<AppState>,
    request: HttpRequest,
    path: Path<String>,
) -> Result<HttpResponse, ApiError> {
    let principal = state
        .open_pipeline(&request, EndpointClass::PublicRead)
        .await?;
    let detail = state
        .with_deadline(state.discovery.get_agent(&path, principal.as_ref()))
        .await?;
    Ok(HttpResponse::Ok().json(detail))
}

/// GET /agents/{id}/card — canonical card JSON.
pub async fn get_card(
    state: Data<AppState>,
    request: HttpRequest,
    path: Path<String>,
) -> Result<HttpResponse, ApiError> {
    let principal = state
        .open_pipeline(&request, EndpointClass::PublicRead)
        .await?;
    let card = state
        .with_deadline(state.discovery.get_card(&path, principal.as_ref()))
        .await?;
    Ok(HttpResponse::Ok().json(card))
}

/// POST /agents/search — filtered full-text search inside the caller's
/// visibility set.
pub async fn search(
    state: Data<AppState>,
    request: HttpRequest,
    body: Json<SearchRequest>,
) -> Result<HttpResponse, ApiError> {
    let principal = state
        .auth_pipeline(&request, EndpointClass::AuthRead)
        .await?;
    let page = state
        .with_deadline(state.discovery.search(Some(&principal), body.into_inner()))
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

/// POST /agents/publish — by value or by URL; 201 on a new version, 200
/// on an idempotent replay.
pub async fn publish(
    state: Data<AppState>,
    request: HttpRequest,
    body: Json<PublishRequest>,
) -> Result<HttpResponse, ApiError> {
    let principal = state.auth_pipeline(&request, EndpointClass::Write).await?;
    let response = state
        .with_deadline(state.publish.publish(&principal, body.into_inner()))
        .await?;
    if response.created {
        Ok(HttpResponse::Created().json(response))
    } else {
        Ok(HttpResponse::Ok().json(response))
    }
}

/// POST /agents/{id}/entitlements — grant visibility of a non-public
/// agent to a subject within the owning tenant.
pub async fn grant_entitlement(
    state: Data<AppState>,
    request: HttpRequest,
    path: Path<String>,
    body: Json<EntitlementRequest>,
) -> Result<HttpResponse, ApiError> {
    let principal = state.auth_pipeline(&request, EndpointClass::Write).await?;
    let (agent_id, tenant) = resolve_entitlement_target(&state, &path, &principal).await?;

    let body = body.into_inner();
    state
        .store
        .grant_entitlement(&tenant, &agent_id, body.subject_kind, &body.subject)
        .await
        .map_err(crate::publish::map_store_error)?;
    state.cache.invalidate_tenant(&tenant);
    Ok(HttpResponse::Ok().finish())
}

/// DELETE /agents/{id}/entitlements — revoke a previously granted subject.
pub async fn revoke_entitlement(
    state: Data<AppState>,
    request: HttpRequest,
    path: Path<String>,
    body: Json<EntitlementRequest>,
) -> Result<HttpResponse, ApiError> {
    let principal = state.auth_pipeline(&request, EndpointClass::Write).await?;
    let (agent_id, tenant) = resolve_entitlement_target(&state, &path, &principal).await?;

    let body = body.into_inner();
    state
        .store
        .revoke_entitlement(&tenant, &agent_id, body.subject_kind, &body.subject)
        .await
        .map_err(crate::publish::map_store_error)?;
    state.cache.invalidate_tenant(&tenant);
    Ok(HttpResponse::NoContent().finish())
}

/// Entitlement management needs CatalogManager within the owning tenant;
/// Administrators may manage any tenant's grants.
async fn resolve_entitlement_target(
    state: &AppState,
    id: &str,
    principal: &Principal,
) -> Result<(Hash, String), ApiError> {
    let agent_id = Hash::from_str(id).map_err(|_| ApiError::NotFound)?;
    let record = state
        .store
        .get_record(&agent_id)
        .await
        .ok_or(ApiError::NotFound)?;

    if principal.is_administrator() {
        return Ok((agent_id, record.tenant));
    }
    if !principal.can_publish() {
        return Err(ApiError::Forbidden(
            "entitlement management requires the CatalogManager role".to_string(),
        ));
    }
    if principal.tenant != record.tenant {
        // Do not reveal the record's existence to another tenant.
        return Err(ApiError::NotFound);
    }
    Ok((agent_id, record.tenant))
}
