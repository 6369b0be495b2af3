pub mod agents;
pub mod peers;
pub mod well_known;

use std::future::Future;
use std::sync::Arc;

use actix_web::web::{self, Data};
use actix_web::{App, HttpRequest, HttpServer};
use log::info;
use metrics_exporter_prometheus::PrometheusHandle;

use areg_common::config::HEADER_AUTHORIZATION;
use areg_common::error::ApiError;
use areg_common::principal::{Principal, SCOPE_ADMIN, SCOPE_READ, SCOPE_WRITE};

use crate::auth::{extract_bearer_token, AuthGate};
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::discovery::DiscoveryService;
use crate::federation::FederationManager;
use crate::publish::PublishService;
use crate::rate_limit::{EndpointClass, RateLimiter};
use crate::store::AgentStore;

/// Everything the handlers need, shared across workers.
pub struct AppState {
    pub auth: AuthGate,
    pub rate: RateLimiter,
    pub publish: Arc<PublishService>,
    pub discovery: Arc<DiscoveryService>,
    pub federation: Arc<FederationManager>,
    pub store: Arc<AgentStore>,
    pub cache: Arc<ResponseCache>,
    pub config: Arc<Config>,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// Request pipeline prefix for endpoints that accept anonymous
    /// callers: optional authentication, then rate limiting keyed by the
    /// principal or the client address.
    pub async fn open_pipeline(
        &self,
        request: &HttpRequest,
        class: EndpointClass,
    ) -> Result<Option<Principal>, ApiError> {
        let principal = self
            .auth
            .authenticate_optional(bearer_of(request).as_deref())
            .await?;
        let key = principal
            .as_ref()
            .map(|p| p.id.clone())
            .unwrap_or_else(|| client_key(request));
        self.rate.check(&key, class).await?;
        Ok(principal)
    }

    /// Pipeline prefix for authenticated endpoints.
    pub async fn auth_pipeline(
        &self,
        request: &HttpRequest,
        class: EndpointClass,
    ) -> Result<Principal, ApiError> {
        let principal = self
            .auth
            .authenticate(bearer_of(request).as_deref())
            .await?;
        require_class_scope(&principal, class)?;
        self.rate.check(&principal.id, class).await?;
        Ok(principal)
    }

    /// Apply the per-request deadline budget; exhaustion maps to 504.
    pub async fn with_deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        match tokio::time::timeout(self.config.request_budget(), fut).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::DeadlineExceeded),
        }
    }
}

/// Scope gate per endpoint class. Tokens that carry no scope claim at all
/// come from role-only deployments and pass; a token that names scopes is
/// held to them.
fn require_class_scope(principal: &Principal, class: EndpointClass) -> Result<(), ApiError> {
    if principal.scopes.is_empty() {
        return Ok(());
    }
    let required = match class {
        EndpointClass::PublicRead => return Ok(()),
        EndpointClass::AuthRead => SCOPE_READ,
        EndpointClass::Write => SCOPE_WRITE,
        EndpointClass::SyncAdmin => SCOPE_ADMIN,
    };
    if principal.has_scope(required) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "token lacks the '{required}' scope"
        )))
    }
}

pub fn bearer_of(request: &HttpRequest) -> Option<String> {
    request
        .headers()
        .get(HEADER_AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .map(|token| token.to_string())
}

fn client_key(request: &HttpRequest) -> String {
    request
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Build and start the HTTP server; the returned future drives it.
pub fn start_http(state: Arc<AppState>) -> std::io::Result<actix_web::dev::Server> {
    let bind_address = state.config.bind_address.clone();
    let prometheus_route = state
        .prometheus
        .is_some()
        .then(|| state.config.prometheus_route.clone());
    let data = Data::from(state);

    info!("registry listening on {}", bind_address);
    let server = HttpServer::new(move || {
        let mut app = App::new()
            .app_data(data.clone())
            .route("/health", web::get().to(well_known::health))
            .route("/health/ready", web::get().to(well_known::health_ready))
            .route("/health/live", web::get().to(well_known::health_live))
            .route(
                "/.well-known/agents/index.json",
                web::get().to(well_known::index),
            )
            .route(
                "/.well-known/agent.json",
                web::get().to(well_known::registry_card),
            )
            .route("/agents/public", web::get().to(agents::list_public))
            .route("/agents/entitled", web::get().to(agents::list_entitled))
            .route("/agents/search", web::post().to(agents::search))
            .route("/agents/publish", web::post().to(agents::publish))
            .route(
                "/agents/{id}/entitlements",
                web::post().to(agents::grant_entitlement),
            )
            .route(
                "/agents/{id}/entitlements",
                web::delete().to(agents::revoke_entitlement),
            )
            .route("/agents/{id}/card", web::get().to(agents::get_card))
            .route("/agents/{id}", web::get().to(agents::get_agent))
            .route("/peers", web::get().to(peers::list))
            .route("/peers", web::post().to(peers::create))
            .route("/peers/{id}/sync", web::post().to(peers::trigger_sync))
            .route("/peers/{id}/runs", web::get().to(peers::runs))
            .route("/peers/{id}", web::get().to(peers::get))
            .route("/peers/{id}", web::put().to(peers::update))
            .route("/peers/{id}", web::delete().to(peers::delete));
        if let Some(route) = &prometheus_route {
            app = app.route(route, web::get().to(well_known::metrics));
        }
        app
    })
    .bind(bind_address)?
    .run();

    Ok(server)
}
