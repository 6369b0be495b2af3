use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fern::colors::{Color, ColoredLevelConfig};
use log::{info, warn, LevelFilter};
use metrics_exporter_prometheus::PrometheusBuilder;

use areg_daemon::auth::{AuthError, AuthGate, JwtVerifier, TokenVerifier};
use areg_daemon::cache::ResponseCache;
use areg_daemon::config::Config;
use areg_daemon::discovery::DiscoveryService;
use areg_daemon::federation::FederationManager;
use areg_daemon::fetcher::{HttpFetcher, ReqwestFetcher};
use areg_daemon::index::IndexService;
use areg_daemon::publish::PublishService;
use areg_daemon::rate_limit::RateLimiter;
use areg_daemon::rpc::{self, AppState};
use areg_daemon::store::AgentStore;

#[actix_web::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::parse());
    setup_logger(&config.log_level)?;
    info!(
        "AREG registry v{} starting on {}",
        areg_common::config::VERSION,
        config.bind_address
    );

    let prometheus = if config.prometheus_enable {
        let (recorder, _) = PrometheusBuilder::new()
            .build()
            .context("failed to create Prometheus recorder")?;
        let handle = recorder.handle();
        metrics::set_global_recorder(Box::new(recorder))
            .context("failed to install Prometheus recorder")?;
        info!("Prometheus metrics on {}", config.prometheus_route);
        Some(handle)
    } else {
        None
    };

    let store = match &config.db_path {
        Some(path) => {
            info!("opening store at {}", path);
            Arc::new(AgentStore::open(Path::new(path)).context("failed to open store")?)
        }
        None => {
            warn!("no REGISTRY_DB_PATH set, running with an in-memory store");
            Arc::new(AgentStore::in_memory())
        }
    };

    let mut index_service = IndexService::start(Arc::clone(&store), &config).await;
    let cache = Arc::new(ResponseCache::new());
    let fetcher: Arc<dyn HttpFetcher> =
        Arc::new(ReqwestFetcher::new().context("failed to build HTTP client")?);

    let publish = Arc::new(PublishService::new(
        Arc::clone(&store),
        Arc::clone(&index_service.writer),
        Arc::clone(&cache),
        Arc::clone(&fetcher),
        Arc::clone(&config),
    ));
    let discovery = Arc::new(DiscoveryService::new(
        Arc::clone(&store),
        Arc::clone(&index_service.index),
        Arc::clone(&cache),
        Arc::clone(&config),
    ));
    let federation = Arc::new(FederationManager::new(
        Arc::clone(&store),
        Arc::clone(&publish),
        Arc::clone(&index_service.writer),
        Arc::clone(&cache),
        Arc::clone(&fetcher),
        Arc::clone(&config),
    ));
    federation.start().await;

    let verifier: Option<Arc<dyn TokenVerifier>> = match JwtVerifier::from_config(&config) {
        Ok(verifier) => Some(Arc::new(verifier)),
        Err(AuthError::NotConfigured) => {
            warn!("no token verifier configured; only public endpoints and admin API keys work");
            None
        }
        Err(e) => return Err(e).context("failed to build token verifier"),
    };
    let auth = AuthGate::new(verifier, &config);

    let state = Arc::new(AppState {
        auth,
        rate: RateLimiter::new(&config),
        publish,
        discovery,
        federation: Arc::clone(&federation),
        store,
        cache,
        config: Arc::clone(&config),
        prometheus,
    });

    let server = rpc::start_http(state).context("failed to bind HTTP server")?;
    server.await.context("HTTP server terminated")?;

    info!("shutting down");
    federation.stop().await;
    index_service.stop();
    Ok(())
}

fn setup_logger(level: &str) -> Result<()> {
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);
    let colors = ColoredLevelConfig::new()
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red)
        .debug(Color::Magenta)
        .trace(Color::BrightBlack);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("sled", LevelFilter::Warn)
        .level_for("actix_server", LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()
        .context("failed to initialize logging")
}
