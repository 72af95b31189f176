use axum::{
    Router,
    middleware as axum_middleware,
    routing::{get, post},
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use vega::config::Config;
use vega::services::agent::{self, OpenAiCompatClient};
use vega::services::cache::{CacheHandle, MemoryCache, SqliteCache};
use vega::services::dialect::Dialect;
use vega::services::schema::SchemaDescriptor;
use vega::services::vector::EmbeddingClient;
use vega::services::{
    AgentFlow, AgentRepository, EventHub, MetadataProvider, PromptAssembler, RelevanceService,
    SchemaService, SqlValidator, WarehousePool,
};
use vega::utils::{JwtUtil, ScheduledExecutor};
use vega::{AppState, db, handlers, middleware, models};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::auth::guest_token,
        handlers::auth::me,

        handlers::sessions::create_session,
        handlers::sessions::get_session,
        handlers::sessions::create_request,
        handlers::sessions::stream_session,

        handlers::requests::get_request,
        handlers::requests::cancel_request,

        handlers::data::get_data,
    ),
    components(
        schemas(
            models::Session,
            models::CreateSessionRequest,
            models::CreateSessionResponse,
            models::Request,
            models::RequestStatus,
            models::RequestError,
            models::CreateRequestBody,
            models::CreateRequestResponse,
            models::RequestView,
            models::QueryMetadata,
            models::Column,
            handlers::auth::GuestTokenResponse,
            handlers::data::DataResponse,
        )
    ),
    tags(
        (name = "Authentication", description = "Guest token issuing"),
        (name = "Sessions", description = "Session and request lifecycle"),
        (name = "Requests", description = "Request state and cancellation"),
        (name = "Data", description = "Paginated query results"),
    ),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::Http::new(
                        utoipa::openapi::security::HttpAuthScheme::Bearer,
                    ),
                ),
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    let _log_guard = if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("vega.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
        Some(guard)
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
        None
    };

    tracing::info!("Vega starting up");

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Operational store ready");

    let jwt_util = Arc::new(JwtUtil::new(&config.auth.jwt_secret, &config.auth.jwt_expires_in));

    let default_dialect =
        Dialect::parse(&config.agent.default_dialect).unwrap_or(Dialect::Trino);
    let warehouses = Arc::new(WarehousePool::new(config.warehouses.clone(), default_dialect));

    let cache = match config.cache.backend.as_str() {
        "memory" => CacheHandle::new(Arc::new(MemoryCache::new())),
        "sqlite" => CacheHandle::new(Arc::new(SqliteCache::new(pool.clone()))),
        _ => CacheHandle::disabled(),
    };
    tracing::info!("Cache backend: {}", config.cache.backend);

    let relevance = Arc::new(RelevanceService::new(EmbeddingClient::from_config(
        &config.embedding,
    )));
    if !relevance.is_enabled() {
        tracing::warn!("No embedding provider configured; relevance lookups are disabled");
    }

    let mut descriptors: HashMap<String, SchemaDescriptor> = HashMap::new();
    for (profile, warehouse_config) in &config.warehouses {
        if let Some(path) = &warehouse_config.descriptor_path {
            match SchemaDescriptor::load(std::path::Path::new(path)) {
                Ok(descriptor) => {
                    tracing::info!(
                        "Loaded schema descriptor for '{}' ({} tables)",
                        profile,
                        descriptor.tables.len()
                    );
                    descriptors.insert(profile.clone(), descriptor);
                },
                Err(e) => tracing::warn!("Descriptor for '{}' not loaded: {}", profile, e),
            }
        }
    }

    let schema_service = Arc::new(SchemaService::new(
        Arc::clone(&warehouses),
        Arc::clone(&relevance),
        cache.clone(),
        descriptors,
        config.prompt.client.clone(),
        config.prompt.env.clone(),
        Duration::from_secs(config.cache.full_schema_ttl_secs),
    ));

    let validator = Arc::new(SqlValidator::new(
        Arc::clone(&warehouses),
        cache.clone(),
        Duration::from_secs(config.cache.validation_ok_ttl_secs),
        Duration::from_secs(config.cache.validation_err_ttl_secs),
    ));

    let assembler = Arc::new(PromptAssembler::load(&config.prompt)?);
    tracing::info!("Prompt pack loaded; slots: {:?}", assembler.slot_names());

    let repository = Arc::new(AgentRepository::new(pool.clone()));
    let events = Arc::new(EventHub::default());

    let provider = Arc::new(MetadataProvider::new(
        Arc::clone(&warehouses),
        Arc::clone(&schema_service),
        Arc::clone(&relevance),
        Arc::clone(&validator),
        Arc::clone(&repository),
        Arc::clone(&assembler),
        cache.clone(),
        config.agent.clone(),
        config.prompt.client.clone(),
        config.prompt.env.clone(),
        Duration::from_secs(config.cache.examples_ttl_secs),
    ));

    let llm_client = Arc::new(OpenAiCompatClient::new(config.llm.clone()));
    let flow = Arc::new(AgentFlow::new(
        Arc::clone(&repository),
        Arc::clone(&provider),
        Arc::clone(&assembler),
        Arc::clone(&warehouses),
        Arc::clone(&events),
        llm_client,
        config.agent.clone(),
    ));

    // Queue workers: horizontal throughput within the process
    let _worker_handles =
        agent::spawn_workers(Arc::clone(&repository), Arc::clone(&flow), config.agent.worker_count);
    tracing::info!("Started {} queue workers", config.agent.worker_count);

    // Crash recovery: fail requests abandoned in_progress
    let monitor = Arc::new(agent::StaleRequestMonitor::new(
        Arc::clone(&repository),
        Arc::clone(&events),
        config.agent.stale_after_secs,
    ));
    let monitor_executor = ScheduledExecutor::new(
        "stale-request-monitor",
        Duration::from_secs(config.agent.monitor_interval_secs),
    );
    tokio::spawn(async move {
        monitor_executor.start(monitor).await;
    });

    // Vector index rebuild: offline job, runs in the background at startup
    {
        let schema_service = Arc::clone(&schema_service);
        let repository = Arc::clone(&repository);
        let profiles: Vec<String> = config.warehouses.keys().cloned().collect();
        tokio::spawn(async move {
            for profile in profiles {
                let learned = repository
                    .learned_examples(&profile)
                    .await
                    .unwrap_or_default();
                if let Err(e) = schema_service.rebuild_indices(&profile, learned).await {
                    tracing::warn!("Index rebuild for '{}' failed: {}", profile, e);
                }
            }
        });
    }

    let config = Arc::new(config);
    let app_state = Arc::new(AppState {
        db: pool.clone(),
        config: Arc::clone(&config),
        jwt_util: Arc::clone(&jwt_util),
        repository: Arc::clone(&repository),
        warehouses: Arc::clone(&warehouses),
        events: Arc::clone(&events),
        provider: Arc::clone(&provider),
    });

    let auth_state = middleware::AuthState { jwt_util: Arc::clone(&jwt_util) };

    let public_routes = Router::new()
        .route("/api/auth/guest", post(handlers::auth::guest_token))
        .with_state(Arc::clone(&app_state));

    let protected_routes = Router::new()
        .route("/api/auth/me", get(handlers::auth::me))
        .route("/api/sessions", post(handlers::sessions::create_session))
        .route("/api/sessions/:id", get(handlers::sessions::get_session))
        .route("/api/sessions/:id/requests", post(handlers::sessions::create_request))
        .route("/api/sessions/:id/stream", get(handlers::sessions::stream_session))
        .route("/api/requests/:id", get(handlers::requests::get_request))
        .route("/api/requests/:id/cancel", post(handlers::requests::cancel_request))
        .route("/api/data/:query_id", get(handlers::data::get_data))
        .with_state(Arc::clone(&app_state))
        .layer(axum_middleware::from_fn_with_state(auth_state, middleware::auth_middleware));

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check));

    let app = Router::new()
        .merge(SwaggerUi::new("/api-docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(public_routes)
        .merge(protected_routes)
        .merge(health_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("API documentation available at http://{}/api-docs", addr);
    tracing::info!("Vega is ready to serve requests");

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn ready_check() -> &'static str {
    "READY"
}
