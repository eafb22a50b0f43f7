use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use shepherd_core::config::EngineConfig;
use shepherd_core::orchestrator::Engine;
use shepherd_core::resources::ResourceRegistry;

mod error;
mod extract;
mod llm;
mod middleware;
mod routes;
mod state;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Shepherd API",
        version = "0.1.0",
        description = "Pastoral chat for Christian marriages: per-turn safety triage, intake tracking, and gated resources and faith invitations."
    ),
    paths(
        routes::health::health_check,
        routes::chat::chat_turn,
        routes::conversations::list_conversations,
        routes::conversations::get_conversation,
        routes::conversations::list_messages,
        routes::prayer::create_prayer_request,
    ),
    components(schemas(
        HealthResponse,
        shepherd_core::error::ApiError,
        shepherd_core::conversation::ChatTurnRequest,
        shepherd_core::conversation::ChatTurnResponse,
        shepherd_core::conversation::Conversation,
        shepherd_core::conversation::ConversationState,
        shepherd_core::conversation::Message,
        shepherd_core::conversation::CreatePrayerRequest,
        shepherd_core::conversation::PrayerRequest,
        shepherd_core::conversation::PaginatedResponse<shepherd_core::conversation::Conversation>,
        shepherd_core::conversation::PaginatedResponse<shepherd_core::conversation::Message>,
        shepherd_core::intake::IntakeState,
        shepherd_core::cadence::CadenceState,
        shepherd_core::metadata::TurnMetadata,
        shepherd_core::metadata::BookAttribution,
        shepherd_core::metadata::Phase,
        shepherd_core::metadata::GateReason,
        shepherd_core::metadata::CadenceReason,
        shepherd_core::metadata::BookSelectionReason,
        shepherd_core::metadata::PipelinePath,
        shepherd_core::classify::Topic,
        shepherd_core::llm::Role,
    ))
)]
struct ApiDoc;

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub orchestration_enabled: bool,
    /// Books in the loaded resource registry
    pub resources: usize,
}

fn load_registry() -> ResourceRegistry {
    match std::env::var("SHEPHERD_RESOURCE_REGISTRY") {
        Ok(path) if !path.trim().is_empty() => match ResourceRegistry::load(path.trim()) {
            Ok(registry) => {
                tracing::info!(path = %path, books = registry.books.len(), "loaded resource registry");
                registry
            }
            Err(err) => {
                tracing::error!(path = %path, error = %err, "resource registry failed to load; using built-in");
                ResourceRegistry::builtin()
            }
        },
        _ => ResourceRegistry::builtin(),
    }
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "shepherd_api=debug,shepherd_core=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .expect("Failed to connect to database");

    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let config = EngineConfig::from_env();
    tracing::info!(
        model = %config.model_name,
        orchestration_enabled = config.orchestration_enabled,
        max_planner_retries = config.max_planner_retries,
        "engine configured"
    );
    let model = llm::OpenAiChatModel::from_env(config.planner_timeout());
    let engine = Engine::new(model, config, load_registry());

    let app_state = state::AppState {
        db: pool,
        engine: Arc::new(engine),
        turn_locks: state::TurnLocks::default(),
        prayer: state::PrayerForwarding::from_env(),
    };

    let cors_layer = middleware::cors::build_cors_layer();

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::chat::router().layer(middleware::rate_limit::chat_layer()))
        .merge(routes::conversations::router().layer(middleware::rate_limit::read_layer()))
        .merge(routes::prayer::router().layer(middleware::rate_limit::prayer_layer()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Shepherd API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}
