mod error;
mod routes;

use std::sync::Arc;

use anyhow::Result;
use mentora_core::config::MentoraConfig;
use mentora_core::directory::{create_directory, UserDirectory};
use mentora_core::generator::LlmGenerator;
use mentora_core::llm::LlmService;
use mentora_core::storage::{create_backend, Storage};
use mentora_core::CoachingService;

pub type Coaching = CoachingService<Storage, LlmGenerator, UserDirectory>;

pub struct AppState {
    pub coaching: Coaching,
    pub config: MentoraConfig,
    pub storage_backend: &'static str,
    pub directory_mode: &'static str,
}

impl AppState {
    pub fn from_config(config: MentoraConfig) -> Result<Self> {
        let storage = create_backend(&config)?;
        let storage_backend = storage.backend_name();
        let directory = create_directory(&config)?;
        let directory_mode = directory.mode();

        let llm = if config.llm.enabled {
            match LlmService::from_config(&config.llm) {
                Ok(llm) => Some(llm),
                Err(e) => {
                    tracing::warn!("LLM disabled, serving fallbacks only: {e}");
                    None
                }
            }
        } else {
            None
        };

        let coaching = CoachingService::new(
            Arc::new(storage),
            LlmGenerator::new(llm),
            directory,
            &config,
        )?;

        Ok(Self {
            coaching,
            config,
            storage_backend,
            directory_mode,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mentora_web=info,mentora_core=info".into()),
        )
        .init();

    let cwd = std::env::current_dir().ok();
    let config = MentoraConfig::load(cwd.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("config load failed, using defaults: {e}");
        MentoraConfig::default_config()
    });

    let addr = format!("{}:{}", config.web.host, config.web.port);
    let state = Arc::new(AppState::from_config(config)?);
    tracing::info!(
        storage = state.storage_backend,
        directory = state.directory_mode,
        generator = %state.coaching.generator().describe(),
        "coaching service ready"
    );

    let app = routes::router()
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    tracing::info!("mentora-web listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
