use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use assistant_bridge::app::{self, AppState, Notifier, Orchestrator};
use assistant_bridge::clients::{AssistantClient, ChatwootClient};
use assistant_bridge::types::Config;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            std::process::exit(1);
        }
    };

    let http = reqwest::Client::new();
    let chatwoot = ChatwootClient::new(
        http.clone(),
        config.chatwoot_base_url.clone(),
        config.chatwoot_account_id.clone(),
        config.chatwoot_api_key.clone(),
    );
    let assistant = AssistantClient::new(
        http.clone(),
        config.openai_api_key.clone(),
        config.openai_assistant_id.clone(),
    );
    let notifier = Notifier::new(http, config.google_chat_webhook_url.clone());
    let orchestrator = Orchestrator::new(
        assistant.clone(),
        notifier.clone(),
        config.max_ai_retries,
    );

    let state = Arc::new(AppState {
        chatwoot,
        assistant,
        orchestrator,
        notifier,
        webhook_secret: config.webhook_secret.clone(),
        orchestration_timeout: AppState::orchestration_timeout_default(),
        thread_locks: Mutex::new(HashMap::new()),
    });

    let router = app::router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    tracing::info!(%addr, "assistant bridge listening");
    axum::serve(listener, router)
        .await
        .expect("server runtime failure");
}
