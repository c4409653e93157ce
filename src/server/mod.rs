// HTTP surface: router, shared state, and the health endpoint. The chat
// proxy entry lives in `chat`, conversation endpoints in `messages`.

pub mod chat;
pub mod intent;
pub mod messages;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post, put};
use axum::Router;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::abort::AbortRegistry;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::persist::Store;
use crate::providers::{Provider, ProviderKind};
use crate::ratelimit::RateLimiter;
use crate::tools::ToolRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub store: Store,
    pub providers: Arc<HashMap<String, Arc<Provider>>>,
    pub default_provider_id: String,
    pub registry: Arc<ToolRegistry>,
    pub aborts: AbortRegistry,
    pub limiter: RateLimiter,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: GatewayConfig, store: Store, registry: ToolRegistry) -> Self {
        let limiter = RateLimiter::new(config.rate_max, config.rate_window_secs);
        let providers = Arc::new(build_providers(&config));
        Self {
            config,
            store,
            providers,
            default_provider_id: "openai".to_string(),
            registry: Arc::new(registry),
            aborts: AbortRegistry::new(),
            limiter,
            started_at: Instant::now(),
        }
    }

    /// Resolve the caller's user id from `x-session-id`. Sessions are
    /// owned by the auth collaborator; unknown sessions are anonymous.
    pub async fn resolve_user(&self, headers: &HeaderMap) -> Result<Option<String>, GatewayError> {
        let Some(session_id) = headers.get("x-session-id").and_then(|v| v.to_str().ok()) else {
            return Ok(None);
        };
        self.store.resolve_session_user(session_id).await
    }

    /// Select a provider: explicit id, then the configured default. Ids not
    /// in the static set fall back to the `providers` table.
    pub async fn provider_for(&self, id: Option<&str>) -> Result<Arc<Provider>, GatewayError> {
        let id = id.unwrap_or(&self.default_provider_id);
        if let Some(provider) = self.providers.get(id) {
            return Ok(provider.clone());
        }

        if let Some((row_id, kind, base_url, model_default)) =
            self.store.get_provider_row(id).await?
        {
            let kind = ProviderKind::parse(&kind).ok_or_else(|| {
                GatewayError::validation(
                    "invalid_intent",
                    format!("provider {} has unknown kind", row_id),
                    None,
                    None,
                )
            })?;
            let settings = match kind {
                ProviderKind::OpenAi | ProviderKind::OpenAiResponses => &self.config.openai,
                ProviderKind::Anthropic => &self.config.anthropic,
                ProviderKind::Gemini => &self.config.gemini,
            };
            return Ok(Arc::new(Provider::new(
                row_id,
                kind,
                settings.api_key.clone(),
                None,
                base_url.as_deref(),
                model_default.unwrap_or_else(|| default_model_for(kind).to_string()),
                self.config.request_timeout_secs,
                self.config.models_timeout_secs,
            )));
        }

        Err(GatewayError::validation(
            "missing_required_field",
            format!("unknown provider {}", id),
            None,
            None,
        ))
    }
}

fn default_model_for(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "gpt-4o-mini",
        ProviderKind::OpenAiResponses => "gpt-5-mini",
        ProviderKind::Anthropic => "claude-sonnet-4-20250514",
        ProviderKind::Gemini => "gemini-2.0-flash",
    }
}

fn build_providers(config: &GatewayConfig) -> HashMap<String, Arc<Provider>> {
    let mut providers = HashMap::new();

    let entries: [(&str, ProviderKind, &crate::config::ProviderSettings); 4] = [
        ("openai", ProviderKind::OpenAi, &config.openai),
        ("openai-responses", ProviderKind::OpenAiResponses, &config.openai),
        ("anthropic", ProviderKind::Anthropic, &config.anthropic),
        ("gemini", ProviderKind::Gemini, &config.gemini),
    ];

    for (id, kind, settings) in entries {
        let settings_url = (!settings.base_url.is_empty()).then_some(settings.base_url.as_str());
        providers.insert(
            id.to_string(),
            Arc::new(Provider::new(
                id,
                kind,
                settings.api_key.clone(),
                settings_url,
                None,
                default_model_for(kind),
                config.request_timeout_secs,
                config.models_timeout_secs,
            )),
        );
    }
    providers
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/chat/abort", post(chat::abort_stream))
        .route("/v1/models", get(list_models))
        .route("/v1/conversations", get(messages::list_conversations))
        .route(
            "/v1/conversations/{id}",
            get(messages::get_conversation).delete(messages::delete_conversation),
        )
        .route("/v1/conversations/{id}/messages", get(messages::get_messages))
        .route(
            "/v1/conversations/{id}/messages/{mid}/edit",
            put(messages::edit_message),
        )
        .route("/healthz", get(health))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let provider = state
        .providers
        .get(&state.default_provider_id)
        .map(|p| p.id.clone())
        .unwrap_or_default();
    let model = state
        .providers
        .get(&state.default_provider_id)
        .map(|p| p.default_model.clone())
        .unwrap_or_default();

    Json(json!({
        "status": "ok",
        "provider": provider,
        "model": model,
        "uptime": state.started_at.elapsed().as_secs(),
        "persistence": {
            "enabled": state.config.persist_transcripts,
            "retentionDays": state.config.retention_days,
        },
    }))
}

async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, GatewayError> {
    let provider_id = headers
        .get("x-provider-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let provider = state.provider_for(provider_id.as_deref()).await?;

    let models = provider
        .list_models()
        .await
        .map_err(|err| GatewayError::Provider {
            message: err.body,
            status: (err.status != 0).then_some(err.status),
        })?;
    Ok(Json(json!({ "data": models })))
}
