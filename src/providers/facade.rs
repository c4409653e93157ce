// Provider facade: one instance per configured upstream, holding
// credentials, the resolved base URL, capability flags, and the HTTP call
// itself. Wire translation is delegated to the adapter for the provider's
// wire format; nothing wire-shaped escapes this module.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::time::Duration;

use crate::error::{GatewayError, ProviderModelsError};
use crate::providers::adapter::{Adapter, StreamContext, StreamTranslator, TranslatedRequest};
use crate::providers::anthropic::{AnthropicAdapter, ANTHROPIC_VERSION};
use crate::providers::chat_completions::ChatCompletionsAdapter;
use crate::providers::gemini::GeminiAdapter;
use crate::providers::responses::ResponsesAdapter;
use crate::providers::types::{uniform_toolset, ChatRequest};

/// Wire family of an upstream provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    OpenAiResponses,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "openai" | "openai-compatible" => Some(Self::OpenAi),
            "openai-responses" | "responses" => Some(Self::OpenAiResponses),
            "anthropic" => Some(Self::Anthropic),
            "gemini" | "google" => Some(Self::Gemini),
            _ => None,
        }
    }

    pub const fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi | Self::OpenAiResponses => "https://api.openai.com",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
        }
    }

    const fn is_openai_family(&self) -> bool {
        matches!(self, Self::OpenAi | Self::OpenAiResponses)
    }
}

/// Resolve the effective base URL.
///
/// An explicit empty-string override always falls back to the kind's
/// static default, never to a config-provided URL. Custom URLs get a
/// trailing `/v1` stripped for the OpenAI-compatible family only.
pub fn resolve_base_url(
    kind: ProviderKind,
    settings_url: Option<&str>,
    config_url: Option<&str>,
) -> String {
    let chosen = match settings_url {
        Some("") => None,
        Some(url) => Some(url),
        None => config_url.filter(|url| !url.is_empty()),
    };

    match chosen {
        None => kind.default_base_url().to_string(),
        Some(url) => {
            let url = url.trim_end_matches('/');
            if kind.is_openai_family() {
                url.strip_suffix("/v1").unwrap_or(url).to_string()
            } else {
                url.to_string()
            }
        }
    }
}

/// A normalized entry from a provider's model listing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

pub struct Provider {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub default_model: String,
    api_key: String,
    client: reqwest::Client,
    models_client: reqwest::Client,
}

static CHAT_COMPLETIONS: ChatCompletionsAdapter = ChatCompletionsAdapter;
static RESPONSES: ResponsesAdapter = ResponsesAdapter;
static ANTHROPIC: AnthropicAdapter = AnthropicAdapter;
static GEMINI: GeminiAdapter = GeminiAdapter;

impl Provider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        kind: ProviderKind,
        api_key: impl Into<String>,
        settings_url: Option<&str>,
        config_url: Option<&str>,
        default_model: impl Into<String>,
        request_timeout_secs: u64,
        models_timeout_secs: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()
            .unwrap_or_default();
        let models_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(models_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            id: id.into(),
            kind,
            base_url: resolve_base_url(kind, settings_url, config_url),
            default_model: default_model.into(),
            api_key: api_key.into(),
            client,
            models_client,
        }
    }

    pub fn adapter(&self) -> &'static dyn Adapter {
        match self.kind {
            ProviderKind::OpenAi => &CHAT_COMPLETIONS,
            ProviderKind::OpenAiResponses => &RESPONSES,
            ProviderKind::Anthropic => &ANTHROPIC,
            ProviderKind::Gemini => &GEMINI,
        }
    }

    // ---- capability predicates ----

    pub fn supports_tools(&self) -> bool {
        true
    }

    pub fn supports_reasoning_controls(&self, model: &str) -> bool {
        match self.kind {
            ProviderKind::OpenAi | ProviderKind::OpenAiResponses => {
                model.starts_with("gpt-5")
                    || model.starts_with("o1")
                    || model.starts_with("o3")
                    || model.starts_with("o4")
            }
            ProviderKind::Anthropic | ProviderKind::Gemini => false,
        }
    }

    pub fn supports_prompt_caching(&self) -> bool {
        matches!(self.kind, ProviderKind::Anthropic)
    }

    pub fn needs_streaming_translation(&self) -> bool {
        self.adapter().needs_stream_translation()
    }

    // ---- translation entry points ----

    pub fn translate_request(&self, request: &ChatRequest) -> Result<TranslatedRequest, GatewayError> {
        let mut request = request.clone();
        if request.model.is_none() {
            request.model = Some(self.default_model.clone());
        }
        self.adapter().translate_request(&request)
    }

    /// Tools in the uniform internal OpenAI-function shape, for every
    /// provider. Conversion to the provider's own shape happens only
    /// inside `translate_request`.
    pub fn toolset_spec(&self, tools: &[Value]) -> Vec<Value> {
        uniform_toolset(tools)
    }

    pub fn stream_translator(&self, request_id: &str, model: &str) -> Box<dyn StreamTranslator> {
        self.adapter().stream_translator(StreamContext {
            id: request_id.to_string(),
            model: model.to_string(),
        })
    }

    // ---- HTTP ----

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match self.kind {
            ProviderKind::OpenAi | ProviderKind::OpenAiResponses => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.api_key)) {
                    headers.insert("Authorization", value);
                }
            }
            ProviderKind::Anthropic => {
                if let Ok(value) = HeaderValue::from_str(&self.api_key) {
                    headers.insert("x-api-key", value);
                }
                headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
            }
            ProviderKind::Gemini => {
                if let Ok(value) = HeaderValue::from_str(&self.api_key) {
                    headers.insert("x-goog-api-key", value);
                }
            }
        }
        headers
    }

    /// Unary request: translate, post, translate the response back.
    pub async fn send_request(&self, request: &ChatRequest) -> Result<Value, GatewayError> {
        let response = self.send_raw_request(request).await?;
        let raw: Value = response.json().await.map_err(|err| GatewayError::Provider {
            message: format!("unparsable upstream response: {}", err),
            status: None,
        })?;
        self.adapter().translate_response(raw)
    }

    /// Translate and post, returning the raw wire response (for streaming
    /// bodies).
    pub async fn send_raw_request(
        &self,
        request: &ChatRequest,
    ) -> Result<reqwest::Response, GatewayError> {
        let translated = self.translate_request(request)?;
        self.post(&translated).await
    }

    /// Streaming request; identical to the raw path with `stream` forced on.
    pub async fn stream_request(
        &self,
        request: &ChatRequest,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut request = request.clone();
        request.stream = Some(true);
        self.send_raw_request(&request).await
    }

    async fn post(&self, translated: &TranslatedRequest) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}{}", self.base_url, translated.path);
        log::debug!("provider {} POST {}", self.id, url);

        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers())
            .header("Content-Type", "application/json")
            .json(&translated.body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GatewayError::Provider {
                        message: format!("upstream timeout: {}", err),
                        status: None,
                    }
                } else {
                    GatewayError::Upstream(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("provider {} HTTP {}: {}", self.id, status, body);
            return Err(GatewayError::Provider {
                message: body,
                status: Some(status.as_u16()),
            });
        }

        Ok(response)
    }

    // ---- model listing ----

    fn models_path(&self) -> &'static str {
        match self.kind {
            ProviderKind::OpenAi | ProviderKind::OpenAiResponses | ProviderKind::Anthropic => {
                "/v1/models"
            }
            ProviderKind::Gemini => "/v1beta/models",
        }
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderModelsError> {
        let url = format!("{}{}", self.base_url, self.models_path());
        let response = self
            .models_client
            .get(&url)
            .headers(self.auth_headers())
            .send()
            .await
            .map_err(|err| ProviderModelsError {
                status: 0,
                body: err.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ProviderModelsError {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = serde_json::from_str(&body).map_err(|err| ProviderModelsError {
            status: status.as_u16(),
            body: format!("unparsable model list: {}", err),
        })?;
        Ok(normalize_models_payload(&payload))
    }
}

/// Normalize the model-listing shapes the providers return: OpenAI-style
/// `{data:[{id}]}`, Gemini-style `{models:[{name:"models/<id>"}]}`, raw
/// arrays of strings, and raw arrays of objects carrying `id` or a
/// normalizable `name`. Entries that fit none of those are dropped.
pub fn normalize_models_payload(payload: &Value) -> Vec<ModelInfo> {
    let entries: &[Value] = if let Some(data) = payload.get("data").and_then(Value::as_array) {
        data
    } else if let Some(models) = payload.get("models").and_then(Value::as_array) {
        models
    } else if let Some(raw) = payload.as_array() {
        raw
    } else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            if let Some(id) = entry.as_str() {
                return Some(ModelInfo {
                    id: id.to_string(),
                    display_name: None,
                });
            }

            let obj = entry.as_object()?;
            let display_name = obj
                .get("displayName")
                .or_else(|| obj.get("display_name"))
                .and_then(Value::as_str)
                .map(String::from);

            if let Some(id) = obj.get("id").and_then(Value::as_str) {
                return Some(ModelInfo {
                    id: id.to_string(),
                    display_name,
                });
            }

            // Gemini names look like "models/<id>"; take the trailing id.
            let name = obj.get("name").and_then(Value::as_str)?;
            let id = name.rsplit('/').next().filter(|id| !id.is_empty())?;
            Some(ModelInfo {
                id: id.to_string(),
                display_name,
            })
        })
        .collect()
}
