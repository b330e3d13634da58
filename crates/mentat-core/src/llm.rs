use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use log::{debug, warn};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::timeout;

use crate::config::EngineConfig;
use crate::error::CoreError;

/// A single chat message sent to the model server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Request issued against the transport. `format` carries the JSON schema the
/// server is asked to conform to; streaming is always off.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub format: Option<Value>,
    pub temperature: f64,
}

/// Transport to an out-of-process model server.
///
/// Implementations must bound every call with their own deadline; callers add
/// a second hard timeout on top so a misbehaving implementation cannot stall
/// the decision cycle.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    /// Send a chat request and return the raw message content.
    async fn chat(&self, request: ChatRequest) -> Result<String, CoreError>;

    /// Lightweight liveness probe (list-models).
    async fn list_models(&self) -> Result<Vec<String>, CoreError>;
}

/// HTTP transport for an Ollama-style local model server.
pub struct HttpTransport {
    base_url: String,
    request_timeout: Duration,
    client: OnceLock<reqwest::Client>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            client: OnceLock::new(),
        }
    }

    /// Build the underlying client on first use.
    fn client(&self) -> Result<reqwest::Client, CoreError> {
        if let Some(client) = self.client.get() {
            return Ok(client.clone());
        }
        let built = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| CoreError::Transport(format!("failed to build http client: {e}")))?;
        Ok(self.client.get_or_init(|| built).clone())
    }
}

#[async_trait]
impl LlmTransport for HttpTransport {
    async fn chat(&self, request: ChatRequest) -> Result<String, CoreError> {
        let client = self.client()?;
        let mut payload = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": false,
            "options": { "temperature": request.temperature },
        });
        if let Some(schema) = request.format {
            payload["format"] = schema;
        }

        let url = format!("{}/api/chat", self.base_url);
        debug!("llm.request url={} model={}", url, request.model);

        let response = client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::Timeout(self.request_timeout.as_secs())
                } else {
                    CoreError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(CoreError::Transport(format!(
                "server returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        body.get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| CoreError::Transport("response missing message content".to_string()))
    }

    async fn list_models(&self) -> Result<Vec<String>, CoreError> {
        let client = self.client()?;
        let url = format!("{}/api/tags", self.base_url);
        let body: Value = client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        Ok(body
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Structured-output client over an [`LlmTransport`].
///
/// `structured_query` is the only way the engine talks to the model: a typed
/// request whose response is schema-validated before deserialization. Every
/// failure mode collapses to `None`; callers treat that as "LLM unavailable"
/// and degrade.
pub struct LlmClient {
    transport: std::sync::Arc<dyn LlmTransport>,
    model: String,
    default_temperature: f64,
    max_retries: u32,
    attempt_timeout: Duration,
}

impl LlmClient {
    /// Build a client over the HTTP transport described by the configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        let attempt_timeout = Duration::from_secs(config.llm_timeout);
        Self {
            transport: std::sync::Arc::new(HttpTransport::new(
                config.llm_host.clone(),
                attempt_timeout,
            )),
            model: config.llm_model.clone(),
            default_temperature: config.llm_temperature,
            max_retries: config.llm_max_retries,
            attempt_timeout,
        }
    }

    /// Build a client over an injected transport. Test seam.
    pub fn with_transport(
        transport: std::sync::Arc<dyn LlmTransport>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            transport,
            model: config.llm_model.clone(),
            default_temperature: config.llm_temperature,
            max_retries: config.llm_max_retries,
            attempt_timeout: Duration::from_secs(config.llm_timeout),
        }
    }

    pub fn default_temperature(&self) -> f64 {
        self.default_temperature
    }

    /// Query the model for a value of type `T`, validating the response
    /// against `T`'s generated JSON schema.
    ///
    /// Retries both transport failures and malformed output within the same
    /// budget. Worst-case wall clock is `attempt_timeout * (max_retries + 1)`.
    /// Never returns an error: exhaustion yields `None`.
    pub async fn structured_query<T>(
        &self,
        prompt: &str,
        temperature: f64,
        max_retries: u32,
    ) -> Option<T>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let schema = match serde_json::to_value(schemars::schema_for!(T)) {
            Ok(schema) => schema,
            Err(e) => {
                warn!("llm.schema_generation_failed err={e}");
                return None;
            }
        };
        let compiled = match JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema)
        {
            Ok(compiled) => compiled,
            Err(e) => {
                warn!("llm.schema_compile_failed err={e}");
                return None;
            }
        };

        let attempts = max_retries.saturating_add(1);
        for attempt in 0..attempts {
            let request = ChatRequest {
                model: self.model.clone(),
                messages: vec![ChatMessage::user(prompt)],
                format: Some(schema.clone()),
                temperature,
            };

            let content = match timeout(self.attempt_timeout, self.transport.chat(request)).await {
                Ok(Ok(content)) => content,
                Ok(Err(e)) => {
                    debug!("llm.attempt_failed attempt={attempt} err={e}");
                    continue;
                }
                Err(_) => {
                    debug!(
                        "llm.attempt_timeout attempt={attempt} deadline_s={}",
                        self.attempt_timeout.as_secs()
                    );
                    continue;
                }
            };

            match Self::validate_and_parse::<T>(&content, &compiled) {
                Ok(value) => return Some(value),
                Err(e) => {
                    debug!("llm.malformed_output attempt={attempt} err={e}");
                    continue;
                }
            }
        }

        warn!("llm.exhausted attempts={attempts}");
        None
    }

    /// Convenience wrapper using the configured temperature and retry budget.
    pub async fn structured_query_default<T>(&self, prompt: &str) -> Option<T>
    where
        T: DeserializeOwned + JsonSchema,
    {
        self.structured_query(prompt, self.default_temperature, self.max_retries)
            .await
    }

    /// Probe the transport, bounded by the per-attempt timeout.
    pub async fn check_connection(&self) -> bool {
        matches!(
            timeout(self.attempt_timeout, self.transport.list_models()).await,
            Ok(Ok(_))
        )
    }

    fn validate_and_parse<T: DeserializeOwned>(
        content: &str,
        compiled: &JSONSchema,
    ) -> Result<T, CoreError> {
        let raw = extract_json(content);
        let value: Value = serde_json::from_str(raw)?;
        compiled.validate(&value).map_err(|errors| {
            CoreError::SchemaValidation(
                errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; "),
            )
        })?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Strip a markdown code fence if the model wrapped its JSON in one.
fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("```json").or_else(|| trimmed.strip_prefix("```")) {
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
    }
    trimmed
}
