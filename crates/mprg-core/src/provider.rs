//! Collaborator ports for reasoning and embedding, plus their implementations.
//!
//! The pipeline depends only on [`ReasoningProvider`] and
//! [`EmbeddingProvider`]. One adapter per backend: OpenAI-compatible chat and
//! embeddings, Anthropic Messages, Voyage embeddings, and
//! [`LexicalEmbedder`], a deterministic offline embedder.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ProviderError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20240620";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const VOYAGE_BASE_URL: &str = "https://api.voyageai.com/v1";
pub const VOYAGE_MODEL: &str = "voyage-3";

const OPENAI_KEY_VAR: &str = "OPENAI_API_KEY";
const ANTHROPIC_KEY_VAR: &str = "ANTHROPIC_API_KEY";
const VOYAGE_KEY_VAR: &str = "VOYAGE_API_KEY";

/// Dispatches one prompt to a reasoning model.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Send `prompt` on behalf of the role `role_variant` and return the raw text.
    async fn invoke(&self, prompt: &str, role_variant: &str) -> Result<String, ProviderError>;
}

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Length of every vector this provider returns.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

// ---------------------------------------------------------------------------
// Provider selection
// ---------------------------------------------------------------------------

/// Which reasoning backend serves agent calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" | "claude" => Some(ProviderKind::Anthropic),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    /// Environment variable holding this backend's API key.
    pub fn key_var(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => OPENAI_KEY_VAR,
            ProviderKind::Anthropic => ANTHROPIC_KEY_VAR,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared HTTP plumbing
// ---------------------------------------------------------------------------

fn build_client(timeout_secs: u64) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ProviderError::Http(format!("failed to build HTTP client: {e}")))
}

fn key_from(explicit: &Option<String>, var: &'static str) -> Result<String, ProviderError> {
    explicit
        .clone()
        .or_else(|| std::env::var(var).ok())
        .filter(|k| !k.is_empty())
        .ok_or(ProviderError::MissingApiKey(var))
}

fn env_key(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|k| !k.is_empty())
}

/// Send a prepared JSON request and decode a successful body.
async fn send_json<Resp>(
    request: reqwest::RequestBuilder,
    timeout_secs: u64,
) -> Result<Resp, ProviderError>
where
    Resp: for<'de> Deserialize<'de>,
{
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Timeout(timeout_secs)
        } else {
            ProviderError::Http(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unable to read response body".to_string());
        return Err(ProviderError::Status { status, body });
    }

    response
        .json()
        .await
        .map_err(|e| ProviderError::Decode(e.to_string()))
}

/// First embedding of an `/embeddings`-shaped response, in input order.
fn first_embedding(response: EmbeddingsResponse) -> Result<Vec<f32>, ProviderError> {
    let mut data = response.data;
    data.sort_by_key(|d| d.index);
    data.into_iter()
        .next()
        .map(|d| d.embedding)
        .ok_or_else(|| ProviderError::Decode("empty embedding response".to_string()))
}

// ---------------------------------------------------------------------------
// OpenAI-compatible adapters
// ---------------------------------------------------------------------------

/// Connection settings shared by the OpenAI adapters.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key. Falls back to `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    /// Default: `https://api.openai.com/v1`, overridable by `MPRG_LLM_BASE_URL`.
    pub base_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    /// Dimension reported by the embedding adapter. Default: 1536.
    pub embedding_dimension: usize,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dimension: 1536,
            temperature: 0.6,
            timeout_secs: 60,
        }
    }
}

impl OpenAiConfig {
    /// Defaults overlaid with `OPENAI_API_KEY`, `MPRG_LLM_MODEL`,
    /// `MPRG_EMBEDDING_MODEL` and `MPRG_LLM_BASE_URL`.
    pub fn from_env() -> Self {
        let mut config = Self {
            api_key: env_key(OPENAI_KEY_VAR),
            ..Self::default()
        };
        if let Ok(model) = std::env::var("MPRG_LLM_MODEL") {
            config.chat_model = model;
        }
        if let Ok(model) = std::env::var("MPRG_EMBEDDING_MODEL") {
            config.embedding_model = model;
        }
        if let Ok(url) = std::env::var("MPRG_LLM_BASE_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        config
    }

    fn api_key(&self) -> Result<String, ProviderError> {
        key_from(&self.api_key, OPENAI_KEY_VAR)
    }

    async fn post<Req, Resp>(
        &self,
        client: &reqwest::Client,
        path: &str,
        body: &Req,
    ) -> Result<Resp, ProviderError>
    where
        Req: Serialize + ?Sized,
        Resp: for<'de> Deserialize<'de>,
    {
        let api_key = self.api_key()?;
        let url = format!("{}/{}", self.base_url, path);
        let request = client.post(&url).bearer_auth(api_key).json(body);
        send_json(request, self.timeout_secs).await
    }
}

/// Chat-completions reasoning provider.
pub struct OpenAiChatProvider {
    config: OpenAiConfig,
    client: Arc<reqwest::Client>,
}

impl OpenAiChatProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, ProviderError> {
        let client = build_client(config.timeout_secs)?;
        Ok(Self {
            config,
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl ReasoningProvider for OpenAiChatProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn invoke(&self, prompt: &str, role_variant: &str) -> Result<String, ProviderError> {
        tracing::debug!(role = role_variant, model = %self.config.chat_model, "invoking chat model");
        let request = ChatRequest {
            model: &self.config.chat_model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
        };
        let response: ChatResponse = self
            .config
            .post(&self.client, "chat/completions", &request)
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| ProviderError::Decode("response had no choices".to_string()))
    }
}

/// `/embeddings` provider.
pub struct OpenAiEmbeddingProvider {
    config: OpenAiConfig,
    client: Arc<reqwest::Client>,
}

impl OpenAiEmbeddingProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, ProviderError> {
        let client = build_client(config.timeout_secs)?;
        Ok(Self {
            config,
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn dimension(&self) -> usize {
        self.config.embedding_dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let request = EmbeddingsRequest {
            model: &self.config.embedding_model,
            input: vec![text],
        };
        let response = self.config.post(&self.client, "embeddings", &request).await?;
        first_embedding(response)
    }
}

// ---------------------------------------------------------------------------
// Anthropic Messages adapter
// ---------------------------------------------------------------------------

/// Settings for the Anthropic Messages API.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    /// API key. Falls back to `ANTHROPIC_API_KEY`.
    pub api_key: Option<String>,
    /// Host root without the `/v1` suffix; `ANTHROPIC_API_BASE` overrides.
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: ANTHROPIC_BASE_URL.to_string(),
            model: ANTHROPIC_MODEL.to_string(),
            max_tokens: 1024,
            temperature: 0.6,
            timeout_secs: 60,
        }
    }
}

impl AnthropicConfig {
    /// Defaults overlaid with `ANTHROPIC_API_KEY`, `ANTHROPIC_API_BASE` and
    /// `MPRG_LLM_MODEL`.
    pub fn from_env() -> Self {
        let mut config = Self {
            api_key: env_key(ANTHROPIC_KEY_VAR),
            ..Self::default()
        };
        if let Ok(model) = std::env::var("MPRG_LLM_MODEL") {
            config.model = model;
        }
        if let Ok(url) = std::env::var("ANTHROPIC_API_BASE") {
            config.base_url = normalize_anthropic_base(&url);
        }
        config
    }

    fn api_key(&self) -> Result<String, ProviderError> {
        key_from(&self.api_key, ANTHROPIC_KEY_VAR)
    }
}

/// Accept the base URL with or without a trailing `/v1`.
fn normalize_anthropic_base(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    trimmed.strip_suffix("/v1").unwrap_or(trimmed).to_string()
}

/// Messages API reasoning provider.
pub struct AnthropicProvider {
    config: AnthropicConfig,
    client: Arc<reqwest::Client>,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Result<Self, ProviderError> {
        let client = build_client(config.timeout_secs)?;
        Ok(Self {
            config,
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl ReasoningProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn invoke(&self, prompt: &str, role_variant: &str) -> Result<String, ProviderError> {
        tracing::debug!(role = role_variant, model = %self.config.model, "invoking messages API");
        let api_key = self.config.api_key()?;
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let request = self
            .client
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        let response: MessagesResponse = send_json(request, self.config.timeout_secs).await?;

        let text = response.text();
        if text.is_empty() {
            return Err(ProviderError::Decode(
                "response had no text content".to_string(),
            ));
        }
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// Voyage embeddings adapter
// ---------------------------------------------------------------------------

/// Settings for the Voyage AI embeddings API.
#[derive(Debug, Clone)]
pub struct VoyageConfig {
    /// API key. Falls back to `VOYAGE_API_KEY`.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub timeout_secs: u64,
}

impl Default for VoyageConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: VOYAGE_BASE_URL.to_string(),
            model: VOYAGE_MODEL.to_string(),
            dimension: 1024,
            timeout_secs: 60,
        }
    }
}

impl VoyageConfig {
    /// Defaults overlaid with `VOYAGE_API_KEY` and `MPRG_EMBEDDING_MODEL`.
    pub fn from_env() -> Self {
        let mut config = Self {
            api_key: env_key(VOYAGE_KEY_VAR),
            ..Self::default()
        };
        if let Ok(model) = std::env::var("MPRG_EMBEDDING_MODEL") {
            config.model = model;
        }
        config
    }
}

pub struct VoyageEmbeddingProvider {
    config: VoyageConfig,
    client: Arc<reqwest::Client>,
}

impl VoyageEmbeddingProvider {
    pub fn new(config: VoyageConfig) -> Result<Self, ProviderError> {
        let client = build_client(config.timeout_secs)?;
        Ok(Self {
            config,
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for VoyageEmbeddingProvider {
    fn name(&self) -> &'static str {
        "voyage"
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let api_key = key_from(&self.config.api_key, VOYAGE_KEY_VAR)?;
        let body = EmbeddingsRequest {
            model: &self.config.model,
            input: vec![text],
        };
        let request = self
            .client
            .post(format!("{}/embeddings", self.config.base_url))
            .bearer_auth(api_key)
            .json(&body);
        first_embedding(send_json(request, self.config.timeout_secs).await?)
    }
}

// -- request/response types --

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl MessagesResponse {
    /// Text blocks joined by newlines; other block types are skipped.
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

// ---------------------------------------------------------------------------
// Offline embedder
// ---------------------------------------------------------------------------

/// Deterministic bag-of-words embedder.
///
/// Each lowercase alphanumeric token is hashed with SHA-256 into one of
/// `dimension` buckets with a hash-derived sign; the vector is L2-normalized.
/// Identical texts embed identically and texts with no shared tokens are
/// close to orthogonal.
#[derive(Debug, Clone)]
pub struct LexicalEmbedder {
    dimension: usize,
}

impl LexicalEmbedder {
    pub const DEFAULT_DIMENSION: usize = 256;

    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes([
                hash[0], hash[1], hash[2], hash[3], hash[4], hash[5], hash[6], hash[7],
            ]) as usize
                % self.dimension;
            let sign = if hash[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for LexicalEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingProvider for LexicalEmbedder {
    fn name(&self) -> &'static str {
        "lexical"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embed_text(text))
    }
}
