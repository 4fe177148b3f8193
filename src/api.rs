use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::auth::{usable_token, TokenProvider};
use crate::retry::{retry_async, RetryPolicy};
use crate::stream::proto::{GenerationRequest, GenerationResponse, Img2ImgRequest};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const API_PREFIX: &str = "/api/v1";
pub const LOCAL_API_BASE_URL: &str = "http://localhost:8000";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GenerationApiDefaults;

impl GenerationApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Per-call timeout for `txt2img` / `img2img`, which run a full diffusion
    /// pass server-side.
    pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(300);
}

#[derive(Clone, Debug)]
pub struct GenerationApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub generation_timeout: Duration,
    /// Applied to control-plane calls only; generation calls are attempted
    /// once.
    pub retry_policy: RetryPolicy,
}

impl Default for GenerationApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: GenerationApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: GenerationApiDefaults::ATTEMPT_TIMEOUT,
            generation_timeout: GenerationApiDefaults::GENERATION_TIMEOUT,
            retry_policy: RetryPolicy::control_plane(),
        }
    }
}

/// HTTP client for the generation service's REST surface.
#[derive(Clone)]
pub struct GenerationApiClient {
    http: Client,
    tokens: Option<Arc<dyn TokenProvider>>,
    base_url: String,
    attempt_timeout: Duration,
    generation_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl fmt::Debug for GenerationApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationApiClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.tokens.is_some())
            .field("attempt_timeout", &self.attempt_timeout)
            .field("generation_timeout", &self.generation_timeout)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

impl GenerationApiClient {
    /// Creates an unauthenticated client; only `health` and `list_models`
    /// succeed without a token.
    pub fn new() -> Result<Self, ApiError> {
        Self::with_options(None, GenerationApiClientOptions::default())
    }

    pub fn with_token_provider(tokens: impl TokenProvider + 'static) -> Result<Self, ApiError> {
        Self::with_options(Some(Arc::new(tokens)), GenerationApiClientOptions::default())
    }

    pub fn with_options(
        tokens: Option<Arc<dyn TokenProvider>>,
        options: GenerationApiClientOptions,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            tokens,
            base_url: LOCAL_API_BASE_URL.to_string(),
            attempt_timeout: options.attempt_timeout,
            generation_timeout: options.generation_timeout,
            retry_policy: options.retry_policy,
        })
    }

    /// Sets the service root, e.g. `https://gen.example.com`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthResponse, ApiError> {
        self.control(Method::GET, "/health", None::<&()>, false).await
    }

    /// Model ids known to the service.
    pub async fn list_models(&self) -> Result<Vec<String>, ApiError> {
        self.control(Method::GET, &api_path("/models/"), None::<&()>, false)
            .await
    }

    pub async fn load_model(&self, model_id: &str) -> Result<MessageResponse, ApiError> {
        let body = LoadModelRequest { model_id };
        self.control(Method::POST, &api_path("/models/load"), Some(&body), true)
            .await
    }

    /// LoRA adapters currently loaded into the pipeline.
    pub async fn list_loras(&self) -> Result<Vec<String>, ApiError> {
        self.control(Method::GET, &api_path("/loras/list"), None::<&()>, true)
            .await
    }

    pub async fn load_lora(&self, lora_path: &str) -> Result<MessageResponse, ApiError> {
        let body = LoraRequest { lora_path };
        self.control(Method::POST, &api_path("/loras/load"), Some(&body), true)
            .await
    }

    pub async fn unload_lora(&self, lora_path: &str) -> Result<MessageResponse, ApiError> {
        let body = LoraRequest { lora_path };
        self.control(Method::POST, &api_path("/loras/unload"), Some(&body), true)
            .await
    }

    /// Runs a text-to-image generation and waits for the finished image.
    pub async fn txt2img(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ApiError> {
        let request = request.clone().normalized();
        request.validate().map_err(ApiError::InvalidRequest)?;
        self.generate(&api_path("/generate/txt2img"), &request).await
    }

    pub async fn img2img(&self, request: &Img2ImgRequest) -> Result<GenerationResponse, ApiError> {
        let mut request = request.clone();
        request.generation = request.generation.normalized();
        request.validate().map_err(ApiError::InvalidRequest)?;
        self.generate(&api_path("/generate/img2img"), &request).await
    }

    async fn control<B, R>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        authenticated: bool,
    ) -> Result<R, ApiError>
    where
        B: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let token = self.token(authenticated)?;
        let endpoint = self.endpoint(path);

        retry_async(
            &self.retry_policy,
            |_| {
                self.send_attempt(
                    method.clone(),
                    &endpoint,
                    body,
                    token.as_ref(),
                    self.attempt_timeout,
                )
            },
            ApiError::is_retryable,
        )
        .await
    }

    async fn generate<B>(&self, path: &str, body: &B) -> Result<GenerationResponse, ApiError>
    where
        B: Serialize + Sync + ?Sized,
    {
        let token = self.token(true)?;
        let endpoint = self.endpoint(path);
        debug!(event = "generation_request", endpoint = %endpoint);

        self.send_attempt(
            Method::POST,
            &endpoint,
            Some(body),
            token.as_ref(),
            self.generation_timeout,
        )
        .await
    }

    fn token(&self, authenticated: bool) -> Result<Option<SecretString>, ApiError> {
        if !authenticated {
            return Ok(None);
        }
        let tokens = self
            .tokens
            .as_deref()
            .ok_or(ApiError::AuthenticationRequired)?;
        usable_token(tokens)
            .map(Some)
            .ok_or(ApiError::AuthenticationRequired)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_attempt<B, R>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
        token: Option<&SecretString>,
        timeout: Duration,
    ) -> Result<R, ApiError>
    where
        B: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let mut builder = self.http.request(method, endpoint).timeout(timeout);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token.expose_secret());
        }

        let response = builder.send().await.map_err(ApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        serde_json::from_str(&body).map_err(|err| ApiError::Parse(err.to_string()))
    }
}

fn api_path(path: &str) -> String {
    format!("{API_PREFIX}{path}")
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
}

/// Acknowledgement returned by model and LoRA management calls.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
struct LoadModelRequest<'a> {
    model_id: &'a str,
}

#[derive(Debug, Serialize)]
struct LoraRequest<'a> {
    lora_path: &'a str,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required: no access token available")]
    AuthenticationRequired,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::AuthenticationRequired | Self::InvalidRequest(_) | Self::Parse(_) => false,
        }
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        detail: Option<Value>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        let detail = parsed.detail.and_then(|detail| match detail {
            Value::Null => None,
            Value::String(text) => Some(text),
            other => Some(other.to_string()),
        });
        if let Some(message) = detail.or(parsed.error).or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
