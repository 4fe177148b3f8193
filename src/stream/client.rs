//! Stream client: endpoint configuration and the active-session slot.
//!
//! A client owns at most one active session. Starting a new session cancels
//! the previous one before the new one can reach its observer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::info;

use crate::auth::{usable_token, TokenProvider};
use crate::stream::proto::GenerationRequest;
use crate::stream::session::{drive, DispatchGate, SessionCore, SessionHandle, SessionObserver};
use crate::stream::transport::{Connector, WsConnector};

/// Path of the streaming text-to-image route.
pub const STREAM_PATH: &str = "/api/v1/stream/generate/txt2img";
/// Local development websocket endpoint for the generation service.
pub const LOCAL_STREAM_ENDPOINT: &str = "ws://localhost:8000/api/v1/stream/generate/txt2img";
/// Query parameter carrying the access token.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Default values used by stream clients.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    /// Upper bound on connection establishment.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Runtime options for stream clients.
#[derive(Clone, Debug)]
pub struct StreamClientOptions {
    pub connect_timeout: Duration,
}

impl Default for StreamClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
        }
    }
}

/// Errors returned synchronously by [`StreamClient`].
///
/// Failures after a session has started are reported to its observer as
/// [`crate::stream::session::SessionError`] instead.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// The token provider had no usable token.
    #[error("authentication required: no access token available")]
    AuthenticationRequired,

    /// Request parameters failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The configured endpoint is not a usable websocket URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// `start` was called outside a tokio runtime.
    #[error("no tokio runtime available to drive the session")]
    NoRuntime,

    /// Stream protocol contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Holds the client's single active session.
struct SessionSlot {
    gate: DispatchGate,
    active: Mutex<Option<Arc<SessionCore>>>,
    next_id: AtomicU64,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            gate: Arc::new(ReentrantMutex::new(())),
            active: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Empties the slot if it still holds session `id`.
    fn release(&self, id: u64) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|core| core.id() == id) {
            *active = None;
        }
    }
}

/// Entry point for streaming generation sessions.
///
/// Clones share the endpoint, credentials and the active-session slot.
pub struct StreamClient<C = WsConnector> {
    endpoint: String,
    tokens: Arc<dyn TokenProvider>,
    connector: Arc<C>,
    options: StreamClientOptions,
    slot: Arc<SessionSlot>,
}

impl<C> Clone for StreamClient<C> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            tokens: Arc::clone(&self.tokens),
            connector: Arc::clone(&self.connector),
            options: self.options.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<C> fmt::Debug for StreamClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.endpoint)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl StreamClient<WsConnector> {
    /// Creates a client for the local development endpoint.
    pub fn new(tokens: impl TokenProvider + 'static) -> Self {
        Self::with_connector(tokens, WsConnector)
    }

    /// Creates a client for the service hosted at `base_url`.
    ///
    /// `http`/`https` base URLs are mapped to `ws`/`wss`.
    pub fn for_base_url(
        base_url: &str,
        tokens: impl TokenProvider + 'static,
    ) -> Result<Self, StreamClientError> {
        Self::new(tokens).with_base_url(base_url)
    }
}

impl<C: Connector> StreamClient<C> {
    /// Creates a client that opens connections through `connector`.
    pub fn with_connector(tokens: impl TokenProvider + 'static, connector: C) -> Self {
        Self {
            endpoint: LOCAL_STREAM_ENDPOINT.to_string(),
            tokens: Arc::new(tokens),
            connector: Arc::new(connector),
            options: StreamClientOptions::default(),
            slot: Arc::new(SessionSlot::new()),
        }
    }

    /// Sets the full websocket endpoint, without the token parameter.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end().to_string();
        self
    }

    /// Points the client at the streaming route of the service at `base_url`.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, StreamClientError> {
        self.endpoint = stream_endpoint_for(base_url)?;
        Ok(self)
    }

    pub fn with_options(mut self, options: StreamClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> &StreamClientOptions {
        &self.options
    }

    /// Builds the connection URL with `token` in its query string.
    pub fn session_url(&self, token: &SecretString) -> Result<String, StreamClientError> {
        let mut url = parse_ws_url(&self.endpoint)?;
        url.query_pairs_mut()
            .append_pair(TOKEN_QUERY_PARAM, token.expose_secret());
        Ok(url.into())
    }

    /// Starts a generation session, replacing any active one.
    ///
    /// Credentials and request parameters are checked before anything else;
    /// on those errors no connection is attempted and the current session is
    /// left running. Otherwise the previous session is canceled and the new
    /// one starts connecting in the background, reporting to `observer`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<O>(
        &self,
        request: GenerationRequest,
        observer: O,
    ) -> Result<SessionHandle, StreamClientError>
    where
        O: SessionObserver + 'static,
    {
        let token =
            usable_token(self.tokens.as_ref()).ok_or(StreamClientError::AuthenticationRequired)?;
        let request = request.normalized();
        request
            .validate()
            .map_err(StreamClientError::InvalidRequest)?;
        let url = self.session_url(&token)?;
        let payload = request.to_text()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| StreamClientError::NoRuntime)?;

        let _gate = self.slot.gate.lock();
        let id = self.slot.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let core = Arc::new(SessionCore::new(
            id,
            Box::new(observer),
            Arc::clone(&self.slot.gate),
        ));

        let previous = self.slot.active.lock().replace(Arc::clone(&core));
        if let Some(previous) = previous {
            if previous.cancel() {
                info!(
                    event = "session_replaced",
                    previous_session_id = previous.id(),
                    session_id = id
                );
            }
        }

        core.begin();
        let driven = drive(
            Arc::clone(&core),
            Arc::clone(&self.connector),
            url,
            payload,
            self.options.connect_timeout,
        );
        let slot = Arc::clone(&self.slot);
        let task = runtime.spawn(async move {
            driven.await;
            slot.release(id);
        });
        info!(
            event = "session_starting",
            session_id = id,
            endpoint = %self.endpoint,
            model_id = %request.model_id
        );

        Ok(SessionHandle::new(core, task))
    }

    /// Cancels the active session, if any.
    ///
    /// Returns `true` if a running session was canceled. No callback for it
    /// runs after this returns.
    pub fn cancel(&self) -> bool {
        let _gate = self.slot.gate.lock();
        let active = self.slot.active.lock().take();
        active.is_some_and(|core| core.cancel())
    }

    /// Id of the session currently occupying the slot, while it is running.
    pub fn active_session_id(&self) -> Option<u64> {
        self.slot
            .active
            .lock()
            .as_ref()
            .filter(|core| !core.state().is_terminal())
            .map(|core| core.id())
    }
}

fn parse_ws_url(endpoint: &str) -> Result<Url, StreamClientError> {
    let url = Url::parse(endpoint)
        .map_err(|err| StreamClientError::InvalidEndpoint(format!("{endpoint}: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(StreamClientError::InvalidEndpoint(format!(
            "{endpoint}: unsupported scheme {other}"
        ))),
    }
}

fn stream_endpoint_for(base_url: &str) -> Result<String, StreamClientError> {
    let base_url = base_url.trim();
    let mut url = Url::parse(base_url)
        .map_err(|err| StreamClientError::InvalidEndpoint(format!("{base_url}: {err}")))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(StreamClientError::InvalidEndpoint(format!(
                "{base_url}: unsupported scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme).map_err(|()| {
        StreamClientError::InvalidEndpoint(format!("{base_url}: cannot use scheme {scheme}"))
    })?;

    let path = format!("{}{STREAM_PATH}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.into())
}
