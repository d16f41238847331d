//! Gateway HTTP server: Axum-based chat and health endpoints

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use chrono::Utc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;
use voicebot_core::{DispatchError, Dispatcher};

use crate::protocol::{ChatReply, ChatRequest, ErrorBody, FailureDetails, HealthReport, messages};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Shared state for all requests
#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Arc<Dispatcher>,
    /// Provider id → configured, including providers left out of dispatch
    pub apis: Arc<BTreeMap<String, bool>>,
    /// Overall deadline for one chat request
    pub request_timeout: Duration,
}

/// The gateway server
pub struct GatewayServer {
    state: GatewayState,
    bind: SocketAddr,
    static_dir: Option<PathBuf>,
}

impl GatewayServer {
    /// Create a new gateway server. Every dispatcher provider is reported as configured.
    pub fn new(bind: SocketAddr, dispatcher: Arc<Dispatcher>) -> Self {
        let apis = dispatcher
            .provider_names()
            .into_iter()
            .map(|name| (name.to_string(), true))
            .collect();
        let state = GatewayState {
            dispatcher,
            apis: Arc::new(apis),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        };
        Self {
            state,
            bind,
            static_dir: None,
        }
    }

    /// Replace the provider status reported by `/health`
    pub fn with_provider_status(mut self, apis: BTreeMap<String, bool>) -> Self {
        self.state.apis = Arc::new(apis);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.state.request_timeout = timeout;
        self
    }

    /// Serve the browser client from `dir` on every non-API path
    pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }

    pub fn bind(&self) -> SocketAddr {
        self.bind
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/chat", post(chat_handler))
            .route("/health", get(health_handler))
            .route("/api/chat", post(chat_handler))
            .route("/api/health", get(health_handler));

        let router = match self
            .static_dir
            .as_deref()
            .and_then(crate::webchat::static_service)
        {
            Some(files) => router.fallback_service(files),
            None => router,
        };

        router
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Start the server on the configured address (blocks until shutdown)
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.router();
        info!("Gateway listening on {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Gateway stopped");
        Ok(())
    }
}

// ── Error mapping ──

/// HTTP view of a dispatch failure
#[derive(Debug)]
pub struct ApiError(pub DispatchError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::AllProvidersFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> ErrorBody {
        match &self.0 {
            DispatchError::BadRequest(reason) => ErrorBody::new(reason.clone()),
            DispatchError::AllProvidersFailed { errors, timestamp } => {
                ErrorBody::new(messages::ALL_PROVIDERS_FAILED)
                    .with_details(FailureDetails::new(errors, *timestamp))
            }
            DispatchError::Timeout { .. } => {
                ErrorBody::new(messages::TIMED_OUT).with_timestamp(Utc::now())
            }
            DispatchError::Unexpected(_) => {
                ErrorBody::new(messages::UNEXPECTED).with_timestamp(Utc::now())
            }
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

// ── HTTP Handlers ──

async fn health_handler(State(state): State<GatewayState>) -> Json<HealthReport> {
    Json(HealthReport::ok(state.apis.as_ref().clone()))
}

async fn chat_handler(
    State(state): State<GatewayState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatReply>, ApiError> {
    let message = match payload {
        Ok(Json(req)) => req.message.unwrap_or_default(),
        Err(rejection) => {
            warn!("Rejected chat body: {}", rejection.body_text());
            return Err(DispatchError::bad_request(messages::INVALID_BODY).into());
        }
    };

    let request_id = Uuid::new_v4();
    let span = info_span!("chat", %request_id);
    let dispatcher = Arc::clone(&state.dispatcher);
    let deadline = state.request_timeout;

    // A panicking provider must not take the connection down with it
    let task = tokio::spawn(
        async move { dispatcher.dispatch_with_deadline(&message, deadline).await }
            .instrument(span),
    );

    let result = match task.await {
        Ok(result) => result,
        Err(e) => {
            error!(%request_id, "Dispatch task failed: {}", e);
            Err(DispatchError::unexpected(e.to_string()))
        }
    };

    match result {
        Ok(dispatched) => {
            info!(
                %request_id,
                "Response generated using {} ({} chars)",
                dispatched.provider,
                dispatched.text.len()
            );
            Ok(Json(ChatReply {
                response: dispatched.text,
                provider: dispatched.provider,
            }))
        }
        Err(e) => {
            match &e {
                DispatchError::BadRequest(reason) => warn!(%request_id, "Bad request: {}", reason),
                other => error!(%request_id, "Chat request failed: {}", other),
            }
            Err(e.into())
        }
    }
}
