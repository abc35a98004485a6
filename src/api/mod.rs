//! HTTP API handler for campaign management.
//!
//! Framework-agnostic: accepts `ApiRequest`, returns `ApiResponse`.
//! The Lambda entry point in `src/bin/api.rs` adapts `lambda_http` types to/from
//! these and calls `handle`.

mod handlers;

use crate::dispatcher::Dispatcher;
use crate::mailer::Mailer;
use crate::storage::Storage;
use crate::transport::TransportFactory;
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Request / Response types
// ============================================================================

pub struct ApiRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Option<String>,
}

pub enum ApiResponse {
    Json { status: u16, body: String },
    Text { status: u16, body: String },
}

impl ApiResponse {
    pub fn status(&self) -> u16 {
        match self {
            Self::Json { status, .. } | Self::Text { status, .. } => *status,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Self::Json { body, .. } | Self::Text { body, .. } => body,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json { .. } => "application/json",
            Self::Text { .. } => "text/plain; charset=utf-8",
        }
    }

    pub fn body_contains(&self, s: &str) -> bool {
        self.body().contains(s)
    }
}

// ============================================================================
// Application state
// ============================================================================

pub struct AppState<S, M, F> {
    pub(crate) dispatcher: Arc<Dispatcher<S, M, F>>,
}

impl<S, M, F> AppState<S, M, F> {
    pub fn new(dispatcher: Arc<Dispatcher<S, M, F>>) -> Self {
        Self { dispatcher }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

pub async fn handle<S, M, F>(request: &ApiRequest, state: &Arc<AppState<S, M, F>>) -> ApiResponse
where
    S: Storage,
    M: Mailer,
    F: TransportFactory,
{
    let id = request.query.get("id").map(|s| s.as_str()).unwrap_or("");
    let body = request.body.as_deref().unwrap_or("");
    let dispatcher = &state.dispatcher;

    match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/api/recipients/validate") => {
            handlers::validate_post(dispatcher.validator(), body).await
        }
        ("POST", "/api/campaigns") => handlers::create_post(dispatcher, body).await,
        ("POST", "/api/campaigns/send") => handlers::send_post(dispatcher, id).await,
        ("POST", "/api/campaigns/retry") => handlers::retry_post(dispatcher, id).await,
        ("POST", "/api/campaigns/cancel") => handlers::cancel_post(dispatcher, id).await,
        ("GET", "/api/campaigns/progress") => handlers::progress_get(dispatcher, id).await,
        _ => ApiResponse::Text {
            status: 404,
            body: "Not Found".to_string(),
        },
    }
}
