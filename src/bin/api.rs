//! HTTP API Lambda for campaign management.
//!
//! Adapts `lambda_http` requests to the framework-agnostic handler in
//! `dispatch::api`.

use dispatch::api::{self, ApiRequest, AppState};
use dispatch::mailer::SesMailer;
use dispatch::storage::DynamoStorage;
use dispatch::transport::SmtpTransportFactory;
use dispatch::{LiveDispatcher, live_dispatcher};
use lambda_http::{Body, Error, Request, RequestExt, Response, run, service_fn};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

type LiveState = AppState<DynamoStorage, SesMailer, SmtpTransportFactory>;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let dispatcher: LiveDispatcher = live_dispatcher()
        .await
        .map_err(|e| Error::from(format!("{:#}", e)))?;
    let state = Arc::new(LiveState::new(Arc::new(dispatcher)));

    run(service_fn(|event| handler(event, state.clone()))).await
}

async fn handler(event: Request, state: Arc<LiveState>) -> Result<Response<Body>, Error> {
    let method = event.method().to_string();
    let path = event.uri().path().to_string();

    info!(method = %method, path = %path, "Handling request");

    let query: HashMap<String, String> = event
        .query_string_parameters()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let body = match event.body() {
        Body::Text(s) => Some(s.clone()),
        Body::Binary(b) => String::from_utf8(b.clone()).ok(),
        _ => None,
    };

    let request = ApiRequest {
        method,
        path,
        query,
        body,
    };
    let response = api::handle(&request, &state).await;

    Ok(Response::builder()
        .status(response.status())
        .header("Content-Type", response.content_type())
        .body(Body::from(response.body().to_string()))?)
}
