use super::ApiResponse;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::mailer::Mailer;
use crate::recipients::{RecipientValidator, ValidationError};
use crate::storage::Storage;
use crate::transport::TransportFactory;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    recipients: String,
}

#[derive(Debug, Deserialize)]
struct CreateCampaignRequest {
    subject: String,
    body: String,
    recipients: String,
}

// ============================================================================
// Response helpers
// ============================================================================

fn json<T: Serialize>(status: u16, value: &T) -> ApiResponse {
    match serde_json::to_string(value) {
        Ok(body) => ApiResponse::Json { status, body },
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            internal_error()
        }
    }
}

fn json_error(status: u16, message: &str) -> ApiResponse {
    json(status, &serde_json::json!({ "error": message }))
}

fn internal_error() -> ApiResponse {
    ApiResponse::Json {
        status: 500,
        body: r#"{"error": "Internal server error, please try again later"}"#.to_string(),
    }
}

fn missing_id() -> ApiResponse {
    json_error(400, "Missing campaign id")
}

fn validation_failure(err: &ValidationError) -> ApiResponse {
    match err {
        ValidationError::EmptyInput => json_error(400, &err.to_string()),
        ValidationError::SaltUnavailable(_) | ValidationError::Storage(_) => {
            error!(error = %err, "Recipient validation failed");
            internal_error()
        }
    }
}

fn dispatch_failure(err: &DispatchError) -> ApiResponse {
    match err {
        DispatchError::NotFound(_) => json_error(404, &err.to_string()),
        DispatchError::InvalidState(_) => json_error(409, &err.to_string()),
        DispatchError::Validation(e) => validation_failure(e),
        DispatchError::Storage(_) => {
            error!(error = %err, "Campaign operation failed");
            internal_error()
        }
    }
}

// ============================================================================
// Route handlers
// ============================================================================

/// POST /api/recipients/validate
pub(super) async fn validate_post<S: Storage>(
    validator: &RecipientValidator<S>,
    body: &str,
) -> ApiResponse {
    let request: ValidateRequest = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Invalid validate request body");
            return json_error(400, "Invalid request body");
        }
    };

    match validator.validate_and_hash(&request.recipients).await {
        Ok(report) => json(200, &report),
        Err(e) => validation_failure(&e),
    }
}

/// POST /api/campaigns
pub(super) async fn create_post<S, M, F>(
    dispatcher: &Arc<Dispatcher<S, M, F>>,
    body: &str,
) -> ApiResponse
where
    S: Storage,
    M: Mailer,
    F: TransportFactory,
{
    let request: CreateCampaignRequest = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Invalid create campaign request body");
            return json_error(400, "Invalid request body");
        }
    };

    match dispatcher
        .create_campaign(request.subject, request.body, &request.recipients)
        .await
    {
        Ok((campaign, report)) => {
            info!(campaign_id = %campaign.id, "Campaign created via API");
            json(
                201,
                &serde_json::json!({
                    "campaign_id": campaign.id,
                    "state": campaign.state,
                    "total_chunks": campaign.total_chunks,
                    "report": report,
                }),
            )
        }
        Err(e) => dispatch_failure(&e),
    }
}

/// POST /api/campaigns/send?id=...
///
/// Starts a draft or resumes an interrupted campaign. Runs to completion (or
/// cancellation) before responding.
pub(super) async fn send_post<S, M, F>(
    dispatcher: &Arc<Dispatcher<S, M, F>>,
    id: &str,
) -> ApiResponse
where
    S: Storage,
    M: Mailer,
    F: TransportFactory,
{
    if id.is_empty() {
        return missing_id();
    }
    match dispatcher.start(id).await {
        Ok(progress) => json(200, &progress),
        Err(e) => dispatch_failure(&e),
    }
}

/// POST /api/campaigns/retry?id=...
pub(super) async fn retry_post<S, M, F>(
    dispatcher: &Arc<Dispatcher<S, M, F>>,
    id: &str,
) -> ApiResponse
where
    S: Storage,
    M: Mailer,
    F: TransportFactory,
{
    if id.is_empty() {
        return missing_id();
    }
    let batches = match dispatcher.retry_failed(id).await {
        Ok(batches) => batches,
        Err(e) => return dispatch_failure(&e),
    };
    match dispatcher.get_progress(id).await {
        Ok(progress) => json(
            200,
            &serde_json::json!({ "batches": batches, "progress": progress }),
        ),
        Err(e) => dispatch_failure(&e),
    }
}

/// POST /api/campaigns/cancel?id=...
pub(super) async fn cancel_post<S, M, F>(
    dispatcher: &Arc<Dispatcher<S, M, F>>,
    id: &str,
) -> ApiResponse
where
    S: Storage,
    M: Mailer,
    F: TransportFactory,
{
    if id.is_empty() {
        return missing_id();
    }
    match dispatcher.cancel(id).await {
        Ok(()) => json(
            202,
            &serde_json::json!({ "message": "Cancellation requested" }),
        ),
        Err(e) => dispatch_failure(&e),
    }
}

/// GET /api/campaigns/progress?id=...
pub(super) async fn progress_get<S, M, F>(
    dispatcher: &Arc<Dispatcher<S, M, F>>,
    id: &str,
) -> ApiResponse
where
    S: Storage,
    M: Mailer,
    F: TransportFactory,
{
    if id.is_empty() {
        return missing_id();
    }
    match dispatcher.get_progress(id).await {
        Ok(progress) => json(200, &progress),
        Err(e) => dispatch_failure(&e),
    }
}

// ============================================================================
// Tests
// ============================================================================
