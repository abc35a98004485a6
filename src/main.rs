//! Lambda entrypoint for the dispatch worker.
//!
//! Invoked asynchronously with `{"action": "send" | "retry" | "retry_all",
//! "campaign_id": "..."}`. Delegates to `dispatch::worker`.

use dispatch::worker::{WorkerEvent, WorkerOutcome};
use dispatch::{LiveDispatcher, live_dispatcher};
use lambda_runtime::{Error, LambdaEvent, service_fn};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let dispatcher = Arc::new(
        live_dispatcher()
            .await
            .map_err(|e| Error::from(format!("{:#}", e)))?,
    );

    lambda_runtime::run(service_fn(|event| handler(event, dispatcher.clone()))).await?;
    Ok(())
}

async fn handler(
    event: LambdaEvent<WorkerEvent>,
    dispatcher: Arc<LiveDispatcher>,
) -> Result<WorkerOutcome, Error> {
    match dispatch::worker::run_event(&*dispatcher, &event.payload).await {
        Ok(outcome) => {
            info!(
                campaign_id = %outcome.campaign_id,
                batches = outcome.batches,
                total_sent = outcome.progress.total_sent,
                total_failed = outcome.progress.total_failed,
                "Worker event complete"
            );
            Ok(outcome)
        }
        Err(e) => {
            error!(campaign_id = %event.payload.campaign_id, error = %e, "Worker event failed");
            Err(Error::from(e.to_string()))
        }
    }
}
