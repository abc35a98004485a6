//! Payload and routing for the asynchronous dispatch worker.

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::mailer::Mailer;
use crate::storage::Storage;
use crate::transport::TransportFactory;
use crate::types::Progress;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAction {
    /// Start a draft, or resume an interrupted send.
    Send,
    /// One retry cycle.
    Retry,
    /// Retry cycles with backoff until nothing is eligible.
    RetryAll,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerEvent {
    pub action: WorkerAction,
    pub campaign_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerOutcome {
    pub campaign_id: String,
    pub batches: usize,
    pub progress: Progress,
}

pub async fn run_event<S, M, F>(
    dispatcher: &Dispatcher<S, M, F>,
    event: &WorkerEvent,
) -> Result<WorkerOutcome, DispatchError>
where
    S: Storage,
    M: Mailer,
    F: TransportFactory,
{
    info!(action = ?event.action, campaign_id = %event.campaign_id, "Worker event received");

    let id = event.campaign_id.as_str();
    let batches = match event.action {
        WorkerAction::Send => {
            let before = dispatcher.get_progress(id).await?.completed_chunks;
            let progress = dispatcher.start(id).await?;
            progress.completed_chunks.saturating_sub(before)
        }
        WorkerAction::Retry => dispatcher.retry_failed(id).await?.len(),
        WorkerAction::RetryAll => dispatcher.retry_until_settled(id).await?.len(),
    };

    Ok(WorkerOutcome {
        campaign_id: event.campaign_id.clone(),
        batches,
        progress: dispatcher.get_progress(id).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::test_utils::{addresses, harness, quick_config};
    use crate::transport::test_utils::ScriptedFactory;

    fn event(json: &str) -> WorkerEvent {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn event_actions_are_snake_case() {
        let e = event(r#"{"action": "retry_all", "campaign_id": "c-1"}"#);
        assert_eq!(e.action, WorkerAction::RetryAll);
        assert_eq!(e.campaign_id, "c-1");
        let unknown = r#"{"action": "resend", "campaign_id": "c"}"#;
        assert!(serde_json::from_str::<WorkerEvent>(unknown).is_err());
    }

    #[tokio::test]
    async fn send_then_retry_all() {
        let factory = ScriptedFactory::new().reject("user04@example.com", "451 later", 1);
        let h = harness(factory, quick_config());
        let id = h.create(&addresses(8)).await;

        let sent = run_event(
            &h.dispatcher,
            &WorkerEvent {
                action: WorkerAction::Send,
                campaign_id: id.clone(),
            },
        )
        .await
        .unwrap();
        assert_eq!(sent.batches, 2);
        assert_eq!(sent.progress.total_failed, 1);

        let retried = run_event(
            &h.dispatcher,
            &WorkerEvent {
                action: WorkerAction::RetryAll,
                campaign_id: id,
            },
        )
        .await
        .unwrap();
        assert_eq!(retried.batches, 1);
        assert!(retried.progress.is_complete);
        assert_eq!(retried.progress.total_sent, 8);
    }

    #[tokio::test]
    async fn unknown_campaign_surfaces_not_found() {
        let h = harness(ScriptedFactory::new(), quick_config());
        let result = run_event(
            &h.dispatcher,
            &WorkerEvent {
                action: WorkerAction::Retry,
                campaign_id: "missing".to_string(),
            },
        )
        .await;
        assert!(matches!(result, Err(DispatchError::NotFound(_))));
    }
}
