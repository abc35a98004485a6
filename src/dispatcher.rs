//! Campaign orchestration: creation, sequential chunk dispatch, resume,
//! cancellation and progress queries. Retry cycles live in [`crate::retry`].
//!
//! Operations on one campaign are serialized through a per-campaign lock, so
//! two invocations in the same process never interleave writes to the record.

use crate::batch_sender::BatchSender;
use crate::chunks::{chunk_count, plan_chunks};
use crate::mailer::Mailer;
use crate::notifier::OperatorNotifier;
use crate::progress::{Checkpoint, apply_batch, compute_progress};
use crate::recipients::{RecipientValidator, ValidationError, ValidationReport};
use crate::storage::Storage;
use crate::transport::TransportFactory;
use crate::types::{BatchResult, Campaign, CampaignState, Progress};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{Instrument, info, info_span, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("campaign {0} not found")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

// ============================================================================
// Per-campaign locks
// ============================================================================

#[derive(Default)]
pub struct CampaignLocks {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CampaignLocks {
    /// Wait for exclusive access to `campaign_id`. Released when the guard drops.
    pub async fn acquire(&self, campaign_id: &str) -> CampaignGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(campaign_id.to_string()).or_default())
        };
        CampaignGuard {
            locks: self,
            campaign_id: campaign_id.to_string(),
            guard: Some(slot.lock_owned().await),
        }
    }
}

/// Exclusive hold on one campaign. Dropping the last holder removes the
/// campaign's slot from the map.
pub struct CampaignGuard<'a> {
    locks: &'a CampaignLocks,
    campaign_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CampaignGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self
            .locks
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Waiters hold a clone, so a count of one means only the map is left.
        if slots
            .get(&self.campaign_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.campaign_id);
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct Dispatcher<S, M, F> {
    pub(crate) storage: Arc<S>,
    pub(crate) validator: Arc<RecipientValidator<S>>,
    pub(crate) sender: BatchSender<F>,
    pub(crate) notifier: OperatorNotifier<M>,
    pub(crate) locks: CampaignLocks,
}

impl<S, M, F> Dispatcher<S, M, F>
where
    S: Storage,
    M: Mailer,
    F: TransportFactory,
{
    pub fn new(
        storage: Arc<S>,
        validator: Arc<RecipientValidator<S>>,
        sender: BatchSender<F>,
        notifier: OperatorNotifier<M>,
    ) -> Self {
        Self {
            storage,
            validator,
            sender,
            notifier,
            locks: CampaignLocks::default(),
        }
    }

    pub fn validator(&self) -> &RecipientValidator<S> {
        &self.validator
    }

    /// Validate `raw_list` and persist a draft campaign for its unique valid
    /// addresses.
    pub async fn create_campaign(
        &self,
        subject: String,
        body: String,
        raw_list: &str,
    ) -> Result<(Campaign, ValidationReport), DispatchError> {
        let report = self.validator.validate_and_hash(raw_list).await?;
        if report.emails.is_empty() {
            return Err(DispatchError::InvalidState(
                "recipient list has no valid addresses".to_string(),
            ));
        }

        let mut campaign = Campaign::new(subject, body, report.emails.clone());
        campaign.chunk_size = self.sender.config().chunk_size;
        campaign.total_chunks = chunk_count(campaign.recipients.len(), campaign.chunk_size);

        self.storage
            .create_campaign(&campaign)
            .await
            .map_err(DispatchError::Storage)?;

        info!(
            campaign_id = %campaign.id,
            recipients = campaign.recipient_count,
            chunks = campaign.total_chunks,
            "Created campaign"
        );
        Ok((campaign, report))
    }

    /// Move a draft to `sending` and deliver every chunk that has no recorded
    /// outcome yet. Calling it again on a campaign that is already sending
    /// resumes from the first unrecorded chunk.
    pub async fn start(&self, campaign_id: &str) -> Result<Progress, DispatchError> {
        let _guard = self.locks.acquire(campaign_id).await;
        let mut campaign = self.load(campaign_id).await?;

        match campaign.state {
            CampaignState::Draft => {
                if campaign.chunk_size == 0 {
                    campaign.chunk_size = self.sender.config().chunk_size;
                }
                campaign.total_chunks =
                    chunk_count(campaign.recipients.len(), campaign.chunk_size);
                campaign.state = CampaignState::Sending;
                campaign.started_at = Some(Utc::now());
            }
            CampaignState::Sending | CampaignState::Retrying => {
                info!(campaign_id, "Resuming campaign");
            }
            state @ (CampaignState::Sent | CampaignState::SentWithFailures) => {
                return Err(DispatchError::InvalidState(format!(
                    "campaign {} is already {}",
                    campaign_id, state
                )));
            }
        }

        campaign.cancel_requested = false;
        self.save(&campaign).await?;
        self.storage
            .set_cancel_requested(campaign_id, false)
            .await
            .map_err(DispatchError::Storage)?;

        let span = info_span!("campaign", id = %campaign.id);
        self.dispatch_pending(&mut campaign).instrument(span).await?;

        Ok(compute_progress(
            &campaign,
            self.sender.config().max_retries,
        ))
    }

    pub async fn get_progress(&self, campaign_id: &str) -> Result<Progress, DispatchError> {
        let campaign = self.load(campaign_id).await?;
        Ok(compute_progress(
            &campaign,
            self.sender.config().max_retries,
        ))
    }

    /// Ask a running dispatch to stop before its next chunk. The chunk in
    /// flight completes. A cancelled campaign can be resumed with `start`.
    pub async fn cancel(&self, campaign_id: &str) -> Result<(), DispatchError> {
        let campaign = self.load(campaign_id).await?;
        if campaign.state == CampaignState::Draft || campaign.state.is_terminal() {
            return Err(DispatchError::InvalidState(format!(
                "campaign {} is {} and cannot be cancelled",
                campaign_id, campaign.state
            )));
        }

        if !self
            .storage
            .set_cancel_requested(campaign_id, true)
            .await
            .map_err(DispatchError::Storage)?
        {
            return Err(DispatchError::NotFound(campaign_id.to_string()));
        }

        info!(campaign_id, "Cancellation requested");
        Ok(())
    }

    async fn dispatch_pending(&self, campaign: &mut Campaign) -> Result<(), DispatchError> {
        let config = self.sender.config();
        let checkpoint = Checkpoint::take(campaign, config.max_retries);

        let recorded: HashSet<usize> = campaign
            .batch_results
            .iter()
            .map(|b| b.chunk_index)
            .collect();
        let pending: Vec<_> = plan_chunks(&campaign.recipients, campaign.chunk_size)
            .into_iter()
            .filter(|chunk| !recorded.contains(&chunk.index))
            .collect();

        info!(
            pending = pending.len(),
            total_chunks = campaign.total_chunks,
            "Dispatching chunks"
        );

        let no_prior_attempts = HashMap::new();
        for (n, chunk) in pending.iter().enumerate() {
            if n > 0 {
                tokio::time::sleep(config.chunk_delay).await;
                if self.cancellation_requested(&campaign.id).await? {
                    warn!(
                        next_chunk = chunk.index,
                        "Campaign cancelled, leaving remaining chunks unsent"
                    );
                    break;
                }
            }

            let batch = self
                .sender
                .send_batch(chunk, &campaign.subject, &campaign.body, &no_prior_attempts)
                .await;
            self.record(campaign, batch).await?;
        }

        self.notifier
            .report_changes(&checkpoint, campaign, config.max_retries)
            .await;

        info!(
            state = %campaign.state,
            total_sent = campaign.total_sent,
            total_failed = campaign.total_failed,
            "Dispatch finished"
        );
        Ok(())
    }

    /// Append `batch` to the stored history, fold it into the campaign, save
    /// the new counters, and stamp delivered identities.
    pub(crate) async fn record(
        &self,
        campaign: &mut Campaign,
        batch: BatchResult,
    ) -> Result<(), DispatchError> {
        let delivered: Vec<String> = batch
            .results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.email.clone())
            .collect();

        self.storage
            .append_batch(&campaign.id, campaign.batch_results.len(), &batch)
            .await
            .map_err(DispatchError::Storage)?;
        apply_batch(campaign, batch, self.sender.config().max_retries);
        self.save(campaign).await?;

        if !delivered.is_empty() {
            if let Err(e) = self.validator.mark_delivered(&delivered, Utc::now()).await {
                warn!(error = %e, "Failed to stamp delivered recipients");
            }
        }
        Ok(())
    }

    /// Persist state and counters. Batches are appended by `record` and the
    /// cancel flag is only written by `cancel`, `start` and retry entry.
    pub(crate) async fn save(&self, campaign: &Campaign) -> Result<(), DispatchError> {
        self.storage
            .update_campaign(campaign)
            .await
            .map_err(DispatchError::Storage)
    }

    pub(crate) async fn cancellation_requested(
        &self,
        campaign_id: &str,
    ) -> Result<bool, DispatchError> {
        self.storage
            .cancel_requested(campaign_id)
            .await
            .map_err(DispatchError::Storage)
    }

    pub(crate) async fn load(&self, campaign_id: &str) -> Result<Campaign, DispatchError> {
        self.storage
            .get_campaign(campaign_id)
            .await
            .map_err(DispatchError::Storage)?
            .ok_or_else(|| DispatchError::NotFound(campaign_id.to_string()))
    }
}

// ============================================================================
// Test harness shared with the retry tests
// ============================================================================
