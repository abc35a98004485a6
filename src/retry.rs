//! Retry cycles over failed recipients.
//!
//! A cycle re-sends every address whose standing outcome is a failure with
//! attempts left. Addresses are regrouped by the chunk they were originally
//! planned in, so each retry batch references that chunk's index. Cycles are
//! spaced with exponential backoff when run back to back.

use crate::backoff::nth_delay;
use crate::config::PipelineConfig;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::mailer::Mailer;
use crate::progress::{Checkpoint, refresh, retry_eligible};
use crate::storage::Storage;
use crate::transport::TransportFactory;
use crate::types::{BatchResult, Campaign, CampaignState, Chunk};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{Instrument, info, info_span, warn};

/// Chunks to re-send in one cycle and the attempts each address has used.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPlan {
    pub chunks: Vec<Chunk>,
    pub prior_attempts: HashMap<String, u32>,
}

impl RetryPlan {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn recipient_count(&self) -> usize {
        self.prior_attempts.len()
    }
}

pub fn plan_retry(campaign: &Campaign, max_retries: u32) -> RetryPlan {
    let chunk_size = campaign.chunk_size.max(1);
    let mut groups: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut prior_attempts = HashMap::new();

    for standing in retry_eligible(campaign, max_retries) {
        let email = standing.outcome.email.clone();
        prior_attempts.insert(email.clone(), standing.outcome.attempts);
        groups.entry(standing.chunk_index).or_default().push(email);
    }

    let chunks = groups
        .into_iter()
        .flat_map(|(index, emails)| {
            emails
                .chunks(chunk_size)
                .map(|part| Chunk {
                    index,
                    total: campaign.total_chunks,
                    recipients: part.to_vec(),
                })
                .collect::<Vec<_>>()
        })
        .collect();

    RetryPlan {
        chunks,
        prior_attempts,
    }
}

/// Wait before retry cycle `cycle + 1`, after `cycle` cycles have run.
pub fn cycle_delay(config: &PipelineConfig, cycle: u32) -> Duration {
    nth_delay(
        config.retry_delay,
        config.retry_backoff_multiplier,
        config.max_backoff_delay,
        cycle,
    )
}

impl<S, M, F> Dispatcher<S, M, F>
where
    S: Storage,
    M: Mailer,
    F: TransportFactory,
{
    /// Run one retry cycle. Returns the batches it produced, or nothing when
    /// no address is eligible.
    pub async fn retry_failed(
        &self,
        campaign_id: &str,
    ) -> Result<Vec<BatchResult>, DispatchError> {
        let _guard = self.locks.acquire(campaign_id).await;
        let mut campaign = self.load_for_retry(campaign_id).await?;

        let span = info_span!("campaign", id = %campaign.id);
        self.retry_cycle(&mut campaign).instrument(span).await
    }

    /// Run retry cycles until no address is eligible, waiting between cycles
    /// unless the previous one delivered everything it tried.
    pub async fn retry_until_settled(
        &self,
        campaign_id: &str,
    ) -> Result<Vec<BatchResult>, DispatchError> {
        let _guard = self.locks.acquire(campaign_id).await;
        let mut campaign = self.load_for_retry(campaign_id).await?;

        let span = info_span!("campaign", id = %campaign.id);
        async {
            let config = self.sender.config();
            let mut all = Vec::new();
            let mut cycle: u32 = 0;

            loop {
                if cycle > 0 && self.cancellation_requested(&campaign.id).await? {
                    warn!(cycle, "Campaign cancelled, stopping retries");
                    break;
                }

                let results = self.retry_cycle(&mut campaign).await?;
                if results.is_empty() {
                    break;
                }
                cycle += 1;

                let clean = results.iter().all(|b| b.failed() == 0);
                all.extend(results);

                if retry_eligible(&campaign, config.max_retries).is_empty() {
                    break;
                }
                if !clean {
                    let delay = cycle_delay(config, cycle);
                    info!(
                        cycle,
                        delay_ms = delay.as_millis() as u64,
                        "Waiting before next retry cycle"
                    );
                    tokio::time::sleep(delay).await;
                }
            }

            info!(
                cycles = cycle,
                state = %campaign.state,
                total_failed = campaign.total_failed,
                "Retries settled"
            );
            Ok::<_, DispatchError>(all)
        }
        .instrument(span)
        .await
    }

    async fn load_for_retry(&self, campaign_id: &str) -> Result<Campaign, DispatchError> {
        let mut campaign = self.load(campaign_id).await?;
        if campaign.state == CampaignState::Draft {
            return Err(DispatchError::InvalidState(format!(
                "campaign {} has not been started",
                campaign_id
            )));
        }

        if campaign.cancel_requested {
            campaign.cancel_requested = false;
            self.storage
                .set_cancel_requested(campaign_id, false)
                .await
                .map_err(DispatchError::Storage)?;
        }
        Ok(campaign)
    }

    async fn retry_cycle(
        &self,
        campaign: &mut Campaign,
    ) -> Result<Vec<BatchResult>, DispatchError> {
        let config = self.sender.config();
        let plan = plan_retry(campaign, config.max_retries);
        if plan.is_empty() {
            info!("No recipients eligible for retry");
            return Ok(Vec::new());
        }

        let checkpoint = Checkpoint::take(campaign, config.max_retries);
        campaign.retry_cycles += 1;
        refresh(campaign, config.max_retries);
        self.save(campaign).await?;

        info!(
            cycle = campaign.retry_cycles,
            recipients = plan.recipient_count(),
            chunks = plan.chunks.len(),
            "Starting retry cycle"
        );

        let mut results = Vec::with_capacity(plan.chunks.len());
        for (n, chunk) in plan.chunks.iter().enumerate() {
            if n > 0 {
                tokio::time::sleep(config.chunk_delay).await;
                if self.cancellation_requested(&campaign.id).await? {
                    warn!(next_chunk = chunk.index, "Campaign cancelled mid-cycle");
                    break;
                }
            }

            let batch = self
                .sender
                .send_batch(chunk, &campaign.subject, &campaign.body, &plan.prior_attempts)
                .await;
            results.push(batch.clone());
            self.record(campaign, batch).await?;
        }

        self.notifier
            .report_changes(&checkpoint, campaign, config.max_retries)
            .await;

        Ok(results)
    }
}
