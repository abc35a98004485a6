//! Folds a campaign's append-only batch history into counters, progress
//! figures and lifecycle state.
//!
//! Outcomes are looked up newest-wins per address, except that a recorded
//! success is never superseded: once delivered, an address stays delivered.

use crate::types::{
    BatchResult, Campaign, CampaignState, PermanentFailure, Progress, RecipientOutcome,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};

/// The outcome that currently stands for one address, and the chunk it was
/// originally planned in.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestOutcome<'a> {
    pub chunk_index: usize,
    pub outcome: &'a RecipientOutcome,
}

/// Standing outcome per address, in order of first appearance.
pub fn latest_outcomes(batches: &[BatchResult]) -> Vec<LatestOutcome<'_>> {
    let mut latest: Vec<LatestOutcome<'_>> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();

    for batch in batches {
        for outcome in &batch.results {
            match position.get(outcome.email.as_str()) {
                Some(&i) => {
                    if !latest[i].outcome.success {
                        latest[i].outcome = outcome;
                    }
                }
                None => {
                    position.insert(outcome.email.as_str(), latest.len());
                    latest.push(LatestOutcome {
                        chunk_index: batch.chunk_index,
                        outcome,
                    });
                }
            }
        }
    }

    latest
}

/// Failed addresses that still have attempts left.
pub fn retry_eligible(campaign: &Campaign, max_retries: u32) -> Vec<LatestOutcome<'_>> {
    latest_outcomes(&campaign.batch_results)
        .into_iter()
        .filter(|l| !l.outcome.success && l.outcome.attempts < max_retries)
        .collect()
}

/// Failed addresses that have used up every attempt.
pub fn permanent_failures(campaign: &Campaign, max_retries: u32) -> Vec<PermanentFailure> {
    latest_outcomes(&campaign.batch_results)
        .into_iter()
        .filter(|l| !l.outcome.success && l.outcome.attempts >= max_retries)
        .map(|l| PermanentFailure {
            email: l.outcome.email.clone(),
            error: l.outcome.error.clone().unwrap_or_default(),
            attempts: l.outcome.attempts,
        })
        .collect()
}

/// Planned chunks with at least one recorded batch.
pub fn completed_chunks(campaign: &Campaign) -> usize {
    campaign
        .batch_results
        .iter()
        .map(|b| b.chunk_index)
        .filter(|&i| i < campaign.total_chunks)
        .collect::<HashSet<_>>()
        .len()
}

pub fn compute_progress(campaign: &Campaign, max_retries: u32) -> Progress {
    let latest = latest_outcomes(&campaign.batch_results);
    let total_sent = latest.iter().filter(|l| l.outcome.success).count();
    let total_failed = latest.len() - total_sent;
    let any_eligible = latest
        .iter()
        .any(|l| !l.outcome.success && l.outcome.attempts < max_retries);

    let completed_chunks = completed_chunks(campaign);
    let total_chunks = campaign.total_chunks;
    let percent_complete = if total_chunks == 0 {
        0.0
    } else {
        completed_chunks as f64 * 100.0 / total_chunks as f64
    };

    Progress {
        total_sent,
        total_failed,
        is_complete: total_chunks > 0 && completed_chunks == total_chunks && !any_eligible,
        completed_chunks,
        total_chunks,
        percent_complete,
    }
}

/// Recompute counters and state from the batch history. Sets `completed_at`
/// the first time the campaign reaches a terminal state.
pub fn refresh(campaign: &mut Campaign, max_retries: u32) -> Progress {
    let progress = compute_progress(campaign, max_retries);
    campaign.total_sent = progress.total_sent;
    campaign.total_failed = progress.total_failed;

    campaign.state = if progress.is_complete {
        if progress.total_failed == 0 {
            CampaignState::Sent
        } else {
            CampaignState::SentWithFailures
        }
    } else if campaign.retry_cycles > 0 {
        CampaignState::Retrying
    } else {
        CampaignState::Sending
    };

    if campaign.state.is_terminal() && campaign.completed_at.is_none() {
        campaign.completed_at = Some(Utc::now());
    }

    progress
}

/// What had already been settled before an operation ran, so that only the
/// changes it caused are reported to the operator.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    permanent: HashSet<String>,
    terminal: bool,
}

impl Checkpoint {
    pub fn take(campaign: &Campaign, max_retries: u32) -> Self {
        Self {
            permanent: permanent_failures(campaign, max_retries)
                .into_iter()
                .map(|f| f.email)
                .collect(),
            terminal: campaign.state.is_terminal(),
        }
    }

    pub fn new_permanent_failures(
        &self,
        campaign: &Campaign,
        max_retries: u32,
    ) -> Vec<PermanentFailure> {
        permanent_failures(campaign, max_retries)
            .into_iter()
            .filter(|f| !self.permanent.contains(&f.email))
            .collect()
    }

    pub fn newly_terminal(&self, campaign: &Campaign) -> bool {
        !self.terminal && campaign.state.is_terminal()
    }
}

/// Append `batch` to the history and refresh the campaign.
pub fn apply_batch(campaign: &mut Campaign, batch: BatchResult, max_retries: u32) -> Progress {
    campaign.batch_results.push(batch);
    refresh(campaign, max_retries)
}
