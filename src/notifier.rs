//! Operator-facing notifications: permanent delivery failures and campaign
//! completion summaries.

use crate::batch_sender::render_subject;
use crate::config::DEFAULT_SUBJECT_TEMPLATE;
use crate::mailer::Mailer;
use crate::progress::Checkpoint;
use crate::types::{Campaign, PermanentFailure};
use anyhow::{Context, Result};
use askama::Template;
use email_address::EmailAddress;
use std::str::FromStr;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Template)]
#[template(path = "permanent_failure.html")]
struct PermanentFailureHtmlTemplate<'a> {
    campaign_id: &'a str,
    subject: &'a str,
    max_retries: u32,
    failures: &'a [PermanentFailure],
}

#[derive(Template)]
#[template(path = "permanent_failure.txt")]
struct PermanentFailureTextTemplate<'a> {
    campaign_id: &'a str,
    subject: &'a str,
    max_retries: u32,
    failures: &'a [PermanentFailure],
}

#[derive(Template)]
#[template(path = "campaign_summary.html")]
struct CampaignSummaryHtmlTemplate<'a> {
    campaign_id: &'a str,
    subject: &'a str,
    state: String,
    recipient_count: usize,
    total_sent: usize,
    total_failed: usize,
    retry_cycles: u32,
    completed_at: String,
}

#[derive(Template)]
#[template(path = "campaign_summary.txt")]
struct CampaignSummaryTextTemplate<'a> {
    campaign_id: &'a str,
    subject: &'a str,
    state: String,
    recipient_count: usize,
    total_sent: usize,
    total_failed: usize,
    retry_cycles: u32,
    completed_at: String,
}

pub struct OperatorNotifier<M> {
    mailer: Arc<M>,
    operator: EmailAddress,
    subject_template: String,
}

impl<M: Mailer> OperatorNotifier<M> {
    pub fn new(mailer: Arc<M>, operator_email: &str) -> Result<Self> {
        let operator = EmailAddress::from_str(operator_email)
            .with_context(|| format!("Invalid operator email '{}'", operator_email))?;
        Ok(Self {
            mailer,
            operator,
            subject_template: DEFAULT_SUBJECT_TEMPLATE.to_string(),
        })
    }

    /// Template used for campaigns created without a subject.
    pub fn with_subject_template(mut self, template: &str) -> Self {
        self.subject_template = template.to_string();
        self
    }

    /// The campaign subject as recipients saw it, dated by the send start.
    fn display_subject(&self, campaign: &Campaign) -> String {
        let sent_on = campaign.started_at.unwrap_or_else(Utc::now);
        render_subject(&campaign.subject, &self.subject_template, sent_on)
    }

    /// Send whatever became reportable since `checkpoint`: addresses that
    /// just ran out of attempts, and the summary if the campaign just
    /// finished. Delivery problems are logged, never returned, so a failed
    /// alert cannot undo recorded progress.
    pub async fn report_changes(
        &self,
        checkpoint: &Checkpoint,
        campaign: &Campaign,
        max_retries: u32,
    ) {
        let failures = checkpoint.new_permanent_failures(campaign, max_retries);
        if let Err(e) = self
            .notify_permanent_failures(campaign, &failures, max_retries)
            .await
        {
            error!(campaign_id = %campaign.id, error = %e, "Failed to report permanent failures");
        }

        if checkpoint.newly_terminal(campaign) {
            if let Err(e) = self.notify_completion(campaign).await {
                error!(campaign_id = %campaign.id, error = %e, "Failed to send completion summary");
            }
        }
    }

    /// Alert the operator about addresses that exhausted their attempts.
    /// Does nothing when `failures` is empty.
    pub async fn notify_permanent_failures(
        &self,
        campaign: &Campaign,
        failures: &[PermanentFailure],
        max_retries: u32,
    ) -> Result<()> {
        if failures.is_empty() {
            return Ok(());
        }

        let display_subject = self.display_subject(campaign);
        let html = PermanentFailureHtmlTemplate {
            campaign_id: &campaign.id,
            subject: &display_subject,
            max_retries,
            failures,
        }
        .render()
        .context("Failed to render HTML template")?;
        let text = PermanentFailureTextTemplate {
            campaign_id: &campaign.id,
            subject: &display_subject,
            max_retries,
            failures,
        }
        .render()
        .context("Failed to render text template")?;

        let subject = format!(
            "[{}] {} undeliverable recipient(s)",
            display_subject,
            failures.len()
        );
        self.mailer
            .send_email(&self.operator, &subject, &html, &text)
            .await?;

        info!(
            campaign_id = %campaign.id,
            count = failures.len(),
            "Reported permanent failures to operator"
        );
        Ok(())
    }

    pub async fn notify_completion(&self, campaign: &Campaign) -> Result<()> {
        let completed_at = campaign
            .completed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let display_subject = self.display_subject(campaign);

        let html = CampaignSummaryHtmlTemplate {
            campaign_id: &campaign.id,
            subject: &display_subject,
            state: campaign.state.to_string(),
            recipient_count: campaign.recipient_count,
            total_sent: campaign.total_sent,
            total_failed: campaign.total_failed,
            retry_cycles: campaign.retry_cycles,
            completed_at: completed_at.clone(),
        }
        .render()
        .context("Failed to render HTML template")?;
        let text = CampaignSummaryTextTemplate {
            campaign_id: &campaign.id,
            subject: &display_subject,
            state: campaign.state.to_string(),
            recipient_count: campaign.recipient_count,
            total_sent: campaign.total_sent,
            total_failed: campaign.total_failed,
            retry_cycles: campaign.retry_cycles,
            completed_at,
        }
        .render()
        .context("Failed to render text template")?;

        let subject = format!("[{}] campaign {}", display_subject, campaign.state);
        self.mailer
            .send_email(&self.operator, &subject, &html, &text)
            .await
    }
}
