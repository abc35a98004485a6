//! Sends one chunk through one freshly verified connection.

use crate::config::{DATE_TOKEN, PipelineConfig, SenderIdentity, SmtpSettings};
use crate::transport::{
    DeliveryReport, OutgoingMessage, Transport, TransportError, TransportFactory, connect_once,
    open_verified,
};
use crate::types::{BatchResult, Chunk, RecipientOutcome};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Recorded for every recipient of a chunk whose connection never verified.
pub const CONNECTION_FAILED: &str = "connection failed";

const SUBJECT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Substitute the date token in `template`. An empty template falls back to
/// `default_template`.
pub fn render_subject(template: &str, default_template: &str, now: DateTime<Utc>) -> String {
    let template = if template.trim().is_empty() {
        default_template
    } else {
        template
    };
    template.replace(DATE_TOKEN, &now.format(SUBJECT_DATE_FORMAT).to_string())
}

pub struct BatchSender<F> {
    factory: F,
    smtp: SmtpSettings,
    sender: SenderIdentity,
    config: PipelineConfig,
}

impl<F: TransportFactory> BatchSender<F> {
    pub fn new(
        factory: F,
        smtp: SmtpSettings,
        sender: SenderIdentity,
        config: PipelineConfig,
    ) -> Self {
        Self {
            factory,
            smtp,
            sender,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Deliver `chunk` and report one outcome per recipient. Never fails as a
    /// whole: connection and provider errors are recorded on the outcomes.
    ///
    /// `prior_attempts` holds attempts already spent per address; each outcome
    /// records one more.
    pub async fn send_batch(
        &self,
        chunk: &Chunk,
        subject: &str,
        body: &str,
        prior_attempts: &HashMap<String, u32>,
    ) -> BatchResult {
        let attempts_for =
            |email: &str| prior_attempts.get(email).copied().unwrap_or(0).saturating_add(1);

        let results = match open_verified(
            &self.factory,
            &self.smtp,
            self.config.max_retries,
            self.config.max_backoff_delay,
        )
        .await
        {
            Err(e) => {
                warn!(
                    chunk_index = chunk.index,
                    error = %e,
                    "Connection never verified, failing chunk"
                );
                chunk
                    .recipients
                    .iter()
                    .map(|email| RecipientOutcome::failed(email, CONNECTION_FAILED, attempts_for(email)))
                    .collect()
            }
            Ok(transport) => {
                let message = self.compose(chunk, subject, body);
                match self.deliver(transport, &message, chunk.index).await {
                    Ok(report) => chunk
                        .recipients
                        .iter()
                        .map(|email| match report.rejection_for(email) {
                            Some(reason) => {
                                debug!(email = %email, reason, "Recipient rejected");
                                RecipientOutcome::failed(email, reason, attempts_for(email))
                            }
                            None => RecipientOutcome::delivered(email, attempts_for(email)),
                        })
                        .collect(),
                    Err(e) => {
                        warn!(chunk_index = chunk.index, error = %e, "Chunk send failed");
                        let error = e.to_string();
                        chunk
                            .recipients
                            .iter()
                            .map(|email| RecipientOutcome::failed(email, &error, attempts_for(email)))
                            .collect()
                    }
                }
            }
        };

        let batch = BatchResult {
            chunk_index: chunk.index,
            total_chunks: chunk.total,
            completed_at: Utc::now(),
            results,
        };

        info!(
            chunk_index = chunk.index,
            total_chunks = chunk.total,
            succeeded = batch.succeeded(),
            failed = batch.failed(),
            "Chunk processed"
        );

        batch
    }

    /// Blind-copy everyone behind the sender's own address, except for a lone
    /// recipient who is addressed directly.
    fn compose(&self, chunk: &Chunk, subject: &str, body: &str) -> OutgoingMessage {
        let (to, bcc) = match chunk.recipients.as_slice() {
            [only] => (vec![only.clone()], Vec::new()),
            many => (vec![self.sender.from_email.clone()], many.to_vec()),
        };

        OutgoingMessage {
            from: self.sender.mailbox(),
            reply_to: self.sender.reply_to_email.clone(),
            to,
            bcc,
            subject: render_subject(subject, &self.config.subject_template, Utc::now()),
            html_body: body.to_string(),
        }
    }

    /// Send once, and on a connection-class failure reconnect (no backoff) and
    /// send exactly once more. Every connection is closed before returning.
    async fn deliver(
        &self,
        mut transport: F::Transport,
        message: &OutgoingMessage,
        chunk_index: usize,
    ) -> Result<DeliveryReport, TransportError> {
        match transport.send(message).await {
            Err(e) if e.is_connection() => {
                transport.close();
                warn!(chunk_index, error = %e, "Connection dropped mid-send, reconnecting");

                let mut fresh = connect_once(&self.factory, &self.smtp).await?;
                let result = fresh.send(message).await;
                fresh.close();
                result
            }
            result => {
                transport.close();
                result
            }
        }
    }
}
