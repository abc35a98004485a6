//! Recipient list validation and privacy-preserving identity hashing.
//!
//! Raw lists arrive one address per line. Each line is trimmed, lower-cased
//! and syntax-checked; valid addresses are deduplicated and resolved against
//! the hashed identity store (`SHA256(normalized + salt)`), so the store never
//! holds a plaintext address.

use crate::storage::Storage;
use crate::types::HashedRecipient;
use anyhow::Result;
use chrono::{DateTime, Utc};
use email_address::EmailAddress;
use futures::{StreamExt, TryStreamExt, stream};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const SALT_BYTES: usize = 32;

/// Identity-store calls kept in flight at once.
pub const LOOKUP_CONCURRENCY: usize = 16;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("recipient list is empty")]
    EmptyInput,

    #[error("hashing salt unavailable: {0:#}")]
    SaltUnavailable(anyhow::Error),

    #[error("recipient store error: {0:#}")]
    Storage(anyhow::Error),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    /// Unique valid addresses.
    pub valid: usize,
    pub invalid: usize,
    /// Valid lines that repeated an earlier address.
    pub duplicates: usize,
    pub new: usize,
    pub existing: usize,
    /// Normalized unique addresses, in first-seen order.
    #[serde(skip)]
    pub emails: Vec<String>,
    pub hashed_emails: Vec<HashedRecipient>,
    pub invalid_emails: Vec<String>,
}

pub fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// `local@domain` with non-empty parts and no whitespace anywhere.
pub fn is_valid_email(normalized: &str) -> bool {
    if normalized.chars().any(char::is_whitespace) {
        return false;
    }
    match normalized.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
            EmailAddress::is_valid(normalized)
        }
        _ => false,
    }
}

/// Lower-case hex SHA-256 of `normalized + salt`.
pub fn hash_email(normalized: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct RecipientValidator<S> {
    storage: Arc<S>,
    salt: OnceCell<String>,
}

impl<S: Storage> RecipientValidator<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            salt: OnceCell::new(),
        }
    }

    /// The process-wide salt, created and persisted on first use.
    pub async fn salt(&self) -> Result<&str> {
        let salt = self
            .salt
            .get_or_try_init(|| async {
                let candidate = generate_salt();
                self.storage.insert_salt_if_absent(&candidate).await
            })
            .await?;
        Ok(salt.as_str())
    }

    pub async fn validate_and_hash(&self, raw: &str) -> Result<ValidationReport, ValidationError> {
        if raw.trim().is_empty() {
            return Err(ValidationError::EmptyInput);
        }

        let salt = self
            .salt()
            .await
            .map_err(ValidationError::SaltUnavailable)?
            .to_string();

        let mut report = ValidationReport::default();
        let mut seen: HashSet<String> = HashSet::new();

        for line in raw.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let normalized = normalize(trimmed);
            if !is_valid_email(&normalized) {
                debug!(line = %trimmed, "Rejecting invalid address");
                report.invalid_emails.push(trimmed.to_string());
                continue;
            }

            if seen.insert(normalized.clone()) {
                report.emails.push(normalized);
            } else {
                report.duplicates += 1;
            }
        }

        report.valid = report.emails.len();
        report.invalid = report.invalid_emails.len();

        // `buffered` yields in input order, so hashes line up with `emails`.
        let hashes: Vec<String> = report.emails.iter().map(|email| hash_email(email, &salt)).collect();
        let resolved: Vec<(HashedRecipient, bool)> = stream::iter(hashes)
            .map(|hash| self.resolve(hash))
            .buffered(LOOKUP_CONCURRENCY)
            .try_collect()
            .await
            .map_err(ValidationError::Storage)?;

        for (recipient, created) in resolved {
            if created {
                report.new += 1;
            } else {
                report.existing += 1;
            }
            report.hashed_emails.push(recipient);
        }

        info!(
            valid = report.valid,
            invalid = report.invalid,
            duplicates = report.duplicates,
            new = report.new,
            existing = report.existing,
            "Validated recipient list"
        );

        Ok(report)
    }

    /// Stamp `last_sent_at` on the identities of delivered addresses.
    /// Failures are logged and skipped; delivery state lives on the campaign.
    pub async fn mark_delivered(&self, emails: &[String], at: DateTime<Utc>) -> Result<()> {
        let salt = self.salt().await?;
        stream::iter(emails)
            .for_each_concurrent(LOOKUP_CONCURRENCY, |email| {
                let hash = hash_email(email, salt);
                async move {
                    if let Err(e) = self.storage.mark_recipient_sent(&hash, at).await {
                        warn!(error = %e, "Failed to stamp recipient delivery");
                    }
                }
            })
            .await;
        Ok(())
    }

    async fn resolve(&self, hash: String) -> Result<(HashedRecipient, bool)> {
        if let Some(existing) = self.storage.get_recipient(&hash).await? {
            return Ok((existing, false));
        }

        let fresh = HashedRecipient::new(hash);
        if self.storage.insert_recipient(&fresh).await? {
            return Ok((fresh, true));
        }

        // Another writer inserted the same identity between lookup and insert.
        let stored = self.storage.get_recipient(&fresh.hash).await?;
        Ok((stored.unwrap_or(fresh), false))
    }
}
