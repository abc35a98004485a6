use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a campaign. `Sent` and `SentWithFailures` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Draft,
    Sending,
    Retrying,
    Sent,
    SentWithFailures,
}

impl CampaignState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::SentWithFailures)
    }
}

impl fmt::Display for CampaignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Sending => "sending",
            Self::Retrying => "retrying",
            Self::Sent => "sent",
            Self::SentWithFailures => "sent_with_failures",
        };
        f.write_str(s)
    }
}

impl FromStr for CampaignState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "sending" => Ok(Self::Sending),
            "retrying" => Ok(Self::Retrying),
            "sent" => Ok(Self::Sent),
            "sent_with_failures" => Ok(Self::SentWithFailures),
            other => anyhow::bail!("Invalid campaign state: {}", other),
        }
    }
}

/// One newsletter send job and its full outcome history.
/// Stored under PK="CAMPAIGN#{id}": SK="HEAD", "RECIPIENTS#{page}", "BATCH#{seq}"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub subject: String,
    pub body: String,
    pub state: CampaignState,
    /// Normalized, deduplicated addresses in send order.
    pub recipients: Vec<String>,
    pub recipient_count: usize,
    pub total_chunks: usize,
    /// Chunk size fixed when sending starts, so chunk indices stay stable
    /// across resumes and retries.
    #[serde(default)]
    pub chunk_size: usize,
    pub batch_results: Vec<BatchResult>,
    pub total_sent: usize,
    pub total_failed: usize,
    pub retry_cycles: u32,
    /// Set by a cancel request; a running dispatch stops before its next chunk.
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Create a draft campaign with a generated identifier.
    pub fn new(subject: String, body: String, recipients: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject,
            body,
            state: CampaignState::Draft,
            recipient_count: recipients.len(),
            recipients,
            total_chunks: 0,
            chunk_size: 0,
            batch_results: Vec::new(),
            total_sent: 0,
            total_failed: 0,
            retry_cycles: 0,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// One execution of the batch sender against one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub completed_at: DateTime<Utc>,
    pub results: Vec<RecipientOutcome>,
}

impl BatchResult {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientOutcome {
    pub email: String,
    pub success: bool,
    pub error: Option<String>,
    pub attempts: u32,
}

impl RecipientOutcome {
    pub fn delivered(email: impl Into<String>, attempts: u32) -> Self {
        Self {
            email: email.into(),
            success: true,
            error: None,
            attempts,
        }
    }

    pub fn failed(email: impl Into<String>, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            email: email.into(),
            success: false,
            error: Some(error.into()),
            attempts,
        }
    }
}

/// Privacy-preserving identity record. Never holds the plaintext address.
/// PK="RECIPIENT", SK="{hash}"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashedRecipient {
    pub id: String,
    pub hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_sent_at: Option<DateTime<Utc>>,
}

impl HashedRecipient {
    pub fn new(hash: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hash,
            first_seen_at: Utc::now(),
            last_sent_at: None,
        }
    }
}

/// Ordered, size-bounded subset of a campaign's recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub total: usize,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub total_sent: usize,
    pub total_failed: usize,
    pub is_complete: bool,
    pub completed_chunks: usize,
    pub total_chunks: usize,
    pub percent_complete: f64,
}

/// An address that exhausted its attempts, with the last error seen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermanentFailure {
    pub email: String,
    pub error: String,
    pub attempts: u32,
}
