//! Mail transport abstraction and per-chunk connection lifecycle.
//!
//! Every chunk gets its own freshly opened, verified connection which is
//! closed once the chunk is done. Connections are never shared between
//! chunks, so at most one provider connection is open at any time.

use crate::backoff::verify_backoff;
use crate::config::SmtpSettings;
use backon::Retryable;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub mod smtp;
pub use smtp::SmtpTransportFactory;

/// Lower-cased fragments that mark an error as connection-level regardless of
/// how the underlying client categorised it.
const CONNECTION_ERROR_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "broken pipe",
    "timed out",
    "timeout",
    "too many connections",
    "handshake",
    "greeting",
    "network",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Refused connection, handshake failure, socket timeout, too many connections.
    #[error("{0}")]
    Connection(String),

    /// The server answered but refused the message.
    #[error("{0}")]
    Rejected(String),

    /// The message could not be built (bad address, bad header).
    #[error("{0}")]
    Message(String),
}

impl TransportError {
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

pub fn looks_like_connection_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    CONNECTION_ERROR_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// A fully rendered message ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub from: String,
    pub reply_to: Option<String>,
    pub to: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub html_body: String,
}

impl OutgoingMessage {
    /// Every address the server is asked to deliver to.
    pub fn envelope_recipients(&self) -> impl Iterator<Item = &String> {
        self.to.iter().chain(self.bcc.iter())
    }
}

/// Addresses the server refused while accepting the message for the rest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub rejected: Vec<(String, String)>,
}

impl DeliveryReport {
    pub fn rejection_for(&self, email: &str) -> Option<&str> {
        self.rejected
            .iter()
            .find(|(addr, _)| addr.eq_ignore_ascii_case(email))
            .map(|(_, reason)| reason.as_str())
    }
}

// ============================================================================
// Transport traits
// ============================================================================

#[allow(async_fn_in_trait)]
pub trait Transport: Send {
    /// Check the server is reachable and accepts us.
    async fn verify(&mut self) -> Result<(), TransportError>;

    async fn send(&mut self, message: &OutgoingMessage) -> Result<DeliveryReport, TransportError>;

    /// Tear the connection down. Consumes the transport so it cannot be reused.
    fn close(self);
}

pub trait TransportFactory: Send + Sync {
    type Transport: Transport;

    fn open(&self, settings: &SmtpSettings) -> Result<Self::Transport, TransportError>;
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Open a connection and verify it, retrying connection-class failures up to
/// `max_retries` attempts with exponential backoff. Any connection opened here
/// and not returned is closed before this function returns.
pub async fn open_verified<F: TransportFactory>(
    factory: &F,
    settings: &SmtpSettings,
    max_retries: u32,
    max_backoff: Duration,
) -> Result<F::Transport, TransportError> {
    (|| connect_once(factory, settings))
        .retry(verify_backoff(max_retries, max_backoff))
        .when(TransportError::is_connection)
        .notify(|err: &TransportError, delay: Duration| {
            warn!(
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transport verification failed, retrying"
            );
        })
        .await
        .inspect_err(|err| warn!(error = %err, "Transport verification failed"))
}

/// Single open + verify with no retry. Closes the connection if verification fails.
pub async fn connect_once<F: TransportFactory>(
    factory: &F,
    settings: &SmtpSettings,
) -> Result<F::Transport, TransportError> {
    let mut transport = factory.open(settings)?;
    match transport.verify().await {
        Ok(()) => Ok(transport),
        Err(e) => {
            transport.close();
            Err(e)
        }
    }
}

// ============================================================================
// Test utilities: scripted transport
// ============================================================================
