use anyhow::{Context, Result};
use aws_sdk_sesv2::Client;
use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message};
use email_address::EmailAddress;
use tracing::info;

// ============================================================================
// Mailer trait
// ============================================================================

/// Single-message email primitive used for operator notifications. Bulk
/// newsletter traffic goes through [`crate::transport`] instead.
#[allow(async_fn_in_trait)]
pub trait Mailer: Send + Sync {
    async fn send_email(
        &self,
        recipient: &EmailAddress,
        subject: &str,
        html_content: &str,
        text_content: &str,
    ) -> Result<()>;
}

// ============================================================================
// SesMailer: AWS SES v2 implementation
// ============================================================================

pub struct SesMailer {
    ses_client: Client,
    from_address: String,
    configuration_set_name: Option<String>,
}

impl SesMailer {
    pub fn new(
        ses_client: Client,
        from_address: String,
        configuration_set_name: Option<String>,
    ) -> Self {
        Self {
            ses_client,
            from_address,
            configuration_set_name,
        }
    }
}

impl Mailer for SesMailer {
    async fn send_email(
        &self,
        recipient: &EmailAddress,
        subject: &str,
        html_content: &str,
        text_content: &str,
    ) -> Result<()> {
        let subject_content = Content::builder().data(subject).charset("UTF-8").build()?;
        let html_body = Content::builder()
            .data(html_content)
            .charset("UTF-8")
            .build()?;
        let text_body = Content::builder()
            .data(text_content)
            .charset("UTF-8")
            .build()?;

        let body = Body::builder().html(html_body).text(text_body).build();

        let message = Message::builder().subject(subject_content).body(body).build();

        let destination = Destination::builder()
            .to_addresses(recipient.to_string())
            .build();
        let email_content = EmailContent::builder().simple(message).build();

        let response = self
            .ses_client
            .send_email()
            .from_email_address(&self.from_address)
            .destination(destination)
            .content(email_content)
            .set_configuration_set_name(self.configuration_set_name.clone())
            .send()
            .await
            .context(format!("Failed to send email to {}", recipient))?;

        info!(
            message_id = ?response.message_id(),
            recipient = %recipient,
            "Email sent"
        );

        Ok(())
    }
}

// ============================================================================
// Test utilities: SpyMailer for in-crate tests
// ============================================================================
