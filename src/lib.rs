pub mod api;
pub mod backoff;
pub mod batch_sender;
pub mod chunks;
pub mod config;
pub mod dispatcher;
pub mod mailer;
pub mod notifier;
pub mod progress;
pub mod recipients;
pub mod retry;
pub mod storage;
pub mod transport;
pub mod types;
pub mod worker;

use crate::batch_sender::BatchSender;
use crate::config::{NotifierConfig, PipelineConfig, SenderIdentity, SmtpSettings, required_env};
use crate::dispatcher::Dispatcher;
use crate::mailer::SesMailer;
use crate::notifier::OperatorNotifier;
use crate::recipients::RecipientValidator;
use crate::storage::DynamoStorage;
use crate::transport::SmtpTransportFactory;
use anyhow::Result;
use aws_config::BehaviorVersion;
use std::sync::Arc;

/// The production wiring: DynamoDB state, SMTP delivery, SES operator mail.
pub type LiveDispatcher = Dispatcher<DynamoStorage, SesMailer, SmtpTransportFactory>;

/// Build the dispatcher from environment variables and the default AWS
/// credential chain.
pub async fn live_dispatcher() -> Result<LiveDispatcher> {
    let pipeline = PipelineConfig::from_env()?;
    let smtp = SmtpSettings::from_env()?;
    let sender = SenderIdentity::from_env()?;
    let notifier_config = NotifierConfig::from_env()?;
    let dynamodb_table = required_env("DYNAMODB_TABLE")?;

    let aws = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let storage = Arc::new(DynamoStorage::new(
        aws_sdk_dynamodb::Client::new(&aws),
        dynamodb_table,
    ));
    let mailer = Arc::new(SesMailer::new(
        aws_sdk_sesv2::Client::new(&aws),
        notifier_config.from_email,
        notifier_config.configuration_set,
    ));

    let notifier = OperatorNotifier::new(mailer, &notifier_config.operator_email)?
        .with_subject_template(&pipeline.subject_template);

    Ok(Dispatcher::new(
        Arc::clone(&storage),
        Arc::new(RecipientValidator::new(storage)),
        BatchSender::new(SmtpTransportFactory, smtp, sender, pipeline),
        notifier,
    ))
}
