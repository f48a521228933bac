//! SMTP delivery for staff notifications.

use crate::config::SmtpConfig;
use crate::intake::Notifier;
use crate::notify::NotificationEmail;
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid smtp relay: {0}")]
    Relay(String),
    #[error("could not build message: {0}")]
    Build(String),
    #[error("smtp send failed: {0}")]
    Send(String),
}

pub struct SmtpNotifier {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpNotifier {
    /// Builds a STARTTLS relay with the configured credentials. No
    /// connection is opened until the first send.
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|err| MailError::Relay(err.to_string()))?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .timeout(Some(config.timeout))
            .build();
        info!(
            target: "appraisal.mail",
            host = %config.host,
            port = config.port,
            "smtp notifier initialized"
        );
        Ok(Self {
            mailer,
            from: config.from.clone(),
            to: config.to.clone(),
        })
    }
}

pub fn build_message(
    from: &Mailbox,
    to: &Mailbox,
    email: &NotificationEmail,
) -> Result<Message, MailError> {
    Message::builder()
        .from(from.clone())
        .to(to.clone())
        .subject(email.subject.as_str())
        .multipart(MultiPart::alternative_plain_html(
            email.text.clone(),
            email.html.clone(),
        ))
        .map_err(|err| MailError::Build(err.to_string()))
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send_notification(&self, email: &NotificationEmail) -> Result<(), MailError> {
        let message = build_message(&self.from, &self.to, email)?;
        self.mailer
            .send(message)
            .await
            .map_err(|err| MailError::Send(err.to_string()))?;
        info!(target: "appraisal.mail", to = %self.to, "notification email sent");
        Ok(())
    }
}
