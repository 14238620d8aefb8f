use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::{AsyncTransport, Message as LettreMessage};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use quotemail_core::{Attachment, MailError};

use crate::connection::ConnectionManager;

/// A send request as it arrives at the dispatcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMail {
    pub to_email: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// Wire-level identifiers the dispatcher settles before the first attempt.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub from: String,
    /// Our own Message-ID for the outgoing mail, angle-bracketed.
    pub message_id: String,
    /// Parent's Message-ID, if the parent record carries one.
    pub in_reply_to: Option<String>,
}

/// Seam between the dispatcher and the mail-submission protocol. The
/// production implementation is [`SmtpOutbound`]; tests use mocks.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Sender address from configuration. A missing configuration surfaces
    /// here, before any attempt is made.
    fn sender(&self) -> Result<String, MailError>;

    async fn deliver(&self, mail: &OutgoingMail, ctx: &DeliveryContext) -> Result<(), MailError>;

    /// Discard state after a failed attempt so the next one reconnects.
    async fn invalidate(&self);
}

/// lettre-backed transport behind the connection lifecycle manager.
pub struct SmtpOutbound {
    connections: Arc<ConnectionManager>,
}

impl SmtpOutbound {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl OutboundTransport for SmtpOutbound {
    fn sender(&self) -> Result<String, MailError> {
        Ok(self.connections.smtp_config()?.sender().to_string())
    }

    async fn deliver(&self, mail: &OutgoingMail, ctx: &DeliveryContext) -> Result<(), MailError> {
        let transport = self.connections.acquire_outbound().await?;
        let message = build_message(mail, ctx)?;

        let response = transport
            .send(message)
            .await
            .map_err(|e| classify_smtp_error(&e))?;

        info!(
            to = %mail.to_email,
            code = %response.code(),
            "SMTP accepted message {}",
            ctx.message_id
        );
        Ok(())
    }

    async fn invalidate(&self) {
        self.connections.invalidate_outbound().await;
    }
}

/// Build the RFC 5322 message: plain-text body, optional attachment parts
/// with their declared content types and filenames.
pub fn build_message(mail: &OutgoingMail, ctx: &DeliveryContext) -> Result<LettreMessage, MailError> {
    let from_mailbox: Mailbox = ctx
        .from
        .parse()
        .map_err(|e| MailError::Configuration(format!("invalid sender address: {}", e)))?;
    let to_mailbox: Mailbox = mail
        .to_email
        .parse()
        .map_err(|e| MailError::Validation(format!("invalid recipient address: {}", e)))?;

    let mut builder = LettreMessage::builder()
        .from(from_mailbox)
        .to(to_mailbox)
        .subject(&mail.subject)
        .message_id(Some(ctx.message_id.clone()));

    if let Some(ref in_reply_to) = ctx.in_reply_to {
        builder = builder
            .in_reply_to(in_reply_to.clone())
            .references(in_reply_to.clone());
    }

    let message = if mail.attachments.is_empty() {
        builder
            .header(ContentType::TEXT_PLAIN)
            .body(mail.body.clone())
            .map_err(|e| MailError::Validation(format!("failed to build message: {}", e)))?
    } else {
        let mut multipart = MultiPart::mixed().singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_PLAIN)
                .body(mail.body.clone()),
        );

        for attachment in &mail.attachments {
            let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                MailError::Validation(format!(
                    "attachment '{}' has unparseable content type: {}",
                    attachment.filename, e
                ))
            })?;
            let bytes = attachment.decode_content()?;
            multipart = multipart.singlepart(
                lettre::message::Attachment::new(attachment.filename.clone())
                    .body(bytes, content_type),
            );
        }

        builder
            .multipart(multipart)
            .map_err(|e| MailError::Validation(format!("failed to build multipart message: {}", e)))?
    };

    Ok(message)
}

/// Map lettre errors onto the taxonomy: permanent 5xx rejections are not
/// retried, everything else (refused connection, timeout, 4xx) is transient.
pub(crate) fn classify_smtp_error(error: &lettre::transport::smtp::Error) -> MailError {
    if error.is_permanent() {
        MailError::permanent(format!("SMTP rejected message: {}", error))
    } else {
        MailError::transient(format!("SMTP send failed: {}", error))
    }
}
