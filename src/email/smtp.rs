use std::path::Path;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

use super::message::{EmailError, EmailMessage};
use super::sender::EmailSender;
use crate::config::SmtpConfig;

/// Delivers email through an SMTPS relay (TLS from the first byte),
/// logging in with the configured credentials.
pub struct SmtpEmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpEmailSender {
    pub fn new(config: &SmtpConfig, from: &str) -> Result<Self, EmailError> {
        let from = from.parse::<Mailbox>().map_err(|e| {
            EmailError::Configuration(format!("invalid sender address {:?}: {}", from, e))
        })?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.server)
            .map_err(|e| EmailError::Configuration(format!("invalid SMTP relay: {}", e)))?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .timeout(Some(config.timeout))
            .build();

        info!(
            server = %config.server,
            port = config.port,
            username = %config.username,
            "SMTP email sender configured"
        );
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        let email = compose(&self.from, message).await?;
        let response = self.transport.send(email).await.map_err(classify)?;
        debug!(code = %response.code(), "SMTP server accepted message");
        Ok(())
    }
}

/// Permanent (5xx) replies mean the message itself is refused. Everything
/// else, from connection failures to 4xx replies, is worth retrying.
fn classify(error: lettre::transport::smtp::Error) -> EmailError {
    if error.is_permanent() {
        EmailError::Rejected(error.to_string())
    } else {
        EmailError::Unavailable(error.to_string())
    }
}

async fn compose(from: &Mailbox, message: &EmailMessage) -> Result<Message, EmailError> {
    let mut builder = Message::builder()
        .from(from.clone())
        .subject(message.subject.clone());
    for address in message.to.to_vec() {
        builder = builder.to(mailbox(&address)?);
    }
    for address in &message.cc {
        builder = builder.cc(mailbox(address)?);
    }
    for address in &message.bcc {
        builder = builder.bcc(mailbox(address)?);
    }

    let body_type = if message.body_type.eq_ignore_ascii_case("html") {
        ContentType::TEXT_HTML
    } else {
        ContentType::TEXT_PLAIN
    };
    let mut parts = MultiPart::mixed().singlepart(
        SinglePart::builder()
            .header(body_type)
            .body(message.body.clone()),
    );

    for path in &message.attachments {
        let content = tokio::fs::read(path)
            .await
            .map_err(|_| EmailError::AttachmentNotFound(path.clone()))?;
        let filename = Path::new(path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        let content_type = ContentType::parse(attachment_content_type(path))
            .map_err(|e| EmailError::Rejected(e.to_string()))?;

        parts = parts.singlepart(Attachment::new(filename).body(content, content_type));
    }

    builder
        .multipart(parts)
        .map_err(|e| EmailError::Rejected(format!("failed to build message: {}", e)))
}

fn mailbox(address: &str) -> Result<Mailbox, EmailError> {
    address
        .trim()
        .parse()
        .map_err(|e| EmailError::Rejected(format!("invalid address {:?}: {}", address, e)))
}

fn attachment_content_type(path: &str) -> &'static str {
    let extension = Path::new(path)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "pdf" => "application/pdf",
        "doc" | "docx" => "application/msword",
        "xls" | "xlsx" => "application/vnd.ms-excel",
        _ => "application/octet-stream",
    }
}
