use async_trait::async_trait;
use tracing::info;

use super::message::{EmailError, EmailMessage};

/// Delivers an email through some mail transport.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError>;
}

/// Records each email as a structured log event instead of talking to a
/// mail server. Attachments must exist on local disk.
#[derive(Debug, Clone)]
pub struct LogEmailSender {
    from: String,
}

impl LogEmailSender {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }

    pub fn from_address(&self) -> &str {
        &self.from
    }
}

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        for path in &message.attachments {
            match tokio::fs::try_exists(path).await {
                Ok(true) => {}
                _ => return Err(EmailError::AttachmentNotFound(path.clone())),
            }
        }

        info!(
            from = %self.from,
            to = ?message.to.to_vec(),
            cc = message.cc.len(),
            bcc = message.bcc.len(),
            subject = %message.subject,
            body_type = %message.body_type,
            body_len = message.body.len(),
            attachments = message.attachments.len(),
            "Email sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_sender_accepts_plain_message() {
        let sender = LogEmailSender::new("noreply@example.com");
        let message = EmailMessage::new("a@b.com", "hi", "hello");
        assert!(sender.send(&message).await.is_ok());
        assert_eq!(sender.from_address(), "noreply@example.com");
    }

    #[tokio::test]
    async fn test_log_sender_missing_attachment() {
        let sender = LogEmailSender::new("noreply@example.com");
        let mut message = EmailMessage::new("a@b.com", "hi", "hello");
        message.attachments = vec!["/definitely/not/here.pdf".to_string()];

        let result = sender.send(&message).await;
        assert!(matches!(result, Err(EmailError::AttachmentNotFound(path)) if path == "/definitely/not/here.pdf"));
    }

    #[tokio::test]
    async fn test_log_sender_existing_attachment() {
        let path = std::env::temp_dir().join(format!("attachment-{}.txt", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, b"report").await.unwrap();

        let sender = LogEmailSender::new("noreply@example.com");
        let mut message = EmailMessage::new("a@b.com", "hi", "hello");
        message.attachments = vec![path.to_string_lossy().into_owned()];

        assert!(sender.send(&message).await.is_ok());
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
