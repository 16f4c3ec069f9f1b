use std::sync::Arc;

use tracing::error;

use super::message::EmailMessage;
use super::{EMAIL_EXCHANGE, EMAIL_QUEUE, EmailAction};
use crate::messaging::{BatchReport, MessageBody, PublishOptions, Publisher, PublisherError};

/// Enqueues emails for the email worker.
#[derive(Clone)]
pub struct EmailTasks {
    publisher: Arc<Publisher>,
}

impl EmailTasks {
    pub fn new(publisher: Arc<Publisher>) -> Self {
        Self { publisher }
    }

    pub fn publish_options() -> PublishOptions {
        PublishOptions::default().with_action(EmailAction::SendEmail.as_str())
    }

    /// `Ok(false)` when the broker did not take the message.
    pub async fn send_email(&self, message: &EmailMessage) -> Result<bool, PublisherError> {
        let body = MessageBody::json(message).inspect_err(|e| {
            error!(error = %e, subject = %message.subject, "Failed to encode email task");
        })?;

        self.publisher
            .publish(EMAIL_QUEUE, EMAIL_EXCHANGE, body, &Self::publish_options())
            .await
    }

    pub async fn send_emails(
        &self,
        messages: &[EmailMessage],
    ) -> Result<BatchReport, PublisherError> {
        let bodies = messages
            .iter()
            .map(MessageBody::json)
            .collect::<Result<Vec<_>, _>>()?;

        self.publisher
            .publish_batch(EMAIL_QUEUE, EMAIL_EXCHANGE, bodies, &Self::publish_options())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RabbitMqConfig;
    use crate::metrics::Metrics;
    use serde_json::Value;

    fn tasks() -> EmailTasks {
        let publisher = Publisher::new(
            RabbitMqConfig::new("amqp://localhost:5672"),
            Metrics::new().unwrap(),
        );
        EmailTasks::new(Arc::new(publisher))
    }

    #[test]
    fn test_publish_options() {
        let options = EmailTasks::publish_options();
        assert_eq!(options.action.as_deref(), Some("send_email"));
        assert!(options.durable);
    }

    #[test]
    fn test_email_task_body() {
        let message = EmailMessage::new("a@b.com", "hi", "hello");
        let encoded = MessageBody::json(&message)
            .unwrap()
            .encode(EmailTasks::publish_options().action.as_deref())
            .unwrap();

        let decoded: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded["action"], "send_email");
        assert_eq!(decoded["to"], "a@b.com");
        assert_eq!(decoded["body_type"], "html");
    }

    #[tokio::test]
    async fn test_send_email_requires_initialized_publisher() {
        let message = EmailMessage::new("a@b.com", "hi", "hello");
        let result = tasks().send_email(&message).await;
        assert!(matches!(result, Err(PublisherError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_send_emails_requires_initialized_publisher() {
        let messages = vec![
            EmailMessage::new("a@b.com", "one", "1"),
            EmailMessage::new("c@d.com", "two", "2"),
        ];
        let result = tasks().send_emails(&messages).await;
        assert!(matches!(result, Err(PublisherError::NotInitialized)));
    }
}
