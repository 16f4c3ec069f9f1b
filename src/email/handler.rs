use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable};
use tracing::{error, info, warn};

use super::EmailAction;
use super::message::EmailMessage;
use super::sender::EmailSender;
use crate::contracts::ProcessingOutcome;
use crate::messaging::{Envelope, HandlerError, MessageHandler};

/// Header quorum queues set to the number of earlier delivery attempts.
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

pub const MAX_DELIVERY_ATTEMPTS: u64 = 5;

pub struct SendEmailHandler<S> {
    sender: S,
}

impl<S: EmailSender> SendEmailHandler<S> {
    pub fn new(sender: S) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl<S: EmailSender> MessageHandler for SendEmailHandler<S> {
    fn name(&self) -> &str {
        "SendEmailHandler"
    }

    fn can_handle(&self, action: &str) -> bool {
        EmailAction::parse(action) == Some(EmailAction::SendEmail)
    }

    async fn handle(&self, envelope: &Envelope) -> Result<ProcessingOutcome, HandlerError> {
        let message = match EmailMessage::from_payload(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, delivery_tag = envelope.delivery_tag, "Invalid email payload");
                return Ok(ProcessingOutcome::Reject);
            }
        };

        match self.sender.send(&message).await {
            Ok(()) => {
                info!(
                    to = ?message.to.to_vec(),
                    subject = %message.subject,
                    "Email sent successfully"
                );
                Ok(ProcessingOutcome::Success)
            }
            Err(e) if e.is_transient() => {
                let attempts = delivery_attempts(&envelope.headers);
                if attempts >= MAX_DELIVERY_ATTEMPTS {
                    error!(
                        error = %e,
                        attempts,
                        subject = %message.subject,
                        "Email delivery attempts exhausted"
                    );
                    return Ok(ProcessingOutcome::Reject);
                }
                warn!(
                    error = %e,
                    attempts,
                    subject = %message.subject,
                    "Email transport unavailable, will retry"
                );
                Ok(ProcessingOutcome::Retry)
            }
            Err(e) => {
                error!(error = %e, subject = %message.subject, "Failed to send email");
                Ok(ProcessingOutcome::Reject)
            }
        }
    }
}

/// Attempts including the current one. Brokers that do not count
/// deliveries always report the first attempt.
fn delivery_attempts(headers: &FieldTable) -> u64 {
    let previous = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
        .and_then(|(_, value)| match value {
            AMQPValue::ShortShortUInt(n) => Some(u64::from(*n)),
            AMQPValue::ShortUInt(n) => Some(u64::from(*n)),
            AMQPValue::LongUInt(n) => Some(u64::from(*n)),
            AMQPValue::ShortInt(n) => u64::try_from(*n).ok(),
            AMQPValue::LongInt(n) => u64::try_from(*n).ok(),
            AMQPValue::LongLongInt(n) => u64::try_from(*n).ok(),
            _ => None,
        })
        .unwrap_or(0);
    previous + 1
}
