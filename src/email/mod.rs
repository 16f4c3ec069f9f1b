//! Outbound email as a background task: the message contract, the handler
//! the email worker runs, and the helper the rest of the application uses to
//! enqueue emails.

pub mod handler;
pub mod message;
pub mod sender;
pub mod smtp;
pub mod tasks;

pub use handler::SendEmailHandler;
pub use message::{EmailError, EmailMessage, Recipients};
pub use sender::{EmailSender, LogEmailSender};
pub use smtp::SmtpEmailSender;
pub use tasks::EmailTasks;

pub const EMAIL_QUEUE: &str = "p_email";
pub const EMAIL_EXCHANGE: &str = "p_email_exchange";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailAction {
    SendEmail,
}

impl EmailAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SendEmail => "send_email",
        }
    }

    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "send_email" => Some(Self::SendEmail),
            _ => None,
        }
    }
}
