use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_BODY_TYPE: &str = "html";

/// One address or several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl Recipients {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(address) => vec![address.clone()],
            Self::Many(addresses) => addresses.clone(),
        }
    }
}

impl From<&str> for Recipients {
    fn from(address: &str) -> Self {
        Self::One(address.to_string())
    }
}

impl From<Vec<String>> for Recipients {
    fn from(addresses: Vec<String>) -> Self {
        Self::Many(addresses)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: Recipients,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default = "default_body_type")]
    pub body_type: String,
}

fn default_body_type() -> String {
    DEFAULT_BODY_TYPE.to_string()
}

impl EmailMessage {
    pub fn new(
        to: impl Into<Recipients>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            cc: Vec::new(),
            bcc: Vec::new(),
            attachments: Vec::new(),
            body_type: default_body_type(),
        }
    }

    /// Reads a task payload leniently: scalar fields are stringified and
    /// `cc`, `bcc` and `attachments` accept either one value or a list.
    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self, EmailError> {
        let to = match required(payload, "to")? {
            Value::Array(items) => Recipients::Many(items.iter().map(scalar).collect()),
            other => Recipients::One(scalar(other)),
        };
        let subject = scalar(required(payload, "subject")?);
        let body = scalar(required(payload, "body")?);

        let body_type = match payload.get("body_type") {
            Some(Value::String(kind)) if !kind.is_empty() => kind.clone(),
            _ => default_body_type(),
        };

        Ok(Self {
            to,
            subject,
            body,
            cc: list(payload.get("cc")),
            bcc: list(payload.get("bcc")),
            attachments: list(payload.get("attachments")),
            body_type,
        })
    }
}

fn required<'a>(payload: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value, EmailError> {
    match payload.get(field) {
        None | Some(Value::Null) => Err(EmailError::MissingField(field)),
        Some(value) => Ok(value),
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn list(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) if s.is_empty() => Vec::new(),
        Some(Value::Array(items)) => items.iter().map(scalar).collect(),
        Some(other) => vec![scalar(other)],
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("Missing required field in message: {0}")]
    MissingField(&'static str),

    #[error("Attachment not found: {0}")]
    AttachmentNotFound(String),

    #[error("Mail transport unavailable: {0}")]
    Unavailable(String),

    #[error("Mail transport rejected the message: {0}")]
    Rejected(String),

    #[error("Invalid mail transport configuration: {0}")]
    Configuration(String),
}

impl EmailError {
    /// Failures worth redelivering: the message itself is fine.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
