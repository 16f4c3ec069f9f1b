use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::types::FieldTable;
use serde_json::{Map, Value};

/// Name of the body field that selects a handler.
pub const ACTION_FIELD: &str = "action";

const BODY_PREVIEW_CHARS: usize = 256;

/// Raw delivery as received from the broker, before parsing.
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    pub body: Vec<u8>,
    pub headers: FieldTable,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub timestamp: Option<u64>,
}

impl IncomingMessage {
    /// Splits a lapin delivery into its data and the handle used to settle it.
    pub fn from_delivery(delivery: Delivery) -> (Self, Acker) {
        let message = Self {
            headers: delivery.properties.headers().clone().unwrap_or_default(),
            timestamp: *delivery.properties.timestamp(),
            routing_key: delivery.routing_key.to_string(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            body: delivery.data,
        };
        (message, delivery.acker)
    }

    pub fn body_preview(&self) -> String {
        String::from_utf8_lossy(&self.body)
            .chars()
            .take(BODY_PREVIEW_CHARS)
            .collect()
    }
}

/// A parsed task message.
///
/// The delivery handle stays with the consumer; handlers only ever see the
/// envelope, so they cannot settle the delivery themselves.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub action: String,
    /// Body fields other than `action`.
    pub payload: Map<String, Value>,
    pub headers: FieldTable,
    pub routing_key: String,
    pub queue_name: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub timestamp: Option<u64>,
}

impl Envelope {
    pub fn parse(message: &IncomingMessage, queue_name: &str) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(&message.body).map_err(ParseError::InvalidUtf8)?;
        let mut payload = match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => map,
            _ => return Err(ParseError::NotAnObject),
        };

        let action = match payload.remove(ACTION_FIELD) {
            Some(Value::String(action)) if !action.is_empty() => action,
            _ => return Err(ParseError::MissingAction),
        };

        Ok(Self {
            action,
            payload,
            headers: message.headers.clone(),
            routing_key: message.routing_key.clone(),
            queue_name: queue_name.to_string(),
            delivery_tag: message.delivery_tag,
            redelivered: message.redelivered,
            timestamp: message.timestamp,
        })
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Message body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Message body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Message body is not a JSON object")]
    NotAnObject,

    #[error("Action not found in message")]
    MissingAction,
}
