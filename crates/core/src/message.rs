use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{BusError, BusResult};
use crate::headers::{self, Headers};
use crate::id::MessageId;

/// A message as the transport sees it: headers plus an opaque body.
///
/// This is the unit transports send and receive, and the unit the retry step
/// tracks. Treat it as an immutable value; `with_header` returns a modified copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    headers: Headers,
    body: Vec<u8>,
}

impl TransportMessage {
    pub fn new(headers: Headers, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The message id, or `None` when the header is missing or blank.
    pub fn message_id(&self) -> Option<MessageId> {
        self.header(headers::MESSAGE_ID)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(MessageId::from)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn into_parts(self) -> (Headers, Vec<u8>) {
        (self.headers, self.body)
    }
}

/// A deserialized message: headers, logical type and JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    headers: Headers,
    message_type: String,
    body: JsonValue,
}

impl Message {
    pub fn new(message_type: impl Into<String>, body: JsonValue) -> Self {
        Self {
            headers: Headers::new(),
            message_type: message_type.into(),
            body,
        }
    }

    /// Build a message from any serializable payload.
    pub fn json<T: Serialize>(message_type: impl Into<String>, payload: &T) -> BusResult<Self> {
        let body = serde_json::to_value(payload).map_err(|e| BusError::serialization(e.to_string()))?;
        Ok(Self::new(message_type, body))
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.header(headers::MESSAGE_ID).map(MessageId::from)
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn body(&self) -> &JsonValue {
        &self.body
    }

    /// Deserialize the body into a concrete payload type.
    pub fn body_as<T: DeserializeOwned>(&self) -> BusResult<T> {
        serde_json::from_value(self.body.clone()).map_err(|e| BusError::serialization(e.to_string()))
    }
}

/// Envelope handed to handlers on second-level delivery.
///
/// Carries the original message plus the description of what went wrong during the
/// first-level attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedMessage {
    message: Message,
    error_description: String,
}

impl FailedMessage {
    pub fn new(message: Message, error_description: impl Into<String>) -> Self {
        Self {
            message,
            error_description: error_description.into(),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn error_description(&self) -> &str {
        &self.error_description
    }
}

/// What the dispatch step hands to handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalMessage {
    Ordinary(Message),
    Failed(FailedMessage),
}

impl LogicalMessage {
    /// The underlying message, unwrapped from any failed-message envelope.
    pub fn message(&self) -> &Message {
        match self {
            LogicalMessage::Ordinary(m) => m,
            LogicalMessage::Failed(f) => f.message(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LogicalMessage::Failed(_))
    }

    pub fn as_failed(&self) -> Option<&FailedMessage> {
        match self {
            LogicalMessage::Failed(f) => Some(f),
            LogicalMessage::Ordinary(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_message_id_is_treated_as_missing() {
        let msg = TransportMessage::new(Headers::new(), vec![]).with_header(headers::MESSAGE_ID, "   ");
        assert!(msg.message_id().is_none());

        let msg = msg.with_header(headers::MESSAGE_ID, "m-1");
        assert_eq!(msg.message_id(), Some(MessageId::from("m-1")));
    }

    #[test]
    fn body_as_round_trips_payload() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct OrderPlaced {
            order_id: String,
        }

        let msg = Message::json("OrderPlaced", &OrderPlaced { order_id: "o-1".into() }).unwrap();
        let back: OrderPlaced = msg.body_as().unwrap();
        assert_eq!(back.order_id, "o-1");
    }

    #[test]
    fn failed_envelope_exposes_inner_message() {
        let inner = Message::new("OrderPlaced", serde_json::json!({}));
        let logical = LogicalMessage::Failed(FailedMessage::new(inner.clone(), "boom"));
        assert!(logical.is_failed());
        assert_eq!(logical.message(), &inner);
        assert_eq!(logical.as_failed().unwrap().error_description(), "boom");
    }
}
