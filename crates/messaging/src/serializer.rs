//! Conversion between logical messages and transport messages.

use courier_core::{BusError, BusResult, Message, TransportMessage, headers};

pub const JSON_CONTENT_TYPE: &str = "application/json;charset=utf-8";

/// Message codec.
pub trait Serializer: Send + Sync {
    fn serialize(&self, message: &Message) -> BusResult<TransportMessage>;

    fn deserialize(&self, message: &TransportMessage) -> BusResult<Message>;
}

/// JSON codec. The body is the message's JSON value; the type travels in a header.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, message: &Message) -> BusResult<TransportMessage> {
        let body = serde_json::to_vec(message.body()).map_err(|e| BusError::serialization(e.to_string()))?;

        let mut hdrs = message.headers().clone();
        hdrs.insert(headers::MESSAGE_TYPE.to_string(), message.message_type().to_string());
        hdrs.insert(headers::CONTENT_TYPE.to_string(), JSON_CONTENT_TYPE.to_string());

        Ok(TransportMessage::new(hdrs, body))
    }

    fn deserialize(&self, message: &TransportMessage) -> BusResult<Message> {
        let message_type = message
            .header(headers::MESSAGE_TYPE)
            .ok_or(BusError::MissingMessageType(headers::MESSAGE_TYPE))?;

        if let Some(content_type) = message.header(headers::CONTENT_TYPE) {
            if !content_type.starts_with("application/json") {
                return Err(BusError::serialization(format!(
                    "unsupported content type '{content_type}'"
                )));
            }
        }

        let body = serde_json::from_slice(message.body()).map_err(|e| BusError::serialization(e.to_string()))?;

        Ok(Message::new(message_type, body).with_headers(message.headers().clone()))
    }
}
