//! Well-known header names.
//!
//! Headers are plain string pairs so every transport can carry them unchanged.

use std::collections::HashMap;

/// Header map carried by every message.
pub type Headers = HashMap<String, String>;

/// Unique id of a logical delivery chain. Required on every incoming message.
pub const MESSAGE_ID: &str = "courier-msg-id";

/// Logical message type used to route to handlers.
pub const MESSAGE_TYPE: &str = "courier-msg-type";

/// Encoding of the body (e.g. `application/json;charset=utf-8`).
pub const CONTENT_TYPE: &str = "courier-content-type";

/// Queue that replies should be sent to.
pub const RETURN_ADDRESS: &str = "courier-return-address";

/// Input queue of the sending endpoint.
pub const SENDER_ADDRESS: &str = "courier-sender-address";

/// RFC 3339 timestamp of when the message was sent.
pub const SENT_TIME: &str = "courier-senttime";

/// `p2p` for sends and replies, `pub` for published events.
pub const INTENT: &str = "courier-intent";

/// Correlation id flowed from the first message of a conversation.
pub const CORRELATION_ID: &str = "courier-correlation-id";

/// Message id of the message being replied to.
pub const IN_REPLY_TO: &str = "courier-in-reply-to";

/// Accumulated error description attached when a message is moved to the error queue.
pub const ERROR_DETAILS: &str = "courier-error-details";

/// Queue the message was received from before being moved to the error queue.
pub const SOURCE_QUEUE: &str = "courier-source-queue";

/// Values of the [`INTENT`] header.
pub mod intent {
    pub const POINT_TO_POINT: &str = "p2p";
    pub const PUBLISH_SUBSCRIBE: &str = "pub";
}
