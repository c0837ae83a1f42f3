//! Bus error model.

use thiserror::Error;

/// Result type used across the bus runtime.
pub type BusResult<T> = Result<T, BusError>;

/// Bus-level error.
///
/// Handler failures are carried as `anyhow::Error` so user code can return whatever
/// it likes; everything else is infrastructure that the runtime itself raises.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport failed to send, receive or create a queue.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message body could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An incoming transport message carried no type header.
    #[error("message has no '{0}' header")]
    MissingMessageType(&'static str),

    /// No handler was registered for the incoming message.
    #[error("no handlers found for message of type '{0}'")]
    NoHandlers(String),

    /// `send` was called for a type with no configured route.
    #[error("no destination route configured for message type '{0}'")]
    NoRoute(String),

    /// `reply` was called for a message without a return address.
    #[error("cannot reply: incoming message has no return address")]
    NoReturnAddress,

    /// A user handler returned an error.
    #[error(transparent)]
    Handler(#[from] anyhow::Error),

    /// A user handler panicked.
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    /// An exclusive-access lock could not be acquired or released.
    #[error("lock error: {0}")]
    Lock(String),

    /// The operation observed the shutdown signal.
    #[error("operation cancelled by bus shutdown")]
    Cancelled,

    /// The bus was configured with invalid values.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BusError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Renders the error together with its full `source()` chain on one line.
    ///
    /// This is what the error tracker stores and what ends up in the
    /// error-details header of a poison message.
    pub fn describe(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            let cause_text = cause.to_string();
            if !out.ends_with(&cause_text) {
                out.push_str(": ");
                out.push_str(&cause_text);
            }
            source = cause.source();
        }
        out
    }
}
