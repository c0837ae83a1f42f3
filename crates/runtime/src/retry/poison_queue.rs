//! Error handler that moves poison messages to the error queue.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use courier_core::{BusResult, TransportMessage, headers};
use courier_messaging::{ErrorHandler, TransactionContext, Transport};

/// Sends poison messages to a dedicated queue.
///
/// The original headers and body are kept untouched; `courier-error-details` and
/// `courier-source-queue` are added so an operator can see what happened and where to
/// send the message back once the cause is fixed.
pub struct PoisonQueueErrorHandler {
    transport: Arc<dyn Transport>,
    error_queue: String,
}

impl PoisonQueueErrorHandler {
    pub fn new(transport: Arc<dyn Transport>, error_queue: impl Into<String>) -> Self {
        Self {
            transport,
            error_queue: error_queue.into(),
        }
    }

    pub fn error_queue(&self) -> &str {
        &self.error_queue
    }
}

#[async_trait]
impl ErrorHandler for PoisonQueueErrorHandler {
    async fn handle_poison_message(
        &self,
        message: TransportMessage,
        transaction: &TransactionContext,
        error_description: &str,
    ) -> BusResult<()> {
        let source_queue = self.transport.address().unwrap_or_default().to_string();

        error!(
            message_id = ?message.message_id(),
            source_queue = %source_queue,
            error_queue = %self.error_queue,
            "moving poison message to error queue"
        );

        let message = message
            .with_header(headers::ERROR_DETAILS, error_description)
            .with_header(headers::SOURCE_QUEUE, source_queue);

        self.transport.send(&self.error_queue, message, transaction).await
    }
}
