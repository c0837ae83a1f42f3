//! Final destination for messages that cannot be processed.

use async_trait::async_trait;

use courier_core::{BusResult, TransportMessage};

use crate::transaction::TransactionContext;

/// Moves a poison message out of the way (typically to an error queue).
///
/// Called by the retry step inside the receive transaction, so the move commits
/// together with the acknowledgement of the original delivery.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle_poison_message(
        &self,
        message: TransportMessage,
        transaction: &TransactionContext,
        error_description: &str,
    ) -> BusResult<()>;
}
