use async_trait::async_trait;
use chatflow_core::AppResult;
use chatflow_domain::{BufferEntry, ConversationKey};

/// Caller-supplied flush port invoked once a conversation batch is due.
#[async_trait]
pub trait BatchHandler<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Processes one drained batch, entries in arrival order.
    ///
    /// Errors are logged by the poller; the batch is not re-buffered.
    async fn handle_batch(
        &self,
        conversation: &ConversationKey,
        batch: Vec<BufferEntry<T>>,
    ) -> AppResult<()>;
}
