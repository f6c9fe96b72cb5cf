use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One captured unit of work waiting in a conversation buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferEntry<T> {
    /// Caller payload.
    pub payload: T,
    /// When the payload was appended.
    pub enqueued_at: DateTime<Utc>,
}

impl<T> BufferEntry<T> {
    /// Wraps a payload with its enqueue timestamp.
    #[must_use]
    pub fn new(payload: T, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            enqueued_at,
        }
    }
}
