//! Per-conversation inactivity-window batching.
//!
//! Every conversation moves through `EMPTY -> BUFFERING -> DUE -> DRAINING -> EMPTY`.
//! Each enqueue appends to the conversation's entry list and overwrites its due
//! marker with `now + window`, so the batch fires only after the conversation has
//! been quiet for a whole window.

use std::sync::Arc;

use chatflow_core::{AppError, AppResult};
use chatflow_domain::{BufferEntry, ConversationKey, CoordinationKeys};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::coordination_config::CoordinationConfig;
use crate::coordination_ports::{
    AtomicBatch, AtomicBatchOutcome, Clock, CoordinationStore, StoreCommand,
};

/// Result of buffering one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Payload stored; the conversation fires at `due_at` unless re-armed.
    Buffered {
        /// New fire time for the conversation.
        due_at: DateTime<Utc>,
    },
    /// Conversation is paused and the payload was dropped.
    Paused,
}

/// Debounce buffer over the coordination store.
#[derive(Clone)]
pub struct DebounceBuffer {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    keys: CoordinationKeys,
    entry_list_ttl_seconds: u32,
    window_seconds: u32,
    max_batch_size: Option<usize>,
    pause_ttl_seconds: u32,
}

impl DebounceBuffer {
    /// Creates a buffer whose defaults come from `config`.
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        keys: CoordinationKeys,
        config: &CoordinationConfig,
    ) -> Self {
        Self {
            store,
            clock,
            keys,
            entry_list_ttl_seconds: config.entry_list_ttl_seconds.max(1),
            window_seconds: config.debounce_window_seconds,
            max_batch_size: config.effective_max_batch_size(),
            pause_ttl_seconds: config.pause_ttl_seconds,
        }
    }

    /// Returns the key layout.
    #[must_use]
    pub fn keys(&self) -> &CoordinationKeys {
        &self.keys
    }

    /// Returns the current time from the configured clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Buffers a payload with the configured window and batch cap.
    pub async fn enqueue_with_defaults<T>(
        &self,
        conversation: &ConversationKey,
        payload: &T,
    ) -> AppResult<EnqueueOutcome>
    where
        T: Serialize + Sync,
    {
        self.enqueue(
            conversation,
            payload,
            self.window_seconds,
            self.max_batch_size,
        )
        .await
    }

    /// Appends a payload and pushes the conversation's fire time to `now + window`.
    ///
    /// The pause check, append, optional trim, list ttl and due marker update are
    /// one atomic store operation. With `max_batch_size` set, only the newest
    /// entries survive; older ones are dropped silently.
    pub async fn enqueue<T>(
        &self,
        conversation: &ConversationKey,
        payload: &T,
        window_seconds: u32,
        max_batch_size: Option<usize>,
    ) -> AppResult<EnqueueOutcome>
    where
        T: Serialize + Sync,
    {
        let now = self.clock.now();
        let due_at = now + Duration::seconds(i64::from(window_seconds.max(1)));
        let list_key = self.keys.list_key(conversation);

        let encoded = serde_json::to_string(&BufferEntry::new(payload, now)).map_err(|error| {
            AppError::Internal(format!(
                "failed to encode buffer entry for conversation '{conversation}': {error}"
            ))
        })?;

        let mut batch = AtomicBatch::unless_exists(self.keys.pause_key(conversation)).with(
            StoreCommand::ListAppend {
                key: list_key.clone(),
                value: encoded,
            },
        );
        if let Some(keep) = max_batch_size.filter(|size| *size > 0) {
            batch = batch.with(StoreCommand::ListTrimToLastN {
                key: list_key.clone(),
                keep,
            });
        }
        let batch = batch
            .with(StoreCommand::RefreshExpiry {
                key: list_key.clone(),
                ttl_seconds: self.entry_list_ttl_seconds,
            })
            .with(StoreCommand::SortedSetUpsert {
                key: self.keys.due_index_key(),
                member: list_key,
                score: due_score(due_at),
            });

        match self.store.execute_atomic(batch).await? {
            AtomicBatchOutcome::Skipped => {
                debug!(conversation = %conversation, "conversation paused; entry dropped");
                Ok(EnqueueOutcome::Paused)
            }
            AtomicBatchOutcome::Applied(_) => {
                debug!(
                    conversation = %conversation,
                    due_at = %due_at,
                    "buffered conversation entry"
                );
                Ok(EnqueueOutcome::Buffered { due_at })
            }
        }
    }

    /// Returns conversations whose fire time is at or before `now`, earliest first.
    pub async fn get_due(&self, now: DateTime<Utc>) -> AppResult<Vec<ConversationKey>> {
        let members = self
            .store
            .sorted_set_range_by_score_at_most(self.keys.due_index_key().as_str(), now.timestamp())
            .await?;

        Ok(members
            .into_iter()
            .filter_map(|member| {
                let parsed = self.keys.parse_list_key(member.as_str());
                if parsed.is_none() {
                    warn!(member = %member, "skipping malformed due marker");
                }
                parsed
            })
            .collect())
    }

    /// Atomically reads and clears the conversation's entries in arrival order.
    ///
    /// Entries that fail to decode are logged and dropped.
    pub async fn pop_batch<T>(
        &self,
        conversation: &ConversationKey,
    ) -> AppResult<Vec<BufferEntry<T>>>
    where
        T: DeserializeOwned,
    {
        let list_key = self.keys.list_key(conversation);
        let batch = AtomicBatch::new()
            .with(StoreCommand::ListReadAll {
                key: list_key.clone(),
            })
            .with(StoreCommand::ListDelete { key: list_key });

        let outcome = self.store.execute_atomic(batch).await?;
        Ok(self.decode_entries(conversation, outcome.values_at(0).unwrap_or_default()))
    }

    /// Atomically drains the entries and removes the due marker together.
    pub async fn pop_batch_and_clear_due<T>(
        &self,
        conversation: &ConversationKey,
    ) -> AppResult<Vec<BufferEntry<T>>>
    where
        T: DeserializeOwned,
    {
        let list_key = self.keys.list_key(conversation);
        let batch = AtomicBatch::new()
            .with(StoreCommand::ListReadAll {
                key: list_key.clone(),
            })
            .with(StoreCommand::ListDelete {
                key: list_key.clone(),
            })
            .with(StoreCommand::SortedSetRemove {
                key: self.keys.due_index_key(),
                member: list_key,
            });

        let outcome = self.store.execute_atomic(batch).await?;
        Ok(self.decode_entries(conversation, outcome.values_at(0).unwrap_or_default()))
    }

    /// Removes the due marker only; the entry list is left untouched.
    pub async fn clear_due(&self, conversation: &ConversationKey) -> AppResult<()> {
        self.store
            .sorted_set_remove(
                self.keys.due_index_key().as_str(),
                self.keys.list_key(conversation).as_str(),
            )
            .await?;
        Ok(())
    }

    /// Pauses the conversation for the configured pause ttl.
    pub async fn pause_with_defaults(&self, conversation: &ConversationKey) -> AppResult<()> {
        self.pause(conversation, self.pause_ttl_seconds).await
    }

    /// Discards pending entries and suppresses buffering for `ttl_seconds`.
    pub async fn pause(&self, conversation: &ConversationKey, ttl_seconds: u32) -> AppResult<()> {
        if ttl_seconds == 0 {
            return Err(AppError::Validation(
                "pause ttl_seconds must be greater than zero".to_owned(),
            ));
        }

        let list_key = self.keys.list_key(conversation);
        let batch = AtomicBatch::new()
            .with(StoreCommand::SortedSetRemove {
                key: self.keys.due_index_key(),
                member: list_key.clone(),
            })
            .with(StoreCommand::ListDelete { key: list_key })
            .with(StoreCommand::SetWithExpiry {
                key: self.keys.pause_key(conversation),
                value: "1".to_owned(),
                ttl_seconds,
            });

        self.store.execute_atomic(batch).await?;
        info!(
            conversation = %conversation,
            ttl_seconds,
            "conversation buffer paused"
        );
        Ok(())
    }

    /// Returns whether a pause marker is active.
    pub async fn is_paused(&self, conversation: &ConversationKey) -> AppResult<bool> {
        self.store
            .exists(self.keys.pause_key(conversation).as_str())
            .await
    }

    /// Re-arms entry lists that have no due marker so they are not stranded.
    ///
    /// Existing markers are never moved. Returns the number of lists re-armed.
    pub async fn reconcile_orphans(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let due_index_key = self.keys.due_index_key();
        let list_keys = self
            .store
            .scan_keys(self.keys.list_key_prefix().as_str())
            .await?;

        let mut rearmed = 0;
        for list_key in list_keys {
            if self.keys.parse_list_key(list_key.as_str()).is_none() {
                continue;
            }

            if self
                .store
                .sorted_set_score(due_index_key.as_str(), list_key.as_str())
                .await?
                .is_some()
            {
                continue;
            }

            let batch = AtomicBatch::new().with(StoreCommand::SortedSetInsertIfAbsent {
                key: due_index_key.clone(),
                member: list_key.clone(),
                score: now.timestamp(),
            });
            self.store.execute_atomic(batch).await?;
            warn!(list_key = %list_key, "re-armed buffered conversation without due marker");
            rearmed += 1;
        }

        Ok(rearmed)
    }

    fn decode_entries<T>(
        &self,
        conversation: &ConversationKey,
        raw: &[String],
    ) -> Vec<BufferEntry<T>>
    where
        T: DeserializeOwned,
    {
        raw.iter()
            .filter_map(|value| match serde_json::from_str::<BufferEntry<T>>(value) {
                Ok(entry) => Some(entry),
                Err(error) => {
                    warn!(
                        conversation = %conversation,
                        error = %error,
                        "dropping undecodable buffer entry"
                    );
                    None
                }
            })
            .collect()
    }
}

/// Rounds a fire time up to whole seconds so `get_due` never fires early.
fn due_score(due_at: DateTime<Utc>) -> i64 {
    due_at.timestamp() + i64::from(due_at.timestamp_subsec_nanos() > 0)
}

#[cfg(test)]
mod tests;
