//! Poll loop draining due conversations under a per-conversation lock.

use std::sync::Arc;
use std::time::Duration;

use chatflow_core::AppResult;
use chatflow_domain::ConversationKey;
use serde::de::DeserializeOwned;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordination_config::CoordinationConfig;
use crate::coordination_ports::BatchHandler;
use crate::debounce_buffer_service::DebounceBuffer;
use crate::resource_mutex_service::{LockOutcome, ResourceMutex};

/// Counters for one poller tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollTickReport {
    /// Conversations reported due.
    pub due: usize,
    /// Batches handed to the handler successfully.
    pub flushed: usize,
    /// Due conversations that held no entries.
    pub empty: usize,
    /// Conversations skipped because another poller held the lock.
    pub busy: usize,
    /// Conversations whose drain or flush failed.
    pub failed: usize,
    /// Due conversations left for a later tick because the poller was stopping.
    pub deferred: usize,
}

enum FlushResult {
    Flushed(usize),
    Empty,
}

/// Drives the debounce buffer: finds due conversations and flushes each one once.
#[derive(Clone)]
pub struct DebouncePoller {
    buffer: DebounceBuffer,
    mutex: ResourceMutex,
    lock_ttl_seconds: u32,
    poll_interval: Duration,
    reconcile_every_ticks: u32,
}

impl DebouncePoller {
    /// Creates a poller using lock ttl, tick period and sweep cadence from `config`.
    #[must_use]
    pub fn new(buffer: DebounceBuffer, mutex: ResourceMutex, config: &CoordinationConfig) -> Self {
        Self {
            buffer,
            mutex,
            lock_ttl_seconds: config.lock_ttl_seconds,
            poll_interval: config.poll_interval(),
            reconcile_every_ticks: config.reconcile_every_ticks,
        }
    }

    /// Runs one pass over every due conversation.
    ///
    /// Busy conversations keep their due marker and are retried next tick.
    /// Per-conversation failures are logged and counted, never propagated.
    pub async fn tick<T>(&self, handler: &dyn BatchHandler<T>) -> AppResult<PollTickReport>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.drain_due(handler, &CancellationToken::new()).await
    }

    /// Flushes due conversations one by one, stopping between conversations once
    /// `cancellation` fires. Unvisited conversations keep their due markers.
    async fn drain_due<T>(
        &self,
        handler: &dyn BatchHandler<T>,
        cancellation: &CancellationToken,
    ) -> AppResult<PollTickReport>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let due = self.buffer.get_due(self.buffer.now()).await?;
        let mut report = PollTickReport {
            due: due.len(),
            ..PollTickReport::default()
        };

        for (position, conversation) in due.iter().enumerate() {
            if cancellation.is_cancelled() {
                report.deferred = report.due - position;
                debug!(
                    deferred = report.deferred,
                    "poller stopping; leaving remaining conversations due"
                );
                break;
            }

            match self.flush_conversation(conversation, handler).await {
                Ok(LockOutcome::Completed(FlushResult::Flushed(entries))) => {
                    report.flushed += 1;
                    debug!(
                        conversation = %conversation,
                        entries,
                        "flushed buffered conversation"
                    );
                }
                Ok(LockOutcome::Completed(FlushResult::Empty)) => report.empty += 1,
                Ok(LockOutcome::Busy) => {
                    report.busy += 1;
                    debug!(conversation = %conversation, "conversation flush already in progress");
                }
                Err(error) => {
                    report.failed += 1;
                    warn!(
                        conversation = %conversation,
                        error = %error,
                        "failed to flush buffered conversation"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Ticks until `cancellation` fires.
    ///
    /// A batch already handed to the handler is finished; conversations not yet
    /// visited in the current tick are left for the next leader.
    pub async fn run<T>(&self, cancellation: CancellationToken, handler: Arc<dyn BatchHandler<T>>)
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        info!(
            poll_interval_ms = self.poll_interval.as_millis(),
            lock_ttl_seconds = self.lock_ttl_seconds,
            "debounce poller started"
        );

        loop {
            tokio::select! {
                () = cancellation.cancelled() => break,
                _ = ticker.tick() => {}
            }

            ticks = ticks.wrapping_add(1);
            if self.reconcile_every_ticks > 0
                && ticks.is_multiple_of(u64::from(self.reconcile_every_ticks))
            {
                self.reconcile().await;
            }

            match self.drain_due(handler.as_ref(), &cancellation).await {
                Ok(report) if report.due > 0 => {
                    info!(
                        due = report.due,
                        flushed = report.flushed,
                        empty = report.empty,
                        busy = report.busy,
                        failed = report.failed,
                        deferred = report.deferred,
                        "debounce poller tick"
                    );
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(error = %error, "debounce poller tick skipped");
                }
            }
        }

        info!("debounce poller stopped");
    }

    async fn reconcile(&self) {
        match self.buffer.reconcile_orphans(self.buffer.now()).await {
            Ok(0) => {}
            Ok(rearmed) => info!(rearmed, "re-armed stranded conversation buffers"),
            Err(error) => warn!(error = %error, "buffer reconciliation sweep failed"),
        }
    }

    async fn flush_conversation<T>(
        &self,
        conversation: &ConversationKey,
        handler: &dyn BatchHandler<T>,
    ) -> AppResult<LockOutcome<FlushResult>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let lock_id = conversation.lock_id();
        self.mutex
            .with_lock(
                self.buffer.keys().prefix(),
                lock_id.as_str(),
                self.lock_ttl_seconds,
                || async {
                    let batch = self.buffer.pop_batch_and_clear_due::<T>(conversation).await?;
                    if batch.is_empty() {
                        return Ok(FlushResult::Empty);
                    }

                    let entries = batch.len();
                    handler.handle_batch(conversation, batch).await?;
                    Ok(FlushResult::Flushed(entries))
                },
            )
            .await
    }
}
