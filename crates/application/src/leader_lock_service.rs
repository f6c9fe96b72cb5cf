//! Single-instance guard for worker processes.
//!
//! The leader key is written once with `SET NX` semantics and renewed by a
//! supervised heartbeat task. Any doubt about ownership (token changed, key
//! gone, store unreachable) ends leadership: the guard's cancellation token
//! fires and the owner is expected to shut down. Nothing here retries or fails
//! over; a supervisor restarting the process races for the key again.

use std::sync::Arc;
use std::time::Duration;

use chatflow_core::{AppError, AppResult};
use chatflow_domain::LeaderToken;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordination_config::CoordinationConfig;
use crate::coordination_ports::CoordinationStore;

/// Result of racing for the leader key.
#[derive(Debug)]
pub enum LeaderAcquisition {
    /// This process is the leader until the guard reports a loss.
    Acquired(LeaderGuard),
    /// Another process holds the key.
    Held {
        /// Token stored by the current holder, when still readable.
        current_holder: Option<String>,
    },
}

/// Why leadership ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderLoss {
    /// The key expired or now holds another token.
    Supplanted {
        /// Token found in the key after the failed renewal.
        current_holder: Option<String>,
    },
    /// The store failed during a heartbeat.
    StoreUnreachable(String),
    /// The guard was released or dropped by its owner.
    Released,
}

/// Leader lock bound to one well-known key.
#[derive(Clone)]
pub struct LeaderLock {
    store: Arc<dyn CoordinationStore>,
    key: String,
    ttl_seconds: u32,
    heartbeat_interval: Duration,
}

impl LeaderLock {
    /// Creates a leader lock for `key` using ttl and heartbeat from `config`.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        key: impl Into<String>,
        config: &CoordinationConfig,
    ) -> AppResult<Self> {
        config.validate()?;

        let key = key.into();
        if key.trim().is_empty() {
            return Err(AppError::Validation(
                "leader lock key must not be empty".to_owned(),
            ));
        }

        Ok(Self {
            store,
            key,
            ttl_seconds: config.leader_ttl_seconds,
            heartbeat_interval: config.heartbeat_interval(),
        })
    }

    /// Returns the leader key.
    #[must_use]
    pub fn key(&self) -> &str {
        self.key.as_str()
    }

    /// Races once for the leader key.
    pub async fn acquire(&self) -> AppResult<LeaderAcquisition> {
        let token = LeaderToken::for_current_process();
        let encoded = token.to_string();
        let attempted_at = Instant::now();

        let acquired = self
            .store
            .set_if_absent_with_expiry(self.key.as_str(), encoded.as_str(), self.ttl_seconds)
            .await?;

        if !acquired {
            let current_holder = self.store.get_value(self.key.as_str()).await?;
            warn!(
                key = %self.key,
                current_holder = current_holder.as_deref().unwrap_or("<expired>"),
                "leader lock already held by another instance"
            );
            return Ok(LeaderAcquisition::Held { current_holder });
        }

        info!(
            key = %self.key,
            token = %encoded,
            ttl_seconds = self.ttl_seconds,
            "leader lock acquired"
        );

        Ok(LeaderAcquisition::Acquired(
            self.start_heartbeat(token, attempted_at),
        ))
    }

    /// Polls for the leader key until acquired or `max_wait` elapses.
    pub async fn acquire_with_wait(
        &self,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> AppResult<LeaderAcquisition> {
        if poll_interval.is_zero() {
            return Err(AppError::Validation(
                "leader lock poll_interval must be greater than zero".to_owned(),
            ));
        }

        let deadline = Instant::now() + max_wait;
        loop {
            let held = match self.acquire().await? {
                LeaderAcquisition::Acquired(guard) => {
                    return Ok(LeaderAcquisition::Acquired(guard));
                }
                LeaderAcquisition::Held { current_holder } => current_holder,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(LeaderAcquisition::Held {
                    current_holder: held,
                });
            }

            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    fn start_heartbeat(&self, token: LeaderToken, acquired_at: Instant) -> LeaderGuard {
        let cancellation = CancellationToken::new();
        let (loss_sender, loss_receiver) = watch::channel(None);

        let heartbeat = Heartbeat {
            store: self.store.clone(),
            key: self.key.clone(),
            token: token.to_string(),
            ttl_seconds: self.ttl_seconds,
            interval: self.heartbeat_interval,
            last_renewed_at: acquired_at,
            cancellation: cancellation.clone(),
            loss_sender,
        };

        LeaderGuard {
            store: self.store.clone(),
            key: self.key.clone(),
            token,
            cancellation,
            loss_receiver,
            heartbeat: Some(tokio::spawn(heartbeat.run())),
        }
    }
}

struct Heartbeat {
    store: Arc<dyn CoordinationStore>,
    key: String,
    token: String,
    ttl_seconds: u32,
    interval: Duration,
    last_renewed_at: Instant,
    cancellation: CancellationToken,
    loss_sender: watch::Sender<Option<LeaderLoss>>,
}

impl Heartbeat {
    // Ownership is only provable until the ttl set by the last successful
    // renewal runs out; a renewal still pending at that point counts as loss.
    async fn run(mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancellation.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let attempted_at = Instant::now();
            let ownership_deadline =
                self.last_renewed_at + Duration::from_secs(u64::from(self.ttl_seconds));
            let renewal = tokio::time::timeout_at(
                ownership_deadline,
                self.store.refresh_expiry_if_equals(
                    self.key.as_str(),
                    self.token.as_str(),
                    self.ttl_seconds,
                ),
            );
            let renewed = tokio::select! {
                () = self.cancellation.cancelled() => return,
                renewed = renewal => renewed,
            };

            match renewed {
                Ok(Ok(true)) => {
                    self.last_renewed_at = attempted_at;
                    debug!(key = %self.key, token = %self.token, "leader heartbeat renewed");
                }
                Ok(Ok(false)) => {
                    let current_holder =
                        tokio::time::timeout(self.interval, self.store.get_value(self.key.as_str()))
                            .await
                            .ok()
                            .and_then(Result::ok)
                            .flatten();
                    error!(
                        key = %self.key,
                        token = %self.token,
                        current_holder = current_holder.as_deref().unwrap_or("<expired>"),
                        "leader lock lost"
                    );
                    self.fail(LeaderLoss::Supplanted { current_holder });
                    return;
                }
                Ok(Err(renew_error)) => {
                    error!(
                        key = %self.key,
                        token = %self.token,
                        error = %renew_error,
                        "leader heartbeat failed; assuming lock lost"
                    );
                    self.fail(LeaderLoss::StoreUnreachable(renew_error.to_string()));
                    return;
                }
                Err(_) => {
                    error!(
                        key = %self.key,
                        token = %self.token,
                        ttl_seconds = self.ttl_seconds,
                        "leader heartbeat did not complete before the lock ttl ran out"
                    );
                    self.fail(LeaderLoss::StoreUnreachable(
                        "leader heartbeat timed out".to_owned(),
                    ));
                    return;
                }
            }
        }
    }

    fn fail(&self, loss: LeaderLoss) {
        self.loss_sender.send_replace(Some(loss));
        self.cancellation.cancel();
    }
}

/// Proof of leadership owning the heartbeat task.
///
/// Dropping the guard stops the heartbeat without deleting the key; call
/// [`LeaderGuard::release`] on graceful shutdown.
pub struct LeaderGuard {
    store: Arc<dyn CoordinationStore>,
    key: String,
    token: LeaderToken,
    cancellation: CancellationToken,
    loss_receiver: watch::Receiver<Option<LeaderLoss>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl LeaderGuard {
    /// Returns this process's token.
    #[must_use]
    pub fn token(&self) -> LeaderToken {
        self.token
    }

    /// Returns a token cancelled as soon as leadership ends for any reason.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Waits until leadership ends and reports why.
    pub async fn lost(&self) -> LeaderLoss {
        // The heartbeat publishes the loss before cancelling.
        self.cancellation.cancelled().await;
        self.loss_receiver
            .borrow()
            .clone()
            .unwrap_or(LeaderLoss::Released)
    }

    /// Stops the heartbeat and deletes the key if this process still owns it.
    pub async fn release(mut self) -> AppResult<bool> {
        self.cancellation.cancel();
        if let Some(heartbeat) = self.heartbeat.take()
            && let Err(join_error) = heartbeat.await
        {
            warn!(key = %self.key, error = %join_error, "leader heartbeat task ended abnormally");
        }

        let released = self
            .store
            .delete_if_equals(self.key.as_str(), self.token.to_string().as_str())
            .await?;

        info!(
            key = %self.key,
            token = %self.token,
            released,
            "leader lock released"
        );

        Ok(released)
    }
}

impl std::fmt::Debug for LeaderGuard {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("LeaderGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}
