//! TTL-bounded, token-verified mutual exclusion scoped to one named resource.

use std::future::Future;
use std::sync::Arc;

use chatflow_core::{AppError, AppResult};
use chatflow_domain::resource_lock_key;
use tracing::{debug, warn};

use crate::coordination_ports::CoordinationStore;

/// One held resource lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLock {
    /// Lock namespace.
    pub namespace: String,
    /// Locked resource id.
    pub resource_id: String,
    /// Store key backing the lock.
    pub key: String,
    /// Ownership token unique to the acquiring call.
    pub token: String,
}

/// Result of a non-blocking lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// The caller now holds the lock.
    Acquired(ResourceLock),
    /// Someone else holds the lock.
    Busy,
}

/// Result of running work under a resource lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// Work ran while the lock was held.
    Completed(T),
    /// The lock was held elsewhere and the work did not run.
    Busy,
}

/// Resource mutex backed by the coordination store.
#[derive(Clone)]
pub struct ResourceMutex {
    store: Arc<dyn CoordinationStore>,
    holder_id: String,
}

impl ResourceMutex {
    /// Creates a mutex whose tokens are prefixed with `holder_id`.
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, holder_id: impl Into<String>) -> Self {
        Self {
            store,
            holder_id: holder_id.into(),
        }
    }

    /// Attempts to take the lock once, never waiting.
    pub async fn try_lock(
        &self,
        namespace: &str,
        resource_id: &str,
        ttl_seconds: u32,
    ) -> AppResult<LockAttempt> {
        if namespace.trim().is_empty() {
            return Err(AppError::Validation(
                "resource lock namespace must not be empty".to_owned(),
            ));
        }

        if resource_id.trim().is_empty() {
            return Err(AppError::Validation(
                "resource lock id must not be empty".to_owned(),
            ));
        }

        if ttl_seconds == 0 {
            return Err(AppError::Validation(
                "resource lock ttl_seconds must be greater than zero".to_owned(),
            ));
        }

        let key = resource_lock_key(namespace, resource_id);
        let token = format!("{}:{}", self.holder_id, uuid::Uuid::new_v4());

        let acquired = self
            .store
            .set_if_absent_with_expiry(key.as_str(), token.as_str(), ttl_seconds)
            .await?;

        if !acquired {
            return Ok(LockAttempt::Busy);
        }

        Ok(LockAttempt::Acquired(ResourceLock {
            namespace: namespace.to_owned(),
            resource_id: resource_id.to_owned(),
            key,
            token,
        }))
    }

    /// Releases the lock when the stored token still matches.
    ///
    /// Returns false when the lock already expired or changed hands.
    pub async fn release(&self, lock: &ResourceLock) -> AppResult<bool> {
        let released = self
            .store
            .delete_if_equals(lock.key.as_str(), lock.token.as_str())
            .await?;

        if !released {
            debug!(
                key = %lock.key,
                token = %lock.token,
                "resource lock was no longer owned at release"
            );
        }

        Ok(released)
    }

    /// Runs `work` only when the lock is acquired, releasing it on every exit path.
    ///
    /// A panic or cancellation inside `work` still releases the lock through a
    /// background task.
    pub async fn with_lock<T, F, Fut>(
        &self,
        namespace: &str,
        resource_id: &str,
        ttl_seconds: u32,
        work: F,
    ) -> AppResult<LockOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let lock = match self.try_lock(namespace, resource_id, ttl_seconds).await? {
            LockAttempt::Acquired(lock) => lock,
            LockAttempt::Busy => return Ok(LockOutcome::Busy),
        };

        let mut release_guard = ReleaseOnDrop {
            store: self.store.clone(),
            lock: Some(lock.clone()),
        };

        let result = work().await;
        release_guard.disarm();

        if let Err(release_error) = self.release(&lock).await {
            warn!(
                key = %lock.key,
                error = %release_error,
                "failed to release resource lock; it will expire by ttl"
            );
        }

        result.map(LockOutcome::Completed)
    }
}

struct ReleaseOnDrop {
    store: Arc<dyn CoordinationStore>,
    lock: Option<ResourceLock>,
}

impl ReleaseOnDrop {
    fn disarm(&mut self) {
        self.lock = None;
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %lock.key, "no runtime to release abandoned resource lock");
            return;
        };

        let store = self.store.clone();
        runtime.spawn(async move {
            if let Err(error) = store
                .delete_if_equals(lock.key.as_str(), lock.token.as_str())
                .await
            {
                warn!(
                    key = %lock.key,
                    error = %error,
                    "failed to release abandoned resource lock"
                );
            }
        });
    }
}
