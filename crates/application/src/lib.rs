//! Application services and ports for worker coordination and message batching.

#![forbid(unsafe_code)]

mod coordination_config;
mod coordination_ports;
mod debounce_buffer_service;
mod debounce_poller_service;
mod leader_lock_service;
mod resource_mutex_service;

#[cfg(test)]
mod test_support;

pub use coordination_config::CoordinationConfig;
pub use coordination_ports::{
    AtomicBatch, AtomicBatchOutcome, BatchGuard, BatchHandler, Clock, CommandReply,
    CoordinationStore, StoreCommand, SystemClock,
};
pub use debounce_buffer_service::{DebounceBuffer, EnqueueOutcome};
pub use debounce_poller_service::{DebouncePoller, PollTickReport};
pub use leader_lock_service::{LeaderAcquisition, LeaderGuard, LeaderLock, LeaderLoss};
pub use resource_mutex_service::{LockAttempt, LockOutcome, ResourceLock, ResourceMutex};
