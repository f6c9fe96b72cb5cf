use std::time::Duration;

use chatflow_core::{AppError, AppResult};

/// Timing and sizing knobs shared by the coordination components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationConfig {
    /// Single-instance key ttl.
    pub leader_ttl_seconds: u32,
    /// Leader heartbeat period, strictly below the ttl.
    pub heartbeat_interval_seconds: u32,
    /// Per-conversation flush lock ttl.
    pub lock_ttl_seconds: u32,
    /// Inactivity window before a buffered conversation is due.
    pub debounce_window_seconds: u32,
    /// Optional cap on buffered entries per conversation (newest kept).
    pub max_batch_size: Option<usize>,
    /// Default pause marker ttl.
    pub pause_ttl_seconds: u32,
    /// Poller tick period.
    pub poll_interval_ms: u64,
    /// Safety-net ttl for entry lists.
    pub entry_list_ttl_seconds: u32,
    /// Run the orphan reconciliation sweep every N poller ticks, zero disables it.
    pub reconcile_every_ticks: u32,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            leader_ttl_seconds: 60,
            heartbeat_interval_seconds: 15,
            lock_ttl_seconds: 15,
            debounce_window_seconds: 5,
            max_batch_size: None,
            pause_ttl_seconds: 3600,
            poll_interval_ms: 1000,
            entry_list_ttl_seconds: 24 * 60 * 60,
            reconcile_every_ticks: 60,
        }
    }
}

impl CoordinationConfig {
    /// Checks cross-field invariants.
    pub fn validate(&self) -> AppResult<()> {
        for (name, value) in [
            ("leader_ttl_seconds", self.leader_ttl_seconds),
            ("heartbeat_interval_seconds", self.heartbeat_interval_seconds),
            ("lock_ttl_seconds", self.lock_ttl_seconds),
            ("debounce_window_seconds", self.debounce_window_seconds),
            ("pause_ttl_seconds", self.pause_ttl_seconds),
            ("entry_list_ttl_seconds", self.entry_list_ttl_seconds),
        ] {
            if value == 0 {
                return Err(AppError::Validation(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.heartbeat_interval_seconds >= self.leader_ttl_seconds {
            return Err(AppError::Validation(format!(
                "heartbeat_interval_seconds ({}) must be less than leader_ttl_seconds ({})",
                self.heartbeat_interval_seconds, self.leader_ttl_seconds
            )));
        }

        if self.poll_interval_ms == 0 {
            return Err(AppError::Validation(
                "poll_interval_ms must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }

    /// Returns the heartbeat period.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.heartbeat_interval_seconds))
    }

    /// Returns the poller tick period.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the batch cap, treating zero as no cap.
    #[must_use]
    pub fn effective_max_batch_size(&self) -> Option<usize> {
        self.max_batch_size.filter(|size| *size > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::CoordinationConfig;

    #[test]
    fn defaults_are_valid() {
        assert!(CoordinationConfig::default().validate().is_ok());
    }

    #[test]
    fn heartbeat_must_be_shorter_than_ttl() {
        let config = CoordinationConfig {
            leader_ttl_seconds: 15,
            heartbeat_interval_seconds: 15,
            ..CoordinationConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_lock_ttl_is_rejected() {
        let config = CoordinationConfig {
            lock_ttl_seconds: 0,
            ..CoordinationConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_batch_cap_means_uncapped() {
        let config = CoordinationConfig {
            max_batch_size: Some(0),
            ..CoordinationConfig::default()
        };

        assert_eq!(config.effective_max_batch_size(), None);
    }
}
