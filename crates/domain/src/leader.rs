use std::fmt::{Display, Formatter};

use chatflow_core::{AppError, AppResult};
use chrono::Utc;

/// Ownership token written to the single-instance key by the leading process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderToken {
    process_id: u32,
    started_at_ms: i64,
}

impl LeaderToken {
    /// Creates a token from explicit parts.
    #[must_use]
    pub fn new(process_id: u32, started_at_ms: i64) -> Self {
        Self {
            process_id,
            started_at_ms,
        }
    }

    /// Creates the token for the running process.
    #[must_use]
    pub fn for_current_process() -> Self {
        Self::new(std::process::id(), Utc::now().timestamp_millis())
    }

    /// Returns the operating system process id.
    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Returns the process start time in epoch milliseconds.
    #[must_use]
    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    /// Parses the `<pid>-<started_at_ms>` encoding.
    pub fn parse(value: &str) -> AppResult<Self> {
        let (process_id, started_at_ms) = value.split_once('-').ok_or_else(|| {
            AppError::Validation(format!("invalid leader token '{value}'"))
        })?;

        let process_id = process_id.parse::<u32>().map_err(|error| {
            AppError::Validation(format!("invalid leader token process id '{value}': {error}"))
        })?;
        let started_at_ms = started_at_ms.parse::<i64>().map_err(|error| {
            AppError::Validation(format!("invalid leader token start time '{value}': {error}"))
        })?;

        Ok(Self::new(process_id, started_at_ms))
    }
}

impl Display for LeaderToken {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}-{}", self.process_id, self.started_at_ms)
    }
}
