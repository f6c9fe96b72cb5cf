use async_trait::async_trait;
use chatflow_core::AppResult;

/// Shared key-value store that every coordination primitive is expressed through.
///
/// Implementations must make each method atomic on the store side. Expired
/// keys behave exactly like absent keys.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Writes `value` only when `key` is absent and attaches a ttl.
    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u32,
    ) -> AppResult<bool>;

    /// Reads one string value.
    async fn get_value(&self, key: &str) -> AppResult<Option<String>>;

    /// Deletes `key` only when it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> AppResult<bool>;

    /// Resets the ttl of an existing key.
    async fn refresh_expiry(&self, key: &str, ttl_seconds: u32) -> AppResult<bool>;

    /// Resets the ttl only when `key` still holds `expected`.
    async fn refresh_expiry_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl_seconds: u32,
    ) -> AppResult<bool>;

    /// Returns whether the key exists.
    async fn exists(&self, key: &str) -> AppResult<bool>;

    /// Returns members scored at or below `max_score`, lowest score first.
    async fn sorted_set_range_by_score_at_most(
        &self,
        set_key: &str,
        max_score: i64,
    ) -> AppResult<Vec<String>>;

    /// Returns the score of one member.
    async fn sorted_set_score(&self, set_key: &str, member: &str) -> AppResult<Option<i64>>;

    /// Removes one member and reports whether it was present.
    async fn sorted_set_remove(&self, set_key: &str, member: &str) -> AppResult<bool>;

    /// Reads a whole list without modifying it.
    async fn list_read_all(&self, list_key: &str) -> AppResult<Vec<String>>;

    /// Lists live keys starting with `prefix`.
    async fn scan_keys(&self, prefix: &str) -> AppResult<Vec<String>>;

    /// Applies a batch of commands as one atomic unit.
    async fn execute_atomic(&self, batch: AtomicBatch) -> AppResult<AtomicBatchOutcome>;
}

/// Precondition evaluated inside an atomic batch before any command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchGuard {
    /// Apply the batch only while this key is absent.
    KeyAbsent(String),
}

/// One write or read executed inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCommand {
    /// Appends a value to the tail of a list.
    ListAppend {
        /// List key.
        key: String,
        /// Appended value.
        value: String,
    },
    /// Keeps only the newest `keep` list values.
    ListTrimToLastN {
        /// List key.
        key: String,
        /// Number of values to keep, at least one.
        keep: usize,
    },
    /// Reads every list value in order.
    ListReadAll {
        /// List key.
        key: String,
    },
    /// Deletes a list.
    ListDelete {
        /// List key.
        key: String,
    },
    /// Resets the ttl of a key when present.
    RefreshExpiry {
        /// Target key.
        key: String,
        /// New ttl.
        ttl_seconds: u32,
    },
    /// Adds a member or overwrites its score.
    SortedSetUpsert {
        /// Sorted set key.
        key: String,
        /// Member value.
        member: String,
        /// Member score.
        score: i64,
    },
    /// Adds a member only when it has no score yet.
    SortedSetInsertIfAbsent {
        /// Sorted set key.
        key: String,
        /// Member value.
        member: String,
        /// Member score.
        score: i64,
    },
    /// Removes one member.
    SortedSetRemove {
        /// Sorted set key.
        key: String,
        /// Member value.
        member: String,
    },
    /// Writes a string value with a ttl, replacing any previous value.
    SetWithExpiry {
        /// Target key.
        key: String,
        /// Stored value.
        value: String,
        /// Value ttl.
        ttl_seconds: u32,
    },
}

impl StoreCommand {
    /// Returns the key touched by this command.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::ListAppend { key, .. }
            | Self::ListTrimToLastN { key, .. }
            | Self::ListReadAll { key }
            | Self::ListDelete { key }
            | Self::RefreshExpiry { key, .. }
            | Self::SortedSetUpsert { key, .. }
            | Self::SortedSetInsertIfAbsent { key, .. }
            | Self::SortedSetRemove { key, .. }
            | Self::SetWithExpiry { key, .. } => key.as_str(),
        }
    }
}

/// Ordered commands applied together, optionally behind a guard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicBatch {
    guard: Option<BatchGuard>,
    commands: Vec<StoreCommand>,
}

impl AtomicBatch {
    /// Creates an unguarded empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty batch that only applies while `key` is absent.
    #[must_use]
    pub fn unless_exists(key: impl Into<String>) -> Self {
        Self {
            guard: Some(BatchGuard::KeyAbsent(key.into())),
            commands: Vec::new(),
        }
    }

    /// Appends one command.
    #[must_use]
    pub fn with(mut self, command: StoreCommand) -> Self {
        self.commands.push(command);
        self
    }

    /// Returns the optional guard.
    #[must_use]
    pub fn guard(&self) -> Option<&BatchGuard> {
        self.guard.as_ref()
    }

    /// Returns commands in execution order.
    #[must_use]
    pub fn commands(&self) -> &[StoreCommand] {
        self.commands.as_slice()
    }
}

/// Reply for one command of an applied batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// Write command applied.
    Done,
    /// Values returned by a read command.
    Values(Vec<String>),
}

/// Result of executing an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicBatchOutcome {
    /// The guard key existed and nothing was applied.
    Skipped,
    /// Every command was applied; one reply per command.
    Applied(Vec<CommandReply>),
}

impl AtomicBatchOutcome {
    /// Returns the values of the reply at `index`, if that reply was a read.
    #[must_use]
    pub fn values_at(&self, index: usize) -> Option<&[String]> {
        match self {
            Self::Skipped => None,
            Self::Applied(replies) => match replies.get(index) {
                Some(CommandReply::Values(values)) => Some(values.as_slice()),
                _ => None,
            },
        }
    }
}
