use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chatflow_application::{
    AtomicBatch, AtomicBatchOutcome, BatchGuard, CommandReply, CoordinationStore, StoreCommand,
};
use chatflow_core::{AppError, AppResult};
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    List(Vec<String>),
    SortedSet(HashMap<String, i64>),
}

impl StoredValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "string",
            Self::List(_) => "list",
            Self::SortedSet(_) => "sorted set",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

fn expiry_from(now: Instant, ttl_seconds: u32) -> Instant {
    now.checked_add(Duration::from_secs(u64::from(ttl_seconds)))
        .unwrap_or(now)
}

fn wrong_type(key: &str, found: &StoredValue, expected: &str) -> AppError {
    AppError::Internal(format!(
        "coordination key '{key}' holds a {} but a {expected} was expected",
        found.kind()
    ))
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<String, StoredEntry>,
}

impl StoreState {
    fn purge_expired(&mut self, key: &str, now: Instant) {
        if self
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_live(now))
        {
            self.entries.remove(key);
        }
    }

    // Keys nobody touches again would otherwise stay resident forever.
    fn purge_all_expired(&mut self, now: Instant) {
        self.entries.retain(|_, entry| entry.is_live(now));
    }

    fn live(&self, key: &str, now: Instant) -> Option<&StoredEntry> {
        self.entries.get(key).filter(|entry| entry.is_live(now))
    }

    fn text(&self, key: &str, now: Instant) -> AppResult<Option<&str>> {
        match self.live(key, now).map(|entry| &entry.value) {
            None => Ok(None),
            Some(StoredValue::Text(value)) => Ok(Some(value.as_str())),
            Some(other) => Err(wrong_type(key, other, "string")),
        }
    }

    fn list_mut(&mut self, key: &str, now: Instant) -> AppResult<&mut Vec<String>> {
        self.purge_expired(key, now);
        let entry = self.entries.entry(key.to_owned()).or_insert(StoredEntry {
            value: StoredValue::List(Vec::new()),
            expires_at: None,
        });

        match &mut entry.value {
            StoredValue::List(values) => Ok(values),
            other => Err(wrong_type(key, other, "list")),
        }
    }

    fn sorted_set_mut(&mut self, key: &str, now: Instant) -> AppResult<&mut HashMap<String, i64>> {
        self.purge_expired(key, now);
        let entry = self.entries.entry(key.to_owned()).or_insert(StoredEntry {
            value: StoredValue::SortedSet(HashMap::new()),
            expires_at: None,
        });

        match &mut entry.value {
            StoredValue::SortedSet(members) => Ok(members),
            other => Err(wrong_type(key, other, "sorted set")),
        }
    }

    // Lists and sorted sets disappear with their last element.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|entry| &entry.value) {
            Some(StoredValue::List(values)) => values.is_empty(),
            Some(StoredValue::SortedSet(members)) => members.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn check(&mut self, command: &StoreCommand, now: Instant) -> AppResult<()> {
        let key = command.key();
        self.purge_expired(key, now);
        let Some(entry) = self.entries.get(key) else {
            return Ok(());
        };

        let expected = match command {
            StoreCommand::ListAppend { .. }
            | StoreCommand::ListTrimToLastN { .. }
            | StoreCommand::ListReadAll { .. } => "list",
            StoreCommand::SortedSetUpsert { .. }
            | StoreCommand::SortedSetInsertIfAbsent { .. }
            | StoreCommand::SortedSetRemove { .. } => "sorted set",
            StoreCommand::ListDelete { .. }
            | StoreCommand::RefreshExpiry { .. }
            | StoreCommand::SetWithExpiry { .. } => return Ok(()),
        };

        match (&entry.value, expected) {
            (StoredValue::List(_), "list") | (StoredValue::SortedSet(_), "sorted set") => Ok(()),
            (other, _) => Err(wrong_type(key, other, expected)),
        }
    }

    fn apply(&mut self, command: &StoreCommand, now: Instant) -> AppResult<CommandReply> {
        match command {
            StoreCommand::ListAppend { key, value } => {
                self.list_mut(key, now)?.push(value.clone());
            }
            StoreCommand::ListTrimToLastN { key, keep } => {
                if self.live(key, now).is_some() {
                    let values = self.list_mut(key, now)?;
                    let keep = (*keep).max(1);
                    if values.len() > keep {
                        let drop_count = values.len() - keep;
                        values.drain(..drop_count);
                    }
                }
            }
            StoreCommand::ListReadAll { key } => {
                let values = match self.live(key, now).map(|entry| &entry.value) {
                    Some(StoredValue::List(values)) => values.clone(),
                    _ => Vec::new(),
                };
                return Ok(CommandReply::Values(values));
            }
            StoreCommand::ListDelete { key } => {
                self.entries.remove(key);
            }
            StoreCommand::RefreshExpiry { key, ttl_seconds } => {
                self.purge_expired(key, now);
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.expires_at = Some(expiry_from(now, *ttl_seconds));
                }
            }
            StoreCommand::SortedSetUpsert { key, member, score } => {
                self.sorted_set_mut(key, now)?
                    .insert(member.clone(), *score);
            }
            StoreCommand::SortedSetInsertIfAbsent { key, member, score } => {
                self.sorted_set_mut(key, now)?
                    .entry(member.clone())
                    .or_insert(*score);
            }
            StoreCommand::SortedSetRemove { key, member } => {
                if self.live(key, now).is_some() {
                    self.sorted_set_mut(key, now)?.remove(member);
                    self.drop_if_empty(key);
                }
            }
            StoreCommand::SetWithExpiry {
                key,
                value,
                ttl_seconds,
            } => {
                self.entries.insert(
                    key.clone(),
                    StoredEntry {
                        value: StoredValue::Text(value.clone()),
                        expires_at: Some(expiry_from(now, *ttl_seconds)),
                    },
                );
            }
        }

        Ok(CommandReply::Done)
    }
}

/// Process-local coordination store for single-instance deployments and tests.
///
/// Expiry follows the tokio clock, so paused-time tests can fast-forward ttls.
#[derive(Default)]
pub struct InMemoryCoordinationStore {
    state: RwLock<StoreState>,
}

impl InMemoryCoordinationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u32,
    ) -> AppResult<bool> {
        if ttl_seconds == 0 {
            return Err(AppError::Validation(
                "coordination key ttl_seconds must be greater than zero".to_owned(),
            ));
        }

        let now = Instant::now();
        let mut state = self.state.write().await;
        if state.live(key, now).is_some() {
            return Ok(false);
        }

        state.entries.insert(
            key.to_owned(),
            StoredEntry {
                value: StoredValue::Text(value.to_owned()),
                expires_at: Some(expiry_from(now, ttl_seconds)),
            },
        );
        Ok(true)
    }

    async fn get_value(&self, key: &str) -> AppResult<Option<String>> {
        let state = self.state.read().await;
        Ok(state.text(key, Instant::now())?.map(str::to_owned))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> AppResult<bool> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        if state.text(key, now)? != Some(expected) {
            return Ok(false);
        }

        state.entries.remove(key);
        Ok(true)
    }

    async fn refresh_expiry(&self, key: &str, ttl_seconds: u32) -> AppResult<bool> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        state.purge_expired(key, now);
        let Some(entry) = state.entries.get_mut(key) else {
            return Ok(false);
        };

        entry.expires_at = Some(expiry_from(now, ttl_seconds));
        Ok(true)
    }

    async fn refresh_expiry_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl_seconds: u32,
    ) -> AppResult<bool> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        if state.text(key, now)? != Some(expected) {
            return Ok(false);
        }

        if let Some(entry) = state.entries.get_mut(key) {
            entry.expires_at = Some(expiry_from(now, ttl_seconds));
        }
        Ok(true)
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        Ok(self.state.read().await.live(key, Instant::now()).is_some())
    }

    async fn sorted_set_range_by_score_at_most(
        &self,
        set_key: &str,
        max_score: i64,
    ) -> AppResult<Vec<String>> {
        let state = self.state.read().await;
        let mut members: Vec<(i64, &String)> =
            match state.live(set_key, Instant::now()).map(|entry| &entry.value) {
                None => Vec::new(),
                Some(StoredValue::SortedSet(members)) => members
                    .iter()
                    .filter(|(_, score)| **score <= max_score)
                    .map(|(member, score)| (*score, member))
                    .collect(),
                Some(other) => return Err(wrong_type(set_key, other, "sorted set")),
            };
        members.sort();

        Ok(members
            .into_iter()
            .map(|(_, member)| member.clone())
            .collect())
    }

    async fn sorted_set_score(&self, set_key: &str, member: &str) -> AppResult<Option<i64>> {
        let state = self.state.read().await;
        match state.live(set_key, Instant::now()).map(|entry| &entry.value) {
            None => Ok(None),
            Some(StoredValue::SortedSet(members)) => Ok(members.get(member).copied()),
            Some(other) => Err(wrong_type(set_key, other, "sorted set")),
        }
    }

    async fn sorted_set_remove(&self, set_key: &str, member: &str) -> AppResult<bool> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        if state.live(set_key, now).is_none() {
            return Ok(false);
        }

        let removed = state.sorted_set_mut(set_key, now)?.remove(member).is_some();
        state.drop_if_empty(set_key);
        Ok(removed)
    }

    async fn list_read_all(&self, list_key: &str) -> AppResult<Vec<String>> {
        let state = self.state.read().await;
        match state.live(list_key, Instant::now()).map(|entry| &entry.value) {
            None => Ok(Vec::new()),
            Some(StoredValue::List(values)) => Ok(values.clone()),
            Some(other) => Err(wrong_type(list_key, other, "list")),
        }
    }

    async fn scan_keys(&self, prefix: &str) -> AppResult<Vec<String>> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        state.purge_all_expired(now);
        let mut keys: Vec<String> = state
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();

        Ok(keys)
    }

    async fn execute_atomic(&self, batch: AtomicBatch) -> AppResult<AtomicBatchOutcome> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        if let Some(BatchGuard::KeyAbsent(guard_key)) = batch.guard()
            && state.live(guard_key, now).is_some()
        {
            return Ok(AtomicBatchOutcome::Skipped);
        }

        // Type errors abort the batch before anything is applied.
        for command in batch.commands() {
            state.check(command, now)?;
        }

        let mut replies = Vec::with_capacity(batch.commands().len());
        for command in batch.commands() {
            replies.push(state.apply(command, now)?);
        }

        Ok(AtomicBatchOutcome::Applied(replies))
    }
}
