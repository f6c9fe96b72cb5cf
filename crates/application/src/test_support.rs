use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chatflow_core::{AppError, AppResult};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::Mutex;

use crate::coordination_ports::{
    AtomicBatch, AtomicBatchOutcome, BatchGuard, Clock, CommandReply, CoordinationStore,
    StoreCommand,
};

/// Store fake without expiry; ttls are recorded for assertions.
#[derive(Default)]
pub(crate) struct FakeCoordinationStore {
    state: Mutex<FakeState>,
    offline: AtomicBool,
    stalled_renewals: AtomicBool,
    refresh_calls: AtomicUsize,
}

#[derive(Default)]
struct FakeState {
    strings: HashMap<String, String>,
    lists: HashMap<String, Vec<String>>,
    sorted_sets: HashMap<String, HashMap<String, i64>>,
    ttls: HashMap<String, u32>,
}

impl FakeState {
    fn contains(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.lists.contains_key(key)
            || self.sorted_sets.contains_key(key)
    }

    fn delete(&mut self, key: &str) {
        self.strings.remove(key);
        self.lists.remove(key);
        self.sorted_sets.remove(key);
        self.ttls.remove(key);
    }

    fn apply(&mut self, command: &StoreCommand) -> CommandReply {
        match command {
            StoreCommand::ListAppend { key, value } => {
                self.lists.entry(key.clone()).or_default().push(value.clone());
            }
            StoreCommand::ListTrimToLastN { key, keep } => {
                if let Some(list) = self.lists.get_mut(key)
                    && list.len() > *keep
                {
                    let drop_count = list.len() - keep;
                    list.drain(..drop_count);
                }
            }
            StoreCommand::ListReadAll { key } => {
                return CommandReply::Values(self.lists.get(key).cloned().unwrap_or_default());
            }
            StoreCommand::ListDelete { key } => self.delete(key),
            StoreCommand::RefreshExpiry { key, ttl_seconds } => {
                if self.contains(key) {
                    self.ttls.insert(key.clone(), *ttl_seconds);
                }
            }
            StoreCommand::SortedSetUpsert { key, member, score } => {
                self.sorted_sets
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone(), *score);
            }
            StoreCommand::SortedSetInsertIfAbsent { key, member, score } => {
                self.sorted_sets
                    .entry(key.clone())
                    .or_default()
                    .entry(member.clone())
                    .or_insert(*score);
            }
            StoreCommand::SortedSetRemove { key, member } => {
                if let Some(set) = self.sorted_sets.get_mut(key) {
                    set.remove(member);
                    if set.is_empty() {
                        self.sorted_sets.remove(key);
                    }
                }
            }
            StoreCommand::SetWithExpiry {
                key,
                value,
                ttl_seconds,
            } => {
                self.strings.insert(key.clone(), value.clone());
                self.ttls.insert(key.clone(), *ttl_seconds);
            }
        }

        CommandReply::Done
    }
}

impl FakeCoordinationStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes `refresh_expiry_if_equals` never complete, like a hung connection.
    pub(crate) fn stall_renewals(&self) {
        self.stalled_renewals.store(true, Ordering::SeqCst);
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) async fn put_value(&self, key: &str, value: &str) {
        self.state
            .lock()
            .await
            .strings
            .insert(key.to_owned(), value.to_owned());
    }

    pub(crate) async fn value(&self, key: &str) -> Option<String> {
        self.state.lock().await.strings.get(key).cloned()
    }

    pub(crate) async fn remove(&self, key: &str) {
        self.state.lock().await.delete(key);
    }

    pub(crate) async fn list(&self, key: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .lists
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) async fn push_raw(&self, key: &str, value: &str) {
        self.state
            .lock()
            .await
            .lists
            .entry(key.to_owned())
            .or_default()
            .push(value.to_owned());
    }

    pub(crate) async fn ttl(&self, key: &str) -> Option<u32> {
        self.state.lock().await.ttls.get(key).copied()
    }

    pub(crate) async fn score(&self, set_key: &str, member: &str) -> Option<i64> {
        self.state
            .lock()
            .await
            .sorted_sets
            .get(set_key)
            .and_then(|set| set.get(member))
            .copied()
    }

    fn ensure_online(&self) -> AppResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable("fake store is offline".to_owned()));
        }

        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for FakeCoordinationStore {
    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u32,
    ) -> AppResult<bool> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        if state.contains(key) {
            return Ok(false);
        }

        state.strings.insert(key.to_owned(), value.to_owned());
        state.ttls.insert(key.to_owned(), ttl_seconds);
        Ok(true)
    }

    async fn get_value(&self, key: &str) -> AppResult<Option<String>> {
        self.ensure_online()?;
        Ok(self.state.lock().await.strings.get(key).cloned())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> AppResult<bool> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        if state.strings.get(key).map(String::as_str) != Some(expected) {
            return Ok(false);
        }

        state.delete(key);
        Ok(true)
    }

    async fn refresh_expiry(&self, key: &str, ttl_seconds: u32) -> AppResult<bool> {
        self.ensure_online()?;
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if !state.contains(key) {
            return Ok(false);
        }

        state.ttls.insert(key.to_owned(), ttl_seconds);
        Ok(true)
    }

    async fn refresh_expiry_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl_seconds: u32,
    ) -> AppResult<bool> {
        self.ensure_online()?;
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.stalled_renewals.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock().await;
        if state.strings.get(key).map(String::as_str) != Some(expected) {
            return Ok(false);
        }

        state.ttls.insert(key.to_owned(), ttl_seconds);
        Ok(true)
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        self.ensure_online()?;
        Ok(self.state.lock().await.contains(key))
    }

    async fn sorted_set_range_by_score_at_most(
        &self,
        set_key: &str,
        max_score: i64,
    ) -> AppResult<Vec<String>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        let mut members: Vec<(i64, String)> = state
            .sorted_sets
            .get(set_key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| **score <= max_score)
                    .map(|(member, score)| (*score, member.clone()))
                    .collect()
            })
            .unwrap_or_default();
        members.sort();

        Ok(members.into_iter().map(|(_, member)| member).collect())
    }

    async fn sorted_set_score(&self, set_key: &str, member: &str) -> AppResult<Option<i64>> {
        self.ensure_online()?;
        Ok(self.score(set_key, member).await)
    }

    async fn sorted_set_remove(&self, set_key: &str, member: &str) -> AppResult<bool> {
        self.ensure_online()?;
        let present = self.score(set_key, member).await.is_some();
        self.state.lock().await.apply(&StoreCommand::SortedSetRemove {
            key: set_key.to_owned(),
            member: member.to_owned(),
        });
        Ok(present)
    }

    async fn list_read_all(&self, list_key: &str) -> AppResult<Vec<String>> {
        self.ensure_online()?;
        Ok(self.list(list_key).await)
    }

    async fn scan_keys(&self, prefix: &str) -> AppResult<Vec<String>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        let mut keys: Vec<String> = state
            .strings
            .keys()
            .chain(state.lists.keys())
            .chain(state.sorted_sets.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn execute_atomic(&self, batch: AtomicBatch) -> AppResult<AtomicBatchOutcome> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        if let Some(BatchGuard::KeyAbsent(guard_key)) = batch.guard()
            && state.contains(guard_key)
        {
            return Ok(AtomicBatchOutcome::Skipped);
        }

        let replies = batch
            .commands()
            .iter()
            .map(|command| state.apply(command))
            .collect();
        Ok(AtomicBatchOutcome::Applied(replies))
    }
}

/// Clock whose time only moves when a test says so.
pub(crate) struct ManualClock {
    now: StdMutex<DateTime<Utc>>,
}

impl ManualClock {
    pub(crate) fn at_epoch_seconds(seconds: i64) -> Self {
        let now = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .unwrap_or_else(|| unreachable!());
        Self {
            now: StdMutex::new(now),
        }
    }

    pub(crate) fn set_epoch_seconds(&self, seconds: i64) {
        if let Ok(mut now) = self.now.lock() {
            *now = Utc
                .timestamp_opt(seconds, 0)
                .single()
                .unwrap_or_else(|| unreachable!());
        }
    }

    pub(crate) fn set_epoch_millis(&self, millis: i64) {
        if let Ok(mut now) = self.now.lock() {
            *now = Utc
                .timestamp_millis_opt(millis)
                .single()
                .unwrap_or_else(|| unreachable!());
        }
    }

    pub(crate) fn advance_seconds(&self, seconds: i64) {
        if let Ok(mut now) = self.now.lock() {
            *now += Duration::seconds(seconds);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .lock()
            .map(|now| *now)
            .unwrap_or_else(|_| unreachable!())
    }
}

pub(crate) fn epoch_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(|| unreachable!())
}

pub(crate) fn epoch(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .unwrap_or_else(|| unreachable!())
}
