//! Redis-backed coordination store.

use async_trait::async_trait;
use chatflow_application::{
    AtomicBatch, AtomicBatchOutcome, BatchGuard, CommandReply, CoordinationStore, StoreCommand,
};
use chatflow_core::{AppError, AppResult};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError, Script};

const DELETE_IF_EQUALS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

const REFRESH_IF_EQUALS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('EXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

// KEYS: optional guard key, then one key per command.
// ARGV[1]: '1' when KEYS[1] is a guard. Then per command: op name and its args.
const ATOMIC_BATCH_SCRIPT: &str = r#"
local key_index = 1
if ARGV[1] == '1' then
  if redis.call('EXISTS', KEYS[1]) == 1 then
    return {0, {}}
  end
  key_index = 2
end

local replies = {}
local arg_index = 2
while arg_index <= #ARGV do
  local op = ARGV[arg_index]
  local key = KEYS[key_index]
  key_index = key_index + 1
  arg_index = arg_index + 1
  local reply = {}

  if op == 'rpush' then
    redis.call('RPUSH', key, ARGV[arg_index])
    arg_index = arg_index + 1
  elseif op == 'ltrim_last' then
    redis.call('LTRIM', key, -tonumber(ARGV[arg_index]), -1)
    arg_index = arg_index + 1
  elseif op == 'lrange' then
    reply = redis.call('LRANGE', key, 0, -1)
  elseif op == 'del' then
    redis.call('DEL', key)
  elseif op == 'expire' then
    redis.call('EXPIRE', key, ARGV[arg_index])
    arg_index = arg_index + 1
  elseif op == 'zadd' then
    redis.call('ZADD', key, ARGV[arg_index], ARGV[arg_index + 1])
    arg_index = arg_index + 2
  elseif op == 'zadd_nx' then
    redis.call('ZADD', key, 'NX', ARGV[arg_index], ARGV[arg_index + 1])
    arg_index = arg_index + 2
  elseif op == 'zrem' then
    redis.call('ZREM', key, ARGV[arg_index])
    arg_index = arg_index + 1
  elseif op == 'set_ex' then
    redis.call('SET', key, ARGV[arg_index], 'EX', ARGV[arg_index + 1])
    arg_index = arg_index + 2
  else
    return redis.error_reply('unknown coordination op ' .. op)
  end

  table.insert(replies, reply)
end

return {1, replies}
"#;

const SCAN_BATCH_SIZE: usize = 200;

/// Redis implementation of the coordination store port.
#[derive(Clone)]
pub struct RedisCoordinationStore {
    client: redis::Client,
}

impl RedisCoordinationStore {
    /// Creates one store adapter.
    #[must_use]
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    /// Verifies the server answers before the worker starts relying on it.
    pub async fn ping(&self) -> AppResult<()> {
        let mut connection = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
            .map_err(|error| command_error("failed to ping redis", &error))?;

        Ok(())
    }

    async fn connection(&self) -> AppResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| AppError::Unavailable(format!("failed to connect to redis: {error}")))
    }
}

fn command_error(context: &str, error: &RedisError) -> AppError {
    if error.is_io_error() || error.is_connection_dropped() || error.is_timeout() {
        AppError::Unavailable(format!("{context}: {error}"))
    } else {
        AppError::Internal(format!("{context}: {error}"))
    }
}

fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for character in prefix.chars() {
        if matches!(character, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(character);
    }
    escaped.push('*');
    escaped
}

fn command_op(command: &StoreCommand) -> (&'static str, Vec<String>) {
    match command {
        StoreCommand::ListAppend { value, .. } => ("rpush", vec![value.clone()]),
        StoreCommand::ListTrimToLastN { keep, .. } => {
            ("ltrim_last", vec![(*keep).max(1).to_string()])
        }
        StoreCommand::ListReadAll { .. } => ("lrange", Vec::new()),
        StoreCommand::ListDelete { .. } => ("del", Vec::new()),
        StoreCommand::RefreshExpiry { ttl_seconds, .. } => {
            ("expire", vec![ttl_seconds.to_string()])
        }
        StoreCommand::SortedSetUpsert { member, score, .. } => {
            ("zadd", vec![score.to_string(), member.clone()])
        }
        StoreCommand::SortedSetInsertIfAbsent { member, score, .. } => {
            ("zadd_nx", vec![score.to_string(), member.clone()])
        }
        StoreCommand::SortedSetRemove { member, .. } => ("zrem", vec![member.clone()]),
        StoreCommand::SetWithExpiry {
            value, ttl_seconds, ..
        } => ("set_ex", vec![value.clone(), ttl_seconds.to_string()]),
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
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

        let mut connection = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut connection)
            .await
            .map_err(|error| command_error("failed to set coordination key", &error))?;

        Ok(reply.is_some())
    }

    async fn get_value(&self, key: &str) -> AppResult<Option<String>> {
        let mut connection = self.connection().await?;
        connection
            .get(key)
            .await
            .map_err(|error| command_error("failed to read coordination key", &error))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> AppResult<bool> {
        let mut connection = self.connection().await?;
        let deleted = Script::new(DELETE_IF_EQUALS_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| command_error("failed to release coordination key", &error))?;

        Ok(deleted > 0)
    }

    async fn refresh_expiry(&self, key: &str, ttl_seconds: u32) -> AppResult<bool> {
        let mut connection = self.connection().await?;
        connection
            .expire(key, i64::from(ttl_seconds))
            .await
            .map_err(|error| command_error("failed to refresh coordination key ttl", &error))
    }

    async fn refresh_expiry_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl_seconds: u32,
    ) -> AppResult<bool> {
        let mut connection = self.connection().await?;
        let refreshed = Script::new(REFRESH_IF_EQUALS_SCRIPT)
            .key(key)
            .arg(expected)
            .arg(i64::from(ttl_seconds))
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| command_error("failed to renew coordination key", &error))?;

        Ok(refreshed > 0)
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        let mut connection = self.connection().await?;
        connection
            .exists(key)
            .await
            .map_err(|error| command_error("failed to check coordination key", &error))
    }

    async fn sorted_set_range_by_score_at_most(
        &self,
        set_key: &str,
        max_score: i64,
    ) -> AppResult<Vec<String>> {
        let mut connection = self.connection().await?;
        connection
            .zrangebyscore(set_key, "-inf", max_score)
            .await
            .map_err(|error| command_error("failed to read due index", &error))
    }

    async fn sorted_set_score(&self, set_key: &str, member: &str) -> AppResult<Option<i64>> {
        let mut connection = self.connection().await?;
        let score: Option<f64> = connection
            .zscore(set_key, member)
            .await
            .map_err(|error| command_error("failed to read due index score", &error))?;

        #[allow(clippy::cast_possible_truncation)]
        let score = score.map(|score| score.round() as i64);
        Ok(score)
    }

    async fn sorted_set_remove(&self, set_key: &str, member: &str) -> AppResult<bool> {
        let mut connection = self.connection().await?;
        let removed: i64 = connection
            .zrem(set_key, member)
            .await
            .map_err(|error| command_error("failed to remove due index member", &error))?;

        Ok(removed > 0)
    }

    async fn list_read_all(&self, list_key: &str) -> AppResult<Vec<String>> {
        let mut connection = self.connection().await?;
        connection
            .lrange(list_key, 0, -1)
            .await
            .map_err(|error| command_error("failed to read buffer list", &error))
    }

    async fn scan_keys(&self, prefix: &str) -> AppResult<Vec<String>> {
        let pattern = glob_escape(prefix);
        let mut connection = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern.as_str())
                .arg("COUNT")
                .arg(SCAN_BATCH_SIZE)
                .query_async(&mut connection)
                .await
                .map_err(|error| command_error("failed to scan coordination keys", &error))?;

            keys.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn execute_atomic(&self, batch: AtomicBatch) -> AppResult<AtomicBatchOutcome> {
        if batch.commands().is_empty() {
            return Ok(AtomicBatchOutcome::Applied(Vec::new()));
        }

        let script = Script::new(ATOMIC_BATCH_SCRIPT);
        let mut invocation = script.prepare_invoke();
        match batch.guard() {
            Some(BatchGuard::KeyAbsent(guard_key)) => {
                invocation.key(guard_key.as_str()).arg("1");
            }
            None => {
                invocation.arg("0");
            }
        }

        for command in batch.commands() {
            let (op, args) = command_op(command);
            invocation.key(command.key()).arg(op);
            for arg in args {
                invocation.arg(arg);
            }
        }

        let mut connection = self.connection().await?;
        let (applied, raw_replies): (i64, Vec<Vec<String>>) = invocation
            .invoke_async(&mut connection)
            .await
            .map_err(|error| command_error("failed to apply coordination batch", &error))?;

        if applied == 0 {
            return Ok(AtomicBatchOutcome::Skipped);
        }

        if raw_replies.len() != batch.commands().len() {
            return Err(AppError::Internal(format!(
                "coordination batch returned {} replies for {} commands",
                raw_replies.len(),
                batch.commands().len()
            )));
        }

        let replies = batch
            .commands()
            .iter()
            .zip(raw_replies)
            .map(|(command, values)| match command {
                StoreCommand::ListReadAll { .. } => CommandReply::Values(values),
                _ => CommandReply::Done,
            })
            .collect();

        Ok(AtomicBatchOutcome::Applied(replies))
    }
}
