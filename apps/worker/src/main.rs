//! Chatflow buffer worker runtime.

#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatflow_application::{
    BatchHandler, CoordinationConfig, CoordinationStore, DebounceBuffer, DebouncePoller,
    LeaderAcquisition, LeaderGuard, LeaderLock, LeaderLoss, ResourceMutex, SystemClock,
};
use chatflow_core::{AppError, AppResult};
use chatflow_domain::{
    BufferEntry, ConversationKey, CoordinationKeys, InboundMessage, leader_lock_key,
    merge_message_texts,
};
use chatflow_infrastructure::{InMemoryCoordinationStore, RedisCoordinationStore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreBackend {
    Redis,
    InMemory,
}

impl StoreBackend {
    fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "in_memory" | "memory" => Ok(Self::InMemory),
            other => Err(AppError::Validation(format!(
                "invalid STORE_BACKEND value '{other}', expected 'redis' or 'in_memory'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct WorkerConfig {
    store_backend: StoreBackend,
    redis_url: Option<String>,
    worker_type: String,
    worker_id: String,
    key_prefix: String,
    leader_exit_grace_ms: u64,
    coordination: CoordinationConfig,
}

/// Hands every flushed conversation downstream as one merged message.
struct MergedMessageHandler;

#[async_trait]
impl BatchHandler<InboundMessage> for MergedMessageHandler {
    async fn handle_batch(
        &self,
        conversation: &ConversationKey,
        batch: Vec<BufferEntry<InboundMessage>>,
    ) -> AppResult<()> {
        let Some(last) = batch.last() else {
            return Ok(());
        };
        let provider = last.payload.provider;
        let inbox_id = last.payload.inbox_id.clone();
        let first_enqueued_at = batch.first().map(|entry| entry.enqueued_at);
        let merged = merge_message_texts(batch.iter().map(|entry| &entry.payload));

        info!(
            conversation = %conversation,
            provider = provider.as_str(),
            inbox_id = inbox_id.as_deref().unwrap_or("-"),
            messages = batch.len(),
            first_enqueued_at = ?first_enqueued_at,
            merged_chars = merged.chars().count(),
            "conversation batch ready"
        );

        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let store = build_store(&config).await?;
    let keys = CoordinationKeys::new(config.key_prefix.as_str())?;

    let leader = LeaderLock::new(
        store.clone(),
        leader_lock_key(config.worker_type.as_str()),
        &config.coordination,
    )?;
    let guard = match leader.acquire().await? {
        LeaderAcquisition::Acquired(guard) => guard,
        LeaderAcquisition::Held { current_holder } => {
            error!(
                worker_type = %config.worker_type,
                current_holder = current_holder.as_deref().unwrap_or("unknown"),
                "another worker instance is already running; exiting"
            );
            tokio::time::sleep(Duration::from_millis(config.leader_exit_grace_ms)).await;
            std::process::exit(1);
        }
    };

    info!(
        worker_type = %config.worker_type,
        worker_id = %config.worker_id,
        token = %guard.token(),
        store_backend = ?config.store_backend,
        window_seconds = config.coordination.debounce_window_seconds,
        max_batch_size = ?config.coordination.effective_max_batch_size(),
        pause_ttl_seconds = config.coordination.pause_ttl_seconds,
        "chatflow-worker started"
    );

    let buffer = DebounceBuffer::new(
        store.clone(),
        Arc::new(SystemClock),
        keys,
        &config.coordination,
    );
    let mutex = ResourceMutex::new(store, config.worker_id.as_str());
    let poller = DebouncePoller::new(buffer, mutex, &config.coordination);
    let poll_cancellation = guard.cancellation_token().child_token();
    let poller_task = spawn_poller(poller, poll_cancellation.clone());

    let exit_code = tokio::select! {
        () = shutdown_signal() => 0,
        loss = guard.lost() => {
            report_leader_loss(&loss);
            1
        }
    };

    poll_cancellation.cancel();
    if exit_code == 0 {
        join_poller(poller_task).await;
        release_leadership(guard).await;
        info!("chatflow-worker stopped");
        return Ok(());
    }

    // Another instance may already own the buffers; bound how long a flush can overlap it.
    let grace = Duration::from_millis(config.leader_exit_grace_ms);
    if tokio::time::timeout(grace, join_poller(poller_task))
        .await
        .is_err()
    {
        warn!(
            grace_ms = config.leader_exit_grace_ms,
            "debounce poller still flushing after leader loss; exiting anyway"
        );
    }

    drop(guard);
    std::process::exit(exit_code);
}

async fn join_poller(poller_task: JoinHandle<()>) {
    if let Err(error) = poller_task.await {
        warn!(error = %error, "debounce poller task ended abnormally");
    }
}

async fn build_store(config: &WorkerConfig) -> AppResult<Arc<dyn CoordinationStore>> {
    match config.store_backend {
        StoreBackend::InMemory => {
            warn!("using in-memory coordination store; state is not shared between processes");
            Ok(Arc::new(InMemoryCoordinationStore::new()))
        }
        StoreBackend::Redis => {
            let redis_url = config.redis_url.as_deref().ok_or_else(|| {
                AppError::Validation("REDIS_URL is required for the redis store".to_owned())
            })?;
            let client = redis::Client::open(redis_url).map_err(|error| {
                AppError::Validation(format!("invalid REDIS_URL value: {error}"))
            })?;
            let store = RedisCoordinationStore::new(client);
            store.ping().await?;

            Ok(Arc::new(store))
        }
    }
}

fn spawn_poller(
    poller: DebouncePoller,
    cancellation: tokio_util::sync::CancellationToken,
) -> JoinHandle<()> {
    let handler: Arc<dyn BatchHandler<InboundMessage>> = Arc::new(MergedMessageHandler);
    tokio::spawn(async move { poller.run(cancellation, handler).await })
}

fn report_leader_loss(loss: &LeaderLoss) {
    match loss {
        LeaderLoss::Supplanted { current_holder } => error!(
            current_holder = current_holder.as_deref().unwrap_or("none"),
            "leader lock taken over; stopping to avoid duplicate processing"
        ),
        LeaderLoss::StoreUnreachable(reason) => error!(
            reason = %reason,
            "leader heartbeat could not reach the store; stopping"
        ),
        LeaderLoss::Released => warn!("leader lock released unexpectedly"),
    }
}

async fn release_leadership(guard: LeaderGuard) {
    match guard.release().await {
        Ok(true) => info!("leader lock released"),
        Ok(false) => warn!("leader lock was no longer owned at shutdown"),
        Err(error) => warn!(error = %error, "failed to release leader lock"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("ctrl-c received; shutting down"),
        () = terminate => info!("SIGTERM received; shutting down"),
    }
}

impl WorkerConfig {
    fn load() -> AppResult<Self> {
        let store_backend = StoreBackend::parse(
            env::var("STORE_BACKEND")
                .unwrap_or_else(|_| "redis".to_owned())
                .as_str(),
        )?;
        let redis_url = match store_backend {
            StoreBackend::Redis => Some(required_env("REDIS_URL")?),
            StoreBackend::InMemory => env::var("REDIS_URL").ok(),
        };
        let worker_type = optional_env("WORKER_TYPE").unwrap_or_else(|| "all".to_owned());
        let worker_id = optional_env("WORKER_ID")
            .unwrap_or_else(|| format!("worker-{}", std::process::id()));
        let key_prefix = optional_env("BUFFER_KEY_PREFIX").unwrap_or_else(|| "buf".to_owned());
        let leader_exit_grace_ms = parse_env_u64("LEADER_EXIT_GRACE_MS", 3000)?;

        let defaults = CoordinationConfig::default();
        let max_batch_size = match optional_env("BUFFER_MAX_BATCH_SIZE") {
            Some(value) => Some(value.parse::<usize>().map_err(|error| {
                AppError::Validation(format!(
                    "invalid BUFFER_MAX_BATCH_SIZE value '{value}': {error}"
                ))
            })?),
            None => None,
        };
        let coordination = CoordinationConfig {
            leader_ttl_seconds: parse_env_u32(
                "LEADER_LOCK_TTL_SECONDS",
                defaults.leader_ttl_seconds,
            )?,
            heartbeat_interval_seconds: parse_env_u32(
                "LEADER_HEARTBEAT_INTERVAL_SECONDS",
                defaults.heartbeat_interval_seconds,
            )?,
            lock_ttl_seconds: parse_env_u32("BUFFER_LOCK_TTL_SECONDS", defaults.lock_ttl_seconds)?,
            debounce_window_seconds: parse_env_u32(
                "BUFFER_WINDOW_SECONDS",
                defaults.debounce_window_seconds,
            )?,
            max_batch_size,
            pause_ttl_seconds: parse_env_u32(
                "BUFFER_PAUSE_TTL_SECONDS",
                defaults.pause_ttl_seconds,
            )?,
            poll_interval_ms: parse_env_u64("BUFFER_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            entry_list_ttl_seconds: parse_env_u32(
                "BUFFER_ENTRY_TTL_SECONDS",
                defaults.entry_list_ttl_seconds,
            )?,
            reconcile_every_ticks: parse_env_u32(
                "BUFFER_RECONCILE_EVERY_TICKS",
                defaults.reconcile_every_ticks,
            )?,
        };
        coordination.validate()?;

        Ok(Self {
            store_backend,
            redis_url,
            worker_type,
            worker_id,
            key_prefix,
            leader_exit_grace_ms,
            coordination,
        })
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn required_env(name: &str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Validation(format!("{name} is required")))
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_env_u32(name: &str, default: u32) -> AppResult<u32> {
    match env::var(name) {
        Ok(value) => value.parse::<u32>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}
