//! Connection pooling for named sources and targets.
//!
//! Pools are created lazily on first acquire, one per connection name, and
//! shared by every run that references that name. A semaphore bounds how many
//! connections are lent at once; live connections (idle plus lent) never
//! exceed the configured maximum.

use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::adapters::{Adapter, AdapterError, Connection, Registry};
use crate::domain::PipelineError;

/// Configuration of one named source or target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Registered adapter name (e.g. `jsonl`, `memory`)
    pub adapter: String,

    /// Adapter-specific options
    #[serde(default)]
    pub options: serde_json::Value,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub connect: ConnectSettings,

    /// Attempts per batch write before a load fails
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,

    /// Longest wait for one batch to arrive or be written
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_ms: u64,
}

fn default_write_attempts() -> u32 {
    3
}
fn default_batch_timeout() -> u64 {
    300_000
}

impl ConnectionConfig {
    pub fn new(adapter: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            options: serde_json::Value::Null,
            pool: PoolSettings::default(),
            connect: ConnectSettings::default(),
            write_attempts: default_write_attempts(),
            batch_timeout_ms: default_batch_timeout(),
        }
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_connect(mut self, connect: ConnectSettings) -> Self {
        self.connect = connect;
        self
    }

    /// Describe what is wrong with the sizing, if anything
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.pool.max == 0 {
            problems.push("pool.max must be at least 1".to_string());
        }
        if self.pool.min > self.pool.max {
            problems.push(format!(
                "pool.min ({}) exceeds pool.max ({})",
                self.pool.min, self.pool.max
            ));
        }
        if self.pool.increment == 0 {
            problems.push("pool.increment must be at least 1".to_string());
        }
        if self.connect.attempts == 0 {
            problems.push("connect.attempts must be at least 1".to_string());
        }
        if self.write_attempts == 0 {
            problems.push("write_attempts must be at least 1".to_string());
        }
        if self.batch_timeout_ms == 0 {
            problems.push("batch_timeout_ms must be positive".to_string());
        }
        problems
    }
}

/// Pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Connections opened when the pool is first used
    #[serde(default = "default_pool_min")]
    pub min: usize,

    #[serde(default = "default_pool_max")]
    pub max: usize,

    /// Connections opened each time the pool grows
    #[serde(default = "default_pool_increment")]
    pub increment: usize,

    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

fn default_pool_min() -> usize {
    1
}
fn default_pool_max() -> usize {
    4
}
fn default_pool_increment() -> usize {
    1
}
fn default_acquire_timeout() -> u64 {
    30_000
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min: default_pool_min(),
            max: default_pool_max(),
            increment: default_pool_increment(),
            acquire_timeout_ms: default_acquire_timeout(),
        }
    }
}

/// Connect retry behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectSettings {
    #[serde(default = "default_connect_attempts")]
    pub attempts: u32,

    /// Delay after the first failed attempt; doubles each time
    #[serde(default = "default_connect_backoff")]
    pub backoff_ms: u64,
}

fn default_connect_attempts() -> u32 {
    3
}
fn default_connect_backoff() -> u64 {
    500
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            attempts: default_connect_attempts(),
            backoff_ms: default_connect_backoff(),
        }
    }
}

impl ConnectSettings {
    /// Delay after the given failed attempt (1-indexed)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Errors from acquiring pooled connections
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no connection named '{0}' is configured")]
    UnknownConnection(String),

    #[error("connection '{source_id}' uses unregistered adapter '{adapter}'")]
    UnknownAdapter { source_id: String, adapter: String },

    #[error("connection pool for '{source_id}' exhausted after waiting {waited:?}")]
    Exhausted { source_id: String, waited: Duration },

    #[error("connecting to '{source_id}' failed after {attempts} attempt(s): {source}")]
    Connect {
        source_id: String,
        attempts: u32,
        #[source]
        source: AdapterError,
    },
}

impl From<PoolError> for PipelineError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { source_id, waited } => PipelineError::PoolExhausted {
                source_id,
                waited_ms: waited.as_millis() as u64,
            },
            PoolError::Connect {
                source_id,
                attempts,
                source,
            } => PipelineError::Connection {
                source_id,
                attempts,
                message: source.to_string(),
            },
            other => PipelineError::Configuration(other.to_string()),
        }
    }
}

/// Live-connection bookkeeping shared by a pool and its slots
struct PoolCounters {
    live: AtomicUsize,
    returned: Notify,
}

/// Counts a connection as live until dropped
struct LiveSlot {
    counters: Arc<PoolCounters>,
}

impl Drop for LiveSlot {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
        self.counters.returned.notify_waiters();
    }
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    slot: LiveSlot,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleConnection>,
    warmed: bool,
}

enum Checkout {
    Idle(IdleConnection),
    Grow(Vec<LiveSlot>),
    Full,
}

/// Snapshot of a pool's occupancy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub source_id: String,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max: usize,
}

/// Pool of connections for one source identity
pub struct ConnectionPool {
    source_id: String,
    config: ConnectionConfig,
    adapter: Arc<dyn Adapter>,
    permits: Arc<Semaphore>,
    counters: Arc<PoolCounters>,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    fn new(source_id: String, config: ConnectionConfig, adapter: Arc<dyn Adapter>) -> Self {
        let max = config.pool.max.max(1);
        Self {
            source_id,
            config,
            adapter,
            permits: Arc::new(Semaphore::new(max)),
            counters: Arc::new(PoolCounters {
                live: AtomicUsize::new(0),
                returned: Notify::new(),
            }),
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn max(&self) -> usize {
        self.config.pool.max.max(1)
    }

    fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self.lock_state().idle.len();
        PoolStatus {
            source_id: self.source_id.clone(),
            live: self.live(),
            idle,
            in_use: self.max() - self.permits.available_permits(),
            max: self.max(),
        }
    }

    /// Borrow a connection, waiting up to the acquire timeout
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, PoolError> {
        let timeout = Duration::from_millis(self.config.pool.acquire_timeout_ms);
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;

        let permit = match tokio::time::timeout_at(deadline, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(self.exhausted(started)),
        };

        let mut slots = loop {
            // Register for wakeups before looking, so a return between the
            // check and the wait is not missed.
            let notified = self.counters.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.checkout() {
                Checkout::Idle(IdleConnection { conn, slot }) => {
                    return Ok(PooledConnection {
                        conn,
                        slot,
                        permit,
                        pool: Arc::clone(self),
                    });
                }
                Checkout::Grow(slots) => break slots,
                Checkout::Full => {
                    // Every live connection is spoken for by a loan or a
                    // spare still being opened; wait for one to come back.
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(self.exhausted(started));
                    }
                }
            }
        };

        let Some(slot) = slots.pop() else {
            return Err(self.exhausted(started));
        };
        let conn = self.open_with_retry().await?;

        for extra in slots {
            match self.adapter.open(&self.config).await {
                Ok(conn) => self.park(IdleConnection { conn, slot: extra }),
                Err(e) => debug!(source = %self.source_id, error = %e, "Failed to open spare connection"),
            }
        }

        debug!(source = %self.source_id, live = self.live(), "Opened pooled connection");

        Ok(PooledConnection {
            conn,
            slot,
            permit,
            pool: Arc::clone(self),
        })
    }

    fn exhausted(&self, started: Instant) -> PoolError {
        warn!(
            source = %self.source_id,
            waited_ms = started.elapsed().as_millis() as u64,
            "Connection pool exhausted"
        );
        PoolError::Exhausted {
            source_id: self.source_id.clone(),
            waited: started.elapsed(),
        }
    }

    /// Pop an idle connection, or reserve live slots for growing the pool
    fn checkout(&self) -> Checkout {
        let mut state = self.lock_state();

        if let Some(idle) = state.idle.pop() {
            return Checkout::Idle(idle);
        }

        let room = self.max().saturating_sub(self.live());
        if room == 0 {
            return Checkout::Full;
        }

        let wanted = if state.warmed {
            self.config.pool.increment.max(1)
        } else {
            self.config.pool.increment.max(self.config.pool.min).max(1)
        };
        state.warmed = true;

        let grow = wanted.min(room);
        Checkout::Grow((0..grow).map(|_| self.reserve_slot()).collect())
    }

    /// Count one more connection as live; callers check room first
    fn reserve_slot(&self) -> LiveSlot {
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        LiveSlot {
            counters: Arc::clone(&self.counters),
        }
    }

    fn park(&self, idle: IdleConnection) {
        self.lock_state().idle.push(idle);
        self.counters.returned.notify_waiters();
    }

    async fn open_with_retry(&self) -> Result<Box<dyn Connection>, PoolError> {
        let attempts = self.config.connect.attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.adapter.open(&self.config).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.config.connect.backoff(attempt);
                    warn!(
                        source = %self.source_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(PoolError::Connect {
                        source_id: self.source_id.clone(),
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        }
    }

    /// Return a connection, health-checking it first
    async fn release(&self, pooled: PooledConnection) {
        let PooledConnection {
            mut conn,
            slot,
            permit,
            pool: _,
        } = pooled;

        if conn.is_healthy().await {
            self.park(IdleConnection { conn, slot });
            drop(permit);
            return;
        }

        warn!(source = %self.source_id, "Discarding unhealthy connection");
        drop(conn);

        // Reuse the discarded connection's slot for its replacement.
        match self.adapter.open(&self.config).await {
            Ok(conn) => self.park(IdleConnection { conn, slot }),
            Err(e) => {
                drop(slot);
                warn!(source = %self.source_id, error = %e, "Failed to replace connection");
            }
        }
        drop(permit);
    }

    /// Close idle connections
    fn drain(&self) -> usize {
        let idle = std::mem::take(&mut self.lock_state().idle);
        idle.len()
    }
}

/// A connection on loan from a pool.
///
/// Give it back with [`ConnectionManager::release`]; dropping it instead
/// closes the connection and frees its slot without a health check.
pub struct PooledConnection {
    conn: Box<dyn Connection>,
    slot: LiveSlot,
    permit: OwnedSemaphorePermit,
    pool: Arc<ConnectionPool>,
}

impl PooledConnection {
    pub fn source_id(&self) -> &str {
        self.pool.source_id()
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.pool.config()
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

/// Lends connections to named sources and targets
pub struct ConnectionManager {
    registry: Arc<Registry>,
    configs: RwLock<BTreeMap<String, ConnectionConfig>>,
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<Registry>, configs: BTreeMap<String, ConnectionConfig>) -> Self {
        Self {
            registry,
            configs: RwLock::new(configs),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Borrow a connection for `source_id`, creating its pool on first use
    pub async fn acquire(&self, source_id: &str) -> Result<PooledConnection, PoolError> {
        let pool = self.pool(source_id)?;
        pool.acquire().await
    }

    /// Return a borrowed connection to its pool
    pub async fn release(&self, conn: PooledConnection) {
        let pool = Arc::clone(&conn.pool);
        pool.release(conn).await;
    }

    /// Configuration of a named connection
    pub fn config(&self, source_id: &str) -> Option<ConnectionConfig> {
        self.configs
            .read()
            .ok()
            .and_then(|configs| configs.get(source_id).cloned())
    }

    /// Pool for `source_id`, created lazily
    pub fn pool(&self, source_id: &str) -> Result<Arc<ConnectionPool>, PoolError> {
        let mut pools = match self.pools.lock() {
            Ok(pools) => pools,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(pool) = pools.get(source_id) {
            return Ok(Arc::clone(pool));
        }

        let config = self
            .config(source_id)
            .ok_or_else(|| PoolError::UnknownConnection(source_id.to_string()))?;
        let adapter = self
            .registry
            .adapter(&config.adapter)
            .ok_or_else(|| PoolError::UnknownAdapter {
                source_id: source_id.to_string(),
                adapter: config.adapter.clone(),
            })?;

        info!(
            source = %source_id,
            adapter = %config.adapter,
            min = config.pool.min,
            max = config.pool.max,
            "Creating connection pool"
        );

        let pool = Arc::new(ConnectionPool::new(source_id.to_string(), config, adapter));
        pools.insert(source_id.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    /// Install new connection configurations.
    ///
    /// Pools whose configuration changed or disappeared are detached; loans
    /// from them finish against the old pool.
    pub fn reconfigure(&self, configs: BTreeMap<String, ConnectionConfig>) {
        let mut pools = match self.pools.lock() {
            Ok(pools) => pools,
            Err(poisoned) => poisoned.into_inner(),
        };
        pools.retain(|name, pool| configs.get(name) == Some(pool.config()));

        match self.configs.write() {
            Ok(mut current) => *current = configs,
            Err(poisoned) => *poisoned.into_inner() = configs,
        }
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        let pools = match self.pools.lock() {
            Ok(pools) => pools,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut status: Vec<PoolStatus> = pools.values().map(|p| p.status()).collect();
        status.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        status
    }

    /// Close all idle connections
    pub fn close_all(&self) {
        let pools = match self.pools.lock() {
            Ok(pools) => pools,
            Err(poisoned) => poisoned.into_inner(),
        };
        for pool in pools.values() {
            let closed = pool.drain();
            if closed > 0 {
                debug!(source = %pool.source_id, closed, "Closed idle connections");
            }
        }
    }
}
