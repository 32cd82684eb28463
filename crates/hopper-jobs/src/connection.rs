//! Redis connection pools for the queue and worker roles.
//!
//! The core never issues data commands itself; pools are handed to engine
//! adapters and probed here for health.

use crate::backoff::Backoff;
use crate::error::{JobError, JobResult};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use hopper_config::ConnectionSettings;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Who is asking for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Producers: dispatch, schedule, dashboard reads. Fail fast.
    Queue,
    /// Consumers: long-lived fetch loops. Retry on disconnect.
    Worker,
}

impl ConnectionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::Queue => "queue",
            ConnectionRole::Worker => "worker",
        }
    }
}

/// Pools per role, or one shared pool.
#[derive(Clone)]
pub struct ConnectionManager {
    queue: Pool,
    worker: Option<Pool>,
    worker_retry_attempts: u32,
    worker_backoff: Backoff,
    key_prefix: String,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("shared", &self.is_shared())
            .field("worker_retry_attempts", &self.worker_retry_attempts)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Builds the pools. Connections are opened lazily.
    pub fn new(settings: &ConnectionSettings) -> JobResult<Self> {
        let wait = Duration::from_secs(settings.connect_timeout_secs);

        let queue = build_pool(settings, wait)?;
        let worker = if settings.shared {
            None
        } else {
            Some(build_pool(settings, wait)?)
        };

        info!(
            shared = settings.shared,
            pool_size = settings.pool_size,
            "Connection pools created"
        );

        let base = Duration::from_millis(settings.worker_retry_delay_ms);
        Ok(Self {
            queue,
            worker,
            worker_retry_attempts: settings.worker_retry_attempts.max(1),
            worker_backoff: Backoff::exponential(base).with_max_delay(base * 20),
            key_prefix: settings.key_prefix.clone(),
        })
    }

    /// True when both roles draw from one pool.
    pub fn is_shared(&self) -> bool {
        self.worker.is_none()
    }

    /// Pool serving `role`.
    pub fn pool(&self, role: ConnectionRole) -> &Pool {
        match role {
            ConnectionRole::Queue => &self.queue,
            ConnectionRole::Worker => self.worker.as_ref().unwrap_or(&self.queue),
        }
    }

    /// Namespaced key for engine adapters.
    pub fn key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, queue, suffix)
    }

    /// Checks out a connection.
    ///
    /// Queue-role requests make a single attempt. Worker-role requests
    /// retry with backoff up to the configured number of attempts.
    pub async fn connection(&self, role: ConnectionRole) -> JobResult<Connection> {
        let pool = self.pool(role);
        if role == ConnectionRole::Queue {
            return Ok(pool.get().await?);
        }

        let mut attempt = 0;
        loop {
            match pool.get().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.worker_retry_attempts {
                        return Err(e.into());
                    }
                    let delay = self.worker_backoff.delay_for_attempt(attempt);
                    warn!(
                        role = role.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Sends PING over a `role` connection.
    pub async fn health_check(&self, role: ConnectionRole) -> JobResult<()> {
        let mut conn = self.connection(role).await?;
        let reply: String = redis::cmd("PING").query_async(&mut *conn).await?;
        if reply != "PONG" {
            return Err(JobError::Engine(format!("unexpected PING reply: {}", reply)));
        }
        debug!(role = role.as_str(), "Connection healthy");
        Ok(())
    }
}

fn build_pool(settings: &ConnectionSettings, wait: Duration) -> JobResult<Pool> {
    Config::from_url(&settings.url)
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(settings.pool_size)
        .wait_timeout(Some(wait))
        .create_timeout(Some(wait))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))
}
