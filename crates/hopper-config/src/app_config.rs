//! Configuration structures.

use hopper_core::TelemetryConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HopperConfig {
    /// Application metadata and secrets.
    #[serde(default)]
    pub app: AppSettings,

    /// Queue names and per-queue options.
    #[serde(default)]
    pub queue: QueueSettings,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Queue engine connection configuration.
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Application name.
    #[serde(default = "default_app_name")]
    pub name: String,

    /// Environment (development, staging, production).
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Application root. Discovery errors report paths relative to it.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Application secret used to encrypt payloads and sign closures.
    #[serde(default)]
    pub key: String,
}

fn default_app_name() -> String {
    "hopper".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_environment(),
            root: default_root(),
            key: String::new(),
        }
    }
}

/// Queue catalogue. The only place queue names are declared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Queue used when neither the call site nor the job type names one.
    #[serde(default = "default_queue_name")]
    pub default_queue: String,

    /// Known queues and their options.
    #[serde(default = "default_queues")]
    pub queues: BTreeMap<String, QueueOptions>,
}

fn default_queue_name() -> String {
    "default".to_string()
}

fn default_queues() -> BTreeMap<String, QueueOptions> {
    let mut queues = BTreeMap::new();
    queues.insert(default_queue_name(), QueueOptions::default());
    queues
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_queue: default_queue_name(),
            queues: default_queues(),
        }
    }
}

impl QueueSettings {
    /// Returns the configured queue names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    /// Returns true if the queue is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Returns options for a queue, if declared.
    pub fn options(&self, name: &str) -> Option<&QueueOptions> {
        self.queues.get(name)
    }
}

/// Per-queue options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueOptions {
    /// Local concurrency override for this queue.
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Cap shared by every worker process consuming this queue.
    #[serde(default)]
    pub global_concurrency: Option<usize>,

    /// Job options applied to every job on this queue, below job-type defaults.
    #[serde(default)]
    pub default_job_options: Map<String, Value>,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Concurrent executions per queue unless the queue overrides it.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum wait for in-flight jobs on graceful stop, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// How long one fetch blocks waiting for a job, in milliseconds.
    #[serde(default = "default_block_timeout")]
    pub block_timeout_ms: u64,
}

fn default_concurrency() -> usize {
    1
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_block_timeout() -> u64 {
    5000
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            block_timeout_ms: default_block_timeout(),
        }
    }
}

impl WorkerSettings {
    /// Returns shutdown timeout as Duration.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Returns block timeout as Duration.
    #[must_use]
    pub const fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

/// Queue engine connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size per role.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection wait timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Share one pool between the queue and worker roles.
    #[serde(default = "default_shared")]
    pub shared: bool,

    /// Attempts a worker-role connection makes before giving up.
    #[serde(default = "default_worker_retry_attempts")]
    pub worker_retry_attempts: u32,

    /// Base delay between worker-role connection attempts, in milliseconds.
    #[serde(default = "default_worker_retry_delay")]
    pub worker_retry_delay_ms: u64,

    /// Key prefix used by engine adapters.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_shared() -> bool {
    true
}

fn default_worker_retry_attempts() -> u32 {
    10
}

fn default_worker_retry_delay() -> u64 {
    500
}

fn default_key_prefix() -> String {
    "hopper".to_string()
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            shared: default_shared(),
            worker_retry_attempts: default_worker_retry_attempts(),
            worker_retry_delay_ms: default_worker_retry_delay(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl ConnectionSettings {
    /// Returns the connect timeout as a Duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Returns the worker retry delay as a Duration.
    #[must_use]
    pub const fn worker_retry_delay(&self) -> Duration {
        Duration::from_millis(self.worker_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_queue_is_declared() {
        let settings = QueueSettings::default();
        assert_eq!(settings.default_queue, "default");
        assert!(settings.contains("default"));
        assert_eq!(settings.names(), vec!["default".to_string()]);
    }

    #[test]
    fn test_queue_options_from_json() {
        let json = r#"{
            "default_queue": "emails",
            "queues": {
                "emails": { "concurrency": 4, "global_concurrency": 10 },
                "reports": { "default_job_options": { "attempts": 5 } }
            }
        }"#;
        let settings: QueueSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.names(), vec!["emails".to_string(), "reports".to_string()]);
        assert_eq!(settings.options("emails").unwrap().global_concurrency, Some(10));
        assert_eq!(
            settings.options("reports").unwrap().default_job_options["attempts"],
            serde_json::json!(5)
        );
    }

    #[test]
    fn test_worker_durations() {
        let worker = WorkerSettings::default();
        assert_eq!(worker.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(worker.block_timeout(), Duration::from_millis(5000));
    }
}
